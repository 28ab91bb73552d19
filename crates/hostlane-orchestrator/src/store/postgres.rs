// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL/TimescaleDB store backend.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{InstanceStore, Result, StoreError, UsageStore};
use crate::instance::{Instance, InstanceFilter, InstanceStatus, Operation, ResourceLimits};
use crate::usage::{ResourceUsageSample, UsageSummary};

const INSTANCE_COLUMNS: &str = r#"
    id, owner_id, name, description, status::text AS status, container_id, address,
    port, subdomain, cpu_shares, memory_mb, storage_gb, failed_operation, last_error,
    dns_degraded_since, created_at, updated_at, deleted_at
"#;

/// Instance row as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct InstanceRow {
    /// Instance id.
    pub id: Uuid,
    /// Owner id.
    pub owner_id: Uuid,
    /// Human name.
    pub name: String,
    /// Description.
    pub description: String,
    /// Status (`instance_status` enum rendered as text).
    pub status: String,
    /// Runtime handle.
    pub container_id: Option<String>,
    /// Dotted IPv4 address.
    pub address: Option<String>,
    /// Internal port.
    pub port: i32,
    /// Subdomain label.
    pub subdomain: String,
    /// CPU allowance in cores.
    pub cpu_shares: f64,
    /// Memory ceiling in MB.
    pub memory_mb: i64,
    /// Storage ceiling in GB.
    pub storage_gb: i64,
    /// Operation that failed.
    pub failed_operation: Option<String>,
    /// Last failure message.
    pub last_error: Option<String>,
    /// Unverified-DNS marker.
    pub dns_degraded_since: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update.
    pub updated_at: DateTime<Utc>,
    /// Soft-delete time.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl TryFrom<InstanceRow> for Instance {
    type Error = StoreError;

    fn try_from(row: InstanceRow) -> Result<Self> {
        let corrupt = |what: &str, value: &str| {
            StoreError::Corrupt(format!("instance {}: invalid {} '{}'", row.id, what, value))
        };

        let status: InstanceStatus = row
            .status
            .parse()
            .map_err(|_| corrupt("status", &row.status))?;
        let address = row
            .address
            .as_deref()
            .map(|a| a.parse::<Ipv4Addr>().map_err(|_| corrupt("address", a)))
            .transpose()?;
        let failed_operation = row
            .failed_operation
            .as_deref()
            .map(|op| {
                op.parse::<Operation>()
                    .map_err(|_| corrupt("failed_operation", op))
            })
            .transpose()?;
        let port = u16::try_from(row.port).map_err(|_| corrupt("port", &row.port.to_string()))?;

        Ok(Instance {
            id: row.id,
            owner_id: row.owner_id,
            name: row.name,
            description: row.description,
            status,
            container_id: row.container_id,
            address,
            port,
            subdomain: row.subdomain,
            limits: ResourceLimits {
                cpu_shares: row.cpu_shares,
                memory_mb: row.memory_mb,
                storage_gb: row.storage_gb,
            },
            failed_operation,
            last_error: row.last_error,
            dns_degraded_since: row.dns_degraded_since,
            created_at: row.created_at,
            updated_at: row.updated_at,
            deleted_at: row.deleted_at,
        })
    }
}

fn map_write_error(e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &e
        && db.is_unique_violation()
    {
        return StoreError::UniqueViolation(
            db.constraint()
                .map(str::to_string)
                .unwrap_or_else(|| db.message().to_string()),
        );
    }
    StoreError::Database(e)
}

/// Insert an instance row.
pub async fn insert_instance(pool: &PgPool, instance: &Instance) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO instances (
            id, owner_id, name, description, status, container_id, address, port,
            subdomain, cpu_shares, memory_mb, storage_gb, failed_operation, last_error,
            dns_degraded_since, created_at, updated_at, deleted_at
        )
        VALUES ($1, $2, $3, $4, $5::instance_status, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                $15, $16, $17, $18)
        "#,
    )
    .bind(instance.id)
    .bind(instance.owner_id)
    .bind(&instance.name)
    .bind(&instance.description)
    .bind(instance.status.as_str())
    .bind(&instance.container_id)
    .bind(instance.address.map(|a| a.to_string()))
    .bind(i32::from(instance.port))
    .bind(&instance.subdomain)
    .bind(instance.limits.cpu_shares)
    .bind(instance.limits.memory_mb)
    .bind(instance.limits.storage_gb)
    .bind(instance.failed_operation.map(|op| op.as_str()))
    .bind(&instance.last_error)
    .bind(instance.dns_degraded_since)
    .bind(instance.created_at)
    .bind(instance.updated_at)
    .bind(instance.deleted_at)
    .execute(pool)
    .await
    .map_err(map_write_error)?;

    Ok(())
}

/// Get an instance by id.
pub async fn get_instance(pool: &PgPool, id: Uuid) -> Result<Option<Instance>> {
    let query = format!("SELECT {} FROM instances WHERE id = $1", INSTANCE_COLUMNS);
    let row = sqlx::query_as::<_, InstanceRow>(&query)
        .bind(id)
        .fetch_optional(pool)
        .await?;

    row.map(Instance::try_from).transpose()
}

/// Write back every mutable column.
pub async fn update_instance(pool: &PgPool, instance: &Instance) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE instances
        SET status = $2::instance_status,
            container_id = $3,
            address = $4,
            description = $5,
            failed_operation = $6,
            last_error = $7,
            dns_degraded_since = $8,
            deleted_at = $9,
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(instance.id)
    .bind(instance.status.as_str())
    .bind(&instance.container_id)
    .bind(instance.address.map(|a| a.to_string()))
    .bind(&instance.description)
    .bind(instance.failed_operation.map(|op| op.as_str()))
    .bind(&instance.last_error)
    .bind(instance.dns_degraded_since)
    .bind(instance.deleted_at)
    .execute(pool)
    .await
    .map_err(map_write_error)?;

    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound(instance.id));
    }

    Ok(())
}

/// List instances matching a filter, newest first.
pub async fn list_instances(pool: &PgPool, filter: &InstanceFilter) -> Result<Vec<Instance>> {
    let statuses: Vec<String> = filter
        .statuses
        .iter()
        .map(|s| s.as_str().to_string())
        .collect();
    let limit = if filter.limit > 0 { filter.limit } else { i64::MAX };

    let query = format!(
        r#"
        SELECT {}
        FROM instances
        WHERE ($1::uuid IS NULL OR owner_id = $1)
          AND (cardinality($2::text[]) = 0 OR status::text = ANY($2))
          AND ($3 OR deleted_at IS NULL)
        ORDER BY created_at DESC
        LIMIT $4 OFFSET $5
        "#,
        INSTANCE_COLUMNS
    );

    let rows = sqlx::query_as::<_, InstanceRow>(&query)
        .bind(filter.owner_id)
        .bind(&statuses)
        .bind(filter.include_deleted)
        .bind(limit)
        .bind(filter.offset.max(0))
        .fetch_all(pool)
        .await?;

    rows.into_iter().map(Instance::try_from).collect()
}

/// Whether a live instance uses `subdomain`.
pub async fn subdomain_taken(pool: &PgPool, subdomain: &str) -> Result<bool> {
    let taken: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM instances WHERE subdomain = $1 AND deleted_at IS NULL
        )
        "#,
    )
    .bind(subdomain)
    .fetch_one(pool)
    .await?;

    Ok(taken)
}

/// Append a usage sample.
pub async fn insert_sample(pool: &PgPool, sample: &ResourceUsageSample) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO resource_usage (
            instance_id, sampled_at, cpu_fraction, memory_used_bytes, memory_limit_bytes,
            disk_used_bytes, network_in_bytes, network_out_bytes
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(sample.instance_id)
    .bind(sample.sampled_at)
    .bind(sample.cpu_fraction)
    .bind(sample.memory_used_bytes)
    .bind(sample.memory_limit_bytes)
    .bind(sample.disk_used_bytes)
    .bind(sample.network_in_bytes)
    .bind(sample.network_out_bytes)
    .execute(pool)
    .await?;

    Ok(())
}

const SAMPLE_COLUMNS: &str = r#"
    instance_id, sampled_at, cpu_fraction, memory_used_bytes, memory_limit_bytes,
    disk_used_bytes, network_in_bytes, network_out_bytes
"#;

/// PostgreSQL instance store.
#[derive(Clone)]
pub struct PostgresInstanceStore {
    pool: PgPool,
}

impl PostgresInstanceStore {
    /// Create a store over `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InstanceStore for PostgresInstanceStore {
    async fn insert(&self, instance: &Instance) -> Result<()> {
        insert_instance(&self.pool, instance).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<Instance>> {
        get_instance(&self.pool, id).await
    }

    async fn update(&self, instance: &Instance) -> Result<()> {
        update_instance(&self.pool, instance).await
    }

    async fn list(&self, filter: &InstanceFilter) -> Result<Vec<Instance>> {
        list_instances(&self.pool, filter).await
    }

    async fn subdomain_taken(&self, subdomain: &str) -> Result<bool> {
        subdomain_taken(&self.pool, subdomain).await
    }
}

/// TimescaleDB usage store.
#[derive(Clone)]
pub struct PostgresUsageStore {
    pool: PgPool,
}

impl PostgresUsageStore {
    /// Create a store over `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UsageStore for PostgresUsageStore {
    async fn append(&self, sample: &ResourceUsageSample) -> Result<()> {
        insert_sample(&self.pool, sample).await
    }

    async fn latest(&self, instance_id: Uuid) -> Result<Option<ResourceUsageSample>> {
        let query = format!(
            "SELECT {} FROM resource_usage WHERE instance_id = $1 ORDER BY sampled_at DESC LIMIT 1",
            SAMPLE_COLUMNS
        );
        let sample = sqlx::query_as::<_, ResourceUsageSample>(&query)
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(sample)
    }

    async fn history(
        &self,
        instance_id: Uuid,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ResourceUsageSample>> {
        let query = format!(
            r#"
            SELECT {}
            FROM resource_usage
            WHERE instance_id = $1 AND sampled_at >= $2
            ORDER BY sampled_at DESC
            LIMIT $3
            "#,
            SAMPLE_COLUMNS
        );
        let samples = sqlx::query_as::<_, ResourceUsageSample>(&query)
            .bind(instance_id)
            .bind(since)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(samples)
    }

    async fn summary(&self, instance_id: Uuid, since: DateTime<Utc>) -> Result<UsageSummary> {
        let summary = sqlx::query_as::<_, UsageSummary>(
            r#"
            SELECT COUNT(*)::BIGINT                                   AS sample_count,
                   COALESCE(AVG(cpu_fraction), 0)::FLOAT8             AS avg_cpu_fraction,
                   COALESCE(MAX(cpu_fraction), 0)::FLOAT8             AS max_cpu_fraction,
                   COALESCE(AVG(memory_used_bytes), 0)::FLOAT8        AS avg_memory_used_bytes,
                   COALESCE(MAX(memory_used_bytes), 0)::BIGINT        AS max_memory_used_bytes,
                   COALESCE(AVG(disk_used_bytes), 0)::FLOAT8          AS avg_disk_used_bytes,
                   COALESCE(MAX(disk_used_bytes), 0)::BIGINT          AS max_disk_used_bytes,
                   COALESCE(SUM(network_in_bytes), 0)::BIGINT         AS total_network_in_bytes,
                   COALESCE(SUM(network_out_bytes), 0)::BIGINT        AS total_network_out_bytes
            FROM resource_usage
            WHERE instance_id = $1 AND sampled_at >= $2
            "#,
        )
        .bind(instance_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(summary)
    }
}
