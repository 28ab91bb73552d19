// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Record store and time-series store interfaces.
//!
//! The record store is the single source of truth for instance status. The
//! usage store only appends samples; rollups, retention and compression are
//! storage policies configured in the migrations.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::instance::{Instance, InstanceFilter};
use crate::usage::{ResourceUsageSample, UsageSummary};

pub use memory::{MemoryInstanceStore, MemoryUsageStore};
pub use postgres::{PostgresInstanceStore, PostgresUsageStore};

/// Errors from store operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// No row for this instance.
    #[error("Instance not found: {0}")]
    NotFound(Uuid),

    /// A unique constraint rejected the write.
    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    /// A stored row could not be decoded.
    #[error("Corrupt row: {0}")]
    Corrupt(String),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The store is unreachable.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Instance record store.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Insert a new instance. Fails with `UniqueViolation` on a live duplicate subdomain.
    async fn insert(&self, instance: &Instance) -> Result<()>;

    /// Load an instance, deleted ones included.
    async fn get(&self, id: Uuid) -> Result<Option<Instance>>;

    /// Persist every mutable field of `instance` and bump `updated_at`.
    async fn update(&self, instance: &Instance) -> Result<()>;

    /// Instances matching `filter`, newest first.
    async fn list(&self, filter: &InstanceFilter) -> Result<Vec<Instance>>;

    /// Whether a live instance already uses `subdomain`.
    async fn subdomain_taken(&self, subdomain: &str) -> Result<bool>;
}

/// Time-series store for resource samples.
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Append one sample.
    async fn append(&self, sample: &ResourceUsageSample) -> Result<()>;

    /// Most recent sample for an instance.
    async fn latest(&self, instance_id: Uuid) -> Result<Option<ResourceUsageSample>>;

    /// Samples since `since`, newest first, at most `limit`.
    async fn history(
        &self,
        instance_id: Uuid,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ResourceUsageSample>>;

    /// Aggregate of samples since `since`.
    async fn summary(&self, instance_id: Uuid, since: DateTime<Utc>) -> Result<UsageSummary>;
}
