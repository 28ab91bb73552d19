// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance model and lifecycle state machine.
//!
//! ```text
//!                 create
//!   ┌─────────┐ ─────────► ┌─────────┐   stop    ┌─────────┐
//!   │ PENDING │            │ RUNNING │ ────────► │ STOPPED │
//!   └────┬────┘            └────┬────┘ ◄──────── └────┬────┘
//!        │                      │         start       │
//!        │ failure              │ failure / fault     │ failure
//!        ▼                      ▼                     ▼
//!   ┌─────────────────────────────────────────────────────┐
//!   │                        ERROR                        │
//!   │   (left only by retrying the operation that failed) │
//!   └─────────────────────────────────────────────────────┘
//!
//!   delete: any non-deleted status ──► DELETED (terminal, soft delete)
//! ```

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Lifecycle status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Record exists, provisioning has not completed.
    Pending,
    /// Container is running and reachable.
    Running,
    /// Container exists but is stopped; address and DNS are retained.
    Stopped,
    /// An operation failed; retry that operation to recover.
    Error,
    /// Soft-deleted. Terminal.
    Deleted,
}

impl InstanceStatus {
    /// Status as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::Running => "running",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Error => "error",
            InstanceStatus::Deleted => "deleted",
        }
    }

    /// Whether the instance has reached its terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceStatus::Deleted)
    }

    /// Statuses in which an instance may own a container.
    ///
    /// `pending` holds one between the provisioning checkpoint and the first
    /// successful start.
    pub fn may_hold_container(&self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(InstanceStatus::Pending),
            "running" => Ok(InstanceStatus::Running),
            "stopped" => Ok(InstanceStatus::Stopped),
            "error" => Ok(InstanceStatus::Error),
            "deleted" => Ok(InstanceStatus::Deleted),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Lifecycle operations exposed by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Provision address, container and DNS.
    Create,
    /// Start a stopped container.
    Start,
    /// Stop a running container.
    Stop,
    /// Tear everything down.
    Delete,
}

impl Operation {
    /// Operation name as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Start => "start",
            Operation::Stop => "stop",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Operation::Create),
            "start" => Ok(Operation::Start),
            "stop" => Ok(Operation::Stop),
            "delete" => Ok(Operation::Delete),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// A string did not name a known enum variant.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Unknown variant: {0}")]
pub struct UnknownVariant(pub String);

/// Rejected (status, operation) combination.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Cannot {operation} instance in status {status}{}", .failed_operation.map(|op| format!(" (failed operation: {})", op)).unwrap_or_default())]
pub struct InvalidTransition {
    /// Current status.
    pub status: InstanceStatus,
    /// Requested operation.
    pub operation: Operation,
    /// Operation that put the instance into `error`, if any.
    pub failed_operation: Option<Operation>,
}

/// What an accepted operation should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Perform the operation; on success the instance ends in `target`.
    Proceed {
        /// Status after a successful run.
        target: InstanceStatus,
    },
    /// Nothing to do; the instance already satisfies the request.
    NoOp,
}

/// Decide whether `operation` is legal for an instance in `status`.
///
/// `failed_operation` is consulted only in `error`, where the sole way out
/// (besides delete) is retrying the operation that failed.
pub fn plan_transition(
    status: InstanceStatus,
    failed_operation: Option<Operation>,
    operation: Operation,
) -> Result<Transition, InvalidTransition> {
    use InstanceStatus as S;
    use Operation as Op;

    let proceed = |target| Ok(Transition::Proceed { target });
    let reject = || {
        Err(InvalidTransition {
            status,
            operation,
            failed_operation,
        })
    };

    match (status, operation) {
        (S::Pending, Op::Create) => proceed(S::Running),
        (S::Pending, Op::Start | Op::Stop) => reject(),

        (S::Running, Op::Stop) => proceed(S::Stopped),
        (S::Running, Op::Create | Op::Start) => reject(),

        (S::Stopped, Op::Start) => proceed(S::Running),
        (S::Stopped, Op::Create | Op::Stop) => reject(),

        (S::Error, Op::Create) if failed_operation == Some(Op::Create) => proceed(S::Running),
        (S::Error, Op::Start) if failed_operation == Some(Op::Start) => proceed(S::Running),
        (S::Error, Op::Stop) if failed_operation == Some(Op::Stop) => proceed(S::Stopped),
        (S::Error, Op::Create | Op::Start | Op::Stop) => reject(),

        (S::Deleted, Op::Delete) => Ok(Transition::NoOp),
        (S::Deleted, Op::Create | Op::Start | Op::Stop) => reject(),

        (S::Pending | S::Running | S::Stopped | S::Error, Op::Delete) => proceed(S::Deleted),
    }
}

/// Resource limits resolved by the caller (plans/quotas are decided elsewhere).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU allowance in cores (e.g. `0.5`).
    pub cpu_shares: f64,
    /// Memory ceiling in megabytes.
    pub memory_mb: i64,
    /// Storage ceiling in gigabytes.
    pub storage_gb: i64,
}

/// Largest memory ceiling whose byte count fits in an `i64`.
pub const MAX_MEMORY_MB: i64 = i64::MAX / (1024 * 1024);

impl ResourceLimits {
    /// Memory ceiling in bytes, saturating at `i64::MAX`.
    pub fn memory_bytes(&self) -> i64 {
        self.memory_mb.saturating_mul(1024 * 1024)
    }

    /// CPU allowance in nano-CPUs (1 core = 1e9).
    pub fn nano_cpus(&self) -> i64 {
        (self.cpu_shares * 1_000_000_000.0) as i64
    }

    /// Check that every limit is positive.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.cpu_shares.is_finite() && self.cpu_shares > 0.0) {
            return Err(format!("cpu_shares must be positive, got {}", self.cpu_shares));
        }
        if self.memory_mb <= 0 {
            return Err(format!("memory_mb must be positive, got {}", self.memory_mb));
        }
        if self.memory_mb > MAX_MEMORY_MB {
            return Err(format!(
                "memory_mb must not exceed {}, got {}",
                MAX_MEMORY_MB, self.memory_mb
            ));
        }
        if self.storage_gb <= 0 {
            return Err(format!("storage_gb must be positive, got {}", self.storage_gb));
        }
        Ok(())
    }
}

/// A tenant workspace instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    /// Unique identifier.
    pub id: Uuid,
    /// Owning user.
    pub owner_id: Uuid,
    /// Human-readable name.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Lifecycle status.
    pub status: InstanceStatus,
    /// Opaque runtime handle; set once a container exists.
    pub container_id: Option<String>,
    /// Allocated private address; set together with `container_id`.
    pub address: Option<Ipv4Addr>,
    /// Internal application port (fixed per deployment).
    pub port: u16,
    /// Public subdomain label.
    pub subdomain: String,
    /// Resource limits.
    pub limits: ResourceLimits,
    /// Operation that moved the instance to `error`.
    pub failed_operation: Option<Operation>,
    /// Message of the failure that moved the instance to `error`.
    pub last_error: Option<String>,
    /// When DNS was last left unverified; cleared once a record is confirmed.
    pub dns_degraded_since: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
    /// Soft-delete time.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Instance {
    /// New `pending` instance for a provisioning request.
    pub fn new_pending(request: &CreateInstanceRequest, port: u16) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_id: request.owner_id,
            name: request.name.clone(),
            description: request.description.clone(),
            status: InstanceStatus::Pending,
            container_id: None,
            address: None,
            port,
            subdomain: request.subdomain.clone(),
            limits: request.limits,
            failed_operation: None,
            last_error: None,
            dns_degraded_since: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    /// Container name used with the runtime.
    pub fn container_name(&self) -> String {
        format!("hostlane-{}", self.id)
    }

    /// Public URL of the instance.
    pub fn public_url(&self, domain: &str) -> String {
        format!("https://{}.{}", self.subdomain, domain)
    }

    /// Check the cross-field invariants that must hold after every operation.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.address.is_some() && self.container_id.is_none() {
            return Err(format!("instance {} has an address but no container", self.id));
        }
        if self.container_id.is_some() && !self.status.may_hold_container() {
            return Err(format!(
                "instance {} holds a container in status {}",
                self.id, self.status
            ));
        }
        if self.status == InstanceStatus::Deleted && self.deleted_at.is_none() {
            return Err(format!("instance {} is deleted without deleted_at", self.id));
        }
        Ok(())
    }
}

/// Provisioning request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateInstanceRequest {
    /// Owning user.
    pub owner_id: Uuid,
    /// Human-readable name.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Requested subdomain label (must be unique among live instances).
    pub subdomain: String,
    /// Resource limits.
    pub limits: ResourceLimits,
}

/// Filter for listing instances.
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    /// Only instances owned by this user.
    pub owner_id: Option<Uuid>,
    /// Only instances in one of these statuses (empty = any).
    pub statuses: Vec<InstanceStatus>,
    /// Include soft-deleted instances.
    pub include_deleted: bool,
    /// Maximum results (0 = unlimited).
    pub limit: i64,
    /// Pagination offset.
    pub offset: i64,
}

impl InstanceFilter {
    /// Instances in exactly `status`.
    pub fn with_status(status: InstanceStatus) -> Self {
        Self {
            statuses: vec![status],
            include_deleted: status == InstanceStatus::Deleted,
            ..Default::default()
        }
    }

    /// Whether `instance` passes the filter.
    pub fn matches(&self, instance: &Instance) -> bool {
        if !self.include_deleted && instance.deleted_at.is_some() {
            return false;
        }
        if self.owner_id.is_some_and(|owner| owner != instance.owner_id) {
            return false;
        }
        self.statuses.is_empty() || self.statuses.contains(&instance.status)
    }
}
