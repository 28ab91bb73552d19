// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container runtime adapter.
//!
//! Runtimes are pure execution backends: they never touch the record store.
//! Status bookkeeping is done by the caller.

pub mod docker;
pub mod mock;

use std::collections::HashMap;
use std::future::Future;
use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::instance::{Instance, ResourceLimits};

pub use docker::{DockerConfig, DockerRuntime};
pub use mock::{FailPoint, MockContainerRuntime};

/// Label marking containers managed by this service.
pub const MANAGED_LABEL: &str = "com.hostlane.managed";
/// Label carrying the owning instance id.
pub const INSTANCE_LABEL: &str = "com.hostlane.instance-id";

/// Errors from container runtime operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ContainerError {
    /// No container with this handle.
    #[error("Container not found: {0}")]
    NotFound(String),

    /// Container could not be created.
    #[error("Container create failed: {0}")]
    CreateFailed(String),

    /// Container could not be started.
    #[error("Container start failed: {0}")]
    StartFailed(String),

    /// Container could not be stopped.
    #[error("Container stop failed: {0}")]
    StopFailed(String),

    /// Container could not be removed.
    #[error("Container remove failed: {0}")]
    RemoveFailed(String),

    /// Stats unavailable: container not running or runtime unreachable.
    #[error("Container unreachable: {0}")]
    Unreachable(String),

    /// The runtime daemon could not be reached.
    #[error("Runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// The call exceeded its deadline.
    #[error("Container call timed out: {0}")]
    Timeout(String),

    /// The container network exists with an incompatible configuration.
    #[error("Container network mismatch: {0}")]
    NetworkMismatch(String),
}

impl ContainerError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ContainerError::Unreachable(_)
                | ContainerError::RuntimeUnavailable(_)
                | ContainerError::Timeout(_)
        )
    }
}

/// Result type for container operations.
pub type Result<T> = std::result::Result<T, ContainerError>;

/// Everything needed to create an instance container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    /// Owning instance.
    pub instance_id: Uuid,
    /// Container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Static address on the private network.
    pub address: Ipv4Addr,
    /// Internal application port.
    pub port: u16,
    /// Resource limits.
    pub limits: ResourceLimits,
    /// Named data volume, derived from the instance id.
    pub volume: String,
    /// Named volume for user files, derived from the instance id.
    pub files_volume: String,
    /// Extra labels.
    pub labels: HashMap<String, String>,
    /// Environment variables.
    pub env: HashMap<String, String>,
}

impl ContainerSpec {
    /// Spec for `instance` bound to `address`.
    pub fn for_instance(instance: &Instance, image: &str, address: Ipv4Addr, domain: &str) -> Self {
        let mut labels = HashMap::new();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        labels.insert(INSTANCE_LABEL.to_string(), instance.id.to_string());
        labels.insert("com.hostlane.subdomain".to_string(), instance.subdomain.clone());

        let mut env = HashMap::new();
        env.insert(
            "N8N_HOST".to_string(),
            format!("{}.{}", instance.subdomain, domain),
        );
        env.insert("N8N_PORT".to_string(), instance.port.to_string());
        env.insert("N8N_PROTOCOL".to_string(), "https".to_string());
        env.insert(
            "WEBHOOK_URL".to_string(),
            format!("{}/", instance.public_url(domain)),
        );

        Self {
            instance_id: instance.id,
            name: instance.container_name(),
            image: image.to_string(),
            address,
            port: instance.port,
            limits: instance.limits,
            volume: volume_name(instance.id),
            files_volume: files_volume_name(instance.id),
            labels,
            env,
        }
    }
}

/// Deterministic data volume name for an instance.
pub fn volume_name(instance_id: Uuid) -> String {
    format!("hostlane-data-{}", instance_id)
}

/// Deterministic user-files volume name for an instance.
pub fn files_volume_name(instance_id: Uuid) -> String {
    format!("hostlane-files-{}", instance_id)
}

/// Handle returned by `create`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerHandle {
    /// Opaque runtime id.
    pub id: String,
    /// Container name.
    pub name: String,
}

/// Point-in-time resource snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerStats {
    /// CPU utilization, 0.0 to 1.0 of the host.
    pub cpu_fraction: f64,
    /// Memory in use.
    pub memory_used_bytes: u64,
    /// Memory limit.
    pub memory_limit_bytes: u64,
    /// Writable-layer size.
    pub disk_used_bytes: u64,
    /// Bytes received on all interfaces.
    pub network_in_bytes: u64,
    /// Bytes sent on all interfaces.
    pub network_out_bytes: u64,
}

/// Trait for container runtimes.
///
/// `stop` and `remove` treat an already-stopped or missing container as
/// success so compensation and delete can be replayed.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Runtime type identifier (e.g., "docker", "mock")
    fn runtime_type(&self) -> &'static str;

    /// Create (but do not start) a container.
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle>;

    /// Start a created or stopped container.
    async fn start(&self, container_id: &str) -> Result<()>;

    /// Stop a running container.
    async fn stop(&self, container_id: &str) -> Result<()>;

    /// Remove a container. Its data volume is kept.
    async fn remove(&self, container_id: &str) -> Result<()>;

    /// Whether the container exists at all.
    async fn exists(&self, container_id: &str) -> Result<bool>;

    /// Read a stats snapshot; `Unreachable` when not running.
    async fn stats(&self, container_id: &str) -> Result<ContainerStats>;
}

/// Run a runtime call under a deadline; elapsing counts as failure.
pub async fn with_deadline<T>(
    deadline: Duration,
    what: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(ContainerError::Timeout(format!(
            "{} exceeded {:?}",
            what, deadline
        ))),
    }
}
