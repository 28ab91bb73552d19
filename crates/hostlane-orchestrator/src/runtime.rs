// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for hostlane-orchestrator.
//!
//! [`OrchestratorRuntime`] wires the orchestrator to its collaborators, runs
//! startup recovery and owns the periodic workers.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use hostlane_orchestrator::runtime::OrchestratorRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = OrchestratorRuntime::builder()
//!         .instance_store(store)
//!         .usage_store(usage)
//!         .container_runtime(docker)
//!         .dns_provider(dns)
//!         .allocator(allocator)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let outcome = runtime.orchestrator().create(request).await?;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::container::ContainerRuntime;
use crate::dns::{DnsProvider, DnsReconciler, DnsReconcilerConfig};
use crate::dns_sweep_worker::{DnsSweepWorker, DnsSweepWorkerConfig};
use crate::network::NetworkAllocator;
use crate::orchestrator::{InstanceSupervisor, Orchestrator, OrchestratorConfig, RecoveryReport};
use crate::store::{InstanceStore, UsageStore};
use crate::telemetry::{TelemetryConfig, TelemetryPipeline};

/// Builder for creating an [`OrchestratorRuntime`].
#[derive(Default)]
pub struct OrchestratorRuntimeBuilder {
    instance_store: Option<Arc<dyn InstanceStore>>,
    usage_store: Option<Arc<dyn UsageStore>>,
    container_runtime: Option<Arc<dyn ContainerRuntime>>,
    dns_provider: Option<Arc<dyn DnsProvider>>,
    allocator: Option<Arc<NetworkAllocator>>,
    orchestrator_config: OrchestratorConfig,
    dns_config: DnsReconcilerConfig,
    telemetry_config: TelemetryConfig,
    sweep_config: DnsSweepWorkerConfig,
}

impl OrchestratorRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the instance record store (required).
    pub fn instance_store(mut self, store: Arc<dyn InstanceStore>) -> Self {
        self.instance_store = Some(store);
        self
    }

    /// Set the usage time-series store (required).
    pub fn usage_store(mut self, store: Arc<dyn UsageStore>) -> Self {
        self.usage_store = Some(store);
        self
    }

    /// Set the container runtime (required).
    pub fn container_runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.container_runtime = Some(runtime);
        self
    }

    /// Set the DNS provider (required).
    pub fn dns_provider(mut self, provider: Arc<dyn DnsProvider>) -> Self {
        self.dns_provider = Some(provider);
        self
    }

    /// Set the address allocator (required).
    pub fn allocator(mut self, allocator: Arc<NetworkAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    /// Set the orchestrator configuration.
    pub fn orchestrator_config(mut self, config: OrchestratorConfig) -> Self {
        self.orchestrator_config = config;
        self
    }

    /// Set the DNS reconciler configuration.
    pub fn dns_config(mut self, config: DnsReconcilerConfig) -> Self {
        self.dns_config = config;
        self
    }

    /// Set the telemetry pipeline configuration.
    pub fn telemetry_config(mut self, config: TelemetryConfig) -> Self {
        self.telemetry_config = config;
        self
    }

    /// Set the DNS sweep worker configuration.
    pub fn sweep_config(mut self, config: DnsSweepWorkerConfig) -> Self {
        self.sweep_config = config;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<OrchestratorRuntimeConfig> {
        let instance_store = self
            .instance_store
            .ok_or_else(|| anyhow::anyhow!("instance_store is required"))?;
        let usage_store = self
            .usage_store
            .ok_or_else(|| anyhow::anyhow!("usage_store is required"))?;
        let container_runtime = self
            .container_runtime
            .ok_or_else(|| anyhow::anyhow!("container_runtime is required"))?;
        let dns_provider = self
            .dns_provider
            .ok_or_else(|| anyhow::anyhow!("dns_provider is required"))?;
        let allocator = self
            .allocator
            .ok_or_else(|| anyhow::anyhow!("allocator is required"))?;

        Ok(OrchestratorRuntimeConfig {
            instance_store,
            usage_store,
            container_runtime,
            dns_provider,
            allocator,
            orchestrator_config: self.orchestrator_config,
            dns_config: self.dns_config,
            telemetry_config: self.telemetry_config,
            sweep_config: self.sweep_config,
        })
    }
}

/// Configuration for an [`OrchestratorRuntime`].
pub struct OrchestratorRuntimeConfig {
    instance_store: Arc<dyn InstanceStore>,
    usage_store: Arc<dyn UsageStore>,
    container_runtime: Arc<dyn ContainerRuntime>,
    dns_provider: Arc<dyn DnsProvider>,
    allocator: Arc<NetworkAllocator>,
    orchestrator_config: OrchestratorConfig,
    dns_config: DnsReconcilerConfig,
    telemetry_config: TelemetryConfig,
    sweep_config: DnsSweepWorkerConfig,
}

impl OrchestratorRuntimeConfig {
    /// Run startup recovery, then spawn the telemetry and DNS sweep workers.
    pub async fn start(self) -> Result<OrchestratorRuntime> {
        let reconciler = Arc::new(DnsReconciler::new(self.dns_provider, self.dns_config));
        let orchestrator = Arc::new(Orchestrator::new(
            self.instance_store.clone(),
            self.usage_store.clone(),
            self.container_runtime.clone(),
            reconciler.clone(),
            self.allocator,
            self.orchestrator_config,
        ));

        let recovery = orchestrator.recover().await?;
        let supervisor: Arc<dyn InstanceSupervisor> = orchestrator.clone();

        let telemetry = TelemetryPipeline::new(
            self.instance_store.clone(),
            self.usage_store,
            self.container_runtime,
            supervisor.clone(),
            self.telemetry_config,
        );
        let telemetry_shutdown = telemetry.shutdown_handle();
        let telemetry_handle = tokio::spawn(async move {
            telemetry.run().await;
        });

        let sweep_worker = DnsSweepWorker::new(
            self.instance_store,
            reconciler,
            supervisor,
            self.sweep_config,
        );
        let sweep_shutdown = sweep_worker.shutdown_handle();
        let sweep_handle = tokio::spawn(async move {
            sweep_worker.run().await;
        });

        info!(
            addresses_claimed = recovery.addresses_claimed,
            interrupted = recovery.interrupted.len(),
            "OrchestratorRuntime started"
        );

        Ok(OrchestratorRuntime {
            orchestrator,
            recovery,
            telemetry_handle,
            sweep_handle,
            telemetry_shutdown,
            sweep_shutdown,
        })
    }
}

/// A running orchestrator with its periodic workers.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct OrchestratorRuntime {
    orchestrator: Arc<Orchestrator>,
    recovery: RecoveryReport,
    telemetry_handle: JoinHandle<()>,
    sweep_handle: JoinHandle<()>,
    telemetry_shutdown: Arc<Notify>,
    sweep_shutdown: Arc<Notify>,
}

impl OrchestratorRuntime {
    /// Create a new runtime builder.
    pub fn builder() -> OrchestratorRuntimeBuilder {
        OrchestratorRuntimeBuilder::new()
    }

    /// The orchestrator API.
    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// What startup recovery found.
    pub fn recovery(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Gracefully shut down the runtime.
    ///
    /// New lifecycle operations are refused, in-flight ones are drained, then
    /// the periodic workers are signalled and awaited.
    pub async fn shutdown(self) -> Result<()> {
        info!("OrchestratorRuntime shutting down...");

        self.orchestrator.drain().await;

        self.telemetry_shutdown.notify_one();
        self.sweep_shutdown.notify_one();

        if let Err(e) = self.telemetry_handle.await {
            error!("Telemetry pipeline task panicked: {}", e);
        }
        if let Err(e) = self.sweep_handle.await {
            error!("DNS sweep worker task panicked: {}", e);
        }

        info!("OrchestratorRuntime shutdown complete");
        Ok(())
    }

    /// Check if the periodic workers are still running.
    pub fn is_running(&self) -> bool {
        !self.telemetry_handle.is_finished() && !self.sweep_handle.is_finished()
    }
}
