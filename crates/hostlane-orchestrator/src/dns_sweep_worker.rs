// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker for DNS reconciliation.
//!
//! Runs a sweep on a fixed interval. After each sweep, instances whose record
//! is now confirmed get their degraded marker cleared, and instances that
//! have been degraded for longer than `degraded_max_age` are reported to the
//! supervisor as a hard failure.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::dns::DnsReconciler;
use crate::dns::reconciler::SweepTarget;
use crate::error::{Error, Result};
use crate::instance::{Instance, InstanceFilter, InstanceStatus};
use crate::orchestrator::{Fault, InstanceSupervisor};
use crate::store::InstanceStore;

/// Configuration for the DNS sweep worker.
#[derive(Debug, Clone)]
pub struct DnsSweepWorkerConfig {
    /// Time between sweeps.
    pub interval: Duration,
    /// How long an instance's DNS may stay unverified before it is failed.
    pub degraded_max_age: Duration,
}

impl Default for DnsSweepWorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            degraded_max_age: Duration::from_secs(900),
        }
    }
}

/// What one sweep pass did, including degraded-marker bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepPassReport {
    /// The reconciler's report.
    pub sweep: crate::dns::SweepReport,
    /// Why the reconciler sweep failed, if it did.
    pub sweep_error: Option<String>,
    /// Instances whose degraded marker was cleared.
    pub cleared: Vec<Uuid>,
    /// Instances reported as degraded for too long.
    pub failed: Vec<Uuid>,
}

/// Periodic DNS reconciliation worker.
pub struct DnsSweepWorker {
    store: Arc<dyn InstanceStore>,
    reconciler: Arc<DnsReconciler>,
    supervisor: Arc<dyn InstanceSupervisor>,
    config: DnsSweepWorkerConfig,
    shutdown: Arc<Notify>,
}

impl DnsSweepWorker {
    /// Create a new sweep worker.
    pub fn new(
        store: Arc<dyn InstanceStore>,
        reconciler: Arc<DnsReconciler>,
        supervisor: Arc<dyn InstanceSupervisor>,
        config: DnsSweepWorkerConfig,
    ) -> Self {
        Self {
            store,
            reconciler,
            supervisor,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the sweep loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            degraded_max_age_secs = self.config.degraded_max_age.as_secs(),
            "DNS sweep worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("DNS sweep worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.interval) => {
                    if let Err(e) = self.sweep_once().await {
                        error!(error = %e, "DNS sweep failed");
                    }
                }
            }
        }

        info!("DNS sweep worker stopped");
    }

    /// Run one sweep and the degraded-marker bookkeeping that follows it.
    pub async fn sweep_once(&self) -> Result<SweepPassReport> {
        let store = self.store.clone();
        let supervisor = self.supervisor.clone();

        let mut report = SweepPassReport::default();

        // A provider outage still has to age degraded instances out.
        match self
            .reconciler
            .sweep(
                || async move {
                    let live = store.list(&InstanceFilter::default()).await?;
                    Ok(live.iter().map(SweepTarget::from).collect())
                },
                |id| supervisor.is_busy(id),
            )
            .await
        {
            Ok(sweep) => report.sweep = sweep,
            Err(e) => {
                warn!(error = %e, "DNS sweep could not complete");
                report.sweep_error = Some(e.to_string());
            }
        }

        let verified: HashSet<Uuid> = report.sweep.verified.iter().copied().collect();

        // Re-read so markers set by operations that ran during the sweep are seen.
        let degraded: Vec<Instance> = self
            .store
            .list(&InstanceFilter::default())
            .await?
            .into_iter()
            .filter(|i| i.dns_degraded_since.is_some())
            .collect();

        let max_age = chrono::Duration::from_std(self.config.degraded_max_age)
            .map_err(|e| Error::InvalidRequest(format!("invalid degraded bound: {}", e)))?;
        let cutoff = Utc::now() - max_age;

        for instance in degraded {
            let Some(since) = instance.dns_degraded_since else {
                continue;
            };

            if verified.contains(&instance.id) {
                match self.supervisor.record_dns_verified(instance.id).await {
                    Ok(()) => report.cleared.push(instance.id),
                    Err(e) => {
                        warn!(instance_id = %instance.id, error = %e, "Failed to clear DNS degraded marker")
                    }
                }
                continue;
            }

            if since > cutoff
                || !matches!(
                    instance.status,
                    InstanceStatus::Running | InstanceStatus::Stopped
                )
            {
                continue;
            }

            warn!(
                instance_id = %instance.id,
                degraded_since = %since,
                "DNS degraded beyond tolerated bound"
            );
            match self
                .supervisor
                .report_fault(instance.id, Fault::DnsDegradedTooLong { since })
                .await
            {
                Ok(true) => report.failed.push(instance.id),
                Ok(false) => {}
                Err(e) => {
                    error!(instance_id = %instance.id, error = %e, "Failed to report DNS fault")
                }
            }
        }

        Ok(report)
    }
}
