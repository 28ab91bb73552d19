// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that samples resource usage of running instances.
//!
//! Each tick lists `running` instances, reads a stats snapshot for each one
//! with bounded concurrency and appends one sample per success. A failed
//! sample is logged and skipped. An instance that fails
//! `failure_threshold` ticks in a row is reported to the supervisor, which
//! moves it to `error`. Other instances in the same tick are unaffected.
//!
//! Rollups, retention and compression are storage policies; the pipeline
//! only appends.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::container::{self, ContainerRuntime};
use crate::error::Result;
use crate::instance::{Instance, InstanceFilter, InstanceStatus};
use crate::orchestrator::{Fault, InstanceSupervisor};
use crate::retry::{RetryPolicy, retry};
use crate::store::{InstanceStore, UsageStore};
use crate::usage::ResourceUsageSample;

/// Configuration for the telemetry pipeline.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Time between ticks.
    pub interval: Duration,
    /// Instances sampled at once.
    pub concurrency: usize,
    /// Deadline for one stats call.
    pub sample_timeout: Duration,
    /// Consecutive failures before the instance is reported.
    pub failure_threshold: u32,
    /// Retries for appending a sample.
    pub append_retry: RetryPolicy,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            concurrency: 16,
            sample_timeout: Duration::from_secs(10),
            failure_threshold: 3,
            append_retry: RetryPolicy::default(),
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Running instances considered.
    pub instances: usize,
    /// Samples appended.
    pub persisted: usize,
    /// Samples that could not be taken or stored.
    pub failed: usize,
    /// Instances reported to the supervisor this tick.
    pub faulted: Vec<Uuid>,
}

enum SampleOutcome {
    Persisted,
    Failed,
    Faulted(Uuid),
}

/// Periodic telemetry worker.
pub struct TelemetryPipeline {
    store: Arc<dyn InstanceStore>,
    usage: Arc<dyn UsageStore>,
    runtime: Arc<dyn ContainerRuntime>,
    supervisor: Arc<dyn InstanceSupervisor>,
    config: TelemetryConfig,
    failures: DashMap<Uuid, u32>,
    shutdown: Arc<Notify>,
}

impl TelemetryPipeline {
    /// Create a new pipeline.
    pub fn new(
        store: Arc<dyn InstanceStore>,
        usage: Arc<dyn UsageStore>,
        runtime: Arc<dyn ContainerRuntime>,
        supervisor: Arc<dyn InstanceSupervisor>,
        config: TelemetryConfig,
    ) -> Self {
        Self {
            store,
            usage,
            runtime,
            supervisor,
            config,
            failures: DashMap::new(),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Consecutive failures currently counted for `instance_id`.
    pub fn failure_count(&self, instance_id: Uuid) -> u32 {
        self.failures.get(&instance_id).map(|c| *c).unwrap_or(0)
    }

    /// Run the sampling loop until shutdown is signalled.
    ///
    /// A tick in progress when shutdown arrives is finished first.
    pub async fn run(&self) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            concurrency = self.config.concurrency,
            "Telemetry pipeline started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Telemetry pipeline received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.interval) => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Telemetry tick failed");
                    }
                }
            }
        }

        info!("Telemetry pipeline stopped");
    }

    /// Sample every running instance once.
    pub async fn tick(&self) -> Result<TickReport> {
        let running = self
            .store
            .list(&InstanceFilter::with_status(InstanceStatus::Running))
            .await?;

        let ids: HashSet<Uuid> = running.iter().map(|i| i.id).collect();
        self.failures.retain(|id, _| ids.contains(id));

        let mut report = TickReport {
            instances: running.len(),
            ..Default::default()
        };

        let outcomes: Vec<SampleOutcome> = futures::stream::iter(running)
            .map(|instance| self.sample(instance))
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                SampleOutcome::Persisted => report.persisted += 1,
                SampleOutcome::Failed => report.failed += 1,
                SampleOutcome::Faulted(id) => {
                    report.failed += 1;
                    report.faulted.push(id);
                }
            }
        }

        debug!(
            instances = report.instances,
            persisted = report.persisted,
            failed = report.failed,
            "Telemetry tick finished"
        );
        Ok(report)
    }

    async fn sample(&self, instance: Instance) -> SampleOutcome {
        let Some(container_id) = instance.container_id.as_deref() else {
            warn!(instance_id = %instance.id, "Running instance has no container");
            return self.count_failure(instance.id, "no container on record".to_string()).await;
        };

        let stats = container::with_deadline(
            self.config.sample_timeout,
            "stats",
            self.runtime.stats(container_id),
        )
        .await;

        let stats = match stats {
            Ok(stats) => stats,
            Err(e) => {
                warn!(instance_id = %instance.id, error = %e, "Failed to sample instance");
                return self.count_failure(instance.id, e.to_string()).await;
            }
        };
        self.failures.remove(&instance.id);

        let sample = ResourceUsageSample::from_stats(instance.id, Utc::now(), &stats);
        let appended = retry(
            self.config.append_retry,
            "usage append",
            |_| true,
            || self.usage.append(&sample),
        )
        .await;

        match appended {
            Ok(()) => SampleOutcome::Persisted,
            Err(e) => {
                error!(instance_id = %instance.id, error = %e, "Failed to store usage sample");
                SampleOutcome::Failed
            }
        }
    }

    async fn count_failure(&self, instance_id: Uuid, last_error: String) -> SampleOutcome {
        let consecutive_failures = {
            let mut count = self.failures.entry(instance_id).or_insert(0);
            *count += 1;
            *count
        };

        if consecutive_failures < self.config.failure_threshold {
            return SampleOutcome::Failed;
        }

        let fault = Fault::TelemetryUnreachable {
            consecutive_failures,
            last_error,
        };
        match self.supervisor.report_fault(instance_id, fault).await {
            Ok(true) => {
                self.failures.remove(&instance_id);
                SampleOutcome::Faulted(instance_id)
            }
            Ok(false) => SampleOutcome::Failed,
            Err(e) => {
                error!(instance_id = %instance_id, error = %e, "Failed to report telemetry fault");
                SampleOutcome::Failed
            }
        }
    }
}
