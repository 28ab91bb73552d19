// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifecycle orchestrator.
//!
//! Maps an instance to a running container with an allocated address and a
//! DNS name, and keeps that mapping consistent when the runtime or the DNS
//! backend fails part-way through an operation.
//!
//! Every mutating operation:
//! 1. fails fast with [`Error::OperationInProgress`] if the instance is busy
//! 2. waits for a slot in the bounded worker pool
//! 3. checks the transition against the state machine in [`crate::instance`]
//! 4. performs its steps, persisting the record as it goes
//!
//! A failed `create` is compensated in reverse order. Only the steps that were
//! actually undone are cleared from the record, so a retry resumes where the
//! failure left off.

use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::container::{self, ContainerError, ContainerRuntime, ContainerSpec};
use crate::dns::{DnsOutcome, DnsReconciler};
use crate::error::{Error, Result};
use crate::instance::{
    CreateInstanceRequest, Instance, InstanceFilter, InstanceStatus, Operation, Transition,
    plan_transition,
};
use crate::network::NetworkAllocator;
use crate::retry::{RetryPolicy, retry};
use crate::store::{InstanceStore, StoreError, UsageStore};
use crate::subdomain::{suggest, validate_label};
use crate::usage::{ResourceUsageSample, UsageSummary};

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Image every instance runs.
    pub image: String,
    /// Internal application port.
    pub port: u16,
    /// Public domain used in container environment and URLs.
    pub domain: String,
    /// Deadline for each attempt of a container runtime call.
    pub call_timeout: Duration,
    /// Retries of container calls that failed transiently.
    pub retry: RetryPolicy,
    /// Lifecycle operations allowed to run at once.
    pub max_concurrent_operations: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            image: "n8nio/n8n:latest".to_string(),
            port: 5678,
            domain: "launchstack.io".to_string(),
            call_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            max_concurrent_operations: 8,
        }
    }
}

/// Result of a successful lifecycle operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleOutcome {
    /// The instance as persisted after the operation.
    pub instance: Instance,
    /// What happened on the DNS side.
    pub dns: DnsOutcome,
}

/// A failure observed outside a lifecycle operation.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum Fault {
    /// Stats sampling failed repeatedly.
    #[error("container unreachable for {consecutive_failures} consecutive samples: {last_error}")]
    TelemetryUnreachable {
        /// Failures in a row.
        consecutive_failures: u32,
        /// Message of the most recent failure.
        last_error: String,
    },
    /// DNS stayed unverified past the tolerated bound.
    #[error("DNS record unverified since {since}")]
    DnsDegradedTooLong {
        /// When DNS was first left unverified.
        since: DateTime<Utc>,
    },
}

/// Fault intake used by the periodic workers.
#[async_trait]
pub trait InstanceSupervisor: Send + Sync {
    /// Whether a lifecycle operation currently holds the instance.
    fn is_busy(&self, instance_id: Uuid) -> bool;

    /// Move a running or stopped instance to `error`.
    ///
    /// Returns `false` when the fault was ignored (busy, shutting down, or
    /// the instance is in another status).
    async fn report_fault(&self, instance_id: Uuid, fault: Fault) -> Result<bool>;

    /// Clear the degraded-DNS marker after a sweep confirmed the record.
    async fn record_dns_verified(&self, instance_id: Uuid) -> Result<()>;
}

/// What startup recovery found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Addresses re-claimed from live instances.
    pub addresses_claimed: usize,
    /// Instances whose address was already claimed by another instance.
    pub conflicts: Vec<(Ipv4Addr, Uuid)>,
    /// Instances found in `pending` and moved to `error`.
    pub interrupted: Vec<Uuid>,
}

struct OperationGuard {
    _lock: OwnedMutexGuard<()>,
    _permit: OwnedSemaphorePermit,
}

/// Steps a provisioning run performed itself, as opposed to steps it found
/// already done on the record.
#[derive(Debug, Default)]
struct Progress {
    allocated: Option<Ipv4Addr>,
    created: Option<String>,
    started: bool,
    registered: bool,
}

/// The lifecycle orchestrator.
pub struct Orchestrator {
    store: Arc<dyn InstanceStore>,
    usage: Arc<dyn UsageStore>,
    runtime: Arc<dyn ContainerRuntime>,
    dns: Arc<DnsReconciler>,
    allocator: Arc<NetworkAllocator>,
    config: OrchestratorConfig,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
    workers: Arc<Semaphore>,
    shutting_down: AtomicBool,
}

impl Orchestrator {
    /// Create an orchestrator over the given collaborators.
    pub fn new(
        store: Arc<dyn InstanceStore>,
        usage: Arc<dyn UsageStore>,
        runtime: Arc<dyn ContainerRuntime>,
        dns: Arc<DnsReconciler>,
        allocator: Arc<NetworkAllocator>,
        config: OrchestratorConfig,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.max_concurrent_operations.max(1)));
        Self {
            store,
            usage,
            runtime,
            dns,
            allocator,
            config,
            locks: DashMap::new(),
            workers,
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Record store.
    pub fn store(&self) -> &Arc<dyn InstanceStore> {
        &self.store
    }

    /// DNS reconciler.
    pub fn dns(&self) -> &Arc<DnsReconciler> {
        &self.dns
    }

    /// Address allocator.
    pub fn allocator(&self) -> &Arc<NetworkAllocator> {
        &self.allocator
    }

    /// Configuration.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    fn ensure_accepting(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }

    fn lock_for(&self, instance_id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .entry(instance_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    /// Take the instance lock, then a worker slot.
    async fn begin(&self, instance_id: Uuid) -> Result<OperationGuard> {
        self.ensure_accepting()?;
        let lock = self
            .lock_for(instance_id)
            .try_lock_owned()
            .map_err(|_| Error::OperationInProgress(instance_id))?;
        let permit = self
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::ShuttingDown)?;
        Ok(OperationGuard {
            _lock: lock,
            _permit: permit,
        })
    }

    async fn load(&self, instance_id: Uuid) -> Result<Instance> {
        self.store
            .get(instance_id)
            .await?
            .ok_or(Error::InstanceNotFound(instance_id))
    }

    /// Run a runtime call with a deadline per attempt, retrying transient failures.
    async fn call<T, F, Fut>(&self, what: &str, mut op: F) -> container::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = container::Result<T>>,
    {
        let deadline = self.config.call_timeout;
        retry(self.config.retry, what, ContainerError::is_transient, || {
            container::with_deadline(deadline, what, op())
        })
        .await
    }

    async fn persist(&self, instance: &Instance) -> Result<()> {
        instance.check_invariants().map_err(Error::Invariant)?;
        self.store.update(instance).await?;
        Ok(())
    }

    /// Provision a new instance.
    ///
    /// An empty subdomain is replaced by a label suggested from the owner and
    /// name. DNS trouble never fails creation; it shows up as
    /// [`DnsOutcome::Degraded`] in the result.
    pub async fn create(&self, mut request: CreateInstanceRequest) -> Result<LifecycleOutcome> {
        self.ensure_accepting()?;
        if request.subdomain.is_empty() {
            request.subdomain = suggest(&format!("{}/{}", request.owner_id, request.name));
            debug!(subdomain = %request.subdomain, "No subdomain requested; using suggestion");
        }
        if request.name.trim().is_empty() {
            return Err(Error::InvalidRequest("name must not be empty".to_string()));
        }
        validate_label(&request.subdomain).map_err(Error::InvalidRequest)?;
        request.limits.validate().map_err(Error::InvalidRequest)?;

        let instance = Instance::new_pending(&request, self.config.port);
        let _guard = self.begin(instance.id).await?;

        if self.store.subdomain_taken(&request.subdomain).await? {
            return Err(Error::DuplicateSubdomain(request.subdomain));
        }
        match self.store.insert(&instance).await {
            Err(StoreError::UniqueViolation(_)) => {
                return Err(Error::DuplicateSubdomain(request.subdomain));
            }
            other => other?,
        }

        info!(
            instance_id = %instance.id,
            owner_id = %instance.owner_id,
            subdomain = %instance.subdomain,
            "Creating instance"
        );
        self.provision(instance).await
    }

    /// Retry a `create` that left the instance in `error`.
    ///
    /// A retained address or container is reused; anything missing is
    /// allocated or created anew.
    pub async fn retry_create(&self, instance_id: Uuid) -> Result<LifecycleOutcome> {
        let _guard = self.begin(instance_id).await?;
        let instance = self.load(instance_id).await?;
        plan_transition(instance.status, instance.failed_operation, Operation::Create)?;

        info!(instance_id = %instance_id, "Retrying instance creation");
        self.provision(instance).await
    }

    async fn provision(&self, mut instance: Instance) -> Result<LifecycleOutcome> {
        let mut progress = Progress::default();
        match self.run_provision(&mut instance, &mut progress).await {
            Ok(dns) => {
                info!(
                    instance_id = %instance.id,
                    address = ?instance.address,
                    dns = ?dns,
                    "Instance running"
                );
                Ok(LifecycleOutcome { instance, dns })
            }
            Err(e) => {
                error!(instance_id = %instance.id, error = %e, "Instance creation failed; compensating");
                self.compensate(&mut instance, &progress).await;
                self.record_failure(&mut instance, Operation::Create, &e)
                    .await;
                Err(e)
            }
        }
    }

    async fn run_provision(
        &self,
        instance: &mut Instance,
        progress: &mut Progress,
    ) -> Result<DnsOutcome> {
        if let Some(stale) = instance.container_id.clone() {
            let present = self.call("exists", || self.runtime.exists(&stale)).await?;
            if !present {
                debug!(instance_id = %instance.id, container_id = %stale, "Retained container is gone");
                instance.container_id = None;
            }
        }

        let address = match instance.address {
            Some(address) => {
                if let Some(holder) = self.allocator.claim(address, instance.id)? {
                    return Err(Error::Invariant(format!(
                        "address {} of instance {} is held by {}",
                        address, instance.id, holder
                    )));
                }
                address
            }
            None => {
                let address = self.allocator.allocate(instance.id)?;
                progress.allocated = Some(address);
                address
            }
        };

        let container_id = match instance.container_id.clone() {
            Some(id) => id,
            None => {
                let spec = ContainerSpec::for_instance(
                    instance,
                    &self.config.image,
                    address,
                    &self.config.domain,
                );
                let handle = self.call("create", || self.runtime.create(&spec)).await?;
                progress.created = Some(handle.id.clone());
                handle.id
            }
        };

        instance.container_id = Some(container_id.clone());
        instance.address = Some(address);
        // Checkpoint so a crash from here on leaves the container traceable.
        self.persist(instance).await?;

        self.call("start", || self.runtime.start(&container_id)).await?;
        progress.started = true;

        let dns = self.dns.register(&instance.subdomain, address).await;
        progress.registered = true;
        note_dns(instance, dns);

        instance.status = InstanceStatus::Running;
        instance.failed_operation = None;
        instance.last_error = None;
        self.persist(instance).await?;
        Ok(dns)
    }

    /// Undo what `progress` says this run did, newest first.
    async fn compensate(&self, instance: &mut Instance, progress: &Progress) {
        if progress.registered {
            let outcome = self.dns.unregister(&instance.subdomain).await;
            if outcome.is_degraded() {
                warn!(instance_id = %instance.id, "DNS record not confirmed removed during compensation");
            }
        }

        if progress.started
            && let Some(container_id) = instance.container_id.clone()
            && let Err(e) = self.call("stop", || self.runtime.stop(&container_id)).await
        {
            warn!(instance_id = %instance.id, error = %e, "Failed to stop container during compensation");
        }

        if let Some(container_id) = &progress.created {
            match self.call("remove", || self.runtime.remove(container_id)).await {
                Ok(()) => {
                    debug!(instance_id = %instance.id, container_id = %container_id, "Removed container");
                    instance.container_id = None;
                }
                Err(e) => {
                    warn!(
                        instance_id = %instance.id,
                        container_id = %container_id,
                        error = %e,
                        "Failed to remove container during compensation; keeping it on record"
                    );
                }
            }
        }

        // An address stays on record only while a container may still bind it.
        if instance.container_id.is_none()
            && let Some(address) = instance.address.take().or(progress.allocated)
        {
            self.allocator.release(address);
        }
    }

    async fn record_failure(&self, instance: &mut Instance, operation: Operation, cause: &Error) {
        instance.status = InstanceStatus::Error;
        instance.failed_operation = Some(operation);
        instance.last_error = Some(cause.to_string());

        if let Err(e) = self.persist(instance).await {
            error!(
                instance_id = %instance.id,
                operation = %operation,
                error = %e,
                "Failed to persist error status"
            );
        }
    }

    /// Start a stopped instance, or retry a failed start.
    ///
    /// The retained address is reused and DNS is re-verified.
    pub async fn start(&self, instance_id: Uuid) -> Result<LifecycleOutcome> {
        let _guard = self.begin(instance_id).await?;
        let mut instance = self.load(instance_id).await?;
        let target = match plan_transition(
            instance.status,
            instance.failed_operation,
            Operation::Start,
        )? {
            Transition::Proceed { target } => target,
            Transition::NoOp => return Ok(skipped(instance)),
        };

        let (Some(container_id), Some(address)) = (instance.container_id.clone(), instance.address)
        else {
            return Err(Error::Invariant(format!(
                "instance {} has no container or address to start",
                instance_id
            )));
        };

        if let Err(e) = self.call("start", || self.runtime.start(&container_id)).await {
            let e = Error::from(e);
            error!(instance_id = %instance_id, error = %e, "Failed to start container");
            self.record_failure(&mut instance, Operation::Start, &e).await;
            return Err(e);
        }

        let dns = self.dns.ensure(&instance.subdomain, address).await;
        note_dns(&mut instance, dns);

        instance.status = target;
        instance.failed_operation = None;
        instance.last_error = None;
        self.persist(&instance).await?;

        info!(instance_id = %instance_id, address = %address, dns = ?dns, "Instance started");
        Ok(LifecycleOutcome { instance, dns })
    }

    /// Stop a running instance. Address and DNS are retained.
    pub async fn stop(&self, instance_id: Uuid) -> Result<LifecycleOutcome> {
        let _guard = self.begin(instance_id).await?;
        let mut instance = self.load(instance_id).await?;
        let target = match plan_transition(
            instance.status,
            instance.failed_operation,
            Operation::Stop,
        )? {
            Transition::Proceed { target } => target,
            Transition::NoOp => return Ok(skipped(instance)),
        };

        if let Some(container_id) = instance.container_id.clone()
            && let Err(e) = self.call("stop", || self.runtime.stop(&container_id)).await
        {
            let e = Error::from(e);
            error!(instance_id = %instance_id, error = %e, "Failed to stop container");
            self.record_failure(&mut instance, Operation::Stop, &e).await;
            return Err(e);
        }

        instance.status = target;
        instance.failed_operation = None;
        instance.last_error = None;
        self.persist(&instance).await?;

        info!(instance_id = %instance_id, "Instance stopped");
        Ok(skipped(instance))
    }

    /// Tear an instance down and soft-delete it.
    ///
    /// Deleting an already deleted instance succeeds without doing anything.
    pub async fn delete(&self, instance_id: Uuid) -> Result<LifecycleOutcome> {
        let _guard = self.begin(instance_id).await?;
        let mut instance = self.load(instance_id).await?;
        if let Transition::NoOp =
            plan_transition(instance.status, instance.failed_operation, Operation::Delete)?
        {
            debug!(instance_id = %instance_id, "Instance already deleted");
            return Ok(skipped(instance));
        }

        if let Some(container_id) = instance.container_id.clone() {
            if let Err(e) = self.call("stop", || self.runtime.stop(&container_id)).await {
                warn!(instance_id = %instance_id, error = %e, "Failed to stop container before removal");
            }
            if let Err(e) = self.call("remove", || self.runtime.remove(&container_id)).await {
                let e = Error::from(e);
                error!(instance_id = %instance_id, error = %e, "Failed to remove container");
                self.record_failure(&mut instance, Operation::Delete, &e)
                    .await;
                return Err(e);
            }
            instance.container_id = None;
        }

        if let Some(address) = instance.address.take() {
            self.allocator.release(address);
        }

        let dns = self.dns.unregister(&instance.subdomain).await;
        if dns.is_degraded() {
            warn!(instance_id = %instance_id, "DNS removal unverified; the sweep will retry");
        }

        instance.status = InstanceStatus::Deleted;
        instance.deleted_at = Some(Utc::now());
        instance.failed_operation = None;
        instance.dns_degraded_since = None;
        self.persist(&instance).await?;

        info!(instance_id = %instance_id, dns = ?dns, "Instance deleted");
        Ok(LifecycleOutcome { instance, dns })
    }

    /// Load an instance, deleted ones included.
    pub async fn get(&self, instance_id: Uuid) -> Result<Instance> {
        self.load(instance_id).await
    }

    /// Instances matching `filter`, newest first.
    pub async fn list(&self, filter: &InstanceFilter) -> Result<Vec<Instance>> {
        Ok(self.store.list(filter).await?)
    }

    /// Most recent usage sample.
    pub async fn latest_usage(&self, instance_id: Uuid) -> Result<Option<ResourceUsageSample>> {
        Ok(self.usage.latest(instance_id).await?)
    }

    /// Samples since `since`, newest first.
    pub async fn usage_history(
        &self,
        instance_id: Uuid,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ResourceUsageSample>> {
        Ok(self.usage.history(instance_id, since, limit).await?)
    }

    /// Usage aggregated over the trailing `period`.
    pub async fn usage_summary(&self, instance_id: Uuid, period: Duration) -> Result<UsageSummary> {
        let period = chrono::Duration::from_std(period)
            .map_err(|e| Error::InvalidRequest(format!("invalid period: {}", e)))?;
        Ok(self.usage.summary(instance_id, Utc::now() - period).await?)
    }

    /// Rebuild allocator state from the store and fail interrupted creates.
    ///
    /// Call once at startup, before accepting operations.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let live = self.store.list(&InstanceFilter::default()).await?;

        let holders: Vec<(Ipv4Addr, Uuid)> = live
            .iter()
            .filter_map(|i| i.address.map(|a| (a, i.id)))
            .collect();
        let conflicts = self.allocator.rebuild(holders.iter().copied());
        let mut report = RecoveryReport {
            addresses_claimed: holders.len() - conflicts.len(),
            conflicts,
            interrupted: Vec::new(),
        };

        for mut instance in live
            .into_iter()
            .filter(|i| i.status == InstanceStatus::Pending)
        {
            warn!(instance_id = %instance.id, "Found interrupted create; marking as error");
            instance.status = InstanceStatus::Error;
            instance.failed_operation = Some(Operation::Create);
            instance.last_error = Some("creation interrupted by restart".to_string());
            self.persist(&instance).await?;
            report.interrupted.push(instance.id);
        }

        info!(
            addresses_claimed = report.addresses_claimed,
            conflicts = report.conflicts.len(),
            interrupted = report.interrupted.len(),
            "Recovery complete"
        );
        Ok(report)
    }

    /// Whether new operations are refused.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Refuse new operations and wait for in-flight ones to finish.
    pub async fn drain(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Draining lifecycle operations");
        let slots = self.config.max_concurrent_operations.max(1) as u32;
        match self.workers.acquire_many(slots).await {
            Ok(permits) => permits.forget(),
            Err(_) => debug!("Worker pool already closed"),
        }
        self.workers.close();
        info!("Lifecycle operations drained");
    }

    fn try_hold(&self, instance_id: Uuid) -> Option<OwnedMutexGuard<()>> {
        if self.is_shutting_down() {
            return None;
        }
        self.lock_for(instance_id).try_lock_owned().ok()
    }
}

#[async_trait]
impl InstanceSupervisor for Orchestrator {
    fn is_busy(&self, instance_id: Uuid) -> bool {
        self.locks
            .get(&instance_id)
            .is_some_and(|lock| lock.try_lock().is_err())
    }

    async fn report_fault(&self, instance_id: Uuid, fault: Fault) -> Result<bool> {
        let Some(_held) = self.try_hold(instance_id) else {
            debug!(instance_id = %instance_id, fault = %fault, "Instance busy; fault ignored");
            return Ok(false);
        };

        let mut instance = self.load(instance_id).await?;
        if !matches!(
            instance.status,
            InstanceStatus::Running | InstanceStatus::Stopped
        ) {
            debug!(instance_id = %instance_id, status = %instance.status, "Fault ignored for status");
            return Ok(false);
        }

        warn!(instance_id = %instance_id, fault = %fault, "Instance fault; moving to error");
        instance.status = InstanceStatus::Error;
        instance.failed_operation = Some(Operation::Start);
        instance.last_error = Some(fault.to_string());
        self.persist(&instance).await?;
        Ok(true)
    }

    async fn record_dns_verified(&self, instance_id: Uuid) -> Result<()> {
        let Some(_held) = self.try_hold(instance_id) else {
            return Ok(());
        };

        let mut instance = self.load(instance_id).await?;
        if instance.dns_degraded_since.is_none() || instance.status == InstanceStatus::Deleted {
            return Ok(());
        }
        instance.dns_degraded_since = None;
        self.persist(&instance).await?;
        debug!(instance_id = %instance_id, "DNS confirmed; degraded marker cleared");
        Ok(())
    }
}

fn skipped(instance: Instance) -> LifecycleOutcome {
    LifecycleOutcome {
        instance,
        dns: DnsOutcome::Skipped,
    }
}

fn note_dns(instance: &mut Instance, outcome: DnsOutcome) {
    match outcome {
        DnsOutcome::Verified => instance.dns_degraded_since = None,
        DnsOutcome::Degraded => {
            instance.dns_degraded_since.get_or_insert_with(Utc::now);
        }
        DnsOutcome::Skipped => {}
    }
}
