// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! DNS reconciler.
//!
//! Wraps a [`DnsProvider`] with the read-back verification that makes its
//! answers trustworthy, and computes/executes reconciliation sweeps.
//!
//! Lifecycle calls never fail because of DNS: an unverified add or delete
//! yields [`DnsOutcome::Degraded`] and the next sweep repairs it.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{DnsProvider, DnsRecord, Result, with_deadline};
use crate::instance::{Instance, InstanceStatus};
use crate::retry::{RetryPolicy, poll_until, retry};

/// Result of the DNS part of a lifecycle operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DnsOutcome {
    /// Read-back confirmed the provider state.
    Verified,
    /// The call or its verification did not succeed; left for the sweep.
    Degraded,
    /// The operation did not touch DNS.
    Skipped,
}

impl DnsOutcome {
    /// Whether the outcome needs the sweep's attention.
    pub fn is_degraded(&self) -> bool {
        matches!(self, DnsOutcome::Degraded)
    }
}

/// Reconciler configuration.
#[derive(Debug, Clone)]
pub struct DnsReconcilerConfig {
    /// Zone appended to every label (`<label>.<zone>`).
    pub zone: String,
    /// Full record names the sweep never deletes.
    pub protected: Vec<String>,
    /// Retries for add calls that fail transiently.
    pub add_retry: RetryPolicy,
    /// Read-back polling after add/delete.
    pub verify: RetryPolicy,
    /// Deadline for each provider call.
    pub call_timeout: Duration,
}

impl Default for DnsReconcilerConfig {
    fn default() -> Self {
        Self {
            zone: "docker".to_string(),
            protected: vec!["test.docker".to_string(), "test-record.docker".to_string()],
            add_retry: RetryPolicy::default(),
            verify: RetryPolicy {
                max_attempts: 5,
                base_delay: Duration::from_millis(200),
                max_delay: Duration::from_secs(1),
            },
            call_timeout: Duration::from_secs(10),
        }
    }
}

/// One instance as seen by a sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepTarget {
    /// Instance id.
    pub instance_id: Uuid,
    /// Subdomain label.
    pub label: String,
    /// Address the record should point at.
    pub address: Option<Ipv4Addr>,
    /// Status at snapshot time.
    pub status: InstanceStatus,
}

impl From<&Instance> for SweepTarget {
    fn from(instance: &Instance) -> Self {
        Self {
            instance_id: instance.id,
            label: instance.subdomain.clone(),
            address: instance.address,
            status: instance.status,
        }
    }
}

/// Actions a sweep will take.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepPlan {
    /// Record names with no owning instance.
    pub orphans: Vec<String>,
    /// Instances whose record is missing or points elsewhere.
    pub repairs: Vec<(Uuid, String, Ipv4Addr)>,
    /// Instances whose record already matches.
    pub confirmed: Vec<Uuid>,
    /// Instances left alone because an operation holds them.
    pub skipped_busy: Vec<Uuid>,
}

/// What a sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Records listed from the provider.
    pub records_seen: usize,
    /// Orphan records deleted (and verified gone).
    pub orphans_deleted: Vec<String>,
    /// Instances re-registered and verified.
    pub repaired: Vec<Uuid>,
    /// Instances whose record is now known to be correct (already correct or repaired).
    pub verified: Vec<Uuid>,
    /// Instances skipped because they were busy.
    pub skipped_busy: Vec<Uuid>,
    /// Actions that did not verify; retried next sweep.
    pub failures: Vec<String>,
}

/// DNS reconciler.
pub struct DnsReconciler {
    provider: Arc<dyn DnsProvider>,
    config: DnsReconcilerConfig,
}

impl DnsReconciler {
    /// Create a reconciler over `provider`.
    pub fn new(provider: Arc<dyn DnsProvider>, config: DnsReconcilerConfig) -> Self {
        Self { provider, config }
    }

    /// Underlying provider.
    pub fn provider(&self) -> &Arc<dyn DnsProvider> {
        &self.provider
    }

    /// Full record name for `label`.
    pub fn record_name(&self, label: &str) -> String {
        format!("{}.{}", label, self.config.zone)
    }

    /// Whether the sweep may delete `domain`.
    pub fn is_managed(&self, domain: &str) -> bool {
        let suffix = format!(".{}", self.config.zone);
        domain.ends_with(&suffix)
            && domain.len() > suffix.len()
            && !self.config.protected.iter().any(|p| p == domain)
    }

    async fn lookup(&self, domain: &str) -> Result<Option<DnsRecord>> {
        with_deadline(
            self.config.call_timeout,
            "dns get",
            self.provider.get_record(domain),
        )
        .await
    }

    async fn points_at(&self, domain: &str, address: Ipv4Addr) -> Result<bool> {
        Ok(self
            .lookup(domain)
            .await?
            .is_some_and(|r| r.address() == Some(address)))
    }

    async fn delete(&self, domain: &str) -> Result<()> {
        with_deadline(
            self.config.call_timeout,
            "dns delete",
            self.provider.delete_record(domain),
        )
        .await
    }

    /// Point `<label>.<zone>` at `address` and verify it.
    pub async fn register(&self, label: &str, address: Ipv4Addr) -> DnsOutcome {
        let domain = self.record_name(label);
        let record = DnsRecord::new(domain.clone(), address);

        match self.lookup(&domain).await {
            Ok(Some(existing)) if existing.address() == Some(address) => {
                debug!(domain = %domain, address = %address, "DNS record already present");
                return DnsOutcome::Verified;
            }
            Ok(Some(existing)) => {
                info!(
                    domain = %domain,
                    stale = %existing.answer,
                    address = %address,
                    "Replacing stale DNS record"
                );
                if let Err(e) = self.delete(&domain).await {
                    warn!(domain = %domain, error = %e, "Failed to delete stale DNS record");
                }
            }
            Ok(None) => {}
            Err(e) => debug!(domain = %domain, error = %e, "Pre-register lookup failed"),
        }

        let added = retry(
            self.config.add_retry,
            "dns add",
            |e: &super::DnsError| e.is_transient(),
            || {
                with_deadline(
                    self.config.call_timeout,
                    "dns add",
                    self.provider.add_record(&record),
                )
            },
        )
        .await;
        if let Err(e) = added {
            warn!(domain = %domain, address = %address, error = %e, "DNS add failed; leaving for sweep");
            return DnsOutcome::Degraded;
        }

        if poll_until(self.config.verify, || self.points_at(&domain, address)).await {
            info!(domain = %domain, address = %address, "DNS record registered");
            DnsOutcome::Verified
        } else {
            warn!(domain = %domain, address = %address, "DNS record not visible after add; degraded");
            DnsOutcome::Degraded
        }
    }

    /// Remove `<label>.<zone>` and verify it is gone.
    pub async fn unregister(&self, label: &str) -> DnsOutcome {
        let domain = self.record_name(label);

        if let Err(e) = self.delete(&domain).await {
            warn!(domain = %domain, error = %e, "DNS delete failed; leaving for sweep");
            return DnsOutcome::Degraded;
        }

        let gone = poll_until(self.config.verify, || async {
            self.lookup(&domain).await.map(|r| r.is_none())
        })
        .await;

        if gone {
            info!(domain = %domain, "DNS record removed");
            DnsOutcome::Verified
        } else {
            warn!(domain = %domain, "DNS record still present after delete; leaving for sweep");
            DnsOutcome::Degraded
        }
    }

    /// Check `<label>.<zone>` and re-register it if missing or wrong.
    pub async fn ensure(&self, label: &str, address: Ipv4Addr) -> DnsOutcome {
        let domain = self.record_name(label);
        match self.points_at(&domain, address).await {
            Ok(true) => DnsOutcome::Verified,
            Ok(false) => {
                info!(domain = %domain, address = %address, "DNS drift detected; re-registering");
                self.register(label, address).await
            }
            Err(e) => {
                warn!(domain = %domain, error = %e, "DNS check failed");
                self.register(label, address).await
            }
        }
    }

    /// Compute the sweep plan for `records` against an instance snapshot.
    pub fn plan(
        &self,
        records: &[DnsRecord],
        instances: &[SweepTarget],
        is_busy: impl Fn(Uuid) -> bool,
    ) -> SweepPlan {
        let mut plan = SweepPlan::default();

        // Every live instance owns its name, whether or not it holds an address yet.
        let mut owners: HashMap<String, &SweepTarget> = HashMap::new();
        for target in instances.iter().filter(|t| t.status != InstanceStatus::Deleted) {
            owners.insert(self.record_name(&target.label), target);
        }
        let busy: HashSet<Uuid> = instances
            .iter()
            .map(|t| t.instance_id)
            .filter(|id| is_busy(*id))
            .collect();

        let mut by_domain: HashMap<&str, Vec<&DnsRecord>> = HashMap::new();
        for record in records {
            by_domain.entry(record.domain.as_str()).or_default().push(record);
        }

        for domain in by_domain.keys() {
            if !self.is_managed(domain) {
                continue;
            }
            match owners.get(*domain) {
                Some(owner) if owner.address.is_some() => {}
                Some(owner) if busy.contains(&owner.instance_id) => {}
                _ => plan.orphans.push(domain.to_string()),
            }
        }
        plan.orphans.sort();

        for target in instances {
            if !matches!(target.status, InstanceStatus::Running | InstanceStatus::Stopped) {
                continue;
            }
            let Some(address) = target.address else {
                continue;
            };
            if busy.contains(&target.instance_id) {
                plan.skipped_busy.push(target.instance_id);
                continue;
            }

            let domain = self.record_name(&target.label);
            let correct = by_domain.get(domain.as_str()).is_some_and(|rs| {
                rs.len() == 1 && rs[0].address() == Some(address)
            });
            if correct {
                plan.confirmed.push(target.instance_id);
            } else {
                plan.repairs
                    .push((target.instance_id, target.label.clone(), address));
            }
        }

        plan
    }

    /// Run one reconciliation sweep.
    ///
    /// Records are listed before `instances` is consulted, so anything
    /// registered after the listing is simply not seen this round.
    pub async fn sweep<F, Fut>(
        &self,
        load_instances: F,
        is_busy: impl Fn(Uuid) -> bool,
    ) -> std::result::Result<SweepReport, crate::error::Error>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = crate::error::Result<Vec<SweepTarget>>>,
    {
        let records = with_deadline(
            self.config.call_timeout,
            "dns list",
            self.provider.list_records(),
        )
        .await?;
        let instances = load_instances().await?;

        let plan = self.plan(&records, &instances, &is_busy);
        let mut report = SweepReport {
            records_seen: records.len(),
            verified: plan.confirmed.clone(),
            skipped_busy: plan.skipped_busy.clone(),
            ..Default::default()
        };

        for domain in &plan.orphans {
            if let Err(e) = self.delete(domain).await {
                warn!(domain = %domain, error = %e, "Failed to delete orphan DNS record");
                report.failures.push(format!("delete {}: {}", domain, e));
                continue;
            }
            let gone = poll_until(self.config.verify, || async {
                self.lookup(domain).await.map(|r| r.is_none())
            })
            .await;
            if gone {
                info!(domain = %domain, "Deleted orphan DNS record");
                report.orphans_deleted.push(domain.clone());
            } else {
                report
                    .failures
                    .push(format!("delete {}: still present", domain));
            }
        }

        for (instance_id, label, address) in &plan.repairs {
            // A lifecycle operation may have started since the snapshot.
            if is_busy(*instance_id) {
                report.skipped_busy.push(*instance_id);
                continue;
            }
            match self.register(label, *address).await {
                DnsOutcome::Verified => {
                    report.repaired.push(*instance_id);
                    report.verified.push(*instance_id);
                }
                _ => report
                    .failures
                    .push(format!("register {} -> {}: unverified", label, address)),
            }
        }

        info!(
            records = report.records_seen,
            orphans_deleted = report.orphans_deleted.len(),
            repaired = report.repaired.len(),
            skipped_busy = report.skipped_busy.len(),
            failures = report.failures.len(),
            "DNS sweep finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::MockDnsProvider;

    fn fast_config() -> DnsReconcilerConfig {
        DnsReconcilerConfig {
            add_retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
            verify: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
            ..Default::default()
        }
    }

    fn reconciler(dns: &Arc<MockDnsProvider>) -> DnsReconciler {
        DnsReconciler::new(dns.clone(), fast_config())
    }

    fn target(label: &str, last_octet: Option<u8>, status: InstanceStatus) -> SweepTarget {
        SweepTarget {
            instance_id: Uuid::new_v4(),
            label: label.to_string(),
            address: last_octet.map(|o| Ipv4Addr::new(10, 1, 2, o)),
            status,
        }
    }

    fn record(domain: &str, answer: &str) -> DnsRecord {
        DnsRecord {
            domain: domain.into(),
            answer: answer.into(),
        }
    }

    #[test]
    fn test_is_managed() {
        let dns = Arc::new(MockDnsProvider::new());
        let r = reconciler(&dns);
        assert!(r.is_managed("acme.docker"));
        assert!(!r.is_managed("test.docker"));
        assert!(!r.is_managed("test-record.docker"));
        assert!(!r.is_managed("acme.example.com"));
        assert!(!r.is_managed(".docker"));
    }

    #[tokio::test]
    async fn test_register_verifies() {
        let dns = Arc::new(MockDnsProvider::new());
        let outcome = reconciler(&dns)
            .register("acme", Ipv4Addr::new(10, 1, 2, 1))
            .await;
        assert_eq!(outcome, DnsOutcome::Verified);
        assert_eq!(dns.answer("acme.docker").as_deref(), Some("10.1.2.1"));
    }

    #[tokio::test]
    async fn test_register_retries_transient_add() {
        let dns = Arc::new(MockDnsProvider::new());
        dns.fail_adds(2);
        let outcome = reconciler(&dns)
            .register("acme", Ipv4Addr::new(10, 1, 2, 1))
            .await;
        assert_eq!(outcome, DnsOutcome::Verified);
        assert_eq!(dns.add_calls(), 3);
    }

    #[tokio::test]
    async fn test_register_degrades_when_never_visible() {
        let dns = Arc::new(MockDnsProvider::new());
        dns.lag_adds(100);
        let outcome = reconciler(&dns)
            .register("acme", Ipv4Addr::new(10, 1, 2, 1))
            .await;
        assert_eq!(outcome, DnsOutcome::Degraded);
    }

    #[tokio::test]
    async fn test_register_degrades_when_provider_down() {
        let dns = Arc::new(MockDnsProvider::new());
        dns.set_unavailable(true);
        let outcome = reconciler(&dns)
            .register("acme", Ipv4Addr::new(10, 1, 2, 1))
            .await;
        assert_eq!(outcome, DnsOutcome::Degraded);
    }

    #[tokio::test]
    async fn test_register_replaces_stale_answer() {
        let dns = Arc::new(MockDnsProvider::new());
        dns.insert("acme.docker", "10.1.2.9");
        let outcome = reconciler(&dns)
            .register("acme", Ipv4Addr::new(10, 1, 2, 1))
            .await;
        assert_eq!(outcome, DnsOutcome::Verified);
        assert_eq!(dns.answer("acme.docker").as_deref(), Some("10.1.2.1"));
    }

    #[tokio::test]
    async fn test_unregister_detects_lying_delete() {
        let dns = Arc::new(MockDnsProvider::new());
        dns.insert("acme.docker", "10.1.2.1");
        dns.lie_on_deletes(1);
        let outcome = reconciler(&dns).unregister("acme").await;
        assert_eq!(outcome, DnsOutcome::Degraded);
        assert!(dns.answer("acme.docker").is_some());
    }

    #[test]
    fn test_plan() {
        let dns = Arc::new(MockDnsProvider::new());
        let r = reconciler(&dns);

        let running = target("acme", Some(1), InstanceStatus::Running);
        let drifted = target("globex", Some(2), InstanceStatus::Stopped);
        let missing = target("initech", Some(3), InstanceStatus::Running);
        let errored = target("hooli", Some(4), InstanceStatus::Error);
        let busy = target("umbrella", Some(5), InstanceStatus::Running);
        let deleted = target("gone", None, InstanceStatus::Deleted);

        let records = vec![
            record("acme.docker", "10.1.2.1"),
            record("globex.docker", "10.1.2.99"),
            record("hooli.docker", "10.1.2.4"),
            record("gone.docker", "10.1.2.6"),
            record("stray.docker", "10.1.2.7"),
            record("test.docker", "10.1.2.250"),
            record("intranet.corp", "192.168.0.1"),
        ];
        let instances = vec![
            running.clone(),
            drifted.clone(),
            missing.clone(),
            errored,
            busy.clone(),
            deleted,
        ];
        let busy_id = busy.instance_id;
        let plan = r.plan(&records, &instances, |id| id == busy_id);

        assert_eq!(plan.orphans, vec!["gone.docker".to_string(), "stray.docker".to_string()]);
        assert_eq!(plan.confirmed, vec![running.instance_id]);
        assert_eq!(plan.skipped_busy, vec![busy_id]);
        let repaired: Vec<Uuid> = plan.repairs.iter().map(|(id, _, _)| *id).collect();
        assert_eq!(repaired, vec![drifted.instance_id, missing.instance_id]);
    }

    #[test]
    fn test_plan_keeps_record_of_busy_instance_without_address() {
        let dns = Arc::new(MockDnsProvider::new());
        let r = reconciler(&dns);
        let creating = target("acme", None, InstanceStatus::Pending);
        let records = vec![record("acme.docker", "10.1.2.1")];
        let id = creating.instance_id;

        let plan = r.plan(&records, std::slice::from_ref(&creating), |x| x == id);
        assert!(plan.orphans.is_empty());

        let plan = r.plan(&records, &[creating], |_| false);
        assert_eq!(plan.orphans, vec!["acme.docker".to_string()]);
    }

    #[tokio::test]
    async fn test_sweep_heals_drift() {
        let dns = Arc::new(MockDnsProvider::new());
        dns.insert("stray.docker", "10.1.2.7");
        dns.insert("globex.docker", "10.1.2.99");
        let r = reconciler(&dns);

        let drifted = target("globex", Some(2), InstanceStatus::Running);
        let missing = target("initech", Some(3), InstanceStatus::Running);
        let snapshot = vec![drifted.clone(), missing.clone()];

        let report = r
            .sweep(|| async move { Ok(snapshot) }, |_| false)
            .await
            .unwrap();

        assert_eq!(report.orphans_deleted, vec!["stray.docker".to_string()]);
        assert_eq!(report.repaired.len(), 2);
        assert!(report.failures.is_empty());
        assert_eq!(dns.answer("globex.docker").as_deref(), Some("10.1.2.2"));
        assert_eq!(dns.answer("initech.docker").as_deref(), Some("10.1.2.3"));
        assert!(dns.answer("stray.docker").is_none());
    }
}
