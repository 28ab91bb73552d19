// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test utilities for hostlane-orchestrator integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use uuid::Uuid;

use hostlane_orchestrator::container::MockContainerRuntime;
use hostlane_orchestrator::dns::{DnsReconciler, DnsReconcilerConfig, MockDnsProvider};
use hostlane_orchestrator::network::NetworkAllocator;
use hostlane_orchestrator::orchestrator::{Orchestrator, OrchestratorConfig};
use hostlane_orchestrator::retry::RetryPolicy;
use hostlane_orchestrator::store::{MemoryInstanceStore, MemoryUsageStore};
use hostlane_orchestrator::{CreateInstanceRequest, Instance, ResourceLimits};

/// Skip test if database URL not set.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_HOSTLANE_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_HOSTLANE_DATABASE_URL not set");
            return;
        }
    };
}

/// Get a database pool for testing, with migrations applied.
pub async fn get_test_pool() -> Option<PgPool> {
    let database_url = std::env::var("TEST_HOSTLANE_DATABASE_URL").ok()?;
    let pool = PgPool::connect(&database_url).await.ok()?;
    hostlane_orchestrator::migrations::run(&pool).await.ok()?;
    Some(pool)
}

/// Retry policy that gives up fast.
pub fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
    }
}

/// Reconciler configuration with millisecond retries.
pub fn fast_dns_config() -> DnsReconcilerConfig {
    DnsReconcilerConfig {
        add_retry: fast_policy(),
        verify: fast_policy(),
        call_timeout: Duration::from_secs(1),
        ..Default::default()
    }
}

/// Orchestrator wired to in-memory collaborators.
pub struct Harness {
    pub store: Arc<MemoryInstanceStore>,
    pub usage: Arc<MemoryUsageStore>,
    pub runtime: Arc<MockContainerRuntime>,
    pub dns: Arc<MockDnsProvider>,
    pub reconciler: Arc<DnsReconciler>,
    pub allocator: Arc<NetworkAllocator>,
    pub orchestrator: Arc<Orchestrator>,
}

impl Harness {
    /// Harness on `10.1.2.0/24`.
    pub fn new() -> Self {
        Self::build(MockContainerRuntime::new(), "10.1.2.0/24")
    }

    /// Harness on a custom subnet.
    pub fn with_subnet(cidr: &str) -> Self {
        Self::build(MockContainerRuntime::new(), cidr)
    }

    /// Harness whose container calls take `delay`.
    pub fn with_delay(delay: Duration) -> Self {
        Self::build(MockContainerRuntime::with_delay(delay), "10.1.2.0/24")
    }

    fn build(runtime: MockContainerRuntime, cidr: &str) -> Self {
        let store = Arc::new(MemoryInstanceStore::new());
        let usage = Arc::new(MemoryUsageStore::new());
        let runtime = Arc::new(runtime);
        let dns = Arc::new(MockDnsProvider::new());
        let reconciler = Arc::new(DnsReconciler::new(dns.clone(), fast_dns_config()));
        let allocator = Arc::new(NetworkAllocator::new(
            cidr.parse().expect("valid subnet"),
            Vec::new(),
        ));
        let orchestrator =
            Self::orchestrator_over(&store, &usage, &runtime, &reconciler, allocator.clone());

        Self {
            store,
            usage,
            runtime,
            dns,
            reconciler,
            allocator,
            orchestrator,
        }
    }

    fn orchestrator_over(
        store: &Arc<MemoryInstanceStore>,
        usage: &Arc<MemoryUsageStore>,
        runtime: &Arc<MockContainerRuntime>,
        reconciler: &Arc<DnsReconciler>,
        allocator: Arc<NetworkAllocator>,
    ) -> Arc<Orchestrator> {
        Arc::new(Orchestrator::new(
            store.clone(),
            usage.clone(),
            runtime.clone(),
            reconciler.clone(),
            allocator,
            OrchestratorConfig {
                call_timeout: Duration::from_secs(5),
                retry: fast_policy(),
                ..Default::default()
            },
        ))
    }

    /// A second orchestrator over the same store and runtime, with a fresh
    /// allocator, as after a process restart.
    pub fn restarted(&self) -> (Arc<Orchestrator>, Arc<NetworkAllocator>) {
        let allocator = Arc::new(NetworkAllocator::new(self.allocator.subnet(), Vec::new()));
        let orchestrator = Self::orchestrator_over(
            &self.store,
            &self.usage,
            &self.runtime,
            &self.reconciler,
            allocator.clone(),
        );
        (orchestrator, allocator)
    }

    /// Answer currently published for `label`.
    pub fn record(&self, label: &str) -> Option<String> {
        self.dns.answer(&format!("{}.docker", label))
    }

    /// Stored record for `id`.
    pub fn instance(&self, id: Uuid) -> Instance {
        self.store
            .all()
            .into_iter()
            .find(|i| i.id == id)
            .expect("instance stored")
    }

    /// Stored record with `subdomain`, newest first.
    pub fn by_subdomain(&self, subdomain: &str) -> Instance {
        let mut matching: Vec<Instance> = self
            .store
            .all()
            .into_iter()
            .filter(|i| i.subdomain == subdomain)
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching.into_iter().next().expect("instance stored")
    }

    /// Assert record invariants and address uniqueness across the store.
    pub fn assert_consistent(&self) {
        let mut seen = HashSet::new();
        for instance in self.store.all() {
            if let Err(e) = instance.check_invariants() {
                panic!("instance {} violates invariants: {}", instance.id, e);
            }
            if instance.deleted_at.is_none()
                && let Some(address) = instance.address
            {
                assert!(seen.insert(address), "address {} shared", address);
                assert_eq!(self.allocator.holder(address), Some(instance.id));
            }
        }
    }
}

/// Create request for `subdomain`.
pub fn request(subdomain: &str) -> CreateInstanceRequest {
    CreateInstanceRequest {
        owner_id: Uuid::new_v4(),
        name: format!("{} workspace", subdomain),
        description: String::new(),
        subdomain: subdomain.to_string(),
        limits: ResourceLimits {
            cpu_shares: 1.0,
            memory_mb: 512,
            storage_gb: 5,
        },
    }
}
