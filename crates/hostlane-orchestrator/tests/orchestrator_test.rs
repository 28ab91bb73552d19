// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifecycle tests against in-memory collaborators.
//!
//! Every test ends with the store consistent: no address without a
//! container, no two live instances sharing an address, and the allocator
//! agreeing with the records.

mod common;

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::time::Duration;

use common::{Harness, request};
use hostlane_orchestrator::container::FailPoint;
use hostlane_orchestrator::dns::DnsOutcome;
use hostlane_orchestrator::instance::InstanceFilter;
use hostlane_orchestrator::store::{InstanceStore, UsageStore};
use hostlane_orchestrator::subdomain::validate_label;
use hostlane_orchestrator::usage::ResourceUsageSample;
use hostlane_orchestrator::{Error, ErrorClass, Instance, InstanceStatus, Operation};

fn addr(last: u8) -> Ipv4Addr {
    Ipv4Addr::new(10, 1, 2, last)
}

#[tokio::test]
async fn test_create_runs_instance_with_first_address() {
    let h = Harness::new();

    let outcome = h.orchestrator.create(request("acme")).await.unwrap();
    let instance = outcome.instance;

    assert_eq!(instance.status, InstanceStatus::Running);
    assert_eq!(instance.address, Some(addr(1)));
    assert_eq!(outcome.dns, DnsOutcome::Verified);
    assert_eq!(h.record("acme").as_deref(), Some("10.1.2.1"));
    assert!(instance.dns_degraded_since.is_none());

    let container = h
        .runtime
        .container(instance.container_id.as_deref().unwrap())
        .unwrap();
    assert!(container.running);
    assert_eq!(container.spec.address, addr(1));
    assert_eq!(container.spec.name, instance.container_name());

    assert_eq!(h.orchestrator.get(instance.id).await.unwrap(), h.instance(instance.id));
    h.assert_consistent();
}

#[tokio::test]
async fn test_two_concurrent_creates_get_distinct_addresses() {
    let h = Harness::new();

    let (a, b) = tokio::join!(
        h.orchestrator.create(request("acme")),
        h.orchestrator.create(request("globex"))
    );
    let a = a.unwrap().instance;
    let b = b.unwrap().instance;

    let addresses: HashSet<Ipv4Addr> = [a.address.unwrap(), b.address.unwrap()].into();
    assert_eq!(addresses, HashSet::from([addr(1), addr(2)]));
    assert_eq!(h.record("acme"), a.address.map(|a| a.to_string()));
    assert_eq!(h.record("globex"), b.address.map(|a| a.to_string()));
    h.assert_consistent();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creates_never_share_address() {
    // /29 has six host addresses.
    let h = Harness::with_subnet("10.1.2.0/29");

    let tasks: Vec<_> = (0..10)
        .map(|n| {
            let orchestrator = h.orchestrator.clone();
            tokio::spawn(async move { orchestrator.create(request(&format!("tenant-{}", n))).await })
        })
        .collect();

    let mut running = Vec::new();
    let mut exhausted = 0;
    for task in futures::future::join_all(tasks).await {
        match task.unwrap() {
            Ok(outcome) => running.push(outcome.instance),
            Err(e) => {
                assert!(e.is_capacity_exhausted(), "unexpected error: {}", e);
                exhausted += 1;
            }
        }
    }

    assert_eq!(running.len(), 6);
    assert_eq!(exhausted, 4);
    let addresses: HashSet<Ipv4Addr> = running.iter().filter_map(|i| i.address).collect();
    assert_eq!(addresses.len(), 6);
    assert_eq!(h.runtime.container_count(), 6);
    assert_eq!(h.allocator.available_count(), 0);

    let failed = h
        .orchestrator
        .list(&InstanceFilter::with_status(InstanceStatus::Error))
        .await
        .unwrap();
    assert_eq!(failed.len(), 4);
    assert!(failed.iter().all(|i| i.address.is_none() && i.container_id.is_none()));
    h.assert_consistent();
}

#[tokio::test]
async fn test_capacity_exhausted_is_classified() {
    // /30 has two host addresses.
    let h = Harness::with_subnet("10.1.2.0/30");
    h.orchestrator.create(request("a")).await.unwrap();
    h.orchestrator.create(request("b")).await.unwrap();

    let err = h.orchestrator.create(request("c")).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Capacity);

    let failed = h.by_subdomain("c");
    assert_eq!(failed.status, InstanceStatus::Error);
    assert_eq!(failed.failed_operation, Some(Operation::Create));
    assert_eq!(h.runtime.container_count(), 2);
    h.assert_consistent();
}

#[tokio::test]
async fn test_duplicate_subdomain_rejected() {
    let h = Harness::new();
    h.orchestrator.create(request("acme")).await.unwrap();

    let err = h.orchestrator.create(request("acme")).await.unwrap_err();
    assert!(matches!(err, Error::DuplicateSubdomain(ref s) if s == "acme"));
    assert_eq!(h.store.all().len(), 1);
    assert_eq!(h.runtime.container_count(), 1);
}

#[tokio::test]
async fn test_invalid_requests_rejected_before_any_side_effect() {
    let h = Harness::new();

    let err = h.orchestrator.create(request("Acme!")).await.unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));

    let mut blank = request("acme");
    blank.name = "  ".into();
    assert!(matches!(
        h.orchestrator.create(blank).await,
        Err(Error::InvalidRequest(_))
    ));

    // Would overflow the byte count handed to the runtime.
    let mut huge = request("acme");
    huge.limits.memory_mb = i64::MAX / 1024;
    assert!(matches!(
        h.orchestrator.create(huge).await,
        Err(Error::InvalidRequest(ref m)) if m.contains("memory_mb")
    ));

    assert!(h.store.all().is_empty());
    assert_eq!(h.allocator.allocated_count(), 0);
    assert_eq!(h.dns.add_calls(), 0);
}

#[tokio::test]
async fn test_stop_then_start_keeps_address_and_subdomain() {
    let h = Harness::new();
    let created = h.orchestrator.create(request("acme")).await.unwrap().instance;
    let container_id = created.container_id.clone().unwrap();

    let stopped = h.orchestrator.stop(created.id).await.unwrap();
    assert_eq!(stopped.dns, DnsOutcome::Skipped);
    assert_eq!(stopped.instance.status, InstanceStatus::Stopped);
    assert_eq!(stopped.instance.address, created.address);
    assert!(!h.runtime.container(&container_id).unwrap().running);
    // The record is retained while stopped.
    assert_eq!(h.record("acme").as_deref(), Some("10.1.2.1"));
    h.assert_consistent();

    let started = h.orchestrator.start(created.id).await.unwrap();
    assert_eq!(started.instance.status, InstanceStatus::Running);
    assert_eq!(started.instance.address, created.address);
    assert_eq!(started.instance.subdomain, "acme");
    assert_eq!(started.instance.container_id, Some(container_id.clone()));
    assert_eq!(started.dns, DnsOutcome::Verified);

    let container = h.runtime.container(&container_id).unwrap();
    assert!(container.running);
    assert_eq!(container.start_count, 2);
    h.assert_consistent();
}

#[tokio::test]
async fn test_start_repairs_dns_drift() {
    let h = Harness::new();
    let id = h.orchestrator.create(request("acme")).await.unwrap().instance.id;
    h.orchestrator.stop(id).await.unwrap();

    h.dns.insert("acme.docker", "10.1.2.200");
    let started = h.orchestrator.start(id).await.unwrap();

    assert_eq!(started.dns, DnsOutcome::Verified);
    assert_eq!(h.record("acme").as_deref(), Some("10.1.2.1"));
}

#[tokio::test]
async fn test_invalid_transitions_rejected() {
    let h = Harness::new();
    let id = h.orchestrator.create(request("acme")).await.unwrap().instance.id;

    let err = h.orchestrator.start(id).await.unwrap_err();
    assert!(matches!(err, Error::InvalidTransition(_)));
    assert_eq!(err.class(), ErrorClass::Conflict);

    h.orchestrator.stop(id).await.unwrap();
    assert!(matches!(
        h.orchestrator.stop(id).await,
        Err(Error::InvalidTransition(_))
    ));
    assert!(matches!(
        h.orchestrator.retry_create(id).await,
        Err(Error::InvalidTransition(_))
    ));
    assert_eq!(h.instance(id).status, InstanceStatus::Stopped);
}

#[tokio::test]
async fn test_unknown_instance() {
    let h = Harness::new();
    let id = uuid::Uuid::new_v4();
    assert!(matches!(h.orchestrator.start(id).await, Err(Error::InstanceNotFound(i)) if i == id));
    assert!(matches!(h.orchestrator.get(id).await, Err(Error::InstanceNotFound(_))));
}

#[tokio::test]
async fn test_delete_tears_down_and_is_idempotent() {
    let h = Harness::new();
    let created = h.orchestrator.create(request("acme")).await.unwrap().instance;

    let deleted = h.orchestrator.delete(created.id).await.unwrap();
    assert_eq!(deleted.dns, DnsOutcome::Verified);
    assert_eq!(deleted.instance.status, InstanceStatus::Deleted);
    assert!(deleted.instance.deleted_at.is_some());
    assert!(deleted.instance.address.is_none());
    assert!(deleted.instance.container_id.is_none());
    assert_eq!(h.runtime.container_count(), 0);
    assert_eq!(h.allocator.holder(addr(1)), None);
    assert_eq!(h.record("acme"), None);

    let again = h.orchestrator.delete(created.id).await.unwrap();
    assert_eq!(again.dns, DnsOutcome::Skipped);
    assert_eq!(again.instance.deleted_at, deleted.instance.deleted_at);

    // Soft-deleted: hidden from default listings, still readable.
    assert!(h.orchestrator.list(&InstanceFilter::default()).await.unwrap().is_empty());
    assert_eq!(
        h.orchestrator.get(created.id).await.unwrap().status,
        InstanceStatus::Deleted
    );
    h.assert_consistent();
}

#[tokio::test]
async fn test_deleted_address_and_subdomain_are_reused() {
    let h = Harness::new();
    let first = h.orchestrator.create(request("acme")).await.unwrap().instance;
    h.orchestrator.delete(first.id).await.unwrap();

    let second = h.orchestrator.create(request("acme")).await.unwrap().instance;
    assert_ne!(second.id, first.id);
    assert_eq!(second.address, Some(addr(1)));
    assert_eq!(h.record("acme").as_deref(), Some("10.1.2.1"));
    h.assert_consistent();
}

#[tokio::test]
async fn test_start_failure_during_create_is_compensated() {
    let h = Harness::new();
    h.runtime.fail_next(FailPoint::Start, 1);

    let err = h.orchestrator.create(request("acme")).await.unwrap_err();
    assert!(matches!(err, Error::Container(_)));

    let failed = h.by_subdomain("acme");
    assert_eq!(failed.status, InstanceStatus::Error);
    assert_eq!(failed.failed_operation, Some(Operation::Create));
    assert!(failed.last_error.is_some());
    assert!(failed.container_id.is_none());
    assert!(failed.address.is_none());
    assert_eq!(h.runtime.container_count(), 0);
    assert_eq!(h.allocator.allocated_count(), 0);
    assert_eq!(h.record("acme"), None);
    h.assert_consistent();

    let retried = h.orchestrator.retry_create(failed.id).await.unwrap();
    assert_eq!(retried.instance.status, InstanceStatus::Running);
    assert_eq!(retried.instance.address, Some(addr(1)));
    assert!(retried.instance.failed_operation.is_none());
    assert!(retried.instance.last_error.is_none());
    assert_eq!(h.runtime.container_count(), 1);
    h.assert_consistent();
}

#[tokio::test]
async fn test_create_failure_releases_address() {
    let h = Harness::new();
    h.runtime.fail_next(FailPoint::Create, 1);

    assert!(h.orchestrator.create(request("acme")).await.is_err());
    assert_eq!(h.allocator.allocated_count(), 0);

    let next = h.orchestrator.create(request("globex")).await.unwrap().instance;
    assert_eq!(next.address, Some(addr(1)));
    h.assert_consistent();
}

#[tokio::test]
async fn test_failed_removal_keeps_container_and_address_on_record() {
    let h = Harness::new();
    h.runtime.fail_next(FailPoint::Start, 1);
    h.runtime.fail_next(FailPoint::Remove, 1);

    assert!(h.orchestrator.create(request("acme")).await.is_err());

    let failed = h.by_subdomain("acme");
    assert_eq!(failed.status, InstanceStatus::Error);
    assert!(failed.container_id.is_some());
    assert_eq!(failed.address, Some(addr(1)));
    assert_eq!(h.allocator.holder(addr(1)), Some(failed.id));
    assert_eq!(h.runtime.container_count(), 1);
    h.assert_consistent();

    // The retry reuses what the failure left behind.
    let retried = h.orchestrator.retry_create(failed.id).await.unwrap().instance;
    assert_eq!(retried.container_id, failed.container_id);
    assert_eq!(retried.address, Some(addr(1)));
    assert_eq!(h.runtime.container_count(), 1);
    assert_eq!(h.runtime.running_count(), 1);
    h.assert_consistent();
}

#[tokio::test]
async fn test_store_failure_during_create_is_compensated() {
    let h = Harness::new();
    h.store.fail_updates(1);

    assert!(matches!(
        h.orchestrator.create(request("acme")).await,
        Err(Error::Store(_))
    ));

    let failed = h.by_subdomain("acme");
    assert_eq!(failed.status, InstanceStatus::Error);
    assert_eq!(h.runtime.container_count(), 0);
    assert_eq!(h.allocator.allocated_count(), 0);
    h.assert_consistent();
}

#[tokio::test]
async fn test_empty_subdomain_gets_suggested_label() {
    let h = Harness::new();

    let instance = h.orchestrator.create(request("")).await.unwrap().instance;
    assert!(validate_label(&instance.subdomain).is_ok());
    assert!(instance.subdomain.contains('-'));
    assert_eq!(h.record(&instance.subdomain).as_deref(), Some("10.1.2.1"));
    h.assert_consistent();
}

#[tokio::test]
async fn test_transient_runtime_failures_are_retried() {
    let h = Harness::new();
    h.runtime.fail_transient(FailPoint::Create, 1);
    h.runtime.fail_transient(FailPoint::Start, 1);

    let instance = h.orchestrator.create(request("acme")).await.unwrap().instance;
    assert_eq!(instance.status, InstanceStatus::Running);
    assert_eq!(instance.address, Some(addr(1)));
    let container = h.runtime.container_for_instance(instance.id).unwrap();
    assert!(container.running);
    assert_eq!(container.start_count, 1);
    assert_eq!(h.runtime.container_count(), 1);

    h.runtime.fail_transient(FailPoint::Stop, 2);
    let stopped = h.orchestrator.stop(instance.id).await.unwrap().instance;
    assert_eq!(stopped.status, InstanceStatus::Stopped);

    h.runtime.fail_transient(FailPoint::Remove, 1);
    let deleted = h.orchestrator.delete(instance.id).await.unwrap().instance;
    assert_eq!(deleted.status, InstanceStatus::Deleted);
    assert_eq!(h.runtime.container_count(), 0);
    h.assert_consistent();
}

#[tokio::test]
async fn test_exhausted_transient_retries_are_compensated() {
    let h = Harness::new();
    h.runtime.fail_transient(FailPoint::Start, 3);

    let err = h.orchestrator.create(request("acme")).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Transient);

    let failed = h.by_subdomain("acme");
    assert_eq!(failed.status, InstanceStatus::Error);
    assert_eq!(failed.failed_operation, Some(Operation::Create));
    assert_eq!(h.runtime.container_count(), 0);
    assert_eq!(h.allocator.allocated_count(), 0);
    h.assert_consistent();
}

#[tokio::test(start_paused = true)]
async fn test_hung_runtime_call_times_out_and_is_compensated() {
    let h = Harness::new();
    h.runtime.hang(FailPoint::Start, Duration::from_secs(60));

    let err = h.orchestrator.create(request("acme")).await.unwrap_err();
    assert!(matches!(err, Error::Container(ref e) if e.is_transient()));

    let failed = h.by_subdomain("acme");
    assert_eq!(failed.status, InstanceStatus::Error);
    assert_eq!(failed.failed_operation, Some(Operation::Create));
    assert!(failed.last_error.unwrap().contains("timed out"));
    assert!(failed.container_id.is_none());
    assert!(failed.address.is_none());
    assert_eq!(h.runtime.container_count(), 0);
    assert_eq!(h.allocator.allocated_count(), 0);
    assert_eq!(h.record("acme"), None);
    h.assert_consistent();

    h.runtime.clear_hang(FailPoint::Start);
    let retried = h.orchestrator.retry_create(failed.id).await.unwrap();
    assert_eq!(retried.instance.status, InstanceStatus::Running);
    assert_eq!(retried.instance.address, Some(addr(1)));
    h.assert_consistent();
}

#[tokio::test]
async fn test_dns_outage_does_not_fail_create() {
    let h = Harness::new();
    h.dns.set_unavailable(true);

    let outcome = h.orchestrator.create(request("acme")).await.unwrap();
    assert_eq!(outcome.dns, DnsOutcome::Degraded);
    assert_eq!(outcome.instance.status, InstanceStatus::Running);
    assert!(outcome.instance.dns_degraded_since.is_some());
    assert_eq!(h.record("acme"), None);
    h.assert_consistent();
}

#[tokio::test]
async fn test_transient_dns_add_failure_is_retried() {
    let h = Harness::new();
    h.dns.fail_adds(1);

    let outcome = h.orchestrator.create(request("acme")).await.unwrap();
    assert_eq!(outcome.dns, DnsOutcome::Verified);
    assert_eq!(h.dns.add_calls(), 2);
}

#[tokio::test]
async fn test_second_operation_on_busy_instance_fails_fast() {
    let h = Harness::with_delay(Duration::from_millis(150));
    let id = h.orchestrator.create(request("acme")).await.unwrap().instance.id;

    let orchestrator = h.orchestrator.clone();
    let stopping = tokio::spawn(async move { orchestrator.stop(id).await });
    tokio::time::sleep(Duration::from_millis(30)).await;

    let err = h.orchestrator.start(id).await.unwrap_err();
    assert!(matches!(err, Error::OperationInProgress(i) if i == id));
    assert!(matches!(
        h.orchestrator.delete(id).await,
        Err(Error::OperationInProgress(_))
    ));

    let stopped = stopping.await.unwrap().unwrap();
    assert_eq!(stopped.instance.status, InstanceStatus::Stopped);
    h.orchestrator.start(id).await.unwrap();
}

#[tokio::test]
async fn test_failed_stop_must_be_retried() {
    let h = Harness::new();
    let id = h.orchestrator.create(request("acme")).await.unwrap().instance.id;
    h.runtime.fail_next(FailPoint::Stop, 1);

    assert!(h.orchestrator.stop(id).await.is_err());
    let failed = h.instance(id);
    assert_eq!(failed.status, InstanceStatus::Error);
    assert_eq!(failed.failed_operation, Some(Operation::Stop));
    assert!(failed.address.is_some());

    assert!(matches!(
        h.orchestrator.start(id).await,
        Err(Error::InvalidTransition(_))
    ));

    let stopped = h.orchestrator.stop(id).await.unwrap().instance;
    assert_eq!(stopped.status, InstanceStatus::Stopped);
    assert!(stopped.failed_operation.is_none());
    h.assert_consistent();
}

#[tokio::test]
async fn test_failed_delete_keeps_resources_until_retried() {
    let h = Harness::new();
    let id = h.orchestrator.create(request("acme")).await.unwrap().instance.id;
    h.runtime.fail_next(FailPoint::Remove, 1);

    assert!(h.orchestrator.delete(id).await.is_err());
    let failed = h.instance(id);
    assert_eq!(failed.status, InstanceStatus::Error);
    assert_eq!(failed.failed_operation, Some(Operation::Delete));
    assert_eq!(failed.address, Some(addr(1)));
    assert!(failed.deleted_at.is_none());
    h.assert_consistent();

    let deleted = h.orchestrator.delete(id).await.unwrap().instance;
    assert_eq!(deleted.status, InstanceStatus::Deleted);
    assert_eq!(h.runtime.container_count(), 0);
    h.assert_consistent();
}

#[tokio::test]
async fn test_recover_rebuilds_allocator_and_fails_interrupted_creates() {
    let h = Harness::new();
    let running = h.orchestrator.create(request("acme")).await.unwrap().instance;

    let interrupted = Instance::new_pending(&request("beta"), 5678);
    h.store.insert(&interrupted).await.unwrap();

    let (orchestrator, allocator) = h.restarted();
    let report = orchestrator.recover().await.unwrap();

    assert_eq!(report.addresses_claimed, 1);
    assert!(report.conflicts.is_empty());
    assert_eq!(report.interrupted, vec![interrupted.id]);
    assert_eq!(allocator.holder(addr(1)), Some(running.id));

    let failed = h.instance(interrupted.id);
    assert_eq!(failed.status, InstanceStatus::Error);
    assert_eq!(failed.failed_operation, Some(Operation::Create));
    assert_eq!(failed.last_error.as_deref(), Some("creation interrupted by restart"));

    let fresh = orchestrator.create(request("gamma")).await.unwrap().instance;
    assert_eq!(fresh.address, Some(addr(2)));

    let resumed = orchestrator.retry_create(interrupted.id).await.unwrap().instance;
    assert_eq!(resumed.status, InstanceStatus::Running);
    assert_eq!(resumed.address, Some(addr(3)));
}

#[tokio::test]
async fn test_drain_refuses_new_operations() {
    let h = Harness::new();
    let id = h.orchestrator.create(request("acme")).await.unwrap().instance.id;

    h.orchestrator.drain().await;
    assert!(h.orchestrator.is_shutting_down());

    assert!(matches!(
        h.orchestrator.create(request("globex")).await,
        Err(Error::ShuttingDown)
    ));
    assert!(matches!(h.orchestrator.stop(id).await, Err(Error::ShuttingDown)));
    // Reads still work.
    assert_eq!(h.orchestrator.get(id).await.unwrap().status, InstanceStatus::Running);
}

#[tokio::test]
async fn test_drain_waits_for_in_flight_operation() {
    let h = Harness::with_delay(Duration::from_millis(100));
    let id = h.orchestrator.create(request("acme")).await.unwrap().instance.id;

    let orchestrator = h.orchestrator.clone();
    let stopping = tokio::spawn(async move { orchestrator.stop(id).await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    h.orchestrator.drain().await;
    assert_eq!(h.instance(id).status, InstanceStatus::Stopped);
    assert!(stopping.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_list_filters_by_owner_and_status() {
    let h = Harness::new();
    let mut owned = request("acme");
    let owner = owned.owner_id;
    let a = h.orchestrator.create(owned.clone()).await.unwrap().instance;
    owned.subdomain = "acme-2".into();
    let b = h.orchestrator.create(owned).await.unwrap().instance;
    h.orchestrator.create(request("globex")).await.unwrap();
    h.orchestrator.stop(b.id).await.unwrap();

    let mine = h
        .orchestrator
        .list(&InstanceFilter {
            owner_id: Some(owner),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(mine.len(), 2);

    let stopped = h
        .orchestrator
        .list(&InstanceFilter::with_status(InstanceStatus::Stopped))
        .await
        .unwrap();
    assert_eq!(stopped.iter().map(|i| i.id).collect::<Vec<_>>(), vec![b.id]);

    let page = h
        .orchestrator
        .list(&InstanceFilter {
            limit: 1,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page.len(), 1);
    assert_ne!(page[0].id, a.id);
}

#[tokio::test]
async fn test_usage_reads() {
    let h = Harness::new();
    let id = h.orchestrator.create(request("acme")).await.unwrap().instance.id;

    let now = chrono::Utc::now();
    for (minutes_ago, cpu) in [(20, 0.2), (10, 0.4), (1, 0.6)] {
        h.usage
            .append(&ResourceUsageSample {
                instance_id: id,
                sampled_at: now - chrono::Duration::minutes(minutes_ago),
                cpu_fraction: cpu,
                memory_used_bytes: 100,
                memory_limit_bytes: 1000,
                disk_used_bytes: 10,
                network_in_bytes: 5,
                network_out_bytes: 7,
            })
            .await
            .unwrap();
    }

    let latest = h.orchestrator.latest_usage(id).await.unwrap().unwrap();
    assert_eq!(latest.cpu_fraction, 0.6);

    let history = h
        .orchestrator
        .usage_history(id, now - chrono::Duration::minutes(15), 10)
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].sampled_at > history[1].sampled_at);

    let summary = h
        .orchestrator
        .usage_summary(id, Duration::from_secs(30 * 60))
        .await
        .unwrap();
    assert_eq!(summary.sample_count, 3);
    assert!((summary.max_cpu_fraction - 0.6).abs() < 1e-9);
    assert_eq!(summary.total_network_out_bytes, 21);
}
