// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Telemetry pipeline tests.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Harness, fast_policy, request};
use hostlane_orchestrator::telemetry::{TelemetryConfig, TelemetryPipeline};
use hostlane_orchestrator::{InstanceStatus, Operation};

fn pipeline(h: &Harness) -> TelemetryPipeline {
    TelemetryPipeline::new(
        h.store.clone(),
        h.usage.clone(),
        h.runtime.clone(),
        h.orchestrator.clone(),
        TelemetryConfig {
            interval: Duration::from_secs(30),
            concurrency: 4,
            sample_timeout: Duration::from_secs(1),
            failure_threshold: 3,
            append_retry: fast_policy(),
        },
    )
}

#[tokio::test]
async fn test_tick_samples_running_instances_only() {
    let h = Harness::new();
    let a = h.orchestrator.create(request("acme")).await.unwrap().instance.id;
    let b = h.orchestrator.create(request("globex")).await.unwrap().instance.id;
    h.orchestrator.stop(b).await.unwrap();

    let report = pipeline(&h).tick().await.unwrap();
    assert_eq!(report.instances, 1);
    assert_eq!(report.persisted, 1);
    assert_eq!(report.failed, 0);

    let samples = h.usage.samples_for(a);
    assert_eq!(samples.len(), 1);
    assert!((samples[0].cpu_fraction - 0.12).abs() < 1e-9);
    assert_eq!(samples[0].memory_used_bytes, 256 * 1024 * 1024);
    assert!(h.usage.samples_for(b).is_empty());
}

#[tokio::test]
async fn test_unreachable_samples_are_skipped_without_faulting() {
    let h = Harness::new();
    let created = h.orchestrator.create(request("acme")).await.unwrap().instance;
    let container_id = created.container_id.unwrap();
    h.runtime.fail_stats(&container_id, 2);

    let telemetry = pipeline(&h);
    for _ in 0..10 {
        telemetry.tick().await.unwrap();
    }

    assert_eq!(h.usage.samples_for(created.id).len(), 8);
    assert_eq!(telemetry.failure_count(created.id), 0);
    assert_eq!(h.instance(created.id).status, InstanceStatus::Running);
}

#[tokio::test]
async fn test_failure_count_resets_on_success() {
    let h = Harness::new();
    let created = h.orchestrator.create(request("acme")).await.unwrap().instance;
    let container_id = created.container_id.unwrap();
    let telemetry = pipeline(&h);

    h.runtime.fail_stats(&container_id, 2);
    telemetry.tick().await.unwrap();
    telemetry.tick().await.unwrap();
    assert_eq!(telemetry.failure_count(created.id), 2);

    telemetry.tick().await.unwrap();
    assert_eq!(telemetry.failure_count(created.id), 0);

    h.runtime.fail_stats(&container_id, 2);
    telemetry.tick().await.unwrap();
    telemetry.tick().await.unwrap();
    assert_eq!(h.instance(created.id).status, InstanceStatus::Running);
}

#[tokio::test]
async fn test_consecutive_failures_move_only_that_instance_to_error() {
    let h = Harness::new();
    let broken = h.orchestrator.create(request("acme")).await.unwrap().instance;
    let healthy = h.orchestrator.create(request("globex")).await.unwrap().instance;
    h.runtime
        .set_unreachable(broken.container_id.as_deref().unwrap(), true);

    let telemetry = pipeline(&h);
    let first = telemetry.tick().await.unwrap();
    let second = telemetry.tick().await.unwrap();
    assert!(first.faulted.is_empty() && second.faulted.is_empty());
    assert_eq!(h.instance(broken.id).status, InstanceStatus::Running);

    let third = telemetry.tick().await.unwrap();
    assert_eq!(third.faulted, vec![broken.id]);
    assert_eq!(third.persisted, 1);

    let failed = h.instance(broken.id);
    assert_eq!(failed.status, InstanceStatus::Error);
    assert_eq!(failed.failed_operation, Some(Operation::Start));
    assert!(failed.last_error.unwrap().contains("3 consecutive samples"));

    assert_eq!(h.instance(healthy.id).status, InstanceStatus::Running);
    assert_eq!(h.usage.samples_for(healthy.id).len(), 3);
    assert!(h.usage.samples_for(broken.id).is_empty());

    // No longer running, so no longer sampled.
    let fourth = telemetry.tick().await.unwrap();
    assert_eq!(fourth.instances, 1);
}

#[tokio::test]
async fn test_crashed_container_is_reported() {
    let h = Harness::new();
    let created = h.orchestrator.create(request("acme")).await.unwrap().instance;
    h.runtime.crash(created.container_id.as_deref().unwrap());

    let telemetry = pipeline(&h);
    for _ in 0..3 {
        telemetry.tick().await.unwrap();
    }
    assert_eq!(h.instance(created.id).status, InstanceStatus::Error);

    // Retrying the failed start brings it back.
    h.orchestrator.start(created.id).await.unwrap();
    let report = telemetry.tick().await.unwrap();
    assert_eq!(report.persisted, 1);
}

#[tokio::test(start_paused = true)]
async fn test_slow_sample_times_out_without_stalling_others() {
    let h = Harness::new();
    let slow = h.orchestrator.create(request("acme")).await.unwrap().instance;
    let quick = h.orchestrator.create(request("globex")).await.unwrap().instance;
    h.runtime
        .delay_stats(slow.container_id.as_deref().unwrap(), Duration::from_secs(600));

    let telemetry = pipeline(&h);
    let started = tokio::time::Instant::now();
    let report = telemetry.tick().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));

    assert_eq!(report.instances, 2);
    assert_eq!(report.persisted, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(h.usage.samples_for(quick.id).len(), 1);
    assert!(h.usage.samples_for(slow.id).is_empty());
    assert_eq!(telemetry.failure_count(slow.id), 1);
    assert_eq!(telemetry.failure_count(quick.id), 0);
}

#[tokio::test]
async fn test_append_failure_is_retried() {
    let h = Harness::new();
    let id = h.orchestrator.create(request("acme")).await.unwrap().instance.id;
    h.usage.fail_appends(1);

    let report = pipeline(&h).tick().await.unwrap();
    assert_eq!(report.persisted, 1);
    assert_eq!(h.usage.samples_for(id).len(), 1);
}

#[tokio::test]
async fn test_fault_on_busy_instance_is_ignored() {
    let h = Harness::with_delay(Duration::from_millis(150));
    let created = h.orchestrator.create(request("acme")).await.unwrap().instance;
    h.runtime
        .set_unreachable(created.container_id.as_deref().unwrap(), true);

    let telemetry = pipeline(&h);
    telemetry.tick().await.unwrap();
    telemetry.tick().await.unwrap();

    let orchestrator = h.orchestrator.clone();
    let stopping = tokio::spawn(async move { orchestrator.stop(created.id).await });
    tokio::time::sleep(Duration::from_millis(30)).await;

    let report = telemetry.tick().await.unwrap();
    assert!(report.faulted.is_empty());

    let stopped = stopping.await.unwrap().unwrap();
    assert_eq!(stopped.instance.status, InstanceStatus::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_run_loop_samples_every_interval_until_shutdown() {
    let h = Harness::new();
    let created = h.orchestrator.create(request("acme")).await.unwrap().instance;
    h.runtime
        .fail_stats(created.container_id.as_deref().unwrap(), 2);

    let telemetry = Arc::new(pipeline(&h));
    let shutdown = telemetry.shutdown_handle();
    let handle = {
        let telemetry = telemetry.clone();
        tokio::spawn(async move { telemetry.run().await })
    };

    // Five minutes at a 30 second interval is ten ticks.
    tokio::time::sleep(Duration::from_secs(5 * 60 + 1)).await;
    shutdown.notify_one();
    handle.await.unwrap();

    assert_eq!(h.usage.samples_for(created.id).len(), 8);
    assert_eq!(h.runtime.stats_calls(), 10);
}
