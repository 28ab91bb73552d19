// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock container runtime for testing.
//!
//! Keeps containers in memory and lets tests inject failures at every step.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use super::{ContainerError, ContainerHandle, ContainerRuntime, ContainerSpec, ContainerStats, Result};

/// Step at which a failure can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    /// `create`
    Create,
    /// `start`
    Start,
    /// `stop`
    Stop,
    /// `remove`
    Remove,
}

/// Snapshot of a mock container.
#[derive(Debug, Clone, PartialEq)]
pub struct MockContainer {
    /// Runtime id.
    pub id: String,
    /// Spec it was created from.
    pub spec: ContainerSpec,
    /// Whether it is running.
    pub running: bool,
    /// Times it was started.
    pub start_count: u32,
}

#[derive(Default)]
struct MockState {
    containers: HashMap<String, MockContainer>,
    failures: HashMap<FailPoint, u32>,
    transient_failures: HashMap<FailPoint, u32>,
    hangs: HashMap<FailPoint, Duration>,
    stats_delays: HashMap<String, Duration>,
    stats_failures: HashMap<String, u32>,
    unreachable: HashMap<String, bool>,
}

/// Mock container runtime.
pub struct MockContainerRuntime {
    state: Mutex<MockState>,
    next_id: AtomicU64,
    stats_calls: AtomicU64,
    /// Delay applied to every lifecycle call.
    pub operation_delay: Duration,
    /// Stats returned for reachable containers.
    pub stats: ContainerStats,
}

impl Default for MockContainerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MockContainerRuntime {
    /// Create a new mock runtime.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            next_id: AtomicU64::new(1),
            stats_calls: AtomicU64::new(0),
            operation_delay: Duration::ZERO,
            stats: ContainerStats {
                cpu_fraction: 0.12,
                memory_used_bytes: 256 * 1024 * 1024,
                memory_limit_bytes: 1024 * 1024 * 1024,
                disk_used_bytes: 40 * 1024 * 1024,
                network_in_bytes: 1_000,
                network_out_bytes: 2_000,
            },
        }
    }

    /// Create a mock runtime whose lifecycle calls take `delay`.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            operation_delay: delay,
            ..Self::new()
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the next `times` calls at `point` fail.
    pub fn fail_next(&self, point: FailPoint, times: u32) {
        self.state().failures.insert(point, times);
    }

    /// Make the next `times` calls at `point` time out, as a slow daemon would.
    pub fn fail_transient(&self, point: FailPoint, times: u32) {
        self.state().transient_failures.insert(point, times);
    }

    /// Make every call at `point` block for `duration` before doing anything.
    pub fn hang(&self, point: FailPoint, duration: Duration) {
        self.state().hangs.insert(point, duration);
    }

    /// Undo [`hang`](Self::hang).
    pub fn clear_hang(&self, point: FailPoint) {
        self.state().hangs.remove(&point);
    }

    /// Make stats reads for `container_id` take `delay`.
    pub fn delay_stats(&self, container_id: &str, delay: Duration) {
        self.state()
            .stats_delays
            .insert(container_id.to_string(), delay);
    }

    /// Make the next `times` stats reads for `container_id` fail.
    pub fn fail_stats(&self, container_id: &str, times: u32) {
        self.state()
            .stats_failures
            .insert(container_id.to_string(), times);
    }

    /// Make every stats read for `container_id` fail until cleared.
    pub fn set_unreachable(&self, container_id: &str, unreachable: bool) {
        self.state()
            .unreachable
            .insert(container_id.to_string(), unreachable);
    }

    /// Snapshot of a container.
    pub fn container(&self, container_id: &str) -> Option<MockContainer> {
        self.state().containers.get(container_id).cloned()
    }

    /// Container created for `instance_id`, if any.
    pub fn container_for_instance(&self, instance_id: Uuid) -> Option<MockContainer> {
        self.state()
            .containers
            .values()
            .find(|c| c.spec.instance_id == instance_id)
            .cloned()
    }

    /// Number of existing containers.
    pub fn container_count(&self) -> usize {
        self.state().containers.len()
    }

    /// Number of running containers.
    pub fn running_count(&self) -> usize {
        self.state().containers.values().filter(|c| c.running).count()
    }

    /// Total stats reads so far.
    pub fn stats_calls(&self) -> u64 {
        self.stats_calls.load(Ordering::SeqCst)
    }

    /// Stop a container behind the orchestrator's back (crash, OOM kill).
    pub fn crash(&self, container_id: &str) {
        if let Some(c) = self.state().containers.get_mut(container_id) {
            c.running = false;
        }
    }

    fn take_failure(&self, point: FailPoint) -> bool {
        consume(&mut self.state().failures, point)
    }

    /// Common prologue of every lifecycle call: delay, hang, injected timeout.
    async fn enter(&self, point: FailPoint) -> Result<()> {
        let hang = self.state().hangs.get(&point).copied();
        let delay = self.operation_delay + hang.unwrap_or_default();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if consume(&mut self.state().transient_failures, point) {
            return Err(ContainerError::Timeout(format!(
                "injected {:?} timeout",
                point
            )));
        }
        Ok(())
    }

    fn address_in_use(state: &MockState, address: Ipv4Addr) -> bool {
        state.containers.values().any(|c| c.spec.address == address)
    }
}

fn consume(counters: &mut HashMap<FailPoint, u32>, point: FailPoint) -> bool {
    match counters.get_mut(&point) {
        Some(n) if *n > 0 => {
            *n -= 1;
            true
        }
        _ => false,
    }
}

#[async_trait]
impl ContainerRuntime for MockContainerRuntime {
    fn runtime_type(&self) -> &'static str {
        "mock"
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        self.enter(FailPoint::Create).await?;
        if self.take_failure(FailPoint::Create) {
            return Err(ContainerError::CreateFailed("injected create failure".into()));
        }

        let mut state = self.state();
        if let Some(existing) = state.containers.values().find(|c| c.spec.name == spec.name) {
            if existing.spec.instance_id == spec.instance_id {
                return Ok(ContainerHandle {
                    id: existing.id.clone(),
                    name: spec.name.clone(),
                });
            }
            return Err(ContainerError::CreateFailed(format!(
                "name {} already in use",
                spec.name
            )));
        }
        if Self::address_in_use(&state, spec.address) {
            return Err(ContainerError::CreateFailed(format!(
                "address {} already in use",
                spec.address
            )));
        }

        let id = format!("mock-{:06}", self.next_id.fetch_add(1, Ordering::SeqCst));
        state.containers.insert(
            id.clone(),
            MockContainer {
                id: id.clone(),
                spec: spec.clone(),
                running: false,
                start_count: 0,
            },
        );

        Ok(ContainerHandle {
            id,
            name: spec.name.clone(),
        })
    }

    async fn start(&self, container_id: &str) -> Result<()> {
        self.enter(FailPoint::Start).await?;
        if self.take_failure(FailPoint::Start) {
            return Err(ContainerError::StartFailed("injected start failure".into()));
        }
        let mut state = self.state();
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| ContainerError::NotFound(container_id.to_string()))?;
        container.running = true;
        container.start_count += 1;
        Ok(())
    }

    async fn stop(&self, container_id: &str) -> Result<()> {
        self.enter(FailPoint::Stop).await?;
        if self.take_failure(FailPoint::Stop) {
            return Err(ContainerError::StopFailed("injected stop failure".into()));
        }
        if let Some(container) = self.state().containers.get_mut(container_id) {
            container.running = false;
        }
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> Result<()> {
        self.enter(FailPoint::Remove).await?;
        if self.take_failure(FailPoint::Remove) {
            return Err(ContainerError::RemoveFailed("injected remove failure".into()));
        }
        self.state().containers.remove(container_id);
        Ok(())
    }

    async fn exists(&self, container_id: &str) -> Result<bool> {
        Ok(self.state().containers.contains_key(container_id))
    }

    async fn stats(&self, container_id: &str) -> Result<ContainerStats> {
        self.stats_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.state().stats_delays.get(container_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();

        if state.unreachable.get(container_id).copied().unwrap_or(false) {
            return Err(ContainerError::Unreachable(format!(
                "{} unreachable",
                container_id
            )));
        }
        if let Some(n) = state.stats_failures.get_mut(container_id)
            && *n > 0
        {
            *n -= 1;
            return Err(ContainerError::Unreachable(format!(
                "{} unreachable (scripted)",
                container_id
            )));
        }

        match state.containers.get(container_id) {
            Some(c) if c.running => Ok(self.stats.clone()),
            Some(_) => Err(ContainerError::Unreachable(format!(
                "{} is not running",
                container_id
            ))),
            None => Err(ContainerError::Unreachable(format!(
                "{} does not exist",
                container_id
            ))),
        }
    }
}
