// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory stores.
//!
//! Enforce the same uniqueness rules as the PostgreSQL schema (live
//! subdomain, live address). Used by tests and for running without a
//! database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{InstanceStore, Result, StoreError, UsageStore};
use crate::instance::{Instance, InstanceFilter};
use crate::usage::{ResourceUsageSample, UsageSummary};

fn take(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// In-memory instance store.
#[derive(Default)]
pub struct MemoryInstanceStore {
    instances: RwLock<HashMap<Uuid, Instance>>,
    fail_updates: AtomicU32,
}

impl MemoryInstanceStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` updates fail.
    pub fn fail_updates(&self, times: u32) {
        self.fail_updates.store(times, Ordering::SeqCst);
    }

    /// Snapshot of every stored instance.
    pub fn all(&self) -> Vec<Instance> {
        self.read().values().cloned().collect()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Uuid, Instance>> {
        self.instances.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Uuid, Instance>> {
        self.instances.write().unwrap_or_else(|p| p.into_inner())
    }

    fn check_unique(map: &HashMap<Uuid, Instance>, candidate: &Instance) -> Result<()> {
        if candidate.deleted_at.is_some() {
            return Ok(());
        }
        for other in map.values() {
            if other.id == candidate.id || other.deleted_at.is_some() {
                continue;
            }
            if other.subdomain == candidate.subdomain {
                return Err(StoreError::UniqueViolation(
                    "instances_subdomain_live".to_string(),
                ));
            }
            if candidate.address.is_some() && other.address == candidate.address {
                return Err(StoreError::UniqueViolation(
                    "instances_address_live".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl InstanceStore for MemoryInstanceStore {
    async fn insert(&self, instance: &Instance) -> Result<()> {
        let mut map = self.write();
        if map.contains_key(&instance.id) {
            return Err(StoreError::UniqueViolation("instances_pkey".to_string()));
        }
        Self::check_unique(&map, instance)?;
        map.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Instance>> {
        Ok(self.read().get(&id).cloned())
    }

    async fn update(&self, instance: &Instance) -> Result<()> {
        if take(&self.fail_updates) {
            return Err(StoreError::Unavailable("injected update failure".to_string()));
        }
        let mut map = self.write();
        if !map.contains_key(&instance.id) {
            return Err(StoreError::NotFound(instance.id));
        }
        Self::check_unique(&map, instance)?;
        let mut stored = instance.clone();
        stored.updated_at = Utc::now();
        map.insert(instance.id, stored);
        Ok(())
    }

    async fn list(&self, filter: &InstanceFilter) -> Result<Vec<Instance>> {
        let mut matching: Vec<Instance> = self
            .read()
            .values()
            .filter(|i| filter.matches(i))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));

        let offset = filter.offset.max(0) as usize;
        let limit = if filter.limit > 0 {
            filter.limit as usize
        } else {
            usize::MAX
        };
        Ok(matching.into_iter().skip(offset).take(limit).collect())
    }

    async fn subdomain_taken(&self, subdomain: &str) -> Result<bool> {
        Ok(self
            .read()
            .values()
            .any(|i| i.deleted_at.is_none() && i.subdomain == subdomain))
    }
}

/// In-memory usage store.
#[derive(Default)]
pub struct MemoryUsageStore {
    samples: Mutex<Vec<ResourceUsageSample>>,
    fail_appends: AtomicU32,
}

impl MemoryUsageStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` appends fail.
    pub fn fail_appends(&self, times: u32) {
        self.fail_appends.store(times, Ordering::SeqCst);
    }

    /// Every sample for `instance_id`, in write order.
    pub fn samples_for(&self, instance_id: Uuid) -> Vec<ResourceUsageSample> {
        self.lock()
            .iter()
            .filter(|s| s.instance_id == instance_id)
            .cloned()
            .collect()
    }

    /// Total samples stored.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no sample was stored.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ResourceUsageSample>> {
        self.samples.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl UsageStore for MemoryUsageStore {
    async fn append(&self, sample: &ResourceUsageSample) -> Result<()> {
        if take(&self.fail_appends) {
            return Err(StoreError::Unavailable("injected append failure".to_string()));
        }
        self.lock().push(sample.clone());
        Ok(())
    }

    async fn latest(&self, instance_id: Uuid) -> Result<Option<ResourceUsageSample>> {
        Ok(self
            .lock()
            .iter()
            .filter(|s| s.instance_id == instance_id)
            .max_by_key(|s| s.sampled_at)
            .cloned())
    }

    async fn history(
        &self,
        instance_id: Uuid,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ResourceUsageSample>> {
        let mut samples: Vec<ResourceUsageSample> = self
            .lock()
            .iter()
            .filter(|s| s.instance_id == instance_id && s.sampled_at >= since)
            .cloned()
            .collect();
        samples.sort_by(|a, b| b.sampled_at.cmp(&a.sampled_at));
        samples.truncate(limit.max(0) as usize);
        Ok(samples)
    }

    async fn summary(&self, instance_id: Uuid, since: DateTime<Utc>) -> Result<UsageSummary> {
        let samples = self.lock();
        Ok(UsageSummary::from_samples(
            samples
                .iter()
                .filter(|s| s.instance_id == instance_id && s.sampled_at >= since),
        ))
    }
}
