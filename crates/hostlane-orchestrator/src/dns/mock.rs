// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock DNS provider for testing.
//!
//! Can be scripted to misbehave the way real providers do: report success
//! on a delete that did nothing, or accept an add that only shows up after
//! a few reads.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{DnsError, DnsProvider, DnsRecord, Result};

#[derive(Default)]
struct MockDnsState {
    records: BTreeMap<String, String>,
    /// domain → remaining reads before the record becomes visible
    pending_adds: BTreeMap<String, (String, u32)>,
}

/// In-memory DNS provider.
#[derive(Default)]
pub struct MockDnsProvider {
    state: Mutex<MockDnsState>,
    lying_deletes: AtomicU32,
    add_lag_reads: AtomicU32,
    unavailable: AtomicBool,
    fail_adds: AtomicU32,
    add_calls: AtomicU64,
    delete_calls: AtomicU64,
}

impl MockDnsProvider {
    /// Create an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockDnsState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The next `times` deletes report success without removing anything.
    pub fn lie_on_deletes(&self, times: u32) {
        self.lying_deletes.store(times, Ordering::SeqCst);
    }

    /// New records stay invisible for `reads` list/get calls.
    pub fn lag_adds(&self, reads: u32) {
        self.add_lag_reads.store(reads, Ordering::SeqCst);
    }

    /// The next `times` adds fail with a transient error.
    pub fn fail_adds(&self, times: u32) {
        self.fail_adds.store(times, Ordering::SeqCst);
    }

    /// Make every call fail until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Insert a record directly, bypassing scripting.
    pub fn insert(&self, domain: &str, answer: &str) {
        self.state()
            .records
            .insert(domain.to_string(), answer.to_string());
    }

    /// Remove a record directly, bypassing scripting.
    pub fn remove(&self, domain: &str) {
        self.state().records.remove(domain);
    }

    /// Current answer for `domain`, ignoring lag.
    pub fn answer(&self, domain: &str) -> Option<String> {
        self.state().records.get(domain).cloned()
    }

    /// Snapshot of all visible records.
    pub fn records(&self) -> BTreeMap<String, String> {
        self.state().records.clone()
    }

    /// Number of add calls received.
    pub fn add_calls(&self) -> u64 {
        self.add_calls.load(Ordering::SeqCst)
    }

    /// Number of delete calls received.
    pub fn delete_calls(&self) -> u64 {
        self.delete_calls.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DnsError::Unavailable("mock provider offline".into()));
        }
        Ok(())
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Advance lagging adds by one read; promote the ones that are due.
    fn tick_pending(state: &mut MockDnsState) {
        let mut due = Vec::new();
        for (domain, (answer, remaining)) in state.pending_adds.iter_mut() {
            if *remaining == 0 {
                due.push((domain.clone(), answer.clone()));
            } else {
                *remaining -= 1;
            }
        }
        for (domain, answer) in due {
            state.pending_adds.remove(&domain);
            state.records.insert(domain, answer);
        }
    }
}

#[async_trait]
impl DnsProvider for MockDnsProvider {
    fn provider_type(&self) -> &'static str {
        "mock"
    }

    async fn add_record(&self, record: &DnsRecord) -> Result<()> {
        self.check_available()?;
        self.add_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take(&self.fail_adds) {
            return Err(DnsError::Unavailable("injected add failure".into()));
        }

        let lag = self.add_lag_reads.load(Ordering::SeqCst);
        let mut state = self.state();
        if lag > 0 {
            state
                .pending_adds
                .insert(record.domain.clone(), (record.answer.clone(), lag));
        } else {
            state
                .records
                .insert(record.domain.clone(), record.answer.clone());
        }
        Ok(())
    }

    async fn delete_record(&self, domain: &str) -> Result<()> {
        self.check_available()?;
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take(&self.lying_deletes) {
            return Ok(());
        }
        let mut state = self.state();
        state.records.remove(domain);
        state.pending_adds.remove(domain);
        Ok(())
    }

    async fn list_records(&self) -> Result<Vec<DnsRecord>> {
        self.check_available()?;
        let mut state = self.state();
        Self::tick_pending(&mut state);
        Ok(state
            .records
            .iter()
            .map(|(domain, answer)| DnsRecord {
                domain: domain.clone(),
                answer: answer.clone(),
            })
            .collect())
    }
}
