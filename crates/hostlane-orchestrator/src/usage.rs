// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resource usage samples and summaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::container::ContainerStats;

/// One point-in-time resource sample. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ResourceUsageSample {
    /// Sampled instance.
    pub instance_id: Uuid,
    /// When the sample was taken.
    pub sampled_at: DateTime<Utc>,
    /// CPU utilization, 0.0 to 1.0.
    pub cpu_fraction: f64,
    /// Memory in use.
    pub memory_used_bytes: i64,
    /// Memory ceiling.
    pub memory_limit_bytes: i64,
    /// Writable-layer disk usage.
    pub disk_used_bytes: i64,
    /// Bytes received.
    pub network_in_bytes: i64,
    /// Bytes sent.
    pub network_out_bytes: i64,
}

impl ResourceUsageSample {
    /// Build a sample from a stats snapshot.
    pub fn from_stats(instance_id: Uuid, sampled_at: DateTime<Utc>, stats: &ContainerStats) -> Self {
        Self {
            instance_id,
            sampled_at,
            cpu_fraction: stats.cpu_fraction.clamp(0.0, 1.0),
            memory_used_bytes: saturating_i64(stats.memory_used_bytes),
            memory_limit_bytes: saturating_i64(stats.memory_limit_bytes),
            disk_used_bytes: saturating_i64(stats.disk_used_bytes),
            network_in_bytes: saturating_i64(stats.network_in_bytes),
            network_out_bytes: saturating_i64(stats.network_out_bytes),
        }
    }

    /// Memory usage as a fraction of the limit (0 when no limit is reported).
    pub fn memory_fraction(&self) -> f64 {
        if self.memory_limit_bytes <= 0 {
            return 0.0;
        }
        self.memory_used_bytes as f64 / self.memory_limit_bytes as f64
    }
}

fn saturating_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

/// Aggregated usage over a period.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct UsageSummary {
    /// Number of samples in the period.
    pub sample_count: i64,
    /// Average CPU fraction.
    pub avg_cpu_fraction: f64,
    /// Peak CPU fraction.
    pub max_cpu_fraction: f64,
    /// Average memory in use.
    pub avg_memory_used_bytes: f64,
    /// Peak memory in use.
    pub max_memory_used_bytes: i64,
    /// Average disk usage.
    pub avg_disk_used_bytes: f64,
    /// Peak disk usage.
    pub max_disk_used_bytes: i64,
    /// Total bytes received.
    pub total_network_in_bytes: i64,
    /// Total bytes sent.
    pub total_network_out_bytes: i64,
}

impl UsageSummary {
    /// Fold a set of samples into a summary.
    pub fn from_samples<'a>(samples: impl IntoIterator<Item = &'a ResourceUsageSample>) -> Self {
        let mut summary = UsageSummary::default();
        let (mut cpu, mut mem, mut disk) = (0.0, 0.0, 0.0);

        for s in samples {
            summary.sample_count += 1;
            cpu += s.cpu_fraction;
            mem += s.memory_used_bytes as f64;
            disk += s.disk_used_bytes as f64;
            summary.max_cpu_fraction = summary.max_cpu_fraction.max(s.cpu_fraction);
            summary.max_memory_used_bytes = summary.max_memory_used_bytes.max(s.memory_used_bytes);
            summary.max_disk_used_bytes = summary.max_disk_used_bytes.max(s.disk_used_bytes);
            summary.total_network_in_bytes = summary
                .total_network_in_bytes
                .saturating_add(s.network_in_bytes);
            summary.total_network_out_bytes = summary
                .total_network_out_bytes
                .saturating_add(s.network_out_bytes);
        }

        if summary.sample_count > 0 {
            let n = summary.sample_count as f64;
            summary.avg_cpu_fraction = cpu / n;
            summary.avg_memory_used_bytes = mem / n;
            summary.avg_disk_used_bytes = disk / n;
        }
        summary
    }
}
