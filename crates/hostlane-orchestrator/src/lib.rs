// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hostlane Orchestrator - Instance Lifecycle Management
//!
//! Provisions, supervises and decommissions per-tenant application
//! containers. Every instance gets one container, a unique address on a
//! private network and a unique subdomain. The orchestrator keeps that
//! mapping consistent when the container runtime or the DNS backend fails
//! part-way through, and appends resource telemetry for every running
//! instance.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       API layer (out of scope)                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │ create / start / stop / delete
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     hostlane-orchestrator (This Crate)                  │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐     │
//! │  │  Lifecycle  │  │   Network   │  │     DNS     │  │  Telemetry  │     │
//! │  │Orchestrator │  │  Allocator  │  │ Reconciler  │  │  Pipeline   │     │
//! │  └─────────────┘  └─────────────┘  └─────────────┘  └─────────────┘     │
//! └─────────────────────────────────────────────────────────────────────────┘
//!         │                                   │                  │
//!         │ create/start/stop/remove/stats    │ add/delete/list  │ append
//!         ▼                                   ▼                  ▼
//! ┌───────────────────┐            ┌───────────────────┐  ┌──────────────────┐
//! │  Docker daemon    │            │ AdGuard API / CLI │  │ PostgreSQL +     │
//! │  (bollard)        │            │                   │  │ TimescaleDB      │
//! └───────────────────┘            └───────────────────┘  └──────────────────┘
//! ```
//!
//! # Lifecycle Operations
//!
//! | Operation | Valid from | Result |
//! |-----------|------------|--------|
//! | `create` | new request | `running` (or `error`, compensated) |
//! | `retry_create` | `error` after a failed create | `running` |
//! | `start` | `stopped`, or `error` after a failed start | `running` |
//! | `stop` | `running`, or `error` after a failed stop | `stopped` |
//! | `delete` | any status | `deleted` (no-op when already deleted) |
//!
//! A second operation on a busy instance fails immediately with
//! `OperationInProgress`. DNS trouble never fails an operation; it is
//! reported as `DnsOutcome::Degraded` and repaired by the periodic sweep.
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `HOSTLANE_DATABASE_URL` | Yes* | - | PostgreSQL connection string |
//! | `DATABASE_URL` | Yes* | - | Fallback if above not set |
//! | `DOCKER_NETWORK` | No | `hostlane` | Container network |
//! | `DOCKER_NETWORK_SUBNET` | No | `10.1.2.0/24` | Subnet addresses come from |
//! | `HOSTLANE_DNS_PROVIDER` | No | `api` | `api` (AdGuard) or `cli` |
//! | `RESOURCE_MONITOR_INTERVAL_SECS` | No | `30` | Telemetry interval |
//! | `HOSTLANE_DNS_SWEEP_INTERVAL_SECS` | No | `300` | DNS sweep interval |
//! | `HOSTLANE_DNS_DEGRADED_MAX_AGE_SECS` | No | `900` | Tolerated unverified DNS |
//!
//! See [`config::Config::from_env`] for the full list.
//!
//! # Modules
//!
//! - [`config`]: Configuration from environment variables
//! - [`error`]: Error types and error classification
//! - [`instance`]: Instance model and lifecycle state machine
//! - [`network`]: Subnet address allocation
//! - [`container`]: Container runtime trait, Docker and mock implementations
//! - [`dns`]: DNS provider trait, AdGuard/CLI/mock implementations, reconciler
//! - [`store`]: Record store and time-series store
//! - [`orchestrator`]: Lifecycle orchestrator
//! - [`telemetry`]: Periodic usage sampling
//! - [`dns_sweep_worker`]: Periodic DNS reconciliation
//! - [`runtime`]: Embeddable runtime owning the workers

#![deny(missing_docs)]

/// Database migrations (instances, resource_usage hypertable and policies).
pub mod migrations;

/// Configuration loaded from environment variables.
pub mod config;

/// Error types for orchestrator operations.
pub mod error;

/// Instance model and lifecycle state machine.
pub mod instance;

/// Resource usage samples and summaries.
pub mod usage;

/// Subdomain label validation and suggestions.
pub mod subdomain;

/// Bounded retry and polling helpers.
pub mod retry;

/// Subnet address allocation.
pub mod network;

/// Container runtime backends.
pub mod container;

/// DNS providers and the reconciler.
pub mod dns;

/// Instance record store and usage time-series store.
pub mod store;

/// Lifecycle orchestrator.
pub mod orchestrator;

/// Background worker sampling resource usage.
pub mod telemetry;

/// Background worker running DNS reconciliation sweeps.
pub mod dns_sweep_worker;

/// Embeddable runtime with graceful shutdown.
pub mod runtime;

pub use error::{Error, ErrorClass, Result};
pub use instance::{CreateInstanceRequest, Instance, InstanceStatus, Operation, ResourceLimits};
pub use orchestrator::{LifecycleOutcome, Orchestrator, OrchestratorConfig};
pub use runtime::OrchestratorRuntime;
