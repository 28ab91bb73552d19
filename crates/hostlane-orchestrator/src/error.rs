// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for hostlane-orchestrator.

use thiserror::Error;
use uuid::Uuid;

use crate::container::ContainerError;
use crate::dns::DnsError;
use crate::instance::InvalidTransition;
use crate::network::AllocError;
use crate::store::StoreError;

/// Orchestrator errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Record or time-series store operation failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Container runtime call failed.
    #[error("Container error: {0}")]
    Container(#[from] ContainerError),

    /// DNS provider call failed.
    #[error("DNS error: {0}")]
    Dns(#[from] DnsError),

    /// Address allocation failed.
    #[error("Allocation error: {0}")]
    Allocation(#[from] AllocError),

    /// Operation is not legal in the instance's current status.
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    /// Another lifecycle operation holds the instance lock.
    #[error("Operation already in progress for instance {0}")]
    OperationInProgress(Uuid),

    /// Subdomain label already taken by a live instance.
    #[error("Subdomain already in use: {0}")]
    DuplicateSubdomain(String),

    /// Instance was not found.
    #[error("Instance not found: {0}")]
    InstanceNotFound(Uuid),

    /// Request validation failed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The orchestrator is shutting down and accepts no new operations.
    #[error("Orchestrator is shutting down")]
    ShuttingDown,

    /// A cross-field instance invariant was violated.
    #[error("Invariant violated: {0}")]
    Invariant(String),
}

/// How callers should treat an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Temporary; retrying later may succeed.
    Transient,
    /// The subnet or another finite resource is exhausted.
    Capacity,
    /// Conflicts with concurrent work or existing state; retry later or change the input.
    Conflict,
    /// The operation aborted; the instance needs a retry of the failed operation.
    Fatal,
    /// The request itself is wrong.
    Invalid,
}

impl Error {
    /// Classify the error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Container(e) if e.is_transient() => ErrorClass::Transient,
            Error::Dns(e) if e.is_transient() => ErrorClass::Transient,
            Error::Allocation(AllocError::AddressSpaceExhausted(_)) => ErrorClass::Capacity,
            Error::InvalidTransition(_)
            | Error::OperationInProgress(_)
            | Error::DuplicateSubdomain(_) => ErrorClass::Conflict,
            Error::Store(StoreError::UniqueViolation(_)) => ErrorClass::Conflict,
            Error::InstanceNotFound(_) | Error::InvalidRequest(_) => ErrorClass::Invalid,
            Error::ShuttingDown => ErrorClass::Transient,
            _ => ErrorClass::Fatal,
        }
    }

    /// Whether the error means the subnet has no free address.
    pub fn is_capacity_exhausted(&self) -> bool {
        self.class() == ErrorClass::Capacity
    }
}

/// Result type using orchestrator Error.
pub type Result<T> = std::result::Result<T, Error>;
