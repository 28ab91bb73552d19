// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! DNS provider abstraction and the reconciler built on it.
//!
//! Two interchangeable backends exist: the AdGuard rewrite HTTP API and an
//! external command-line tool with the same add/delete/list/get verbs. One is
//! picked at construction; the reconciler only sees [`DnsProvider`].

pub mod adguard;
pub mod cli;
pub mod mock;
pub mod reconciler;

use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use adguard::AdGuardDnsProvider;
pub use cli::CliDnsProvider;
pub use mock::MockDnsProvider;
pub use reconciler::{DnsOutcome, DnsReconciler, DnsReconcilerConfig, SweepReport};

/// A name → address rewrite held by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DnsRecord {
    /// Fully qualified record name, e.g. `acme.docker`.
    pub domain: String,
    /// Answer, normally an IPv4 address.
    pub answer: String,
}

impl DnsRecord {
    /// Record pointing `domain` at `address`.
    pub fn new(domain: impl Into<String>, address: Ipv4Addr) -> Self {
        Self {
            domain: domain.into(),
            answer: address.to_string(),
        }
    }

    /// The answer as an IPv4 address, if it is one.
    pub fn address(&self) -> Option<Ipv4Addr> {
        self.answer.parse().ok()
    }
}

/// Errors from DNS provider operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DnsError {
    /// The provider could not be reached.
    #[error("DNS provider unavailable: {0}")]
    Unavailable(String),

    /// The provider answered with an error status.
    #[error("DNS provider rejected request ({status}): {body}")]
    Rejected {
        /// HTTP-like status code.
        status: u16,
        /// Response body or tool stderr.
        body: String,
    },

    /// The provider answered with something unparseable.
    #[error("Invalid DNS provider response: {0}")]
    InvalidResponse(String),

    /// The CLI tool failed.
    #[error("DNS tool failed: {0}")]
    Tool(String),

    /// The call exceeded its deadline.
    #[error("DNS call timed out: {0}")]
    Timeout(String),
}

impl DnsError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            DnsError::Unavailable(_) | DnsError::Timeout(_) | DnsError::Tool(_) => true,
            DnsError::Rejected { status, .. } => *status >= 500 || *status == 429,
            DnsError::InvalidResponse(_) => false,
        }
    }
}

/// Result type for DNS operations.
pub type Result<T> = std::result::Result<T, DnsError>;

/// Trait for DNS backends.
///
/// Success responses are not trusted; callers verify with a read-back.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Provider type identifier (e.g., "adguard", "cli", "mock")
    fn provider_type(&self) -> &'static str;

    /// Add a record.
    async fn add_record(&self, record: &DnsRecord) -> Result<()>;

    /// Delete every record for `domain`. Missing records are not an error.
    async fn delete_record(&self, domain: &str) -> Result<()>;

    /// List all records.
    async fn list_records(&self) -> Result<Vec<DnsRecord>>;

    /// Look up the record for `domain`.
    async fn get_record(&self, domain: &str) -> Result<Option<DnsRecord>> {
        Ok(self
            .list_records()
            .await?
            .into_iter()
            .find(|r| r.domain == domain))
    }
}

/// Run a provider call under a deadline; elapsing counts as failure.
pub async fn with_deadline<T>(
    deadline: Duration,
    what: &str,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(DnsError::Timeout(format!("{} exceeded {:?}", what, deadline))),
    }
}
