// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! AdGuard Home rewrite API provider.
//!
//! Endpoints used:
//! - `GET  /control/rewrite/list`   → `[{"domain": .., "answer": ..}]`
//! - `POST /control/rewrite/add`    ← `{"domain": .., "answer": ..}`
//! - `POST /control/rewrite/delete` ← `{"domain": .., "answer": ..}`

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use tracing::{debug, info};

use super::{DnsError, DnsProvider, DnsRecord, Result};

/// Provider talking to an AdGuard Home instance over HTTP.
pub struct AdGuardDnsProvider {
    client: Client,
    base_url: String,
    username: String,
    password: String,
}

impl AdGuardDnsProvider {
    /// Create a provider for `base_url` (e.g. `https://dns.internal`).
    pub fn new(
        base_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DnsError::Unavailable(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            username: username.into(),
            password: password.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/control/rewrite/{}", self.base_url, path)
    }

    async fn post(&self, path: &str, record: &DnsRecord) -> Result<()> {
        let response = self
            .client
            .post(self.url(path))
            .basic_auth(&self.username, Some(&self.password))
            .json(record)
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response).await?;
        Ok(())
    }
}

#[async_trait]
impl DnsProvider for AdGuardDnsProvider {
    fn provider_type(&self) -> &'static str {
        "adguard"
    }

    async fn add_record(&self, record: &DnsRecord) -> Result<()> {
        info!(domain = %record.domain, answer = %record.answer, "Adding DNS rewrite");
        self.post("add", record).await
    }

    async fn delete_record(&self, domain: &str) -> Result<()> {
        // The API deletes by exact (domain, answer) pair.
        let matching: Vec<DnsRecord> = self
            .list_records()
            .await?
            .into_iter()
            .filter(|r| r.domain == domain)
            .collect();

        if matching.is_empty() {
            debug!(domain = %domain, "No DNS rewrite to delete");
            return Ok(());
        }

        for record in &matching {
            info!(domain = %record.domain, answer = %record.answer, "Deleting DNS rewrite");
            self.post("delete", record).await?;
        }
        Ok(())
    }

    async fn list_records(&self) -> Result<Vec<DnsRecord>> {
        let response = self
            .client
            .get(self.url("list"))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response).await?;

        response
            .json::<Vec<DnsRecord>>()
            .await
            .map_err(|e| DnsError::InvalidResponse(e.to_string()))
    }
}

fn transport_error(e: reqwest::Error) -> DnsError {
    if e.is_timeout() {
        DnsError::Timeout(e.to_string())
    } else {
        DnsError::Unavailable(e.to_string())
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(DnsError::Rejected {
        status: status.as_u16(),
        body,
    })
}
