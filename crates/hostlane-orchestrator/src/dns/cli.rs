// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! DNS provider driving an external command-line tool.
//!
//! The tool understands:
//!
//! ```text
//! dns-cli add -domain D -answer A
//! dns-cli delete -domain D
//! dns-cli get -domain D        → "DNS rewrite: D -> A"
//! dns-cli list                 → header, a line of dashes, then "D -> A" per record
//! ```
//!
//! A non-zero exit is a failure; stderr carries the message.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::{DnsError, DnsProvider, DnsRecord, Result};

/// Provider that shells out to a DNS CLI tool.
pub struct CliDnsProvider {
    path: PathBuf,
}

impl CliDnsProvider {
    /// Create a provider running the tool at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        if !self.path.exists() {
            return Err(DnsError::Unavailable(format!(
                "DNS tool not found at {}",
                self.path.display()
            )));
        }

        debug!(tool = %self.path.display(), args = ?args, "Running DNS tool");
        let output = Command::new(&self.path)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| DnsError::Tool(format!("failed to run {}: {}", self.path.display(), e)))?;

        if !output.status.success() {
            return Err(DnsError::Tool(format!(
                "{} exited with {}: {}",
                args.first().copied().unwrap_or_default(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl DnsProvider for CliDnsProvider {
    fn provider_type(&self) -> &'static str {
        "cli"
    }

    async fn add_record(&self, record: &DnsRecord) -> Result<()> {
        info!(domain = %record.domain, answer = %record.answer, "Adding DNS rewrite via tool");
        self.run(&["add", "-domain", &record.domain, "-answer", &record.answer])
            .await
            .map(|_| ())
    }

    async fn delete_record(&self, domain: &str) -> Result<()> {
        if self.get_record(domain).await?.is_none() {
            return Ok(());
        }
        info!(domain = %domain, "Deleting DNS rewrite via tool");
        self.run(&["delete", "-domain", domain]).await.map(|_| ())
    }

    async fn list_records(&self) -> Result<Vec<DnsRecord>> {
        let output = self.run(&["list"]).await?;
        Ok(parse_list_output(&output))
    }

    async fn get_record(&self, domain: &str) -> Result<Option<DnsRecord>> {
        match self.run(&["get", "-domain", domain]).await {
            Ok(output) => Ok(parse_record_line(
                output.trim().trim_start_matches("DNS rewrite:"),
            )),
            Err(DnsError::Tool(msg)) if msg.contains("not found") => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Parse `list` output: everything after the dashed separator.
pub fn parse_list_output(output: &str) -> Vec<DnsRecord> {
    output
        .lines()
        .skip_while(|line| !line.contains("-----"))
        .skip(1)
        .filter_map(parse_record_line)
        .collect()
}

fn parse_record_line(line: &str) -> Option<DnsRecord> {
    let (domain, answer) = line.split_once("->")?;
    let (domain, answer) = (domain.trim(), answer.trim());
    if domain.is_empty() || answer.is_empty() || answer.contains("->") {
        return None;
    }
    Some(DnsRecord {
        domain: domain.to_string(),
        answer: answer.to_string(),
    })
}
