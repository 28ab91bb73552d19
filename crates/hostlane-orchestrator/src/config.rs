// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for hostlane-orchestrator.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::network::Subnet;

/// Which DNS backend to talk to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsBackend {
    /// AdGuard-compatible rewrite HTTP API.
    Api {
        /// Base URL, e.g. `https://dns.internal`.
        base_url: String,
        /// Basic-auth user.
        username: String,
        /// Basic-auth password.
        password: String,
    },
    /// External command-line tool.
    Cli {
        /// Path to the tool.
        path: PathBuf,
    },
}

/// Orchestrator configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL URL (record store and time-series store)
    pub database_url: String,
    /// Docker daemon endpoint; `None` uses the platform defaults
    pub docker_host: Option<String>,
    /// User-defined container network
    pub docker_network: String,
    /// Subnet addresses are allocated from
    pub subnet: Subnet,
    /// Addresses never handed out (gateway, infrastructure hosts)
    pub reserved_addresses: Vec<Ipv4Addr>,
    /// Image every instance runs
    pub instance_image: String,
    /// Fixed internal application port
    pub instance_port: u16,
    /// Public domain used to build instance URLs
    pub domain: String,
    /// DNS backend
    pub dns_backend: DnsBackend,
    /// Zone suffix appended to every record label
    pub dns_zone: String,
    /// Telemetry sampling interval
    pub monitor_interval: Duration,
    /// DNS sweep interval
    pub dns_sweep_interval: Duration,
    /// How long DNS may stay unverified before the instance is failed
    pub dns_degraded_max_age: Duration,
    /// Worker-pool size for lifecycle operations
    pub max_concurrent_operations: usize,
    /// Deadline for each call to an external system
    pub call_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("HOSTLANE_DATABASE_URL")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .map_err(|_| ConfigError::MissingEnvVar("HOSTLANE_DATABASE_URL or DATABASE_URL"))?;

        let docker_host = std::env::var("DOCKER_HOST").ok().filter(|h| !h.is_empty());

        let docker_network =
            std::env::var("DOCKER_NETWORK").unwrap_or_else(|_| "hostlane".to_string());

        let subnet: Subnet = parse_var("DOCKER_NETWORK_SUBNET", "10.1.2.0/24")?;

        let reserved_addresses = std::env::var("HOSTLANE_RESERVED_ADDRESSES")
            .map(|raw| parse_address_list(&raw))
            .unwrap_or_else(|_| Ok(Vec::new()))?;

        let instance_image = std::env::var("HOSTLANE_INSTANCE_IMAGE")
            .unwrap_or_else(|_| "n8nio/n8n:latest".to_string());

        let instance_port: u16 = std::env::var("HOSTLANE_INSTANCE_PORT")
            .unwrap_or_else(|_| "5678".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let domain =
            std::env::var("HOSTLANE_DOMAIN").unwrap_or_else(|_| "launchstack.io".to_string());

        let dns_backend = match std::env::var("HOSTLANE_DNS_PROVIDER")
            .unwrap_or_else(|_| "api".to_string())
            .as_str()
        {
            "api" => {
                let protocol =
                    std::env::var("ADGUARD_PROTOCOL").unwrap_or_else(|_| "https".to_string());
                let host = std::env::var("ADGUARD_HOST")
                    .map_err(|_| ConfigError::MissingEnvVar("ADGUARD_HOST"))?;
                DnsBackend::Api {
                    base_url: format!("{}://{}", protocol, host),
                    username: std::env::var("ADGUARD_USERNAME")
                        .map_err(|_| ConfigError::MissingEnvVar("ADGUARD_USERNAME"))?,
                    password: std::env::var("ADGUARD_PASSWORD")
                        .map_err(|_| ConfigError::MissingEnvVar("ADGUARD_PASSWORD"))?,
                }
            }
            "cli" => DnsBackend::Cli {
                path: PathBuf::from(
                    std::env::var("DNS_CLI_PATH").unwrap_or_else(|_| "./dns-cli".to_string()),
                ),
            },
            other => return Err(ConfigError::InvalidDnsProvider(other.to_string())),
        };

        let dns_zone = std::env::var("HOSTLANE_DNS_ZONE").unwrap_or_else(|_| "docker".to_string());

        let monitor_interval = secs_var("RESOURCE_MONITOR_INTERVAL_SECS", 30)?;
        let dns_sweep_interval = secs_var("HOSTLANE_DNS_SWEEP_INTERVAL_SECS", 300)?;
        let dns_degraded_max_age = secs_var("HOSTLANE_DNS_DEGRADED_MAX_AGE_SECS", 900)?;

        let max_concurrent_operations: usize = parse_var("HOSTLANE_MAX_CONCURRENT_OPERATIONS", "8")?;
        if max_concurrent_operations == 0 {
            return Err(ConfigError::InvalidValue {
                var: "HOSTLANE_MAX_CONCURRENT_OPERATIONS",
                value: "0".to_string(),
            });
        }

        let call_timeout = secs_var("HOSTLANE_CALL_TIMEOUT_SECS", 30)?;

        Ok(Self {
            database_url,
            docker_host,
            docker_network,
            subnet,
            reserved_addresses,
            instance_image,
            instance_port,
            domain,
            dns_backend,
            dns_zone,
            monitor_interval,
            dns_sweep_interval,
            dns_degraded_max_age,
            max_concurrent_operations,
            call_timeout,
        })
    }
}

fn parse_var<T: FromStr>(var: &'static str, default: &str) -> Result<T, ConfigError> {
    let value = std::env::var(var).unwrap_or_else(|_| default.to_string());
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue { var, value })
}

fn secs_var(var: &'static str, default: u64) -> Result<Duration, ConfigError> {
    let secs: u64 = parse_var(var, &default.to_string())?;
    if secs == 0 {
        return Err(ConfigError::InvalidValue {
            var,
            value: "0".to_string(),
        });
    }
    Ok(Duration::from_secs(secs))
}

/// Parse a comma-separated list of IPv4 addresses, ignoring blanks.
pub fn parse_address_list(raw: &str) -> Result<Vec<Ipv4Addr>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse().map_err(|_| ConfigError::InvalidValue {
                var: "HOSTLANE_RESERVED_ADDRESSES",
                value: s.to_string(),
            })
        })
        .collect()
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// The port number is invalid.
    #[error("Invalid port number")]
    InvalidPort,
    /// Unknown DNS provider name.
    #[error("Invalid DNS provider '{0}' (expected 'api' or 'cli')")]
    InvalidDnsProvider(String),
    /// A variable could not be parsed.
    #[error("Invalid value for {var}: '{value}'")]
    InvalidValue {
        /// Variable name.
        var: &'static str,
        /// Offending value.
        value: String,
    },
}
