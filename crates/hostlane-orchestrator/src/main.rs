// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hostlane Orchestrator - Instance Lifecycle Service
//!
//! Runs the lifecycle orchestrator with:
//! - Docker as the container runtime
//! - AdGuard (HTTP API) or a command-line tool as the DNS backend
//! - PostgreSQL/TimescaleDB for instance records and usage samples
//! - Periodic telemetry sampling and DNS reconciliation

use std::sync::Arc;
use tracing::{info, warn};

use hostlane_orchestrator::config::{Config, DnsBackend};
use hostlane_orchestrator::container::{ContainerRuntime, DockerConfig, DockerRuntime};
use hostlane_orchestrator::dns::{
    AdGuardDnsProvider, CliDnsProvider, DnsProvider, DnsReconcilerConfig,
};
use hostlane_orchestrator::dns_sweep_worker::DnsSweepWorkerConfig;
use hostlane_orchestrator::migrations;
use hostlane_orchestrator::network::NetworkAllocator;
use hostlane_orchestrator::orchestrator::OrchestratorConfig;
use hostlane_orchestrator::runtime::OrchestratorRuntime;
use hostlane_orchestrator::store::{PostgresInstanceStore, PostgresUsageStore};
use hostlane_orchestrator::telemetry::TelemetryConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hostlane_orchestrator=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        network = %config.docker_network,
        subnet = %config.subnet,
        zone = %config.dns_zone,
        "Starting Hostlane Orchestrator"
    );

    // Connect to database
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;

    info!("Connected to database");

    migrations::run(&pool).await?;

    info!("Database schema verified");

    // Container runtime and its network
    let docker_config = DockerConfig {
        host: config.docker_host.clone(),
        network: config.docker_network.clone(),
        subnet: config.subnet,
        stop_grace_secs: 10,
        pull_on_create: true,
    };
    let docker = DockerRuntime::connect(docker_config)?;
    let gateway = docker.ensure_network().await?;
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(docker);
    info!(runtime_type = runtime.runtime_type(), "Container runtime initialized");

    // DNS backend, chosen once
    let dns: Arc<dyn DnsProvider> = match &config.dns_backend {
        DnsBackend::Api {
            base_url,
            username,
            password,
        } => Arc::new(AdGuardDnsProvider::new(
            base_url.clone(),
            username.clone(),
            password.clone(),
            config.call_timeout,
        )?),
        DnsBackend::Cli { path } => Arc::new(CliDnsProvider::new(path.clone())),
    };
    info!(provider_type = dns.provider_type(), "DNS provider initialized");

    let mut reserved = config.reserved_addresses.clone();
    reserved.push(gateway);
    let allocator = Arc::new(NetworkAllocator::new(config.subnet, reserved));

    let runtime = OrchestratorRuntime::builder()
        .instance_store(Arc::new(PostgresInstanceStore::new(pool.clone())))
        .usage_store(Arc::new(PostgresUsageStore::new(pool)))
        .container_runtime(runtime)
        .dns_provider(dns)
        .allocator(allocator)
        .orchestrator_config(OrchestratorConfig {
            image: config.instance_image.clone(),
            port: config.instance_port,
            domain: config.domain.clone(),
            call_timeout: config.call_timeout,
            max_concurrent_operations: config.max_concurrent_operations,
            ..Default::default()
        })
        .dns_config(DnsReconcilerConfig {
            zone: config.dns_zone.clone(),
            call_timeout: config.call_timeout,
            ..Default::default()
        })
        .telemetry_config(TelemetryConfig {
            interval: config.monitor_interval,
            ..Default::default()
        })
        .sweep_config(DnsSweepWorkerConfig {
            interval: config.dns_sweep_interval,
            degraded_max_age: config.dns_degraded_max_age,
        })
        .build()?
        .start()
        .await?;

    info!(
        interrupted = runtime.recovery().interrupted.len(),
        "Orchestrator ready"
    );

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Graceful shutdown
    runtime.shutdown().await?;

    info!("Hostlane Orchestrator shut down");

    Ok(())
}
