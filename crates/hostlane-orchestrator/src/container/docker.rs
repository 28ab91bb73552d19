// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Docker runtime backed by bollard.
//!
//! Every instance container joins one user-defined bridge network with a
//! static IPv4 address from the allocator, mounts its named volumes and
//! carries the management labels used to find it again.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config as BollardConfig, CreateContainerOptions, InspectContainerOptions,
    RemoveContainerOptions, Stats, StatsOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::{
    EndpointIpamConfig, EndpointSettings, HostConfig, Ipam, IpamConfig, Mount, MountTypeEnum,
    RestartPolicy, RestartPolicyNameEnum,
};
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use futures::StreamExt;
use tracing::{debug, info, warn};

use super::{
    ContainerError, ContainerHandle, ContainerRuntime, ContainerSpec, ContainerStats,
    INSTANCE_LABEL, Result,
};
use crate::network::Subnet;

/// Where instance data lives inside the container.
const DATA_MOUNT_TARGET: &str = "/home/node/.n8n";
/// Where user files live inside the container.
const FILES_MOUNT_TARGET: &str = "/files";

/// Docker runtime configuration.
#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Daemon endpoint (`unix://...`, `tcp://...`); `None` for local defaults.
    pub host: Option<String>,
    /// User-defined network instances join.
    pub network: String,
    /// Subnet of that network.
    pub subnet: Subnet,
    /// Seconds a container gets to exit before it is killed on stop.
    pub stop_grace_secs: i64,
    /// Pull the image before every create.
    pub pull_on_create: bool,
}

/// Container runtime talking to a Docker daemon.
pub struct DockerRuntime {
    docker: Docker,
    config: DockerConfig,
}

impl DockerRuntime {
    /// Connect to the daemon described by `config`.
    pub fn connect(config: DockerConfig) -> Result<Self> {
        let docker = match config.host.as_deref() {
            Some(host) if host.starts_with("unix://") => Docker::connect_with_socket(
                host,
                120,
                bollard::API_DEFAULT_VERSION,
            ),
            Some(host) => Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION),
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(|e| ContainerError::RuntimeUnavailable(e.to_string()))?;

        Ok(Self { docker, config })
    }

    /// Create the instance network if it does not exist yet.
    ///
    /// Returns the network's gateway, which must never be handed out. An
    /// existing network must carry the configured subnet.
    pub async fn ensure_network(&self) -> Result<Ipv4Addr> {
        match self
            .docker
            .inspect_network(&self.config.network, None::<InspectNetworkOptions<String>>)
            .await
        {
            Ok(network) => {
                let gateway = network_gateway(
                    &self.config.network,
                    network.ipam.as_ref(),
                    self.config.subnet,
                )?;
                debug!(
                    network = %self.config.network,
                    gateway = %gateway,
                    "Container network present"
                );
                return Ok(gateway);
            }
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(classify(e, ContainerError::RuntimeUnavailable)),
        }

        let gateway = self.config.subnet.first_host();
        let options = CreateNetworkOptions {
            name: self.config.network.clone(),
            driver: "bridge".to_string(),
            ipam: Ipam {
                config: Some(vec![IpamConfig {
                    subnet: Some(self.config.subnet.to_string()),
                    gateway: Some(gateway.to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            ..Default::default()
        };
        self.docker
            .create_network(options)
            .await
            .map_err(|e| classify(e, ContainerError::RuntimeUnavailable))?;

        info!(
            network = %self.config.network,
            subnet = %self.config.subnet,
            gateway = %gateway,
            "Created container network"
        );
        Ok(gateway)
    }

    /// Take over a container of the same name if it belongs to the same instance.
    async fn adopt(&self, spec: &ContainerSpec, conflict: String) -> Result<ContainerHandle> {
        let existing = self
            .docker
            .inspect_container(&spec.name, None::<InspectContainerOptions>)
            .await
            .map_err(|e| classify(e, ContainerError::CreateFailed))?;

        let owner = existing
            .config
            .as_ref()
            .and_then(|c| c.labels.as_ref())
            .and_then(|labels| labels.get(INSTANCE_LABEL).cloned());
        match (existing.id, owner) {
            (Some(id), Some(owner)) if owner == spec.instance_id.to_string() => {
                info!(instance_id = %spec.instance_id, container_id = %id, "Adopted existing container");
                Ok(ContainerHandle {
                    id,
                    name: spec.name.clone(),
                })
            }
            _ => Err(ContainerError::CreateFailed(conflict)),
        }
    }

    async fn pull_image(&self, image: &str) {
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(item) = stream.next().await {
            if let Err(e) = item {
                // A cached image still lets create succeed.
                warn!(image = %image, error = %e, "Image pull failed");
                return;
            }
        }
        debug!(image = %image, "Image pulled");
    }
}

/// Container config joining `network` with the spec's static address.
fn container_config(network: &str, spec: &ContainerSpec) -> BollardConfig<String> {
    let mut endpoints = HashMap::new();
    endpoints.insert(
        network.to_string(),
        EndpointSettings {
            ipam_config: Some(EndpointIpamConfig {
                ipv4_address: Some(spec.address.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        },
    );

    let mut exposed_ports = HashMap::new();
    exposed_ports.insert(format!("{}/tcp", spec.port), HashMap::new());

    let host_config = HostConfig {
        memory: Some(spec.limits.memory_bytes()),
        nano_cpus: Some(spec.limits.nano_cpus()),
        network_mode: Some(network.to_string()),
        restart_policy: Some(RestartPolicy {
            name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
            maximum_retry_count: None,
        }),
        mounts: Some(vec![
            volume_mount(&spec.volume, DATA_MOUNT_TARGET),
            volume_mount(&spec.files_volume, FILES_MOUNT_TARGET),
        ]),
        ..Default::default()
    };

    let mut env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    env.sort();

    BollardConfig {
        image: Some(spec.image.clone()),
        env: Some(env),
        labels: Some(spec.labels.clone()),
        exposed_ports: Some(exposed_ports),
        host_config: Some(host_config),
        networking_config: Some(bollard::container::NetworkingConfig {
            endpoints_config: endpoints,
        }),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn runtime_type(&self) -> &'static str {
        "docker"
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        if self.config.pull_on_create {
            self.pull_image(&spec.image).await;
        }

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                container_config(&self.config.network, spec),
            )
            .await;
        let response = match created {
            Ok(response) => response,
            // A timed-out attempt may have created it already.
            Err(BollardError::DockerResponseServerError {
                status_code: 409,
                message,
            }) => return self.adopt(spec, message).await,
            Err(e) => return Err(classify(e, ContainerError::CreateFailed)),
        };

        for warning in &response.warnings {
            warn!(container = %spec.name, warning = %warning, "Docker create warning");
        }

        info!(
            instance_id = %spec.instance_id,
            container_id = %response.id,
            address = %spec.address,
            "Container created"
        );

        Ok(ContainerHandle {
            id: response.id,
            name: spec.name.clone(),
        })
    }

    async fn start(&self, container_id: &str) -> Result<()> {
        match self.docker.start_container::<String>(container_id, None).await {
            Ok(()) => Ok(()),
            // Already running
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(classify(e, ContainerError::StartFailed)),
        }
    }

    async fn stop(&self, container_id: &str) -> Result<()> {
        let options = StopContainerOptions {
            t: self.config.stop_grace_secs,
        };
        match self.docker.stop_container(container_id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(classify(e, ContainerError::StopFailed)),
        }
    }

    async fn remove(&self, container_id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: false,
            link: false,
        };
        match self.docker.remove_container(container_id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container_id = %container_id, "Container already gone");
                Ok(())
            }
            Err(e) => Err(classify(e, ContainerError::RemoveFailed)),
        }
    }

    async fn exists(&self, container_id: &str) -> Result<bool> {
        match self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(_) => Ok(true),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(classify(e, ContainerError::RuntimeUnavailable)),
        }
    }

    async fn stats(&self, container_id: &str) -> Result<ContainerStats> {
        let inspect = self
            .docker
            .inspect_container(container_id, Some(InspectContainerOptions { size: true }))
            .await
            .map_err(|e| ContainerError::Unreachable(e.to_string()))?;

        let running = inspect
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);
        if !running {
            return Err(ContainerError::Unreachable(format!(
                "container {} is not running",
                container_id
            )));
        }

        let mut stream = self.docker.stats(
            container_id,
            Some(StatsOptions {
                stream: false,
                one_shot: false,
            }),
        );
        let stats = match stream.next().await {
            Some(Ok(stats)) => stats,
            Some(Err(e)) => return Err(ContainerError::Unreachable(e.to_string())),
            None => {
                return Err(ContainerError::Unreachable(format!(
                    "no stats returned for {}",
                    container_id
                )));
            }
        };

        let disk = inspect.size_rw.unwrap_or(0).max(0) as u64;
        Ok(snapshot_from(&stats, disk))
    }
}

fn volume_mount(source: &str, target: &str) -> Mount {
    Mount {
        target: Some(target.to_string()),
        source: Some(source.to_string()),
        typ: Some(MountTypeEnum::VOLUME),
        read_only: Some(false),
        ..Default::default()
    }
}

/// Gateway of an existing network whose IPv4 pool must equal `subnet`.
///
/// Docker's default IPAM puts the gateway on the first host when none is set.
fn network_gateway(name: &str, ipam: Option<&Ipam>, subnet: Subnet) -> Result<Ipv4Addr> {
    let pools: Vec<&IpamConfig> = ipam
        .and_then(|ipam| ipam.config.as_ref())
        .map(|configs| configs.iter().collect())
        .unwrap_or_default();

    let mut found = Vec::new();
    for pool in pools {
        let Some(pool_subnet) = pool.subnet.as_deref().and_then(|s| s.parse::<Subnet>().ok())
        else {
            continue;
        };
        if pool_subnet != subnet {
            found.push(pool_subnet.to_string());
            continue;
        }
        let gateway = match pool.gateway.as_deref() {
            Some(gateway) => gateway.parse::<Ipv4Addr>().map_err(|_| {
                ContainerError::NetworkMismatch(format!(
                    "network {} has unparseable gateway '{}'",
                    name, gateway
                ))
            })?,
            None => subnet.first_host(),
        };
        return Ok(gateway);
    }

    Err(ContainerError::NetworkMismatch(format!(
        "network {} uses subnet [{}], expected {}",
        name,
        found.join(", "),
        subnet
    )))
}

/// Convert a Docker stats payload into a snapshot.
fn snapshot_from(stats: &Stats, disk_used_bytes: u64) -> ContainerStats {
    let (network_in_bytes, network_out_bytes) = stats
        .networks
        .as_ref()
        .map(|nets| {
            nets.values().fold((0u64, 0u64), |(rx, tx), n| {
                (rx.saturating_add(n.rx_bytes), tx.saturating_add(n.tx_bytes))
            })
        })
        .unwrap_or((0, 0));

    ContainerStats {
        cpu_fraction: cpu_fraction(
            stats.cpu_stats.cpu_usage.total_usage,
            stats.precpu_stats.cpu_usage.total_usage,
            stats.cpu_stats.system_cpu_usage.unwrap_or(0),
            stats.precpu_stats.system_cpu_usage.unwrap_or(0),
            stats.cpu_stats.online_cpus.unwrap_or(1),
        ),
        memory_used_bytes: stats.memory_stats.usage.unwrap_or(0),
        memory_limit_bytes: stats.memory_stats.limit.unwrap_or(0),
        disk_used_bytes,
        network_in_bytes,
        network_out_bytes,
    }
}

/// CPU usage between two readings, scaled by online CPUs and clamped to 1.0.
fn cpu_fraction(total: u64, pre_total: u64, system: u64, pre_system: u64, cpus: u64) -> f64 {
    let cpu_delta = total.saturating_sub(pre_total) as f64;
    let system_delta = system.saturating_sub(pre_system) as f64;
    if cpu_delta <= 0.0 || system_delta <= 0.0 {
        return 0.0;
    }
    (cpu_delta / system_delta * cpus.max(1) as f64).clamp(0.0, 1.0)
}

fn classify(err: BollardError, ctx: fn(String) -> ContainerError) -> ContainerError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => ContainerError::NotFound(message),
        BollardError::DockerResponseServerError { message, .. } => ctx(message),
        BollardError::RequestTimeoutError => {
            ContainerError::Timeout("docker request timed out".to_string())
        }
        other => ContainerError::RuntimeUnavailable(other.to_string()),
    }
}
