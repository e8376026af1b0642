// src/engine.rs — ContainerEngine adapter (spec §4.3 design notes, §6.2)
//
// The core depends only on the `ContainerEngine` trait. `BollardEngine` is the
// concrete adapter over the Docker daemon, grounded on the container-spec
// fields modeled by `testcontainers-rs` (see examples/other_examples).

use std::collections::BTreeMap;
use std::net::IpAddr;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::id::KernelId;

#[derive(Debug, Clone, Default)]
pub struct ImageLabels {
    pub maxmem: Option<String>,
    pub timeout: Option<u64>,
    pub maxcores: Option<usize>,
    pub corecount_envs: Vec<String>,
    pub nvidia_enabled: bool,
    pub version: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub tty: bool,
    pub stop_signal: String,
    pub exposed_ports: Vec<u16>,
    pub bind_workdir: (String, String),
    pub extra_mounts: Vec<(String, String)>,
    pub mem_limit_bytes: i64,
    pub cpuset_cpus: String,
    pub cpuset_mems: String,
    pub env: BTreeMap<String, String>,
    pub device_requests: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ContainerHandle {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    pub action: String,
    pub container_name: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("not running")]
    NotRunning,
    #[error("not found")]
    NotFound,
    #[error("already in progress")]
    AlreadyInProgress,
    #[error("transient: {0}")]
    Transient(String),
    #[error("other: {0}")]
    Other(String),
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound)
    }

    pub fn is_not_running(&self) -> bool {
        matches!(self, EngineError::NotRunning)
    }

    pub fn is_already_in_progress(&self) -> bool {
        matches!(self, EngineError::AlreadyInProgress)
    }
}

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn inspect_image(&self, name: &str) -> Result<ImageLabels, EngineError>;
    async fn create(&self, spec: ContainerSpec) -> Result<ContainerHandle, EngineError>;
    async fn start(&self, handle: &ContainerHandle) -> Result<(), EngineError>;
    async fn kill(&self, handle: &ContainerHandle) -> Result<(), EngineError>;
    async fn delete(&self, handle: &ContainerHandle) -> Result<(), EngineError>;
    /// Host port bound to the given container TCP port.
    async fn port_of(&self, handle: &ContainerHandle, container_port: u16) -> Result<u16, EngineError>;
    async fn container_ip(&self, handle: &ContainerHandle) -> Result<IpAddr, EngineError>;
    async fn list_volumes(&self) -> Result<Vec<String>, EngineError>;
    fn events(&self) -> BoxStream<'static, EngineEvent>;
}

/// Container name format required by spec §6.2.
pub fn container_name(lang: &str, id: KernelId) -> String {
    format!("kernel.{lang}.{id}")
}

/// Parses the KernelId back out of a `kernel.<lang>.<id>` container name,
/// used by EventMonitor (spec §4.5). Returns None for unrecognized names.
pub fn parse_container_name(name: &str) -> Option<(String, KernelId)> {
    let rest = name.strip_prefix("kernel.")?;
    let (lang, id_str) = rest.rsplit_once('.')?;
    let id = KernelId::parse(id_str)?;
    Some((lang.to_string(), id))
}

/// Parses a human-readable memory size ("128m", "1g", "4096") into bytes.
/// Falls back to `default_bytes` on anything malformed, mirroring the
/// best-effort label parsing in the original Backend.AI agent.
pub fn parse_mem_limit(label: Option<&str>, default_bytes: i64) -> i64 {
    let Some(label) = label else {
        return default_bytes;
    };
    let label = label.trim();
    if label.is_empty() {
        return default_bytes;
    }

    let (digits, suffix) = match label.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => label.split_at(idx),
        None => (label, ""),
    };

    let Ok(value) = digits.parse::<i64>() else {
        return default_bytes;
    };

    let multiplier: i64 = match suffix.to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => 1024,
        "m" | "mb" | "mib" => 1024 * 1024,
        "g" | "gb" | "gib" => 1024 * 1024 * 1024,
        "t" | "tb" | "tib" => 1024i64 * 1024 * 1024 * 1024,
        _ => return default_bytes,
    };

    value.saturating_mul(multiplier)
}

pub struct BollardEngine {
    docker: bollard::Docker,
}

impl BollardEngine {
    pub fn connect() -> Result<Self, EngineError> {
        let docker = bollard::Docker::connect_with_local_defaults()
            .map_err(|e| EngineError::Other(e.to_string()))?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerEngine for BollardEngine {
    async fn inspect_image(&self, name: &str) -> Result<ImageLabels, EngineError> {
        let info = self
            .docker
            .inspect_image(name)
            .await
            .map_err(map_bollard_err)?;
        let labels = info
            .config
            .and_then(|c| c.labels)
            .unwrap_or_default();

        let corecount_envs = labels
            .get("envs.corecount")
            .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();

        Ok(ImageLabels {
            maxmem: labels.get("maxmem").cloned(),
            timeout: labels.get("timeout").and_then(|v| v.parse().ok()),
            maxcores: labels.get("maxcores").and_then(|v| v.parse().ok()),
            corecount_envs,
            nvidia_enabled: labels
                .get("nvidia.enabled")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            version: labels.get("version").and_then(|v| v.parse().ok()),
        })
    }

    async fn create(&self, spec: ContainerSpec) -> Result<ContainerHandle, EngineError> {
        use bollard::container::Config;
        use bollard::models::{HostConfig, PortBinding};

        let mut port_bindings = std::collections::HashMap::new();
        let mut exposed_ports = std::collections::HashMap::new();
        for port in &spec.exposed_ports {
            let key = format!("{port}/tcp");
            exposed_ports.insert(key.clone(), std::collections::HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: None,
                }]),
            );
        }

        let mut binds = vec![format!("{}:{}:rw", spec.bind_workdir.0, spec.bind_workdir.1)];
        for (src, dst) in &spec.extra_mounts {
            binds.push(format!("{src}:{dst}:rw"));
        }

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let host_config = HostConfig {
            binds: Some(binds),
            memory: Some(spec.mem_limit_bytes),
            memory_swap: Some(spec.mem_limit_bytes),
            cpuset_cpus: Some(spec.cpuset_cpus.clone()),
            cpuset_mems: Some(spec.cpuset_mems.clone()),
            security_opt: Some(vec!["seccomp=unconfined".to_string()]),
            port_bindings: Some(port_bindings),
            publish_all_ports: Some(true),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            tty: Some(spec.tty),
            stop_signal: Some(spec.stop_signal.clone()),
            exposed_ports: Some(exposed_ports),
            env: Some(env),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = bollard::container::CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let result = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(map_bollard_err)?;

        Ok(ContainerHandle { id: result.id })
    }

    async fn start(&self, handle: &ContainerHandle) -> Result<(), EngineError> {
        self.docker
            .start_container::<String>(&handle.id, None)
            .await
            .map_err(map_bollard_err)
    }

    async fn kill(&self, handle: &ContainerHandle) -> Result<(), EngineError> {
        self.docker
            .kill_container::<String>(&handle.id, None)
            .await
            .map_err(map_bollard_err)
    }

    async fn delete(&self, handle: &ContainerHandle) -> Result<(), EngineError> {
        self.docker
            .remove_container(&handle.id, None)
            .await
            .map_err(map_bollard_err)
    }

    async fn port_of(&self, handle: &ContainerHandle, container_port: u16) -> Result<u16, EngineError> {
        let info = self
            .docker
            .inspect_container(&handle.id, None)
            .await
            .map_err(map_bollard_err)?;

        let ports = info
            .network_settings
            .and_then(|n| n.ports)
            .ok_or_else(|| EngineError::Other("no port map".into()))?;

        let key = format!("{container_port}/tcp");
        let bindings = ports
            .get(&key)
            .and_then(|b| b.clone())
            .ok_or_else(|| EngineError::Other(format!("port {container_port} not published")))?;

        bindings
            .first()
            .and_then(|b| b.host_port.as_ref())
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| EngineError::Other(format!("no host port for {container_port}")))
    }

    async fn container_ip(&self, handle: &ContainerHandle) -> Result<IpAddr, EngineError> {
        let info = self
            .docker
            .inspect_container(&handle.id, None)
            .await
            .map_err(map_bollard_err)?;

        info.network_settings
            .and_then(|n| n.ip_address)
            .filter(|s| !s.is_empty())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| EngineError::Other("no container ip".into()))
    }

    async fn list_volumes(&self) -> Result<Vec<String>, EngineError> {
        let result = self
            .docker
            .list_volumes::<String>(None)
            .await
            .map_err(map_bollard_err)?;
        Ok(result
            .volumes
            .unwrap_or_default()
            .into_iter()
            .map(|v| v.name)
            .collect())
    }

    fn events(&self) -> BoxStream<'static, EngineEvent> {
        use futures_util::StreamExt;

        let stream = self.docker.events::<String>(None).filter_map(|evt| async move {
            let evt = evt.ok()?;
            Some(EngineEvent {
                action: evt.action.unwrap_or_default(),
                container_name: evt
                    .actor
                    .and_then(|a| a.attributes)
                    .and_then(|attrs| attrs.get("name").cloned()),
            })
        });
        Box::pin(stream)
    }
}

fn map_bollard_err(e: bollard::errors::Error) -> EngineError {
    use bollard::errors::Error as E;
    match &e {
        E::DockerResponseServerError { status_code, .. } if *status_code == 404 => {
            EngineError::NotFound
        }
        E::DockerResponseServerError { status_code, message } if *status_code == 500 => {
            if message.to_lowercase().contains("not running") {
                EngineError::NotRunning
            } else {
                EngineError::Transient(message.clone())
            }
        }
        E::DockerResponseServerError { status_code, message } if *status_code == 400 => {
            if message.to_lowercase().contains("already in progress") {
                EngineError::AlreadyInProgress
            } else {
                EngineError::Other(message.clone())
            }
        }
        E::DockerResponseServerError { status_code, message } if *status_code >= 500 => {
            EngineError::Transient(message.clone())
        }
        other => EngineError::Other(other.to_string()),
    }
}
