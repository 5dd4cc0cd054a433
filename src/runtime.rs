//! Container runtime adapter.
//!
//! Wraps the local Docker engine behind the `ContainerRuntime` trait so the
//! lifecycle manager can be exercised against a scripted fake in tests.

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerCfg, InspectContainerOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerState, HostConfig, PortBinding};
use bollard::Docker;
use futures_util::StreamExt;
use std::collections::HashMap;
use tracing::{debug, info};

use crate::error::{ContainerPhase, GatewayError, Result};
use crate::registry::ServerStatus;

/// Grace period given to a container before forceful termination.
const STOP_GRACE_PERIOD_SECS: i64 = 10;

/// Settings for spinning up a backend container. Ephemeral; built from a
/// server record for each start operation.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub image: String,
    pub env: HashMap<String, String>,
    /// Port specs of the form `hostPort:containerPort/protocol`. An empty
    /// list publishes nothing.
    pub ports: Vec<String>,
    /// Memory limit in bytes; zero means unbounded.
    pub memory_limit: i64,
    /// CPU limit in fractional cores; zero means unbounded.
    pub cpu_limit: f64,
}

/// Lifecycle operations on backend containers.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;
    async fn start(&self, container_id: &str) -> Result<()>;
    async fn stop(&self, container_id: &str) -> Result<()>;
    async fn remove(&self, container_id: &str) -> Result<()>;
    async fn status(&self, container_id: &str) -> Result<ServerStatus>;
}

/// Docker-backed container runtime.
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon via the default socket.
    pub fn connect() -> Result<Self> {
        let client = Docker::connect_with_local_defaults().map_err(|e| {
            debug!("Docker daemon connection failed: {}", e);
            GatewayError::ContainerRuntimeUnavailable
        })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        // Ensure the image is available before creating the container. A
        // pull failure surfaces as a distinct image-acquisition error.
        let mut pull = self.client.create_image(
            Some(CreateImageOptions {
                from_image: spec.image.clone(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = pull.next().await {
            progress.map_err(|e| GatewayError::container(ContainerPhase::Pull, e))?;
        }

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let (exposed_ports, port_bindings) = parse_port_specs(&spec.ports)?;

        let mut host_config = HostConfig {
            port_bindings,
            ..Default::default()
        };
        if spec.memory_limit > 0 {
            host_config.memory = Some(spec.memory_limit);
        }
        if spec.cpu_limit > 0.0 {
            host_config.nano_cpus = Some((spec.cpu_limit * 1e9) as i64);
        }

        let container_config = ContainerCfg {
            image: Some(spec.image.clone()),
            env: Some(env),
            exposed_ports,
            host_config: Some(host_config),
            ..Default::default()
        };

        let response = self
            .client
            .create_container::<String, String>(None, container_config)
            .await
            .map_err(|e| GatewayError::container(ContainerPhase::Create, e))?;

        info!(container_id = %response.id, image = %spec.image, "container created");
        Ok(response.id)
    }

    async fn start(&self, container_id: &str) -> Result<()> {
        self.client
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| GatewayError::container(ContainerPhase::Start, e))
    }

    async fn stop(&self, container_id: &str) -> Result<()> {
        self.client
            .stop_container(
                container_id,
                Some(StopContainerOptions {
                    t: STOP_GRACE_PERIOD_SECS,
                }),
            )
            .await
            .map_err(|e| GatewayError::container(ContainerPhase::Stop, e))
    }

    async fn remove(&self, container_id: &str) -> Result<()> {
        self.client
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| GatewayError::container(ContainerPhase::Remove, e))
    }

    async fn status(&self, container_id: &str) -> Result<ServerStatus> {
        let info = self
            .client
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| GatewayError::container(ContainerPhase::Inspect, e))?;
        Ok(state_to_status(info.state.as_ref()))
    }
}

/// Map the engine's native container state onto the server lifecycle.
fn state_to_status(state: Option<&ContainerState>) -> ServerStatus {
    let Some(state) = state else {
        return ServerStatus::Error;
    };
    if state.dead == Some(true) {
        ServerStatus::Error
    } else if state.restarting == Some(true) {
        ServerStatus::Starting
    } else if state.running == Some(true) {
        ServerStatus::Running
    } else {
        ServerStatus::Stopped
    }
}

type ExposedPorts = Option<HashMap<String, HashMap<(), ()>>>;
type PortBindings = Option<HashMap<String, Option<Vec<PortBinding>>>>;

/// Parse port specs like `8080:80/tcp` into engine exposed-port and binding
/// maps. Accepts `containerPort/protocol` and bare `containerPort` forms;
/// protocol defaults to tcp.
fn parse_port_specs(ports: &[String]) -> Result<(ExposedPorts, PortBindings)> {
    if ports.is_empty() {
        return Ok((None, None));
    }

    let mut exposed = HashMap::new();
    let mut bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();

    for spec in ports {
        let (ports_part, protocol) = match spec.split_once('/') {
            Some((ports_part, protocol)) => (ports_part, protocol),
            None => (spec.as_str(), "tcp"),
        };

        let (host_port, container_port) = match ports_part.split_once(':') {
            Some((host, container)) => (Some(host), container),
            None => (None, ports_part),
        };

        container_port.parse::<u16>().map_err(|_| {
            GatewayError::InvalidRequest(format!("invalid port spec: {}", spec))
        })?;
        if let Some(host) = host_port {
            host.parse::<u16>().map_err(|_| {
                GatewayError::InvalidRequest(format!("invalid port spec: {}", spec))
            })?;
        }

        let key = format!("{}/{}", container_port, protocol);
        exposed.insert(key.clone(), HashMap::new());

        if let Some(host) = host_port {
            bindings
                .entry(key)
                .or_insert_with(|| Some(Vec::new()))
                .get_or_insert_with(Vec::new)
                .push(PortBinding {
                    host_ip: None,
                    host_port: Some(host.to_string()),
                });
        }
    }

    Ok((Some(exposed), Some(bindings)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_port_spec() {
        let (exposed, bindings) =
            parse_port_specs(&["8080:80/tcp".to_string()]).unwrap();

        let exposed = exposed.unwrap();
        assert!(exposed.contains_key("80/tcp"));

        let bindings = bindings.unwrap();
        let binding = bindings["80/tcp"].as_ref().unwrap();
        assert_eq!(binding[0].host_port.as_deref(), Some("8080"));
    }

    #[test]
    fn test_parse_container_only_specs() {
        let (exposed, bindings) =
            parse_port_specs(&["9000/udp".to_string(), "3000".to_string()]).unwrap();

        let exposed = exposed.unwrap();
        assert!(exposed.contains_key("9000/udp"));
        assert!(exposed.contains_key("3000/tcp"));

        // No host side, so nothing is bound.
        assert!(bindings.unwrap().is_empty());
    }

    #[test]
    fn test_parse_empty_port_list() {
        let (exposed, bindings) = parse_port_specs(&[]).unwrap();
        assert!(exposed.is_none());
        assert!(bindings.is_none());
    }

    #[test]
    fn test_parse_invalid_port_spec() {
        assert!(parse_port_specs(&["web:80".to_string()]).is_err());
        assert!(parse_port_specs(&["8080:notaport/tcp".to_string()]).is_err());
    }

    #[test]
    fn test_state_mapping() {
        assert_eq!(state_to_status(None), ServerStatus::Error);

        let state = ContainerState {
            dead: Some(true),
            ..Default::default()
        };
        assert_eq!(state_to_status(Some(&state)), ServerStatus::Error);

        let state = ContainerState {
            restarting: Some(true),
            ..Default::default()
        };
        assert_eq!(state_to_status(Some(&state)), ServerStatus::Starting);

        let state = ContainerState {
            running: Some(true),
            ..Default::default()
        };
        assert_eq!(state_to_status(Some(&state)), ServerStatus::Running);

        let state = ContainerState::default();
        assert_eq!(state_to_status(Some(&state)), ServerStatus::Stopped);
    }

    #[test]
    fn test_spec_defaults_unbounded() {
        let spec = ContainerSpec {
            image: "demo:latest".to_string(),
            ..Default::default()
        };
        assert_eq!(spec.memory_limit, 0);
        assert_eq!(spec.cpu_limit, 0.0);
        assert!(spec.ports.is_empty());
    }
}
