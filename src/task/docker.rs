use std::collections::BTreeMap;

use async_trait::async_trait;
use bollard::container::{
    CreateContainerOptions, InspectContainerOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::secret::{HostConfig, Resources, RestartPolicy, RestartPolicyNameEnum};
use bollard::Docker;
use futures_util::stream::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, warn};

use super::types::{Config, PortBinding};

#[derive(Debug, Error)]
pub enum DockerError {
    #[error("failed to pull image {image}: {source}")]
    ImagePull {
        image: String,
        source: bollard::errors::Error,
    },
    #[error("failed to create container {name}: {source}")]
    ContainerCreate {
        name: String,
        source: bollard::errors::Error,
    },
    #[error("failed to start container {container_id}: {source}")]
    ContainerStart {
        container_id: String,
        source: bollard::errors::Error,
    },
    #[error("failed to stop container {container_id}: {source}")]
    ContainerStop {
        container_id: String,
        source: bollard::errors::Error,
    },
    #[error("failed to inspect container {container_id}: {source}")]
    ContainerInspect {
        container_id: String,
        source: bollard::errors::Error,
    },
    #[error("task has no container id")]
    MissingContainerId,
}

/// The runtime's structured view of a container, reduced to the fields the
/// worker reconciler needs: the status string and the published port map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub status: String,
    pub ports: BTreeMap<String, Vec<PortBinding>>,
}

/// Abstract container driver. The worker core only sees this trait, so the
/// lifecycle logic can be exercised without a container daemon.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Pull the image, create a container from `config`, and start it.
    /// Returns the container id. No partial success is exposed: any failing
    /// step returns the error.
    async fn run(&self, config: &Config) -> Result<String, DockerError>;

    /// Stop the container immediately, then remove it together with its
    /// volumes. A removal failure is logged but does not undo a successful
    /// stop.
    async fn stop(&self, container_id: &str) -> Result<(), DockerError>;

    /// Look up the container. A container unknown to the runtime yields
    /// `Ok(None)` rather than an error.
    async fn inspect(&self, container_id: &str) -> Result<Option<ContainerInfo>, DockerError>;
}

/// [`ContainerRuntime`] backed by the local Docker daemon.
#[derive(Debug, Clone)]
pub struct DockerClient {
    client: Docker,
}

impl DockerClient {
    pub fn new(client: Docker) -> Self {
        DockerClient { client }
    }
}

#[async_trait]
impl ContainerRuntime for DockerClient {
    async fn run(&self, config: &Config) -> Result<String, DockerError> {
        debug!(image = %config.image, "pulling image");
        let mut pull = self.client.create_image(
            Some(CreateImageOptions {
                from_image: config.image.clone(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = pull.next().await {
            match progress {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(image = %config.image, %status, "image pull progress");
                    }
                }
                Err(source) => {
                    return Err(DockerError::ImagePull {
                        image: config.image.clone(),
                        source,
                    });
                }
            }
        }

        let restart_policy = RestartPolicy {
            name: Some(restart_policy_name(&config.restart_policy)),
            maximum_retry_count: None,
        };

        let resources = Resources {
            memory: Some(config.memory as i64),
            nano_cpus: Some((config.cpu * 1_000_000_000.0) as i64),
            ..Default::default()
        };

        let host_config = HostConfig {
            restart_policy: Some(restart_policy),
            memory: resources.memory,
            nano_cpus: resources.nano_cpus,
            publish_all_ports: Some(true),
            ..Default::default()
        };

        let container_config = bollard::container::Config {
            image: Some(config.image.clone()),
            tty: Some(false),
            env: Some(config.env.clone()),
            exposed_ports: Some(
                config
                    .exposed_ports
                    .iter()
                    .map(|port| (port.clone(), std::collections::HashMap::new()))
                    .collect(),
            ),
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = self
            .client
            .create_container(
                Some(CreateContainerOptions {
                    name: config.name.clone(),
                    ..Default::default()
                }),
                container_config,
            )
            .await
            .map_err(|source| DockerError::ContainerCreate {
                name: config.name.clone(),
                source,
            })?;

        self.client
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|source| DockerError::ContainerStart {
                container_id: created.id.clone(),
                source,
            })?;

        debug!(container_id = %created.id, name = %config.name, "container started");
        self.stream_logs(&created.id).await;

        Ok(created.id)
    }

    async fn stop(&self, container_id: &str) -> Result<(), DockerError> {
        debug!(%container_id, "stopping container");
        self.client
            .stop_container(container_id, Some(StopContainerOptions { t: 0 }))
            .await
            .map_err(|source| DockerError::ContainerStop {
                container_id: container_id.to_string(),
                source,
            })?;

        if let Err(err) = self
            .client
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    v: true,
                    force: false,
                    link: false,
                }),
            )
            .await
        {
            error!(%container_id, error = %err, "failed to remove container");
        }

        Ok(())
    }

    async fn inspect(&self, container_id: &str) -> Result<Option<ContainerInfo>, DockerError> {
        let response = match self
            .client
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(response) => response,
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => return Ok(None),
            Err(source) => {
                return Err(DockerError::ContainerInspect {
                    container_id: container_id.to_string(),
                    source,
                });
            }
        };

        let status = response
            .state
            .and_then(|state| state.status)
            .map(|status| status.to_string())
            .unwrap_or_default();

        let mut ports = BTreeMap::new();
        if let Some(port_map) = response.network_settings.and_then(|settings| settings.ports) {
            for (port, bindings) in port_map {
                let bindings = bindings
                    .unwrap_or_default()
                    .into_iter()
                    .map(|binding| PortBinding {
                        host_ip: binding.host_ip.unwrap_or_default(),
                        host_port: binding.host_port.unwrap_or_default(),
                    })
                    .collect();
                ports.insert(port, bindings);
            }
        }

        Ok(Some(ContainerInfo { status, ports }))
    }
}

impl DockerClient {
    /// Drains whatever log output the container has produced so far into the
    /// diagnostic log.
    async fn stream_logs(&self, container_id: &str) {
        let mut logs = self.client.logs(
            container_id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );
        while let Some(entry) = logs.next().await {
            match entry {
                Ok(output) => debug!(%container_id, log = %output, "container output"),
                Err(err) => {
                    warn!(%container_id, error = %err, "failed to read container logs");
                    break;
                }
            }
        }
    }
}

fn restart_policy_name(policy: &str) -> RestartPolicyNameEnum {
    match policy {
        "" => RestartPolicyNameEnum::EMPTY,
        "always" => RestartPolicyNameEnum::ALWAYS,
        "unless-stopped" => RestartPolicyNameEnum::UNLESS_STOPPED,
        "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
        _ => RestartPolicyNameEnum::NO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_policy_mapping_covers_known_values() {
        assert_eq!(restart_policy_name(""), RestartPolicyNameEnum::EMPTY);
        assert_eq!(restart_policy_name("always"), RestartPolicyNameEnum::ALWAYS);
        assert_eq!(
            restart_policy_name("unless-stopped"),
            RestartPolicyNameEnum::UNLESS_STOPPED
        );
        assert_eq!(
            restart_policy_name("on-failure"),
            RestartPolicyNameEnum::ON_FAILURE
        );
        assert_eq!(restart_policy_name("bogus"), RestartPolicyNameEnum::NO);
    }
}
