//! Container runtime operations behind a trait seam.
//!
//! The orchestrator only talks to `ContainerOps`; `DockerRuntime` is the
//! bollard-backed implementation. Every call is blocking from the driver's
//! point of view: the orchestrator awaits each one to completion before
//! issuing the next.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use bollard::container::{Config, CreateContainerOptions, NetworkingConfig, RemoveContainerOptions};
use bollard::exec::{CreateExecOptions, StartExecOptions};
use bollard::image::BuildImageOptions;
use bollard::network::CreateNetworkOptions;
use bollard::secret::{EndpointIpamConfig, EndpointSettings, HostConfig, Ipam, IpamConfig};
use bollard::Docker;
use futures_util::StreamExt;

use mitm_topology::NetworkSettings;

use crate::error::CommanderError;

#[derive(Clone, Debug)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub network: String,
    pub ip: String,
}

#[async_trait]
pub trait ContainerOps: Send + Sync {
    /// Returns true when an existing network was removed.
    async fn remove_network(&self, name: &str) -> Result<bool, CommanderError>;

    async fn create_network(&self, settings: &NetworkSettings) -> Result<(), CommanderError>;

    /// Builds `tag` from `dockerfile` (a path relative to `context_dir`).
    async fn build_image(
        &self,
        tag: &str,
        dockerfile: &str,
        context_dir: &Path,
    ) -> Result<(), CommanderError>;

    /// Returns true when an existing container was removed.
    async fn remove_container(&self, name: &str) -> Result<bool, CommanderError>;

    async fn run_container(&self, spec: &ContainerSpec) -> Result<(), CommanderError>;

    /// Detached in-container command; the caller never waits on the
    /// workload itself.
    async fn exec_detached(&self, container: &str, command: &str) -> Result<(), CommanderError>;
}

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn new() -> Result<Self, CommanderError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| CommanderError::runtime("connect to docker", "local", e))?;
        Ok(Self { docker })
    }
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn context_tarball(context_dir: &Path) -> Result<Vec<u8>, CommanderError> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.append_dir_all(".", context_dir)?;
    Ok(builder.into_inner()?)
}

#[async_trait]
impl ContainerOps for DockerRuntime {
    async fn remove_network(&self, name: &str) -> Result<bool, CommanderError> {
        match self.docker.remove_network(name).await {
            Ok(()) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(CommanderError::runtime("remove network", name, e)),
        }
    }

    async fn create_network(&self, settings: &NetworkSettings) -> Result<(), CommanderError> {
        let options = CreateNetworkOptions {
            name: settings.docker_network_name.clone(),
            driver: "bridge".to_string(),
            ipam: Ipam {
                config: Some(vec![IpamConfig {
                    subnet: Some(settings.subnet.clone()),
                    gateway: Some(settings.gateway.clone()),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            ..Default::default()
        };
        self.docker
            .create_network(options)
            .await
            .map_err(|e| CommanderError::runtime("create network", &settings.docker_network_name, e))?;
        Ok(())
    }

    async fn build_image(
        &self,
        tag: &str,
        dockerfile: &str,
        context_dir: &Path,
    ) -> Result<(), CommanderError> {
        let contents = context_tarball(context_dir)?;
        let options = BuildImageOptions {
            dockerfile: dockerfile.to_string(),
            t: tag.to_string(),
            rm: true,
            ..Default::default()
        };
        let mut stream = self.docker.build_image(options, None, Some(contents.into()));
        while let Some(message) = stream.next().await {
            let info = message.map_err(|e| CommanderError::runtime("build image", tag, e))?;
            if let Some(line) = info.stream {
                let line = line.trim_end();
                if !line.is_empty() {
                    log::debug!("{line}");
                }
            }
            if let Some(detail) = info.error {
                return Err(CommanderError::BuildFailed {
                    image: tag.to_string(),
                    detail,
                });
            }
        }
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<bool, CommanderError> {
        let options = Some(RemoveContainerOptions {
            force: true,
            ..Default::default()
        });
        match self.docker.remove_container(name, options).await {
            Ok(()) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(CommanderError::runtime("remove container", name, e)),
        }
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<(), CommanderError> {
        let options = Some(CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        });

        let mut endpoints = HashMap::new();
        endpoints.insert(
            spec.network.clone(),
            EndpointSettings {
                ipam_config: Some(EndpointIpamConfig {
                    ipv4_address: Some(spec.ip.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );

        let config = Config {
            image: Some(spec.image.clone()),
            host_config: Some(HostConfig {
                cap_add: Some(vec!["NET_ADMIN".to_string()]),
                ..Default::default()
            }),
            networking_config: Some(NetworkingConfig {
                endpoints_config: endpoints,
            }),
            ..Default::default()
        };

        self.docker
            .create_container(options, config)
            .await
            .map_err(|e| CommanderError::runtime("create container", &spec.name, e))?;
        self.docker
            .start_container::<String>(&spec.name, None)
            .await
            .map_err(|e| CommanderError::runtime("start container", &spec.name, e))?;
        Ok(())
    }

    async fn exec_detached(&self, container: &str, command: &str) -> Result<(), CommanderError> {
        let options = CreateExecOptions {
            cmd: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                command.to_string(),
            ]),
            attach_stdout: Some(false),
            attach_stderr: Some(false),
            ..Default::default()
        };
        let exec = self
            .docker
            .create_exec(container, options)
            .await
            .map_err(|e| CommanderError::runtime("create exec", container, e))?;
        self.docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| CommanderError::runtime("start exec", container, e))?;
        Ok(())
    }
}
