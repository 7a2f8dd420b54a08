//! The run pipeline: compile the redirection topology, then drive the
//! container runtime through network, build, start and launch phases.
//!
//! Every phase fully consumes the previous one's output, and external
//! operations are awaited one at a time. A failing operation aborts the
//! run; nothing already created is rolled back, the next run's
//! remove-then-recreate pass converges instead.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use mitm_topology::{ordering, redirect, topology, ConfigDoc, PortAllocator};

use crate::artifacts;
use crate::error::CommanderError;
use crate::runtime::{ContainerOps, ContainerSpec};

/// Head start granted to the interception node's workload before its
/// dependents launch. A coarse stand-in for a readiness probe.
const FUZZER_GRACE: Duration = Duration::from_millis(200);

#[derive(Clone, Debug)]
pub struct RunOptions {
    pub config_path: PathBuf,
    pub template_path: PathBuf,
    /// Image build context; generated artifacts land in `docker/` below it.
    pub context_dir: PathBuf,
    pub summary_path: PathBuf,
    /// Leave containers idle instead of launching workloads.
    pub standby: bool,
}

impl RunOptions {
    pub fn new(config_path: PathBuf, template_path: PathBuf) -> Self {
        Self {
            config_path,
            template_path,
            context_dir: PathBuf::from("."),
            summary_path: PathBuf::from("entities_config.json"),
            standby: false,
        }
    }
}

pub struct Orchestrator<R: ContainerOps> {
    runtime: R,
    options: RunOptions,
}

impl<R: ContainerOps> Orchestrator<R> {
    pub fn new(runtime: R, options: RunOptions) -> Self {
        Self { runtime, options }
    }

    pub async fn run(&self) -> Result<(), CommanderError> {
        // compile phases, no external side effects yet
        let mut doc = ConfigDoc::load(&self.options.config_path)?;
        topology::validate(&doc)?;
        topology::normalize_udp_ports(&mut doc);

        let mut ports = PortAllocator::new();
        redirect::inject_redirections(&mut doc, &mut ports)?;
        let order = ordering::start_order(&doc)?;
        log::info!("Start order: {}", order.join(" -> "));

        doc.persist(&self.options.config_path)?;
        self.export_summary(&doc)?;

        // network
        if self.runtime.remove_network(&doc.network.docker_network_name).await? {
            log::warn!(
                "Network '{}' existed, removed it",
                doc.network.docker_network_name
            );
        }
        log::info!(
            "Creating network '{}' (subnet {}, gateway {})",
            doc.network.docker_network_name,
            doc.network.subnet,
            doc.network.gateway
        );
        self.runtime.create_network(&doc.network).await?;

        // build artifacts
        let template = artifacts::load_template(&self.options.template_path)?;
        artifacts::generate_all(&doc, &template, &self.options.context_dir)?;

        // containers, dependencies first
        for name in &order {
            self.start_entity(&doc, name).await?;
        }

        if self.options.standby {
            log::info!("Standby mode: containers left idle.");
            return Ok(());
        }
        self.launch_workloads(&doc, &order).await
    }

    fn export_summary(&self, doc: &ConfigDoc) -> Result<(), CommanderError> {
        let summary = serde_json::to_string_pretty(&doc.minimal_summary())?;
        fs::write(&self.options.summary_path, summary)?;
        log::info!(
            "Exported entity metadata -> {}",
            self.options.summary_path.display()
        );
        Ok(())
    }

    async fn start_entity(&self, doc: &ConfigDoc, name: &str) -> Result<(), CommanderError> {
        let Some(entity) = doc.get(name) else {
            return Ok(());
        };
        let image = format!("{name}_image");
        log::info!("Building image '{image}'...");
        self.runtime
            .build_image(&image, &artifacts::dockerfile_name(name), &self.options.context_dir)
            .await?;

        let container = format!("{name}_container");
        if self.runtime.remove_container(&container).await? {
            log::warn!("Container '{container}' existed, removed it");
        }
        log::info!("Running container '{container}'...");
        self.runtime
            .run_container(&ContainerSpec {
                name: container,
                image,
                network: doc.network.docker_network_name.clone(),
                ip: entity.ip.clone(),
            })
            .await?;
        Ok(())
    }

    async fn launch_workloads(&self, doc: &ConfigDoc, order: &[String]) -> Result<(), CommanderError> {
        let Some((fuzzer_name, _)) = doc.fuzzer() else {
            return Ok(());
        };
        let fuzzer_name = fuzzer_name.to_string();

        let mut launch_order = vec![fuzzer_name.clone()];
        launch_order.extend(order.iter().filter(|n| **n != fuzzer_name).cloned());

        for name in launch_order {
            let Some(entity) = doc.get(&name) else {
                continue;
            };
            match artifacts::workload_command(entity) {
                Some(command) => {
                    let container = format!("{name}_container");
                    let line = format!("{command} > /tmp/launcher.log 2>&1");
                    log::info!("Launching workload in '{container}'...");
                    self.runtime.exec_detached(&container, &line).await?;
                    if name == fuzzer_name {
                        tokio::time::sleep(FUZZER_GRACE).await;
                    }
                }
                None => {
                    log::warn!("Entity '{name}' has no binary_path; workload not launched");
                }
            }
        }
        Ok(())
    }
}
