use std::path::PathBuf;

use clap::Parser;

use mitm_commander::error::CommanderError;
use mitm_commander::orchestrator::{Orchestrator, RunOptions};
use mitm_commander::runtime::DockerRuntime;

#[derive(Parser)]
#[command(name = "mitm-commander", about = "Commander for the MITM fuzzing lab")]
struct Cli {
    /// Path to the config YAML
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Path to the Dockerfile template
    #[arg(long, default_value = "Dockerfile.template")]
    template: PathBuf,

    /// Start containers in standby mode (no workload auto-launch)
    #[arg(long)]
    standby: bool,
}

#[tokio::main]
async fn main() {
    simple_logger::SimpleLogger::new().init().unwrap();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        log::error!("{e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), CommanderError> {
    let runtime = DockerRuntime::new()?;
    let mut options = RunOptions::new(cli.config, cli.template);
    options.standby = cli.standby;
    Orchestrator::new(runtime, options).run().await
}
