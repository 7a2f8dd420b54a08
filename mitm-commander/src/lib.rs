pub mod artifacts;
pub mod error;
pub mod orchestrator;
pub mod runtime;

pub use error::CommanderError;
pub use orchestrator::{Orchestrator, RunOptions};
pub use runtime::{ContainerOps, ContainerSpec, DockerRuntime};
