use std::path::PathBuf;

use mitm_topology::TopologyError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CommanderError {
    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error("{operation} '{name}' failed: {source}")]
    Runtime {
        operation: &'static str,
        name: String,
        #[source]
        source: bollard::errors::Error,
    },

    #[error("build of image '{image}' failed: {detail}")]
    BuildFailed { image: String, detail: String },

    #[error("template not found: {0}")]
    Template(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CommanderError {
    pub fn runtime(
        operation: &'static str,
        name: impl Into<String>,
        source: bollard::errors::Error,
    ) -> Self {
        Self::Runtime {
            operation,
            name: name.into(),
            source,
        }
    }
}
