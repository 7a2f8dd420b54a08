use thiserror::Error;

#[derive(Error, Debug)]
pub enum TopologyError {
    #[error("entity '{entity}' is missing required field '{field}'")]
    MissingField { entity: String, field: &'static str },

    #[error("duplicate entity name: {0}")]
    DuplicateEntity(String),

    #[error("entity '{entity}' references unknown entity '{reference}'")]
    UnresolvedReference { entity: String, reference: String },

    #[error("no fuzzer entity found in config")]
    MissingFuzzer,

    #[error("more than one fuzzer entity declared; a run supports exactly one")]
    MultipleFuzzers,

    #[error("dependency cycle detected at entity '{0}'")]
    DependencyCycle(String),

    #[error("proxy port band exhausted")]
    PortExhausted,

    #[error("malformed config document: {0}")]
    InvalidDocument(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
