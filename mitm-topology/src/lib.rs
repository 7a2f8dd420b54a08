pub mod config;
pub mod error;
pub mod ordering;
pub mod ports;
pub mod redirect;
pub mod topology;

pub use config::{
    ConfigDoc, Connection, Destination, Entity, NetworkSettings, Protocol, Role, TcpRedirection,
    UNSPECIFIED_PORT,
};
pub use error::TopologyError;
pub use ports::PortAllocator;
