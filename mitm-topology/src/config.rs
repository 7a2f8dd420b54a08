//! Typed view of the lab config document.
//!
//! The YAML document has a `network` section and an `entities` section. An
//! entry under `entities` is either a single entity record or a group, a
//! mapping whose values are themselves entity records; groups are flattened
//! one level before use. The whole document is deserialized once, threaded
//! through every phase in memory, and persisted once.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::json;
use serde_yaml::{Mapping, Value};

use crate::error::TopologyError;

/// Sentinel for "no fixed port"; rule generation drops destination-port
/// matching for it.
pub const UNSPECIFIED_PORT: i32 = -1;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkSettings {
    pub docker_network_name: String,
    pub subnet: String,
    pub gateway: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "fuzzer")]
    Fuzzer,
    #[serde(rename = "server")]
    Server,
    #[serde(rename = "fuzzed-client")]
    FuzzedClient,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Destination {
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
}

impl Destination {
    pub fn port_or_sentinel(&self) -> i32 {
        self.port.unwrap_or(UNSPECIFIED_PORT)
    }
}

/// One bidirectional UDP path between two entities, with the four proxy
/// ports the interception node dedicates to it (one recv/send pair per
/// direction).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub entity_a_ip: String,
    pub entity_a_port: i32,
    pub entity_a_proxy_port_recv: u16,
    pub entity_a_proxy_port_send: u16,
    pub entity_b_ip: String,
    pub entity_b_port: i32,
    pub entity_b_proxy_port_recv: u16,
    pub entity_b_proxy_port_send: u16,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TcpRedirection {
    pub server_ip: String,
    pub server_port: i32,
    pub proxy_port: u16,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Entity {
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
    pub role: Role,
    pub protocol: Protocol,
    #[serde(default)]
    pub fuzzed: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub destinations: Vec<Destination>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_to: Option<Destination>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_with: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary_path: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connections: Vec<Connection>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tcp_redirections: Vec<TcpRedirection>,
}

impl Entity {
    pub fn port_or_sentinel(&self) -> i32 {
        self.port.unwrap_or(UNSPECIFIED_PORT)
    }
}

/// The in-memory config document. Entity declaration order is preserved so
/// rule emission and start-order computation are deterministic for a given
/// file.
#[derive(Clone, Debug)]
pub struct ConfigDoc {
    pub network: NetworkSettings,
    pub entities: Vec<(String, Entity)>,
}

impl ConfigDoc {
    pub fn load(path: &Path) -> Result<Self, TopologyError> {
        let text = fs::read_to_string(path)?;
        let doc = Self::from_str(&text)?;
        log::info!("Loaded config: {}", path.display());
        Ok(doc)
    }

    pub fn from_str(text: &str) -> Result<Self, TopologyError> {
        let root: Value = serde_yaml::from_str(text)?;
        let root = root
            .as_mapping()
            .ok_or_else(|| TopologyError::InvalidDocument("document root is not a mapping".into()))?;

        let network = section(root, "network")?;
        let network: NetworkSettings = serde_yaml::from_value(Value::Mapping(network.clone()))?;

        let entities = section(root, "entities")?;
        let entities = flatten_entities(entities)?;

        Ok(Self { network, entities })
    }

    pub fn to_yaml(&self) -> Result<String, TopologyError> {
        let mut entities = Mapping::new();
        for (name, entity) in &self.entities {
            entities.insert(Value::String(name.clone()), serde_yaml::to_value(entity)?);
        }
        let mut root = Mapping::new();
        root.insert(Value::from("network"), serde_yaml::to_value(&self.network)?);
        root.insert(Value::from("entities"), Value::Mapping(entities));
        Ok(serde_yaml::to_string(&Value::Mapping(root))?)
    }

    pub fn persist(&self, path: &Path) -> Result<(), TopologyError> {
        fs::write(path, self.to_yaml()?)?;
        log::info!("Updated config file saved: {}", path.display());
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Entity> {
        self.entities.iter().find(|(n, _)| n == name).map(|(_, e)| e)
    }

    pub fn fuzzer(&self) -> Option<(&str, &Entity)> {
        self.entities
            .iter()
            .find(|(_, e)| e.role == Role::Fuzzer)
            .map(|(n, e)| (n.as_str(), e))
    }

    pub fn fuzzer_mut(&mut self) -> Option<&mut Entity> {
        self.entities
            .iter_mut()
            .find(|(_, e)| e.role == Role::Fuzzer)
            .map(|(_, e)| e)
    }

    /// Compact per-protocol summary of every entity for tooling that does
    /// not need the full build detail.
    pub fn minimal_summary(&self) -> serde_json::Value {
        let mut udp = serde_json::Map::new();
        let mut tcp = serde_json::Map::new();
        for (name, entity) in &self.entities {
            let destinations: Vec<&Destination> = match entity.protocol {
                Protocol::Udp => entity.destinations.iter().collect(),
                Protocol::Tcp => entity.connect_to.iter().collect(),
            };
            let entry = json!({
                "ip": entity.ip,
                "port": entity.port,
                "role": entity.role,
                "destinations": destinations,
            });
            match entity.protocol {
                Protocol::Udp => udp.insert(name.clone(), entry),
                Protocol::Tcp => tcp.insert(name.clone(), entry),
            };
        }
        json!({ "udp": udp, "tcp": tcp })
    }
}

fn section<'a>(root: &'a Mapping, name: &'static str) -> Result<&'a Mapping, TopologyError> {
    root.iter()
        .find(|(k, _)| k.as_str() == Some(name))
        .and_then(|(_, v)| v.as_mapping())
        .ok_or_else(|| TopologyError::InvalidDocument(format!("missing '{name}' section")))
}

fn has_key(map: &Mapping, key: &str) -> bool {
    map.iter().any(|(k, _)| k.as_str() == Some(key))
}

fn looks_like_entity(map: &Mapping) -> bool {
    has_key(map, "ip") || has_key(map, "role") || has_key(map, "protocol")
}

fn flatten_entities(map: &Mapping) -> Result<Vec<(String, Entity)>, TopologyError> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    for (key, value) in map {
        let name = key
            .as_str()
            .ok_or_else(|| TopologyError::InvalidDocument("entity names must be strings".into()))?;
        let record = value.as_mapping().ok_or_else(|| {
            TopologyError::InvalidDocument(format!("entity '{name}' is not a mapping"))
        })?;
        if looks_like_entity(record) {
            push_entity(&mut out, &mut seen, name, record)?;
        } else {
            // one level of grouping
            for (member_key, member_value) in record {
                let member_name = member_key.as_str().ok_or_else(|| {
                    TopologyError::InvalidDocument("entity names must be strings".into())
                })?;
                let member = member_value.as_mapping().ok_or_else(|| {
                    TopologyError::InvalidDocument(format!(
                        "entity '{member_name}' in group '{name}' is not a mapping"
                    ))
                })?;
                push_entity(&mut out, &mut seen, member_name, member)?;
            }
        }
    }
    Ok(out)
}

fn push_entity(
    out: &mut Vec<(String, Entity)>,
    seen: &mut HashSet<String>,
    name: &str,
    record: &Mapping,
) -> Result<(), TopologyError> {
    if !seen.insert(name.to_string()) {
        return Err(TopologyError::DuplicateEntity(name.to_string()));
    }
    for field in ["ip", "role", "protocol"] {
        if !has_key(record, field) {
            return Err(TopologyError::MissingField {
                entity: name.to_string(),
                field,
            });
        }
    }
    let entity: Entity = serde_yaml::from_value(Value::Mapping(record.clone()))?;
    out.push((name.to_string(), entity));
    Ok(())
}
