//! Entity table validation, UDP port normalization, and derivation of the
//! undirected connection set.

use std::collections::{HashMap, HashSet};

use crate::config::{ConfigDoc, Connection, Protocol, Role, UNSPECIFIED_PORT};
use crate::error::TopologyError;
use crate::ports::PortAllocator;

/// Checks the flattened entity table: reference resolution for
/// `depends_on`, `destinations` and `connect_to`, and the single-fuzzer
/// rule. Name uniqueness and required fields are enforced at load time.
pub fn validate(doc: &ConfigDoc) -> Result<(), TopologyError> {
    let names: HashSet<&str> = doc.entities.iter().map(|(n, _)| n.as_str()).collect();
    let ips: HashSet<&str> = doc.entities.iter().map(|(_, e)| e.ip.as_str()).collect();

    let fuzzers = doc
        .entities
        .iter()
        .filter(|(_, e)| e.role == Role::Fuzzer)
        .count();
    match fuzzers {
        0 => return Err(TopologyError::MissingFuzzer),
        1 => {}
        _ => return Err(TopologyError::MultipleFuzzers),
    }

    for (name, entity) in &doc.entities {
        for dep in &entity.depends_on {
            if !names.contains(dep.as_str()) {
                return Err(TopologyError::UnresolvedReference {
                    entity: name.clone(),
                    reference: dep.clone(),
                });
            }
        }
        for dest in &entity.destinations {
            if !ips.contains(dest.ip.as_str()) {
                return Err(TopologyError::UnresolvedReference {
                    entity: name.clone(),
                    reference: dest.ip.clone(),
                });
            }
        }
        if let Some(target) = &entity.connect_to {
            if !ips.contains(target.ip.as_str()) {
                return Err(TopologyError::UnresolvedReference {
                    entity: name.clone(),
                    reference: target.ip.clone(),
                });
            }
        }
    }
    Ok(())
}

/// A UDP entity without a declared port gets the sentinel, and destination
/// entries missing a port inherit the declared port of the entity owning
/// that address.
pub fn normalize_udp_ports(doc: &mut ConfigDoc) {
    let mut ip_to_port: HashMap<String, i32> = HashMap::new();

    for (name, entity) in &mut doc.entities {
        if entity.protocol != Protocol::Udp {
            continue;
        }
        if entity.port.is_none() {
            entity.port = Some(UNSPECIFIED_PORT);
            log::info!("Set port {UNSPECIFIED_PORT} for entity {name}");
        }
        ip_to_port.insert(entity.ip.clone(), entity.port_or_sentinel());
    }

    for (name, entity) in &mut doc.entities {
        if entity.protocol != Protocol::Udp {
            continue;
        }
        for dest in &mut entity.destinations {
            if dest.port.is_none() {
                if let Some(port) = ip_to_port.get(dest.ip.as_str()) {
                    dest.port = Some(*port);
                    log::info!("Set port {port} for destination {} in entity {name}", dest.ip);
                }
            }
        }
    }
}

/// Walks every non-fuzzer UDP entity's declared destinations and collapses
/// reciprocal declarations into one record per physical link. The declaring
/// side of the first sighting becomes endpoint A; the canonical key is the
/// endpoint pair sorted by (address, port).
pub fn derive_connections(
    doc: &ConfigDoc,
    ports: &mut PortAllocator,
) -> Result<Vec<Connection>, TopologyError> {
    let mut seen: HashSet<((String, i32), (String, i32))> = HashSet::new();
    let mut connections = Vec::new();

    for (_, entity) in &doc.entities {
        if entity.role == Role::Fuzzer || entity.protocol != Protocol::Udp {
            continue;
        }
        let src = (entity.ip.clone(), entity.port_or_sentinel());
        for dest in &entity.destinations {
            let dst = (dest.ip.clone(), dest.port_or_sentinel());
            let key = if src <= dst {
                (src.clone(), dst.clone())
            } else {
                (dst.clone(), src.clone())
            };
            if !seen.insert(key) {
                continue;
            }
            let conn = Connection {
                entity_a_ip: src.0.clone(),
                entity_a_port: src.1,
                entity_a_proxy_port_recv: ports.allocate()?,
                entity_a_proxy_port_send: ports.allocate()?,
                entity_b_ip: dst.0,
                entity_b_port: dst.1,
                entity_b_proxy_port_recv: ports.allocate()?,
                entity_b_proxy_port_send: ports.allocate()?,
            };
            log::info!(
                "{}:{} <-> {}:{} | A[recv/send]: {}/{} B[recv/send]: {}/{}",
                conn.entity_a_ip,
                conn.entity_a_port,
                conn.entity_b_ip,
                conn.entity_b_port,
                conn.entity_a_proxy_port_recv,
                conn.entity_a_proxy_port_send,
                conn.entity_b_proxy_port_recv,
                conn.entity_b_proxy_port_send
            );
            connections.push(conn);
        }
    }
    Ok(connections)
}
