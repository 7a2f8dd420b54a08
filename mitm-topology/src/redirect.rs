//! Firewall/NAT rule generation for transparent interception.
//!
//! The generator only emits rule text; applying it is the job of the
//! entrypoint scripts running inside each container. Emission is idempotent
//! (chains are created only if absent and flushed before refill) and
//! order-sensitive (run-specific rules are inserted ahead of pre-existing
//! broad rules), so repeated runs converge to the same net effect.

use crate::config::{ConfigDoc, Connection, Entity, Protocol, Role, TcpRedirection, UNSPECIFIED_PORT};
use crate::error::TopologyError;
use crate::ports::PortAllocator;
use crate::topology;

/// Derives the UDP connection set and the TCP redirection table, allocating
/// proxy ports from the shared per-run allocator, and attaches both to the
/// fuzzer entity. Fails before touching the document when no fuzzer is
/// declared.
pub fn inject_redirections(
    doc: &mut ConfigDoc,
    ports: &mut PortAllocator,
) -> Result<(), TopologyError> {
    if doc.fuzzer().is_none() {
        return Err(TopologyError::MissingFuzzer);
    }

    let connections = topology::derive_connections(doc, ports)?;
    let tcp_redirections = derive_tcp_redirections(doc, ports)?;

    let count = connections.len();
    let tcp_count = tcp_redirections.len();
    let fuzzer = doc.fuzzer_mut().ok_or(TopologyError::MissingFuzzer)?;
    fuzzer.connections = connections;
    fuzzer.tcp_redirections = tcp_redirections;
    log::info!("Injected {count} bidirectional connections and {tcp_count} TCP redirections into config.");
    Ok(())
}

/// One proxy port per TCP server with a concrete port. Servers with the
/// sentinel port are skipped; clients targeting them degrade to a
/// placeholder block at rule-emission time.
fn derive_tcp_redirections(
    doc: &ConfigDoc,
    ports: &mut PortAllocator,
) -> Result<Vec<TcpRedirection>, TopologyError> {
    let mut out = Vec::new();
    for (name, entity) in &doc.entities {
        if entity.protocol != Protocol::Tcp || entity.role != Role::Server {
            continue;
        }
        let port = entity.port_or_sentinel();
        if port == UNSPECIFIED_PORT {
            continue;
        }
        let proxy_port = ports.allocate()?;
        log::info!("TCP {name} {}:{port} -> proxy port {proxy_port}", entity.ip);
        out.push(TcpRedirection {
            server_ip: entity.ip.clone(),
            server_port: port,
            proxy_port,
        });
    }
    Ok(out)
}

/// The complete rule block for one entity's entrypoint, or an explanatory
/// placeholder when the entity is marked fuzzed but no redirection covers
/// it yet (a valid transitional authoring state, not an error).
pub fn entrypoint_rules(doc: &ConfigDoc, entity: &Entity) -> Vec<String> {
    let Some((_, fuzzer)) = doc.fuzzer() else {
        return vec!["# no fuzzer entity declared; no redirection generated".to_string()];
    };

    if entity.role == Role::Fuzzer {
        let mut lines = Vec::new();
        if !entity.connections.is_empty() {
            lines.extend(fuzzer_udp_rules(&entity.connections, &entity.ip));
        }
        return lines;
    }

    if !entity.fuzzed {
        return Vec::new();
    }

    match entity.protocol {
        Protocol::Udp => {
            let rules = client_udp_rules(
                &entity.ip,
                entity.port_or_sentinel(),
                &fuzzer.connections,
                &fuzzer.ip,
            );
            if rules.is_empty() {
                vec![format!(
                    "# no connection matches {}:{}; no UDP redirection generated",
                    entity.ip,
                    entity.port_or_sentinel()
                )]
            } else {
                rules
            }
        }
        Protocol::Tcp => match &entity.connect_to {
            Some(target) => tcp_client_rules(
                &target.ip,
                target.port_or_sentinel(),
                &fuzzer.tcp_redirections,
                &fuzzer.ip,
            ),
            None => vec!["# fuzzed TCP entity has no connect_to target; nothing to redirect".to_string()],
        },
    }
}

/// Interception node rules: TPROXY divert per direction plus the SNAT
/// return path that makes proxied replies appear to come from the original
/// peer.
pub fn fuzzer_udp_rules(connections: &[Connection], fuzzer_ip: &str) -> Vec<String> {
    let mut lines = vec![
        "# === UDP transparent proxy ===".to_string(),
        "iptables -t mangle -N DIVERT_UDP || true".to_string(),
        "iptables -t mangle -F DIVERT_UDP".to_string(),
        "iptables -t mangle -A DIVERT_UDP -j MARK --set-mark 1".to_string(),
        "iptables -t mangle -A DIVERT_UDP -j ACCEPT".to_string(),
        "iptables -t mangle -A PREROUTING -p udp -m socket -j DIVERT_UDP".to_string(),
    ];

    for conn in connections {
        // traffic addressed to B lands in A's recv port, and vice versa
        lines.push(tproxy_divert(
            &conn.entity_b_ip,
            conn.entity_b_port,
            fuzzer_ip,
            conn.entity_a_proxy_port_recv,
        ));
        lines.push(tproxy_divert(
            &conn.entity_a_ip,
            conn.entity_a_port,
            fuzzer_ip,
            conn.entity_b_proxy_port_recv,
        ));
        lines.push(snat_return(
            conn.entity_a_proxy_port_send,
            &conn.entity_b_ip,
            conn.entity_b_port,
        ));
        lines.push(snat_return(
            conn.entity_b_proxy_port_send,
            &conn.entity_a_ip,
            conn.entity_a_port,
        ));
    }

    lines.push("ip rule add fwmark 1 lookup local || true".to_string());
    lines.push("# === end UDP transparent proxy ===".to_string());
    lines
}

fn tproxy_divert(dst_ip: &str, dst_port: i32, fuzzer_ip: &str, recv_port: u16) -> String {
    let dport = dport_match(dst_port);
    format!(
        "iptables -t mangle -A PREROUTING -p udp -d {dst_ip}{dport} \
         -j TPROXY --on-ip {fuzzer_ip} --on-port {recv_port} --tproxy-mark 0x1/0x1"
    )
}

fn snat_return(send_port: u16, peer_ip: &str, peer_port: i32) -> String {
    let source = if peer_port == UNSPECIFIED_PORT {
        peer_ip.to_string()
    } else {
        format!("{peer_ip}:{peer_port}")
    };
    format!("iptables -t nat -A POSTROUTING -p udp --sport {send_port} -j SNAT --to-source {source}")
}

fn dport_match(port: i32) -> String {
    if port == UNSPECIFIED_PORT {
        String::new()
    } else {
        format!(" --dport {port}")
    }
}

/// Fuzzed-entity rules, one group per connection the entity participates
/// in: reroute outbound traffic for the logical peer into the interception
/// node's recv port, admit replies coming back from the matching send port,
/// and fold direct sends at the proxy's send port back into recv. The
/// catch-all PREROUTING rewrite is inserted at position 1, ahead of any
/// pre-existing broad rules, and only once.
pub fn client_udp_rules(
    ip: &str,
    port: i32,
    connections: &[Connection],
    fuzzer_ip: &str,
) -> Vec<String> {
    let mut lines = Vec::new();
    let mut catch_all_emitted = false;

    for conn in connections {
        let side = connection_side(conn, ip, port);
        let Some((recv, send, peer_ip, peer_port)) = side else {
            continue;
        };

        if !catch_all_emitted {
            lines.push(format!(
                "iptables -t nat -I PREROUTING 1 -p udp -d {fuzzer_ip} -j DNAT --to-destination {fuzzer_ip}:{recv}"
            ));
            catch_all_emitted = true;
        }

        let dport = dport_match(peer_port);
        lines.push(format!("# redirect traffic for {peer_ip} through the proxy"));
        lines.push(format!(
            "iptables -t nat -A OUTPUT -p udp -d {peer_ip}{dport} -j DNAT --to-destination {fuzzer_ip}:{recv}"
        ));
        lines.push(format!(
            "iptables -A INPUT -p udp -s {fuzzer_ip} --sport {send} -j ACCEPT"
        ));
        lines.push(format!(
            "iptables -t nat -A OUTPUT -p udp -d {fuzzer_ip} --dport {send} -j DNAT --to-destination {fuzzer_ip}:{recv}"
        ));
    }
    lines
}

/// Which endpoint of the connection this entity is, if either. Returns
/// (recv, send, peer_ip, peer_port) for the matching side. A sentinel on
/// either the entity's or the record's port matches by address alone.
fn connection_side<'a>(
    conn: &'a Connection,
    ip: &str,
    port: i32,
) -> Option<(u16, u16, &'a str, i32)> {
    let port_matches = |conn_port: i32| {
        port == UNSPECIFIED_PORT || conn_port == port || conn_port == UNSPECIFIED_PORT
    };
    if conn.entity_a_ip == ip && port_matches(conn.entity_a_port) {
        return Some((
            conn.entity_a_proxy_port_recv,
            conn.entity_a_proxy_port_send,
            conn.entity_b_ip.as_str(),
            conn.entity_b_port,
        ));
    }
    if conn.entity_b_ip == ip && port_matches(conn.entity_b_port) {
        return Some((
            conn.entity_b_proxy_port_recv,
            conn.entity_b_proxy_port_send,
            conn.entity_a_ip.as_str(),
            conn.entity_a_port,
        ));
    }
    None
}

/// Exact-match lookup on (server address, server port); a miss degrades to
/// an explanatory no-op block.
pub fn tcp_client_rules(
    server_ip: &str,
    server_port: i32,
    redirections: &[TcpRedirection],
    fuzzer_ip: &str,
) -> Vec<String> {
    match redirections
        .iter()
        .find(|r| r.server_ip == server_ip && r.server_port == server_port)
    {
        Some(redir) => vec![
            format!(
                "# redirect TCP connects for {server_ip}:{server_port} through the proxy"
            ),
            format!(
                "iptables -t nat -A OUTPUT -p tcp -d {server_ip} --dport {server_port} \
                 -j DNAT --to-destination {fuzzer_ip}:{}",
                redir.proxy_port
            ),
        ],
        None => vec![format!(
            "# no TCP redirection matches {server_ip}:{server_port}; traffic left untouched"
        )],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigDoc;
    use std::collections::HashSet;

    fn doc(entities: &str) -> ConfigDoc {
        let text = format!(
            r#"
network:
  docker_network_name: fuzznet
  subnet: 10.0.0.0/24
  gateway: 10.0.0.1
entities:
{entities}"#
        );
        ConfigDoc::from_str(&text).unwrap()
    }

    const TWO_SERVERS: &str = r#"
  fuzzer:
    ip: 10.0.0.2
    role: fuzzer
    protocol: udp
  serverA:
    ip: 10.0.0.3
    port: 9999
    role: server
    protocol: udp
    fuzzed: true
    destinations:
      - ip: 10.0.0.4
        port: 9999
  serverB:
    ip: 10.0.0.4
    port: 9999
    role: server
    protocol: udp
    fuzzed: true
    destinations:
      - ip: 10.0.0.3
        port: 9999
"#;

    #[test]
    fn injection_attaches_one_connection_with_four_distinct_ports() {
        let mut doc = doc(TWO_SERVERS);
        let mut ports = PortAllocator::new();
        inject_redirections(&mut doc, &mut ports).unwrap();

        let (_, fuzzer) = doc.fuzzer().unwrap();
        assert_eq!(fuzzer.connections.len(), 1);
        let conn = &fuzzer.connections[0];
        let distinct: HashSet<u16> = [
            conn.entity_a_proxy_port_recv,
            conn.entity_a_proxy_port_send,
            conn.entity_b_proxy_port_recv,
            conn.entity_b_proxy_port_send,
        ]
        .into_iter()
        .collect();
        assert_eq!(distinct.len(), 4);
    }

    #[test]
    fn udp_and_tcp_proxy_ports_are_disjoint_within_a_run() {
        let mut doc = doc(
            r#"
  fuzzer:
    ip: 10.0.0.2
    role: fuzzer
    protocol: udp
  serverA:
    ip: 10.0.0.3
    port: 9999
    role: server
    protocol: udp
    fuzzed: true
    destinations:
      - ip: 10.0.0.4
        port: 9999
  serverB:
    ip: 10.0.0.4
    port: 9999
    role: server
    protocol: udp
  tcp_server:
    ip: 10.0.0.5
    port: 8080
    role: server
    protocol: tcp
  tcp_client:
    ip: 10.0.0.6
    role: fuzzed-client
    protocol: tcp
    fuzzed: true
    connect_to:
      ip: 10.0.0.5
      port: 8080
"#,
        );
        let mut ports = PortAllocator::new();
        inject_redirections(&mut doc, &mut ports).unwrap();

        let (_, fuzzer) = doc.fuzzer().unwrap();
        assert_eq!(fuzzer.tcp_redirections.len(), 1);
        let redir = &fuzzer.tcp_redirections[0];
        assert_eq!(redir.server_ip, "10.0.0.5");
        assert_eq!(redir.server_port, 8080);

        let conn = &fuzzer.connections[0];
        let udp_ports: HashSet<u16> = [
            conn.entity_a_proxy_port_recv,
            conn.entity_a_proxy_port_send,
            conn.entity_b_proxy_port_recv,
            conn.entity_b_proxy_port_send,
        ]
        .into_iter()
        .collect();
        assert!(!udp_ports.contains(&redir.proxy_port));
        // everything issued in the run is pairwise distinct
        assert_eq!(ports.issued().len(), 5);
    }

    #[test]
    fn missing_fuzzer_fails_before_any_mutation() {
        let mut doc = doc(
            r#"
  serverA:
    ip: 10.0.0.3
    port: 9999
    role: server
    protocol: udp
    destinations:
      - ip: 10.0.0.4
        port: 9999
  serverB:
    ip: 10.0.0.4
    port: 9999
    role: server
    protocol: udp
"#,
        );
        let mut ports = PortAllocator::new();
        let err = inject_redirections(&mut doc, &mut ports).unwrap_err();
        assert!(matches!(err, TopologyError::MissingFuzzer));
        assert!(ports.issued().is_empty());
        assert!(doc.entities.iter().all(|(_, e)| e.connections.is_empty()));
    }

    #[test]
    fn sentinel_port_drops_destination_port_match() {
        let conn = Connection {
            entity_a_ip: "10.0.0.3".into(),
            entity_a_port: 5555,
            entity_a_proxy_port_recv: 21001,
            entity_a_proxy_port_send: 21002,
            entity_b_ip: "10.0.0.4".into(),
            entity_b_port: UNSPECIFIED_PORT,
            entity_b_proxy_port_recv: 21003,
            entity_b_proxy_port_send: 21004,
        };

        let fuzzer_rules = fuzzer_udp_rules(std::slice::from_ref(&conn), "10.0.0.2");
        let toward_b = fuzzer_rules
            .iter()
            .find(|l| l.contains("-d 10.0.0.4"))
            .unwrap();
        assert!(!toward_b.contains("--dport"));
        let toward_a = fuzzer_rules
            .iter()
            .find(|l| l.contains("-d 10.0.0.3"))
            .unwrap();
        assert!(toward_a.contains("--dport 5555"));

        // SNAT toward the sentinel peer omits the port suffix
        let snat_to_b = fuzzer_rules
            .iter()
            .find(|l| l.contains("--sport 21002"))
            .unwrap();
        assert!(snat_to_b.ends_with("--to-source 10.0.0.4"));

        let client_rules = client_udp_rules("10.0.0.3", 5555, std::slice::from_ref(&conn), "10.0.0.2");
        let outbound = client_rules
            .iter()
            .find(|l| l.contains("-d 10.0.0.4"))
            .unwrap();
        assert!(!outbound.contains("--dport"));
    }

    #[test]
    fn client_rules_cover_every_connection_of_the_entity() {
        let conns = vec![
            Connection {
                entity_a_ip: "10.0.0.3".into(),
                entity_a_port: 1111,
                entity_a_proxy_port_recv: 22001,
                entity_a_proxy_port_send: 22002,
                entity_b_ip: "10.0.0.4".into(),
                entity_b_port: 2222,
                entity_b_proxy_port_recv: 22003,
                entity_b_proxy_port_send: 22004,
            },
            Connection {
                entity_a_ip: "10.0.0.3".into(),
                entity_a_port: 1111,
                entity_a_proxy_port_recv: 22005,
                entity_a_proxy_port_send: 22006,
                entity_b_ip: "10.0.0.5".into(),
                entity_b_port: 3333,
                entity_b_proxy_port_recv: 22007,
                entity_b_proxy_port_send: 22008,
            },
        ];
        let rules = client_udp_rules("10.0.0.3", 1111, &conns, "10.0.0.2");
        assert!(rules.iter().any(|l| l.contains("-d 10.0.0.4")));
        assert!(rules.iter().any(|l| l.contains("-d 10.0.0.5")));
        // the catch-all insert appears exactly once, ahead of the rest
        let catch_alls: Vec<usize> = rules
            .iter()
            .enumerate()
            .filter(|(_, l)| l.contains("-I PREROUTING 1"))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(catch_alls, [0]);
    }

    #[test]
    fn tcp_lookup_miss_degrades_to_placeholder() {
        let redirections = vec![TcpRedirection {
            server_ip: "10.0.0.5".into(),
            server_port: 8080,
            proxy_port: 23001,
        }];
        let hit = tcp_client_rules("10.0.0.5", 8080, &redirections, "10.0.0.2");
        assert!(hit.iter().any(|l| l.contains("--to-destination 10.0.0.2:23001")));

        let miss = tcp_client_rules("10.0.0.5", 9090, &redirections, "10.0.0.2");
        assert_eq!(miss.len(), 1);
        assert!(miss[0].starts_with('#'));
    }

    #[test]
    fn entrypoint_rules_for_unmatched_fuzzed_entity_are_a_placeholder() {
        let mut doc = doc(TWO_SERVERS);
        let mut ports = PortAllocator::new();
        inject_redirections(&mut doc, &mut ports).unwrap();

        let orphan = Entity {
            ip: "10.0.0.77".into(),
            port: Some(4444),
            role: Role::FuzzedClient,
            protocol: Protocol::Udp,
            fuzzed: true,
            destinations: Vec::new(),
            connect_to: None,
            depends_on: Vec::new(),
            exec_with: None,
            binary_path: None,
            args: Vec::new(),
            connections: Vec::new(),
            tcp_redirections: Vec::new(),
        };
        let rules = entrypoint_rules(&doc, &orphan);
        assert_eq!(rules.len(), 1);
        assert!(rules[0].starts_with("# no connection matches 10.0.0.77"));
    }
}
