//! Dependency-respecting start order.

use std::collections::{HashMap, HashSet};

use crate::config::ConfigDoc;
use crate::error::TopologyError;

/// Topologically sorts entity names by `depends_on`, dependencies first.
/// Iterative DFS with an explicit frame stack so deep dependency chains
/// cannot overflow; an entity re-entered while still on the in-progress
/// path is reported as the point where the cycle closes.
pub fn start_order(doc: &ConfigDoc) -> Result<Vec<String>, TopologyError> {
    let deps: HashMap<&str, &[String]> = doc
        .entities
        .iter()
        .map(|(name, e)| (name.as_str(), e.depends_on.as_slice()))
        .collect();

    let mut done: HashSet<&str> = HashSet::new();
    let mut visiting: HashSet<&str> = HashSet::new();
    let mut order = Vec::with_capacity(doc.entities.len());

    for (root, _) in &doc.entities {
        let root = root.as_str();
        if done.contains(root) {
            continue;
        }
        visiting.insert(root);
        // (entity, index of the next dependency to walk)
        let mut stack: Vec<(&str, usize)> = vec![(root, 0)];
        while let Some(frame) = stack.last_mut() {
            let current = frame.0;
            let next = frame.1;
            frame.1 += 1;

            let current_deps = deps[current];
            if next < current_deps.len() {
                let dep = current_deps[next].as_str();
                if done.contains(dep) {
                    continue;
                }
                if visiting.contains(dep) {
                    return Err(TopologyError::DependencyCycle(dep.to_string()));
                }
                if !deps.contains_key(dep) {
                    return Err(TopologyError::UnresolvedReference {
                        entity: current.to_string(),
                        reference: dep.to_string(),
                    });
                }
                visiting.insert(dep);
                stack.push((dep, 0));
            } else {
                visiting.remove(current);
                done.insert(current);
                order.push(current.to_string());
                stack.pop();
            }
        }
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigDoc;

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

    fn position(order: &[String], name: &str) -> usize {
        order.iter().position(|n| n == name).unwrap()
    }

    #[test]
    fn chain_orders_dependencies_first() {
        let doc = doc(
            r#"
  c:
    ip: 10.0.0.5
    role: server
    protocol: udp
    depends_on: [b]
  b:
    ip: 10.0.0.4
    role: server
    protocol: udp
    depends_on: [a]
  a:
    ip: 10.0.0.3
    role: server
    protocol: udp
"#,
        );
        let order = start_order(&doc).unwrap();
        assert_eq!(order, ["a", "b", "c"]);
    }

    #[test]
    fn every_entity_appears_even_without_dependents() {
        let doc = doc(
            r#"
  lone:
    ip: 10.0.0.3
    role: server
    protocol: udp
  pair:
    ip: 10.0.0.4
    role: server
    protocol: udp
    depends_on: [lone]
  island:
    ip: 10.0.0.5
    role: server
    protocol: udp
"#,
        );
        let order = start_order(&doc).unwrap();
        assert_eq!(order.len(), 3);
        assert!(position(&order, "lone") < position(&order, "pair"));
        assert!(order.contains(&"island".to_string()));
    }

    #[test]
    fn two_node_cycle_is_fatal() {
        let doc = doc(
            r#"
  a:
    ip: 10.0.0.3
    role: server
    protocol: udp
    depends_on: [b]
  b:
    ip: 10.0.0.4
    role: server
    protocol: udp
    depends_on: [a]
"#,
        );
        assert!(matches!(
            start_order(&doc),
            Err(TopologyError::DependencyCycle(_))
        ));
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let doc = doc(
            r#"
  a:
    ip: 10.0.0.3
    role: server
    protocol: udp
    depends_on: [a]
"#,
        );
        assert!(matches!(
            start_order(&doc),
            Err(TopologyError::DependencyCycle(name)) if name == "a"
        ));
    }

    #[test]
    fn diamond_resolves_all_dependencies_first() {
        let doc = doc(
            r#"
  top:
    ip: 10.0.0.6
    role: server
    protocol: udp
    depends_on: [left, right]
  left:
    ip: 10.0.0.4
    role: server
    protocol: udp
    depends_on: [base]
  right:
    ip: 10.0.0.5
    role: server
    protocol: udp
    depends_on: [base]
  base:
    ip: 10.0.0.3
    role: server
    protocol: udp
"#,
        );
        let order = start_order(&doc).unwrap();
        assert!(position(&order, "base") < position(&order, "left"));
        assert!(position(&order, "base") < position(&order, "right"));
        assert!(position(&order, "left") < position(&order, "top"));
        assert!(position(&order, "right") < position(&order, "top"));
    }
}
