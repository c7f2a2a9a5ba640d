//! Cluster data model shared by the director and realserver workers.
//!
//! These types mirror what the Kubernetes watch layer delivers: the desired
//! VIP configuration and the cluster node membership. The watch layer itself
//! lives behind the `Watcher` trait; everything here is plain data.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// A reference to a Kubernetes service port backing one listen port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRef {
    pub namespace: String,
    pub service: String,
    pub port_name: String,
}

impl ServiceRef {
    /// Identity key used to resolve the backing cluster address,
    /// `<namespace>/<service>:<portName>`.
    pub fn identity(&self) -> String {
        format!("{}/{}:{}", self.namespace, self.service, self.port_name)
    }
}

/// Mapping from listen-port string to the service backing it.
pub type PortMap = BTreeMap<String, ServiceRef>;

/// Desired state delivered by the watcher.
///
/// `config` maps IPv4 VIPs to port maps, `config6` does the same for IPv6
/// VIPs, and `ipv6` pairs an IPv4 VIP with its IPv6 counterpart for the
/// HAProxy front-end path. A VIP appears in at most one of `config` and
/// `config6`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub config: BTreeMap<String, PortMap>,

    #[serde(default)]
    pub config6: BTreeMap<String, PortMap>,

    #[serde(default)]
    pub ipv6: BTreeMap<String, String>,
}

impl ClusterConfig {
    /// All IPv4 VIPs, in map order.
    pub fn vips(&self) -> Vec<String> {
        self.config.keys().cloned().collect()
    }

    /// All IPv6 VIPs, in map order.
    pub fn vips6(&self) -> Vec<String> {
        self.config6.keys().cloned().collect()
    }

    /// Check structural invariants: port keys are numeric strings in
    /// [1,65535] and no VIP appears in both address families.
    pub fn validate(&self) -> Result<(), String> {
        for (vip, ports) in self.config.iter().chain(self.config6.iter()) {
            for port in ports.keys() {
                match port.parse::<u32>() {
                    Ok(p) if (1..=65535).contains(&p) => {}
                    _ => return Err(format!("vip {}: invalid listen port {:?}", vip, port)),
                }
            }
        }
        if let Some(vip) = self.config.keys().find(|v| self.config6.contains_key(*v)) {
            return Err(format!("vip {} present in both address families", vip));
        }
        Ok(())
    }
}

/// A cluster node as seen by the watcher.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,

    #[serde(default)]
    pub addresses: Vec<String>,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub ready: bool,
}

impl Node {
    /// The node's primary address, if it has one.
    pub fn addr(&self) -> Option<&str> {
        self.addresses.first().map(String::as_str)
    }
}

/// Ordered sequence of nodes. Order carries no meaning; comparisons sort.
pub type NodesList = Vec<Node>;

fn projection(n: &Node) -> (String, Vec<String>, BTreeMap<String, String>, bool) {
    let mut addrs = n.addresses.clone();
    addrs.sort();
    (n.name.clone(), addrs, n.labels.clone(), n.ready)
}

/// Structural equality over a stable field projection of a single node.
pub fn node_equal(a: &Node, b: &Node) -> bool {
    projection(a) == projection(b)
}

/// Structural equality of two node lists, irrespective of list order.
pub fn nodes_equal(a: &NodesList, b: &NodesList) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut pa: Vec<_> = a.iter().map(projection).collect();
    let mut pb: Vec<_> = b.iter().map(projection).collect();
    pa.sort();
    pb.sort();
    pa == pb
}

/// One port of a Kubernetes service snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePort {
    pub name: String,
    pub port: u16,
}

/// A Kubernetes service snapshot as reported by the watcher.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    #[serde(default)]
    pub cluster_ip: String,

    #[serde(default)]
    pub ports: Vec<ServicePort>,
}

/// Flat index from `<namespace>/<service>:<portName>` to `<clusterIP>:<port>`,
/// rebuilt periodically from the watcher's service snapshot.
pub type ServiceIndex = HashMap<String, String>;

/// Build a service index from a snapshot, skipping services with no
/// cluster IP or no ports.
pub fn build_service_index(services: &HashMap<String, Service>) -> ServiceIndex {
    let mut index = ServiceIndex::new();
    for (name, svc) in services {
        if svc.cluster_ip.is_empty() || svc.ports.is_empty() {
            continue;
        }
        for port in &svc.ports {
            let identity = format!("{}:{}", name, port.name);
            let addr = format!("{}:{}", svc.cluster_ip, port.port);
            index.insert(identity, addr);
        }
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, addr: &str, ready: bool) -> Node {
        Node {
            name: name.to_string(),
            addresses: vec![addr.to_string()],
            labels: BTreeMap::new(),
            ready,
        }
    }

    #[test]
    fn test_nodes_equal_ignores_order() {
        let a = vec![node("n1", "10.0.0.1", true), node("n2", "10.0.0.2", true)];
        let b = vec![node("n2", "10.0.0.2", true), node("n1", "10.0.0.1", true)];
        assert!(nodes_equal(&a, &b));
    }

    #[test]
    fn test_nodes_equal_detects_field_change() {
        let a = vec![node("n1", "10.0.0.1", true)];
        let b = vec![node("n1", "10.0.0.1", false)];
        assert!(!nodes_equal(&a, &b));
        assert!(!node_equal(&a[0], &b[0]));
    }

    #[test]
    fn test_cluster_config_validate_rejects_bad_port() {
        let mut cfg = ClusterConfig::default();
        let mut ports = PortMap::new();
        ports.insert(
            "notaport".to_string(),
            ServiceRef {
                namespace: "ns".into(),
                service: "web".into(),
                port_name: "http".into(),
            },
        );
        cfg.config.insert("10.10.0.1".to_string(), ports);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_cluster_config_validate_rejects_dual_family_vip() {
        let mut cfg = ClusterConfig::default();
        cfg.config.insert("10.10.0.1".to_string(), PortMap::new());
        cfg.config6.insert("10.10.0.1".to_string(), PortMap::new());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_build_service_index_skips_incomplete_services() {
        let mut services = HashMap::new();
        services.insert(
            "ns/web".to_string(),
            Service {
                cluster_ip: "192.168.0.10".to_string(),
                ports: vec![ServicePort {
                    name: "http".to_string(),
                    port: 80,
                }],
            },
        );
        services.insert("ns/headless".to_string(), Service::default());

        let index = build_service_index(&services);
        assert_eq!(index.len(), 1);
        assert_eq!(index["ns/web:http"], "192.168.0.10:80");
    }

    #[test]
    fn test_service_ref_identity() {
        let r = ServiceRef {
            namespace: "ns".into(),
            service: "web".into(),
            port_name: "http".into(),
        };
        assert_eq!(r.identity(), "ns/web:http");
    }
}
