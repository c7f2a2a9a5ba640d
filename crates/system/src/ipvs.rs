//! IPVS programming via `ipvsadm`.

use crate::cmd;
use async_trait::async_trait;
use common::types::{ClusterConfig, NodesList};
use common::{Error, Result};
use tracing::{debug, info};

/// IPVS boundary consumed by the director.
#[async_trait]
pub trait Ipvs: Send + Sync {
    /// Program virtual services for every VIP/port in `config`, with one
    /// destination per ready node.
    async fn set_ipvs(&self, nodes: &NodesList, config: &ClusterConfig) -> Result<()>;

    /// Compare desired state against the kernel.
    ///
    /// `config_ready` is the consumed one-shot flag: when a new config has
    /// arrived since the last check, parity is reported false regardless of
    /// derived state so a reconcile is always attempted.
    async fn check_config_parity(
        &self,
        nodes: &NodesList,
        config: Option<&ClusterConfig>,
        vips: &[String],
        config_ready: bool,
    ) -> Result<bool>;

    /// Clear all virtual services.
    async fn teardown(&self) -> Result<()>;
}

/// Generate `ipvsadm-save` style rules for the given nodes and config.
///
/// Output is sorted and stable under permutations of the input maps: one
/// `-A` line per VIP/port, one `-a` line per ready node with an address.
/// Destinations use gatewaying (`-g`) for direct server return.
pub fn generate_rules(
    nodes: &NodesList,
    config: &ClusterConfig,
    scheduler: &str,
    weight: u32,
) -> Vec<String> {
    let mut sorted_nodes: Vec<_> = nodes
        .iter()
        .filter(|n| n.ready && n.addr().is_some())
        .collect();
    sorted_nodes.sort_by(|a, b| a.name.cmp(&b.name));

    let mut rules = Vec::new();
    for (vip, ports) in &config.config {
        for port in ports.keys() {
            rules.push(format!("-A -t {}:{} -s {}", vip, port, scheduler));
            for node in &sorted_nodes {
                rules.push(format!(
                    "-a -t {}:{} -r {}:{} -g -w {}",
                    vip,
                    port,
                    node.addr().unwrap_or_default(),
                    port,
                    weight
                ));
            }
        }
    }
    rules
}

/// Production [`Ipvs`] implementation backed by `ipvsadm`.
pub struct CommandIpvs {
    scheduler: String,
    weight: u32,
}

impl CommandIpvs {
    pub fn new(scheduler: impl Into<String>, weight: u32) -> Self {
        Self {
            scheduler: scheduler.into(),
            weight,
        }
    }

    async fn existing_rules(&self) -> Result<Vec<String>> {
        let out = cmd::run("ipvsadm", &["-S", "-n"]).await.map_err(Error::ipvs)?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| l.starts_with("-A") || l.starts_with("-a"))
            .map(str::to_string)
            .collect())
    }
}

#[async_trait]
impl Ipvs for CommandIpvs {
    async fn set_ipvs(&self, nodes: &NodesList, config: &ClusterConfig) -> Result<()> {
        let rules = generate_rules(nodes, config, &self.scheduler, self.weight);
        info!(rules = rules.len(), "applying ipvs rules");

        cmd::run("ipvsadm", &["-C"]).await.map_err(Error::ipvs)?;
        let mut input = rules.join("\n");
        input.push('\n');
        cmd::run_with_stdin("ipvsadm", &["-R"], input.as_bytes())
            .await
            .map_err(Error::ipvs)?;
        Ok(())
    }

    async fn check_config_parity(
        &self,
        nodes: &NodesList,
        config: Option<&ClusterConfig>,
        vips: &[String],
        config_ready: bool,
    ) -> Result<bool> {
        let Some(config) = config else {
            // nothing to reconcile yet
            return Ok(true);
        };
        if config_ready {
            debug!("new config pending, forcing reconcile");
            return Ok(false);
        }

        let mut have_vips = vips.to_vec();
        have_vips.sort();
        let mut want_vips = config.vips();
        want_vips.sort();
        if have_vips != want_vips {
            return Ok(false);
        }

        let mut existing = self.existing_rules().await?;
        existing.sort();
        let mut generated = generate_rules(nodes, config, &self.scheduler, self.weight);
        generated.sort();
        Ok(existing == generated)
    }

    async fn teardown(&self) -> Result<()> {
        cmd::run("ipvsadm", &["-C"]).await.map_err(Error::ipvs)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::types::{Node, PortMap, ServiceRef};
    use std::collections::BTreeMap;

    fn node(name: &str, addr: &str, ready: bool) -> Node {
        Node {
            name: name.to_string(),
            addresses: vec![addr.to_string()],
            labels: BTreeMap::new(),
            ready,
        }
    }

    fn service_ref() -> ServiceRef {
        ServiceRef {
            namespace: "ns".into(),
            service: "web".into(),
            port_name: "http".into(),
        }
    }

    fn config(vips: &[(&str, &[&str])]) -> ClusterConfig {
        let mut cfg = ClusterConfig::default();
        for (vip, ports) in vips {
            let mut pm = PortMap::new();
            for p in *ports {
                pm.insert(p.to_string(), service_ref());
            }
            cfg.config.insert(vip.to_string(), pm);
        }
        cfg
    }

    #[test]
    fn test_generate_rules_shape() {
        let nodes = vec![node("n1", "10.0.0.1", true), node("n2", "10.0.0.2", true)];
        let cfg = config(&[("10.10.0.1", &["80"])]);

        let rules = generate_rules(&nodes, &cfg, "rr", 1);
        assert_eq!(
            rules,
            vec![
                "-A -t 10.10.0.1:80 -s rr",
                "-a -t 10.10.0.1:80 -r 10.0.0.1:80 -g -w 1",
                "-a -t 10.10.0.1:80 -r 10.0.0.2:80 -g -w 1",
            ]
        );
    }

    #[test]
    fn test_generate_rules_skips_unready_nodes() {
        let nodes = vec![node("n1", "10.0.0.1", true), node("n2", "10.0.0.2", false)];
        let cfg = config(&[("10.10.0.1", &["80"])]);

        let rules = generate_rules(&nodes, &cfg, "rr", 1);
        assert_eq!(rules.len(), 2);
        assert!(!rules.iter().any(|r| r.contains("10.0.0.2")));
    }

    #[test]
    fn test_generate_rules_stable_under_node_permutation() {
        let cfg = config(&[("10.10.0.1", &["80", "443"]), ("10.10.0.2", &["8080"])]);
        let a = vec![node("n1", "10.0.0.1", true), node("n2", "10.0.0.2", true)];
        let b = vec![node("n2", "10.0.0.2", true), node("n1", "10.0.0.1", true)];

        assert_eq!(
            generate_rules(&a, &cfg, "wlc", 1),
            generate_rules(&b, &cfg, "wlc", 1)
        );
    }
}
