//! Rule set model, serialization, merge, and rule generation.

use common::types::{ClusterConfig, Node};
use std::collections::BTreeMap;

/// One chain of a single table: its policy, counters, and ordered rules.
///
/// Rules are stored as complete `-A CHAIN ...` lines so that a parsed set
/// can be compared against a generated one and re-emitted verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Chain {
    pub policy: String,
    pub packets: u64,
    pub bytes: u64,
    pub rules: Vec<String>,
}

impl Chain {
    /// A user-defined chain with no counters yet.
    pub fn custom() -> Self {
        Self {
            policy: "-".to_string(),
            ..Self::default()
        }
    }
}

/// All chains of one table, keyed by chain name.
pub type RuleSet = BTreeMap<String, Chain>;

/// Serialize a rule set back to `iptables-restore` input for `table`.
pub fn bytes_from_rules(table: &str, rules: &RuleSet) -> Vec<u8> {
    let mut out = String::new();
    out.push('*');
    out.push_str(table);
    out.push('\n');
    for (name, chain) in rules {
        out.push_str(&format!(
            ":{} {} [{}:{}]\n",
            name, chain.policy, chain.packets, chain.bytes
        ));
    }
    for chain in rules.values() {
        for rule in &chain.rules {
            out.push_str(rule);
            out.push('\n');
        }
    }
    out.push_str("COMMIT\n");
    out.into_bytes()
}

/// Merge generated (managed) chains into an existing rule set.
///
/// Chains present in `generated` are replaced wholesale; every other chain
/// is preserved verbatim. Returns the merged set and the number of rules
/// dropped from managed chains.
pub fn merge(generated: &RuleSet, existing: &RuleSet) -> (RuleSet, usize) {
    let mut merged = existing.clone();
    let mut removals = 0;

    for (name, chain) in generated {
        if let Some(old) = merged.get(name) {
            removals += old
                .rules
                .iter()
                .filter(|r| !chain.rules.contains(r))
                .count();
        }
        merged.insert(name.clone(), chain.clone());
    }

    (merged, removals)
}

fn masq_chain(base: &str) -> String {
    format!("{}-MASQ", base)
}

fn masq_rules(base: &str) -> Vec<String> {
    let masq = masq_chain(base);
    vec![
        format!("-A {} -j MARK --set-xmark 0x4000/0x4000", masq),
        format!("-A {} -m mark --mark 0x4000/0x4000 -j MASQUERADE", masq),
    ]
}

/// Generate the managed chains for the whole cluster config.
///
/// Deterministic: VIPs and ports come out of ordered maps, so permuted
/// inputs produce identical rule sets.
pub fn generate(config: &ClusterConfig, base: &str) -> RuleSet {
    let mut set = RuleSet::new();

    let mut base_chain = Chain::custom();
    for (vip, ports) in &config.config {
        for (port, svc) in ports {
            base_chain.rules.push(format!(
                "-A {} -d {}/32 -p tcp -m tcp --dport {} -m comment --comment \"{}\" -j {}",
                base,
                vip,
                port,
                svc.identity(),
                masq_chain(base)
            ));
        }
    }
    set.insert(base.to_string(), base_chain);

    let mut masq = Chain::custom();
    masq.rules = masq_rules(base);
    set.insert(masq_chain(base), masq);

    set
}

/// Generate the managed chains scoped to one node.
///
/// A node that is not ready contributes no service rules unless
/// `include_unready` is set; the managed chains themselves are always
/// declared so a merge clears stale rules.
pub fn generate_for_node(
    node: &Node,
    config: &ClusterConfig,
    include_unready: bool,
    base: &str,
) -> RuleSet {
    if node.ready || include_unready {
        return generate(config, base);
    }

    let mut set = RuleSet::new();
    set.insert(base.to_string(), Chain::custom());
    let mut masq = Chain::custom();
    masq.rules = masq_rules(base);
    set.insert(masq_chain(base), masq);
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::types::{PortMap, ServiceRef};

    fn chain(rules: &[&str]) -> Chain {
        Chain {
            policy: "-".to_string(),
            packets: 0,
            bytes: 0,
            rules: rules.iter().map(|r| r.to_string()).collect(),
        }
    }

    fn config(vips: &[(&str, &[&str])]) -> ClusterConfig {
        let mut cfg = ClusterConfig::default();
        for (vip, ports) in vips {
            let mut pm = PortMap::new();
            for p in *ports {
                pm.insert(
                    p.to_string(),
                    ServiceRef {
                        namespace: "ns".into(),
                        service: "web".into(),
                        port_name: "http".into(),
                    },
                );
            }
            cfg.config.insert(vip.to_string(), pm);
        }
        cfg
    }

    #[test]
    fn test_merge_replaces_managed_and_preserves_rest() {
        let mut existing = RuleSet::new();
        existing.insert(
            "PREROUTING".to_string(),
            Chain {
                policy: "ACCEPT".to_string(),
                packets: 7,
                bytes: 420,
                rules: vec![
                    "-A PREROUTING -j KUBE-SERVICES".to_string(),
                    "-A PREROUTING -j RAVEL".to_string(),
                ],
            },
        );
        existing.insert(
            "KUBE-SERVICES".to_string(),
            chain(&["-A KUBE-SERVICES -d 192.168.1.1/32 -j ACCEPT"]),
        );
        existing.insert("RAVEL".to_string(), chain(&["-A RAVEL -d 10.9.9.9/32 -j RAVEL-MASQ"]));
        existing.insert("RAVEL-MASQ".to_string(), chain(&["-A RAVEL-MASQ -j MASQUERADE"]));
        existing.insert("RAVEL-OLD".to_string(), Chain::custom());
        existing.insert("RAVEL-STALE".to_string(), Chain::custom());

        let mut generated = RuleSet::new();
        generated.insert(
            "RAVEL".to_string(),
            chain(&[
                "-A RAVEL -d 10.10.0.1/32 --dport 80 -j RAVEL-MASQ",
                "-A RAVEL -d 10.10.0.1/32 --dport 443 -j RAVEL-MASQ",
            ]),
        );
        generated.insert(
            "RAVEL-MASQ".to_string(),
            chain(&["-A RAVEL-MASQ -j MARK --set-xmark 0x4000/0x4000"]),
        );

        let (merged, removals) = merge(&generated, &existing);

        // both previously managed rules were dropped
        assert_eq!(removals, 2);

        // non-managed chains carried over rule for rule
        assert_eq!(merged["PREROUTING"], existing["PREROUTING"]);
        assert_eq!(merged["KUBE-SERVICES"], existing["KUBE-SERVICES"]);

        // managed chains hold exactly the generated rules
        assert_eq!(merged["RAVEL"].rules.len(), 2);
        assert_eq!(merged["RAVEL-MASQ"].rules.len(), 1);
    }

    #[test]
    fn test_generate_deterministic_under_permutation() {
        let a = config(&[("10.10.0.1", &["80", "443"]), ("10.10.0.2", &["8080"])]);
        let b = config(&[("10.10.0.2", &["8080"]), ("10.10.0.1", &["443", "80"])]);
        assert_eq!(generate(&a, "RAVEL"), generate(&b, "RAVEL"));
    }

    #[test]
    fn test_generate_for_unready_node_has_no_service_rules() {
        let cfg = config(&[("10.10.0.1", &["80"])]);
        let node = Node {
            name: "n1".to_string(),
            ready: false,
            ..Node::default()
        };

        let set = generate_for_node(&node, &cfg, false, "RAVEL");
        assert!(set["RAVEL"].rules.is_empty());
        // managed chains are still declared so stale rules get cleared
        assert!(set.contains_key("RAVEL-MASQ"));

        let forced = generate_for_node(&node, &cfg, true, "RAVEL");
        assert_eq!(forced["RAVEL"].rules.len(), 1);
    }
}
