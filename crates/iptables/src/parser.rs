//! Parser for a single table of `iptables-save` output.

use crate::rules::{Chain, RuleSet};
use common::{Error, Result};

/// Parse one table out of `iptables-save` output.
///
/// Handles the `*<table>` / `COMMIT` framing, `:CHAIN POLICY [pkts:bytes]`
/// declarations, and `-A CHAIN ...` rules. Comments and blank lines are
/// skipped. A rule appended to an undeclared chain creates it implicitly.
pub fn parse_save(table: &str, data: &[u8]) -> Result<RuleSet> {
    let text = std::str::from_utf8(data)
        .map_err(|e| Error::iptables(format!("save output is not utf-8: {}", e)))?;

    let marker = format!("*{}", table);
    let mut in_table = false;
    let mut set = RuleSet::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(name) = line.strip_prefix('*') {
            in_table = name == table;
            continue;
        }
        if !in_table {
            continue;
        }
        if line == "COMMIT" {
            return Ok(set);
        }
        if let Some(decl) = line.strip_prefix(':') {
            let (name, policy, packets, bytes) = parse_chain_decl(decl)?;
            set.insert(
                name,
                Chain {
                    policy,
                    packets,
                    bytes,
                    rules: Vec::new(),
                },
            );
        } else if line.starts_with("-A ") {
            let chain_name = line
                .split_whitespace()
                .nth(1)
                .ok_or_else(|| Error::iptables(format!("malformed rule: {}", line)))?;
            set.entry(chain_name.to_string())
                .or_insert_with(Chain::custom)
                .rules
                .push(line.to_string());
        }
        // other directives (-I, -P outside declarations) are not produced by
        // iptables-save and are ignored
    }

    if set.is_empty() && !text.contains(&marker) {
        return Err(Error::iptables(format!("table {} not found", table)));
    }
    Ok(set)
}

fn parse_chain_decl(decl: &str) -> Result<(String, String, u64, u64)> {
    let mut fields = decl.split_whitespace();
    let name = fields
        .next()
        .ok_or_else(|| Error::iptables("empty chain declaration"))?;
    let policy = fields
        .next()
        .ok_or_else(|| Error::iptables(format!("chain {} missing policy", name)))?;

    let (packets, bytes) = match fields.next() {
        Some(counters) => {
            let trimmed = counters.trim_start_matches('[').trim_end_matches(']');
            let mut parts = trimmed.splitn(2, ':');
            let p = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0);
            let b = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0);
            (p, b)
        }
        None => (0, 0),
    };

    Ok((name.to_string(), policy.to_string(), packets, bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::bytes_from_rules;

    const SAVE_DATA: &[u8] = br#"# Generated by iptables-save v1.4.21 on Wed Mar 22 00:38:34 2017
*nat
:PREROUTING ACCEPT [7:420]
:KUBE-IPVS - [0:0]
:KUBE-MARK-MASQ - [0:0]
:KUBE-SEP-2CYGKEFSDFORQH3J - [0:0]
:KUBE-SERVICES - [0:0]
:KUBE-SVC-ZSTEUXYJ236S7BT6 - [0:0]
-A PREROUTING -m comment --comment "kubernetes service portals" -j KUBE-SERVICES
-A PREROUTING -m addrtype --dst-type LOCAL -j DOCKER
-A KUBE-SEP-2CYGKEFSDFORQH3J -s 192.168.232.4/32 -m comment --comment "emc-local/nodeport-auto:http" -j KUBE-MARK-MASQ
-A KUBE-SEP-2CYGKEFSDFORQH3J -p tcp -m comment --comment "emc-local/nodeport-auto:http" -m tcp -j DNAT --to-destination 192.168.232.4:80
-A KUBE-SERVICES -d 192.168.1.128/32 -p tcp -m comment --comment "test-env-lolcats/my-nginx:omgwtfbbq cluster IP" -m tcp --dport 80 -j KUBE-SVC-ZSTEUXYJ236S7BT6
COMMIT
# Completed on Wed Mar 22 00:38:34 2017"#;

    #[test]
    fn test_parse_save_fixture() {
        let set = parse_save("nat", SAVE_DATA).unwrap();

        assert_eq!(set.len(), 6, "expected six chains in rules set");
        assert_eq!(
            set["PREROUTING"].rules.len(),
            2,
            "expected two rules in PREROUTING chain"
        );

        let total: usize = set.values().map(|c| c.rules.len()).sum();
        assert_eq!(total, 5, "expected five rules total");
    }

    #[test]
    fn test_parse_save_chain_counters() {
        let set = parse_save("nat", SAVE_DATA).unwrap();
        let pre = &set["PREROUTING"];
        assert_eq!(pre.policy, "ACCEPT");
        assert_eq!(pre.packets, 7);
        assert_eq!(pre.bytes, 420);

        let kube = &set["KUBE-SERVICES"];
        assert_eq!(kube.policy, "-");
        assert_eq!(kube.packets, 0);
    }

    #[test]
    fn test_parse_save_missing_table() {
        assert!(parse_save("mangle", SAVE_DATA).is_err());
    }

    #[test]
    fn test_round_trip() {
        let parsed = parse_save("nat", SAVE_DATA).unwrap();
        let emitted = bytes_from_rules("nat", &parsed);
        let reparsed = parse_save("nat", &emitted).unwrap();
        assert_eq!(parsed, reparsed);
    }

    #[test]
    fn test_implicit_chain_from_rule() {
        let data = b"*nat\n-A ORPHAN -j ACCEPT\nCOMMIT\n";
        let set = parse_save("nat", data).unwrap();
        assert_eq!(set["ORPHAN"].policy, "-");
        assert_eq!(set["ORPHAN"].rules.len(), 1);
    }
}
