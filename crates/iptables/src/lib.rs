//! Round-trip of the `iptables-save`/`iptables-restore` format for the
//! realserver's managed NAT chains.
//!
//! The realserver owns a base chain (jumped to from `PREROUTING`) plus
//! helper chains derived from it. Reconciliation parses the live table,
//! generates the managed chains from the cluster config, merges the two
//! (managed chains replaced, everything else preserved verbatim), and
//! restores the merged table.

pub mod parser;
pub mod rules;

pub use parser::parse_save;
pub use rules::{bytes_from_rules, merge, Chain, RuleSet};

use async_trait::async_trait;
use common::types::{ClusterConfig, Node};
use common::{Error, Result};
use system::cmd;
use tracing::{debug, info};

/// iptables boundary consumed by the realserver.
#[async_trait]
pub trait IpTables: Send + Sync {
    /// Parse the live table.
    async fn save(&self) -> Result<RuleSet>;

    /// Replace the live table with `rules`.
    async fn restore(&self, rules: &RuleSet) -> Result<()>;

    /// Remove all managed chains and the base-chain jump.
    async fn flush(&self) -> Result<()>;

    /// Install the `PREROUTING` jump into the base chain if missing.
    async fn ensure_base_jump(&self) -> Result<()>;

    /// The table this instance manages, e.g. `nat`.
    fn table(&self) -> &str;

    /// Name of the managed base chain.
    fn base_chain(&self) -> &str;

    /// Generate managed chains for the whole config.
    fn generate_rules(&self, config: &ClusterConfig) -> Result<RuleSet>;

    /// Generate managed chains scoped to one node.
    fn generate_rules_for_node(
        &self,
        node: &Node,
        config: &ClusterConfig,
        include_unready: bool,
    ) -> Result<RuleSet>;

    /// Merge generated chains into an existing set, returning the merged
    /// set and the number of rules removed from managed chains.
    fn merge(&self, generated: &RuleSet, existing: &RuleSet) -> Result<(RuleSet, usize)>;
}

/// Production [`IpTables`] implementation backed by the iptables CLI.
pub struct CommandIpTables {
    table: String,
    base_chain: String,
}

impl CommandIpTables {
    pub fn new(table: impl Into<String>, base_chain: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            base_chain: base_chain.into(),
        }
    }

    fn is_managed(&self, chain: &str) -> bool {
        chain == self.base_chain || chain.starts_with(&format!("{}-", self.base_chain))
    }
}

#[async_trait]
impl IpTables for CommandIpTables {
    async fn save(&self) -> Result<RuleSet> {
        let out = cmd::run("iptables-save", &["-t", &self.table])
            .await
            .map_err(Error::iptables)?;
        parse_save(&self.table, out.as_bytes())
    }

    async fn restore(&self, rules: &RuleSet) -> Result<()> {
        let input = bytes_from_rules(&self.table, rules);
        info!(table = %self.table, chains = rules.len(), "restoring rules");
        cmd::run_with_stdin("iptables-restore", &["--counters"], &input)
            .await
            .map_err(Error::iptables)?;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let existing = self.save().await?;
        let jump = format!("-j {}", self.base_chain);

        // drop the jump first so the chains can be deleted
        if existing
            .get("PREROUTING")
            .map(|c| c.rules.iter().any(|r| r.ends_with(&jump)))
            .unwrap_or(false)
        {
            cmd::run(
                "iptables",
                &["-t", &self.table, "-D", "PREROUTING", "-j", &self.base_chain],
            )
            .await
            .map_err(Error::iptables)?;
        }

        for chain in existing.keys().filter(|c| self.is_managed(c)) {
            debug!(chain = %chain, "flushing managed chain");
            cmd::run("iptables", &["-t", &self.table, "-F", chain])
                .await
                .map_err(Error::iptables)?;
            cmd::run("iptables", &["-t", &self.table, "-X", chain])
                .await
                .map_err(Error::iptables)?;
        }
        Ok(())
    }

    async fn ensure_base_jump(&self) -> Result<()> {
        let check = cmd::run(
            "iptables",
            &["-t", &self.table, "-C", "PREROUTING", "-j", &self.base_chain],
        )
        .await;
        if check.is_ok() {
            return Ok(());
        }

        // chain may not exist yet; creation failure surfaces on the append
        let _ = cmd::run("iptables", &["-t", &self.table, "-N", &self.base_chain]).await;
        cmd::run(
            "iptables",
            &["-t", &self.table, "-A", "PREROUTING", "-j", &self.base_chain],
        )
        .await
        .map_err(Error::iptables)?;
        Ok(())
    }

    fn table(&self) -> &str {
        &self.table
    }

    fn base_chain(&self) -> &str {
        &self.base_chain
    }

    fn generate_rules(&self, config: &ClusterConfig) -> Result<RuleSet> {
        Ok(rules::generate(config, &self.base_chain))
    }

    fn generate_rules_for_node(
        &self,
        node: &Node,
        config: &ClusterConfig,
        include_unready: bool,
    ) -> Result<RuleSet> {
        Ok(rules::generate_for_node(
            node,
            config,
            include_unready,
            &self.base_chain,
        ))
    }

    fn merge(&self, generated: &RuleSet, existing: &RuleSet) -> Result<(RuleSet, usize)> {
        Ok(rules::merge(generated, existing))
    }
}
