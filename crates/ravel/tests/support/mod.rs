//! Fake capability implementations shared by the worker integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use common::types::{nodes_equal, ClusterConfig, Node, NodesList, Service};
use common::{Error, Result};
use haproxy::{HAProxySet, VIPConfig};
use iptables::{Chain, IpTables, RuleSet};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use system::{BgpController, Ip, Ipvs, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Shared, ordered log of fake operations for ordering assertions.
pub type OpLog = Arc<Mutex<Vec<String>>>;

pub fn op_log() -> OpLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn log_op(log: &OpLog, op: impl Into<String>) {
    log.lock().unwrap().push(op.into());
}

pub fn op_index(log: &OpLog, op: &str) -> Option<usize> {
    log.lock().unwrap().iter().position(|o| o == op)
}

/// Watcher fake: delivers whatever the test publishes.
pub struct FakeWatcher {
    node_subs: Mutex<Vec<mpsc::Sender<NodesList>>>,
    config_subs: Mutex<Vec<mpsc::Sender<Arc<ClusterConfig>>>>,
    services: Mutex<HashMap<String, Service>>,
}

impl FakeWatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            node_subs: Mutex::new(Vec::new()),
            config_subs: Mutex::new(Vec::new()),
            services: Mutex::new(HashMap::new()),
        })
    }

    pub fn set_services(&self, services: HashMap<String, Service>) {
        *self.services.lock().unwrap() = services;
    }

    pub async fn publish_nodes(&self, nodes: NodesList) {
        let subs: Vec<_> = self.node_subs.lock().unwrap().clone();
        for tx in subs {
            tx.send(nodes.clone()).await.expect("node subscriber gone");
        }
    }

    pub async fn publish_config(&self, config: ClusterConfig) {
        let config = Arc::new(config);
        let subs: Vec<_> = self.config_subs.lock().unwrap().clone();
        for tx in subs {
            tx.send(config.clone()).await.expect("config subscriber gone");
        }
    }
}

impl Watcher for FakeWatcher {
    fn nodes(&self, _ctx: CancellationToken, _subscriber: &str, tx: mpsc::Sender<NodesList>) {
        self.node_subs.lock().unwrap().push(tx);
    }

    fn config_map(
        &self,
        _ctx: CancellationToken,
        _subscriber: &str,
        tx: mpsc::Sender<Arc<ClusterConfig>>,
    ) {
        self.config_subs.lock().unwrap().push(tx);
    }

    fn services(&self) -> HashMap<String, Service> {
        self.services.lock().unwrap().clone()
    }
}

/// In-memory address store standing in for a network device.
pub struct FakeIp {
    device: String,
    v4: Mutex<Vec<String>>,
    v6: Mutex<Vec<String>>,
    log: OpLog,
}

impl FakeIp {
    pub fn new(device: &str, log: OpLog) -> Arc<Self> {
        Arc::new(Self {
            device: device.to_string(),
            v4: Mutex::new(Vec::new()),
            v6: Mutex::new(Vec::new()),
            log,
        })
    }

    pub fn addrs(&self) -> Vec<String> {
        self.v4.lock().unwrap().clone()
    }

    pub fn addrs6(&self) -> Vec<String> {
        self.v6.lock().unwrap().clone()
    }

    pub fn seed(&self, addrs: &[&str]) {
        *self.v4.lock().unwrap() = addrs.iter().map(|a| a.to_string()).collect();
    }
}

#[async_trait]
impl Ip for FakeIp {
    fn device(&self) -> &str {
        &self.device
    }

    async fn get(&self) -> Result<Vec<String>> {
        Ok(self.addrs())
    }

    async fn get6(&self) -> Result<Vec<String>> {
        Ok(self.addrs6())
    }

    async fn add(&self, addr: &str) -> Result<()> {
        log_op(&self.log, format!("{}.add {}", self.device, addr));
        self.v4.lock().unwrap().push(addr.to_string());
        Ok(())
    }

    async fn add6(&self, addr: &str) -> Result<()> {
        log_op(&self.log, format!("{}.add6 {}", self.device, addr));
        self.v6.lock().unwrap().push(addr.to_string());
        Ok(())
    }

    async fn del(&self, addr: &str) -> Result<()> {
        log_op(&self.log, format!("{}.del {}", self.device, addr));
        self.v4.lock().unwrap().retain(|a| a != addr);
        Ok(())
    }

    async fn del6(&self, addr: &str) -> Result<()> {
        log_op(&self.log, format!("{}.del6 {}", self.device, addr));
        self.v6.lock().unwrap().retain(|a| a != addr);
        Ok(())
    }

    async fn teardown(&self) -> Result<()> {
        log_op(&self.log, format!("{}.teardown", self.device));
        self.v4.lock().unwrap().clear();
        self.v6.lock().unwrap().clear();
        Ok(())
    }

    async fn set_arp(&self) -> Result<()> {
        log_op(&self.log, format!("{}.set_arp", self.device));
        Ok(())
    }

    async fn set_rp_filter(&self) -> Result<()> {
        log_op(&self.log, format!("{}.set_rp_filter", self.device));
        Ok(())
    }
}

/// IPVS fake tracking what was last programmed.
pub struct FakeIpvs {
    programmed: Mutex<Option<(NodesList, ClusterConfig)>>,
    set_calls: AtomicUsize,
    parity_calls: AtomicUsize,
    log: OpLog,
}

impl FakeIpvs {
    pub fn new(log: OpLog) -> Arc<Self> {
        Arc::new(Self {
            programmed: Mutex::new(None),
            set_calls: AtomicUsize::new(0),
            parity_calls: AtomicUsize::new(0),
            log,
        })
    }

    pub fn set_calls(&self) -> usize {
        self.set_calls.load(Ordering::SeqCst)
    }

    pub fn parity_calls(&self) -> usize {
        self.parity_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Ipvs for FakeIpvs {
    async fn set_ipvs(&self, nodes: &NodesList, config: &ClusterConfig) -> Result<()> {
        log_op(&self.log, "ipvs.set");
        self.set_calls.fetch_add(1, Ordering::SeqCst);
        *self.programmed.lock().unwrap() = Some((nodes.clone(), config.clone()));
        Ok(())
    }

    async fn check_config_parity(
        &self,
        nodes: &NodesList,
        config: Option<&ClusterConfig>,
        vips: &[String],
        config_ready: bool,
    ) -> Result<bool> {
        self.parity_calls.fetch_add(1, Ordering::SeqCst);
        let Some(config) = config else {
            return Ok(true);
        };
        if config_ready {
            return Ok(false);
        }

        let mut have = vips.to_vec();
        have.sort();
        let mut want = config.vips();
        want.sort();
        if have != want {
            return Ok(false);
        }

        let programmed = self.programmed.lock().unwrap();
        Ok(matches!(&*programmed, Some((n, c)) if nodes_equal(n, nodes) && c == config))
    }

    async fn teardown(&self) -> Result<()> {
        log_op(&self.log, "ipvs.teardown");
        *self.programmed.lock().unwrap() = None;
        Ok(())
    }
}

/// BGP fake recording every announcement.
pub struct FakeBgp {
    calls: Mutex<Vec<Vec<String>>>,
}

impl FakeBgp {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn announced(&self) -> Vec<String> {
        let mut all: Vec<String> = self.calls.lock().unwrap().concat();
        all.sort();
        all.dedup();
        all
    }
}

#[async_trait]
impl BgpController for FakeBgp {
    async fn set(&self, addrs: &[String]) -> Result<()> {
        self.calls.lock().unwrap().push(addrs.to_vec());
        Ok(())
    }
}

/// HAProxy set fake recording the converged fleet.
pub struct FakeHAProxySet {
    configured: Mutex<BTreeMap<String, VIPConfig>>,
    stopped: Mutex<Vec<String>>,
    errors: AtomicU64,
}

impl FakeHAProxySet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            configured: Mutex::new(BTreeMap::new()),
            stopped: Mutex::new(Vec::new()),
            errors: AtomicU64::new(0),
        })
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }

    pub fn configured(&self) -> BTreeMap<String, VIPConfig> {
        self.configured.lock().unwrap().clone()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.stopped.lock().unwrap().clone()
    }
}

#[async_trait]
impl HAProxySet for FakeHAProxySet {
    async fn configure(&self, config: VIPConfig) -> Result<()> {
        self.configured
            .lock()
            .unwrap()
            .insert(config.addr6.clone(), config);
        Ok(())
    }

    fn stop_all(&self) {
        self.configured.lock().unwrap().clear();
    }

    fn stop_one(&self, listen_addr: &str) {
        self.configured.lock().unwrap().remove(listen_addr);
        self.stopped.lock().unwrap().push(listen_addr.to_string());
    }

    fn get_removals(&self, desired: &[String]) -> Vec<String> {
        self.configured
            .lock()
            .unwrap()
            .keys()
            .filter(|addr| !desired.contains(addr))
            .cloned()
            .collect()
    }

    fn instance_count(&self) -> usize {
        self.configured.lock().unwrap().len()
    }

    fn error_count(&self) -> u64 {
        self.errors.load(Ordering::SeqCst)
    }

    fn dropped_error_count(&self) -> u64 {
        0
    }
}

/// In-memory iptables fake that reuses the real generate and merge logic.
pub struct FakeIpTables {
    table: String,
    base_chain: String,
    store: Mutex<RuleSet>,
    fail_restore: AtomicBool,
    log: OpLog,
}

impl FakeIpTables {
    pub fn new(log: OpLog) -> Arc<Self> {
        Arc::new(Self {
            table: "nat".to_string(),
            base_chain: "RAVEL".to_string(),
            store: Mutex::new(RuleSet::new()),
            fail_restore: AtomicBool::new(false),
            log,
        })
    }

    pub fn seed(&self, rules: RuleSet) {
        *self.store.lock().unwrap() = rules;
    }

    pub fn rules(&self) -> RuleSet {
        self.store.lock().unwrap().clone()
    }

    pub fn set_fail_restore(&self, fail: bool) {
        self.fail_restore.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl IpTables for FakeIpTables {
    async fn save(&self) -> Result<RuleSet> {
        Ok(self.rules())
    }

    async fn restore(&self, rules: &RuleSet) -> Result<()> {
        if self.fail_restore.load(Ordering::SeqCst) {
            return Err(Error::iptables("restore failed"));
        }
        log_op(&self.log, "iptables.restore");
        *self.store.lock().unwrap() = rules.clone();
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        log_op(&self.log, "iptables.flush");
        let base = self.base_chain.clone();
        self.store
            .lock()
            .unwrap()
            .retain(|name, _| name != &base && !name.starts_with(&format!("{}-", base)));
        Ok(())
    }

    async fn ensure_base_jump(&self) -> Result<()> {
        log_op(&self.log, "iptables.ensure_jump");
        let jump = format!("-A PREROUTING -j {}", self.base_chain);
        let mut store = self.store.lock().unwrap();
        let chain = store.entry("PREROUTING".to_string()).or_insert_with(|| Chain {
            policy: "ACCEPT".to_string(),
            ..Chain::default()
        });
        if !chain.rules.contains(&jump) {
            chain.rules.push(jump);
        }
        Ok(())
    }

    fn table(&self) -> &str {
        &self.table
    }

    fn base_chain(&self) -> &str {
        &self.base_chain
    }

    fn generate_rules(&self, config: &ClusterConfig) -> Result<RuleSet> {
        Ok(iptables::rules::generate(config, &self.base_chain))
    }

    fn generate_rules_for_node(
        &self,
        node: &Node,
        config: &ClusterConfig,
        include_unready: bool,
    ) -> Result<RuleSet> {
        Ok(iptables::rules::generate_for_node(
            node,
            config,
            include_unready,
            &self.base_chain,
        ))
    }

    fn merge(&self, generated: &RuleSet, existing: &RuleSet) -> Result<(RuleSet, usize)> {
        Ok(iptables::rules::merge(generated, existing))
    }
}

// Builders shared by the worker tests.

pub fn node(name: &str, addr: &str, ready: bool) -> Node {
    Node {
        name: name.to_string(),
        addresses: vec![addr.to_string()],
        labels: BTreeMap::new(),
        ready,
    }
}

pub fn port_map(ports: &[&str]) -> common::types::PortMap {
    let mut pm = common::types::PortMap::new();
    for p in ports {
        pm.insert(
            p.to_string(),
            common::types::ServiceRef {
                namespace: "ns".to_string(),
                service: "web".to_string(),
                port_name: "http".to_string(),
            },
        );
    }
    pm
}

pub fn cluster_config(vips: &[(&str, &[&str])]) -> ClusterConfig {
    let mut cfg = ClusterConfig::default();
    for (vip, ports) in vips {
        cfg.config.insert(vip.to_string(), port_map(ports));
    }
    cfg
}

pub fn service_snapshot(cluster_ip: &str, ports: &[(&str, u16)]) -> Service {
    Service {
        cluster_ip: cluster_ip.to_string(),
        ports: ports
            .iter()
            .map(|(name, port)| common::types::ServicePort {
                name: name.to_string(),
                port: *port,
            })
            .collect(),
    }
}

/// Poll until `predicate` holds or the timeout elapses.
pub async fn wait_for(timeout: std::time::Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    predicate()
}
