//! Director worker (BGP mode).
//!
//! Owns the VIPs as routed state: binds them on the loopback device,
//! announces them via BGP, and programs IPVS to spread traffic across the
//! backend node IPs. On the IPv6 path, traffic is front-ended through the
//! per-VIP HAProxy set instead of IPVS.

use crate::metrics::WorkerMetrics;
use crate::worker::WorkerState;
use common::types::{build_service_index, nodes_equal, ClusterConfig, NodesList, ServiceIndex};
use common::{Error, Result};
use haproxy::{HAProxySet, VIPConfig};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use system::{BgpController, Ip, Ipvs, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const WORKER: &str = "director";
const WORKER_V6: &str = "director-v6";

const STOP_TIMEOUT: Duration = Duration::from_millis(5000);
const CLEANUP_TIMEOUT: Duration = Duration::from_millis(5000);

/// Tick cadence for the periodic loop.
#[derive(Debug, Clone)]
pub struct DirectorTimers {
    pub queue_depth: Duration,
    pub forced_reconfigure: Duration,
    pub parity: Duration,
    pub service_index: Duration,
}

impl Default for DirectorTimers {
    fn default() -> Self {
        Self {
            queue_depth: Duration::from_secs(60),
            forced_reconfigure: Duration::from_secs(30),
            parity: Duration::from_millis(2000),
            service_index: Duration::from_millis(100),
        }
    }
}

/// The director worker.
pub struct Director {
    watcher: Arc<dyn Watcher>,
    ip_loopback: Arc<dyn Ip>,
    #[allow(dead_code)]
    ip_primary: Arc<dyn Ip>,
    ipvs: Arc<dyn Ipvs>,
    bgp: Arc<dyn BgpController>,
    haproxy: Arc<dyn HAProxySet>,

    state: Mutex<WorkerState>,
    services: Mutex<ServiceIndex>,

    node_tx: mpsc::Sender<NodesList>,
    config_tx: mpsc::Sender<Arc<ClusterConfig>>,
    node_rx: Mutex<Option<mpsc::Receiver<NodesList>>>,
    config_rx: Mutex<Option<mpsc::Receiver<Arc<ClusterConfig>>>>,

    done_tx: mpsc::Sender<()>,
    done_rx: Mutex<Option<mpsc::Receiver<()>>>,

    ctx: CancellationToken,
    watch_ctx: Mutex<Option<CancellationToken>>,

    timers: DirectorTimers,
    metrics: Arc<WorkerMetrics>,
}

impl Director {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: CancellationToken,
        watcher: Arc<dyn Watcher>,
        ip_loopback: Arc<dyn Ip>,
        ip_primary: Arc<dyn Ip>,
        ipvs: Arc<dyn Ipvs>,
        bgp: Arc<dyn BgpController>,
        haproxy: Arc<dyn HAProxySet>,
        timers: DirectorTimers,
        metrics: Arc<WorkerMetrics>,
    ) -> Arc<Self> {
        // capacity 1: the watcher coalesces, the worker keeps only the newest
        let (node_tx, node_rx) = mpsc::channel(1);
        let (config_tx, config_rx) = mpsc::channel(1);
        let (done_tx, done_rx) = mpsc::channel(1);

        Arc::new(Self {
            watcher,
            ip_loopback,
            ip_primary,
            ipvs,
            bgp,
            haproxy,
            state: Mutex::new(WorkerState::new()),
            services: Mutex::new(ServiceIndex::new()),
            node_tx,
            config_tx,
            node_rx: Mutex::new(Some(node_rx)),
            config_rx: Mutex::new(Some(config_rx)),
            done_tx,
            done_rx: Mutex::new(Some(done_rx)),
            ctx,
            watch_ctx: Mutex::new(None),
            timers,
            metrics,
        })
    }

    /// Tear down any leftover state, register watches, and spawn the
    /// long-lived tasks.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.cleanup().await?;

        let node_rx = self
            .node_rx
            .lock()
            .expect("node_rx lock poisoned")
            .take()
            .ok_or_else(|| Error::other("director already started"))?;
        let config_rx = self
            .config_rx
            .lock()
            .expect("config_rx lock poisoned")
            .take()
            .ok_or_else(|| Error::other("director already started"))?;

        let watch_ctx = self.ctx.child_token();
        *self.watch_ctx.lock().expect("watch_ctx lock poisoned") = Some(watch_ctx.clone());

        self.watcher
            .nodes(watch_ctx.clone(), "director-nodes", self.node_tx.clone());
        self.watcher
            .config_map(watch_ctx.clone(), "director-configmap", self.config_tx.clone());

        tokio::spawn(self.clone().watches(watch_ctx.clone(), node_rx, config_rx));
        tokio::spawn(self.clone().periodic(watch_ctx));
        tokio::spawn(self.clone().watch_service_updates());
        Ok(())
    }

    /// Cancel the watch context, wait for the periodic loop, and clean up.
    pub async fn stop(&self) -> Result<()> {
        if let Some(ctx) = self.watch_ctx.lock().expect("watch_ctx lock poisoned").take() {
            ctx.cancel();
        }

        info!("blocking until periodic tasks complete");
        let done_rx = self.done_rx.lock().expect("done_rx lock poisoned").take();
        if let Some(mut rx) = done_rx {
            let _ = tokio::time::timeout(STOP_TIMEOUT, rx.recv()).await;
        }

        info!("starting cleanup");
        let result = match tokio::time::timeout(CLEANUP_TIMEOUT, self.cleanup()).await {
            Ok(r) => r,
            Err(_) => Err(Error::other("cleanup timed out")),
        };
        info!(error = ?result.as_ref().err(), "cleanup complete");
        result
    }

    /// Idempotent teardown: stop the HAProxy fleet, then unbind loopback VIPs.
    async fn cleanup(&self) -> Result<()> {
        let mut errs = Vec::new();

        self.haproxy.stop_all();

        if let Err(e) = self.ip_loopback.teardown().await {
            errs.push(format!("cleanup - failed to remove ip addresses - {}", e));
        }

        Error::join(errs)
    }

    /// Latch node and config deliveries into worker state.
    async fn watches(
        self: Arc<Self>,
        watch_ctx: CancellationToken,
        mut node_rx: mpsc::Receiver<NodesList>,
        mut config_rx: mpsc::Receiver<Arc<ClusterConfig>>,
    ) {
        loop {
            tokio::select! {
                Some(nodes) = node_rx.recv() => {
                    let same = {
                        let state = self.state.lock().expect("state lock poisoned");
                        nodes_equal(&state.nodes, &nodes)
                    };
                    if same {
                        self.metrics.node_update(WORKER, "noop");
                        continue;
                    }
                    self.metrics.node_update(WORKER, "updated");
                    self.state
                        .lock()
                        .expect("state lock poisoned")
                        .note_nodes(nodes);
                }

                Some(config) = config_rx.recv() => {
                    debug!("recv on config channel");
                    if let Err(e) = config.validate() {
                        warn!(error = %e, "cluster config violates invariants, applying anyway");
                    }
                    self.state
                        .lock()
                        .expect("state lock poisoned")
                        .note_config(config);
                    self.metrics.config_update(WORKER);
                }

                _ = self.ctx.cancelled() => {
                    debug!("parent context closed, exiting watch loop");
                    return;
                }
                _ = watch_ctx.cancelled() => {
                    debug!("watch context closed, exiting watch loop");
                    return;
                }
            }
        }
    }

    /// Rebuild the flat service index from the watcher snapshot.
    async fn watch_service_updates(self: Arc<Self>) {
        let mut tick = tokio::time::interval(self.timers.service_index);
        tick.tick().await; // skip first immediate tick
        loop {
            tokio::select! {
                _ = self.ctx.cancelled() => return,
                _ = tick.tick() => {}
            }
            let index = build_service_index(&self.watcher.services());
            *self.services.lock().expect("services lock poisoned") = index;
        }
    }

    fn get_cluster_addr(&self, identity: &str) -> Option<String> {
        self.services
            .lock()
            .expect("services lock poisoned")
            .get(identity)
            .cloned()
    }

    /// The periodic loop multiplexing all timers.
    async fn periodic(self: Arc<Self>, watch_ctx: CancellationToken) {
        let mut queue_ticker = tokio::time::interval(self.timers.queue_depth);
        let mut reconfigure_ticker = tokio::time::interval(self.timers.forced_reconfigure);
        let mut parity_ticker = tokio::time::interval(self.timers.parity);
        // skip the immediate first tick of each
        queue_ticker.tick().await;
        reconfigure_ticker.tick().await;
        parity_ticker.tick().await;

        info!(interval = ?self.timers.parity, "starting periodic ticker");

        loop {
            tokio::select! {
                _ = queue_ticker.tick() => {
                    let depth = self.config_tx.max_capacity() - self.config_tx.capacity();
                    self.metrics.queue_depth(WORKER, "config", depth);
                    self.metrics.haproxy_errors(self.haproxy.error_count());
                    self.metrics.haproxy_dropped_errors(self.haproxy.dropped_error_count());
                }

                _ = reconfigure_ticker.tick() => {
                    debug!("mandatory periodic reconfigure executing");
                    let start = Instant::now();
                    if let Err(e) = self.configure().await {
                        self.metrics.reconfigure(WORKER, "critical", start.elapsed());
                        info!(error = %e, "unable to apply mandatory ipv4 reconfiguration");
                    }
                    self.configure6_checked().await;
                }

                _ = parity_ticker.tick() => {
                    self.perform_reconfigure().await;
                }

                _ = self.ctx.cancelled() => {
                    info!("periodic: parent context closed, exiting run loop");
                    let _ = self.done_tx.try_send(());
                    return;
                }
                _ = watch_ctx.cancelled() => {
                    info!("periodic: watch context closed, exiting run loop");
                    return;
                }
            }
        }
    }

    /// Parity-gated reconcile driven by the fast tick.
    async fn perform_reconfigure(&self) {
        // last update happened before the last reconfigure
        if self
            .state
            .lock()
            .expect("state lock poisoned")
            .no_updates_ready()
        {
            return;
        }

        let start = Instant::now();

        let addresses = match self.ip_loopback.get().await {
            Ok(a) => a,
            Err(e) => {
                self.metrics.reconfigure(WORKER, "error", start.elapsed());
                info!(error = %e, "unable to compare configurations");
                return;
            }
        };

        let (nodes, config, config_ready) = {
            let mut state = self.state.lock().expect("state lock poisoned");
            (
                state.nodes.clone(),
                state.config.clone(),
                state.consume_config_ready(),
            )
        };

        let same = match self
            .ipvs
            .check_config_parity(&nodes, config.as_deref(), &addresses, config_ready)
            .await
        {
            Ok(same) => same,
            Err(e) => {
                self.metrics.reconfigure(WORKER, "error", start.elapsed());
                info!(error = %e, "unable to compare configurations");
                return;
            }
        };

        if same {
            debug!("parity same");
            self.metrics.reconfigure(WORKER, "noop", start.elapsed());
            return;
        }

        debug!("parity different, reconfiguring");
        if let Err(e) = self.configure().await {
            self.metrics.reconfigure(WORKER, "critical", start.elapsed());
            info!(error = %e, "unable to apply ipv4 configuration");
            return;
        }
        self.configure6_checked().await;
        self.metrics.reconfigure(WORKER, "complete", start.elapsed());
    }

    /// IPv4 path: loopback addresses, BGP announcements, IPVS rules.
    async fn configure(&self) -> Result<()> {
        let (config, nodes) = {
            let state = self.state.lock().expect("state lock poisoned");
            (state.config.clone(), state.nodes.clone())
        };
        let Some(config) = config else {
            return Ok(());
        };

        self.set_addresses(&config).await?;

        // announce VIPs; this only adds, and never removes, routes
        debug!("applying bgp settings");
        self.bgp.set(&config.vips()).await?;

        self.ipvs
            .set_ipvs(&nodes, &config)
            .await
            .map_err(|e| Error::ipvs(format!("unable to configure ipvs: {}", e)))?;
        debug!("ipvs configured");

        self.state
            .lock()
            .expect("state lock poisoned")
            .mark_reconfigured();
        Ok(())
    }

    /// Run the IPv6 path when the config carries IPv6 state, recording its
    /// outcome independently of the IPv4 result.
    async fn configure6_checked(&self) {
        let config = {
            let state = self.state.lock().expect("state lock poisoned");
            state.config.clone()
        };
        let Some(config) = config else { return };
        if config.config6.is_empty() && config.ipv6.is_empty() {
            return;
        }

        let start = Instant::now();
        match self.configure6(&config).await {
            Ok(()) => self.metrics.reconfigure(WORKER_V6, "complete", start.elapsed()),
            Err(e) => {
                self.metrics.reconfigure(WORKER_V6, "error", start.elapsed());
                info!(error = %e, "unable to apply ipv6 configuration");
            }
        }
    }

    /// IPv6 path: loopback addresses, HAProxy fleet, BGP announcements.
    async fn configure6(&self, config: &ClusterConfig) -> Result<()> {
        self.set_addresses6(config).await?;

        debug!("configuring haproxy");
        self.configure_haproxy(config).await?;

        debug!("setting up bgp");
        self.bgp.set(&config.vips6()).await?;

        debug!("ipv6 configuration complete");
        Ok(())
    }

    /// Diff loopback IPv4 addresses against the config and apply.
    async fn set_addresses(&self, config: &ClusterConfig) -> Result<()> {
        let configured = self.ip_loopback.get().await?;
        let desired = config.vips();

        let (removals, additions) = self.ip_loopback.compare(&configured, &desired);
        debug!(?additions, ?removals, "loopback delta");
        self.metrics.loopback_additions(additions.len());
        self.metrics.loopback_removals(removals.len());
        self.metrics.loopback_desired(desired.len());
        self.metrics.loopback_config_healthy(true);

        for addr in &removals {
            info!(device = %self.ip_loopback.device(), addr = %addr, action = "deleting", "updating loopback");
            if let Err(e) = self.ip_loopback.del(addr).await {
                self.metrics.loopback_error("remove");
                self.metrics.loopback_config_healthy(false);
                return Err(e);
            }
        }
        for addr in &additions {
            info!(device = %self.ip_loopback.device(), addr = %addr, action = "adding", "updating loopback");
            if let Err(e) = self.ip_loopback.add(addr).await {
                self.metrics.loopback_error("add");
                self.metrics.loopback_config_healthy(false);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Diff loopback IPv6 addresses against the config and apply.
    async fn set_addresses6(&self, config: &ClusterConfig) -> Result<()> {
        let configured = self.ip_loopback.get6().await?;
        let desired = config.vips6();

        let (removals, additions) = self.ip_loopback.compare(&configured, &desired);
        debug!(?additions, ?removals, "loopback v6 delta");

        for addr in &removals {
            info!(device = %self.ip_loopback.device(), addr = %addr, action = "deleting", "updating loopback");
            self.ip_loopback.del6(addr).await?;
        }
        for addr in &additions {
            info!(device = %self.ip_loopback.device(), addr = %addr, action = "adding", "updating loopback");
            self.ip_loopback.add6(addr).await?;
        }
        Ok(())
    }

    /// Build the per-VIP HAProxy configs and converge the fleet.
    ///
    /// For each IPv4 VIP with an IPv6 pairing, the port map is resolved
    /// against the service index into co-indexed service address and listen
    /// port arrays. Unresolvable services are skipped, never fatal.
    async fn configure_haproxy(&self, config: &ClusterConfig) -> Result<()> {
        let mut addrs = Vec::new();
        let mut config_set: HashMap<String, VIPConfig> = HashMap::new();

        for (vip, port_map) in &config.config {
            let Some(addr6) = config.ipv6.get(vip) else {
                debug!(vip = %vip, "no ipv6 pairing for vip");
                continue;
            };
            addrs.push(addr6.clone());

            let mut service_addrs = Vec::new();
            let mut listen_ports = Vec::new();
            for (port, svc) in port_map {
                let Ok(listen_port) = port.parse::<u16>() else {
                    warn!(vip = %vip, port = %port, "skipping unparseable listen port");
                    continue;
                };
                let identity = svc.identity();
                match self.get_cluster_addr(&identity) {
                    Some(addr4) => {
                        service_addrs.push(addr4);
                        listen_ports.push(listen_port);
                    }
                    None => {
                        error!(identity = %identity, "unable to configure haproxy v6, service unresolved");
                        continue;
                    }
                }
            }

            config_set.insert(
                addr6.clone(),
                VIPConfig {
                    addr6: addr6.clone(),
                    service_addrs,
                    listen_ports,
                },
            );
        }

        let removals = self.haproxy.get_removals(&addrs);
        debug!(removals = removals.len(), "haproxy removals");
        for removal in &removals {
            self.haproxy.stop_one(removal);
        }

        debug!(count = addrs.len(), "haproxy addresses");
        for addr in &addrs {
            if let Some(vip_config) = config_set.remove(addr) {
                self.haproxy.configure(vip_config).await?;
            }
        }

        self.metrics.haproxy_instances(self.haproxy.instance_count());
        self.metrics.haproxy_errors(self.haproxy.error_count());
        self.metrics.haproxy_dropped_errors(self.haproxy.dropped_error_count());
        Ok(())
    }
}
