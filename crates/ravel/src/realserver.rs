//! Realserver worker.
//!
//! Runs on every backend node: binds the VIPs on the loopback device so the
//! node accepts DSR traffic without ARPing for them, and keeps the managed
//! iptables chains in step with the cluster config.

use crate::metrics::WorkerMetrics;
use crate::worker::WorkerState;
use common::types::{node_equal, ClusterConfig, NodesList};
use common::{Error, Result};
use iptables::{bytes_from_rules, IpTables};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use system::{Ip, Ipvs, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const WORKER: &str = "realserver";

const STOP_TIMEOUT: Duration = Duration::from_millis(5000);
const CLEANUP_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default location for the post-mortem ruleset dump.
pub const DEFAULT_ERROR_DUMP_PATH: &str = "/tmp/realserver-ruleset-err";

/// Tick cadence for the periodic loop.
#[derive(Debug, Clone)]
pub struct RealServerTimers {
    pub check: Duration,
    pub slow: Duration,
    pub forced: Duration,
}

impl Default for RealServerTimers {
    fn default() -> Self {
        Self {
            check: Duration::from_millis(100),
            slow: Duration::from_secs(60),
            forced: Duration::from_secs(600),
        }
    }
}

/// The realserver worker.
pub struct RealServer {
    watcher: Arc<dyn Watcher>,
    ip_primary: Arc<dyn Ip>,
    ip_loopback: Arc<dyn Ip>,
    ipvs: Arc<dyn Ipvs>,
    iptables: Arc<dyn IpTables>,

    node_name: String,
    forced_reconfigure: bool,
    error_dump_path: Mutex<PathBuf>,

    state: Mutex<WorkerState>,
    reconfiguring: AtomicBool,

    node_tx: mpsc::Sender<NodesList>,
    config_tx: mpsc::Sender<Arc<ClusterConfig>>,
    node_rx: Mutex<Option<mpsc::Receiver<NodesList>>>,
    config_rx: Mutex<Option<mpsc::Receiver<Arc<ClusterConfig>>>>,

    done_tx: mpsc::Sender<()>,
    done_rx: Mutex<Option<mpsc::Receiver<()>>>,

    ctx: CancellationToken,
    watch_ctx: Mutex<Option<CancellationToken>>,

    timers: RealServerTimers,
    metrics: Arc<WorkerMetrics>,
}

impl RealServer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: CancellationToken,
        node_name: impl Into<String>,
        watcher: Arc<dyn Watcher>,
        ip_primary: Arc<dyn Ip>,
        ip_loopback: Arc<dyn Ip>,
        ipvs: Arc<dyn Ipvs>,
        iptables: Arc<dyn IpTables>,
        forced_reconfigure: bool,
        timers: RealServerTimers,
        metrics: Arc<WorkerMetrics>,
    ) -> Arc<Self> {
        // capacity 1: the watcher coalesces, the worker keeps only the newest
        let (node_tx, node_rx) = mpsc::channel(1);
        let (config_tx, config_rx) = mpsc::channel(1);
        let (done_tx, done_rx) = mpsc::channel(1);

        Arc::new(Self {
            watcher,
            ip_primary,
            ip_loopback,
            ipvs,
            iptables,
            node_name: node_name.into(),
            forced_reconfigure,
            error_dump_path: Mutex::new(PathBuf::from(DEFAULT_ERROR_DUMP_PATH)),
            state: Mutex::new(WorkerState::new()),
            reconfiguring: AtomicBool::new(false),
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

    /// Override where failed rulesets are dumped.
    pub fn set_error_dump_path(&self, path: impl Into<PathBuf>) {
        *self
            .error_dump_path
            .lock()
            .expect("error_dump_path lock poisoned") = path.into();
    }

    /// Prepare the node and spawn the long-lived tasks.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.reconfiguring.swap(true, Ordering::SeqCst) {
            return Err(Error::other(
                "unable to start, reconfiguration already in progress",
            ));
        }
        let result = self.setup().await;
        self.reconfiguring.store(false, Ordering::SeqCst);
        let (node_rx, config_rx, watch_ctx) = result?;

        tokio::spawn(self.clone().periodic(watch_ctx.clone()));
        tokio::spawn(self.clone().watches(watch_ctx, node_rx, config_rx));
        Ok(())
    }

    /// The setup ordering here is a contract: sysctls must follow cleanup so
    /// the node never ARPs for a VIP before suppression is in place, and the
    /// IPVS teardown stays out of cleanup so stopping a realserver cannot
    /// clobber a co-located director.
    async fn setup(
        &self,
    ) -> Result<(
        mpsc::Receiver<NodesList>,
        mpsc::Receiver<Arc<ClusterConfig>>,
        CancellationToken,
    )> {
        self.cleanup().await?;

        self.ip_loopback.set_arp().await?;
        self.ip_loopback.set_rp_filter().await?;
        self.ip_primary.set_arp().await?;

        self.ipvs.teardown().await?;

        // the realserver never owns VIPs on the primary interface
        for addr in self.ip_primary.get().await? {
            self.ip_primary.del(&addr).await?;
        }

        self.iptables.ensure_base_jump().await?;

        let node_rx = self
            .node_rx
            .lock()
            .expect("node_rx lock poisoned")
            .take()
            .ok_or_else(|| Error::other("realserver already started"))?;
        let config_rx = self
            .config_rx
            .lock()
            .expect("config_rx lock poisoned")
            .take()
            .ok_or_else(|| Error::other("realserver already started"))?;

        let watch_ctx = self.ctx.child_token();
        *self.watch_ctx.lock().expect("watch_ctx lock poisoned") = Some(watch_ctx.clone());

        self.watcher
            .config_map(watch_ctx.clone(), "realserver", self.config_tx.clone());
        self.watcher
            .nodes(watch_ctx.clone(), "realserver-nodes", self.node_tx.clone());

        Ok((node_rx, config_rx, watch_ctx))
    }

    /// Cancel watches, wait for the periodic loop, and clean up.
    pub async fn stop(&self) -> Result<()> {
        if self.reconfiguring.swap(true, Ordering::SeqCst) {
            return Err(Error::other(
                "unable to stop, reconfiguration already in progress",
            ));
        }

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
        self.reconfiguring.store(false, Ordering::SeqCst);
        result
    }

    /// Idempotent teardown: unbind loopback VIPs and flush managed chains.
    async fn cleanup(&self) -> Result<()> {
        let mut errs = Vec::new();

        if let Err(e) = self.ip_loopback.teardown().await {
            errs.push(format!("cleanup - failed to remove ip addresses - {}", e));
        }

        if let Err(e) = self.iptables.flush().await {
            errs.push(format!("cleanup - failed to flush iptables - {}", e));
        }

        Error::join(errs)
    }

    /// Latch config deliveries and this node's own entry from node lists.
    async fn watches(
        self: Arc<Self>,
        watch_ctx: CancellationToken,
        mut node_rx: mpsc::Receiver<NodesList>,
        mut config_rx: mpsc::Receiver<Arc<ClusterConfig>>,
    ) {
        loop {
            tokio::select! {
                Some(nodes) = node_rx.recv() => {
                    debug!(count = nodes.len(), "recv on nodes");
                    let Some(node) = nodes.iter().find(|n| n.name == self.node_name) else {
                        info!(node = %self.node_name, "node not found in list, this shouldn't happen");
                        continue;
                    };

                    let same = {
                        let state = self.state.lock().expect("state lock poisoned");
                        node_equal(&state.node, node)
                    };
                    if same {
                        self.metrics.node_update(WORKER, "noop");
                        continue;
                    }
                    self.metrics.node_update(WORKER, "updated");
                    self.state
                        .lock()
                        .expect("state lock poisoned")
                        .note_node(node.clone());
                }

                Some(config) = config_rx.recv() => {
                    debug!("recv on config");
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

    /// The periodic loop: fast parity-gated tick, slow unconditional tick,
    /// and the optional forced tick that bypasses parity entirely.
    async fn periodic(self: Arc<Self>, watch_ctx: CancellationToken) {
        let mut slow_ticker = tokio::time::interval(self.timers.slow);
        let mut check_ticker = tokio::time::interval(self.timers.check);
        let mut forced_ticker = tokio::time::interval(self.timers.forced);
        // skip the immediate first tick of each
        slow_ticker.tick().await;
        check_ticker.tick().await;
        forced_ticker.tick().await;

        loop {
            tokio::select! {
                _ = forced_ticker.tick() => {
                    if self.forced_reconfigure {
                        let start = Instant::now();
                        if let Err(e) = self.configure(true).await {
                            self.metrics.reconfigure(WORKER, "error", start.elapsed());
                            error!(error = %e, "unable to apply forced configuration");
                        }
                    }
                }

                _ = slow_ticker.tick() => {
                    let start = Instant::now();
                    info!("reconfig triggered due to periodic parity check");
                    if let Err(e) = self.configure(false).await {
                        self.metrics.reconfigure(WORKER, "error", start.elapsed());
                        error!(error = %e, "unable to apply configuration");
                    }
                }

                _ = check_ticker.tick() => {
                    let start = Instant::now();

                    // nothing new since the last success, nothing to do
                    if self
                        .state
                        .lock()
                        .expect("state lock poisoned")
                        .no_updates_ready()
                    {
                        continue;
                    }

                    let depth = self.config_tx.max_capacity() - self.config_tx.capacity();
                    self.metrics.queue_depth(WORKER, "config", depth);

                    let ready = {
                        let state = self.state.lock().expect("state lock poisoned");
                        state.config.is_some() && !state.node.name.is_empty()
                    };
                    if !ready {
                        debug!("config or self node not yet known, skipping apply");
                        self.metrics.reconfigure(WORKER, "noop", start.elapsed());
                        continue;
                    }

                    info!("reconfiguring");
                    match self.configure(false).await {
                        Ok(_) => {
                            info!(elapsed = ?start.elapsed(), "reconfiguration completed successfully");
                            self.state
                                .lock()
                                .expect("state lock poisoned")
                                .mark_reconfigured_at(start);
                            self.metrics.reconfigure(WORKER, "complete", start.elapsed());
                        }
                        Err(e) => {
                            error!(error = %e, "error applying configuration");
                            self.metrics.reconfigure(WORKER, "error", start.elapsed());
                        }
                    }
                }

                _ = self.ctx.cancelled() => {
                    return;
                }
                _ = watch_ctx.cancelled() => {
                    let _ = self.done_tx.try_send(());
                    return;
                }
            }
        }
    }

    /// Converge loopback addresses and iptables rules.
    ///
    /// Returns the number of rules removed from managed chains. Aborts on
    /// the first failing sub-step; a failed restore dumps the attempted
    /// ruleset for post-mortem before returning.
    async fn configure(&self, force: bool) -> Result<usize> {
        if force {
            info!("forced reconfigure, not performing parity check");
        } else if self.check_config_parity().await? {
            debug!("configuration has parity");
            return Ok(0);
        }

        let (config, node) = {
            let state = self.state.lock().expect("state lock poisoned");
            (state.config.clone(), state.node.clone())
        };
        let Some(config) = config else {
            return Ok(0);
        };

        debug!("setting addresses");
        self.set_addresses(&config).await?;

        debug!("capturing iptables rules");
        let existing = self.iptables.save().await?;
        debug!(chains = existing.len(), "got existing rules");

        debug!("generating iptables rules");
        let generated = self.iptables.generate_rules_for_node(&node, &config, false)?;
        debug!(chains = generated.len(), "got generated rules");

        debug!("merging iptables rules");
        let (merged, removals) = self.iptables.merge(&generated, &existing)?;
        debug!(chains = merged.len(), removals, "got merged rules");

        debug!("applying updated rules");
        if let Err(e) = self.iptables.restore(&merged).await {
            let dump_path = self
                .error_dump_path
                .lock()
                .expect("error_dump_path lock poisoned")
                .clone();
            error!(
                path = %dump_path.display(),
                "error applying rules, writing erroneous rule change for debugging"
            );
            let dump = error_ruleset_dump(&e, bytes_from_rules(self.iptables.table(), &merged));
            if let Err(write_err) = tokio::fs::write(&dump_path, &dump).await {
                error!(
                    error = %write_err,
                    rules = %String::from_utf8_lossy(&dump),
                    "error writing dump file; logging rules"
                );
            }
            return Err(e);
        }

        Ok(removals)
    }

    /// Cheap desired-vs-observed comparison: loopback addresses against the
    /// config VIPs, and the base chain's live rules against generated ones.
    async fn check_config_parity(&self) -> Result<bool> {
        let config = {
            let state = self.state.lock().expect("state lock poisoned");
            state.config.clone()
        };
        // nothing to do yet
        let Some(config) = config else {
            return Ok(true);
        };

        let mut addresses = self.ip_loopback.get().await?;
        addresses.sort();
        let mut vips = config.vips();
        vips.sort();

        let existing = self.iptables.save().await?;
        let mut existing_rules = existing
            .get(self.iptables.base_chain())
            .map(|c| c.rules.clone())
            .unwrap_or_default();
        existing_rules.sort();

        let generated = self.iptables.generate_rules(&config)?;
        let mut generated_rules = generated
            .get(self.iptables.base_chain())
            .map(|c| c.rules.clone())
            .unwrap_or_default();
        generated_rules.sort();

        Ok(vips == addresses && existing_rules == generated_rules)
    }

    /// Diff loopback addresses against the config VIPs and apply.
    async fn set_addresses(&self, config: &ClusterConfig) -> Result<()> {
        let configured = self.ip_loopback.get().await?;
        let desired = config.vips();

        let (removals, additions) = self.ip_loopback.compare(&configured, &desired);

        for addr in &removals {
            info!(device = %self.ip_loopback.device(), addr = %addr, action = "deleting", "updating loopback");
            self.ip_loopback.del(addr).await?;
        }
        for addr in &additions {
            info!(device = %self.ip_loopback.device(), addr = %addr, action = "adding", "updating loopback");
            self.ip_loopback.add(addr).await?;
        }
        Ok(())
    }
}

/// Prefix a failed ruleset with the restore error for the dump file.
fn error_ruleset_dump(err: &Error, rules: Vec<u8>) -> Vec<u8> {
    let mut out = format!("iptables restore error: {}\n", err).into_bytes();
    out.extend(rules);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_ruleset_dump_prefaces_error() {
        let err = Error::iptables("restore exploded");
        let dump = error_ruleset_dump(&err, b"*nat\nCOMMIT\n".to_vec());
        let text = String::from_utf8(dump).unwrap();
        assert!(text.starts_with("iptables restore error:"));
        assert!(text.contains("restore exploded"));
        assert!(text.ends_with("*nat\nCOMMIT\n"));
    }
}
