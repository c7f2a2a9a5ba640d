//! Per-VIP HAProxy supervision for the IPv6 front-end path.
//!
//! The director hands the set one [`VIPConfig`] per IPv6 VIP; the set keeps
//! one HAProxy child per VIP alive, reloads it on port changes, and respawns
//! it when it exits unexpectedly. Errors from children arrive on a bounded
//! channel; when that channel saturates the events are dropped and counted
//! rather than blocking the children.

mod instance;

pub use instance::HAProxyInstance;

use async_trait::async_trait;
use common::Result;
use dashmap::DashMap;
use instance::InstanceError;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Per-VIP HAProxy input.
///
/// `service_addrs` and `listen_ports` are co-indexed: index `i` across both
/// describes one frontend/backend pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VIPConfig {
    pub addr6: String,
    pub service_addrs: Vec<String>,
    pub listen_ports: Vec<u16>,
}

/// Supervision boundary the director drives.
#[async_trait]
pub trait HAProxySet: Send + Sync {
    /// Create or reconfigure the instance for `config.addr6`.
    async fn configure(&self, config: VIPConfig) -> Result<()>;

    /// Stop every instance and reset the set.
    fn stop_all(&self);

    /// Stop the instance bound to `listen_addr`.
    fn stop_one(&self, listen_addr: &str);

    /// Configured addresses not present in `desired`.
    fn get_removals(&self, desired: &[String]) -> Vec<String>;

    /// Number of currently configured instances.
    fn instance_count(&self) -> usize;

    /// Instance errors observed since startup.
    fn error_count(&self) -> u64;

    /// Errors dropped because the bounded error channel was full.
    fn dropped_error_count(&self) -> u64;
}

const ERR_CHANNEL_CAPACITY: usize = 100;
const RESPAWN_DELAY: Duration = Duration::from_secs(1);

/// Production [`HAProxySet`] managing one child process per VIP.
pub struct HAProxySetManager {
    instances: DashMap<String, Arc<HAProxyInstance>>,
    cancels: DashMap<String, CancellationToken>,

    binary: String,
    config_dir: PathBuf,

    parent: CancellationToken,
    children: Mutex<CancellationToken>,

    err_tx: mpsc::Sender<InstanceError>,
    errors_total: AtomicU64,
    dropped_errors: Arc<AtomicU64>,
}

impl HAProxySetManager {
    /// Create the set and start its respawn loop.
    pub fn new(
        parent: CancellationToken,
        binary: impl Into<String>,
        config_dir: impl Into<PathBuf>,
    ) -> Arc<Self> {
        let (err_tx, err_rx) = mpsc::channel(ERR_CHANNEL_CAPACITY);

        let set = Arc::new(Self {
            instances: DashMap::new(),
            cancels: DashMap::new(),
            binary: binary.into(),
            config_dir: config_dir.into(),
            children: Mutex::new(parent.child_token()),
            parent,
            err_tx,
            errors_total: AtomicU64::new(0),
            dropped_errors: Arc::new(AtomicU64::new(0)),
        });

        tokio::spawn(set.clone().run(err_rx));
        set
    }

    /// Respawn loop: replace failed instances, one second apart.
    async fn run(self: Arc<Self>, mut err_rx: mpsc::Receiver<InstanceError>) {
        loop {
            let event = tokio::select! {
                _ = self.parent.cancelled() => return,
                event = err_rx.recv() => match event {
                    Some(e) => e,
                    None => return,
                },
            };

            self.errors_total.fetch_add(1, Ordering::SeqCst);
            error!(listen_addr = %event.source, error = %event.error, "instance failed, respawning");

            self.remove(&event.source);
            let ctx = self.child_token();
            match HAProxyInstance::spawn(
                ctx.clone(),
                &self.binary,
                &self.config_dir,
                &event.source,
                event.dest.clone(),
                event.ports.clone(),
                self.err_tx.clone(),
                self.dropped_errors.clone(),
            )
            .await
            {
                Ok(instance) => {
                    self.instances.insert(event.source.clone(), instance);
                    self.cancels.insert(event.source.clone(), ctx);
                }
                Err(e) => {
                    ctx.cancel();
                    error!(listen_addr = %event.source, error = %e, "respawn failed, requeueing");
                    if self.err_tx.try_send(event).is_err() {
                        self.dropped_errors.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }

            // rate limit
            tokio::time::sleep(RESPAWN_DELAY).await;
        }
    }

    fn child_token(&self) -> CancellationToken {
        self.children
            .lock()
            .expect("children lock poisoned")
            .child_token()
    }

    fn remove(&self, listen_addr: &str) {
        if let Some((_, ctx)) = self.cancels.remove(listen_addr) {
            ctx.cancel();
        }
        self.instances.remove(listen_addr);
    }
}

#[async_trait]
impl HAProxySet for HAProxySetManager {
    async fn configure(&self, config: VIPConfig) -> Result<()> {
        let listen_addr = config.addr6.clone();
        debug!(
            listen_addr = %listen_addr,
            dests = ?config.service_addrs,
            ports = ?config.listen_ports,
            "configuring instance"
        );

        if !self.instances.contains_key(&listen_addr) {
            let ctx = self.child_token();
            match HAProxyInstance::spawn(
                ctx.clone(),
                &self.binary,
                &self.config_dir,
                &listen_addr,
                config.service_addrs.clone(),
                config.listen_ports.clone(),
                self.err_tx.clone(),
                self.dropped_errors.clone(),
            )
            .await
            {
                Ok(instance) => {
                    self.instances.insert(listen_addr.clone(), instance);
                    self.cancels.insert(listen_addr.clone(), ctx);
                }
                Err(e) => {
                    ctx.cancel();
                    return Err(e);
                }
            }
        }

        let instance = self
            .instances
            .get(&listen_addr)
            .map(|e| e.value().clone())
            .expect("instance inserted above");
        instance.reload(config.listen_ports).await
    }

    fn stop_all(&self) {
        info!(instances = self.instances.len(), "stopping all instances");
        {
            let mut children = self.children.lock().expect("children lock poisoned");
            children.cancel();
            *children = self.parent.child_token();
        }
        self.instances.clear();
        self.cancels.clear();
    }

    fn stop_one(&self, listen_addr: &str) {
        info!(listen_addr = %listen_addr, "stopping instance");
        self.remove(listen_addr);
    }

    fn get_removals(&self, desired: &[String]) -> Vec<String> {
        let mut removals: Vec<String> = self
            .instances
            .iter()
            .map(|e| e.key().clone())
            .filter(|addr| !desired.contains(addr))
            .collect();
        removals.sort();
        removals
    }

    fn instance_count(&self) -> usize {
        self.instances.len()
    }

    fn error_count(&self) -> u64 {
        self.errors_total.load(Ordering::SeqCst)
    }

    fn dropped_error_count(&self) -> u64 {
        self.dropped_errors.load(Ordering::SeqCst)
    }
}
