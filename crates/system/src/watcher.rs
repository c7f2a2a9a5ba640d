//! The cluster watch boundary.
//!
//! The production watch layer sits in front of the Kubernetes API and is
//! deployed separately; the engine only depends on this trait. [`FileWatcher`]
//! is a self-contained implementation that polls a YAML snapshot on disk,
//! used for local wiring and integration testing.

use common::types::{ClusterConfig, NodesList, Service};
use common::Result;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Watch layer contract consumed by both workers.
///
/// Registration spawns background delivery; the subscriber owns the receiving
/// end and decides equality. `services` is a synchronous snapshot.
pub trait Watcher: Send + Sync {
    /// Deliver the node list on every change until `ctx` is cancelled.
    fn nodes(&self, ctx: CancellationToken, subscriber: &str, tx: mpsc::Sender<NodesList>);

    /// Deliver the desired cluster config on every change until `ctx` is
    /// cancelled.
    fn config_map(
        &self,
        ctx: CancellationToken,
        subscriber: &str,
        tx: mpsc::Sender<Arc<ClusterConfig>>,
    );

    /// Snapshot of known services.
    fn services(&self) -> HashMap<String, Service>;
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
struct Snapshot {
    #[serde(default)]
    cluster: ClusterConfig,

    #[serde(default)]
    nodes: NodesList,

    #[serde(default)]
    services: HashMap<String, Service>,
}

/// A [`Watcher`] that polls a YAML file for the cluster snapshot.
pub struct FileWatcher {
    snapshot: Arc<RwLock<Snapshot>>,
}

const POLL_INTERVAL: Duration = Duration::from_secs(1);

impl FileWatcher {
    /// Create the watcher and start polling `path` until `ctx` is cancelled.
    pub fn new(path: impl Into<PathBuf>, ctx: CancellationToken) -> Result<Self> {
        let path = path.into();
        let snapshot = Arc::new(RwLock::new(Snapshot::default()));

        let shared = snapshot.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(POLL_INTERVAL);
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => return,
                    _ = tick.tick() => {}
                }
                let contents = match tokio::fs::read_to_string(&path).await {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "unable to read watch file");
                        continue;
                    }
                };
                match serde_yaml::from_str::<Snapshot>(&contents) {
                    Ok(parsed) => {
                        let mut guard = shared.write().expect("snapshot lock poisoned");
                        if *guard != parsed {
                            debug!(path = %path.display(), "watch file changed");
                            *guard = parsed;
                        }
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "unable to parse watch file")
                    }
                }
            }
        });

        Ok(Self { snapshot })
    }

    fn read(&self) -> Snapshot {
        self.snapshot.read().expect("snapshot lock poisoned").clone()
    }
}

impl Watcher for FileWatcher {
    fn nodes(&self, ctx: CancellationToken, subscriber: &str, tx: mpsc::Sender<NodesList>) {
        let subscriber = subscriber.to_string();
        let snapshot = self.snapshot.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(POLL_INTERVAL);
            let mut last: Option<NodesList> = None;
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => return,
                    _ = tick.tick() => {}
                }
                let nodes = snapshot.read().expect("snapshot lock poisoned").nodes.clone();
                if last.as_ref() == Some(&nodes) {
                    continue;
                }
                last = Some(nodes.clone());
                if tx.send(nodes).await.is_err() {
                    debug!(subscriber = %subscriber, "node subscriber gone");
                    return;
                }
            }
        });
    }

    fn config_map(
        &self,
        ctx: CancellationToken,
        subscriber: &str,
        tx: mpsc::Sender<Arc<ClusterConfig>>,
    ) {
        let subscriber = subscriber.to_string();
        let snapshot = self.snapshot.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(POLL_INTERVAL);
            let mut last: Option<ClusterConfig> = None;
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => return,
                    _ = tick.tick() => {}
                }
                let cluster = snapshot.read().expect("snapshot lock poisoned").cluster.clone();
                if last.as_ref() == Some(&cluster) {
                    continue;
                }
                last = Some(cluster.clone());
                if tx.send(Arc::new(cluster)).await.is_err() {
                    debug!(subscriber = %subscriber, "config subscriber gone");
                    return;
                }
            }
        });
    }

    fn services(&self) -> HashMap<String, Service> {
        self.read().services
    }
}
