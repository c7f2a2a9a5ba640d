//! Latched worker state shared by the director and realserver.

use common::types::{ClusterConfig, Node, NodesList};
use std::sync::Arc;
use std::time::Instant;

/// Mutex-guarded inputs and bookkeeping for one worker.
///
/// The watches task latches inbound snapshots here; the periodic task copies
/// them out under the lock and acts outside it. `new_config` is the one-shot
/// flag consumed by the parity check so a fresh config always forces at
/// least one reconcile attempt.
#[derive(Default)]
pub struct WorkerState {
    pub config: Option<Arc<ClusterConfig>>,
    pub nodes: NodesList,
    pub node: Node,

    pub last_inbound_update: Option<Instant>,
    pub last_reconfigure: Option<Instant>,
    pub new_config: bool,
}

impl WorkerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when nothing has arrived since the last successful reconfigure.
    ///
    /// This is the throttle that keeps the fast tick cheap: when it holds,
    /// the tick returns before any kernel state is read.
    pub fn no_updates_ready(&self) -> bool {
        match (self.last_reconfigure, self.last_inbound_update) {
            (Some(reconfigured), Some(inbound)) => reconfigured > inbound,
            (Some(_), None) => true,
            _ => false,
        }
    }

    pub fn note_config(&mut self, config: Arc<ClusterConfig>) {
        self.config = Some(config);
        self.new_config = true;
        self.last_inbound_update = Some(Instant::now());
    }

    pub fn note_nodes(&mut self, nodes: NodesList) {
        self.nodes = nodes;
        self.last_inbound_update = Some(Instant::now());
    }

    pub fn note_node(&mut self, node: Node) {
        self.node = node;
        self.last_inbound_update = Some(Instant::now());
    }

    /// Consume the one-shot fresh-config flag.
    pub fn consume_config_ready(&mut self) -> bool {
        let ready = self.new_config;
        self.new_config = false;
        ready
    }

    pub fn mark_reconfigured_at(&mut self, when: Instant) {
        self.last_reconfigure = Some(when);
    }

    pub fn mark_reconfigured(&mut self) {
        self.last_reconfigure = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_state_is_not_throttled() {
        let state = WorkerState::new();
        assert!(!state.no_updates_ready());
    }

    #[test]
    fn test_throttle_after_reconfigure() {
        let mut state = WorkerState::new();
        state.note_config(Arc::new(ClusterConfig::default()));
        state.mark_reconfigured();
        assert!(state.no_updates_ready());
    }

    #[test]
    fn test_update_never_throttled_immediately_after_consumption() {
        let mut state = WorkerState::new();
        state.mark_reconfigured();
        assert!(state.no_updates_ready());

        // a config update always re-arms the reconcile path
        state.note_config(Arc::new(ClusterConfig::default()));
        assert!(!state.no_updates_ready());

        state.mark_reconfigured();
        assert!(state.no_updates_ready());

        // as does a node update
        state.note_nodes(vec![]);
        assert!(!state.no_updates_ready());
    }

    #[test]
    fn test_config_ready_is_one_shot() {
        let mut state = WorkerState::new();
        state.note_config(Arc::new(ClusterConfig::default()));
        assert!(state.consume_config_ready());
        assert!(!state.consume_config_ready());
    }
}
