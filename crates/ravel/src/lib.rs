//! Ravel - Kubernetes-aware L4 load balancer control plane
//!
//! Ravel programs Linux IPVS virtual servers, manages VIP addresses on host
//! interfaces, and front-ends IPv6 traffic through per-VIP HAProxy
//! instances. It runs as one of two workers:
//!
//! - **Director**: owns the VIPs as routed state, announces them via BGP,
//!   and programs IPVS so the host balances across the backend node IPs.
//! - **Realserver**: runs on every backend node, binds the VIPs on the
//!   loopback device, and installs the iptables rules DSR traffic requires.
//!
//! Both workers share the same reconciliation shape: inbound watch channels
//! latch desired state under a mutex, periodic tickers compare observed
//! kernel state against it (the *parity check*), and a forced re-sync timer
//! bounds drift when parity lies.

pub mod config;
pub mod director;
pub mod http_server;
pub mod metrics;
pub mod realserver;
pub mod worker;

pub use config::{Config, ConfigError, Mode};
pub use director::{Director, DirectorTimers};
pub use http_server::MetricsServer;
pub use metrics::WorkerMetrics;
pub use realserver::{RealServer, RealServerTimers};
