//! System-level capability boundaries for Ravel.
//!
//! Each boundary is a trait the reconciliation engine calls and tests fake:
//!
//! - [`Ip`]: address management on a single network device
//! - [`Ipvs`]: the in-kernel L4 load balancer
//! - [`BgpController`]: VIP route announcement
//! - [`Watcher`]: the Kubernetes watch layer delivering desired state
//!
//! Production implementations shell out to the standard tooling (`ip`,
//! `sysctl`, `ipvsadm`, `gobgp`); they hold no state beyond their device or
//! binary names and are safe to share across tasks.

pub mod bgp;
pub mod cmd;
pub mod ip;
pub mod ipvs;
pub mod watcher;

pub use bgp::{BgpController, GobgpController};
pub use ip::{compare, CommandIp, Ip};
pub use ipvs::{generate_rules, CommandIpvs, Ipvs};
pub use watcher::{FileWatcher, Watcher};
