//! VIP route announcement via BGP.

use crate::cmd;
use async_trait::async_trait;
use common::{Error, Result};
use tracing::info;

/// BGP announcement boundary.
///
/// `set` is additive: it announces the given addresses and never withdraws
/// previously announced ones. Withdrawal happens out of band when the
/// director host stops advertising entirely.
#[async_trait]
pub trait BgpController: Send + Sync {
    async fn set(&self, addrs: &[String]) -> Result<()>;
}

/// Production [`BgpController`] backed by the `gobgp` CLI.
pub struct GobgpController {
    binary: String,
}

impl GobgpController {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl BgpController for GobgpController {
    async fn set(&self, addrs: &[String]) -> Result<()> {
        for addr in addrs {
            info!(addr = %addr, "announcing route");
            if addr.contains(':') {
                let prefix = format!("{}/128", addr);
                cmd::run(&self.binary, &["global", "rib", "add", "-a", "ipv6", &prefix])
                    .await
                    .map_err(Error::bgp)?;
            } else {
                let prefix = format!("{}/32", addr);
                cmd::run(&self.binary, &["global", "rib", "add", &prefix])
                    .await
                    .map_err(Error::bgp)?;
            }
        }
        Ok(())
    }
}
