//! Address management on a single network device.

use crate::cmd;
use async_trait::async_trait;
use common::{Error, Result};
use std::collections::HashSet;
use tracing::{debug, info};

/// Address management boundary for one device.
///
/// The director holds two of these (loopback and primary interface); the
/// realserver holds the same pair. Addresses are plain strings without a
/// CIDR suffix, as the workers compare them against VIP keys from the
/// cluster config.
#[async_trait]
pub trait Ip: Send + Sync {
    /// The device this instance manages, e.g. `lo` or `eth0`.
    fn device(&self) -> &str;

    /// Managed IPv4 addresses currently bound to the device.
    async fn get(&self) -> Result<Vec<String>>;

    /// Managed IPv6 addresses currently bound to the device.
    async fn get6(&self) -> Result<Vec<String>>;

    async fn add(&self, addr: &str) -> Result<()>;
    async fn add6(&self, addr: &str) -> Result<()>;
    async fn del(&self, addr: &str) -> Result<()>;
    async fn del6(&self, addr: &str) -> Result<()>;

    /// Remove every managed address from the device.
    async fn teardown(&self) -> Result<()>;

    /// Suppress ARP for addresses on this device (required for DSR).
    async fn set_arp(&self) -> Result<()>;

    /// Relax reverse-path filtering on this device.
    async fn set_rp_filter(&self) -> Result<()>;

    /// Diff configured addresses against desired ones.
    fn compare(&self, configured: &[String], desired: &[String]) -> (Vec<String>, Vec<String>) {
        compare(configured, desired)
    }
}

/// Compute `(removals, additions)` taking `configured` to `desired`.
pub fn compare(configured: &[String], desired: &[String]) -> (Vec<String>, Vec<String>) {
    let have: HashSet<&str> = configured.iter().map(String::as_str).collect();
    let want: HashSet<&str> = desired.iter().map(String::as_str).collect();

    let mut removals: Vec<String> = have
        .difference(&want)
        .map(|a| a.to_string())
        .collect();
    let mut additions: Vec<String> = want
        .difference(&have)
        .map(|a| a.to_string())
        .collect();
    removals.sort();
    additions.sort();
    (removals, additions)
}

/// Production [`Ip`] implementation backed by `ip` and `sysctl`.
pub struct CommandIp {
    device: String,
}

impl CommandIp {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
        }
    }

    async fn addrs(&self, family: &str) -> Result<Vec<String>> {
        let out = cmd::run("ip", &["-o", "addr", "show", "dev", &self.device]).await?;
        Ok(parse_addr_lines(&out, family))
    }
}

/// Extract CIDR-less addresses of the given family (`inet` or `inet6`) from
/// `ip -o addr show` output, skipping host-local addresses the workers never
/// manage.
pub fn parse_addr_lines(output: &str, family: &str) -> Vec<String> {
    let mut addrs = Vec::new();
    for line in output.lines() {
        let mut fields = line.split_whitespace();
        while let Some(field) = fields.next() {
            if field == family {
                if let Some(addr) = fields.next() {
                    let bare = addr.split('/').next().unwrap_or(addr);
                    if bare == "127.0.0.1" || bare == "::1" || bare.starts_with("fe80") {
                        break;
                    }
                    addrs.push(bare.to_string());
                }
                break;
            }
        }
    }
    addrs
}

#[async_trait]
impl Ip for CommandIp {
    fn device(&self) -> &str {
        &self.device
    }

    async fn get(&self) -> Result<Vec<String>> {
        self.addrs("inet").await
    }

    async fn get6(&self) -> Result<Vec<String>> {
        self.addrs("inet6").await
    }

    async fn add(&self, addr: &str) -> Result<()> {
        let cidr = format!("{}/32", addr);
        cmd::run("ip", &["addr", "add", &cidr, "dev", &self.device])
            .await
            .map_err(Error::ip)?;
        Ok(())
    }

    async fn add6(&self, addr: &str) -> Result<()> {
        let cidr = format!("{}/128", addr);
        cmd::run("ip", &["-6", "addr", "add", &cidr, "dev", &self.device])
            .await
            .map_err(Error::ip)?;
        Ok(())
    }

    async fn del(&self, addr: &str) -> Result<()> {
        let cidr = format!("{}/32", addr);
        cmd::run("ip", &["addr", "del", &cidr, "dev", &self.device])
            .await
            .map_err(Error::ip)?;
        Ok(())
    }

    async fn del6(&self, addr: &str) -> Result<()> {
        let cidr = format!("{}/128", addr);
        cmd::run("ip", &["-6", "addr", "del", &cidr, "dev", &self.device])
            .await
            .map_err(Error::ip)?;
        Ok(())
    }

    async fn teardown(&self) -> Result<()> {
        for addr in self.get().await? {
            info!(device = %self.device, addr = %addr, "removing address");
            self.del(&addr).await?;
        }
        for addr in self.get6().await? {
            info!(device = %self.device, addr = %addr, "removing address");
            self.del6(&addr).await?;
        }
        Ok(())
    }

    async fn set_arp(&self) -> Result<()> {
        let ignore = format!("net.ipv4.conf.{}.arp_ignore=1", self.device);
        let announce = format!("net.ipv4.conf.{}.arp_announce=2", self.device);
        debug!(device = %self.device, "setting arp sysctls");
        cmd::run("sysctl", &["-w", &ignore]).await.map_err(Error::ip)?;
        cmd::run("sysctl", &["-w", &announce])
            .await
            .map_err(Error::ip)?;
        Ok(())
    }

    async fn set_rp_filter(&self) -> Result<()> {
        let rp = format!("net.ipv4.conf.{}.rp_filter=0", self.device);
        debug!(device = %self.device, "setting rp_filter sysctl");
        cmd::run("sysctl", &["-w", &rp]).await.map_err(Error::ip)?;
        Ok(())
    }
}
