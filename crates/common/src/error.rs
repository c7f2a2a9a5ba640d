//! Common error types for Ravel components.

use std::fmt;

/// A specialized Result type for Ravel operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Ravel operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IP error: {0}")]
    Ip(String),

    #[error("IPVS error: {0}")]
    Ipvs(String),

    #[error("iptables error: {0}")]
    IpTables(String),

    #[error("BGP error: {0}")]
    Bgp(String),

    #[error("HAProxy error: {0}")]
    HAProxy(String),

    #[error("Watcher error: {0}")]
    Watcher(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown error: {0}")]
    Other(String),
}

impl Error {
    /// Create a new IP error.
    pub fn ip(msg: impl fmt::Display) -> Self {
        Error::Ip(msg.to_string())
    }

    /// Create a new IPVS error.
    pub fn ipvs(msg: impl fmt::Display) -> Self {
        Error::Ipvs(msg.to_string())
    }

    /// Create a new iptables error.
    pub fn iptables(msg: impl fmt::Display) -> Self {
        Error::IpTables(msg.to_string())
    }

    /// Create a new BGP error.
    pub fn bgp(msg: impl fmt::Display) -> Self {
        Error::Bgp(msg.to_string())
    }

    /// Create a new HAProxy error.
    pub fn haproxy(msg: impl fmt::Display) -> Self {
        Error::HAProxy(msg.to_string())
    }

    /// Create a new watcher error.
    pub fn watcher(msg: impl fmt::Display) -> Self {
        Error::Watcher(msg.to_string())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl fmt::Display) -> Self {
        Error::Config(msg.to_string())
    }

    /// Create a new other error.
    pub fn other(msg: impl fmt::Display) -> Self {
        Error::Other(msg.to_string())
    }

    /// Join a list of failure messages into a single aggregate error.
    ///
    /// Returns `Ok(())` when the list is empty, so cleanup paths can collect
    /// failures as they go and surface everything at once.
    pub fn join(errs: Vec<String>) -> Result<()> {
        if errs.is_empty() {
            return Ok(());
        }
        Err(Error::Other(errs.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_empty_is_ok() {
        assert!(Error::join(vec![]).is_ok());
    }

    #[test]
    fn test_join_aggregates_messages() {
        let err = Error::join(vec!["first failure".into(), "second failure".into()]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("first failure"));
        assert!(msg.contains("second failure"));
    }
}
