//! A single supervised HAProxy child process.

use common::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Exit/error event from a child, carrying everything the supervisor needs
/// to rebuild the instance.
#[derive(Debug)]
pub(crate) struct InstanceError {
    pub error: Error,
    pub source: String,
    pub dest: Vec<String>,
    pub ports: Vec<u16>,
}

/// One HAProxy process bound to a listen address.
///
/// The process lives as long as the instance's cancellation token; reloads
/// rewrite the config file and signal `SIGHUP`.
pub struct HAProxyInstance {
    binary: String,
    config_dir: PathBuf,
    listen_addr: String,
    service_addrs: Vec<String>,

    ports: Mutex<Vec<u16>>,
    rendered: Mutex<Vec<u8>>,

    pid: AtomicU32,
    reloads: AtomicU64,

    err_tx: mpsc::Sender<InstanceError>,
    dropped_errors: Arc<AtomicU64>,
    ctx: CancellationToken,
}

impl HAProxyInstance {
    /// Render the initial config, write it, and start the child process.
    pub(crate) async fn spawn(
        ctx: CancellationToken,
        binary: &str,
        config_dir: &Path,
        listen_addr: &str,
        service_addrs: Vec<String>,
        ports: Vec<u16>,
        err_tx: mpsc::Sender<InstanceError>,
        dropped_errors: Arc<AtomicU64>,
    ) -> Result<Arc<Self>> {
        let rendered = render(listen_addr, &service_addrs, &ports);

        let instance = Arc::new(Self {
            binary: binary.to_string(),
            config_dir: config_dir.to_path_buf(),
            listen_addr: listen_addr.to_string(),
            service_addrs,
            ports: Mutex::new(ports),
            rendered: Mutex::new(rendered.clone()),
            pid: AtomicU32::new(0),
            reloads: AtomicU64::new(0),
            err_tx,
            dropped_errors,
            ctx,
        });

        instance.write(&rendered).await?;

        let child = Command::new(&instance.binary)
            .arg("-f")
            .arg(instance.filename())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::haproxy(format!(
                    "unable to start {} for {}: {}",
                    instance.binary, instance.listen_addr, e
                ))
            })?;

        if let Some(pid) = child.id() {
            instance.pid.store(pid, Ordering::SeqCst);
        }
        info!(listen_addr = %instance.listen_addr, pid = child.id(), "started haproxy");

        tokio::spawn(instance.clone().run(child));
        Ok(instance)
    }

    /// Supervise the child until it exits or the instance is cancelled.
    async fn run(self: Arc<Self>, mut child: tokio::process::Child) {
        tokio::select! {
            _ = self.ctx.cancelled() => {
                debug!(listen_addr = %self.listen_addr, "instance cancelled, terminating child");
                // kill_on_drop tears the process down with the handle
            }
            status = child.wait() => {
                match status {
                    Ok(s) if s.success() => {
                        info!(listen_addr = %self.listen_addr, "haproxy exited cleanly");
                    }
                    Ok(s) => {
                        self.send_error(Error::haproxy(format!(
                            "haproxy for {} exited with {}",
                            self.listen_addr, s
                        )));
                    }
                    Err(e) => {
                        self.send_error(Error::haproxy(format!(
                            "haproxy for {} wait failed: {}",
                            self.listen_addr, e
                        )));
                    }
                }
            }
        }
    }

    /// Rewrite the config for `ports` and signal the child to reload.
    ///
    /// A no-op when `ports` matches the current set. On reload failure the
    /// previous config bytes are written back so disk and process agree.
    pub(crate) async fn reload(&self, ports: Vec<u16>) -> Result<()> {
        let previous = {
            let current = self.ports.lock().expect("ports lock poisoned");
            if *current == ports {
                return Ok(());
            }
            self.rendered.lock().expect("rendered lock poisoned").clone()
        };

        let next = render(&self.listen_addr, &self.service_addrs, &ports);
        self.write(&next).await?;

        if let Err(e) = self.signal_reload() {
            // unroll so the on-disk config matches the running process
            if let Err(we) = self.write(&previous).await {
                self.send_error(Error::haproxy(format!(
                    "unable to unroll config for {}; disk and process may disagree: {}",
                    self.listen_addr, we
                )));
            }
            return Err(e);
        }

        *self.ports.lock().expect("ports lock poisoned") = ports;
        *self.rendered.lock().expect("rendered lock poisoned") = next;
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn signal_reload(&self) -> Result<()> {
        let pid = self.pid.load(Ordering::SeqCst);
        if pid == 0 {
            return Err(Error::haproxy(format!(
                "no running process for {}",
                self.listen_addr
            )));
        }
        info!(listen_addr = %self.listen_addr, pid, "reloading haproxy");
        let rc = unsafe { libc::kill(pid as i32, libc::SIGHUP) };
        if rc != 0 {
            return Err(Error::haproxy(format!(
                "unable to signal pid {} for {}: {}",
                pid,
                self.listen_addr,
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    async fn write(&self, bytes: &[u8]) -> Result<()> {
        tokio::fs::write(self.filename(), bytes).await?;
        Ok(())
    }

    /// Config path: `<configDir>/<listenAddr>.conf`.
    pub(crate) fn filename(&self) -> PathBuf {
        self.config_dir.join(format!("{}.conf", self.listen_addr))
    }

    pub(crate) fn listen_addr(&self) -> &str {
        &self.listen_addr
    }

    pub(crate) fn service_addrs(&self) -> &[String] {
        &self.service_addrs
    }

    pub(crate) fn ports(&self) -> Vec<u16> {
        self.ports.lock().expect("ports lock poisoned").clone()
    }

    /// Number of successful reloads since the process started.
    pub fn reload_count(&self) -> u64 {
        self.reloads.load(Ordering::SeqCst)
    }

    fn send_error(&self, error: Error) {
        error!(listen_addr = %self.listen_addr, error = %error, "instance error");
        let msg = InstanceError {
            error,
            source: self.listen_addr.clone(),
            dest: self.service_addrs.clone(),
            ports: self.ports(),
        };
        if self.err_tx.try_send(msg).is_err() {
            // bounded channel is saturated; count the drop rather than block
            self.dropped_errors.fetch_add(1, Ordering::SeqCst);
            error!(
                listen_addr = %self.listen_addr,
                "error channel full, dropping instance error"
            );
        }
    }
}

/// Render a config forwarding each listen port to its co-indexed service
/// address. Ports beyond the service address list are dropped with a warning.
pub(crate) fn render(listen_addr: &str, service_addrs: &[String], ports: &[u16]) -> Vec<u8> {
    let mut out = String::from(
        "global\n    maxconn 4096\n\ndefaults\n    mode tcp\n    timeout connect 5s\n    timeout client 60s\n    timeout server 60s\n",
    );

    for (i, port) in ports.iter().enumerate() {
        let Some(dest) = service_addrs.get(i) else {
            warn!(
                index = i,
                service_addrs = service_addrs.len(),
                ?ports,
                "more listen ports than service addresses, dropping port"
            );
            continue;
        };
        out.push_str(&format!(
            "\nfrontend fe_{port}\n    bind [{listen_addr}]:{port}\n    default_backend be_{port}\n\nbackend be_{port}\n    server svc_{port} {dest}\n",
        ));
    }

    out.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_one_block_per_port() {
        let out = render(
            "fd00::1",
            &["192.168.0.10:80".to_string(), "192.168.0.10:443".to_string()],
            &[80, 443],
        );
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("bind [fd00::1]:80"));
        assert!(text.contains("bind [fd00::1]:443"));
        assert!(text.contains("server svc_80 192.168.0.10:80"));
        assert!(text.contains("server svc_443 192.168.0.10:443"));
    }

    #[test]
    fn test_render_drops_excess_ports() {
        let out = render("fd00::1", &["192.168.0.10:80".to_string()], &[80, 8080]);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("bind [fd00::1]:80"));
        assert!(!text.contains("8080"));
    }

    #[test]
    fn test_render_is_deterministic() {
        let addrs = vec!["192.168.0.10:80".to_string()];
        assert_eq!(
            render("fd00::1", &addrs, &[80]),
            render("fd00::1", &addrs, &[80])
        );
    }
}
