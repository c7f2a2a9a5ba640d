//! Ravel binary: runs the director or realserver worker.

use common::Result;
use haproxy::HAProxySetManager;
use iptables::CommandIpTables;
use ravel::{Config, Director, MetricsServer, Mode, RealServer, WorkerMetrics};
use std::sync::Arc;
use system::{CommandIp, CommandIpvs, FileWatcher, GobgpController};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    common::logging::init();

    let config = Config::load().map_err(common::Error::config)?;
    info!(mode = ?config.mode, "ravel starting");

    let ctx = CancellationToken::new();
    let metrics = Arc::new(WorkerMetrics::new());

    if config.metrics.enabled {
        let server = MetricsServer::new(metrics.clone(), config.metrics.listen_addr.clone());
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!(error = %e, "metrics server error");
            }
        });
    }

    let watcher = Arc::new(FileWatcher::new(&config.watch.file, ctx.child_token())?);
    let ip_loopback = Arc::new(CommandIp::new(&config.interfaces.loopback));
    let ip_primary = Arc::new(CommandIp::new(&config.interfaces.primary));
    let ipvs = Arc::new(CommandIpvs::new(&config.ipvs.scheduler, config.ipvs.weight));

    match config.mode {
        Mode::Director => {
            let bgp = Arc::new(GobgpController::new("gobgp"));
            let haproxy = HAProxySetManager::new(
                ctx.child_token(),
                &config.haproxy.binary,
                &config.haproxy.config_dir,
            );
            let director = Director::new(
                ctx.clone(),
                watcher,
                ip_loopback,
                ip_primary,
                ipvs,
                bgp,
                haproxy,
                config.director_timers(),
                metrics,
            );
            director.start().await?;
            wait_for_shutdown().await?;
            ctx.cancel();
            director.stop().await?;
        }
        Mode::Realserver => {
            let iptables = Arc::new(CommandIpTables::new(
                &config.iptables.table,
                &config.iptables.base_chain,
            ));
            let realserver = RealServer::new(
                ctx.clone(),
                &config.node.name,
                watcher,
                ip_primary,
                ip_loopback,
                ipvs,
                iptables,
                config.timers.forced_reconfigure,
                config.realserver_timers(),
                metrics,
            );
            realserver.start().await?;
            wait_for_shutdown().await?;
            ctx.cancel();
            realserver.stop().await?;
        }
    }

    info!("ravel stopped");
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
        _ = term.recv() => info!("received SIGTERM, shutting down"),
    }
    Ok(())
}
