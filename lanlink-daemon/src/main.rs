// LanLink daemon: UDP socket, background loops and the interactive prompt around the core node.

mod commands;
mod config;
mod discovery;
mod net;
mod transfer;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use lanlink_core::chunk::mime_type_for;
use lanlink_core::{Avatar, LocalProfile, Node, NodeConfig};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let mut cfg = config::load();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("lanlink-daemon {VERSION}");
                return Ok(());
            }
            "--user" | "-u" => cfg.username = args.next().context("--user needs a value")?,
            "--name" | "-n" => cfg.display_name = Some(args.next().context("--name needs a value")?),
            "--verbose" | "-v" => cfg.verbose = true,
            other => anyhow::bail!("unknown argument '{other}'"),
        }
    }

    let default_level = if cfg.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    let ip = net::local_ipv4();
    let broadcast_ip = net::broadcast_address(ip, cfg.subnet_mask);
    let mut profile = LocalProfile::new(&cfg.username, IpAddr::V4(ip), cfg.display_name());
    profile.status = cfg.status.clone();
    if let Some(path) = &cfg.avatar_path {
        match std::fs::read(path) {
            Ok(bytes) => {
                let name = path.to_string_lossy();
                profile.avatar = Some(Avatar::from_bytes(mime_type_for(&name), &bytes));
            }
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "cannot read avatar"),
        }
    }
    let timings = cfg.protocol.clone();
    let node = Node::new(
        profile,
        NodeConfig {
            port: cfg.port,
            broadcast_ip,
            timings: timings.clone(),
        },
    );
    tracing::info!(id = %node.id(), broadcast = %broadcast_ip, port = cfg.port, "starting");

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(async {
        let socket = net::bind_socket(cfg.port)
            .with_context(|| format!("cannot bind UDP port {}", cfg.port))?;
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let ctx = net::Context {
            node: Arc::new(tokio::sync::Mutex::new(node)),
            socket: Arc::new(socket),
            loss: net::LossInjector::new(cfg.loss_rate),
            download_dir: cfg.download_dir.clone(),
            shutdown: shutdown_rx.clone(),
        };
        let handles = discovery::spawn_all(
            &ctx,
            Duration::from_secs(timings.broadcast_interval_secs.max(1)),
            Duration::from_secs(timings.ack_sweep_secs.max(1)),
            Duration::from_secs(timings.cleanup_interval_secs().max(1)),
        );
        let prompt = tokio::spawn(commands::run_reader(ctx.clone(), shutdown_tx.clone()));

        let mut quit = shutdown_rx;
        tokio::select! {
            r = shutdown_signal() => r?,
            _ = quit.wait_for(|stop| *stop) => {}
        }
        tracing::info!("shutting down");
        let _ = shutdown_tx.send(true);
        for h in handles {
            let _ = h.await;
        }
        prompt.abort();
        Ok::<(), anyhow::Error>(())
    });
    // A pending stdin read holds a blocking thread that never finishes on its own.
    rt.shutdown_timeout(Duration::from_millis(500));
    result
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
