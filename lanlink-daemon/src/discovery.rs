//! Long-lived loops: announce beacon, receive and dispatch, ACK resend sweep, liveness cleanup.

use std::time::Duration;

use lanlink_core::{unix_now, DispatchError};
use tokio::task::JoinHandle;

use crate::net::Context;

/// Spawn the four background loops. Each exits when shutdown is signalled.
pub fn spawn_all(
    ctx: &Context,
    announce_every: Duration,
    sweep_every: Duration,
    cleanup_every: Duration,
) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(announce_loop(ctx.clone(), announce_every)),
        tokio::spawn(recv_loop(ctx.clone())),
        tokio::spawn(ack_sweep_loop(ctx.clone(), sweep_every)),
        tokio::spawn(cleanup_loop(ctx.clone(), cleanup_every)),
    ]
}

/// Sleep for `period` unless shutdown arrives first. Returns false on shutdown.
async fn tick(ctx: &mut Context, period: Duration) -> bool {
    if ctx.is_shutting_down() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(period) => true,
        _ = ctx.shutdown.changed() => false,
    }
}

async fn announce_loop(mut ctx: Context, period: Duration) {
    loop {
        let actions = ctx.node.lock().await.announce(unix_now());
        match actions {
            Ok(actions) => ctx.perform(actions).await,
            Err(e) => tracing::error!(error = %e, "cannot encode announce"),
        }
        if !tick(&mut ctx, period).await {
            break;
        }
    }
    tracing::debug!("announce loop stopped");
}

async fn recv_loop(mut ctx: Context) {
    let mut buf = vec![0u8; 65536];
    loop {
        let received = tokio::select! {
            r = ctx.socket.recv_from(&mut buf) => r,
            _ = ctx.shutdown.changed() => break,
        };
        let (n, from) = match received {
            Ok(r) => r,
            Err(e) => {
                // ICMP port-unreachable and friends surface here on some platforms.
                tracing::debug!(error = %e, "recv error");
                continue;
            }
        };
        let result = ctx
            .node
            .lock()
            .await
            .handle_datagram(&buf[..n], from, unix_now());
        match result {
            Ok(actions) => ctx.perform(actions).await,
            Err(DispatchError::Loopback) => {}
            Err(e @ DispatchError::Spoofed { .. }) => tracing::debug!(%from, error = %e, "dropped"),
            Err(e @ DispatchError::Unauthorized { .. }) => {
                tracing::debug!(%from, error = %e, "rejected")
            }
            Err(e) => tracing::warn!(%from, error = %e, "bad datagram"),
        }
    }
    tracing::debug!("recv loop stopped");
}

async fn ack_sweep_loop(mut ctx: Context, period: Duration) {
    while tick(&mut ctx, period).await {
        let actions = ctx.node.lock().await.sweep_acks(unix_now());
        ctx.perform(actions).await;
    }
    tracing::debug!("ack sweep loop stopped");
}

async fn cleanup_loop(mut ctx: Context, period: Duration) {
    while tick(&mut ctx, period).await {
        let actions = ctx.node.lock().await.cleanup(unix_now());
        ctx.perform(actions).await;
    }
    tracing::debug!("cleanup loop stopped");
}
