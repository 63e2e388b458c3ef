//! Socket setup, addressing and the shared send path.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use lanlink_core::{MessageKind, Node, OutboundAction};
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};

/// Debug packet-loss injector. Only game and file datagrams are ever dropped.
#[derive(Debug, Clone, Copy)]
pub struct LossInjector {
    rate: f64,
}

impl LossInjector {
    pub fn new(rate: f64) -> Self {
        Self {
            rate: rate.clamp(0.0, 1.0),
        }
    }

    pub fn should_drop(&self, kind: MessageKind) -> bool {
        self.rate > 0.0 && kind.is_lossy() && rand::thread_rng().gen_bool(self.rate)
    }
}

/// Directed broadcast address: host bits of `ip` set per `mask`.
pub fn broadcast_address(ip: Ipv4Addr, mask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip) | !u32::from(mask))
}

/// Address of the interface that routes off-host. Connecting a UDP socket sends nothing.
pub fn local_ipv4() -> Ipv4Addr {
    let probe = || -> std::io::Result<IpAddr> {
        let s = std::net::UdpSocket::bind(("0.0.0.0", 0))?;
        s.connect(("8.8.8.8", 80))?;
        Ok(s.local_addr()?.ip())
    };
    match probe() {
        Ok(IpAddr::V4(ip)) if !ip.is_unspecified() => ip,
        _ => {
            tracing::warn!("no routable interface found, using loopback");
            Ipv4Addr::LOCALHOST
        }
    }
}

pub fn bind_socket(port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind(("0.0.0.0", port))?;
    std_sock.set_broadcast(true)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

/// Everything a task needs: the node behind its lock, the socket, and shutdown.
#[derive(Clone)]
pub struct Context {
    pub node: Arc<Mutex<Node>>,
    pub socket: Arc<UdpSocket>,
    pub loss: LossInjector,
    pub download_dir: PathBuf,
    pub shutdown: watch::Receiver<bool>,
}

impl Context {
    /// Send one datagram unless the loss injector eats it. Errors are logged, never fatal.
    pub async fn send(&self, to: SocketAddr, kind: MessageKind, bytes: &[u8]) {
        if self.loss.should_drop(kind) {
            tracing::debug!(%kind, %to, "simulated packet loss");
            return;
        }
        if let Err(e) = self.socket.send_to(bytes, to).await {
            tracing::warn!(%kind, %to, error = %e, "send failed");
        }
    }

    /// Perform actions returned by the node. Call with the lock released.
    pub async fn perform(&self, actions: Vec<OutboundAction>) {
        for action in actions {
            match action {
                OutboundAction::Send { to, kind, bytes } => self.send(to, kind, &bytes).await,
                OutboundAction::StartFileSend(job) => {
                    tokio::spawn(crate::transfer::stream_file(self.clone(), job));
                }
                OutboundAction::Notify(event) => crate::commands::show_event(self, event).await,
            }
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_from_mask() {
        let ip = Ipv4Addr::new(192, 168, 1, 37);
        assert_eq!(
            broadcast_address(ip, Ipv4Addr::new(255, 255, 255, 0)),
            Ipv4Addr::new(192, 168, 1, 255)
        );
        assert_eq!(
            broadcast_address(ip, Ipv4Addr::new(255, 255, 0, 0)),
            Ipv4Addr::new(192, 168, 255, 255)
        );
    }

    #[test]
    fn loss_only_hits_lossy_kinds() {
        let always = LossInjector::new(1.0);
        assert!(always.should_drop(MessageKind::FileChunk));
        assert!(always.should_drop(MessageKind::TictactoeMove));
        assert!(!always.should_drop(MessageKind::Dm));
        assert!(!always.should_drop(MessageKind::Ack));
        let never = LossInjector::new(0.0);
        assert!(!never.should_drop(MessageKind::FileChunk));
    }
}
