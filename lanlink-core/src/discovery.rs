//! Discovery: PING/PROFILE receipt, liveness refresh and re-announce for new joiners.

use crate::core::{DispatchError, Event, Node, OutboundAction};
use crate::protocol::Message;
use crate::router::Inbound;

pub(crate) fn handle_ping(
    node: &mut Node,
    inbound: Inbound,
    out: &mut Vec<OutboundAction>,
) -> Result<(), DispatchError> {
    let Message::Ping { from } = inbound.message else {
        return Ok(());
    };
    if node.peers.touch(&from, inbound.now) {
        return Ok(());
    }
    // Unknown pinger: answer with our PROFILE so it learns about us, rate-limited.
    let gap = node.config.timings.reannounce_secs as f64;
    let due = node
        .last_reannounce
        .map_or(true, |last| inbound.now - last >= gap);
    if due {
        tracing::debug!(peer = %from, "ping from unknown peer, re-announcing profile");
        node.push_profile(out, inbound.now)?;
    }
    Ok(())
}

pub(crate) fn handle_profile(
    node: &mut Node,
    inbound: Inbound,
    out: &mut Vec<OutboundAction>,
) -> Result<(), DispatchError> {
    let Message::Profile {
        from,
        display_name,
        status,
        avatar,
    } = inbound.message
    else {
        return Ok(());
    };
    let new = node.peers.upsert(
        &from,
        inbound.source.ip(),
        &display_name,
        &status,
        avatar,
        inbound.now,
    );
    if new {
        tracing::info!(peer = %from, name = %display_name, "peer discovered");
        out.push(OutboundAction::Notify(Event::PeerDiscovered {
            id: from,
            display_name,
        }));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::core::tests::{deliver_to, events, introduce, node, sends, source, T0};
    use crate::core::Event;
    use crate::protocol::{Message, MessageKind};

    #[test]
    fn profile_registers_peer_once() {
        let mut a = node("alice", "10.0.0.1");
        let mut b = node("bob", "10.0.0.2");
        let announce = b.announce(T0).unwrap();
        let out = deliver_to(&mut a, source(&b), &announce, T0);
        assert_eq!(
            events(&out),
            vec![Event::PeerDiscovered {
                id: b.id().clone(),
                display_name: "bob".into()
            }]
        );
        assert_eq!(a.peers().get(b.id()).unwrap().address, source(&b).ip());

        let again = deliver_to(&mut a, source(&b), &announce, T0 + 1.0);
        assert!(events(&again).is_empty());
        assert_eq!(a.peers().get(b.id()).unwrap().last_seen, T0 + 1.0);
    }

    #[test]
    fn ping_refreshes_known_peer() {
        let mut a = node("alice", "10.0.0.1");
        let mut b = node("bob", "10.0.0.2");
        introduce(&mut a, &mut b, T0);
        let ping = Message::Ping { from: b.id().clone() }.encode().unwrap();
        let out = a.handle_datagram(&ping, source(&b), T0 + 30.0).unwrap();
        assert!(out.is_empty());
        assert_eq!(a.peers().get(b.id()).unwrap().last_seen, T0 + 30.0);
    }

    #[test]
    fn unknown_pinger_gets_rate_limited_profile() {
        let mut a = node("alice", "10.0.0.1");
        let b = node("bob", "10.0.0.2");
        let ping = Message::Ping { from: b.id().clone() }.encode().unwrap();

        let first = a.handle_datagram(&ping, source(&b), T0).unwrap();
        assert_eq!(sends(&first)[0].kind(), MessageKind::Profile);
        assert!(!a.peers().contains(b.id()));

        let soon = a.handle_datagram(&ping, source(&b), T0 + 1.0).unwrap();
        assert!(soon.is_empty());
        let later = a.handle_datagram(&ping, source(&b), T0 + 3.0).unwrap();
        assert_eq!(sends(&later).len(), 1);
    }
}
