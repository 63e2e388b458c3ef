//! Peer directory: id -> address, profile and liveness.

use std::collections::HashMap;
use std::net::IpAddr;

use crate::identity::PeerId;
use crate::protocol::Avatar;

#[derive(Debug, Clone)]
pub struct Peer {
    pub id: PeerId,
    pub address: IpAddr,
    pub display_name: String,
    pub status: String,
    /// Epoch seconds; never moves backwards for a given id.
    pub last_seen: f64,
    pub avatar: Option<Avatar>,
}

#[derive(Debug, Default)]
pub struct PeerDirectory {
    peers: HashMap<PeerId, Peer>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite on PROFILE. Returns true if the peer was not known before.
    pub fn upsert(
        &mut self,
        id: &PeerId,
        address: IpAddr,
        display_name: &str,
        status: &str,
        avatar: Option<Avatar>,
        now: f64,
    ) -> bool {
        let previous = self.peers.get(id).map(|p| p.last_seen);
        self.peers.insert(
            id.clone(),
            Peer {
                id: id.clone(),
                address,
                display_name: display_name.to_string(),
                status: status.to_string(),
                last_seen: previous.map_or(now, |seen| seen.max(now)),
                avatar,
            },
        );
        previous.is_none()
    }

    /// Refresh liveness on PING. Unknown ids are left alone; returns whether the peer is known.
    pub fn touch(&mut self, id: &PeerId, now: f64) -> bool {
        match self.peers.get_mut(id) {
            Some(p) => {
                p.last_seen = p.last_seen.max(now);
                true
            }
            None => false,
        }
    }

    /// Remove every peer not seen for more than `ttl` seconds.
    pub fn evict_stale(&mut self, now: f64, ttl: f64) -> Vec<Peer> {
        let stale: Vec<PeerId> = self
            .peers
            .values()
            .filter(|p| now - p.last_seen > ttl)
            .map(|p| p.id.clone())
            .collect();
        let mut evicted = Vec::with_capacity(stale.len());
        for id in stale {
            if let Some(p) = self.peers.remove(&id) {
                tracing::info!(peer = %p.id, idle_secs = now - p.last_seen, "peer evicted");
                evicted.push(p);
            }
        }
        evicted
    }

    pub fn get(&self, id: &PeerId) -> Option<&Peer> {
        self.peers.get(id)
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }

    pub fn display_name<'a>(&'a self, id: &'a PeerId) -> &'a str {
        self.peers
            .get(id)
            .map(|p| p.display_name.as_str())
            .unwrap_or_else(|| id.username())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bob() -> PeerId {
        PeerId::from("bob@10.0.0.2")
    }

    fn addr() -> IpAddr {
        "10.0.0.2".parse().unwrap()
    }

    #[test]
    fn upsert_reports_new_and_overwrites() {
        let mut dir = PeerDirectory::new();
        assert!(dir.upsert(&bob(), addr(), "Bob", "hi", None, 10.0));
        assert!(!dir.upsert(&bob(), addr(), "Robert", "busy", None, 12.0));
        let p = dir.get(&bob()).unwrap();
        assert_eq!(p.display_name, "Robert");
        assert_eq!(p.status, "busy");
        assert_eq!(p.last_seen, 12.0);
    }

    #[test]
    fn last_seen_never_decreases() {
        let mut dir = PeerDirectory::new();
        dir.upsert(&bob(), addr(), "Bob", "", None, 20.0);
        dir.upsert(&bob(), addr(), "Bob", "", None, 15.0);
        dir.touch(&bob(), 18.0);
        assert_eq!(dir.get(&bob()).unwrap().last_seen, 20.0);
    }

    #[test]
    fn touch_ignores_unknown() {
        let mut dir = PeerDirectory::new();
        assert!(!dir.touch(&bob(), 5.0));
        assert!(dir.is_empty());
    }

    #[test]
    fn stale_peers_evicted_fresh_kept() {
        let mut dir = PeerDirectory::new();
        let carol = PeerId::from("carol@10.0.0.3");
        dir.upsert(&bob(), addr(), "Bob", "", None, 0.0);
        dir.upsert(&carol, "10.0.0.3".parse().unwrap(), "Carol", "", None, 0.0);
        dir.touch(&carol, 50.0);
        let evicted = dir.evict_stale(61.0, 60.0);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id, bob());
        assert!(dir.contains(&carol));
    }

    #[test]
    fn display_name_falls_back_to_username() {
        let dir = PeerDirectory::new();
        let id = bob();
        assert_eq!(dir.display_name(&id), "bob");
    }
}
