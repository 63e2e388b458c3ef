//! At-least-once delivery: pending-ACK table, resend sweep and give-up.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;

use crate::protocol::MessageKind;

/// Default seconds without an ACK before a resend.
pub const DEFAULT_RESEND_AFTER: f64 = 2.0;
/// Default resends before giving up.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// How many finished keys (confirmed ACKs, ended games, completed files) are remembered.
pub(crate) const KEY_HISTORY: usize = 1024;

/// Key set that forgets its oldest entries once it holds more than `cap`.
#[derive(Debug, Clone)]
pub(crate) struct RecentKeys {
    keys: HashSet<String>,
    order: VecDeque<String>,
    cap: usize,
}

impl RecentKeys {
    pub(crate) fn with_cap(cap: usize) -> Self {
        Self {
            keys: HashSet::new(),
            order: VecDeque::new(),
            cap,
        }
    }

    pub(crate) fn insert(&mut self, key: &str) {
        if !self.keys.insert(key.to_string()) {
            return;
        }
        self.order.push_back(key.to_string());
        while self.order.len() > self.cap {
            if let Some(old) = self.order.pop_front() {
                self.keys.remove(&old);
            }
        }
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    pub(crate) fn remove(&mut self, key: &str) {
        if self.keys.remove(key) {
            self.order.retain(|k| k != key);
        }
    }
}

impl Default for RecentKeys {
    fn default() -> Self {
        Self::with_cap(KEY_HISTORY)
    }
}

/// One unacknowledged datagram. `bytes` is resent verbatim.
#[derive(Debug, Clone)]
pub struct PendingAck {
    pub kind: MessageKind,
    pub bytes: Vec<u8>,
    pub destination: SocketAddr,
    pub retries: u32,
    pub last_sent: f64,
}

/// Result of one sweep.
#[derive(Debug, Default)]
pub struct Sweep {
    pub resend: Vec<PendingAck>,
    /// Keys given up on after the retry ceiling.
    pub exhausted: Vec<(String, PendingAck)>,
}

#[derive(Debug)]
pub struct PendingAcks {
    pending: HashMap<String, PendingAck>,
    confirmed: RecentKeys,
    resend_after: f64,
    max_retries: u32,
}

impl PendingAcks {
    pub fn new(resend_after: f64, max_retries: u32) -> Self {
        Self {
            pending: HashMap::new(),
            confirmed: RecentKeys::default(),
            resend_after,
            max_retries,
        }
    }

    /// Register a sent datagram. Returns false when the key is already pending or was already confirmed.
    pub fn track(
        &mut self,
        key: String,
        kind: MessageKind,
        bytes: Vec<u8>,
        destination: SocketAddr,
        now: f64,
    ) -> bool {
        if self.confirmed.contains(&key) || self.pending.contains_key(&key) {
            return false;
        }
        self.pending.insert(
            key,
            PendingAck {
                kind,
                bytes,
                destination,
                retries: 0,
                last_sent: now,
            },
        );
        true
    }

    /// Handle an ACK. Returns true if it cleared a pending entry.
    pub fn confirm(&mut self, key: &str) -> bool {
        let Some(_) = self.pending.remove(key) else {
            return false;
        };
        self.confirmed.insert(key);
        true
    }

    /// Resend everything older than the threshold; drop entries past the retry ceiling.
    pub fn sweep(&mut self, now: f64) -> Sweep {
        let mut out = Sweep::default();
        let due: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| now - p.last_sent >= self.resend_after)
            .map(|(k, _)| k.clone())
            .collect();
        for key in due {
            let Some(entry) = self.pending.get_mut(&key) else {
                continue;
            };
            if entry.retries < self.max_retries {
                entry.retries += 1;
                entry.last_sent = now;
                out.resend.push(entry.clone());
            } else if let Some(entry) = self.pending.remove(&key) {
                tracing::warn!(
                    key = %key,
                    kind = %entry.kind,
                    to = %entry.destination,
                    "delivery failed after {} retries",
                    entry.retries
                );
                out.exhausted.push((key, entry));
            }
        }
        out
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.pending.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&PendingAck> {
        self.pending.get(key)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Default for PendingAcks {
    fn default() -> Self {
        Self::new(DEFAULT_RESEND_AFTER, DEFAULT_MAX_RETRIES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dest() -> SocketAddr {
        "10.0.0.2:50999".parse().unwrap()
    }

    #[test]
    fn recent_keys_forget_oldest() {
        let mut keys = RecentKeys::with_cap(2);
        for k in ["a", "b", "c"] {
            keys.insert(k);
        }
        assert!(!keys.contains("a"));
        assert!(keys.contains("b"));
        assert!(keys.contains("c"));
        keys.remove("b");
        keys.insert("d");
        assert!(keys.contains("c") && keys.contains("d"));
    }

    #[test]
    fn retried_three_times_then_dropped() {
        let mut acks = PendingAcks::default();
        assert!(acks.track("m1".into(), MessageKind::Dm, b"x".to_vec(), dest(), 0.0));

        assert!(acks.sweep(1.0).resend.is_empty());
        let mut resends = 0;
        let mut t = 0.0;
        loop {
            t += 2.0;
            let sweep = acks.sweep(t);
            resends += sweep.resend.len();
            if !sweep.exhausted.is_empty() {
                assert_eq!(sweep.exhausted[0].0, "m1");
                break;
            }
            assert!(t < 20.0, "never gave up");
        }
        assert_eq!(resends, 3);
        assert_eq!(t, 8.0);
        assert!(acks.is_empty());
        assert!(acks.sweep(100.0).resend.is_empty());
    }

    #[test]
    fn resend_is_byte_identical() {
        let mut acks = PendingAcks::default();
        acks.track("m1".into(), MessageKind::Dm, b"payload".to_vec(), dest(), 0.0);
        let sweep = acks.sweep(2.0);
        assert_eq!(sweep.resend[0].bytes, b"payload");
        assert_eq!(sweep.resend[0].destination, dest());
    }

    #[test]
    fn ack_clears_and_is_not_reregistered() {
        let mut acks = PendingAcks::default();
        acks.track("m1".into(), MessageKind::Dm, vec![], dest(), 0.0);
        assert!(acks.confirm("m1"));
        assert!(!acks.is_pending("m1"));
        assert!(!acks.confirm("m1"));
        assert!(!acks.track("m1".into(), MessageKind::Dm, vec![], dest(), 1.0));
        assert!(acks.is_empty());
    }

    #[test]
    fn unknown_ack_is_ignored() {
        let mut acks = PendingAcks::default();
        assert!(!acks.confirm("nope"));
    }

    #[test]
    fn duplicate_track_keeps_original_entry() {
        let mut acks = PendingAcks::default();
        acks.track("m1".into(), MessageKind::Dm, b"a".to_vec(), dest(), 0.0);
        assert!(!acks.track("m1".into(), MessageKind::Dm, b"b".to_vec(), dest(), 1.0));
        assert_eq!(acks.get("m1").unwrap().bytes, b"a");
    }
}
