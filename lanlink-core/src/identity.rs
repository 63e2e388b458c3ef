//! Peer identity: `username@ip-address`, carried in `FROM` or `USER_ID` on the wire.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Peer ID. The address component is what spoof checks compare against the UDP source.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(username: &str, ip: IpAddr) -> Self {
        PeerId(format!("{username}@{ip}"))
    }

    /// Wrap a raw id as received; no validation.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        PeerId(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn username(&self) -> &str {
        self.0.split_once('@').map(|(u, _)| u).unwrap_or(&self.0)
    }

    /// Embedded address, if the id is well formed.
    pub fn ip(&self) -> Option<IpAddr> {
        let (_, host) = self.0.rsplit_once('@')?;
        host.parse().ok()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_string())
    }
}

/// Parse a comma-separated id list, skipping empty entries.
pub fn parse_id_list(csv: &str) -> Vec<PeerId> {
    csv.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PeerId::from)
        .collect()
}

/// Join ids into the comma-separated wire form.
pub fn join_id_list<'a>(ids: impl IntoIterator<Item = &'a PeerId>) -> String {
    ids.into_iter()
        .map(PeerId::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

/// Short random hex id (message ids, file ids, group suffixes).
pub fn random_hex_id(len: usize) -> String {
    let mut s = uuid::Uuid::new_v4().simple().to_string();
    s.truncate(len.min(32));
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn components() {
        let id = PeerId::new("alice", "192.168.1.7".parse().unwrap());
        assert_eq!(id.as_str(), "alice@192.168.1.7");
        assert_eq!(id.username(), "alice");
        assert_eq!(id.ip(), Some("192.168.1.7".parse().unwrap()));
    }

    #[test]
    fn malformed_ids_have_no_address() {
        assert_eq!(PeerId::from("alice").ip(), None);
        assert_eq!(PeerId::from("alice@not-an-ip").ip(), None);
    }

    #[test]
    fn id_lists() {
        let ids = parse_id_list("a@1.1.1.1, ,b@2.2.2.2,");
        assert_eq!(ids.len(), 2);
        assert_eq!(join_id_list(&ids), "a@1.1.1.1,b@2.2.2.2");
    }

    #[test]
    fn hex_ids_have_requested_length() {
        let id = random_hex_id(16);
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
