use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::current_timestamp_ms;

/// Opaque key/value payload advertised by a peer (service ports, active flag,
/// custom attributes).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerProperties {
    entries: HashMap<String, String>,
}

impl PeerProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// A member is active unless it explicitly advertises otherwise.
    pub fn is_active(&self) -> bool {
        self.entries.get("active").map(String::as_str) != Some("false")
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, String)> for PeerProperties {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// A cluster peer. Identity for membership purposes is `(host, port)`; the
/// domain scopes which group the peer participates in and never changes after
/// creation.
#[derive(Debug, Clone)]
pub struct Peer {
    host: String,
    port: u16,
    domain: Vec<u8>,
    sub_domain: Option<String>,
    alive_since: u64,
    properties: PeerProperties,
}

impl Peer {
    pub fn new(host: impl Into<String>, port: u16, domain: impl Into<Vec<u8>>) -> Self {
        Self {
            host: host.into(),
            port,
            domain: domain.into(),
            sub_domain: None,
            alive_since: current_timestamp_ms(),
            properties: PeerProperties::new(),
        }
    }

    pub fn with_sub_domain(mut self, sub_domain: impl Into<String>) -> Self {
        self.sub_domain = Some(sub_domain.into());
        self
    }

    pub fn with_properties(mut self, properties: PeerProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_alive_since(mut self, alive_since: u64) -> Self {
        self.alive_since = alive_since;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn domain(&self) -> &[u8] {
        &self.domain
    }

    pub fn sub_domain(&self) -> Option<&str> {
        self.sub_domain.as_deref()
    }

    /// Timestamp at which this peer came alive. Smaller means longer-lived.
    pub fn alive_since(&self) -> u64 {
        self.alive_since
    }

    pub fn properties(&self) -> &PeerProperties {
        &self.properties
    }

    /// The alive timestamp may only move forward.
    pub fn touch(&mut self, timestamp: u64) {
        if timestamp > self.alive_since {
            self.alive_since = timestamp;
        }
    }

    /// `host:port`, the form used for connecting and for wire sender tags.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn same_address(&self, host: &str, port: u16) -> bool {
        self.host == host && self.port == port
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl Eq for Peer {}

impl Hash for Peer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}({})",
            self.host,
            self.port,
            String::from_utf8_lossy(&self.domain)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_is_host_and_port() {
        let a = Peer::new("10.0.0.1", 4000, "grp1");
        let b = Peer::new("10.0.0.1", 4000, "grp2").with_alive_since(999);
        let c = Peer::new("10.0.0.1", 4001, "grp1");

        // Equality ignores domain and liveness; only the address matters.
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_alive_timestamp_only_increases() {
        let mut peer = Peer::new("10.0.0.1", 4000, "grp1").with_alive_since(100);
        peer.touch(50);
        assert_eq!(peer.alive_since(), 100);
        peer.touch(200);
        assert_eq!(peer.alive_since(), 200);
    }

    #[test]
    fn test_properties_active_flag() {
        let mut props = PeerProperties::new();
        assert!(props.is_active());
        props.insert("active", "false");
        assert!(!props.is_active());
    }

    #[test]
    fn test_endpoint_format() {
        let peer = Peer::new("node-1.internal", 4100, "grp1");
        assert_eq!(peer.endpoint(), "node-1.internal:4100");
    }
}
