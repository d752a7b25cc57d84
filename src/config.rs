use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::Duration;

use crate::{ClusterError, Result};

/// Default logical domain when none is configured
pub const DEFAULT_DOMAIN: &str = "default";

/// Default timeout for acknowledged (RPC-style) sends
pub const DEFAULT_RPC_TIMEOUT_SECS: u64 = 10;

/// Default retry count for transport-level delivery
pub const DEFAULT_MAX_RETRIES: usize = 10;

/// Default TTL for the duplicate suppressor's seen-set (5 minutes)
pub const DEFAULT_SUPPRESSOR_TTL_SECS: u64 = 300;

/// Upper bound on removals per suppressor sweep pass
pub const DEFAULT_SWEEP_MAX_REMOVALS: usize = 10_000;

/// TCP reachability probe attempts per well-known candidate
pub const DEFAULT_PROBE_ATTEMPTS: usize = 5;

/// Retry interval while no well-known member is reachable
pub const DEFAULT_WKA_RETRY_SECS: u64 = 2;

/// Retry interval while waiting for a JOIN reply
pub const DEFAULT_JOIN_RETRY_SECS: u64 = 5;

/// Interval for re-sending the member list to unresponsive well-known members
pub const DEFAULT_MEMBER_LIST_RETRY_SECS: u64 = 5;

/// Interval between liveness probes of current members
pub const DEFAULT_PING_INTERVAL_SECS: u64 = 10;

/// First port tried when the preferred listen port is taken
pub const DEFAULT_PORT_SCAN_START: u16 = 4000;

/// Number of ports scanned after the start port
pub const DEFAULT_PORT_SCAN_RETRIES: u16 = 100;

/// Default multicast discovery group
pub const DEFAULT_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(228, 0, 0, 4);

/// Default multicast discovery port
pub const DEFAULT_MULTICAST_PORT: u16 = 45_564;

/// Default interval between multicast announcements
pub const DEFAULT_MULTICAST_FREQUENCY_MS: u64 = 500;

/// A multicast peer is dropped after this long without an announcement
pub const DEFAULT_MULTICAST_DROP_TIME_MS: u64 = 3_000;

/// Membership discovery strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemeKind {
    /// Peers discover each other through multicast announcements
    Multicast,
    /// Peers bootstrap from a fixed list of well-known addresses
    Wka,
}

impl FromStr for SchemeKind {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "multicast" => Ok(SchemeKind::Multicast),
            "wka" => Ok(SchemeKind::Wka),
            other => Err(ClusterError::InvalidParameter {
                name: "scheme".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// A `host:port` pair naming a member before it is seen alive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberAddress {
    pub host: String,
    pub port: u16,
}

impl FromStr for MemberAddress {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || ClusterError::InvalidParameter {
            name: "wkaList".to_string(),
            value: s.to_string(),
        };
        let (host, port) = s.trim().rsplit_once(':').ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        Ok(MemberAddress {
            host: host.to_string(),
            port,
        })
    }
}

impl std::fmt::Display for MemberAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Multicast discovery settings
#[derive(Debug, Clone)]
pub struct MulticastConfig {
    /// Multicast group address announcements are sent to
    pub group: Ipv4Addr,
    /// Multicast port
    pub port: u16,
    /// Interval between announcements of the local peer
    pub frequency: Duration,
    /// Silence threshold after which a peer is considered gone
    pub drop_time: Duration,
}

impl Default for MulticastConfig {
    fn default() -> Self {
        Self {
            group: DEFAULT_MULTICAST_GROUP,
            port: DEFAULT_MULTICAST_PORT,
            frequency: Duration::from_millis(DEFAULT_MULTICAST_FREQUENCY_MS),
            drop_time: Duration::from_millis(DEFAULT_MULTICAST_DROP_TIME_MS),
        }
    }
}

/// Configuration for the cluster agent
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Logical domain (sub-cluster) this node belongs to
    pub domain: String,
    /// Membership discovery scheme
    pub scheme: SchemeKind,
    /// Well-known member addresses (WKA scheme only)
    pub wka_members: Vec<MemberAddress>,
    /// Advertised host; autodetected when unset
    pub local_host: Option<String>,
    /// Preferred listen port; scanned from `port_scan_start` when unset or taken
    pub local_port: Option<u16>,
    /// First port tried when the preferred port is unavailable
    pub port_scan_start: u16,
    /// Number of fallback ports to try
    pub port_scan_retries: u16,
    /// Multicast discovery settings
    pub multicast: MulticastConfig,
    /// Maximum transport-level delivery retries per peer
    pub max_retries: usize,
    /// Attach at-most-once semantics to outbound messages and dedupe inbound ones
    pub at_most_once: bool,
    /// Preserve sender-relative ordering of messages within a domain
    pub preserve_order: bool,
    /// Require every member to acknowledge RPC-style messages
    pub synchronize_all: bool,
    /// Timeout for acknowledged sends
    pub rpc_timeout: Duration,
    /// Timeout for establishing outbound connections
    pub connect_timeout: Duration,
    /// TCP reachability probe attempts per well-known candidate
    pub probe_attempts: usize,
    /// Retry interval while no well-known member is reachable
    pub wka_retry_interval: Duration,
    /// Retry interval while waiting for a JOIN reply
    pub join_retry_interval: Duration,
    /// Interval for re-sending the member list to unresponsive well-known members
    pub member_list_retry_interval: Duration,
    /// Interval between liveness probes of current members
    pub ping_interval: Duration,
    /// TTL for duplicate-suppressor entries
    pub suppressor_ttl: Duration,
    /// Interval between suppressor sweep passes
    pub sweep_interval: Duration,
    /// Upper bound on removals per sweep pass
    pub sweep_max_removals: usize,
    /// Maximum wire message size in bytes
    pub max_message_size: usize,
    /// Properties advertised in the local peer's payload
    pub properties: HashMap<String, String>,
    /// Whether this member advertises itself as active
    pub is_active: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            domain: DEFAULT_DOMAIN.to_string(),
            scheme: SchemeKind::Multicast,
            wka_members: Vec::new(),
            local_host: None,
            local_port: None,
            port_scan_start: DEFAULT_PORT_SCAN_START,
            port_scan_retries: DEFAULT_PORT_SCAN_RETRIES,
            multicast: MulticastConfig::default(),
            max_retries: DEFAULT_MAX_RETRIES,
            at_most_once: false,
            preserve_order: false,
            synchronize_all: true,
            rpc_timeout: Duration::from_secs(DEFAULT_RPC_TIMEOUT_SECS),
            connect_timeout: Duration::from_millis(500),
            probe_attempts: DEFAULT_PROBE_ATTEMPTS,
            wka_retry_interval: Duration::from_secs(DEFAULT_WKA_RETRY_SECS),
            join_retry_interval: Duration::from_secs(DEFAULT_JOIN_RETRY_SECS),
            member_list_retry_interval: Duration::from_secs(DEFAULT_MEMBER_LIST_RETRY_SECS),
            ping_interval: Duration::from_secs(DEFAULT_PING_INTERVAL_SECS),
            suppressor_ttl: Duration::from_secs(DEFAULT_SUPPRESSOR_TTL_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SUPPRESSOR_TTL_SECS),
            sweep_max_removals: DEFAULT_SWEEP_MAX_REMOVALS,
            max_message_size: 10 * 1024 * 1024, // 10MB
            properties: HashMap::new(),
            is_active: true,
        }
    }
}

impl ClusterConfig {
    /// Build a configuration from a flat string parameter map.
    ///
    /// Recognized options: `domain`, `scheme` (`multicast` | `wka`), `wkaList`
    /// (comma-separated `host:port` list), `localHost`, `localPort`,
    /// `maxRetries`, `atMostOnce`, `preserveOrder`, `synchronizeAll`.
    /// Unrecognized keys are carried verbatim into the advertised properties.
    pub fn from_parameters(params: &HashMap<String, String>) -> Result<Self> {
        let mut config = ClusterConfig::default();

        for (name, value) in params {
            match name.as_str() {
                "domain" => config.domain = value.trim().to_string(),
                "scheme" => config.scheme = value.parse()?,
                "wkaList" => {
                    config.wka_members = value
                        .split(',')
                        .filter(|s| !s.trim().is_empty())
                        .map(|s| s.parse())
                        .collect::<Result<Vec<_>>>()?;
                }
                "localHost" => config.local_host = Some(value.trim().to_string()),
                "localPort" => {
                    let port = value.trim().parse::<u16>().map_err(|_| {
                        ClusterError::InvalidParameter {
                            name: name.clone(),
                            value: value.clone(),
                        }
                    })?;
                    config.local_port = Some(port);
                }
                "maxRetries" => {
                    config.max_retries = value.trim().parse::<usize>().map_err(|_| {
                        ClusterError::InvalidParameter {
                            name: name.clone(),
                            value: value.clone(),
                        }
                    })?;
                }
                "atMostOnce" => config.at_most_once = parse_bool(name, value)?,
                "preserveOrder" => config.preserve_order = parse_bool(name, value)?,
                "synchronizeAll" => config.synchronize_all = parse_bool(name, value)?,
                _ => {
                    config
                        .properties
                        .insert(name.clone(), value.clone());
                }
            }
        }

        Ok(config)
    }

    pub fn domain_bytes(&self) -> Vec<u8> {
        self.domain.as_bytes().to_vec()
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(ClusterError::InvalidParameter {
            name: name.to_string(),
            value: value.to_string(),
        }),
    }
}
