use std::time::Duration;

use anyhow::bail;

use crate::node_id::NodeId;

/// Tuning knobs for the routed transport and the relay watchdog.
///
/// The defaults are chosen for consumer links with NAT traversal in the path: generous
///  timeouts, a small fixed window. Congestion control tuned to a specific link is
///  explicitly not a goal of this protocol.
#[derive(Debug)]
pub struct TransportConfig {
    /// Initial TTL for locally originated packets. Every forwarder decrements it, and
    ///  packets are dropped when it reaches zero, so this bounds path length.
    pub default_ttl: u8,

    /// How long `connect()` waits for the second handshake datagram before giving up.
    pub handshake_timeout: Duration,

    /// Idle time after the last ACK before every still-pending slot is resent.
    pub resend_timeout: Duration,

    /// Wake interval of the per-connection retransmission task. The resend predicate is
    ///  evaluated at this granularity.
    pub resend_poll_interval: Duration,

    /// Period of the client-side keepalive towards the relay.
    pub heartbeat_interval: Duration,

    /// Relay-side inactivity threshold after which a session is evicted. Must exceed
    ///  three heartbeat periods, see [TransportConfig::validate].
    pub session_timeout: Duration,

    /// Scan interval of the relay watchdog.
    pub watchdog_interval: Duration,

    /// Capacity of the router's recent `(origin, seq)` window used for duplicate and
    ///  loop suppression.
    pub recent_ids_capacity: usize,

    /// Upper bound on a single routed frame. Larger frames indicate a broken or hostile
    ///  peer and cause the session to be dropped.
    pub max_frame_size: usize,
}

impl TransportConfig {
    pub fn new() -> TransportConfig {
        TransportConfig {
            default_ttl: 16,
            handshake_timeout: Duration::from_secs(5),
            resend_timeout: Duration::from_secs(5),
            resend_poll_interval: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(2),
            session_timeout: Duration::from_secs(10),
            watchdog_interval: Duration::from_millis(500),
            recent_ids_capacity: 4096,
            max_frame_size: 16 * 1024 * 1024,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.default_ttl == 0 {
            bail!("default TTL must be at least 1 - packets would be dropped at the first hop");
        }
        if self.session_timeout < 3 * self.heartbeat_interval {
            bail!(
                "session timeout {:?} must exceed three heartbeat periods ({:?}) - a single \
                 dropped heartbeat would otherwise evict live sessions",
                self.session_timeout,
                3 * self.heartbeat_interval,
            );
        }
        if self.recent_ids_capacity == 0 {
            bail!("recent ids capacity must not be zero");
        }
        Ok(())
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::new()
    }
}

/// Listen and advertisement addresses of a relay node, plus its link to the coordinator.
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    pub listen_address: String,
    pub listen_port: u16,

    /// Address advertised to clients. Defaults to the listen address, which is only
    ///  correct when the relay is not itself behind NAT.
    pub public_listen_address: Option<String>,
    pub public_listen_port: Option<u16>,

    pub server_address: String,
    pub server_port: u16,
    pub server_id: NodeId,
}

impl RelayServerConfig {
    pub fn new() -> RelayServerConfig {
        RelayServerConfig {
            listen_address: "0.0.0.0".to_string(),
            listen_port: 3536,
            public_listen_address: None,
            public_listen_port: None,
            server_address: "127.0.0.1".to_string(),
            server_port: 3535,
            server_id: NodeId::UNSET,
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_address, self.listen_port)
    }

    pub fn advertised_addr(&self) -> String {
        format!(
            "{}:{}",
            self.public_listen_address.as_deref().unwrap_or(&self.listen_address),
            self.public_listen_port.unwrap_or(self.listen_port),
        )
    }
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        RelayServerConfig::new()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        TransportConfig::new().validate().unwrap();
    }

    #[rstest]
    #[case::zero_ttl(|c: &mut TransportConfig| c.default_ttl = 0)]
    #[case::short_session_timeout(|c: &mut TransportConfig| c.session_timeout = Duration::from_secs(5))]
    #[case::zero_recent_ids(|c: &mut TransportConfig| c.recent_ids_capacity = 0)]
    fn test_validate_rejects(#[case] tweak: fn(&mut TransportConfig)) {
        let mut config = TransportConfig::new();
        tweak(&mut config);
        assert!(config.validate().is_err());
    }

    #[rstest]
    #[case::defaults(None, None, "0.0.0.0:3536")]
    #[case::public_addr(Some("203.0.113.9"), Some(4000), "203.0.113.9:4000")]
    #[case::public_addr_only(Some("203.0.113.9"), None, "203.0.113.9:3536")]
    fn test_advertised_addr(
        #[case] public_address: Option<&str>,
        #[case] public_port: Option<u16>,
        #[case] expected: &str,
    ) {
        let mut config = RelayServerConfig::new();
        config.public_listen_address = public_address.map(|s| s.to_string());
        config.public_listen_port = public_port;
        assert_eq!(config.advertised_addr(), expected);
    }
}
