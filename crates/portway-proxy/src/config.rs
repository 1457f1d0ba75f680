//! Proxy configuration

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

/// Configuration for one TCP tunnel proxy endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Identifier distinguishing this tunnel on a shared transport
    pub tunnel_id: String,

    /// Local port to listen on; 0 binds an ephemeral port
    pub local_port: u16,

    /// Port the remote peer should connect to on its side
    pub remote_port: u16,

    /// Bind 0.0.0.0 when true, :: otherwise
    pub use_ipv4: bool,

    /// Idle threshold after which a Timeout event is emitted for a client.
    /// Informational; the socket stays open. Disabled by default.
    #[serde(default, with = "duration_secs_opt")]
    pub idle_timeout: Option<Duration>,
}

impl ProxyConfig {
    /// Create a configuration with a generated tunnel id
    pub fn new(local_port: u16, remote_port: u16) -> Self {
        Self {
            tunnel_id: format!("tunnel-{}", uuid::Uuid::new_v4()),
            local_port,
            remote_port,
            use_ipv4: true,
            idle_timeout: None,
        }
    }

    /// Use a caller-assigned tunnel id
    pub fn with_tunnel_id(mut self, tunnel_id: impl Into<String>) -> Self {
        self.tunnel_id = tunnel_id.into();
        self
    }

    /// Bind the IPv6 wildcard address instead of 0.0.0.0
    pub fn with_ipv6(mut self) -> Self {
        self.use_ipv4 = false;
        self
    }

    /// Emit Timeout events for clients idle past `timeout`
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Address the listener binds to
    pub fn bind_addr(&self) -> SocketAddr {
        let ip = if self.use_ipv4 {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        };
        SocketAddr::new(ip, self.local_port)
    }
}

// Helper module for serializing Option<Duration> as whole seconds
mod duration_secs_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(duration) => serializer.serialize_some(&duration.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<u64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}
