//! Protocol message types

use serde::{Deserialize, Serialize};

/// Identifier for one TCP connection multiplexed within a tunnel
pub type ClientId = u32;

/// One framed message exchanged between tunnel endpoints.
///
/// Every message names the tunnel it belongs to; endpoints sharing a single
/// transport route frames by `tunnel_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelMessage {
    pub tunnel_id: String,
    pub event: TunnelEvent,
}

/// Event kinds carried by a [`TunnelMessage`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunnelEvent {
    /// The local listener is bound and accepting
    ProxyCreated {
        port: u16,
        use_ipv4: bool,
        remote_port: u16,
    },
    /// The local listener failed to bind
    ProxyError {
        port: u16,
        use_ipv4: bool,
        remote_port: u16,
        error: String,
    },
    /// The proxy shut down
    ProxyClosed,
    /// A new TCP client was accepted
    Connection { client_id: ClientId },
    /// A chunk of raw socket bytes, in either direction
    Data {
        client_id: ClientId,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    /// The client half-closed its side (FIN)
    End { client_id: ClientId },
    /// The client socket is fully closed
    Close { client_id: ClientId },
    /// The client socket sat idle past the configured threshold
    Timeout { client_id: ClientId },
    /// The client socket errored
    Error { client_id: ClientId, error: String },
}

impl TunnelMessage {
    pub fn proxy_created(
        tunnel_id: impl Into<String>,
        port: u16,
        use_ipv4: bool,
        remote_port: u16,
    ) -> Self {
        Self {
            tunnel_id: tunnel_id.into(),
            event: TunnelEvent::ProxyCreated {
                port,
                use_ipv4,
                remote_port,
            },
        }
    }

    pub fn proxy_error(
        tunnel_id: impl Into<String>,
        port: u16,
        use_ipv4: bool,
        remote_port: u16,
        error: impl Into<String>,
    ) -> Self {
        Self {
            tunnel_id: tunnel_id.into(),
            event: TunnelEvent::ProxyError {
                port,
                use_ipv4,
                remote_port,
                error: error.into(),
            },
        }
    }

    pub fn proxy_closed(tunnel_id: impl Into<String>) -> Self {
        Self {
            tunnel_id: tunnel_id.into(),
            event: TunnelEvent::ProxyClosed,
        }
    }

    pub fn connection(tunnel_id: impl Into<String>, client_id: ClientId) -> Self {
        Self {
            tunnel_id: tunnel_id.into(),
            event: TunnelEvent::Connection { client_id },
        }
    }

    pub fn data(tunnel_id: impl Into<String>, client_id: ClientId, data: Vec<u8>) -> Self {
        Self {
            tunnel_id: tunnel_id.into(),
            event: TunnelEvent::Data { client_id, data },
        }
    }

    pub fn end(tunnel_id: impl Into<String>, client_id: ClientId) -> Self {
        Self {
            tunnel_id: tunnel_id.into(),
            event: TunnelEvent::End { client_id },
        }
    }

    pub fn close(tunnel_id: impl Into<String>, client_id: ClientId) -> Self {
        Self {
            tunnel_id: tunnel_id.into(),
            event: TunnelEvent::Close { client_id },
        }
    }

    pub fn timeout(tunnel_id: impl Into<String>, client_id: ClientId) -> Self {
        Self {
            tunnel_id: tunnel_id.into(),
            event: TunnelEvent::Timeout { client_id },
        }
    }

    pub fn error(
        tunnel_id: impl Into<String>,
        client_id: ClientId,
        error: impl Into<String>,
    ) -> Self {
        Self {
            tunnel_id: tunnel_id.into(),
            event: TunnelEvent::Error {
                client_id,
                error: error.into(),
            },
        }
    }

    /// Client the event refers to, if any
    pub fn client_id(&self) -> Option<ClientId> {
        match self.event {
            TunnelEvent::Connection { client_id }
            | TunnelEvent::Data { client_id, .. }
            | TunnelEvent::End { client_id }
            | TunnelEvent::Close { client_id }
            | TunnelEvent::Timeout { client_id }
            | TunnelEvent::Error { client_id, .. } => Some(client_id),
            TunnelEvent::ProxyCreated { .. }
            | TunnelEvent::ProxyError { .. }
            | TunnelEvent::ProxyClosed => None,
        }
    }
}

// Serde helper keeping payloads byte-exact instead of element-encoded
mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<u8>::deserialize(deserializer)
    }
}
