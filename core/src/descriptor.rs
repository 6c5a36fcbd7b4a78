//! Parsed form of one `vless://` endpoint link.

use serde::{Serialize, Serializer};

/// Transport carried in the `type` query key. Unknown values are kept
/// verbatim so the engine config sees exactly what the link said.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Ws,
    Grpc,
    Http,
    Other(String),
}

impl Transport {
    pub fn parse(s: &str) -> Self {
        match s {
            "tcp" => Transport::Tcp,
            "ws" => Transport::Ws,
            "grpc" => Transport::Grpc,
            "http" => Transport::Http,
            other => Transport::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Ws => "ws",
            Transport::Grpc => "grpc",
            Transport::Http => "http",
            Transport::Other(s) => s,
        }
    }
}

impl Serialize for Transport {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

/// Security mode from the `security` query key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Security {
    None,
    Tls,
    Other(String),
}

impl Security {
    pub fn parse(s: &str) -> Self {
        match s {
            "none" => Security::None,
            "tls" => Security::Tls,
            other => Security::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Security::None => "none",
            Security::Tls => "tls",
            Security::Other(s) => s,
        }
    }
}

impl Serialize for Security {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

/// One endpoint candidate, immutable once parsed.
///
/// Host and port are always present and validated; the label comes from the
/// URI fragment and need not be unique (it may even be empty).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointDescriptor {
    /// Opaque identity credential (typically a UUID, never interpreted).
    pub user_id: String,
    pub host: String,
    pub port: u16,
    pub transport: Transport,
    pub security: Security,
    pub flow: Option<String>,
    pub encryption: String,
    pub sni: Option<String>,
    pub alpn: Option<Vec<String>>,
    /// Virtual-host header for websocket transports (`host` query key).
    pub host_header: Option<String>,
    pub path: Option<String>,
    /// Display label from the URI fragment.
    pub label: String,
}
