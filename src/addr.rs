use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SiphonError};

/// How an endpoint is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Unix,
    Tcp,
    /// No listener; the session is driven from inside the process.
    Internal,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Unix => "unix",
            Transport::Tcp => "tcp",
            Transport::Internal => "internal",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable endpoint descriptor. Serialized as `{label, proto, addr}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    label: String,
    proto: Transport,
    #[serde(default)]
    addr: String,
}

impl Address {
    /// Build a network address. Only `"unix"` and `"tcp"` are accepted.
    pub fn new(label: impl Into<String>, proto: &str, addr: impl Into<String>) -> Result<Self> {
        let proto = match proto {
            "unix" => Transport::Unix,
            "tcp" => Transport::Tcp,
            other => return Err(SiphonError::UnsupportedTransport(other.to_string())),
        };
        Ok(Self {
            label: label.into(),
            proto,
            addr: addr.into(),
        })
    }

    pub fn internal() -> Self {
        Self {
            label: "internal".to_string(),
            proto: Transport::Internal,
            addr: String::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn transport(&self) -> Transport {
        self.proto
    }

    pub fn location(&self) -> &str {
        &self.addr
    }

    pub fn is_internal(&self) -> bool {
        self.proto == Transport::Internal
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.addr.is_empty() {
            write!(f, "{} ({})", self.label, self.proto)
        } else {
            write!(f, "{} ({}:{})", self.label, self.proto, self.addr)
        }
    }
}
