//! Instance and host identity types.
//!
//! An instance is identified by a host-scoped numeric id (the process id of
//! the monitored runtime). Ids may be reused once the owning process exits,
//! so they are only unique among concurrently running instances.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Host-scoped identifier of one monitored instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub u32);

impl InstanceId {
    /// The monitoring process itself. Never resolvable to a backing file.
    pub const SELF: InstanceId = InstanceId(0);

    pub fn is_self(self) -> bool {
        self.0 == 0
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for InstanceId {
    fn from(id: u32) -> Self {
        InstanceId(id)
    }
}

impl FromStr for InstanceId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u32>().map(InstanceId)
    }
}

/// Identifies the host whose instances are monitored.
///
/// Accepted forms: `localhost`, `//localhost`, `local://localhost`,
/// `<protocol>://<host>[:port]`. An empty string means the local host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostId {
    pub protocol: String,
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl HostId {
    pub const LOCAL_PROTOCOL: &'static str = "local";

    /// The local host.
    pub fn local() -> Self {
        HostId {
            protocol: Self::LOCAL_PROTOCOL.to_string(),
            host: "localhost".to_string(),
            port: None,
        }
    }

    /// Parse a host identifier string.
    pub fn parse(s: &str) -> Result<Self, Error> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(HostId::local());
        }

        let (protocol, rest) = match s.split_once("://") {
            Some((proto, rest)) => {
                if proto.is_empty()
                    || !proto
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-')
                {
                    return Err(Error::InvalidHostId(s.to_string()));
                }
                (proto.to_ascii_lowercase(), rest)
            }
            None => (
                Self::LOCAL_PROTOCOL.to_string(),
                s.strip_prefix("//").unwrap_or(s),
            ),
        };

        let rest = rest.trim_end_matches('/');
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| Error::InvalidHostId(s.to_string()))?;
                (host, Some(port))
            }
            None => (rest, None),
        };

        let host = if host.is_empty() { "localhost" } else { host };
        if host.contains('/') || host.chars().any(char::is_whitespace) {
            return Err(Error::InvalidHostId(s.to_string()));
        }

        Ok(HostId {
            protocol,
            host: host.to_string(),
            port,
        })
    }

    /// Whether this identifier names the local provider on this machine.
    pub fn is_local(&self) -> bool {
        self.protocol == Self::LOCAL_PROTOCOL
            && matches!(self.host.as_str(), "localhost" | "127.0.0.1" | "::1")
    }
}

impl Default for HostId {
    fn default() -> Self {
        HostId::local()
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol, self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        Ok(())
    }
}

impl FromStr for HostId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HostId::parse(s)
    }
}
