use crate::error::{LinkError, LinkResult};
use std::fmt;
use std::net::SocketAddr;

/// Transport of an intercepted flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        })
    }
}

/// Remote destination of a forward. Its canonical form is
/// `proto://ip:port`, e.g. `tcp://10.0.0.5:8080`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ForwardKey {
    pub protocol: Protocol,
    pub destination: SocketAddr,
}

impl ForwardKey {
    pub fn new(protocol: Protocol, destination: SocketAddr) -> Self {
        Self {
            protocol,
            destination,
        }
    }

    /// Build a key from a textual `ip:port` destination.
    pub fn from_destination(protocol: Protocol, destination: &str) -> LinkResult<Self> {
        if destination.is_empty() {
            return Err(LinkError::InvalidDestination("empty destination".into()));
        }
        let destination = destination
            .parse::<SocketAddr>()
            .map_err(|e| LinkError::InvalidDestination(format!("{destination}: {e}")))?;
        Ok(Self::new(protocol, destination))
    }
}

impl fmt::Display for ForwardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol, self.destination)
    }
}
