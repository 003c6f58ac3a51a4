//! Local port allocation for forwarding sessions.

use crate::error::{LinkError, LinkResult};
use std::collections::BTreeSet;
use std::net::{Ipv4Addr, TcpListener};
use std::ops::Range;
use tracing::trace;

/// Ports claimed by the registry within a fixed range.
///
/// A port is handed out only if it is unclaimed and a transient bind on it
/// succeeds. The session binds the port again later on its own, so the probe
/// listener is closed immediately.
#[derive(Debug)]
pub struct PortPool {
    range: Range<u16>,
    used: BTreeSet<u16>,
}

impl PortPool {
    pub fn new(range: Range<u16>) -> Self {
        Self {
            range,
            used: BTreeSet::new(),
        }
    }

    /// Claim the lowest free port in the range.
    pub fn allocate(&mut self) -> LinkResult<u16> {
        for port in self.range.clone() {
            if self.used.contains(&port) {
                continue;
            }
            match TcpListener::bind((Ipv4Addr::LOCALHOST, port)) {
                Ok(probe) => {
                    drop(probe);
                    self.used.insert(port);
                    return Ok(port);
                }
                Err(e) => trace!(port, error = %e, "port busy"),
            }
        }
        Err(LinkError::ResourceExhausted {
            start: self.range.start,
            end: self.range.end,
        })
    }

    pub fn release(&mut self, port: u16) -> bool {
        self.used.remove(&port)
    }

    pub fn len(&self) -> usize {
        self.used.len()
    }

    pub fn is_empty(&self) -> bool {
        self.used.is_empty()
    }

    pub fn clear(&mut self) {
        self.used.clear();
    }
}
