//! Reverse-DNS name decoding.
//!
//! The cluster DNS responder answers PTR queries with names of the forms
//!
//! ```text
//! _port._protocol.service.namespace.(pod|svc).zone
//! endpoint.service.namespace.(pod|svc).zone
//! service.namespace.(pod|svc).zone
//! ```
//!
//! [`decode`] splits such a name into an [`Identity`]; [`extract_zone`]
//! recovers the zone suffix from any one of them. Both are pure.

use serde::{Deserialize, Serialize};
use std::fmt;

const POD_MARKER: &str = ".pod.";
const SVC_MARKER: &str = ".svc.";

/// Zone used when an observed name carries no pod/service marker.
pub const DEFAULT_ZONE: &str = "cluster.local";

/// What a decoded name refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Kind {
    Pod,
    Service,
    #[default]
    Unknown,
}

/// Structured meaning of a reverse-DNS name.
///
/// `Identity::default()` is the unknown identity: every field empty.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Identity {
    pub kind: Kind,
    /// Named port, e.g. `_http`.
    pub port: Option<String>,
    /// Protocol label, e.g. `_tcp`.
    pub protocol: Option<String>,
    pub service: String,
    pub namespace: String,
    /// Specific instance hint (three-segment form only).
    pub endpoint: Option<String>,
}

impl Identity {
    pub fn is_unknown(&self) -> bool {
        self.kind == Kind::Unknown
    }

    /// Whether the identity names a service in a namespace.
    pub fn has_service(&self) -> bool {
        !self.service.is_empty() && !self.namespace.is_empty()
    }
}

/// Cluster DNS suffix shared by all decodable names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Zone(String);

impl Zone {
    pub fn new(zone: impl Into<String>) -> Self {
        Self(zone.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Zone {
    fn default() -> Self {
        Self(DEFAULT_ZONE.to_string())
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Decode a reverse-DNS name into an [`Identity`].
///
/// Returns the unknown identity when the name has neither marker or when the
/// prefix before the marker does not have 2, 3 or 4 labels.
pub fn decode(name: &str, zone: &Zone) -> Identity {
    let mut name = name;
    if !zone.as_str().is_empty() {
        if let Some(idx) = name.find(zone.as_str()) {
            name = &name[..idx];
        }
    }

    let (kind, prefix) = if let Some((prefix, _)) = name.split_once(POD_MARKER) {
        (Kind::Pod, prefix)
    } else if let Some((prefix, _)) = name.split_once(SVC_MARKER) {
        (Kind::Service, prefix)
    } else {
        return Identity::default();
    };

    let parts: Vec<&str> = prefix.split('.').collect();
    match parts.as_slice() {
        [port, protocol, service, namespace] => Identity {
            kind,
            port: Some(port.to_string()),
            protocol: Some(protocol.to_string()),
            service: service.to_string(),
            namespace: namespace.to_string(),
            endpoint: None,
        },
        [endpoint, service, namespace] => Identity {
            kind,
            port: None,
            protocol: None,
            service: service.to_string(),
            namespace: namespace.to_string(),
            endpoint: Some(endpoint.to_string()),
        },
        [service, namespace] => Identity {
            kind,
            service: service.to_string(),
            namespace: namespace.to_string(),
            ..Identity::default()
        },
        _ => Identity::default(),
    }
}

/// Extract the zone suffix that follows the first pod or service marker.
pub fn extract_zone(full_name: &str) -> Zone {
    if let Some((_, zone)) = full_name.split_once(POD_MARKER) {
        return Zone::new(zone);
    }
    if let Some((_, zone)) = full_name.split_once(SVC_MARKER) {
        return Zone::new(zone);
    }
    Zone::default()
}
