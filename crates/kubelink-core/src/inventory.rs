//! Read-only view of the cluster inventory.
//!
//! The locator and the DNS bootstrap only ever read these records; every
//! lookup re-queries the [`Inventory`], nothing is cached here.

use crate::error::LinkResult;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

/// Transport protocol declared on a container port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortProtocol {
    Tcp,
    Udp,
    Sctp,
}

impl PortProtocol {
    /// Parse the upper-case protocol names used by the control plane.
    /// Missing protocols default to TCP there, so they do here.
    pub fn parse(s: Option<&str>) -> Self {
        match s {
            Some("UDP") => PortProtocol::Udp,
            Some("SCTP") => PortProtocol::Sctp,
            _ => PortProtocol::Tcp,
        }
    }
}

/// A port declared by one of an instance's containers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerPort {
    pub port: u16,
    pub protocol: PortProtocol,
}

/// A single running backend with its own address (a pod).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub name: String,
    pub namespace: String,
    pub ip: Option<IpAddr>,
    pub running: bool,
    pub ports: Vec<ContainerPort>,
}

impl Instance {
    pub fn has_port(&self, port: u16, protocol: PortProtocol) -> bool {
        self.ports
            .iter()
            .any(|p| p.port == port && p.protocol == protocol)
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Equality-based label selector, `k1=v1,k2=v2` on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector(BTreeMap<String, String>);

impl Selector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0.iter().all(|(k, v)| labels.get(k) == Some(v))
    }
}

impl From<BTreeMap<String, String>> for Selector {
    fn from(labels: BTreeMap<String, String>) -> Self {
        Self(labels)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.0 {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{k}={v}")?;
            first = false;
        }
        Ok(())
    }
}

/// The parts of a service record the locator needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub name: String,
    pub namespace: String,
    /// Cluster-level virtual address; `None` for headless services.
    pub cluster_ip: Option<IpAddr>,
    pub selector: Selector,
}

/// Control-plane access used by the locator and DNS bootstrap.
///
/// An empty `namespace` means every namespace. Errors are passed through to
/// callers unchanged.
#[async_trait]
pub trait Inventory: Send + Sync {
    /// Running instances in `namespace` whose labels match `selector`.
    async fn running_by_selector(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> LinkResult<Vec<Instance>>;

    /// Running instances in `namespace` reporting address `ip`.
    async fn running_by_ip(&self, namespace: &str, ip: IpAddr) -> LinkResult<Vec<Instance>>;

    /// A single instance by name.
    async fn instance(&self, namespace: &str, name: &str) -> LinkResult<Instance>;

    /// A service record by name.
    async fn service(&self, namespace: &str, name: &str) -> LinkResult<ServiceRecord>;
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory inventory for tests.

    use super::*;
    use crate::error::LinkError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeInventory {
        pub pods: Mutex<Vec<(Instance, BTreeMap<String, String>)>>,
        pub services: Mutex<Vec<ServiceRecord>>,
        pub fail: Mutex<Option<String>>,
        pub calls: AtomicUsize,
    }

    impl FakeInventory {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn add_pod(&self, name: &str, ns: &str, ip: &str, labels: &[(&str, &str)]) {
            let instance = Instance {
                name: name.into(),
                namespace: ns.into(),
                ip: Some(ip.parse().unwrap()),
                running: true,
                ports: vec![ContainerPort {
                    port: 8080,
                    protocol: PortProtocol::Tcp,
                }],
            };
            self.add_instance(instance, labels);
        }

        pub fn add_instance(&self, instance: Instance, labels: &[(&str, &str)]) {
            let labels = labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            self.pods.lock().unwrap().push((instance, labels));
        }

        pub fn add_service(&self, name: &str, ns: &str, cluster_ip: Option<&str>, app: &str) {
            self.services.lock().unwrap().push(ServiceRecord {
                name: name.into(),
                namespace: ns.into(),
                cluster_ip: cluster_ip.map(|ip| ip.parse().unwrap()),
                selector: Selector::new().with("app", app),
            });
        }

        pub fn fail_with(&self, message: &str) {
            *self.fail.lock().unwrap() = Some(message.to_string());
        }

        fn check(&self) -> LinkResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.fail.lock().unwrap().clone() {
                Some(message) => Err(LinkError::Inventory(message)),
                None => Ok(()),
            }
        }

        fn in_namespace(ns: &str, instance: &Instance) -> bool {
            ns.is_empty() || instance.namespace == ns
        }
    }

    #[async_trait]
    impl Inventory for FakeInventory {
        async fn running_by_selector(
            &self,
            namespace: &str,
            selector: &Selector,
        ) -> LinkResult<Vec<Instance>> {
            self.check()?;
            Ok(self
                .pods
                .lock()
                .unwrap()
                .iter()
                .filter(|(i, labels)| {
                    i.running && Self::in_namespace(namespace, i) && selector.matches(labels)
                })
                .map(|(i, _)| i.clone())
                .collect())
        }

        async fn running_by_ip(&self, namespace: &str, ip: IpAddr) -> LinkResult<Vec<Instance>> {
            self.check()?;
            Ok(self
                .pods
                .lock()
                .unwrap()
                .iter()
                .filter(|(i, _)| i.running && Self::in_namespace(namespace, i) && i.ip == Some(ip))
                .map(|(i, _)| i.clone())
                .collect())
        }

        async fn instance(&self, namespace: &str, name: &str) -> LinkResult<Instance> {
            self.check()?;
            self.pods
                .lock()
                .unwrap()
                .iter()
                .find(|(i, _)| i.namespace == namespace && i.name == name)
                .map(|(i, _)| i.clone())
                .ok_or_else(|| LinkError::Inventory(format!("pods \"{name}\" not found")))
        }

        async fn service(&self, namespace: &str, name: &str) -> LinkResult<ServiceRecord> {
            self.check()?;
            self.services
                .lock()
                .unwrap()
                .iter()
                .find(|s| s.namespace == namespace && s.name == name)
                .cloned()
                .ok_or_else(|| LinkError::Inventory(format!("services \"{name}\" not found")))
        }
    }
}
