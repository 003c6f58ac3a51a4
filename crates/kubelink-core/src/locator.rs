//! Map a destination address to the instance that owns it.
//!
//! ```text
//! ip ─► reverse lookup ─► decode ─┬─ no service/namespace ─► instances by ip
//!                                 └─ service ─► service record ─► instances by selector
//! ```

use crate::codec::{self, Zone};
use crate::dns::ReverseResolver;
use crate::error::LinkResult;
use crate::inventory::{Instance, Inventory};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info};

pub struct InstanceLocator {
    resolver: Arc<dyn ReverseResolver>,
    inventory: Arc<dyn Inventory>,
}

impl InstanceLocator {
    pub fn new(resolver: Arc<dyn ReverseResolver>, inventory: Arc<dyn Inventory>) -> Self {
        Self {
            resolver,
            inventory,
        }
    }

    /// Find the running instance behind `ip`.
    ///
    /// `Ok(None)` covers every negative outcome (no PTR answer, no matching
    /// instance, a service whose cluster address is not `ip`). Resolver and
    /// inventory errors are returned as-is.
    pub async fn locate(&self, ip: IpAddr, zone: &Zone) -> LinkResult<Option<Instance>> {
        let name = self.resolver.reverse_lookup(ip).await?;
        if name.is_empty() {
            debug!(ip = %ip, "no reverse name");
            return Ok(None);
        }

        let identity = codec::decode(&name, zone);
        if !identity.has_service() {
            debug!(ip = %ip, name = %name, "name did not decode to a service, looking up by ip");
            let instances = self
                .inventory
                .running_by_ip(&identity.namespace, ip)
                .await?;
            return Ok(instances.into_iter().next());
        }

        let service = self
            .inventory
            .service(&identity.namespace, &identity.service)
            .await?;

        if identity.endpoint.is_none() && service.cluster_ip != Some(ip) {
            info!(
                ip = %ip,
                service = %identity.service,
                namespace = %identity.namespace,
                cluster_ip = ?service.cluster_ip,
                "service cluster ip does not match"
            );
            return Ok(None);
        }

        let instances = self
            .inventory
            .running_by_selector(&identity.namespace, &service.selector)
            .await?;

        let found = match identity.endpoint {
            Some(_) => instances.into_iter().find(|i| i.ip == Some(ip)),
            None => instances.into_iter().next(),
        };

        match &found {
            Some(instance) => debug!(ip = %ip, instance = %instance, "located instance"),
            None => debug!(ip = %ip, name = %name, "no running instance matched"),
        }
        Ok(found)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::LinkError;
    use crate::inventory::fake::FakeInventory;
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// Resolver answering from a fixed table; unknown addresses get no name.
    #[derive(Default)]
    pub(crate) struct TableResolver {
        pub names: HashMap<IpAddr, String>,
        pub fail: bool,
    }

    impl TableResolver {
        pub fn with(mut self, ip: &str, name: &str) -> Self {
            self.names.insert(ip.parse().unwrap(), name.to_string());
            self
        }
    }

    #[async_trait]
    impl ReverseResolver for TableResolver {
        async fn reverse_lookup(&self, ip: IpAddr) -> LinkResult<String> {
            if self.fail {
                return Err(LinkError::Transport("connection refused".into()));
            }
            Ok(self.names.get(&ip).cloned().unwrap_or_default())
        }
    }

    fn locator(resolver: TableResolver, inventory: Arc<FakeInventory>) -> InstanceLocator {
        InstanceLocator::new(Arc::new(resolver), inventory)
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_no_reverse_answer_is_absent() {
        let inventory = Arc::new(FakeInventory::new());
        let found = locator(TableResolver::default(), inventory.clone())
            .locate(ip("10.0.0.5"), &Zone::default())
            .await
            .unwrap();
        assert!(found.is_none());
        assert_eq!(inventory.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_resolver_error_propagates() {
        let resolver = TableResolver {
            fail: true,
            ..Default::default()
        };
        let err = locator(resolver, Arc::new(FakeInventory::new()))
            .locate(ip("10.0.0.5"), &Zone::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Transport(_)));
    }

    #[tokio::test]
    async fn test_undecodable_name_falls_back_to_ip_lookup() {
        let inventory = Arc::new(FakeInventory::new());
        inventory.add_pod("web-7f9", "default", "10.0.0.5", &[("app", "web")]);
        let resolver = TableResolver::default().with("10.0.0.5", "10-0-0-5.example.net");

        let found = locator(resolver, inventory)
            .locate(ip("10.0.0.5"), &Zone::default())
            .await
            .unwrap()
            .expect("instance by ip");
        assert_eq!(found.name, "web-7f9");
    }

    #[tokio::test]
    async fn test_ip_fallback_without_match_is_absent() {
        let inventory = Arc::new(FakeInventory::new());
        let resolver = TableResolver::default().with("10.0.0.5", "host.example.net");
        let found = locator(resolver, inventory)
            .locate(ip("10.0.0.5"), &Zone::default())
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_endpoint_name_selects_instance_by_ip() {
        let inventory = Arc::new(FakeInventory::new());
        inventory.add_service("web", "default", Some("10.96.0.12"), "web");
        inventory.add_pod("web-aaa", "default", "10.0.0.4", &[("app", "web")]);
        inventory.add_pod("web-7f9", "default", "10.0.0.5", &[("app", "web")]);
        let resolver =
            TableResolver::default().with("10.0.0.5", "web-7f9.web.default.pod.cluster.local");

        let found = locator(resolver, inventory)
            .locate(ip("10.0.0.5"), &Zone::default())
            .await
            .unwrap()
            .expect("endpoint instance");
        assert_eq!(found.name, "web-7f9");
    }

    #[tokio::test]
    async fn test_endpoint_name_without_ip_match_is_absent() {
        let inventory = Arc::new(FakeInventory::new());
        inventory.add_service("web", "default", Some("10.96.0.12"), "web");
        inventory.add_pod("web-aaa", "default", "10.0.0.4", &[("app", "web")]);
        let resolver =
            TableResolver::default().with("10.0.0.5", "web-7f9.web.default.pod.cluster.local");

        let found = locator(resolver, inventory)
            .locate(ip("10.0.0.5"), &Zone::default())
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_service_name_uses_first_selected_instance() {
        let inventory = Arc::new(FakeInventory::new());
        inventory.add_service("web", "default", Some("10.96.0.12"), "web");
        inventory.add_pod("web-aaa", "default", "10.0.0.4", &[("app", "web")]);
        inventory.add_pod("db-0", "default", "10.0.0.9", &[("app", "db")]);
        let resolver = TableResolver::default().with("10.96.0.12", "web.default.svc.cluster.local");

        let found = locator(resolver, inventory)
            .locate(ip("10.96.0.12"), &Zone::default())
            .await
            .unwrap()
            .expect("service instance");
        assert_eq!(found.name, "web-aaa");
    }

    #[tokio::test]
    async fn test_service_cluster_ip_mismatch_is_absent() {
        let inventory = Arc::new(FakeInventory::new());
        inventory.add_service("web", "default", Some("10.96.0.99"), "web");
        inventory.add_pod("web-aaa", "default", "10.0.0.4", &[("app", "web")]);
        let resolver = TableResolver::default().with("10.96.0.12", "web.default.svc.cluster.local");

        let found = locator(resolver, inventory)
            .locate(ip("10.96.0.12"), &Zone::default())
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_missing_service_is_an_error() {
        let inventory = Arc::new(FakeInventory::new());
        let resolver = TableResolver::default().with("10.96.0.12", "web.default.svc.cluster.local");

        let err = locator(resolver, inventory)
            .locate(ip("10.96.0.12"), &Zone::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Inventory(_)), "got {err:?}");
    }
}
