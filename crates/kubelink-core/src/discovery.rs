//! Locating the cluster DNS server.

use crate::error::{LinkError, LinkResult};
use crate::inventory::{Instance, Inventory, PortProtocol, Selector};
use tracing::debug;

pub const DNS_LABEL_KEY: &str = "k8s-app";
pub const DNS_LABEL_VALUE: &str = "kube-dns";
pub const DNS_PORT: u16 = 53;
pub const DEFAULT_DNS_NAMESPACE: &str = "kube-system";

fn serves_dns(instance: &Instance) -> bool {
    instance.running && instance.has_port(DNS_PORT, PortProtocol::Tcp)
}

/// Pick the DNS instance to forward to.
///
/// With `name`, that instance must be running and declare TCP port 53.
/// Without it, the first running `k8s-app=kube-dns` instance declaring TCP
/// port 53 is used.
pub async fn find_dns_instance(
    inventory: &dyn Inventory,
    namespace: &str,
    name: Option<&str>,
) -> LinkResult<Instance> {
    if let Some(name) = name {
        let instance = inventory.instance(namespace, name).await?;
        if !serves_dns(&instance) {
            return Err(LinkError::NotFound(format!(
                "dns pod {namespace}/{name} is not running or has no tcp port {DNS_PORT}"
            )));
        }
        return Ok(instance);
    }

    let selector = Selector::new().with(DNS_LABEL_KEY, DNS_LABEL_VALUE);
    let candidates = inventory.running_by_selector(namespace, &selector).await?;
    if candidates.is_empty() {
        return Err(LinkError::NotFound(format!(
            "no pods matching {selector} in {namespace}"
        )));
    }
    debug!(count = candidates.len(), "dns candidates");
    candidates
        .into_iter()
        .find(serves_dns)
        .ok_or_else(|| LinkError::NotFound("no healthy dns pod".into()))
}
