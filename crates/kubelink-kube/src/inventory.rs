//! [`Inventory`] over the Kubernetes API.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::{Api, ListParams};
use kube::Client;
use kubelink_core::{
    ContainerPort, Instance, Inventory, LinkError, LinkResult, PortProtocol, Selector,
    ServiceRecord,
};
use std::net::IpAddr;
use tracing::debug;

const RUNNING_PHASE: &str = "Running";

pub(crate) fn kube_error(e: kube::Error) -> LinkError {
    LinkError::Inventory(e.to_string())
}

/// Pods and services read through a shared [`Client`].
#[derive(Clone)]
pub struct KubeInventory {
    client: Client,
}

impl KubeInventory {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        if namespace.is_empty() {
            Api::all(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), namespace)
        }
    }

    async fn list_running(&self, namespace: &str, params: ListParams) -> LinkResult<Vec<Instance>> {
        let pods = self.pods(namespace).list(&params).await.map_err(kube_error)?;
        let instances: Vec<Instance> = pods
            .items
            .iter()
            .map(instance_from_pod)
            .filter(|i| i.running)
            .collect();
        debug!(
            namespace,
            labels = ?params.label_selector,
            fields = ?params.field_selector,
            count = instances.len(),
            "listed pods"
        );
        Ok(instances)
    }
}

/// Field selector for running pods, optionally pinned to an address.
pub(crate) fn running_fields(ip: Option<IpAddr>) -> String {
    match ip {
        Some(ip) => format!("status.phase={RUNNING_PHASE},status.podIP={ip}"),
        None => format!("status.phase={RUNNING_PHASE}"),
    }
}

pub(crate) fn instance_from_pod(pod: &Pod) -> Instance {
    let status = pod.status.as_ref();
    let ports = pod
        .spec
        .iter()
        .flat_map(|spec| spec.containers.iter())
        .flat_map(|c| c.ports.iter().flatten())
        .filter_map(|p| {
            Some(ContainerPort {
                port: u16::try_from(p.container_port).ok()?,
                protocol: PortProtocol::parse(p.protocol.as_deref()),
            })
        })
        .collect();

    Instance {
        name: pod.metadata.name.clone().unwrap_or_default(),
        namespace: pod.metadata.namespace.clone().unwrap_or_default(),
        ip: status
            .and_then(|s| s.pod_ip.as_deref())
            .and_then(|ip| ip.parse().ok()),
        running: status.and_then(|s| s.phase.as_deref()) == Some(RUNNING_PHASE),
        ports,
    }
}

pub(crate) fn record_from_service(namespace: &str, service: &Service) -> ServiceRecord {
    let spec = service.spec.as_ref();
    ServiceRecord {
        name: service.metadata.name.clone().unwrap_or_default(),
        namespace: service
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| namespace.to_string()),
        // Headless services report "None".
        cluster_ip: spec
            .and_then(|s| s.cluster_ip.as_deref())
            .and_then(|ip| ip.parse().ok()),
        selector: spec
            .and_then(|s| s.selector.clone())
            .map(Selector::from)
            .unwrap_or_default(),
    }
}

#[async_trait]
impl Inventory for KubeInventory {
    async fn running_by_selector(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> LinkResult<Vec<Instance>> {
        // A service without a selector has no managed pods.
        if selector.is_empty() {
            return Ok(Vec::new());
        }
        let params = ListParams::default()
            .labels(&selector.to_string())
            .fields(&running_fields(None));
        self.list_running(namespace, params).await
    }

    async fn running_by_ip(&self, namespace: &str, ip: IpAddr) -> LinkResult<Vec<Instance>> {
        let params = ListParams::default().fields(&running_fields(Some(ip)));
        self.list_running(namespace, params).await
    }

    async fn instance(&self, namespace: &str, name: &str) -> LinkResult<Instance> {
        let pod = self.pods(namespace).get(name).await.map_err(kube_error)?;
        Ok(instance_from_pod(&pod))
    }

    async fn service(&self, namespace: &str, name: &str) -> LinkResult<ServiceRecord> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let service = services.get(name).await.map_err(kube_error)?;
        Ok(record_from_service(namespace, &service))
    }
}
