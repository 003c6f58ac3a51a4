//! kubelink-kube: Kubernetes-backed collaborators for kubelink-core.
//!
//! [`KubeInventory`] answers pod and service lookups; [`PodPortForwarder`]
//! serves forwarding sessions over pod port-forward streams.

pub mod inventory;
pub mod portforward;

pub use inventory::KubeInventory;
pub use portforward::PodPortForwarder;
