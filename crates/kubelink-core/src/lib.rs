//! kubelink-core: resolution and forwarding pipeline for kubelink.
//!
//! Maps an intercepted destination address to a running cluster instance via
//! reverse DNS, and serves it through a deduplicated local forwarding session.
//! Cluster access and the session transport are abstract collaborators
//! ([`Inventory`], [`ReverseResolver`], [`Establisher`], [`StackBuilder`]).

pub mod codec;
pub mod dialer;
pub mod discovery;
pub mod dns;
pub mod engine;
pub mod error;
pub mod forward;
pub mod inventory;
pub mod locator;

// Re-export commonly used items at crate root.
pub use codec::{decode, extract_zone, Identity, Kind, Zone};
pub use dialer::{DialOptions, TunnelDialer};
pub use discovery::find_dns_instance;
pub use dns::{DnsProxy, DnsResolver, ReverseResolver};
pub use engine::{DeviceSpec, Engine, EngineConfig, EngineState, Hooks, NetStack, StackBuilder};
pub use error::{LinkError, LinkResult};
pub use forward::{
    wait_ready, Establisher, ForwardKey, ForwardRegistry, Protocol, ReadinessPolicy,
};
pub use inventory::{ContainerPort, Instance, Inventory, PortProtocol, Selector, ServiceRecord};
pub use locator::InstanceLocator;
