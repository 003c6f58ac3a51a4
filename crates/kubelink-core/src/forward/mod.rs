//! Local forwarding sessions and the port pool behind them.

pub mod key;
pub mod ports;
pub mod registry;

pub use key::{ForwardKey, Protocol};
pub use ports::PortPool;
pub use registry::{
    wait_ready, Establisher, ForwardEntry, ForwardRegistry, ForwardStatus, ReadinessPolicy,
};
