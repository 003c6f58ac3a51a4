//! DNS plumbing: PTR lookups against the cluster resolver and an optional
//! UDP passthrough proxy in front of it.

pub mod proxy;
pub mod resolver;

pub use proxy::DnsProxy;
pub use resolver::{DnsResolver, ReverseResolver};
