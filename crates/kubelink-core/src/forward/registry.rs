//! Deduplicated forwarding sessions keyed by remote destination.
//!
//! The first caller for a [`ForwardKey`] becomes the leader: it claims a local
//! port, locates the backing instance, starts the session and waits for it to
//! accept connections. Concurrent callers for the same key park on the
//! leader's `watch` channel and receive the same local address (or the same
//! error). Failed attempts are never cached.
//!
//! Every entry owns its session task. Dropping the entry aborts the session,
//! so eviction, [`ForwardRegistry::gc`] and [`ForwardRegistry::shutdown`] only
//! need to remove entries and give their ports back.

use super::key::ForwardKey;
use super::ports::PortPool;
use crate::codec::Zone;
use crate::error::{LinkError, LinkResult};
use crate::inventory::Instance;
use crate::locator::InstanceLocator;
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Starts the transport that serves a local port for a remote instance.
#[async_trait]
pub trait Establisher: Send + Sync {
    /// Serve `127.0.0.1:local_port` by relaying to `remote_port` on
    /// `instance`. The future runs for the lifetime of the session; returning
    /// (with or without an error) ends it.
    async fn establish(&self, instance: Instance, local_port: u16, remote_port: u16)
        -> LinkResult<()>;
}

/// How long to wait for a fresh session to start accepting connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            attempts: 4,
            interval: Duration::from_secs(1),
        }
    }
}

/// Probe `addr` with TCP connects until one succeeds.
pub async fn wait_ready(addr: SocketAddr, policy: ReadinessPolicy) -> LinkResult<()> {
    let attempts = policy.attempts.max(1);
    for attempt in 1..=attempts {
        match TcpStream::connect(addr).await {
            Ok(_) => {
                debug!(addr = %addr, attempt, "session ready");
                return Ok(());
            }
            Err(e) => debug!(addr = %addr, attempt, error = %e, "session not ready"),
        }
        if attempt < attempts {
            tokio::time::sleep(policy.interval).await;
        }
    }
    Err(LinkError::ReadinessTimeout { addr, attempts })
}

/// A live forwarding session.
pub struct ForwardEntry {
    key: ForwardKey,
    local_addr: SocketAddr,
    instance: Instance,
    created_at: Instant,
    session: JoinHandle<()>,
}

impl ForwardEntry {
    pub fn key(&self) -> ForwardKey {
        self.key
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn is_alive(&self) -> bool {
        !self.session.is_finished()
    }
}

impl Drop for ForwardEntry {
    fn drop(&mut self) {
        self.session.abort();
    }
}

/// Point-in-time view of one entry, for status logging.
#[derive(Debug, Clone)]
pub struct ForwardStatus {
    pub key: ForwardKey,
    pub local_addr: SocketAddr,
    pub instance: String,
    pub alive: bool,
    pub age: Duration,
}

type Outcome = Result<SocketAddr, Arc<LinkError>>;

enum Slot {
    /// Leader `lease` is establishing this key on `port`.
    Pending {
        port: u16,
        lease: u64,
        outcome: watch::Receiver<Option<Outcome>>,
    },
    Ready(ForwardEntry),
}

struct RegistryState {
    slots: HashMap<ForwardKey, Slot>,
    ports: PortPool,
    next_lease: u64,
}

impl RegistryState {
    /// Whether `key` is still pending under `lease`. False once the slot was
    /// cleared by shutdown or gc, or taken over by another leader.
    fn holds(&self, key: &ForwardKey, lease: u64) -> bool {
        matches!(
            self.slots.get(key),
            Some(Slot::Pending { lease: held, .. }) if *held == lease
        )
    }

    /// Drop an entry and return its port to the pool.
    fn evict(&mut self, key: &ForwardKey) -> Option<ForwardEntry> {
        match self.slots.remove(key)? {
            Slot::Ready(entry) => {
                self.ports.release(entry.local_addr.port());
                Some(entry)
            }
            Slot::Pending { port, .. } => {
                self.ports.release(port);
                None
            }
        }
    }
}

/// Outcome of inspecting a key under the write lock.
enum Claim {
    Done(SocketAddr),
    Wait(watch::Receiver<Option<Outcome>>),
    Lead {
        port: u16,
        lease: u64,
        notify: watch::Sender<Option<Outcome>>,
    },
}

/// Cache of forwarding sessions with a bounded local port pool.
pub struct ForwardRegistry {
    state: RwLock<RegistryState>,
    locator: InstanceLocator,
    establisher: Arc<dyn Establisher>,
    zone: Zone,
    readiness: ReadinessPolicy,
    local_ip: IpAddr,
}

impl ForwardRegistry {
    pub fn new(
        locator: InstanceLocator,
        establisher: Arc<dyn Establisher>,
        zone: Zone,
        ports: Range<u16>,
        readiness: ReadinessPolicy,
    ) -> Self {
        Self {
            state: RwLock::new(RegistryState {
                slots: HashMap::new(),
                ports: PortPool::new(ports),
                next_lease: 0,
            }),
            locator,
            establisher,
            zone,
            readiness,
            local_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }

    pub fn zone(&self) -> &Zone {
        &self.zone
    }

    /// Return the local address serving `key`, establishing a session first
    /// if none is live.
    pub async fn resolve_or_establish(&self, key: ForwardKey) -> LinkResult<SocketAddr> {
        loop {
            {
                let state = self.state.read().await;
                if let Some(Slot::Ready(entry)) = state.slots.get(&key) {
                    if entry.is_alive() {
                        return Ok(entry.local_addr);
                    }
                }
            }

            match self.claim(key).await? {
                Claim::Done(addr) => return Ok(addr),
                Claim::Wait(outcome) => match wait_outcome(outcome).await {
                    Some(Ok(addr)) => return Ok(addr),
                    Some(Err(e)) => return Err(LinkError::Shared(e)),
                    // Leader went away without an answer; try again.
                    None => continue,
                },
                Claim::Lead {
                    port,
                    lease,
                    notify,
                } => return self.lead(key, port, lease, notify).await,
            }
        }
    }

    async fn claim(&self, key: ForwardKey) -> LinkResult<Claim> {
        let mut state = self.state.write().await;
        match state.slots.get(&key) {
            Some(Slot::Ready(entry)) if entry.is_alive() => {
                return Ok(Claim::Done(entry.local_addr));
            }
            Some(Slot::Ready(entry)) => {
                info!(key = %key, local = %entry.local_addr, "evicting dead forward");
                state.evict(&key);
            }
            Some(Slot::Pending { outcome, .. }) if outcome.has_changed().is_ok() => {
                return Ok(Claim::Wait(outcome.clone()));
            }
            Some(Slot::Pending { port, .. }) => {
                warn!(key = %key, port = *port, "reclaiming abandoned forward attempt");
                state.evict(&key);
            }
            None => {}
        }

        let port = state.ports.allocate()?;
        let lease = state.next_lease;
        state.next_lease += 1;
        let (notify, outcome) = watch::channel(None);
        state.slots.insert(
            key,
            Slot::Pending {
                port,
                lease,
                outcome,
            },
        );
        debug!(key = %key, port, "claimed local port");
        Ok(Claim::Lead {
            port,
            lease,
            notify,
        })
    }

    async fn lead(
        &self,
        key: ForwardKey,
        port: u16,
        lease: u64,
        notify: watch::Sender<Option<Outcome>>,
    ) -> LinkResult<SocketAddr> {
        let result = self.establish(key, port).await;
        let mut state = self.state.write().await;
        // The slot and its port were reclaimed while establishing; the entry
        // must not outlive that.
        let result = match result {
            Ok(entry) if !state.holds(&key, lease) => {
                info!(key = %key, local = %entry.local_addr, "forward cancelled while establishing");
                drop(entry);
                Err(LinkError::Session(format!(
                    "forward for {key} was cancelled while establishing"
                )))
            }
            other => other,
        };
        match result {
            Ok(entry) => {
                let addr = entry.local_addr;
                info!(key = %key, local = %addr, instance = %entry.instance, "forward established");
                state.slots.insert(key, Slot::Ready(entry));
                drop(state);
                let _ = notify.send(Some(Ok(addr)));
                Ok(addr)
            }
            Err(e) => {
                warn!(key = %key, error = %e, "forward failed");
                if state.holds(&key, lease) {
                    state.evict(&key);
                }
                drop(state);
                if notify.receiver_count() == 0 {
                    return Err(e);
                }
                let shared = Arc::new(e);
                let _ = notify.send(Some(Err(shared.clone())));
                Err(LinkError::Shared(shared))
            }
        }
    }

    async fn establish(&self, key: ForwardKey, port: u16) -> LinkResult<ForwardEntry> {
        let instance = self
            .locator
            .locate(key.destination.ip(), &self.zone)
            .await?
            .ok_or_else(|| {
                LinkError::NotFound(format!("no running instance behind {}", key.destination))
            })?;

        let establisher = self.establisher.clone();
        let session_instance = instance.clone();
        let remote_port = key.destination.port();
        let session = tokio::spawn(async move {
            let target = session_instance.to_string();
            match establisher
                .establish(session_instance, port, remote_port)
                .await
            {
                Ok(()) => debug!(key = %key, instance = %target, "session ended"),
                Err(e) => warn!(key = %key, instance = %target, error = %e, "session failed"),
            }
        });

        let local_addr = SocketAddr::new(self.local_ip, port);
        let entry = ForwardEntry {
            key,
            local_addr,
            instance,
            created_at: Instant::now(),
            session,
        };
        // Dropping the entry on failure aborts the session.
        wait_ready(local_addr, self.readiness).await?;
        Ok(entry)
    }

    /// Evict entries whose session has ended, and those older than `max_age`
    /// when given. Returns the evicted keys.
    pub async fn gc(&self, max_age: Option<Duration>) -> Vec<ForwardKey> {
        let mut state = self.state.write().await;
        let stale: Vec<ForwardKey> = state
            .slots
            .iter()
            .filter_map(|(key, slot)| match slot {
                Slot::Ready(entry)
                    if !entry.is_alive() || max_age.is_some_and(|max| entry.age() > max) =>
                {
                    Some(*key)
                }
                _ => None,
            })
            .collect();
        for key in &stale {
            state.evict(key);
        }
        if !stale.is_empty() {
            info!(count = stale.len(), "evicted forwards");
        }
        stale
    }

    /// Abort every session and release every port.
    pub async fn shutdown(&self) {
        let mut state = self.state.write().await;
        let count = state.slots.len();
        state.slots.clear();
        state.ports.clear();
        info!(count, "forward registry shut down");
    }

    pub async fn len(&self) -> usize {
        self.state
            .read()
            .await
            .slots
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn ports_in_use(&self) -> usize {
        self.state.read().await.ports.len()
    }

    pub async fn status(&self) -> Vec<ForwardStatus> {
        let state = self.state.read().await;
        let mut status: Vec<ForwardStatus> = state
            .slots
            .values()
            .filter_map(|slot| match slot {
                Slot::Ready(entry) => Some(ForwardStatus {
                    key: entry.key,
                    local_addr: entry.local_addr,
                    instance: entry.instance.to_string(),
                    alive: entry.is_alive(),
                    age: entry.age(),
                }),
                Slot::Pending { .. } => None,
            })
            .collect();
        status.sort_by_key(|s| s.local_addr.port());
        status
    }
}

/// Wait for the leader's outcome. `None` means the leader was dropped before
/// publishing one.
async fn wait_outcome(mut outcome: watch::Receiver<Option<Outcome>>) -> Option<Outcome> {
    loop {
        let current = outcome.borrow_and_update().clone();
        if current.is_some() {
            return current;
        }
        if outcome.changed().await.is_err() {
            return outcome.borrow().clone();
        }
    }
}
