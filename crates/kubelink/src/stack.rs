//! `redirect` driver: a TCP listener fed by netfilter `REDIRECT` rules.
//!
//! Each accepted connection's original destination is recovered from the
//! socket and dialed through the [`TunnelDialer`]; bytes are relayed until
//! either side closes. Routing traffic to the listener is left to the
//! operator's `pre_up`/`post_up` hooks.

use crate::original_dst::original_destination;
use async_trait::async_trait;
use kubelink_core::engine::{DeviceSpec, NetStack, StackBuilder, DEFAULT_DRIVER};
use kubelink_core::{LinkError, LinkResult, TunnelDialer};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Recovers where an accepted connection was originally headed.
pub type DestinationLookup = fn(&TcpStream) -> io::Result<SocketAddr>;

pub struct RedirectStackBuilder {
    lookup: DestinationLookup,
}

impl RedirectStackBuilder {
    pub fn new() -> Self {
        Self {
            lookup: original_destination,
        }
    }

    #[cfg(test)]
    fn with_lookup(lookup: DestinationLookup) -> Self {
        Self { lookup }
    }
}

impl Default for RedirectStackBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StackBuilder for RedirectStackBuilder {
    fn driver(&self) -> &str {
        DEFAULT_DRIVER
    }

    async fn build(
        &self,
        device: &DeviceSpec,
        dialer: Arc<TunnelDialer>,
    ) -> LinkResult<Box<dyn NetStack>> {
        let addr: SocketAddr = device.name.parse().map_err(|e| {
            LinkError::Config(format!("redirect device {:?}: {e}", device.name))
        })?;
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "redirect stack listening");

        let (cancel_tx, cancel_rx) = mpsc::channel::<()>(1);
        let lookup = self.lookup;
        let task = tokio::spawn(async move {
            accept_loop(listener, local_addr, cancel_rx, dialer, lookup).await;
            debug!(addr = %local_addr, "accept loop ended");
        });

        Ok(Box::new(RedirectStack {
            local_addr,
            cancel_tx: Some(cancel_tx),
            task: Some(task),
        }))
    }
}

pub struct RedirectStack {
    local_addr: SocketAddr,
    cancel_tx: Option<mpsc::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl RedirectStack {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl NetStack for RedirectStack {
    fn describe(&self) -> String {
        format!("{DEFAULT_DRIVER}://{}", self.local_addr)
    }

    fn close(&mut self) {
        if let Some(tx) = self.cancel_tx.take() {
            let _ = tx.try_send(());
        }
    }

    async fn wait(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "redirect stack task failed");
            }
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    local_addr: SocketAddr,
    mut cancel_rx: mpsc::Receiver<()>,
    dialer: Arc<TunnelDialer>,
    lookup: DestinationLookup,
) {
    let mut conns = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel_rx.recv() => {
                info!(addr = %local_addr, open = conns.len(), "redirect stack closing");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let destination = match lookup(&stream) {
                    Ok(dst) if is_listener(dst, local_addr) => {
                        warn!(peer = %peer, "connection was not redirected, dropping");
                        continue;
                    }
                    Ok(dst) => dst,
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "no original destination, dropping");
                        continue;
                    }
                };
                let dialer = dialer.clone();
                conns.spawn(async move {
                    if let Err(e) = relay(stream, destination, &dialer).await {
                        warn!(peer = %peer, destination = %destination, error = %e, "connection failed");
                    }
                });
            }
            Some(done) = conns.join_next(), if !conns.is_empty() => {
                if let Err(e) = done {
                    warn!(error = %e, "connection task ended abnormally");
                }
            }
        }
    }
    conns.shutdown().await;
}

/// Whether `dst` names the listener itself, i.e. the connection reached it
/// directly rather than through a redirect rule.
fn is_listener(dst: SocketAddr, listener: SocketAddr) -> bool {
    dst.port() == listener.port() && (listener.ip().is_unspecified() || dst.ip() == listener.ip())
}

async fn relay(
    mut inbound: TcpStream,
    destination: SocketAddr,
    dialer: &TunnelDialer,
) -> LinkResult<()> {
    let mut outbound = dialer.dial_tcp(destination).await?;
    let (sent, received) = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await?;
    debug!(destination = %destination, sent, received, "connection closed");
    Ok(())
}
