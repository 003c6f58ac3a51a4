//! Forwarding sessions over the pod port-forward subresource.
//!
//! A session owns a loopback listener. Every accepted connection gets its own
//! port-forward stream to the pod, relayed until either side closes. Relays
//! live in a `JoinSet` owned by the session, so aborting the session tears
//! them all down.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::Client;
use kubelink_core::{Establisher, Instance, LinkError, LinkResult};
use std::net::{Ipv4Addr, SocketAddr};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct PodPortForwarder {
    client: Client,
}

impl PodPortForwarder {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Establisher for PodPortForwarder {
    async fn establish(
        &self,
        instance: Instance,
        local_port: u16,
        remote_port: u16,
    ) -> LinkResult<()> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, local_port)).await?;
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &instance.namespace);
        info!(
            instance = %instance,
            local_port,
            remote_port,
            "port-forward listening"
        );

        let mut relays = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (conn, peer) = accepted?;
                    let pods = pods.clone();
                    let name = instance.name.clone();
                    relays.spawn(async move {
                        if let Err(e) = relay(pods, &name, remote_port, conn).await {
                            warn!(peer = %peer, pod = %name, port = remote_port, error = %e, "relay failed");
                        }
                    });
                }
                Some(done) = relays.join_next(), if !relays.is_empty() => {
                    if let Err(e) = done {
                        warn!(error = %e, "relay task ended abnormally");
                    }
                }
            }
        }
    }
}

async fn relay(pods: Api<Pod>, name: &str, port: u16, mut conn: TcpStream) -> LinkResult<()> {
    let peer: Option<SocketAddr> = conn.peer_addr().ok();
    let mut forwarder = pods
        .portforward(name, &[port])
        .await
        .map_err(|e| LinkError::Session(format!("open port-forward to {name}:{port}: {e}")))?;
    let mut upstream = forwarder
        .take_stream(port)
        .ok_or_else(|| LinkError::Session(format!("no stream for port {port}")))?;

    let (sent, received) = tokio::io::copy_bidirectional(&mut conn, &mut upstream).await?;
    debug!(peer = ?peer, pod = name, port, sent, received, "relay closed");

    drop(upstream);
    forwarder
        .join()
        .await
        .map_err(|e| LinkError::Session(format!("port-forward to {name}:{port}: {e}")))
}
