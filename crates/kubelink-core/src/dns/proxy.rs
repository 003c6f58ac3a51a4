//! UDP front-end that relays queries to the cluster DNS endpoint over TCP.

use super::resolver::{exchange, DEFAULT_EXCHANGE_TIMEOUT};
use crate::error::LinkResult;
use hickory_proto::op::{Message, MessageType, OpCode};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

/// Largest datagram accepted from a client.
const MAX_DATAGRAM: usize = 4096;

/// A bound passthrough proxy. Call [`DnsProxy::serve`] to start answering.
pub struct DnsProxy {
    socket: Arc<UdpSocket>,
    upstream: SocketAddr,
    timeout: Duration,
}

impl DnsProxy {
    pub async fn bind(listen: SocketAddr, upstream: SocketAddr) -> LinkResult<Self> {
        let socket = UdpSocket::bind(listen).await?;
        Ok(Self {
            socket: Arc::new(socket),
            upstream,
            timeout: DEFAULT_EXCHANGE_TIMEOUT,
        })
    }

    pub fn local_addr(&self) -> LinkResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Answer queries until the socket fails. Each query is handled on its
    /// own task; a failed exchange drops that query only.
    pub async fn serve(self) -> LinkResult<()> {
        info!(listen = %self.local_addr()?, upstream = %self.upstream, "dns proxy started");
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (n, client) = self.socket.recv_from(&mut buf).await?;
            let packet = buf[..n].to_vec();
            let socket = self.socket.clone();
            let upstream = self.upstream;
            let timeout = self.timeout;
            tokio::spawn(async move {
                if let Err(e) = relay(&socket, client, &packet, upstream, timeout).await {
                    warn!(client = %client, error = %e, "dns proxy query dropped");
                }
            });
        }
    }
}

async fn relay(
    socket: &UdpSocket,
    client: SocketAddr,
    packet: &[u8],
    upstream: SocketAddr,
    timeout: Duration,
) -> LinkResult<()> {
    let query = Message::from_vec(packet)?;
    let Some(question) = query.queries().first() else {
        debug!(client = %client, "query without question ignored");
        return Ok(());
    };

    let mut request = Message::new();
    request
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(question.clone());

    let mut response = exchange(upstream, request, timeout).await?;
    response.set_id(query.id());
    socket.send_to(&response.to_vec()?, client).await?;
    debug!(client = %client, name = %question.name(), "dns proxy answered");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::resolver::tests::spawn_ptr_server;
    use hickory_proto::op::Query;
    use hickory_proto::rr::{Name, RData, RecordType};
    use std::str::FromStr;

    #[tokio::test]
    async fn test_proxy_relays_answer() {
        let upstream = spawn_ptr_server(Some("web.default.svc.cluster.local.")).await;
        let proxy = DnsProxy::bind("127.0.0.1:0".parse().unwrap(), upstream)
            .await
            .unwrap();
        let proxy_addr = proxy.local_addr().unwrap();
        tokio::spawn(proxy.serve());

        let mut query = Message::new();
        query
            .set_id(4242)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .add_query(Query::query(
                Name::from_str("12.0.96.10.in-addr.arpa.").unwrap(),
                RecordType::PTR,
            ));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(&query.to_vec().unwrap(), proxy_addr)
            .await
            .unwrap();

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .expect("proxy answered")
            .unwrap();
        let response = Message::from_vec(&buf[..n]).unwrap();
        assert_eq!(response.id(), 4242);
        match response.answers()[0].data() {
            RData::PTR(ptr) => assert_eq!(ptr.0.to_string(), "web.default.svc.cluster.local."),
            other => panic!("unexpected answer {other:?}"),
        }
    }
}
