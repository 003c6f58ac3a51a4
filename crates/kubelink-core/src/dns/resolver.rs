//! Reverse lookups against the cluster DNS endpoint.
//!
//! Queries go over TCP through hickory's client stream so large answers are
//! never truncated. One request, one response; retry policy is left to
//! callers.

use crate::codec::{self, Zone};
use crate::error::{LinkError, LinkResult};
use async_trait::async_trait;
use futures_util::StreamExt;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use hickory_proto::runtime::{TokioRuntimeProvider, TokioTime};
use hickory_proto::tcp::TcpClientStream;
use hickory_proto::xfer::{DnsExchange, DnsHandle, DnsMultiplexer, DnsRequest, DnsRequestOptions};
use hickory_proto::ProtoError;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

/// Default timeout for a single DNS exchange.
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Anything that can turn an address back into a name.
///
/// An empty string means the upstream had no answer; transport failures are
/// errors.
#[async_trait]
pub trait ReverseResolver: Send + Sync {
    async fn reverse_lookup(&self, ip: IpAddr) -> LinkResult<String>;
}

/// PTR resolver bound to one upstream DNS endpoint.
#[derive(Debug, Clone)]
pub struct DnsResolver {
    upstream: SocketAddr,
    timeout: Duration,
}

impl DnsResolver {
    pub fn new(upstream: SocketAddr) -> Self {
        Self {
            upstream,
            timeout: DEFAULT_EXCHANGE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Resolve `probe` and take the zone from the answer.
    ///
    /// A transport failure is returned rather than defaulted so startup can
    /// stop instead of misrouting every later lookup.
    pub async fn discover_zone(&self, probe: IpAddr) -> LinkResult<Zone> {
        let name = self.reverse_lookup(probe).await?;
        let zone = codec::extract_zone(&name);
        debug!(probe = %probe, name = %name, zone = %zone, "discovered cluster zone");
        Ok(zone)
    }
}

#[async_trait]
impl ReverseResolver for DnsResolver {
    async fn reverse_lookup(&self, ip: IpAddr) -> LinkResult<String> {
        let query = Query::query(reverse_name(ip)?, RecordType::PTR);
        let mut request = Message::new();
        request
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .add_query(query);

        let response = exchange(self.upstream, request, self.timeout).await?;

        let name = response
            .answers()
            .iter()
            .find_map(|record| match record.data() {
                RData::PTR(ptr) => Some(ptr.0.to_string()),
                _ => None,
            })
            .unwrap_or_default();

        let name = name.strip_suffix('.').unwrap_or(&name).to_string();
        debug!(ip = %ip, name = %name, "reverse lookup");
        Ok(name)
    }
}

/// Build the `in-addr.arpa` / `ip6.arpa` name for `ip`.
pub fn reverse_name(ip: IpAddr) -> LinkResult<Name> {
    let text = match ip {
        IpAddr::V4(v4) => {
            let [a, b, c, d] = v4.octets();
            format!("{d}.{c}.{b}.{a}.in-addr.arpa.")
        }
        IpAddr::V6(v6) => {
            let mut labels = String::with_capacity(72);
            for byte in v6.octets().iter().rev() {
                labels.push_str(&format!("{:x}.{:x}.", byte & 0x0f, byte >> 4));
            }
            labels.push_str("ip6.arpa.");
            labels
        }
    };
    Ok(Name::from_str(&text)?)
}

/// Send one message to `upstream` over a fresh TCP connection and wait for
/// its answer. The multiplexer assigns its own message id and matches the
/// response against it.
pub async fn exchange(
    upstream: SocketAddr,
    request: Message,
    timeout: Duration,
) -> LinkResult<Message> {
    let (connect, stream_handle) =
        TcpClientStream::new(upstream, None, Some(timeout), TokioRuntimeProvider::new());
    let multiplexer = DnsMultiplexer::with_timeout(connect, stream_handle, timeout, None);
    let (client, background) = DnsExchange::connect::<_, _, TokioTime>(multiplexer)
        .await
        .map_err(|e| transport_error(upstream, e))?;
    let background = tokio::spawn(background);

    let response = client
        .send(DnsRequest::new(request, DnsRequestOptions::default()))
        .next()
        .await;
    background.abort();

    match response {
        Some(Ok(response)) => Ok(response.into_message()),
        Some(Err(e)) => Err(transport_error(upstream, e)),
        None => {
            warn!(upstream = %upstream, "dns exchange timed out");
            Err(LinkError::Transport(format!("{upstream}: timed out")))
        }
    }
}

fn transport_error(upstream: SocketAddr, e: ProtoError) -> LinkError {
    warn!(upstream = %upstream, error = %e, "dns exchange failed");
    LinkError::Transport(format!("{upstream}: {e}"))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use hickory_proto::rr::rdata::PTR;
    use hickory_proto::rr::Record;
    use std::net::{Ipv4Addr, Ipv6Addr};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one TCP DNS exchange per accepted connection, answering PTR
    /// queries with `answer` (or nothing).
    pub(crate) async fn spawn_ptr_server(answer: Option<&'static str>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut len_buf = [0u8; 2];
                    stream.read_exact(&mut len_buf).await.unwrap();
                    let mut buf = vec![0u8; u16::from_be_bytes(len_buf) as usize];
                    stream.read_exact(&mut buf).await.unwrap();
                    let request = Message::from_vec(&buf).unwrap();

                    let mut response = Message::new();
                    response
                        .set_id(request.id())
                        .set_message_type(MessageType::Response)
                        .set_op_code(OpCode::Query);
                    for query in request.queries() {
                        response.add_query(query.clone());
                    }
                    if let (Some(answer), Some(query)) = (answer, request.queries().first()) {
                        let target = Name::from_str(answer).unwrap();
                        response.add_answer(Record::from_rdata(
                            query.name().clone(),
                            30,
                            RData::PTR(PTR(target)),
                        ));
                    }
                    let wire = response.to_vec().unwrap();
                    let mut framed = (wire.len() as u16).to_be_bytes().to_vec();
                    framed.extend_from_slice(&wire);
                    stream.write_all(&framed).await.unwrap();
                });
            }
        });
        addr
    }

    #[test]
    fn test_reverse_name_v4() {
        let name = reverse_name(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))).unwrap();
        assert_eq!(name.to_string(), "5.0.0.10.in-addr.arpa.");
    }

    #[test]
    fn test_reverse_name_v6() {
        let name = reverse_name(IpAddr::V6(Ipv6Addr::LOCALHOST)).unwrap();
        let text = name.to_string();
        assert!(text.starts_with("1.0.0.0."));
        assert!(text.ends_with(".ip6.arpa."));
        assert_eq!(text.matches('.').count(), 34);
    }

    #[tokio::test]
    async fn test_reverse_lookup_strips_root_label() {
        let upstream = spawn_ptr_server(Some("web.default.svc.cluster.local.")).await;
        let resolver = DnsResolver::new(upstream);
        let name = resolver
            .reverse_lookup("10.96.0.12".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(name, "web.default.svc.cluster.local");
    }

    #[tokio::test]
    async fn test_reverse_lookup_without_answer_is_empty() {
        let upstream = spawn_ptr_server(None).await;
        let resolver = DnsResolver::new(upstream);
        let name = resolver
            .reverse_lookup("10.96.0.12".parse().unwrap())
            .await
            .unwrap();
        assert!(name.is_empty());
    }

    #[tokio::test]
    async fn test_reverse_lookup_transport_error() {
        // Bind and drop to get a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let resolver = DnsResolver::new(addr).with_timeout(Duration::from_secs(2));
        let err = resolver
            .reverse_lookup("10.0.0.1".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Transport(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_discover_zone() {
        let upstream = spawn_ptr_server(Some("10-0-0-9.dns.kube-system.pod.corp.example.")).await;
        let zone = DnsResolver::new(upstream)
            .discover_zone("10.0.0.9".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(zone.as_str(), "corp.example");
    }

    #[tokio::test]
    async fn test_discover_zone_defaults_without_marker() {
        let upstream = spawn_ptr_server(None).await;
        let zone = DnsResolver::new(upstream)
            .discover_zone("10.0.0.9".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(zone, Zone::default());
    }
}
