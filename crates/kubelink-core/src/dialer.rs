//! Outbound dialing for intercepted flows.
//!
//! TCP destinations are routed through the [`ForwardRegistry`]: the dialer
//! asks for the local session address and connects there instead of the
//! remote address. UDP is not tunneled; `dial_udp` hands back an unconnected
//! socket for the stack to use directly.

use crate::error::{LinkError, LinkResult};
use crate::forward::{ForwardKey, ForwardRegistry, Protocol};
use socket2::{SockRef, TcpKeepalive};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream, UdpSocket};
use tokio::sync::watch;
use tracing::{debug, warn};

pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(30);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Socket options applied to every dialed TCP stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialOptions {
    /// `None` disables keepalive probes.
    pub keepalive: Option<Duration>,
    pub connect_timeout: Duration,
    pub nodelay: bool,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            keepalive: Some(DEFAULT_KEEPALIVE),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            nodelay: true,
        }
    }
}

impl DialOptions {
    pub fn validate(&self) -> LinkResult<()> {
        if let Some(keepalive) = self.keepalive {
            if keepalive < Duration::from_secs(1) {
                return Err(LinkError::Config(format!(
                    "keepalive must be at least 1s, got {keepalive:?}"
                )));
            }
        }
        if self.connect_timeout.is_zero() {
            return Err(LinkError::Config("connect timeout must be non-zero".into()));
        }
        Ok(())
    }
}

pub struct TunnelDialer {
    registry: Arc<ForwardRegistry>,
    options: watch::Sender<DialOptions>,
}

impl TunnelDialer {
    pub fn new(registry: Arc<ForwardRegistry>) -> Self {
        Self {
            registry,
            options: watch::Sender::new(DialOptions::default()),
        }
    }

    pub fn registry(&self) -> &Arc<ForwardRegistry> {
        &self.registry
    }

    pub fn options(&self) -> DialOptions {
        *self.options.borrow()
    }

    /// Replace the options used for subsequent dials.
    pub fn set_options(&self, options: DialOptions) -> LinkResult<()> {
        options.validate()?;
        self.options.send_replace(options);
        Ok(())
    }

    /// Open a stream to `destination` via its forwarding session.
    pub async fn dial_tcp(&self, destination: SocketAddr) -> LinkResult<TcpStream> {
        let key = ForwardKey::new(Protocol::Tcp, destination);
        let local = self.registry.resolve_or_establish(key).await?;
        let options = self.options();
        let stream = connect(local, options).await?;
        debug!(destination = %destination, local = %local, "dialed via forward");
        Ok(stream)
    }

    /// Open a datagram socket for `destination`. The socket is bound to an
    /// ephemeral port of the destination's family and left unconnected.
    pub async fn dial_udp(&self, destination: SocketAddr) -> LinkResult<UdpSocket> {
        let bind = match destination {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        };
        let socket = UdpSocket::bind(bind).await?;
        debug!(destination = %destination, local = ?socket.local_addr().ok(), "udp socket opened");
        Ok(socket)
    }
}

async fn connect(addr: SocketAddr, options: DialOptions) -> LinkResult<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_nodelay(options.nodelay)?;
    let stream = tokio::time::timeout(options.connect_timeout, socket.connect(addr))
        .await
        .map_err(|_| {
            LinkError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("connect to {addr} timed out"),
            ))
        })??;

    if let Some(period) = options.keepalive {
        let sock = SockRef::from(&stream);
        let keepalive = TcpKeepalive::new().with_time(period).with_interval(period);
        if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
            warn!(addr = %addr, error = %e, "failed to set tcp keepalive");
        }
    }
    Ok(stream)
}
