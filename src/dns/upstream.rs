//! Upstream resolver exchange
//!
//! Every intercepted query is forwarded to the upstream resolver over UDP;
//! a truncated answer triggers a retry over TCP with RFC 1035 2-byte length
//! framing. The exchange is stateless: each UDP query uses a fresh socket,
//! each TCP retry a fresh connection.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error::{DnsError, DnsResult};

/// Receive buffer for UDP answers (accommodates EDNS0 payloads)
const UDP_RECV_BUFFER_SIZE: usize = 4096;

/// Largest TCP-framed message we will read back
const MAX_TCP_MESSAGE_SIZE: usize = 65_535;

/// Default per-exchange timeout
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

/// A resolver the interceptor can exchange queries with.
///
/// The production implementation is [`Resolver`]; handler tests substitute
/// canned implementations.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Forward a query and return the upstream's response
    async fn exchange(&self, cancel: &CancellationToken, query: &Message) -> DnsResult<Message>;
}

/// UDP-first upstream client with TCP retry on truncation
#[derive(Debug, Clone)]
pub struct Resolver {
    addr: SocketAddr,
    timeout: Duration,
}

impl Resolver {
    /// Create a resolver client for the given upstream address
    #[must_use]
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            timeout: DEFAULT_EXCHANGE_TIMEOUT,
        }
    }

    /// Override the per-exchange timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The upstream address
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn exchange_udp(&self, query_bytes: &[u8], id: u16) -> DnsResult<Message> {
        let bind_addr: SocketAddr = if self.addr.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| DnsError::network_io("failed to bind upstream UDP socket", e))?;

        socket.send_to(query_bytes, self.addr).await.map_err(|e| {
            DnsError::network_io(format!("failed to send UDP query to {}", self.addr), e)
        })?;

        let mut buf = vec![0u8; UDP_RECV_BUFFER_SIZE];
        loop {
            let (len, src) = socket.recv_from(&mut buf).await.map_err(|e| {
                DnsError::network_io(format!("failed to receive from {}", self.addr), e)
            })?;
            if src != self.addr {
                debug!(src = %src, expected = %self.addr, "ignoring response from unexpected source");
                continue;
            }
            let response = Message::from_vec(&buf[..len])
                .map_err(|e| DnsError::parse(format!("upstream UDP response: {e}")))?;
            if response.id() != id {
                debug!(got = response.id(), want = id, "ignoring response with mismatched id");
                continue;
            }
            return Ok(response);
        }
    }

    async fn exchange_tcp(&self, query_bytes: &[u8], id: u16) -> DnsResult<Message> {
        let mut stream = TcpStream::connect(self.addr).await.map_err(|e| {
            DnsError::network_io(format!("failed to connect to {}", self.addr), e)
        })?;
        stream.set_nodelay(true).ok();

        let len = u16::try_from(query_bytes.len())
            .map_err(|_| DnsError::serialize("query exceeds TCP frame size"))?;
        stream
            .write_all(&len.to_be_bytes())
            .await
            .map_err(|e| DnsError::network_io("failed to write TCP length prefix", e))?;
        stream
            .write_all(query_bytes)
            .await
            .map_err(|e| DnsError::network_io("failed to write TCP query", e))?;

        let mut len_buf = [0u8; 2];
        stream
            .read_exact(&mut len_buf)
            .await
            .map_err(|e| DnsError::network_io("failed to read TCP length prefix", e))?;
        let resp_len = usize::from(u16::from_be_bytes(len_buf));
        if resp_len == 0 || resp_len > MAX_TCP_MESSAGE_SIZE {
            return Err(DnsError::upstream(
                self.addr.to_string(),
                format!("invalid TCP response length {resp_len}"),
            ));
        }

        let mut resp_buf = vec![0u8; resp_len];
        stream
            .read_exact(&mut resp_buf)
            .await
            .map_err(|e| DnsError::network_io("failed to read TCP response", e))?;

        let response = Message::from_vec(&resp_buf)
            .map_err(|e| DnsError::parse(format!("upstream TCP response: {e}")))?;
        if response.id() != id {
            return Err(DnsError::upstream(
                self.addr.to_string(),
                "TCP response id mismatch",
            ));
        }
        Ok(response)
    }

    async fn exchange_inner(&self, query: &Message) -> DnsResult<Message> {
        let query_bytes = query
            .to_vec()
            .map_err(|e| DnsError::serialize(format!("failed to encode query: {e}")))?;

        let response = self.exchange_udp(&query_bytes, query.id()).await?;
        if !response.truncated() {
            return Ok(response);
        }

        debug!(upstream = %self.addr, "UDP answer truncated, retrying over TCP");
        self.exchange_tcp(&query_bytes, query.id()).await
    }
}

#[async_trait]
impl Upstream for Resolver {
    async fn exchange(&self, cancel: &CancellationToken, query: &Message) -> DnsResult<Message> {
        tokio::select! {
            result = timeout(self.timeout, self.exchange_inner(query)) => match result {
                Ok(result) => result,
                Err(_) => Err(DnsError::timeout(
                    format!("exchange with {}", self.addr),
                    self.timeout,
                )),
            },
            () = cancel.cancelled() => Err(DnsError::ShuttingDown),
        }
    }
}
