//! TCP DNS listener
//!
//! RFC 1035 framing: each message is preceded by a 2-byte big-endian
//! length. A connection may carry multiple queries; it is closed on idle
//! timeout, client EOF, or cancellation.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::error::{DnsError, DnsResult};
use super::handler::QueryHandler;

/// Largest framed message accepted from a client
const MAX_TCP_MESSAGE_SIZE: usize = 65_535;

/// Idle read timeout per connection
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// TCP listener for the interceptor
pub struct TcpServer {
    listener: TcpListener,
    handler: Arc<QueryHandler>,
    local_addr: SocketAddr,
}

impl TcpServer {
    /// Bind the listener. Binding succeeding is the readiness signal.
    pub async fn bind(addr: SocketAddr, handler: Arc<QueryHandler>) -> DnsResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| DnsError::network_io(format!("failed to bind TCP DNS socket {addr}"), e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| DnsError::network_io("failed to read local address", e))?;

        info!(addr = %local_addr, "TCP DNS listener bound");
        Ok(Self {
            listener,
            handler,
            local_addr,
        })
    }

    /// The bound address
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until cancellation, one task per connection.
    pub async fn run(&self, cancel: CancellationToken) -> DnsResult<()> {
        loop {
            let (stream, peer) = tokio::select! {
                result = self.listener.accept() => match result {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "TCP accept failed");
                        continue;
                    }
                },
                () = cancel.cancelled() => {
                    info!(addr = %self.local_addr, "TCP DNS listener stopping");
                    return Ok(());
                }
            };

            trace!(peer = %peer, "accepted TCP DNS connection");
            let handler = Arc::clone(&self.handler);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_connection(stream, handler, cancel).await {
                    debug!(peer = %peer, error = %e, "TCP DNS connection ended");
                }
            });
        }
    }
}

/// Serve framed queries on one connection until EOF, timeout, or
/// cancellation.
async fn serve_connection(
    mut stream: TcpStream,
    handler: Arc<QueryHandler>,
    cancel: CancellationToken,
) -> DnsResult<()> {
    loop {
        let mut len_buf = [0u8; 2];
        let read = tokio::select! {
            read = timeout(READ_TIMEOUT, stream.read_exact(&mut len_buf)) => read,
            () = cancel.cancelled() => return Ok(()),
        };
        match read {
            Ok(Ok(_)) => {}
            // Client closed the connection or went away.
            Ok(Err(_)) => return Ok(()),
            Err(_) => return Ok(()),
        }

        let msg_len = usize::from(u16::from_be_bytes(len_buf));
        if msg_len == 0 || msg_len > MAX_TCP_MESSAGE_SIZE {
            return Err(DnsError::parse(format!("invalid TCP frame length {msg_len}")));
        }

        let mut payload = vec![0u8; msg_len];
        stream
            .read_exact(&mut payload)
            .await
            .map_err(|e| DnsError::network_io("failed to read TCP query", e))?;

        if let Some(response) = handler.handle(&cancel, &payload).await {
            let len = u16::try_from(response.len())
                .map_err(|_| DnsError::serialize("response exceeds TCP frame size"))?;
            stream
                .write_all(&len.to_be_bytes())
                .await
                .map_err(|e| DnsError::network_io("failed to write TCP length prefix", e))?;
            stream
                .write_all(&response)
                .await
                .map_err(|e| DnsError::network_io("failed to write TCP response", e))?;
        }
    }
}
