//! UDP DNS listener
//!
//! Binds the configured endpoint and handles each inbound datagram in its
//! own task. The receive loop runs until the cancellation token fires.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::error::{DnsError, DnsResult};
use super::handler::QueryHandler;

/// Maximum DNS message size over UDP (with EDNS0)
const MAX_UDP_MESSAGE_SIZE: usize = 4096;

/// UDP listener for the interceptor
pub struct UdpServer {
    socket: Arc<UdpSocket>,
    handler: Arc<QueryHandler>,
    local_addr: SocketAddr,
}

impl UdpServer {
    /// Bind the listener. Binding succeeding is the readiness signal.
    pub async fn bind(addr: SocketAddr, handler: Arc<QueryHandler>) -> DnsResult<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| DnsError::network_io(format!("failed to bind UDP DNS socket {addr}"), e))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| DnsError::network_io("failed to read local address", e))?;

        info!(addr = %local_addr, "UDP DNS listener bound");
        Ok(Self {
            socket: Arc::new(socket),
            handler,
            local_addr,
        })
    }

    /// The bound address
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Receive datagrams until cancellation, spawning one task per query.
    pub async fn run(&self, cancel: CancellationToken) -> DnsResult<()> {
        let mut buf = vec![0u8; MAX_UDP_MESSAGE_SIZE];
        loop {
            let (len, src) = tokio::select! {
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "UDP recv failed");
                        continue;
                    }
                },
                () = cancel.cancelled() => {
                    info!(addr = %self.local_addr, "UDP DNS listener stopping");
                    return Ok(());
                }
            };

            trace!(src = %src, len, "received UDP query");
            let payload = buf[..len].to_vec();
            let socket = Arc::clone(&self.socket);
            let handler = Arc::clone(&self.handler);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if let Some(response) = handler.handle(&cancel, &payload).await {
                    if let Err(e) = socket.send_to(&response, src).await {
                        debug!(dst = %src, error = %e, "failed to send UDP response");
                    }
                }
            });
        }
    }
}
