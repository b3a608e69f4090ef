//! In-process recursive DNS interceptor
//!
//! Serves DNS on the configured endpoint over both UDP and TCP, forwards
//! every query to the upstream encrypted resolver, and harvests the
//! resolved addresses of matched names into the kernel address sets via the
//! tracker. The interceptor is stateless with respect to answers: it keeps
//! no cache and ignores TTLs.

pub mod error;
pub mod handler;
pub mod tcp;
pub mod udp;
pub mod upstream;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use error::{DnsError, DnsResult};
pub use handler::QueryHandler;
pub use tcp::TcpServer;
pub use udp::UdpServer;
pub use upstream::{Resolver, Upstream, DEFAULT_EXCHANGE_TIMEOUT};

/// How long shutdown waits for the listener tasks
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

/// Running UDP + TCP interceptor
pub struct Interceptor {
    cancel: CancellationToken,
    udp_task: JoinHandle<DnsResult<()>>,
    tcp_task: JoinHandle<DnsResult<()>>,
    local_addr: SocketAddr,
}

impl Interceptor {
    /// Bind both listeners and start serving.
    ///
    /// Both sockets are bound before either loop starts; if either bind
    /// fails nothing is left running and the error is returned. Returning
    /// `Ok` means both listeners are ready.
    pub async fn start(
        listen: SocketAddr,
        handler: Arc<QueryHandler>,
        cancel: CancellationToken,
    ) -> DnsResult<Self> {
        let udp = UdpServer::bind(listen, Arc::clone(&handler)).await?;
        // Bind TCP to the address UDP actually got, so an ephemeral port in
        // tests lands both listeners on the same endpoint.
        let tcp = TcpServer::bind(udp.local_addr(), handler).await?;
        let local_addr = udp.local_addr();

        let udp_cancel = cancel.clone();
        let udp_task = tokio::spawn(async move { udp.run(udp_cancel).await });
        let tcp_cancel = cancel.clone();
        let tcp_task = tokio::spawn(async move { tcp.run(tcp_cancel).await });

        info!(addr = %local_addr, "dns interceptor started");
        Ok(Self {
            cancel,
            udp_task,
            tcp_task,
            local_addr,
        })
    }

    /// The listen address both servers are bound to
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for a listener task to end before shutdown was requested.
    ///
    /// The listener loops only return on cancellation, so completion here
    /// means a collapse (panic or unexpected exit) the supervisor should
    /// treat as a runtime failure.
    pub async fn wait_failure(&mut self) -> DnsError {
        let (listener, result) = tokio::select! {
            result = &mut self.udp_task => ("udp", result),
            result = &mut self.tcp_task => ("tcp", result),
        };
        match result {
            Ok(Ok(())) => DnsError::NetworkError {
                reason: format!("{listener} listener exited unexpectedly"),
                source: None,
            },
            Ok(Err(e)) => e,
            Err(e) => DnsError::NetworkError {
                reason: format!("{listener} listener task failed: {e}"),
                source: None,
            },
        }
    }

    /// Stop both listeners, waiting up to the shutdown deadline.
    pub async fn stop(self) {
        self.cancel.cancel();
        let join = async {
            let _ = self.udp_task.await;
            let _ = self.tcp_task.await;
        };
        if tokio::time::timeout(SHUTDOWN_DEADLINE, join).await.is_err() {
            warn!("dns interceptor shutdown deadline exceeded");
        } else {
            info!("dns interceptor stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netfilter::testutil::MockAddrSet;
    use crate::rules::DomainMatcher;
    use crate::tracker::Tracker;

    fn test_handler() -> Arc<QueryHandler> {
        let matcher = Arc::new(DomainMatcher::new());
        let tracker = Arc::new(Tracker::new(MockAddrSet::new("bypass"), None));
        let upstream: Arc<dyn Upstream> =
            Arc::new(Resolver::new("127.0.0.1:1".parse().unwrap()));
        Arc::new(QueryHandler::new(matcher, tracker, upstream, false))
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let cancel = CancellationToken::new();
        let interceptor = Interceptor::start(
            "127.0.0.1:0".parse().unwrap(),
            test_handler(),
            cancel,
        )
        .await
        .unwrap();

        assert_ne!(interceptor.local_addr().port(), 0);
        interceptor.stop().await;
    }

    #[tokio::test]
    async fn test_start_fails_when_port_taken_by_tcp() {
        // Occupy a TCP port, leave UDP free: the TCP bind must fail and
        // startup must report it.
        let blocker = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = blocker.local_addr().unwrap();

        let cancel = CancellationToken::new();
        let result = Interceptor::start(addr, test_handler(), cancel).await;
        assert!(result.is_err());
    }
}
