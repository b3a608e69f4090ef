//! Long-running supervisor
//!
//! Wires the components together and owns the process lifecycle: PID file,
//! initial reconcile, DNS interceptor, control-panel server, and bounded
//! shutdown. Signal handling lives in the binary; the daemon reacts to the
//! cancellation token it is given.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::dns::{Interceptor, QueryHandler, Resolver, Upstream};
use crate::error::BypassError;
use crate::logbuf::LogBuffer;
use crate::netfilter::{AddrSet, IpSet};
use crate::reconcile::Reconciler;
use crate::routing::{self, Mode};
use crate::rules::DomainMatcher;
use crate::store::Store;
use crate::tracker::Tracker;
use crate::web::{self, AppState};

/// How long shutdown waits for the control-panel server
const WEB_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

/// Daemon failure, tagged with the phase it occurred in for exit codes
#[derive(Debug, Error)]
pub enum RunError {
    /// Failure before the daemon was fully up (exit code 1)
    #[error("startup failed: {0}")]
    Startup(#[source] BypassError),

    /// Unrecoverable failure after startup (exit code 2)
    #[error("runtime failure: {0}")]
    Runtime(#[source] BypassError),
}

impl RunError {
    /// Process exit code for this failure
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Startup(_) => 1,
            Self::Runtime(_) => 2,
        }
    }
}

/// The assembled application
pub struct Daemon {
    config: Arc<Config>,
    store: Arc<Store>,
    matcher: Arc<DomainMatcher>,
    tracker: Arc<Tracker>,
    reconciler: Arc<Reconciler>,
    handler: Arc<QueryHandler>,
    logbuf: Arc<LogBuffer>,
}

impl Daemon {
    /// Wire all components from configuration
    #[must_use]
    pub fn new(config: Config, logbuf: Arc<LogBuffer>) -> Self {
        let config = Arc::new(config);

        let store = Arc::new(Store::new(config.bundles_file()));
        let matcher = Arc::new(DomainMatcher::new());

        let set4: Arc<dyn AddrSet> = Arc::new(IpSet::new(config.ipset.table_name.clone()));
        let set6: Option<Arc<dyn AddrSet>> = config
            .ipv6
            .then(|| Arc::new(IpSet::new_v6(config.table_name6())) as Arc<dyn AddrSet>);

        let tracker = Arc::new(Tracker::new(Arc::clone(&set4), set6.clone()));
        let upstream: Arc<dyn Upstream> = Arc::new(Resolver::new(config.upstream_addr()));
        let handler = Arc::new(QueryHandler::new(
            Arc::clone(&matcher),
            Arc::clone(&tracker),
            upstream,
            config.ipv6,
        ));

        let mode: Arc<dyn Mode> = routing::from_config(&config);
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&store),
            Arc::clone(&matcher),
            Arc::clone(&tracker),
            set4,
            set6,
            mode,
        ));

        Self {
            config,
            store,
            matcher,
            tracker,
            reconciler,
            handler,
            logbuf,
        }
    }

    /// The reconciler, for CLI-style invocations sharing the wiring
    #[must_use]
    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// The bundle store
    #[must_use]
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Run until the cancellation token fires.
    ///
    /// # Errors
    ///
    /// `RunError::Startup` when the interceptor cannot bind both
    /// listeners; `RunError::Runtime` when a listener collapses while
    /// running.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), RunError> {
        let _pid_file = PidFile::write(self.config.pid_file());

        if let Err(e) = self.store.ensure_default() {
            warn!(error = %e, "failed to create default bundle");
        }

        // Populate matcher and sets before DNS starts serving.
        if let Err(e) = self.reconciler.reconcile(&cancel).await {
            error!(error = %e, "initial reconcile failed");
        }

        let mut interceptor = Interceptor::start(
            self.config.dns.listen,
            Arc::clone(&self.handler),
            cancel.child_token(),
        )
        .await
        .map_err(|e| RunError::Startup(e.into()))?;

        let state = Arc::new(AppState {
            store: Arc::clone(&self.store),
            reconciler: Arc::clone(&self.reconciler),
            tracker: Arc::clone(&self.tracker),
            matcher: Arc::clone(&self.matcher),
            logbuf: Arc::clone(&self.logbuf),
            cancel: cancel.clone(),
        });
        let web_task = tokio::spawn(web::serve(
            self.config.web.listen,
            state,
            cancel.clone(),
        ));

        info!(version = crate::VERSION, "daemon started");

        let result = tokio::select! {
            () = cancel.cancelled() => Ok(()),
            err = interceptor.wait_failure() => {
                error!(error = %err, "dns interceptor failed");
                cancel.cancel();
                Err(RunError::Runtime(err.into()))
            }
        };

        info!("shutting down");
        if result.is_ok() {
            interceptor.stop().await;
        }

        if tokio::time::timeout(WEB_SHUTDOWN_DEADLINE, web_task)
            .await
            .is_err()
        {
            warn!("control panel shutdown deadline exceeded");
        }

        info!("shutdown complete");
        result
    }
}

/// PID file that is removed when dropped
struct PidFile {
    path: PathBuf,
}

impl PidFile {
    fn write(path: PathBuf) -> Self {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).ok();
        }
        if let Err(e) = fs::write(&path, format!("{}\n", std::process::id())) {
            warn!(path = %path.display(), error = %e, "failed to write pid file");
        }
        Self { path }
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        fs::remove_file(&self.path).ok();
    }
}
