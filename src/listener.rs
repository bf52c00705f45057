//! Top-level listener context (spec.md §2 "Worker pool binding", §5
//! "Scheduling"): binds the primary client-facing listener, owns the
//! process-wide singletons (CA, cert forge, session caches, worker pool),
//! and accepts connections, pinning each one to a worker at accept time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::cert::{CertForge, CertificateAuthority, SessionCaches, TargetCertDir};
use crate::config::Config;
use crate::connection;
use crate::worker::WorkerPool;

/// Everything a connection (and its mirror children) needs for the
/// lifetime of one interception, shared read-only after startup.
pub struct ListenerContext {
    pub config: Config,
    pub ca: Arc<CertificateAuthority>,
    pub forge: Arc<CertForge>,
    pub session_caches: Arc<SessionCaches>,
    pub workers: WorkerPool,
    next_conn_id: AtomicU64,
}

impl ListenerContext {
    pub fn new(config: Config) -> Result<Self> {
        let ca = Arc::new(
            CertificateAuthority::load_or_generate(&config.ca_dir).context("Failed to initialize CA")?,
        );

        let target_dir = config
            .target_cert_dir
            .as_ref()
            .map(|dir| TargetCertDir::new(dir.clone(), ca.ca_cert_der()));

        let forge = Arc::new(CertForge::new(ca.clone(), target_dir));
        let session_caches = Arc::new(SessionCaches::new());
        let workers = WorkerPool::new(config.workers).context("Failed to start worker pool")?;

        Ok(Self {
            config,
            ca,
            forge,
            session_caches,
            workers,
            next_conn_id: AtomicU64::new(1),
        })
    }

    pub fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Accept loop for the primary client-facing listener. Each accepted
/// socket is pinned to one worker (least-loaded-on-create, spec.md §5) and
/// the whole interception — parent plus any mirror children — runs its
/// callbacks on that worker only.
pub async fn run(ctx: Arc<ListenerContext>) -> Result<()> {
    let listener = TcpListener::bind(ctx.config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind listener on {}", ctx.config.listen_addr))?;

    info!("mitmrelay listening on {}", ctx.config.listen_addr);

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };

        let ctx = ctx.clone();
        let conn_id = ctx.next_conn_id();
        let worker = ctx.workers.least_loaded();
        let resolver = worker.resolver().clone();

        worker.spawn(async move {
            if let Err(e) = connection::run_parent(ctx, stream, peer_addr, conn_id, resolver).await {
                error!(conn_id, peer = %peer_addr, error = %e, "interception failed");
            }
        });
    }
}
