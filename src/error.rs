use thiserror::Error;

/// Aggregated per-pipe error, carrying the underlying I/O error (if any)
/// alongside a snapshot of any TLS-layer diagnostics, so a single value can
/// travel from the failing read/write/handshake call down to the teardown
/// coordinator without losing detail (spec.md §9, "Error aggregation").
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<RelayError>,
    },

    #[error("out of memory")]
    OutOfMemory,

    #[error("no SNI found in ClientHello")]
    NoServerName,

    #[error("ClientHello truncated after {0} retries")]
    ClientHelloTruncated(usize),

    #[error("NAT lookup failed for {0}")]
    NatLookupFailed(std::net::SocketAddr),

    #[error("cannot resolve SNI hostname: {0}")]
    DnsResolutionFailed(String),

    #[error("certificate forge failed: {0}")]
    ForgeFailed(String),
}

impl RelayError {
    pub fn context(self, context: impl Into<String>) -> Self {
        RelayError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// True for the one handshake-failure alert that the original treats as
    /// routine and logs only at debug level (spec.md §7).
    pub fn is_routine_handshake_failure(&self) -> bool {
        is_routine_handshake_failure(self)
    }
}

/// Free-function form of [`RelayError::is_routine_handshake_failure`] that
/// works against any error's `Display` text, not just `RelayError::Tls`:
/// the relay loop's read/write errors surface as `std::io::Error` (from
/// `tokio-rustls`, which wraps the underlying TLS alert rather than
/// preserving a `rustls::Error` value), so the teardown logging boundary
/// needs to classify those too (spec.md §7 "SSLV3_ALERT_HANDSHAKE_FAILURE
/// → debug-only, treat as normal teardown").
pub fn is_routine_handshake_failure(err: &(dyn std::error::Error + 'static)) -> bool {
    err.to_string().contains("handshake failure")
}

/// Sticky out-of-memory flag (spec.md §7). Once set, optional diagnostic
/// work (fingerprint computation, log-string capture) is skipped so the
/// connection can still be torn down cleanly.
#[derive(Debug, Default)]
pub struct EnomemFlag(std::sync::atomic::AtomicBool);

impl EnomemFlag {
    pub fn new() -> Self {
        Self(std::sync::atomic::AtomicBool::new(false))
    }

    pub fn set(&self) {
        self.0.store(true, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn get(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::Relaxed)
    }
}
