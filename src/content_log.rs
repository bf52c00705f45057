//! Content logging (spec.md §4.3 OCSP denial path, §3 "content-log
//! handle"): when enabled, the request/response bytes noted in the spec
//! are appended to a per-interception file. Log rotation is explicitly out
//! of scope (spec.md §1); a file is simply opened in append mode and
//! written to for the lifetime of the interception.

use std::path::{Path, PathBuf};

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// A content-log sink for one interception, or a no-op if content logging
/// isn't configured.
pub struct ContentLog {
    path: Option<PathBuf>,
}

impl ContentLog {
    pub fn new(dir: Option<&Path>, conn_id: u64) -> Self {
        Self {
            path: dir.map(|d| d.join(format!("{conn_id:016x}.log"))),
        }
    }

    pub fn enabled(&self) -> bool {
        self.path.is_some()
    }

    /// Append a labeled chunk (`src`, `dst`, `response`, ...) to the log
    /// file, ignoring write failures beyond a warning (content logging is
    /// diagnostic, never load-bearing for the relay itself).
    pub async fn log(&self, label: &str, data: &[u8]) {
        let Some(path) = &self.path else { return };

        let mut file = match OpenOptions::new().create(true).append(true).open(path).await {
            Ok(f) => f,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to open content log");
                return;
            }
        };

        let header = format!("--- {label} ({} bytes) ---\n", data.len());
        if let Err(e) = file.write_all(header.as_bytes()).await {
            warn!(error = %e, "failed to write content log header");
            return;
        }
        if let Err(e) = file.write_all(data).await {
            warn!(error = %e, "failed to write content log body");
        }
        let _ = file.write_all(b"\n").await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_log_is_noop() {
        let log = ContentLog::new(None, 1);
        assert!(!log.enabled());
        log.log("request", b"GET / HTTP/1.0\r\n\r\n").await;
    }

    #[tokio::test]
    async fn test_enabled_log_appends_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = ContentLog::new(Some(dir.path()), 42);
        assert!(log.enabled());
        log.log("request", b"hello").await;
        log.log("response", b"world").await;

        let path = dir.path().join(format!("{:016x}.log", 42u64));
        let contents = tokio::fs::read_to_string(path).await.unwrap();
        assert!(contents.contains("hello"));
        assert!(contents.contains("world"));
    }
}
