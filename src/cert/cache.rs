use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rustls::pki_types::{CertificateDer, PrivateKeyDer};

/// A signed leaf certificate plus its private key and chain, shared cheaply
/// across connections once cached (spec.md §4.2, three-tier cache).
#[derive(Clone)]
pub struct CertRecord {
    pub leaf: CertificateDer<'static>,
    pub key: Arc<PrivateKeyDer<'static>>,
    pub chain: Vec<CertificateDer<'static>>,
    pub fingerprint: String,
    pub sans: Vec<String>,
    /// Set for a tier-1 target-directory hit: an operator-provided cert is
    /// never regenerated even once the TLS layer observes an SNI it doesn't
    /// cover (spec.md §4.2 "mark cert immutable").
    pub immutable: bool,
}

/// Tier 1: a directory of pre-minted certificates, keyed by hostname (with
/// wildcard fallback). Lookups are lazy and idempotent per key: the first
/// miss or hit for a name is remembered so repeated lookups never re-touch
/// the filesystem (spec.md §4.2).
pub struct TargetCertDir {
    dir: PathBuf,
    ca_cert: CertificateDer<'static>,
    cache: Mutex<HashMap<String, Option<CertRecord>>>,
}

impl TargetCertDir {
    pub fn new(dir: PathBuf, ca_cert: CertificateDer<'static>) -> Self {
        Self {
            dir,
            ca_cert,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Look up `name`, then its wildcard form (`*.`-prefixed, leftmost label
    /// replaced), in that order.
    pub fn lookup(&self, name: &str) -> Option<CertRecord> {
        if let Some(hit) = self.cache.lock().unwrap().get(name) {
            return hit.clone();
        }

        let direct = self.load_pair(name);
        if direct.is_some() {
            self.cache.lock().unwrap().insert(name.to_string(), direct.clone());
            return direct;
        }

        let wildcard = wildcard_form(name).and_then(|w| self.load_pair(&w));
        self.cache.lock().unwrap().insert(name.to_string(), wildcard.clone());
        wildcard
    }

    fn load_pair(&self, name: &str) -> Option<CertRecord> {
        let cert_path = self.dir.join(format!("{name}.crt"));
        let key_path = self.dir.join(format!("{name}.key"));
        if !cert_path.exists() || !key_path.exists() {
            return None;
        }

        let cert_pem = std::fs::read(&cert_path).ok()?;
        let key_pem = std::fs::read(&key_path).ok()?;

        let mut cert_reader = std::io::Cursor::new(cert_pem);
        let mut chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
            .filter_map(|c| c.ok())
            .map(|c| c.into_owned())
            .collect();
        if chain.is_empty() {
            return None;
        }
        let leaf = chain.remove(0);
        chain.push(self.ca_cert.clone());

        let mut key_reader = std::io::Cursor::new(key_pem);
        let key = rustls_pemfile::private_key(&mut key_reader).ok()??.clone_key();

        let fingerprint = super::ca::fingerprint(&leaf);
        Some(CertRecord {
            leaf,
            key: Arc::new(key),
            chain,
            fingerprint,
            sans: vec![name.to_string()],
            immutable: true,
        })
    }
}

fn wildcard_form(name: &str) -> Option<String> {
    let (_, rest) = name.split_once('.')?;
    Some(format!("*.{rest}"))
}

/// Tier 2: forged certificates, keyed by the peer leaf's fingerprint so a
/// re-interception of the same upstream cert reuses the same forged leaf
/// (spec.md §4.2).
#[derive(Default)]
pub struct ForgedCertCache {
    inner: Mutex<HashMap<String, CertRecord>>,
}

impl ForgedCertCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, peer_fingerprint: &str) -> Option<CertRecord> {
        self.inner.lock().unwrap().get(peer_fingerprint).cloned()
    }

    pub fn insert(&self, peer_fingerprint: String, record: CertRecord) {
        self.inner.lock().unwrap().insert(peer_fingerprint, record);
    }
}

/// Tier 3: TLS session resumption state, opaque to this crate beyond the
/// two keys the spec calls out: a session-id keyed cache for the
/// client-facing (src) side, and a (peer address, SNI) keyed cache for the
/// server-facing (dst) side, since a single upstream host may present
/// different certs/sessions depending on which concrete address served it
/// (spec.md §4.2, "session caches").
pub struct SessionCaches {
    pub src: Arc<rustls::server::ServerSessionMemoryCache>,
    dst: Mutex<HashMap<(SocketAddr, String), Arc<rustls::client::ClientSessionMemoryCache>>>,
}

impl SessionCaches {
    pub fn new() -> Self {
        Self {
            src: rustls::server::ServerSessionMemoryCache::new(1024),
            dst: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch (creating if absent) the client session cache scoped to this
    /// concrete upstream address and SNI name.
    pub fn dst_for(&self, peer: SocketAddr, sni: &str) -> Arc<rustls::client::ClientSessionMemoryCache> {
        let key = (peer, sni.to_string());
        let mut dst = self.dst.lock().unwrap();
        dst.entry(key)
            .or_insert_with(|| rustls::client::ClientSessionMemoryCache::new(32))
            .clone()
    }
}

impl Default for SessionCaches {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_form() {
        assert_eq!(wildcard_form("a.example.com").as_deref(), Some("*.example.com"));
        assert_eq!(wildcard_form("example.com").as_deref(), Some("*.com"));
        assert_eq!(wildcard_form("com"), None);
    }

    #[test]
    fn test_target_cert_dir_miss_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        let fake_ca = CertificateDer::from(vec![0u8; 4]);
        let cache = TargetCertDir::new(dir.path().to_path_buf(), fake_ca);
        assert!(cache.lookup("nosuch.test").is_none());
        assert!(cache.cache.lock().unwrap().contains_key("nosuch.test"));
    }

    #[test]
    fn test_dst_session_cache_reused_per_key() {
        let caches = SessionCaches::new();
        let addr: SocketAddr = "127.0.0.1:443".parse().unwrap();
        let a = caches.dst_for(addr, "example.test");
        let b = caches.dst_for(addr, "example.test");
        assert!(Arc::ptr_eq(&a, &b));
        let c = caches.dst_for(addr, "other.test");
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
