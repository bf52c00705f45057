use std::sync::Arc;

use anyhow::{Context, Result};
use rustls::pki_types::CertificateDer;
use tracing::debug;

use super::ca::{self, fingerprint, CertificateAuthority};
use super::cache::{CertRecord, ForgedCertCache, TargetCertDir};

/// What the upstream TLS handshake observed, used to pick/forge the leaf
/// certificate shown to the client (spec.md §4.2).
#[derive(Clone)]
pub struct PeerCertInfo {
    pub leaf: CertificateDer<'static>,
    pub chain: Vec<CertificateDer<'static>>,
}

/// Three-tier certificate selection: a configured directory of pre-minted
/// certs, then a forge cache keyed by the observed peer leaf, then a fresh
/// forge (spec.md §4.2 "forge algorithm").
pub struct CertForge {
    ca: Arc<CertificateAuthority>,
    target_dir: Option<TargetCertDir>,
    forged: ForgedCertCache,
}

impl CertForge {
    pub fn new(ca: Arc<CertificateAuthority>, target_dir: Option<TargetCertDir>) -> Self {
        Self {
            ca,
            target_dir,
            forged: ForgedCertCache::new(),
        }
    }

    /// Select (or forge) the certificate to present for `sni`, given the
    /// peer leaf observed during the upstream handshake, if any.
    ///
    /// Tier 1: a hit in the target-cert directory under `sni` or its
    /// wildcard form wins outright, since an operator-provided cert is
    /// assumed authoritative.
    ///
    /// Tier 2: if a peer leaf was observed, a forge keyed by its
    /// fingerprint is reused if already minted.
    ///
    /// Tier 3: otherwise, forge a new leaf copying the peer leaf's
    /// subject/SANs (or, with no peer leaf at all — passthrough-less NAT
    /// targets that never got a handshake — mint a single-name cert for
    /// `sni`), and cache it for reuse.
    pub async fn select(&self, sni: &str, peer: Option<&PeerCertInfo>) -> Result<CertRecord> {
        if let Some(dir) = &self.target_dir {
            if let Some(record) = dir.lookup(sni) {
                debug!(sni, "certificate served from target-cert directory");
                return Ok(record);
            }

            // SNI (and its wildcard, tried inside `lookup`) missed. If we
            // observed a peer leaf during the upstream handshake, walk its
            // subject-alt-names/CN in certificate order and try each one
            // through the same directory before falling through to the
            // forge tiers (spec.md §4.2 step 1).
            if let Some(peer) = peer {
                match ca::peer_names(&peer.leaf) {
                    Ok(names) => {
                        for name in &names {
                            if let Some(record) = dir.lookup(name) {
                                debug!(sni, matched = %name, "certificate served from target-cert directory via peer leaf name");
                                return Ok(record);
                            }
                        }
                    }
                    Err(e) => {
                        debug!(sni, error = %e, "failed to parse peer leaf for target-cert directory fallback");
                    }
                }
            }
        }

        let peer_fp = peer.map(|p| fingerprint(&p.leaf));

        if let Some(fp) = &peer_fp {
            if let Some(record) = self.forged.get(fp) {
                if record.immutable || !servername_mismatch(&record.sans, sni) {
                    debug!(sni, fingerprint = %fp, "reusing cached forged certificate");
                    return Ok(record);
                }
                debug!(sni, fingerprint = %fp, "cached forged certificate doesn't cover SNI, reforging");
            }
        }

        let record = self.forge_new(sni, peer).await?;

        if let Some(fp) = peer_fp {
            self.forged.insert(fp, record.clone());
        }

        Ok(record)
    }

    /// Re-forge the certificate cached under `peer`'s identity so its SAN
    /// list additionally covers `new_sn`, replacing the forged-cache entry
    /// in place (spec.md §4.2 `servername_mismatch`). No-op (returns the
    /// existing record) if the cached cert is `immutable`.
    ///
    /// Synchronous because its one real caller,
    /// `rustls::server::ResolvesServerCert::resolve` (see `relay/tls.rs`'s
    /// `ForgeCertResolver`), has no async variant — this signs inline rather
    /// than going through `spawn_blocking`, acceptable since it only runs on
    /// an actual SNI mismatch, not on every handshake.
    pub fn servername_mismatch(&self, new_sn: &str, peer: &PeerCertInfo) -> Result<CertRecord> {
        let fp = fingerprint(&peer.leaf);
        if let Some(existing) = self.forged.get(&fp) {
            if existing.immutable {
                return Ok(existing);
            }
        }

        let (der, key, sans) = self
            .ca
            .sign_leaf_from_peer(&peer.leaf, Some(new_sn))
            .context("Failed to forge certificate copying peer leaf")?;
        let leaf_fingerprint = fingerprint(&der);
        let mut chain = peer.chain.clone();
        chain.push(self.ca.ca_cert_der());
        let record = CertRecord {
            leaf: der,
            key: Arc::new(key),
            chain,
            fingerprint: leaf_fingerprint,
            sans,
            immutable: false,
        };
        self.forged.insert(fp, record.clone());
        Ok(record)
    }

    async fn forge_new(&self, sni: &str, peer: Option<&PeerCertInfo>) -> Result<CertRecord> {
        let ca = self.ca.clone();
        let sni = sni.to_string();
        let peer_leaf = peer.map(|p| p.leaf.clone());
        let peer_chain = peer.map(|p| p.chain.clone()).unwrap_or_default();

        tokio::task::spawn_blocking(move || -> Result<CertRecord> {
            if let Some(peer_leaf) = peer_leaf {
                let (der, key, sans) = ca
                    .sign_leaf_from_peer(&peer_leaf, Some(&sni))
                    .context("Failed to forge certificate copying peer leaf")?;
                let fingerprint = fingerprint(&der);
                let mut chain = peer_chain;
                chain.push(ca.ca_cert_der());
                Ok(CertRecord {
                    leaf: der,
                    key: Arc::new(key),
                    chain,
                    fingerprint,
                    sans,
                    immutable: false,
                })
            } else {
                let (der, key) = ca
                    .sign_leaf(&[sni.clone()])
                    .context("Failed to mint certificate with no peer leaf available")?;
                let fingerprint = fingerprint(&der);
                Ok(CertRecord {
                    leaf: der,
                    key: Arc::new(key),
                    chain: vec![ca.ca_cert_der()],
                    fingerprint,
                    sans: vec![sni],
                    immutable: false,
                })
            }
        })
        .await
        .context("Certificate forge task panicked")?
    }
}

/// Does the certificate observed from upstream fail to cover the SNI the
/// client asked for? (spec.md §4.3, RESOLVING/CONNECTING edge case: used to
/// decide whether to log a servername mismatch, not to abort the
/// connection.)
pub fn servername_mismatch(sans: &[String], sni: &str) -> bool {
    !sans.iter().any(|san| matches_name(san, sni))
}

fn matches_name(pattern: &str, name: &str) -> bool {
    if pattern == name {
        return true;
    }
    if let Some(rest) = pattern.strip_prefix("*.") {
        return name
            .split_once('.')
            .map(|(_, suffix)| suffix == rest)
            .unwrap_or(false);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_name_exact_and_wildcard() {
        assert!(matches_name("example.test", "example.test"));
        assert!(matches_name("*.example.test", "foo.example.test"));
        assert!(!matches_name("*.example.test", "foo.bar.example.test"));
        assert!(!matches_name("other.test", "example.test"));
    }

    #[test]
    fn test_servername_mismatch() {
        let sans = vec!["*.example.test".to_string()];
        assert!(!servername_mismatch(&sans, "foo.example.test"));
        assert!(servername_mismatch(&sans, "evil.test"));
    }

    #[tokio::test]
    async fn test_forge_without_peer_leaf() {
        let dir = tempfile::tempdir().unwrap();
        let ca = Arc::new(CertificateAuthority::load_or_generate(dir.path()).unwrap());
        let forge = CertForge::new(ca, None);
        let record = forge.select("example.test", None).await.unwrap();
        assert_eq!(record.sans, vec!["example.test".to_string()]);
        assert_eq!(record.fingerprint.len(), 64);
    }

    #[tokio::test]
    async fn test_servername_mismatch_reforges_and_replaces_cache_entry() {
        let dir = tempfile::tempdir().unwrap();
        let ca = Arc::new(CertificateAuthority::load_or_generate(dir.path()).unwrap());
        let (peer_der, _peer_key) = ca.sign_leaf(&["upstream.test".to_string()]).unwrap();
        let peer = PeerCertInfo {
            leaf: peer_der,
            chain: vec![],
        };

        let forge = CertForge::new(ca, None);
        let first = forge.select("upstream.test", Some(&peer)).await.unwrap();
        assert!(!servername_mismatch(&first.sans, "upstream.test"));

        let reforged = forge.servername_mismatch("other.test", &peer).unwrap();
        assert!(reforged.sans.contains(&"other.test".to_string()));

        let cached = forge.select("other.test", Some(&peer)).await.unwrap();
        assert_eq!(cached.fingerprint, reforged.fingerprint);
    }

    #[tokio::test]
    async fn test_forge_from_peer_leaf_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        let ca = Arc::new(CertificateAuthority::load_or_generate(dir.path()).unwrap());

        // Build a throwaway "peer leaf" by self-signing with the same CA
        // helper; forge.rs only cares that it's a parseable DER cert.
        let (peer_der, _peer_key) = ca.sign_leaf(&["upstream.test".to_string()]).unwrap();
        let peer = PeerCertInfo {
            leaf: peer_der,
            chain: vec![],
        };

        let forge = CertForge::new(ca, None);
        let first = forge.select("upstream.test", Some(&peer)).await.unwrap();
        let second = forge.select("upstream.test", Some(&peer)).await.unwrap();
        assert_eq!(first.fingerprint, second.fingerprint);
    }
}
