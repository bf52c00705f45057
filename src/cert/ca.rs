use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, Issuer, IsCa, KeyPair, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use sha2::{Digest, Sha256};
use tracing::info;

/// The local certificate authority used to sign forged leaf certificates.
/// Grounded on the teacher's `proxy/ca.rs`, generalized to sign by copying
/// subject/SANs from an observed peer leaf rather than always minting a
/// single-name cert (spec.md §4.2).
pub struct CertificateAuthority {
    issuer: Issuer<'static, KeyPair>,
    ca_cert_der: CertificateDer<'static>,
    ca_cert_pem: String,
    leaf_key: KeyPair,
    ca_dir: PathBuf,
}

impl CertificateAuthority {
    /// Create or load a CA from the given directory. If `ca.crt` and
    /// `ca.key` exist, loads them; otherwise generates and persists new
    /// ones.
    pub fn load_or_generate(ca_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(ca_dir)
            .with_context(|| format!("Failed to create CA directory: {}", ca_dir.display()))?;

        let cert_path = ca_dir.join("ca.crt");
        let key_path = ca_dir.join("ca.key");

        let (ca_cert_pem, ca_key) = if cert_path.exists() && key_path.exists() {
            info!("Loading existing CA from {}", ca_dir.display());
            let ca_cert_pem = std::fs::read_to_string(&cert_path).context("Failed to read CA cert")?;
            let key_pem = std::fs::read_to_string(&key_path).context("Failed to read CA key")?;
            let ca_key = KeyPair::from_pem(&key_pem).context("Failed to parse CA key")?;
            (ca_cert_pem, ca_key)
        } else {
            info!("Generating new CA certificate in {}", ca_dir.display());
            let ca_key = KeyPair::generate().context("Failed to generate CA key pair")?;

            let mut params = CertificateParams::default();
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            let mut dn = DistinguishedName::new();
            dn.push(DnType::CommonName, "mitmrelay forging CA");
            dn.push(DnType::OrganizationName, "mitmrelay");
            params.distinguished_name = dn;

            let ca_cert = params
                .self_signed(&ca_key)
                .context("Failed to self-sign CA cert")?;
            let ca_cert_pem = ca_cert.pem();
            let ca_key_pem = ca_key.serialize_pem();

            std::fs::write(&cert_path, &ca_cert_pem).context("Failed to write CA cert")?;
            std::fs::write(&key_path, &ca_key_pem).context("Failed to write CA key")?;
            info!("CA certificate written to {}", cert_path.display());

            (ca_cert_pem, ca_key)
        };

        let mut cert_reader = std::io::Cursor::new(ca_cert_pem.as_bytes());
        let ca_cert_der = rustls_pemfile::certs(&mut cert_reader)
            .next()
            .context("CA cert PEM contained no certificate")?
            .context("Failed to parse CA cert PEM")?
            .into_owned();

        let issuer = Issuer::from_ca_cert_der(&ca_cert_der, ca_key)
            .context("Failed to build CA issuer from stored cert")?;

        let leaf_key = KeyPair::generate().context("Failed to generate leaf key pair")?;

        Ok(Self {
            issuer,
            ca_cert_der,
            ca_cert_pem,
            leaf_key,
            ca_dir: ca_dir.to_path_buf(),
        })
    }

    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    pub fn ca_cert_der(&self) -> CertificateDer<'static> {
        self.ca_cert_der.clone()
    }

    pub fn ca_dir(&self) -> &Path {
        &self.ca_dir
    }

    /// Sign a leaf certificate whose subject/SANs are `names`, using the
    /// CA's fixed leaf key (spec.md §4.2: "using the configured leaf key").
    pub fn sign_leaf(&self, names: &[String]) -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
        let dns_names: Vec<String> = names
            .iter()
            .filter(|n| n.parse::<std::net::IpAddr>().is_err())
            .cloned()
            .collect();

        let mut params = if dns_names.is_empty() {
            CertificateParams::new(Vec::<String>::new()).context("Failed to create leaf cert params")?
        } else {
            CertificateParams::new(dns_names.clone()).context("Failed to create leaf cert params")?
        };

        let mut dn = DistinguishedName::new();
        if let Some(first) = names.first() {
            dn.push(DnType::CommonName, first.as_str());
        }
        params.distinguished_name = dn;

        for name in names {
            if let Ok(ip) = name.parse::<std::net::IpAddr>() {
                params.subject_alt_names.push(SanType::IpAddress(ip));
            }
        }

        let cert = params
            .signed_by(&self.leaf_key, &self.issuer)
            .context("Failed to sign leaf certificate")?;

        let der = cert.der().clone();
        let key_der = PrivateKeyDer::try_from(self.leaf_key.serialize_der())
            .map_err(|e| anyhow::anyhow!("Failed to encode leaf private key: {e}"))?;
        Ok((der, key_der))
    }

    /// Sign a leaf certificate that copies subject/extensions/SANs from an
    /// observed peer leaf (spec.md §4.2, forge algorithm step 2), appending
    /// `extra_san` if it isn't already present.
    pub fn sign_leaf_from_peer(
        &self,
        peer_leaf_der: &CertificateDer<'_>,
        extra_san: Option<&str>,
    ) -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>, Vec<String>)> {
        let mut params = CertificateParams::from_ca_cert_der(peer_leaf_der)
            .context("Failed to parse peer leaf certificate")?;

        // Authority key id / subject key id are regenerated by rcgen for the
        // new issuer; drop any copied over from the peer leaf so the
        // extensions aren't stale (spec.md §4.2: "minus authority/SKI").
        params.use_authority_key_identifier_extension = false;
        params.key_identifier_method = rcgen::KeyIdMethod::Sha256;

        let mut names: Vec<String> = params
            .subject_alt_names
            .iter()
            .filter_map(|san| match san {
                SanType::DnsName(n) => Some(n.to_string()),
                _ => None,
            })
            .collect();

        if let Some(extra) = extra_san {
            if !names.iter().any(|n| n == extra) {
                names.push(extra.to_string());
                params
                    .subject_alt_names
                    .push(SanType::DnsName(extra.to_string().try_into().map_err(|e| {
                        anyhow::anyhow!("Invalid SNI hostname for SAN: {e:?}")
                    })?));
            }
        }

        let cert = params
            .signed_by(&self.leaf_key, &self.issuer)
            .context("Failed to sign forged leaf certificate")?;

        let der = cert.der().clone();
        let key_der = PrivateKeyDer::try_from(self.leaf_key.serialize_der())
            .map_err(|e| anyhow::anyhow!("Failed to encode leaf private key: {e}"))?;
        Ok((der, key_der, names))
    }
}

/// Names a peer leaf certificate covers, common name first then its
/// subject-alt-name DNS entries in certificate order (spec.md §4.2 step 1:
/// "iterate its subject-alt-name list, including common name, in
/// certificate order"). Used by the target-cert directory's peer-leaf
/// fallback lookup, not by the forging path itself (which keeps the full
/// `subject_alt_names` list via `sign_leaf_from_peer`).
pub fn peer_names(peer_leaf_der: &CertificateDer<'_>) -> Result<Vec<String>> {
    let params =
        CertificateParams::from_ca_cert_der(peer_leaf_der).context("Failed to parse peer leaf certificate")?;

    let mut names = Vec::new();
    if let Some(cn) = params.distinguished_name.get(&DnType::CommonName) {
        names.push(cn.to_string());
    }
    for san in &params.subject_alt_names {
        if let SanType::DnsName(n) = san {
            let n = n.to_string();
            if !names.contains(&n) {
                names.push(n);
            }
        }
    }
    Ok(names)
}

/// SHA-256 fingerprint of a DER-encoded certificate, hex-encoded (spec.md
/// §3: `origcrtfpr`/`usedcrtfpr`).
pub fn fingerprint(der: &CertificateDer<'_>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(der.as_ref());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_and_reload_ca() {
        let dir = tempfile::tempdir().unwrap();
        {
            let ca = CertificateAuthority::load_or_generate(dir.path()).unwrap();
            assert!(ca.ca_cert_pem().contains("BEGIN CERTIFICATE"));
        }
        // Second load should reuse the persisted key/cert.
        let ca2 = CertificateAuthority::load_or_generate(dir.path()).unwrap();
        assert!(dir.path().join("ca.crt").exists());
        assert!(dir.path().join("ca.key").exists());
        let (der, _key) = ca2.sign_leaf(&["example.test".to_string()]).unwrap();
        assert!(!fingerprint(&der).is_empty());
    }

    #[test]
    fn test_sign_leaf_includes_name() {
        let dir = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::load_or_generate(dir.path()).unwrap();
        let (der, _key) = ca.sign_leaf(&["alt.test".to_string()]).unwrap();
        assert!(fingerprint(&der).len() == 64);
    }

    #[test]
    fn test_peer_names_cn_first_then_sans() {
        let dir = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::load_or_generate(dir.path()).unwrap();
        let (der, _key) = ca.sign_leaf(&["first.test".to_string(), "second.test".to_string()]).unwrap();
        let names = peer_names(&der).unwrap();
        assert_eq!(names[0], "first.test");
        assert!(names.contains(&"second.test".to_string()));
    }
}
