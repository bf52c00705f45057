//! Persisted certificate artifacts (spec.md §6 "Persisted certificate
//! artifacts"): when a cert-gen directory is configured, the original
//! server leaf and the forged leaf served in its place are written out
//! under deterministic, fingerprint-derived names. Writes are idempotent
//! (skipped if the target file already exists) except when `writeall` is
//! set, which forces writing the original leaf for every connection.

use std::path::Path;

use rustls::pki_types::CertificateDer;
use tracing::warn;

use super::ca::fingerprint;

/// Write `<dir>/<orig-fpr>.crt` (if absent, or always when `writeall`) and
/// `<dir>/<orig-fpr>-<used-fpr>.crt` (if absent). Returns `false` if any
/// attempted write failed, so the caller can treat a persist failure as the
/// sticky allocation-failure condition of spec.md §7 (`enomem`): a full
/// disk or permission error here is the closest real analogue this crate
/// has to the original's "optional diagnostic work failed" case.
pub fn persist(
    dir: &Path,
    orig_leaf: Option<&CertificateDer<'_>>,
    used_leaf: &CertificateDer<'_>,
    writeall: bool,
) -> bool {
    let used_fpr = fingerprint(used_leaf);

    let orig_fpr = match orig_leaf {
        Some(leaf) => fingerprint(leaf),
        // No upstream handshake was observed (e.g. a target-dir hit with
        // no peer leaf); fall back to the used cert's own fingerprint so
        // the pair of file names stays well-defined.
        None => used_fpr.clone(),
    };

    let mut ok = true;

    if let Some(leaf) = orig_leaf {
        let orig_path = dir.join(format!("{orig_fpr}.crt"));
        if writeall || !orig_path.exists() {
            ok &= write_der_as_pem(&orig_path, leaf);
        }
    }

    let used_path = dir.join(format!("{orig_fpr}-{used_fpr}.crt"));
    if !used_path.exists() {
        ok &= write_der_as_pem(&used_path, used_leaf);
    }

    ok
}

fn write_der_as_pem(path: &Path, der: &CertificateDer<'_>) -> bool {
    let pem = pem_encode(der.as_ref());
    if let Err(e) = std::fs::write(path, pem) {
        warn!(path = %path.display(), error = %e, "failed to persist certificate artifact");
        return false;
    }
    true
}

fn pem_encode(der: &[u8]) -> String {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    let b64 = STANDARD.encode(der);
    let mut out = String::from("-----BEGIN CERTIFICATE-----\n");
    for chunk in b64.as_bytes().chunks(64) {
        out.push_str(std::str::from_utf8(chunk).unwrap());
        out.push('\n');
    }
    out.push_str("-----END CERTIFICATE-----\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::CertificateAuthority;

    #[test]
    fn test_persist_writes_both_files_once() {
        let ca_dir = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::load_or_generate(ca_dir.path()).unwrap();
        let (orig_der, _) = ca.sign_leaf(&["orig.test".to_string()]).unwrap();
        let (used_der, _) = ca.sign_leaf(&["used.test".to_string()]).unwrap();

        let out_dir = tempfile::tempdir().unwrap();
        persist(out_dir.path(), Some(&orig_der), &used_der, false);

        let orig_fpr = fingerprint(&orig_der);
        let used_fpr = fingerprint(&used_der);
        assert!(out_dir.path().join(format!("{orig_fpr}.crt")).exists());
        assert!(out_dir.path().join(format!("{orig_fpr}-{used_fpr}.crt")).exists());
    }

    #[test]
    fn test_persist_without_orig_leaf_uses_used_fpr_for_both_names() {
        let ca_dir = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::load_or_generate(ca_dir.path()).unwrap();
        let (used_der, _) = ca.sign_leaf(&["solo.test".to_string()]).unwrap();

        let out_dir = tempfile::tempdir().unwrap();
        persist(out_dir.path(), None, &used_der, false);

        let used_fpr = fingerprint(&used_der);
        assert!(!out_dir.path().join(format!("{used_fpr}.crt")).exists());
        assert!(out_dir.path().join(format!("{used_fpr}-{used_fpr}.crt")).exists());
    }
}
