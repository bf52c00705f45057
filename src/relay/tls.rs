//! TLS configuration builders for the two roles a byte-pipe can take
//! (spec.md §4.1 "accepting" / "connecting"), plus the dst-side certificate
//! verifier: this interceptor's whole purpose is to observe the upstream
//! leaf certificate, not to validate the chain, so dst connections accept
//! whatever is presented and hand the leaf back to the caller.

use std::sync::{Arc, Mutex};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};

use crate::cert::{forge, CertForge, CertRecord, PeerCertInfo, SessionCaches};

/// Builds a `rustls::ServerConfig` presenting `record` for the src-facing
/// accept side (spec.md §4.1 "accepting" role), via a [`ForgeCertResolver`]
/// rather than a fixed `with_single_cert`: the TLS layer can then reforge
/// in place if the negotiated ClientHello's real SNI doesn't match what
/// `record` covers (spec.md §4.2 `servername_mismatch`), instead of that
/// only ever being checked ahead of time in `CertForge::select`.
pub fn server_config(
    record: &CertRecord,
    session_caches: &SessionCaches,
    forge: Arc<CertForge>,
    peer: Option<PeerCertInfo>,
) -> anyhow::Result<rustls::ServerConfig> {
    let resolver = Arc::new(ForgeCertResolver {
        forge,
        peer,
        current: Mutex::new(record.clone()),
    });

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.session_storage = session_caches.src.clone();
    Ok(config)
}

/// Certificate resolver for the src-facing accept side (spec.md §4.2
/// `servername_mismatch`). Most handshakes just serve `current`, the
/// record `CertForge::select` already picked before the accept began; if
/// the real ClientHello's SNI (as rustls itself parses it mid-handshake)
/// doesn't match `current`'s SANs and the record isn't `immutable`, this
/// reforges against the peer leaf on the spot and swaps `current` for any
/// later handshake that reuses this resolver (e.g. through session
/// resumption).
struct ForgeCertResolver {
    forge: Arc<CertForge>,
    peer: Option<PeerCertInfo>,
    current: Mutex<CertRecord>,
}

impl std::fmt::Debug for ForgeCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForgeCertResolver").finish()
    }
}

impl ResolvesServerCert for ForgeCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let current = self.current.lock().unwrap().clone();

        let record = match (client_hello.server_name(), &self.peer) {
            (Some(observed), Some(peer))
                if !current.immutable && forge::servername_mismatch(&current.sans, observed) =>
            {
                match self.forge.servername_mismatch(observed, peer) {
                    Ok(reforged) => {
                        *self.current.lock().unwrap() = reforged.clone();
                        reforged
                    }
                    Err(_) => current,
                }
            }
            _ => current,
        };

        certified_key(&record)
    }
}

fn certified_key(record: &CertRecord) -> Option<Arc<CertifiedKey>> {
    let mut chain = vec![record.leaf.clone()];
    chain.extend(record.chain.iter().cloned());
    let key = rustls::crypto::ring::sign::any_supported_type(&record.key).ok()?;
    Some(Arc::new(CertifiedKey::new(chain, key)))
}

/// Shared slot the dst-side verifier writes the observed chain into, and
/// the caller reads back once the handshake completes.
pub type ObservedChain = Arc<Mutex<Option<Vec<CertificateDer<'static>>>>>;

/// Captures whatever certificate chain the upstream presents, without
/// validating it, so the forge pipeline can copy its subject/SANs. Forging
/// a *trustworthy* connection to the real origin is not this interceptor's
/// job — only observation.
#[derive(Debug)]
struct ObservingVerifier {
    observed: ObservedChain,
}

impl ServerCertVerifier for ObservingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let mut chain = vec![end_entity.clone().into_owned()];
        chain.extend(intermediates.iter().map(|c| c.clone().into_owned()));
        *self.observed.lock().unwrap() = Some(chain);
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        // Accept whatever the server picks; we never check the signature.
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

/// Builds a `rustls::ClientConfig` for the dst-facing connect side (spec.md
/// §4.1 "connecting" role), plus a handle to read back the observed
/// certificate chain after the handshake completes.
pub fn client_config(
    peer: std::net::SocketAddr,
    sni: &str,
    session_caches: &SessionCaches,
) -> (rustls::ClientConfig, ObservedChain) {
    let observed: ObservedChain = Arc::new(Mutex::new(None));
    let verifier = Arc::new(ObservingVerifier {
        observed: observed.clone(),
    });

    let mut config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    config.resumption = rustls::client::Resumption::store(session_caches.dst_for(peer, sni));

    (config, observed)
}
