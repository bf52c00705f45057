use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};

/// How the RESOLVING state discovers the original destination (§4.3).
#[derive(Debug, Clone)]
pub enum NatLookup {
    /// Kernel NAT table lookup (Linux netfilter `SO_ORIGINAL_DST`).
    Kernel,
    /// A single fixed forwarding target, configured out of band.
    Static(SocketAddr),
    /// Resolve the SNI hostname via DNS, using the peer's address family.
    SniDns,
}

/// Process-wide configuration, resolved once at startup from the
/// environment. Option parsing / CLI is out of scope for this crate; see
/// SPEC_FULL.md §10.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub mirror_bind_addr: SocketAddr,
    pub tls: bool,
    pub upgrade: bool,
    pub passthrough_on_fail: bool,
    pub nat_lookup: NatLookup,
    pub ca_dir: PathBuf,
    pub target_cert_dir: Option<PathBuf>,
    pub certgen_dir: Option<PathBuf>,
    pub certgen_writeall: bool,
    pub content_log_dir: Option<PathBuf>,
    pub workers: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_addr = env_or("MITM_LISTEN_ADDR", "0.0.0.0:8443")
            .parse()
            .context("Invalid MITM_LISTEN_ADDR")?;
        let mirror_bind_addr = env_or("MITM_MIRROR_BIND_ADDR", "127.0.0.1:0")
            .parse()
            .context("Invalid MITM_MIRROR_BIND_ADDR")?;
        let tls = env_bool("MITM_TLS", true)?;
        let upgrade = env_bool("MITM_UPGRADE", false)?;
        let passthrough_on_fail = env_bool("MITM_PASSTHROUGH_ON_FAIL", false)?;

        let nat_lookup = match env_or("MITM_NAT_LOOKUP", "kernel").as_str() {
            "kernel" => NatLookup::Kernel,
            "static" => {
                let addr = std::env::var("MITM_STATIC_FORWARD").context(
                    "MITM_STATIC_FORWARD is required when MITM_NAT_LOOKUP=static",
                )?;
                NatLookup::Static(addr.parse().context("Invalid MITM_STATIC_FORWARD")?)
            }
            "sni-dns" => NatLookup::SniDns,
            other => anyhow::bail!("Unknown MITM_NAT_LOOKUP value: {other}"),
        };

        let ca_dir = PathBuf::from(env_or("MITM_CA_DIR", "./ca"));
        let target_cert_dir = std::env::var("MITM_TARGET_CERT_DIR").ok().map(PathBuf::from);
        let certgen_dir = std::env::var("MITM_CERTGEN_DIR").ok().map(PathBuf::from);
        let certgen_writeall = env_bool("MITM_CERTGEN_WRITEALL", false)?;
        let content_log_dir = std::env::var("MITM_CONTENT_LOG_DIR").ok().map(PathBuf::from);

        let workers = match std::env::var("MITM_WORKERS") {
            Ok(v) => v.parse().context("Invalid MITM_WORKERS")?,
            Err(_) => std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
        };

        Ok(Self {
            listen_addr,
            mirror_bind_addr,
            tls,
            upgrade,
            passthrough_on_fail,
            nat_lookup,
            ca_dir,
            target_cert_dir,
            certgen_dir,
            certgen_writeall,
            content_log_dir,
            workers,
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match std::env::var(key) {
        Err(_) => Ok(default),
        Ok(v) => match v.as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            other => anyhow::bail!("Invalid boolean for {key}: {other}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_bool_defaults() {
        assert!(env_bool("MITM_TEST_UNSET_XYZ", true).unwrap());
        assert!(!env_bool("MITM_TEST_UNSET_XYZ", false).unwrap());
    }

    #[test]
    fn test_env_bool_invalid() {
        std::env::set_var("MITM_TEST_BOOL_BAD", "maybe");
        assert!(env_bool("MITM_TEST_BOOL_BAD", false).is_err());
        std::env::remove_var("MITM_TEST_BOOL_BAD");
    }
}
