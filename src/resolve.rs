//! Destination resolution (spec.md §4.3 `RESOLVING`): kernel NAT lookup,
//! static forwarding, or SNI-driven DNS.

use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::io::AsRawFd;

use hickory_resolver::TokioResolver;
use tokio::net::TcpStream;

use crate::config::NatLookup;
use crate::error::RelayError;

/// `SO_ORIGINAL_DST`, Linux netfilter's socket option for recovering a
/// transparently-redirected connection's original destination. No safe
/// wrapper exists in `libc`/`nix` for this, so the raw `getsockopt` call is
/// made directly, matching the original's use of the same socket option.
const SO_ORIGINAL_DST: libc::c_int = 80;

/// Resolve the original destination for an accepted, NAT-redirected
/// connection via `getsockopt(SOL_IP, SO_ORIGINAL_DST)`.
pub fn kernel_nat_lookup(stream: &TcpStream) -> Result<SocketAddr, RelayError> {
    let fd = stream.as_raw_fd();
    let peer = stream.peer_addr().ok();

    // sockaddr_in is large enough for the IPv4 original-dst option; IPv6
    // transparent redirection uses SOL_IPV6/IP6T_SO_ORIGINAL_DST with a
    // sockaddr_in6, selected by the local socket's address family.
    let is_v6 = matches!(stream.local_addr(), Ok(addr) if addr.is_ipv6());

    if is_v6 {
        let mut addr: libc::sockaddr_in6 = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::IPPROTO_IPV6,
                SO_ORIGINAL_DST,
                &mut addr as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if rc != 0 {
            return Err(nat_fail(peer));
        }
        let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);
        let port = u16::from_be(addr.sin6_port);
        Ok(SocketAddr::new(IpAddr::V6(ip), port))
    } else {
        let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::IPPROTO_IP,
                SO_ORIGINAL_DST,
                &mut addr as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if rc != 0 {
            return Err(nat_fail(peer));
        }
        let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
        let port = u16::from_be(addr.sin_port);
        Ok(SocketAddr::new(IpAddr::V4(ip), port))
    }
}

fn nat_fail(peer: Option<SocketAddr>) -> RelayError {
    RelayError::NatLookupFailed(peer.unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)))
}

/// Resolve an SNI hostname to an address, constrained to the peer's address
/// family and defaulting to port 443 (spec.md §4.3 "resolve host to address
/// with hints (family = observed peer family, STREAM, TCP)").
pub async fn resolve_sni(
    resolver: &TokioResolver,
    sni: &str,
    peer_family_hint: IpAddr,
) -> Result<SocketAddr, RelayError> {
    let response = resolver
        .lookup_ip(sni)
        .await
        .map_err(|_| RelayError::DnsResolutionFailed(sni.to_string()))?;

    let want_v6 = peer_family_hint.is_ipv6();
    let ip = response
        .iter()
        .find(|ip| ip.is_ipv6() == want_v6)
        .or_else(|| response.iter().next())
        .ok_or_else(|| RelayError::DnsResolutionFailed(sni.to_string()))?;

    Ok(SocketAddr::new(ip, 443))
}

/// Resolve the dst address per the configured strategy.
pub async fn resolve_dst(
    nat_lookup: &NatLookup,
    stream: &TcpStream,
    resolver: &TokioResolver,
    sni: Option<&str>,
) -> Result<SocketAddr, RelayError> {
    match nat_lookup {
        NatLookup::Kernel => kernel_nat_lookup(stream),
        NatLookup::Static(addr) => Ok(*addr),
        NatLookup::SniDns => {
            let sni = sni.ok_or(RelayError::NoServerName)?;
            let peer_family = stream
                .peer_addr()
                .map(|a| a.ip())
                .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
            resolve_sni(resolver, sni, peer_family).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_resolve() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { tokio::net::TcpStream::connect(addr).await.unwrap() });
        let (stream, _) = listener.accept().await.unwrap();
        client.await.unwrap();

        let resolver: TokioResolver = hickory_resolver::Resolver::builder_with_config(
            hickory_resolver::config::ResolverConfig::default(),
            hickory_resolver::name_server::TokioConnectionProvider::default(),
        )
        .with_options(hickory_resolver::config::ResolverOpts::default())
        .build();
        let target: SocketAddr = "10.0.0.1:443".parse().unwrap();
        let resolved = resolve_dst(&NatLookup::Static(target), &stream, &resolver, None)
            .await
            .unwrap();
        assert_eq!(resolved, target);
    }
}
