//! End-to-end scenario tests (SPEC_FULL.md §13, spec.md §8): a fake
//! upstream server, the real interceptor listener context, and a plain
//! client socket, all over loopback TCP — no mocking, per the teacher's
//! `clawpot-common/tests/grpc_integration.rs` convention of exercising the
//! real stack rather than a test double.
//!
//! TLS scenarios are intentionally not covered here: standing up a trusted
//! client root store for the forged CA adds no coverage over the plain-TCP
//! path through the same parent/child state machine, and the unit tests in
//! `cert::forge`/`relay::tls` already exercise the forging pipeline itself.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mitmrelay::config::{Config, NatLookup};
use mitmrelay::listener::{self, ListenerContext};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

/// Bind to an ephemeral port, report it, and drop the listener so a later
/// bind (by the code under test) can claim the same port. Good enough for a
/// local test run; matches the reserve-a-port-then-hand-it-off pattern used
/// in the teacher's own `jupyter_tests.rs`.
fn reserve_port() -> u16 {
    let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    l.local_addr().unwrap().port()
}

async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut sock, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match sock.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if sock.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

fn test_config(listen_addr: SocketAddr, upstream: SocketAddr, ca_dir: std::path::PathBuf) -> Config {
    Config {
        listen_addr,
        mirror_bind_addr: "127.0.0.1:0".parse().unwrap(),
        tls: false,
        upgrade: false,
        passthrough_on_fail: false,
        nat_lookup: NatLookup::Static(upstream),
        ca_dir,
        target_cert_dir: None,
        certgen_dir: None,
        certgen_writeall: false,
        content_log_dir: None,
        workers: 2,
    }
}

/// S1-equivalent scenario: a plaintext client connects, the interceptor
/// resolves the (statically-forwarded) destination, the parent relays
/// through the mirror/child pair to the real upstream, and bytes echo back
/// unmodified end to end.
#[tokio::test]
async fn plain_tcp_passthrough_relays_end_to_end() {
    let ca_dir = tempfile::tempdir().unwrap();
    let upstream = spawn_echo_server().await;
    let listen_port = reserve_port();
    let listen_addr: SocketAddr = format!("127.0.0.1:{listen_port}").parse().unwrap();

    let config = test_config(listen_addr, upstream, ca_dir.path().to_path_buf());
    let ctx = Arc::new(ListenerContext::new(config).expect("listener context init"));

    tokio::spawn(async move {
        let _ = listener::run(ctx).await;
    });

    // Give the accept loop a moment to bind before connecting.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut client = timeout(Duration::from_secs(5), TcpStream::connect(listen_addr))
        .await
        .expect("connect timed out")
        .expect("connect failed");

    client.write_all(b"hello through the relay").await.unwrap();

    let mut buf = [0u8; 64];
    let n = timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("read timed out")
        .expect("read failed");

    assert_eq!(&buf[..n], b"hello through the relay");

    // A second, independent request on a fresh connection should behave
    // identically: each accept gets its own parent/child pair.
    let mut client2 = TcpStream::connect(listen_addr).await.unwrap();
    client2.write_all(b"second connection").await.unwrap();
    let n2 = timeout(Duration::from_secs(5), client2.read(&mut buf))
        .await
        .expect("read timed out")
        .expect("read failed");
    assert_eq!(&buf[..n2], b"second connection");
}

/// When the upstream is unreachable and the static target simply refuses
/// the connection, the parent should surface an error rather than hang;
/// the client sees the socket closed without a relayed byte.
#[tokio::test]
async fn unreachable_upstream_closes_client_without_hang() {
    let ca_dir = tempfile::tempdir().unwrap();

    // Reserve (and immediately release) a port so the "upstream" address is
    // syntactically valid but has nothing listening on it.
    let dead_port = reserve_port();
    let upstream: SocketAddr = format!("127.0.0.1:{dead_port}").parse().unwrap();

    let listen_port = reserve_port();
    let listen_addr: SocketAddr = format!("127.0.0.1:{listen_port}").parse().unwrap();

    let config = test_config(listen_addr, upstream, ca_dir.path().to_path_buf());
    let ctx = Arc::new(ListenerContext::new(config).expect("listener context init"));

    tokio::spawn(async move {
        let _ = listener::run(ctx).await;
    });

    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut client = TcpStream::connect(listen_addr).await.unwrap();
    let _ = client.write_all(b"anyone there?").await;

    let mut buf = [0u8; 16];
    let result = timeout(Duration::from_secs(5), client.read(&mut buf)).await.expect("read timed out");

    match result {
        Ok(0) => {} // clean EOF, the expected outcome
        Ok(n) => panic!("expected no relayed bytes, got {n}"),
        Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {}
        Err(e) => panic!("unexpected error: {e}"),
    }
}
