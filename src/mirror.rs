//! The mirror listener and child connection state machine (spec.md §4.3,
//! §4.5 "Child", §9 "mirror-dst address for child"): the parent's e2src
//! pipe connects loopback into this listener, and each accepted socket
//! becomes one child's `e2dst` endpoint; the child then opens its own
//! fresh `dst` connection to the same address the parent resolved and
//! relays `e2dst` ↔ `dst`, applying response-header filtering and the
//! content-log hooks on the dst→e2dst direction.
//!
//! Grounded on `pxyconn.c`'s `pxy_bev_readcb_e2`/`pxy_conn_child_connect`
//! (the child never repeats SNI peeking or certificate forging — that
//! already happened once, in the parent).

use std::sync::Arc;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::connection::ConnShared;
use crate::listener::ListenerContext;
use crate::pipe::{Pipe, HIGH_WATER_MARK};
use crate::relay::{filter, teardown};

/// Accept children on `listener` until the parent (and every other child)
/// has released the shared meta-context (spec.md §4.6 "mirror listener
/// shutdown").
pub async fn run_mirror_listener(ctx: Arc<ListenerContext>, listener: TcpListener, shared: Arc<ConnShared>, conn_id: u64) {
    loop {
        tokio::select! {
            _ = shared.meta.wait_for_shutdown() => {
                debug!(conn_id, "mirror listener shutting down");
                return;
            }
            accepted = listener.accept() => {
                let (e2dst, _addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(conn_id, error = %e, "mirror listener accept failed");
                        continue;
                    }
                };

                shared.meta.register_child();
                let ctx = ctx.clone();
                let shared = shared.clone();
                tokio::spawn(async move {
                    run_child(ctx, e2dst, shared.clone(), conn_id).await;
                    let released = shared.meta.release_child();
                    if released {
                        shared.meta.shut_down_mirror_listener();
                    }
                });
            }
        }
    }
}

/// One child: connect `dst` fresh, relay `e2dst` ↔ `dst` with response
/// filtering on the dst→e2dst direction (spec.md §4.4, §4.5 "Child").
async fn run_child(ctx: Arc<ListenerContext>, e2dst: TcpStream, shared: Arc<ConnShared>, conn_id: u64) {
    let dst_pipe = if shared.dst_tls {
        match connect_dst_tls(&ctx, &shared).await {
            Ok(pipe) => pipe,
            Err(e) => {
                warn!(conn_id, error = %e, "child dst TLS connect failed");
                return;
            }
        }
    } else {
        match TcpStream::connect(shared.dst_addr).await {
            Ok(s) => Pipe::plain(s),
            Err(e) => {
                warn!(conn_id, error = %e, "child dst connect failed");
                return;
            }
        }
    };

    let e2dst_pipe = Pipe::plain(e2dst);
    run_child_relay(&shared, e2dst_pipe, dst_pipe).await;
}

async fn connect_dst_tls(ctx: &ListenerContext, shared: &ConnShared) -> Result<Pipe, crate::error::RelayError> {
    use crate::error::RelayError;
    use crate::relay::tls as relaytls;

    let raw = TcpStream::connect(shared.dst_addr).await.map_err(RelayError::Io)?;
    let domain = shared.sni.clone().unwrap_or_else(|| shared.dst_addr.ip().to_string());

    let (client_config, _observed) = relaytls::client_config(shared.dst_addr, &domain, &ctx.session_caches);
    let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));

    let server_name = match domain.parse::<std::net::IpAddr>() {
        Ok(ip) => ServerName::IpAddress(ip.into()),
        Err(_) => ServerName::try_from(domain.clone()).map_err(|_| RelayError::DnsResolutionFailed(domain.clone()))?,
    };

    let tls_stream = connector.connect(server_name, raw).await.map_err(RelayError::Io)?;
    Ok(Pipe::tls_client(tls_stream))
}

/// Relay `e2dst` ↔ `dst`: unfiltered in the e2dst→dst direction (the
/// parent already filtered/injected on the request side), filtered in the
/// dst→e2dst direction (spec.md §4.4 response filtering), with the
/// first complete response header block's status/content-length captured
/// into the shared HTTP log fields.
async fn run_child_relay(shared: &Arc<ConnShared>, e2dst: Pipe, dst: Pipe) {
    let (mut e2dst_rd, mut e2dst_wr) = tokio::io::split(e2dst);
    let (mut dst_rd, mut dst_wr) = tokio::io::split(dst);

    let mut e2dst_eof = false;
    let mut dst_eof = false;
    let mut filtered = false;
    let mut e2dst_buf = vec![0u8; HIGH_WATER_MARK];
    let mut dst_buf = vec![0u8; HIGH_WATER_MARK];

    while !(e2dst_eof && dst_eof) {
        let parent_eof = shared.meta.parent_eof();

        tokio::select! {
            result = e2dst_rd.read(&mut e2dst_buf), if !e2dst_eof => {
                match result {
                    Ok(0) => { e2dst_eof = true; let _ = dst_wr.shutdown().await; }
                    Ok(n) => {
                        if dst_wr.write_all(&e2dst_buf[..n]).await.is_err() {
                            dst_eof = true;
                        }
                    }
                    Err(e) => {
                        if crate::error::is_routine_handshake_failure(&e) {
                            debug!(error = %e, "e2dst read error (routine handshake failure)");
                        } else {
                            warn!(error = %e, "e2dst read error");
                        }
                        e2dst_eof = true;
                    }
                }
            }
            result = dst_rd.read(&mut dst_buf), if !dst_eof => {
                match result {
                    Ok(0) => { dst_eof = true; let _ = e2dst_wr.shutdown().await; }
                    Ok(n) => {
                        let chunk = &dst_buf[..n];
                        shared.content_log.log("response", chunk).await;

                        let forward = if !filtered {
                            match filter::filter_response(chunk) {
                                filter::FilterOutcome::Filtered { output, meta } => {
                                    filtered = true;
                                    if !shared.enomem.get() {
                                        let mut log = shared.http_log.lock().unwrap();
                                        log.status = meta.status;
                                        log.content_length = meta.content_length;
                                    }
                                    output
                                }
                                filter::FilterOutcome::PassThrough => {
                                    filtered = true;
                                    chunk.to_vec()
                                }
                            }
                        } else {
                            chunk.to_vec()
                        };

                        if e2dst_wr.write_all(&forward).await.is_err() {
                            e2dst_eof = true;
                        }
                    }
                    Err(e) => {
                        if crate::error::is_routine_handshake_failure(&e) {
                            debug!(error = %e, "dst read error (routine handshake failure)");
                        } else {
                            warn!(error = %e, "dst read error");
                        }
                        dst_eof = true;
                    }
                }
            }
        }

        let e2dst_state = teardown::EndpointState { eof: e2dst_eof, input_empty: true };
        let dst_state = teardown::EndpointState { eof: dst_eof, input_empty: true };
        if teardown::child_ready_to_free(e2dst_state, dst_state, parent_eof.map(|(s, e)| (
            teardown::EndpointState { eof: s, input_empty: true },
            teardown::EndpointState { eof: e, input_empty: true },
        ))) {
            break;
        }
    }

    let e2dst = e2dst_rd.unsplit(e2dst_wr);
    let dst = dst_rd.unsplit(dst_wr);
    e2dst.release().await;
    dst.release().await;
}
