//! The parent connection state machine (spec.md §4.3): one instance per
//! accepted client socket, driving ACCEPTED → PEEKING → RESOLVING →
//! CONNECTING_DST → DST_CONNECTED → FULLY_CONNECTED → RELAYING → TEARDOWN.
//!
//! Rather than the original's nested bufferevent callbacks, each state is
//! an `await` point in one sequential function (spec.md §9 "Callback-driven
//! state machine": "represent it as an explicit enumerated state plus a
//! dispatch"); `ConnState` below exists for tracing, not control flow — the
//! `?`-propagating sequence of awaits through RESOLVING/CONNECTING_DST/...
//! already is that dispatch, one state per suspension point, with no
//! caller able to re-enter a state out of order.
//!
//! Grounded on `pxyconn.c`'s `pxy_bev_readcb`/`pxy_conn_connect_dst`/
//! `pxy_conn_connected_enable` sequence and the teacher's `tls_mitm.rs`
//! accept-and-relay shape.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use hickory_resolver::TokioResolver;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::cert::{ca, PeerCertInfo};
use crate::clienthello::{peek_client_hello, ClientHelloPeek, MAX_PEEK_RETRIES, PEEK_RETRY_DELAY, PEEK_SIZE};
use crate::content_log::ContentLog;
use crate::error::{is_routine_handshake_failure, EnomemFlag, RelayError};
use crate::listener::ListenerContext;
use crate::mirror;
use crate::pipe::{Pipe, HIGH_WATER_MARK};
use crate::relay::{filter, log as connlog, ocsp, teardown, tls as relaytls, Meta};
use crate::resolve;

/// Tracing-only label for the current point in the sequence (spec.md
/// §4.3's state table); nothing branches on this beyond log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Peeking,
    Resolving,
    ConnectingDst,
    DstConnected,
    FullyConnected,
    Relaying,
}

/// Bookkeeping shared between a parent and its mirror children beyond the
/// release ref-counting in [`Meta`]: the destination address children
/// reconnect to (spec.md §9 "mirror-dst address for child"), and the HTTP
/// log fields split between the parent's request-side capture and a
/// child's response-side capture, so the parent can emit one connect-log
/// line that covers both halves.
pub struct ConnShared {
    pub meta: Meta,
    pub dst_addr: SocketAddr,
    pub peer_addr: SocketAddr,
    pub sni: Option<String>,
    /// True if the child's own `dst` connection (spec.md §9 "mirror-dst
    /// address for child") should negotiate TLS — mirrors whatever the
    /// parent's CONNECTING_DST outcome was, so a passthrough demotion on
    /// the parent side demotes the child's reconnection too.
    pub dst_tls: bool,
    pub http_log: StdMutex<connlog::HttpLogFields>,
    pub ocsp_denied: AtomicBool,
    pub content_log: ContentLog,
    /// Sticky out-of-memory flag (spec.md §3/§7): set when optional
    /// diagnostic work (currently, persisting certificate artifacts) fails,
    /// so the next teardown checkpoint skips the rest of that optional work
    /// and logs a terminating line instead of the usual connect-log entry.
    pub enomem: EnomemFlag,
}

/// Run one accepted client connection to completion. Returns once the
/// interception has been fully torn down (or aborted before relaying
/// began); errors are the caller's cue to log, never to retry. `resolver`
/// is the DNS resolver of the worker this task was scheduled on (spec.md §5
/// "one resolver per worker") — it must not be re-picked here, or SNI
/// lookups for this connection could run on a different worker's resolver
/// than the one driving its own tasks.
pub async fn run_parent(
    ctx: Arc<ListenerContext>,
    stream: TcpStream,
    peer_addr: SocketAddr,
    conn_id: u64,
    resolver: TokioResolver,
) -> Result<(), RelayError> {
    stream.set_nodelay(true).ok();

    // PEEKING
    let mut state = ConnState::Peeking;
    let mut sni: Option<String> = None;
    let mut clienthello_found = false;

    if ctx.config.tls {
        match peek_clienthello_loop(&stream).await? {
            ClientHelloPeek::Complete { sni: found } => {
                sni = found;
                clienthello_found = true;
            }
            ClientHelloPeek::NotTls if ctx.config.upgrade => {
                debug!(conn_id, "no ClientHello observed, proceeding without autossl upgrade");
            }
            ClientHelloPeek::NotTls => {
                warn!(conn_id, "expected TLS ClientHello, none observed");
                return Ok(());
            }
            ClientHelloPeek::Truncated => {
                return Err(RelayError::ClientHelloTruncated(MAX_PEEK_RETRIES));
            }
        }
    }

    debug!(?state, conn_id, sni = ?sni, "peek complete");

    // RESOLVING
    state = ConnState::Resolving;
    let dst_addr = resolve::resolve_dst(&ctx.config.nat_lookup, &stream, &resolver, sni.as_deref())
        .await
        .map_err(|e| e.context("resolving destination"))?;
    debug!(?state, conn_id, dst = %dst_addr, "destination resolved");

    // The mirror listener must exist before DST_CONNECTED, when the
    // parent's e2src connects to it (spec.md §4.3 state table) — bound
    // here, ahead of the dst connect attempt, rather than at the later
    // point the prose narrative in §2 might suggest; the state table is the
    // more precise of the two and is what this code follows (DESIGN.md).
    let mirror_listener = TcpListener::bind(ctx.config.mirror_bind_addr)
        .await
        .map_err(RelayError::Io)?;
    let mirror_addr = mirror_listener.local_addr().map_err(RelayError::Io)?;

    // CONNECTING_DST
    state = ConnState::ConnectingDst;
    let want_tls = ctx.config.tls || clienthello_found;
    let mut passthrough = false;
    let mut peer_cert: Option<PeerCertInfo> = None;
    let mut dproto: Option<(String, String)> = None;

    if want_tls {
        // The parent's own dst pipe exists only to observe the upstream
        // leaf certificate; it's released as soon as the handshake
        // completes and never carries relayed traffic (see module docs).
        match connect_dst_tls(&ctx, dst_addr, sni.as_deref()).await {
            Ok((info, proto)) => {
                peer_cert = Some(info);
                dproto = proto;
            }
            Err(e) if ctx.config.passthrough_on_fail => {
                warn!(conn_id, error = %e, "dst TLS handshake failed, demoting to passthrough");
                passthrough = true;
            }
            Err(e) => return Err(e.context("connecting to destination over TLS")),
        }
    }

    let shared = Arc::new(ConnShared {
        meta: Meta::new(mirror_addr),
        dst_addr,
        peer_addr,
        sni: sni.clone(),
        dst_tls: want_tls && !passthrough,
        http_log: StdMutex::new(connlog::HttpLogFields::default()),
        ocsp_denied: AtomicBool::new(false),
        content_log: ContentLog::new(ctx.config.content_log_dir.as_deref(), conn_id),
        enomem: EnomemFlag::new(),
    });

    tokio::spawn(mirror::run_mirror_listener(ctx.clone(), mirror_listener, shared.clone(), conn_id));

    // DST_CONNECTED
    state = ConnState::DstConnected;
    let e2src_raw = TcpStream::connect(mirror_addr).await.map_err(RelayError::Io)?;
    let e2src_pipe = Pipe::plain(e2src_raw);
    debug!(?state, conn_id, "e2src attached to mirror listener");

    // FULLY_CONNECTED
    state = ConnState::FullyConnected;
    let mut tls_log = connlog::TlsLogFields {
        sni: sni.clone(),
        dproto,
        ..Default::default()
    };

    let src_pipe = if want_tls && !passthrough {
        let sni_for_cert = sni.clone().unwrap_or_else(|| dst_addr.ip().to_string());
        let record = ctx
            .forge
            .select(&sni_for_cert, peer_cert.as_ref())
            .await
            .map_err(|e| RelayError::ForgeFailed(e.to_string()))?;

        if let Some(dir) = &ctx.config.certgen_dir {
            let persisted = crate::cert::persist::persist(
                dir,
                peer_cert.as_ref().map(|p| &p.leaf),
                &record.leaf,
                ctx.config.certgen_writeall,
            );
            if !persisted {
                shared.enomem.set();
            }
        }

        // Sticky enomem (spec.md §7): once set, skip the rest of this
        // connection's optional diagnostic work rather than retrying it.
        if !shared.enomem.get() {
            tls_log.names = record.sans.clone();
            tls_log.origcrtfpr = peer_cert.as_ref().map(|p| ca::fingerprint(&p.leaf));
            tls_log.usedcrtfpr = Some(record.fingerprint.clone());
        }

        let server_config = relaytls::server_config(&record, &ctx.session_caches, ctx.forge.clone(), peer_cert.clone())
            .map_err(|e| RelayError::ForgeFailed(e.to_string()))?;
        let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));
        let tls_stream = acceptor.accept(stream).await.map_err(RelayError::Io)?;
        let pipe = Pipe::tls_server(tls_stream);
        tls_log.sproto = pipe.tls_info();
        pipe
    } else {
        Pipe::plain(stream)
    };

    state = ConnState::Relaying;
    debug!(?state, conn_id, "entering relay");

    let outcome = run_relay(&shared, src_pipe, e2src_pipe).await;

    let released = shared.meta.release_parent();
    if released && !shared.meta.has_children() {
        shared.meta.shut_down_mirror_listener();
    }

    log_connect(&ctx, peer_addr, dst_addr, passthrough, want_tls, &tls_log, &shared);
    debug!(conn_id, "interception complete");

    outcome
}

/// Peek up to [`PEEK_SIZE`] bytes non-destructively, retrying a truncated
/// read up to [`MAX_PEEK_RETRIES`] times (spec.md §4.3 PEEKING, §6 "SNI
/// peek"). Because the peek never consumes bytes, there is no buffered
/// data to carry over once a TLS accept later reads the same socket — see
/// DESIGN.md's note on why `upgrade_in_place` collapses to a plain accept
/// here.
async fn peek_clienthello_loop(stream: &TcpStream) -> Result<ClientHelloPeek, RelayError> {
    let mut buf = vec![0u8; PEEK_SIZE];
    for attempt in 0..MAX_PEEK_RETRIES {
        let n = stream.peek(&mut buf).await.map_err(RelayError::Io)?;
        if n == 0 {
            return Err(RelayError::ClientHelloTruncated(attempt));
        }
        match peek_client_hello(&buf[..n]) {
            ClientHelloPeek::Truncated if n < PEEK_SIZE => {
                tokio::time::sleep(PEEK_RETRY_DELAY).await;
                continue;
            }
            other => return Ok(other),
        }
    }
    Err(RelayError::ClientHelloTruncated(MAX_PEEK_RETRIES))
}

/// Connect to `dst_addr` and perform a TLS handshake observing (but never
/// validating) whatever certificate chain is presented. The connection is
/// then released — the parent never relays real traffic over its own dst
/// pipe (see module docs) — having served only to capture the peer
/// leaf/chain and negotiated protocol for the forge pipeline and the
/// connect-log `dproto` field.
async fn connect_dst_tls(
    ctx: &ListenerContext,
    dst_addr: SocketAddr,
    sni: Option<&str>,
) -> Result<(PeerCertInfo, Option<(String, String)>), RelayError> {
    let raw = TcpStream::connect(dst_addr).await.map_err(RelayError::Io)?;
    let domain = sni.map(str::to_string).unwrap_or_else(|| dst_addr.ip().to_string());

    let (client_config, observed) = relaytls::client_config(dst_addr, &domain, &ctx.session_caches);
    let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));

    let server_name = match domain.parse::<std::net::IpAddr>() {
        Ok(ip) => ServerName::IpAddress(ip.into()),
        Err(_) => {
            ServerName::try_from(domain.clone()).map_err(|_| RelayError::DnsResolutionFailed(domain.clone()))?
        }
    };

    let tls_stream = connector.connect(server_name, raw).await.map_err(RelayError::Io)?;
    let pipe = Pipe::tls_client(tls_stream);
    let proto = pipe.tls_info();
    pipe.release().await;

    let mut chain = observed.lock().unwrap().take().unwrap_or_default();
    if chain.is_empty() {
        return Err(RelayError::ForgeFailed("no peer certificate observed".into()));
    }
    let leaf = chain.remove(0);
    Ok((PeerCertInfo { leaf, chain }, proto))
}

/// Drive the parent's relay (spec.md §4.5 "Parent"): `src` → (filter,
/// inject once, OCSP check) → `e2src`, and `e2src` → `src` unmodified. Runs
/// until both directions hit EOF and the teardown predicate is satisfied,
/// per spec.md §4.6.
async fn run_relay(shared: &Arc<ConnShared>, src: Pipe, e2src: Pipe) -> Result<(), RelayError> {
    let (mut src_rd, mut src_wr) = tokio::io::split(src);
    let (mut e2src_rd, mut e2src_wr) = tokio::io::split(e2src);

    let mut src_eof = false;
    let mut e2src_eof = false;
    let mut injected = false;
    let mut src_buf = vec![0u8; HIGH_WATER_MARK];
    let mut e2src_buf = vec![0u8; HIGH_WATER_MARK];

    while !(src_eof && e2src_eof) {
        shared.meta.set_parent_eof(src_eof, e2src_eof);

        tokio::select! {
            result = src_rd.read(&mut src_buf), if !src_eof => {
                match result {
                    Ok(0) => { src_eof = true; let _ = e2src_wr.shutdown().await; }
                    Ok(n) => {
                        let chunk = &src_buf[..n];
                        let forward = if !injected {
                            match filter::filter_request(chunk, Some(shared.meta.mirror_addr)) {
                                filter::FilterOutcome::Filtered { output, meta } => {
                                    injected = true;
                                    if !shared.enomem.get() {
                                        let mut log = shared.http_log.lock().unwrap();
                                        log.method = meta.method.clone();
                                        log.uri = meta.uri.clone();
                                        log.host = meta.host.clone();
                                    }
                                    if let (Some(method), Some(uri)) = (&meta.method, &meta.uri) {
                                        if ocsp::is_ocsp_request(method, uri, meta.content_type.as_deref()) {
                                            shared.content_log.log("ocsp-request", chunk).await;
                                            shared.ocsp_denied.store(true, Ordering::Relaxed);
                                            shared.content_log.log("ocsp-response", ocsp::OCSP_DENIAL_RESPONSE).await;
                                            let _ = src_wr.write_all(ocsp::OCSP_DENIAL_RESPONSE).await;
                                            let _ = src_wr.flush().await;
                                            src_eof = true;
                                            e2src_eof = true;
                                            break;
                                        }
                                    }
                                    output
                                }
                                filter::FilterOutcome::PassThrough => {
                                    // No complete header block in the first segment: per
                                    // spec.md §9 ("first-segment injection"), forward
                                    // unchanged and never try again.
                                    injected = true;
                                    chunk.to_vec()
                                }
                            }
                        } else {
                            chunk.to_vec()
                        };

                        if e2src_wr.write_all(&forward).await.is_err() {
                            e2src_eof = true;
                        }
                    }
                    Err(e) => {
                        if is_routine_handshake_failure(&e) {
                            debug!(error = %e, "src read error (routine handshake failure)");
                        } else {
                            warn!(error = %e, "src read error");
                        }
                        src_eof = true;
                    }
                }
            }
            result = e2src_rd.read(&mut e2src_buf), if !e2src_eof => {
                match result {
                    Ok(0) => { e2src_eof = true; let _ = src_wr.shutdown().await; }
                    Ok(n) => {
                        if src_wr.write_all(&e2src_buf[..n]).await.is_err() {
                            src_eof = true;
                        }
                    }
                    Err(e) => {
                        if is_routine_handshake_failure(&e) {
                            debug!(error = %e, "e2src read error (routine handshake failure)");
                        } else {
                            warn!(error = %e, "e2src read error");
                        }
                        e2src_eof = true;
                    }
                }
            }
        }

        let src_state = teardown::EndpointState { eof: src_eof, input_empty: true };
        let e2src_state = teardown::EndpointState { eof: e2src_eof, input_empty: true };
        if teardown::parent_ready_to_free(src_state, e2src_state, shared.meta.initialized(), shared.meta.has_children()) {
            break;
        }
    }

    shared.meta.set_parent_eof(true, true);

    let src = src_rd.unsplit(src_wr);
    let e2src = e2src_rd.unsplit(e2src_wr);
    src.release().await;
    e2src.release().await;

    Ok(())
}

fn log_connect(
    ctx: &ListenerContext,
    peer_addr: SocketAddr,
    dst_addr: SocketAddr,
    passthrough: bool,
    want_tls: bool,
    tls_log: &connlog::TlsLogFields,
    shared: &ConnShared,
) {
    let http_log = shared.http_log.lock().unwrap();
    let ocsp_denied = shared.ocsp_denied.load(Ordering::Relaxed);

    if shared.enomem.get() {
        // spec.md §7: the next teardown checkpoint after an allocation
        // failure frees the ctx with a terminating log line instead of the
        // usual connect-log entry, since the fields it would need were
        // skipped above.
        warn!(peer = %peer_addr, dst = %dst_addr, error = %RelayError::OutOfMemory, "connection torn down after out-of-memory condition");
        return;
    }

    if http_log.method.is_some() {
        let mut fields = http_log.clone();
        fields.ocsp_denied = ocsp_denied;
        let kind = if want_tls { "https" } else { "http" };
        connlog::log_http(kind, peer_addr, dst_addr, &fields);
    } else if want_tls {
        let kind = if ctx.config.upgrade { "upgrade" } else { "ssl" };
        connlog::log_tls(kind, peer_addr, dst_addr, tls_log);
    } else if passthrough {
        connlog::log_tcp("passthrough", peer_addr, dst_addr);
    } else {
        connlog::log_tcp("tcp", peer_addr, dst_addr);
    }

    info!(peer = %peer_addr, dst = %dst_addr, "connection logged");
}
