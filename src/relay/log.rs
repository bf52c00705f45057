//! Connect-log line formatting (spec.md §6). One line per completed
//! connection, emitted under the `connect_log` tracing target so it can be
//! filtered or redirected independently of the rest of the diagnostic
//! stream (see `telemetry::init_telemetry`).

use std::net::SocketAddr;

const MISSING: &str = "-";

fn field(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or(MISSING)
}

/// Plain TCP or passthrough connect-log line.
pub fn log_tcp(kind: &str, src: SocketAddr, dst: SocketAddr) {
    tracing::info!(target: "connect_log", "{kind} {} {} {} {}", src.ip(), src.port(), dst.ip(), dst.port());
}

#[derive(Debug, Default, Clone)]
pub struct TlsLogFields {
    pub sni: Option<String>,
    pub names: Vec<String>,
    pub sproto: Option<(String, String)>,
    pub dproto: Option<(String, String)>,
    pub origcrtfpr: Option<String>,
    pub usedcrtfpr: Option<String>,
}

/// TLS connect-log line (`ssl` or `upgrade`).
pub fn log_tls(kind: &str, src: SocketAddr, dst: SocketAddr, fields: &TlsLogFields) {
    let names = if fields.names.is_empty() {
        MISSING.to_string()
    } else {
        fields.names.join(",")
    };
    let sproto = fields
        .sproto
        .as_ref()
        .map(|(v, c)| format!("{v}:{c}"))
        .unwrap_or_else(|| MISSING.to_string());
    let dproto = fields
        .dproto
        .as_ref()
        .map(|(v, c)| format!("{v}:{c}"))
        .unwrap_or_else(|| MISSING.to_string());

    tracing::info!(
        target: "connect_log",
        "{kind} {} {} {} {} sni:{} names:{} sproto:{} dproto:{} origcrt:{} usedcrt:{}",
        src.ip(),
        src.port(),
        dst.ip(),
        dst.port(),
        field(&fields.sni),
        names,
        sproto,
        dproto,
        field(&fields.origcrtfpr),
        field(&fields.usedcrtfpr),
    );
}

#[derive(Debug, Default, Clone)]
pub struct HttpLogFields {
    pub host: Option<String>,
    pub method: Option<String>,
    pub uri: Option<String>,
    pub status: Option<String>,
    pub content_length: Option<String>,
    pub ocsp_denied: bool,
}

/// HTTP/HTTPS connect-log line.
pub fn log_http(kind: &str, src: SocketAddr, dst: SocketAddr, fields: &HttpLogFields) {
    let suffix = if fields.ocsp_denied { " ocsp:denied" } else { "" };
    tracing::info!(
        target: "connect_log",
        "{kind} {} {} {} {} {} {} {} {} {}{suffix}",
        src.ip(),
        src.port(),
        dst.ip(),
        dst.port(),
        field(&fields.host),
        field(&fields.method),
        field(&fields.uri),
        field(&fields.status),
        field(&fields.content_length),
    );
}
