//! Non-destructive peek at a raw TLS ClientHello to extract the SNI
//! hostname, without completing (or even starting) a TLS handshake.
//!
//! Grounded on the teacher's `proxy/tls_mitm.rs::extract_sni`, extended
//! per spec.md §4.3/§6: the original only ever saw a single full peek
//! buffer; this version distinguishes "not TLS", "truncated, retry", and
//! "parsed" so the PEEKING state can bound its retry loop.

/// Outcome of inspecting a peeked buffer for a ClientHello.
#[derive(Debug, PartialEq, Eq)]
pub enum ClientHelloPeek {
    /// The buffer is not the start of a TLS handshake record at all.
    NotTls,
    /// Looks like a handshake record but doesn't yet contain a complete
    /// ClientHello; the caller should peek again after more bytes arrive.
    Truncated,
    /// A complete ClientHello was parsed. `sni` is `None` if the client
    /// didn't send a `server_name` extension.
    Complete { sni: Option<String> },
}

/// Maximum peek size (spec.md §6, "SNI peek").
pub const PEEK_SIZE: usize = 1024;

/// Bounded retry count and delay for a truncated peek (spec.md §4.3/§5).
pub const MAX_PEEK_RETRIES: usize = 50;
pub const PEEK_RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(100);

/// Parse a peeked buffer, distinguishing "not a TLS handshake", "truncated,
/// need more bytes", and "parsed, here is the SNI (if any)".
pub fn peek_client_hello(buf: &[u8]) -> ClientHelloPeek {
    // TLS record: type(1) + version(2) + length(2) + handshake
    if buf.len() < 5 {
        return ClientHelloPeek::Truncated;
    }
    if buf[0] != 0x16 {
        return ClientHelloPeek::NotTls;
    }

    let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    if buf.len() < 5 + record_len {
        // Caller peeked the socket, not a fixed slice; record may simply not
        // have arrived yet.
        return ClientHelloPeek::Truncated;
    }
    let handshake = &buf[5..5 + record_len];

    // Handshake: type(1) + length(3) + ClientHello
    if handshake.len() < 4 {
        return ClientHelloPeek::Truncated;
    }
    if handshake[0] != 0x01 {
        return ClientHelloPeek::NotTls;
    }

    let hs_len = u32::from_be_bytes([0, handshake[1], handshake[2], handshake[3]]) as usize;
    if handshake.len() < 4 + hs_len {
        return ClientHelloPeek::Truncated;
    }
    let client_hello = &handshake[4..4 + hs_len];

    match parse_client_hello_body(client_hello) {
        Some(sni) => ClientHelloPeek::Complete { sni },
        None => ClientHelloPeek::Truncated,
    }
}

/// Parse the body of a ClientHello (after the 4-byte handshake header),
/// returning `Some(sni)` once the structure is fully present (SNI itself
/// may legitimately be absent: `Some(None)`). Returns `None` only when the
/// body is internally inconsistent/truncated.
fn parse_client_hello_body(client_hello: &[u8]) -> Option<Option<String>> {
    // version(2) + random(32) + session_id(1+var)
    if client_hello.len() < 34 {
        return None;
    }
    let mut pos = 34;

    if pos >= client_hello.len() {
        return None;
    }
    let session_id_len = client_hello[pos] as usize;
    pos += 1 + session_id_len;

    if pos + 2 > client_hello.len() {
        return None;
    }
    let cipher_suites_len = u16::from_be_bytes([client_hello[pos], client_hello[pos + 1]]) as usize;
    pos += 2 + cipher_suites_len;

    if pos >= client_hello.len() {
        return None;
    }
    let compression_len = client_hello[pos] as usize;
    pos += 1 + compression_len;

    if pos == client_hello.len() {
        // No extensions block at all: legal ClientHello, no SNI.
        return Some(None);
    }

    if pos + 2 > client_hello.len() {
        return None;
    }
    let extensions_len = u16::from_be_bytes([client_hello[pos], client_hello[pos + 1]]) as usize;
    pos += 2;

    if pos + extensions_len > client_hello.len() {
        return None;
    }
    let extensions_end = pos + extensions_len;

    while pos + 4 <= extensions_end {
        let ext_type = u16::from_be_bytes([client_hello[pos], client_hello[pos + 1]]);
        let ext_len = u16::from_be_bytes([client_hello[pos + 2], client_hello[pos + 3]]) as usize;
        pos += 4;

        if pos + ext_len > extensions_end {
            return None;
        }

        if ext_type == 0x0000 {
            // server_name_list_length(2) + server_name_type(1) + host_name_length(2) + host_name
            if ext_len < 5 {
                return Some(None);
            }
            let name_type = client_hello[pos + 2];
            if name_type != 0x00 {
                return Some(None);
            }
            let name_len =
                u16::from_be_bytes([client_hello[pos + 3], client_hello[pos + 4]]) as usize;
            if pos + 5 + name_len > extensions_end {
                return None;
            }
            let name = &client_hello[pos + 5..pos + 5 + name_len];
            return Some(String::from_utf8(name.to_vec()).ok());
        }

        pos += ext_len;
    }

    Some(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_tls() {
        assert_eq!(peek_client_hello(b"GET / HTTP/1.1\r\n"), ClientHelloPeek::NotTls);
        assert_eq!(peek_client_hello(b""), ClientHelloPeek::Truncated);
    }

    fn build_client_hello(sni: Option<&str>) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]); // version
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0); // session id len
        body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]); // cipher suites
        body.push(1); // compression methods len
        body.push(0); // null compression

        let mut extensions = Vec::new();
        if let Some(name) = sni {
            let mut sni_ext = Vec::new();
            let name_bytes = name.as_bytes();
            sni_ext.extend_from_slice(&((name_bytes.len() + 3) as u16).to_be_bytes());
            sni_ext.push(0x00); // host_name
            sni_ext.extend_from_slice(&(name_bytes.len() as u16).to_be_bytes());
            sni_ext.extend_from_slice(name_bytes);

            extensions.extend_from_slice(&0x0000u16.to_be_bytes());
            extensions.extend_from_slice(&(sni_ext.len() as u16).to_be_bytes());
            extensions.extend_from_slice(&sni_ext);
        }
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut handshake = Vec::new();
        handshake.push(0x01); // ClientHello
        let len = body.len() as u32;
        handshake.extend_from_slice(&len.to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = Vec::new();
        record.push(0x16); // handshake record
        record.extend_from_slice(&[0x03, 0x01]); // legacy record version
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn test_complete_with_sni() {
        let record = build_client_hello(Some("example.test"));
        match peek_client_hello(&record) {
            ClientHelloPeek::Complete { sni } => assert_eq!(sni.as_deref(), Some("example.test")),
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[test]
    fn test_complete_without_sni() {
        let record = build_client_hello(None);
        assert_eq!(
            peek_client_hello(&record),
            ClientHelloPeek::Complete { sni: None }
        );
    }

    #[test]
    fn test_truncated_record() {
        let record = build_client_hello(Some("example.test"));
        let truncated = &record[..record.len() - 5];
        assert_eq!(peek_client_hello(truncated), ClientHelloPeek::Truncated);
    }

    #[test]
    fn test_truncated_header() {
        assert_eq!(peek_client_hello(&[0x16, 0x03, 0x01]), ClientHelloPeek::Truncated);
    }
}
