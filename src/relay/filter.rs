//! HTTP/1.x header-block filtering (spec.md §4.4), applied line-by-line to
//! the request header block in the src→e2src direction and the response
//! header block in the reverse direction.
//!
//! Both filters only ever see the first buffered segment of a direction:
//! if that segment doesn't contain a complete header block (`\r\n\r\n`),
//! the data is forwarded unchanged and no later attempt is made to find
//! the boundary across segments (spec.md §9, "Open question — first-segment
//! injection" — a documented limitation, not a bug).

use std::net::SocketAddr;

/// Metadata captured while filtering a request header block, for the
/// connect-log line (spec.md §6).
#[derive(Debug, Default, Clone)]
pub struct RequestMeta {
    pub method: Option<String>,
    pub uri: Option<String>,
    pub host: Option<String>,
    pub content_type: Option<String>,
}

/// Metadata captured while filtering a response header block.
#[derive(Debug, Default, Clone)]
pub struct ResponseMeta {
    pub status: Option<String>,
    pub content_length: Option<String>,
}

/// Outcome of attempting to filter one direction's first segment.
pub enum FilterOutcome<M> {
    /// The segment contained a complete header block; `output` is the
    /// filtered bytes (headers plus any trailing body bytes in the same
    /// segment) and `meta` the captured fields.
    Filtered { output: Vec<u8>, meta: M },
    /// No complete header block was present (or the data isn't HTTP at
    /// all, e.g. HTTP/0.9 or not even that); `buf` must be forwarded
    /// unchanged and no further filtering is attempted on this direction.
    PassThrough,
}

const HEADER_END: &[u8] = b"\r\n\r\n";

/// Filter the request header block, injecting `Connection: close` if the
/// client didn't set one and, if `mirror_addr` is given, the
/// `SSLproxy-Addr:` header immediately before the terminating blank line
/// (spec.md §4.4, §4.4 "Mirror-address injection", §6).
pub fn filter_request(buf: &[u8], mirror_addr: Option<SocketAddr>) -> FilterOutcome<RequestMeta> {
    let Some(header_end) = find_header_end(buf) else {
        return FilterOutcome::PassThrough;
    };

    let header_block = &buf[..header_end];
    let tail = &buf[header_end + HEADER_END.len()..];

    let mut lines = split_lines(header_block);
    let Some(first_line) = lines.next() else {
        return FilterOutcome::PassThrough;
    };
    let first_line = String::from_utf8_lossy(first_line).into_owned();
    let parts: Vec<&str> = first_line.split(' ').collect();

    if parts.len() < 2 {
        // No spaces at all: not HTTP.
        return FilterOutcome::PassThrough;
    }
    if parts.len() == 2 {
        // HTTP/0.9: request line only, header block ends immediately.
        let mut output = first_line.into_bytes();
        output.extend_from_slice(b"\r\n\r\n");
        output.extend_from_slice(tail);
        return FilterOutcome::Filtered {
            output,
            meta: RequestMeta {
                method: Some(parts[0].to_string()),
                uri: Some(parts[1].to_string()),
                ..Default::default()
            },
        };
    }

    let mut meta = RequestMeta {
        method: Some(parts[0].to_string()),
        uri: Some(parts[1].to_string()),
        ..Default::default()
    };

    let mut out_lines: Vec<String> = vec![first_line];
    let mut saw_connection = false;

    for line in lines {
        let line = String::from_utf8_lossy(line).into_owned();
        let lower = line.to_ascii_lowercase();

        if let Some(value) = strip_header(&lower, &line, "host:") {
            meta.host = Some(value.trim().to_string());
            out_lines.push(line);
        } else if let Some(value) = strip_header(&lower, &line, "content-type:") {
            meta.content_type = Some(value.trim().to_string());
            out_lines.push(line);
        } else if lower.starts_with("connection:") {
            out_lines.push("Connection: close".to_string());
            saw_connection = true;
        } else if lower.starts_with("accept-encoding:") || lower.starts_with("keep-alive:") {
            // dropped
        } else {
            out_lines.push(line);
        }
    }

    if !saw_connection {
        out_lines.push("Connection: close".to_string());
    }

    if let Some(addr) = mirror_addr {
        out_lines.push(format!("SSLproxy-Addr: [{}]:{}", addr.ip(), addr.port()));
    }

    let mut output = out_lines.join("\r\n").into_bytes();
    output.extend_from_slice(b"\r\n\r\n");
    output.extend_from_slice(tail);

    FilterOutcome::Filtered { output, meta }
}

/// Filter the response header block, dropping HPKP/HSTS/Alternate-Protocol
/// headers (spec.md §4.4).
pub fn filter_response(buf: &[u8]) -> FilterOutcome<ResponseMeta> {
    let Some(header_end) = find_header_end(buf) else {
        return FilterOutcome::PassThrough;
    };

    let header_block = &buf[..header_end];
    let tail = &buf[header_end + HEADER_END.len()..];

    let mut lines = split_lines(header_block);
    let Some(first_line) = lines.next() else {
        return FilterOutcome::PassThrough;
    };
    let first_line = String::from_utf8_lossy(first_line).into_owned();

    if !first_line.starts_with("HTTP") {
        return FilterOutcome::PassThrough;
    }

    let status = first_line.splitn(3, ' ').nth(1).map(|s| s.to_string());
    let mut meta = ResponseMeta {
        status,
        content_length: None,
    };

    let mut out_lines: Vec<String> = vec![first_line];

    for line in lines {
        let line = String::from_utf8_lossy(line).into_owned();
        let lower = line.to_ascii_lowercase();

        if let Some(value) = strip_header(&lower, &line, "content-length:") {
            meta.content_length = Some(value.trim().to_string());
            out_lines.push(line);
        } else if lower.starts_with("public-key-pins:")
            || lower.starts_with("public-key-pins-report-only:")
            || lower.starts_with("strict-transport-security:")
            || lower.starts_with("alternate-protocol:")
        {
            // dropped
        } else {
            out_lines.push(line);
        }
    }

    let mut output = out_lines.join("\r\n").into_bytes();
    output.extend_from_slice(b"\r\n\r\n");
    output.extend_from_slice(tail);

    FilterOutcome::Filtered { output, meta }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_END.len()).position(|w| w == HEADER_END)
}

fn split_lines(block: &[u8]) -> impl Iterator<Item = &[u8]> {
    block.split(|&b| b == b'\n').map(|line| {
        if line.last() == Some(&b'\r') {
            &line[..line.len() - 1]
        } else {
            line
        }
    })
}

fn strip_header<'a>(lower: &str, original: &'a str, prefix: &str) -> Option<&'a str> {
    if lower.starts_with(prefix) {
        Some(&original[prefix.len()..])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_s1_request_filter_and_injection() {
        let req = b"GET / HTTP/1.1\r\nHost: x.test\r\nAccept-Encoding: gzip\r\nKeep-Alive: 30\r\nConnection: keep-alive\r\n\r\n";
        let mirror: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        match filter_request(req, Some(mirror)) {
            FilterOutcome::Filtered { output, meta } => {
                assert_eq!(meta.host.as_deref(), Some("x.test"));
                let text = String::from_utf8(output).unwrap();
                assert_eq!(
                    text,
                    "GET / HTTP/1.1\r\nHost: x.test\r\nConnection: close\r\nSSLproxy-Addr: [127.0.0.1]:9999\r\n\r\n"
                );
            }
            FilterOutcome::PassThrough => panic!("expected Filtered"),
        }
    }

    #[test]
    fn test_request_no_connection_header_gets_close_injected() {
        let req = b"GET /a HTTP/1.1\r\nHost: y.test\r\n\r\n";
        match filter_request(req, None) {
            FilterOutcome::Filtered { output, .. } => {
                let text = String::from_utf8(output).unwrap();
                assert!(text.contains("Connection: close"));
            }
            FilterOutcome::PassThrough => panic!("expected Filtered"),
        }
    }

    #[test]
    fn test_http09_ends_header_block_immediately() {
        let req = b"GET /\r\n";
        match filter_request(req, None) {
            FilterOutcome::PassThrough => {}
            FilterOutcome::Filtered { .. } => panic!("HTTP/0.9 has no \\r\\n\\r\\n, must pass through"),
        }
    }

    #[test]
    fn test_non_http_passes_through() {
        assert!(matches!(filter_request(b"not http at all", None), FilterOutcome::PassThrough));
    }

    #[test]
    fn test_incomplete_header_block_passes_through() {
        let req = b"GET / HTTP/1.1\r\nHost: x.test\r\n";
        assert!(matches!(filter_request(req, None), FilterOutcome::PassThrough));
    }

    #[test]
    fn test_response_filter_drops_hsts_and_captures_length() {
        let resp = b"HTTP/1.1 200 OK\r\nContent-Length: 42\r\nStrict-Transport-Security: max-age=1\r\nPublic-Key-Pins: x\r\n\r\nbody";
        match filter_response(resp) {
            FilterOutcome::Filtered { output, meta } => {
                assert_eq!(meta.content_length.as_deref(), Some("42"));
                assert_eq!(meta.status.as_deref(), Some("200"));
                let text = String::from_utf8(output).unwrap();
                assert!(!text.contains("Strict-Transport-Security"));
                assert!(!text.contains("Public-Key-Pins"));
                assert!(text.ends_with("body"));
            }
            FilterOutcome::PassThrough => panic!("expected Filtered"),
        }
    }
}
