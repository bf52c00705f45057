//! OCSP request detection and the canned denial response (spec.md §4.3
//! "OCSP denial", §6), grounded on `pxy_ocsp_is_valid_uri`/`pxy_ocsp_deny`
//! in the original.

/// Exact bytes of the OCSP denial response (spec.md §6).
pub const OCSP_DENIAL_RESPONSE: &[u8] = b"HTTP/1.0 200 OK\r\nContent-Type: application/ocsp-response\r\nContent-Length: 5\r\nConnection: close\r\n\r\n\x30\x03\x0a\x01\x03";

/// True if `method`/`uri`/`content_type` describe an OCSP request: a GET
/// whose URI's last path segment base64url-decodes to an ASN.1 SEQUENCE
/// (tag `0x30`) longer than 32 bytes, or a POST with
/// `Content-Type: application/ocsp-request`.
pub fn is_ocsp_request(method: &str, uri: &str, content_type: Option<&str>) -> bool {
    if method.eq_ignore_ascii_case("POST") {
        return content_type
            .map(|ct| ct.eq_ignore_ascii_case("application/ocsp-request"))
            .unwrap_or(false);
    }

    if !method.eq_ignore_ascii_case("GET") {
        return false;
    }

    let Some(segment) = uri.rsplit('/').next() else {
        return false;
    };
    is_ocsp_get_segment(segment)
}

/// The original's quick-reject checks before attempting a full ASN.1
/// parse: the segment must look like base64url (starting `M` or `%`, no
/// literal `?`), and the decoded bytes must start with a SEQUENCE tag and
/// be longer than 32 bytes.
fn is_ocsp_get_segment(segment: &str) -> bool {
    if segment.is_empty() {
        return false;
    }
    let first = segment.as_bytes()[0];
    if first != b'M' && first != b'%' {
        return false;
    }
    if segment.contains('?') {
        return false;
    }

    let Ok(decoded) = base64_url_decode(segment) else {
        return false;
    };

    decoded.first() == Some(&0x30) && decoded.len() > 32
}

fn base64_url_decode(segment: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    URL_SAFE_NO_PAD.decode(segment)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ocsp_get_segment_detection() {
        // A 33-byte ASN.1 SEQUENCE, base64url-encoded, starts with 'M'.
        let mut der = vec![0x30u8, 0x1f];
        der.extend(std::iter::repeat(0x00).take(31));
        let encoded = {
            use base64::engine::general_purpose::URL_SAFE_NO_PAD;
            use base64::Engine;
            URL_SAFE_NO_PAD.encode(&der)
        };
        assert!(encoded.starts_with('M'));
        assert!(is_ocsp_get_segment(&encoded));
    }

    #[test]
    fn test_rejects_non_base64_prefix() {
        assert!(!is_ocsp_get_segment("hello"));
    }

    #[test]
    fn test_rejects_query_string() {
        assert!(!is_ocsp_get_segment("MFEw?x=1"));
    }

    #[test]
    fn test_post_requires_content_type() {
        assert!(is_ocsp_request("POST", "/ocsp", Some("application/ocsp-request")));
        assert!(!is_ocsp_request("POST", "/ocsp", Some("text/plain")));
        assert!(!is_ocsp_request("POST", "/ocsp", None));
    }

    #[test]
    fn test_denial_response_matches_exact_bytes() {
        let expected = b"HTTP/1.0 200 OK\r\nContent-Type: application/ocsp-response\r\nContent-Length: 5\r\nConnection: close\r\n\r\n\x30\x03\x0a\x01\x03";
        assert_eq!(OCSP_DENIAL_RESPONSE, expected);
    }
}
