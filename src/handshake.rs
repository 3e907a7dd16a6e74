use std::collections::HashMap;

use sha1::{Digest, Sha1};

use crate::errors::WsError;

const GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// handshake responses above this size fail the connection
pub(crate) const MAX_RESPONSE_LEN: usize = 16 * 1024;

/// `Sec-WebSocket-Key` value, base64 of 16 random bytes
pub fn gen_key() -> String {
    let r: [u8; 16] = rand::random();
    base64::encode(r)
}

/// compute the expected `Sec-WebSocket-Accept` value for a key
pub fn cal_accept_key(key: &str) -> String {
    let mut sha1 = Sha1::default();
    sha1.update(key.as_bytes());
    sha1.update(GUID);
    base64::encode(sha1.finalize())
}

/// validated 101 response
#[derive(Debug)]
pub struct HandshakeOutcome {
    /// protocol picked by the server, when any were offered
    pub subprotocol: Option<String>,
    /// all response headers, names lowercased
    pub headers: HashMap<String, String>,
}

/// render the upgrade request
///
/// header order follows the RFC example: required upgrade headers first,
/// then `Origin` and `Sec-WebSocket-Protocol` when configured, then any
/// user supplied headers
pub fn build_request(
    host: &str,
    port: u16,
    path: &str,
    key: &str,
    origin: Option<&str>,
    subprotocols: &[String],
    extra_headers: &[(String, String)],
) -> String {
    let mut lines = vec![
        format!("GET {path} HTTP/1.1"),
        format!("Host: {host}:{port}"),
        "Upgrade: websocket".to_string(),
        "Connection: Upgrade".to_string(),
        format!("Sec-WebSocket-Key: {key}"),
        "Sec-WebSocket-Version: 13".to_string(),
    ];
    if let Some(origin) = origin {
        lines.push(format!("Origin: {origin}"));
    }
    if !subprotocols.is_empty() {
        lines.push(format!(
            "Sec-WebSocket-Protocol: {}",
            subprotocols.join(", ")
        ));
    }
    for (name, value) in extra_headers {
        lines.push(format!("{name}: {value}"));
    }
    lines.push("\r\n".to_string());
    lines.join("\r\n")
}

/// index just past the CRLFCRLF terminating the response head
pub fn header_block_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

/// validate a complete 101 response against the sent key and offer
pub fn check_response(
    raw: &[u8],
    key: &str,
    offered: &[String],
) -> Result<HandshakeOutcome, WsError> {
    let mut header_buf = [httparse::EMPTY_HEADER; 64];
    let mut resp = httparse::Response::new(&mut header_buf);
    match resp.parse(raw) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(WsError::HandshakeFailed("truncated response".to_string()));
        }
        Err(e) => {
            return Err(WsError::HandshakeFailed(format!("invalid response: {e}")));
        }
    }
    if resp.code != Some(101) {
        return Err(WsError::HandshakeFailed(format!(
            "expect 101 response, got {:?} {:?}",
            resp.code, resp.reason
        )));
    }

    let mut headers = HashMap::new();
    for header in resp.headers.iter() {
        headers.insert(
            header.name.to_ascii_lowercase(),
            String::from_utf8_lossy(header.value).to_string(),
        );
    }

    match headers.get("upgrade") {
        Some(v) if v.eq_ignore_ascii_case("websocket") => {}
        other => {
            return Err(WsError::HandshakeFailed(format!(
                "missing or invalid upgrade header: {other:?}"
            )));
        }
    }
    let connection_ok = headers
        .get("connection")
        .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")))
        .unwrap_or(false);
    if !connection_ok {
        return Err(WsError::HandshakeFailed(
            "connection header missing upgrade token".to_string(),
        ));
    }
    let expected = cal_accept_key(key);
    match headers.get("sec-websocket-accept") {
        Some(got) if *got == expected => {}
        got => {
            return Err(WsError::HandshakeFailed(format!(
                "mismatch accept key, expect {expected}, got {got:?}"
            )));
        }
    }

    let subprotocol = if offered.is_empty() {
        None
    } else {
        match headers.get("sec-websocket-protocol") {
            Some(picked) if offered.iter().any(|p| p == picked) => Some(picked.clone()),
            Some(picked) => {
                return Err(WsError::HandshakeFailed(format!(
                    "server picked unoffered subprotocol {picked}"
                )));
            }
            None => {
                return Err(WsError::HandshakeFailed(
                    "server ignored offered subprotocols".to_string(),
                ));
            }
        }
    };
    tracing::debug!(?subprotocol, "protocol handshake complete");
    Ok(HandshakeOutcome {
        subprotocol,
        headers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 6455 section 1.3 example pair
    const SAMPLE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
    const SAMPLE_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

    fn response(accept: &str, extra: &str) -> Vec<u8> {
        format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {accept}\r\n\
             {extra}\r\n"
        )
        .into_bytes()
    }

    #[test]
    fn accept_key_matches_rfc_example() {
        assert_eq!(cal_accept_key(SAMPLE_KEY), SAMPLE_ACCEPT);
    }

    #[test]
    fn generated_keys_are_16_random_bytes() {
        let a = gen_key();
        let b = gen_key();
        assert_ne!(a, b);
        assert_eq!(base64::decode(&a).unwrap().len(), 16);
    }

    #[test]
    fn request_carries_required_headers() {
        let req = build_request(
            "example.com",
            80,
            "/chat",
            SAMPLE_KEY,
            Some("http://example.com"),
            &["chat".to_string(), "superchat".to_string()],
            &[("X-Auth".to_string(), "token".to_string())],
        );
        assert!(req.starts_with("GET /chat HTTP/1.1\r\n"));
        assert!(req.contains("Host: example.com:80\r\n"));
        assert!(req.contains("Upgrade: websocket\r\n"));
        assert!(req.contains("Connection: Upgrade\r\n"));
        assert!(req.contains(&format!("Sec-WebSocket-Key: {SAMPLE_KEY}\r\n")));
        assert!(req.contains("Sec-WebSocket-Version: 13\r\n"));
        assert!(req.contains("Origin: http://example.com\r\n"));
        assert!(req.contains("Sec-WebSocket-Protocol: chat, superchat\r\n"));
        assert!(req.contains("X-Auth: token\r\n"));
        assert!(req.ends_with("\r\n\r\n"));
    }

    #[test]
    fn valid_response_accepted() {
        let raw = response(SAMPLE_ACCEPT, "");
        let outcome = check_response(&raw, SAMPLE_KEY, &[]).unwrap();
        assert_eq!(outcome.subprotocol, None);
    }

    #[test]
    fn header_matching_is_case_insensitive() {
        let raw = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             upgrade: WebSocket\r\n\
             connection: keep-alive, Upgrade\r\n\
             sec-websocket-accept: {SAMPLE_ACCEPT}\r\n\r\n"
        );
        assert!(check_response(raw.as_bytes(), SAMPLE_KEY, &[]).is_ok());
    }

    #[test]
    fn bad_accept_key_rejected() {
        let raw = response("bm90IHRoZSByaWdodCBoYXNoAA==", "");
        assert!(matches!(
            check_response(&raw, SAMPLE_KEY, &[]),
            Err(WsError::HandshakeFailed(_))
        ));
    }

    #[test]
    fn missing_upgrade_rejected() {
        let raw = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {SAMPLE_ACCEPT}\r\n\r\n"
        );
        assert!(check_response(raw.as_bytes(), SAMPLE_KEY, &[]).is_err());
    }

    #[test]
    fn non_101_rejected() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n";
        assert!(check_response(raw, SAMPLE_KEY, &[]).is_err());
    }

    #[test]
    fn subprotocol_negotiation() {
        let offered = vec!["chat".to_string(), "superchat".to_string()];
        let raw = response(SAMPLE_ACCEPT, "Sec-WebSocket-Protocol: superchat\r\n");
        let outcome = check_response(&raw, SAMPLE_KEY, &offered).unwrap();
        assert_eq!(outcome.subprotocol.as_deref(), Some("superchat"));

        let raw = response(SAMPLE_ACCEPT, "Sec-WebSocket-Protocol: other\r\n");
        assert!(check_response(&raw, SAMPLE_KEY, &offered).is_err());

        let raw = response(SAMPLE_ACCEPT, "");
        assert!(check_response(&raw, SAMPLE_KEY, &offered).is_err());
    }

    #[test]
    fn header_block_end_detection() {
        assert_eq!(header_block_end(b"HTTP/1.1 101\r\n"), None);
        assert_eq!(header_block_end(b"HTTP/1.1 101\r\n\r\nrest"), Some(16));
    }
}
