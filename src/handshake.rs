//! Upgrade handshake messages
//!
//! This module builds, parses and verifies the single request/response pair
//! that switches a connection from HTTP/1.1 to a yamux session:
//!
//! ```text
//! GET <path> HTTP/1.1\r\n
//! Host: <host>\r\n
//! Upgrade: yamux\r\n
//! Connection: Upgrade\r\n
//! <caller headers>\r\n
//! \r\n
//!
//! HTTP/1.1 101 Switching Protocols\r\n
//! Upgrade: yamux\r\n
//! Connection: Upgrade\r\n
//! <sanitized extra headers>\r\n
//! \r\n
//! ```
//!
//! Callers never get to set `Upgrade` or `Connection` themselves; supplying
//! either is an error rather than a silent override.

use std::borrow::Cow;

use bytes::{BufMut, Bytes, BytesMut};
use http::header::{CONNECTION, COOKIE, HOST, UPGRADE};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode, Version};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::UPGRADE_TOKEN;
use crate::cookie::CookieSource;
use crate::error::{Error, Result};
use crate::target::ConnectionTarget;

/// Maximum HTTP header size (8KB should be enough for any reasonable handshake)
pub const MAX_HEADER_SIZE: usize = 8192;

/// Maximum number of headers parsed from a handshake message
pub const MAX_HEADERS: usize = 64;

/// Value of the `Connection` header on both sides of the negotiation
pub const CONNECTION_UPGRADE: &str = "Upgrade";

/// Fail if `headers` carries either negotiation header
fn check_reserved(headers: &HeaderMap) -> Result<()> {
    for name in [UPGRADE, CONNECTION] {
        if headers.contains_key(&name) {
            return Err(Error::DuplicateHeader(name));
        }
    }
    Ok(())
}

fn header_is(headers: &HeaderMap, name: HeaderName, expected: &str) -> bool {
    headers
        .get(name)
        .is_some_and(|value| value.as_bytes() == expected.as_bytes())
}

// ============================================================================
// Client side
// ============================================================================

/// Build the client's upgrade request
///
/// Caller headers are merged after the negotiation headers. Cookies from
/// `cookies` that apply to `target` are appended, one `Cookie` header each;
/// a cookie that cannot be rendered as a header value is skipped with a
/// warning.
///
/// # Errors
///
/// - [`Error::DuplicateHeader`] if `headers` carries `Upgrade`,
///   `Connection` or `Host`. `Host` always comes from `target`.
/// - [`Error::MalformedUri`] if the target's host or request target is not
///   valid on an HTTP/1.1 request line (spaces or control bytes, say).
pub fn build_request(
    target: &ConnectionTarget,
    headers: &HeaderMap,
    cookies: Option<&dyn CookieSource>,
) -> Result<Request<()>> {
    check_reserved(headers)?;
    if headers.contains_key(HOST) {
        return Err(Error::DuplicateHeader(HOST));
    }

    let mut builder = Request::builder()
        .method(Method::GET)
        .uri(target.request_target())
        .version(Version::HTTP_11)
        .header(HOST, target.host())
        .header(UPGRADE, UPGRADE_TOKEN)
        .header(CONNECTION, CONNECTION_UPGRADE);

    if let Some(map) = builder.headers_mut() {
        for (name, value) in headers {
            map.append(name.clone(), value.clone());
        }
    }

    if let Some(source) = cookies {
        for cookie in source.cookies(target) {
            match HeaderValue::try_from(cookie.to_string()) {
                Ok(value) => builder = builder.header(COOKIE, value),
                Err(_) => {
                    tracing::warn!(name = %cookie.name, "skipping cookie that is not a valid header value");
                }
            }
        }
    }

    builder.body(()).map_err(|_| Error::MalformedUri)
}

/// Serialize an upgrade request into its wire form
///
/// `Host`, `Upgrade` and `Connection` always come first, in that order.
pub fn encode_request(request: &Request<()>) -> Bytes {
    let mut buf = BytesMut::with_capacity(512);
    let headers = request.headers();

    buf.put_slice(b"GET ");
    let target = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    buf.put_slice(target.as_bytes());
    buf.put_slice(b" HTTP/1.1\r\n");

    if let Some(host) = headers.get(HOST) {
        buf.put_slice(b"Host: ");
        buf.put_slice(host.as_bytes());
        buf.put_slice(b"\r\n");
    }
    buf.put_slice(b"Upgrade: ");
    buf.put_slice(UPGRADE_TOKEN.as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(b"Connection: ");
    buf.put_slice(CONNECTION_UPGRADE.as_bytes());
    buf.put_slice(b"\r\n");

    for (name, value) in headers {
        if *name == HOST || *name == UPGRADE || *name == CONNECTION {
            continue;
        }
        put_header(&mut buf, name, value.as_bytes());
    }

    buf.put_slice(b"\r\n");
    buf.freeze()
}

fn put_header(buf: &mut BytesMut, name: &HeaderName, value: &[u8]) {
    buf.put_slice(name.as_str().as_bytes());
    buf.put_slice(b": ");
    buf.put_slice(value);
    buf.put_slice(b"\r\n");
}

/// Read and parse an HTTP response head from `stream`
///
/// Bytes after the head are left unread in the internal buffer and dropped;
/// the handshake stream carries nothing else.
pub async fn read_response<S>(stream: &mut S) -> Result<Response<()>>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);

    loop {
        if let Some(response) = parse_response(&buf)? {
            return Ok(response);
        }

        if buf.len() > MAX_HEADER_SIZE {
            return Err(Error::BadHandshake("response too large"));
        }

        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(Error::Transport(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before the handshake response",
            )));
        }
    }
}

/// Parse a complete response head, or `None` if more bytes are needed
pub fn parse_response(buf: &[u8]) -> Result<Option<Response<()>>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut res = httparse::Response::new(&mut headers);

    match res.parse(buf) {
        Ok(httparse::Status::Complete(_)) => {
            let version = match res.version {
                Some(1) => Version::HTTP_11,
                _ => Version::HTTP_10,
            };

            let mut builder = Response::builder()
                .status(res.code.unwrap_or(0))
                .version(version);
            for header in res.headers.iter() {
                builder = builder.header(header.name, header.value);
            }

            builder
                .body(())
                .map(Some)
                .map_err(|_| Error::BadHandshake("malformed response head"))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(_) => Err(Error::BadHandshake("failed to parse HTTP response")),
    }
}

/// Check that a response completes the upgrade
pub fn verify_response(response: &Response<()>) -> Result<()> {
    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Err(Error::BadHandshake("expected 101 Switching Protocols"));
    }
    if response.version() != Version::HTTP_11 {
        return Err(Error::BadHandshake("expected HTTP/1.1"));
    }
    if !header_is(response.headers(), UPGRADE, UPGRADE_TOKEN) {
        return Err(Error::BadHandshake("missing Upgrade: yamux"));
    }
    if !header_is(response.headers(), CONNECTION, CONNECTION_UPGRADE) {
        return Err(Error::BadHandshake("missing Connection: Upgrade"));
    }
    Ok(())
}

// ============================================================================
// Server side
// ============================================================================

/// Returns true if `request` asks to upgrade to a yamux session
pub fn is_upgrade_request<B>(request: &Request<B>) -> bool {
    *request.method() == Method::GET
        && request.version() == Version::HTTP_11
        && header_is(request.headers(), UPGRADE, UPGRADE_TOKEN)
        && header_is(request.headers(), CONNECTION, CONNECTION_UPGRADE)
}

/// Replace every control byte (<= 31) with a space
///
/// Borrows the input unchanged when it holds no control bytes.
pub fn sanitize_header_value(value: &[u8]) -> Cow<'_, [u8]> {
    if !value.iter().any(|&b| b <= 31) {
        return Cow::Borrowed(value);
    }
    Cow::Owned(
        value
            .iter()
            .map(|&b| if b <= 31 { b' ' } else { b })
            .collect(),
    )
}

/// Build the server's 101 response
///
/// The result is a single buffer so it can go out in one write.
pub fn build_response(extra: &HeaderMap) -> Result<Bytes> {
    check_reserved(extra)?;

    let mut buf = BytesMut::with_capacity(256);

    buf.put_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
    buf.put_slice(b"Upgrade: ");
    buf.put_slice(UPGRADE_TOKEN.as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(b"Connection: ");
    buf.put_slice(CONNECTION_UPGRADE.as_bytes());
    buf.put_slice(b"\r\n");

    for (name, value) in extra {
        put_header(&mut buf, name, &sanitize_header_value(value.as_bytes()));
    }

    buf.put_slice(b"\r\n");
    Ok(buf.freeze())
}

/// Build a plain-text error response for the HTTP layer
pub fn build_error_response(status: StatusCode, message: &str) -> Bytes {
    let body_len = message.len() + 1;
    let mut buf = BytesMut::with_capacity(160 + body_len);

    buf.put_slice(b"HTTP/1.1 ");
    buf.put_slice(status.as_str().as_bytes());
    buf.put_slice(b" ");
    buf.put_slice(status.canonical_reason().unwrap_or("").as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(b"Content-Type: text/plain; charset=utf-8\r\n");
    buf.put_slice(b"X-Content-Type-Options: nosniff\r\n");
    buf.put_slice(format!("Content-Length: {body_len}\r\n").as_bytes());
    buf.put_slice(b"Connection: close\r\n");
    buf.put_slice(b"\r\n");
    buf.put_slice(message.as_bytes());
    buf.put_slice(b"\n");
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cookie::{Cookie, MemoryCookieJar};

    fn target(uri: &str) -> ConnectionTarget {
        ConnectionTarget::parse(uri).unwrap()
    }

    #[test]
    fn test_build_request_sets_negotiation_headers() {
        let request = build_request(&target("yamux://example.com/rpc"), &HeaderMap::new(), None)
            .unwrap();

        assert_eq!(request.method(), Method::GET);
        assert_eq!(request.version(), Version::HTTP_11);
        assert_eq!(request.uri(), "/rpc");
        assert_eq!(request.headers()[HOST], "example.com");
        assert_eq!(request.headers()[UPGRADE], "yamux");
        assert_eq!(request.headers()[CONNECTION], "Upgrade");
    }

    #[test]
    fn test_encode_request_wire_format() {
        let mut headers = HeaderMap::new();
        headers.insert("x-token", HeaderValue::from_static("abc"));

        let request =
            build_request(&target("yamux://example.com:8080/rpc?v=1"), &headers, None).unwrap();
        let wire = encode_request(&request);

        assert_eq!(
            &wire[..],
            &b"GET /rpc?v=1 HTTP/1.1\r\n\
               Host: example.com:8080\r\n\
               Upgrade: yamux\r\n\
               Connection: Upgrade\r\n\
               x-token: abc\r\n\
               \r\n"[..]
        );
    }

    #[test]
    fn test_request_rejects_reserved_headers() {
        for name in ["Upgrade", "upgrade", "CONNECTION", "Connection"] {
            let mut headers = HeaderMap::new();
            headers.insert(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_static("yamux"),
            );

            let err = build_request(&target("yamux://h/"), &headers, None).unwrap_err();
            assert!(matches!(err, Error::DuplicateHeader(_)), "{name}");
        }
    }

    #[test]
    fn test_request_rejects_caller_host() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("elsewhere.example"));

        let err = build_request(&target("yamux://example.com/"), &headers, None).unwrap_err();
        assert!(matches!(err, Error::DuplicateHeader(name) if name == HOST));
    }

    #[test]
    fn test_request_rejects_unencodable_target() {
        let err = build_request(&target("yamux://example.com/a b"), &HeaderMap::new(), None)
            .unwrap_err();
        assert!(matches!(err, Error::MalformedUri));

        let err = build_request(&target("yamux://exa\x01mple.com/"), &HeaderMap::new(), None)
            .unwrap_err();
        assert!(matches!(err, Error::MalformedUri));
    }

    #[test]
    fn test_request_keeps_multi_valued_headers() {
        let mut headers = HeaderMap::new();
        headers.append("x-tag", HeaderValue::from_static("a"));
        headers.append("x-tag", HeaderValue::from_static("b"));

        let request = build_request(&target("yamux://h/"), &headers, None).unwrap();
        let tags: Vec<_> = request.headers().get_all("x-tag").iter().collect();
        assert_eq!(tags, ["a", "b"]);
    }

    #[test]
    fn test_request_attaches_each_cookie() {
        let jar = MemoryCookieJar::new();
        jar.set("h", Cookie::new("a", "1"));
        jar.set("h", Cookie::new("b", "2"));
        jar.set("h", Cookie::new("bad", "line\nbreak"));

        let request = build_request(&target("yamux://h/"), &HeaderMap::new(), Some(&jar)).unwrap();
        let cookies: Vec<_> = request.headers().get_all(COOKIE).iter().collect();
        assert_eq!(cookies, ["a=1", "b=2"]);

        let wire = encode_request(&request);
        let text = std::str::from_utf8(&wire).unwrap();
        assert!(text.contains("cookie: a=1\r\ncookie: b=2\r\n"));
    }

    #[test]
    fn test_build_response_wire_format() {
        let mut extra = HeaderMap::new();
        extra.insert("x-server", HeaderValue::from_static("node-1"));

        let response = build_response(&extra).unwrap();
        assert_eq!(
            &response[..],
            &b"HTTP/1.1 101 Switching Protocols\r\n\
               Upgrade: yamux\r\n\
               Connection: Upgrade\r\n\
               x-server: node-1\r\n\
               \r\n"[..]
        );
    }

    #[test]
    fn test_build_response_rejects_reserved_headers() {
        let mut extra = HeaderMap::new();
        extra.insert(CONNECTION, HeaderValue::from_static("close"));
        assert!(matches!(
            build_response(&extra),
            Err(Error::DuplicateHeader(name)) if name == CONNECTION
        ));
    }

    #[test]
    fn test_build_response_sanitizes_tabs() {
        let mut extra = HeaderMap::new();
        extra.insert("x-note", HeaderValue::from_static("a\tb"));

        let response = build_response(&extra).unwrap();
        let text = std::str::from_utf8(&response).unwrap();
        assert!(text.contains("x-note: a b\r\n"));
    }

    #[test]
    fn test_sanitize_header_value() {
        let clean = sanitize_header_value(b"evil\r\nSet-Cookie: x=1");
        assert!(clean.iter().all(|&b| b > 31));
        assert_eq!(&clean[..], b"evil  Set-Cookie: x=1");

        let untouched = sanitize_header_value(b"plain value");
        assert!(matches!(untouched, Cow::Borrowed(b"plain value")));

        assert_eq!(&sanitize_header_value(b"\x00\x1f")[..], b"  ");
    }

    #[test]
    fn test_parse_response_partial_then_complete() {
        let full = build_response(&HeaderMap::new()).unwrap();
        assert!(parse_response(&full[..10]).unwrap().is_none());

        let response = parse_response(&full).unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        verify_response(&response).unwrap();
    }

    #[test]
    fn test_verify_response_mismatches() {
        let cases: [&[u8]; 5] = [
            b"HTTP/1.1 200 OK\r\nUpgrade: yamux\r\nConnection: Upgrade\r\n\r\n",
            b"HTTP/1.0 101 Switching Protocols\r\nUpgrade: yamux\r\nConnection: Upgrade\r\n\r\n",
            b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
            b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: yamux\r\n\r\n",
            b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: yamux\r\nConnection: upgrade\r\n\r\n",
        ];

        for raw in cases {
            let response = parse_response(raw).unwrap().unwrap();
            assert!(
                matches!(verify_response(&response), Err(Error::BadHandshake(_))),
                "{}",
                String::from_utf8_lossy(raw)
            );
        }
    }

    #[test]
    fn test_parse_response_garbage() {
        assert!(matches!(
            parse_response(b"\x00\x01 not http\r\n\r\n"),
            Err(Error::BadHandshake(_))
        ));
    }

    #[tokio::test]
    async fn test_read_response_ignores_trailing_bytes() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let mut wire = BytesMut::from(&build_response(&HeaderMap::new()).unwrap()[..]);
        wire.put_slice(b"trailing");

        tokio::io::AsyncWriteExt::write_all(&mut server, &wire).await.unwrap();

        let response = read_response(&mut client).await.unwrap();
        verify_response(&response).unwrap();
    }

    #[tokio::test]
    async fn test_read_response_eof_is_transport_error() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        tokio::io::AsyncWriteExt::write_all(&mut server, b"HTTP/1.1 101 Switch")
            .await
            .unwrap();
        drop(server);

        let err = read_response(&mut client).await.unwrap_err();
        assert!(err.is_transport());
    }

    fn upgrade_request() -> http::request::Builder {
        Request::builder()
            .method(Method::GET)
            .uri("/")
            .version(Version::HTTP_11)
            .header(UPGRADE, "yamux")
            .header(CONNECTION, "Upgrade")
    }

    #[test]
    fn test_is_upgrade_request() {
        assert!(is_upgrade_request(&upgrade_request().body(()).unwrap()));

        let post = upgrade_request().method(Method::POST).body(()).unwrap();
        assert!(!is_upgrade_request(&post));

        let http10 = upgrade_request().version(Version::HTTP_10).body(()).unwrap();
        assert!(!is_upgrade_request(&http10));

        let http2 = upgrade_request().version(Version::HTTP_2).body(()).unwrap();
        assert!(!is_upgrade_request(&http2));

        let mut missing_upgrade = upgrade_request().body(()).unwrap();
        missing_upgrade.headers_mut().remove(UPGRADE);
        assert!(!is_upgrade_request(&missing_upgrade));

        let mut missing_connection = upgrade_request().body(()).unwrap();
        missing_connection.headers_mut().remove(CONNECTION);
        assert!(!is_upgrade_request(&missing_connection));

        let websocket = Request::builder()
            .header(UPGRADE, "websocket")
            .header(CONNECTION, "Upgrade")
            .body(())
            .unwrap();
        assert!(!is_upgrade_request(&websocket));
    }

    #[test]
    fn test_error_response() {
        let response = build_error_response(StatusCode::INTERNAL_SERVER_ERROR, "no hijack");
        let text = std::str::from_utf8(&response).unwrap();
        assert!(text.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(text.contains("Content-Length: 10\r\n"));
        assert!(text.ends_with("\r\n\r\nno hijack\n"));
    }
}
