//! HTTP/1.x request-head parsing using the [`httparse`] crate.
//!
//! The head (request line plus header block) is read from a buffered stream
//! line by line so that header-count and header-size limits are enforced
//! before anything is handed to `httparse`. The body is never touched here:
//! [`RequestHead::framing`] only describes how it is delimited.

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use super::{Headers, Method, StatusCode, Version, headers};

/// Errors produced while reading or validating a request head.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("connection closed before a request line was received")]
    Closed,

    #[error("malformed request line")]
    RequestLine,

    #[error("invalid request target: {target}")]
    InvalidTarget { target: String },

    #[error("illegal character in header name")]
    HeaderName,

    #[error("malformed header field")]
    HeaderValue,

    #[error("more than {max} request headers")]
    TooManyHeaders { max: usize },

    #[error("request head exceeds {max_bytes} bytes")]
    HeadersTooLarge { max_bytes: usize },

    #[error("conflicting message framing: {reason}")]
    ConflictingFraming { reason: &'static str },

    #[error("invalid Content-Length value: {value}")]
    InvalidContentLength { value: String },

    #[error("unsupported Transfer-Encoding: {value}")]
    UnsupportedTransferEncoding { value: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RequestError {
    /// Status code to report to the peer, or `None` when the peer should
    /// not (or cannot) be answered.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Closed | Self::Io(_) => None,
            Self::TooManyHeaders { .. } | Self::HeadersTooLarge { .. } => {
                Some(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE)
            }
            Self::UnsupportedTransferEncoding { .. } => Some(StatusCode::NOT_IMPLEMENTED),
            _ => Some(StatusCode::BAD_REQUEST),
        }
    }
}

impl From<httparse::Error> for RequestError {
    fn from(err: httparse::Error) -> Self {
        match err {
            httparse::Error::HeaderName => Self::HeaderName,
            httparse::Error::HeaderValue => Self::HeaderValue,
            _ => Self::RequestLine,
        }
    }
}

/// How the request body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// No body: neither `Content-Length` nor `Transfer-Encoding` was sent.
    Empty,
    /// Exactly this many bytes follow the head.
    Length(u64),
    /// Unbounded up front; the body is dechunked while it is read.
    Chunked,
}

impl Framing {
    /// Returns `true` if no body bytes follow the head.
    pub fn is_empty(self) -> bool {
        matches!(self, Self::Empty | Self::Length(0))
    }
}

/// Limits applied while reading a request head.
#[derive(Debug, Clone, Copy)]
pub struct HeadLimits {
    pub max_headers: usize,
    pub max_header_bytes: usize,
}

/// A parsed request line and header block.
///
/// # Examples
///
/// ```
/// use http_engine::http::request::{RequestHead, Framing};
///
/// let raw = b"GET /docs/a%20b?x=1 HTTP/1.1\r\nHost: localhost\r\n\r\n";
/// let head = RequestHead::parse(raw).unwrap();
///
/// assert_eq!(head.method().as_str(), "GET");
/// assert_eq!(head.path(), "/docs/a b");
/// assert_eq!(head.query(), Some("x=1"));
/// assert_eq!(head.framing(), Framing::Empty);
/// ```
#[derive(Debug, Clone)]
pub struct RequestHead {
    method: Method,
    target: String,
    path: String,
    query: Option<String>,
    version: Version,
    headers: Headers,
    framing: Framing,
}

impl RequestHead {
    /// Reads a complete head from `reader`, enforcing `limits`.
    ///
    /// Empty lines preceding the request line are skipped (RFC 9112 §2.2).
    ///
    /// # Errors
    ///
    /// - [`RequestError::Closed`]: end of stream before any request byte.
    /// - [`RequestError::TooManyHeaders`] / [`RequestError::HeadersTooLarge`]: a limit was hit.
    /// - Any parse or framing error from [`RequestHead::parse`].
    pub async fn read<R>(reader: &mut R, limits: HeadLimits) -> Result<Self, RequestError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut raw = Vec::with_capacity(512);

        // Request line, skipping leading blank lines.
        loop {
            raw.clear();
            let n = read_line(reader, &mut raw, limits.max_header_bytes).await?;
            if n == 0 {
                return Err(RequestError::Closed);
            }
            if !is_blank(&raw) {
                break;
            }
        }

        let mut header_lines = 0usize;
        loop {
            let budget = limits.max_header_bytes.saturating_sub(raw.len());
            if budget == 0 {
                return Err(RequestError::HeadersTooLarge {
                    max_bytes: limits.max_header_bytes,
                });
            }
            let start = raw.len();
            let n = read_line(reader, &mut raw, budget).await?;
            if n == 0 {
                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
            }
            if is_blank(&raw[start..]) {
                break;
            }
            header_lines += 1;
            if header_lines > limits.max_headers {
                return Err(RequestError::TooManyHeaders {
                    max: limits.max_headers,
                });
            }
        }

        Self::parse_with_capacity(&raw, header_lines.max(1))
    }

    /// Parses a complete head held in memory.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::RequestLine`] for a truncated or malformed head,
    /// [`RequestError::HeaderName`] for illegal header names, and the framing
    /// errors described on [`resolve_framing`].
    pub fn parse(raw: &[u8]) -> Result<Self, RequestError> {
        let lines = raw.iter().filter(|&&b| b == b'\n').count();
        Self::parse_with_capacity(raw, lines.max(1))
    }

    fn parse_with_capacity(raw: &[u8], capacity: usize) -> Result<Self, RequestError> {
        let mut slots = vec![httparse::EMPTY_HEADER; capacity];
        let mut req = httparse::Request::new(&mut slots);

        match req.parse(raw)? {
            httparse::Status::Complete(_) => {}
            httparse::Status::Partial => return Err(RequestError::RequestLine),
        }

        let method: Method = match req.method {
            Some(m) => m.parse().unwrap_or_else(|never| match never {}),
            None => return Err(RequestError::RequestLine),
        };
        let target = req.path.ok_or(RequestError::RequestLine)?.to_owned();
        let version = Version::from_minor(req.version.ok_or(RequestError::RequestLine)?);

        let mut header_map = Headers::with_capacity(req.headers.len());
        for header in req.headers.iter() {
            if !headers::is_valid_name(header.name) {
                return Err(RequestError::HeaderName);
            }
            // Field values are ISO-8859-1 on the wire.
            let value: String = header.value.iter().map(|&b| b as char).collect();
            header_map.append(header.name, value);
        }

        let (path, query) = split_target(&target)?;
        let framing = resolve_framing(&header_map)?;

        Ok(Self {
            method,
            target,
            path,
            query,
            version,
            headers: header_map,
            framing,
        })
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request-target exactly as sent.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// The percent-decoded path component of the target.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The raw query string (without the leading `?`), if any.
    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Returns `true` if the client asked for an interim `100 Continue`.
    pub fn expects_continue(&self) -> bool {
        self.headers
            .get("expect")
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("100-continue"))
    }

    /// Returns `true` if the connection may be reused after this exchange.
    ///
    /// HTTP/1.1 defaults to persistent connections unless `Connection: close`
    /// is present; HTTP/1.0 requires an explicit `Connection: keep-alive`.
    pub fn is_keep_alive(&self) -> bool {
        match self.version {
            Version::Http11 => !self.headers.has_token("connection", "close"),
            Version::Http10 => self.headers.has_token("connection", "keep-alive"),
        }
    }
}

/// Determines body framing from the request headers.
///
/// # Errors
///
/// - [`RequestError::ConflictingFraming`]: both `Content-Length` and
///   `Transfer-Encoding`, repeated `Transfer-Encoding`, or repeated
///   `Content-Length` fields.
/// - [`RequestError::UnsupportedTransferEncoding`]: a coding other than `chunked`.
/// - [`RequestError::InvalidContentLength`]: not a non-negative decimal integer.
pub fn resolve_framing(headers: &Headers) -> Result<Framing, RequestError> {
    let te_count = headers.count("transfer-encoding");
    let cl_count = headers.count("content-length");

    if te_count > 0 {
        if cl_count > 0 {
            return Err(RequestError::ConflictingFraming {
                reason: "both Content-Length and Transfer-Encoding present",
            });
        }
        if te_count > 1 {
            return Err(RequestError::ConflictingFraming {
                reason: "multiple Transfer-Encoding fields",
            });
        }
        let value = headers.get("transfer-encoding").unwrap_or_default().trim();
        if !value.eq_ignore_ascii_case("chunked") {
            return Err(RequestError::UnsupportedTransferEncoding {
                value: value.to_owned(),
            });
        }
        return Ok(Framing::Chunked);
    }

    match cl_count {
        0 => Ok(Framing::Empty),
        1 => {
            let raw = headers.get("content-length").unwrap_or_default().trim();
            if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
                return Err(RequestError::InvalidContentLength {
                    value: raw.to_owned(),
                });
            }
            raw.parse::<u64>()
                .map(Framing::Length)
                .map_err(|_| RequestError::InvalidContentLength {
                    value: raw.to_owned(),
                })
        }
        _ => Err(RequestError::ConflictingFraming {
            reason: "multiple Content-Length fields",
        }),
    }
}

/// Splits a request-target into a decoded path and a raw query.
///
/// Origin-form (`/a/b?q`), absolute-form (`http://host/a/b?q`) and the
/// asterisk-form (`*`) are accepted.
fn split_target(target: &str) -> Result<(String, Option<String>), RequestError> {
    let invalid = || RequestError::InvalidTarget {
        target: target.to_owned(),
    };

    if target.bytes().any(|b| !is_uri_byte(b)) {
        return Err(invalid());
    }
    if target == "*" {
        return Ok(("*".to_owned(), None));
    }

    let origin = if target.starts_with('/') {
        target
    } else if let Some(scheme_end) = target.find("://") {
        let scheme = &target[..scheme_end];
        let scheme_byte = |b: u8| b.is_ascii_alphanumeric() || b"+-.".contains(&b);
        if scheme.is_empty() || !scheme.bytes().all(scheme_byte) {
            return Err(invalid());
        }
        let rest = &target[scheme_end + 3..];
        match rest.find(['/', '?']) {
            Some(i) if rest.as_bytes()[i] == b'/' => &rest[i..],
            Some(i) => return Ok(("/".to_owned(), Some(rest[i + 1..].to_owned()))),
            None => "/",
        }
    } else {
        return Err(invalid());
    };

    let without_fragment = origin.split('#').next().unwrap_or(origin);
    let (raw_path, query) = match without_fragment.split_once('?') {
        Some((p, q)) => (p, Some(q.to_owned())),
        None => (without_fragment, None),
    };

    let path = percent_decode(raw_path).ok_or_else(invalid)?;
    Ok((path, query))
}

fn percent_decode(input: &str) -> Option<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes.get(i + 1..i + 3)?;
            let hi = (hex[0] as char).to_digit(16)?;
            let lo = (hex[1] as char).to_digit(16)?;
            out.push((hi * 16 + lo) as u8);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Some(String::from_utf8_lossy(&out).into_owned())
}

fn is_uri_byte(b: u8) -> bool {
    b.is_ascii_graphic()
        && !matches!(
            b,
            b'"' | b'<' | b'>' | b'\\' | b'^' | b'`' | b'{' | b'|' | b'}'
        )
}

fn is_blank(line: &[u8]) -> bool {
    line == b"\r\n" || line == b"\n"
}

// Reads one `\n`-terminated line, failing once `limit` bytes pass without a terminator.
async fn read_line<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    limit: usize,
) -> Result<usize, RequestError>
where
    R: AsyncBufRead + Unpin,
{
    let n = (&mut *reader)
        .take(limit as u64)
        .read_until(b'\n', buf)
        .await?;
    if n > 0 && buf.last() != Some(&b'\n') {
        if n as u64 >= limit as u64 {
            return Err(RequestError::HeadersTooLarge { max_bytes: limit });
        }
        return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    const LIMITS: HeadLimits = HeadLimits {
        max_headers: 8,
        max_header_bytes: 1024,
    };

    fn framing_of(raw: &str) -> Result<Framing, RequestError> {
        RequestHead::parse(raw.as_bytes()).map(|h| h.framing())
    }

    #[test]
    fn parse_simple_get() {
        let head = RequestHead::parse(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        assert_eq!(head.method(), &Method::Get);
        assert_eq!(head.path(), "/");
        assert_eq!(head.version(), Version::Http11);
        assert_eq!(head.headers().get("host"), Some("x"));
        assert!(head.is_keep_alive());
    }

    #[test]
    fn absolute_form_target() {
        let head = RequestHead::parse(b"GET http://example.com/foo?a=b HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(head.path(), "/foo");
        assert_eq!(head.query(), Some("a=b"));
        assert_eq!(head.target(), "http://example.com/foo?a=b");
    }

    #[test]
    fn relative_target_is_rejected() {
        let err = RequestHead::parse(b"GET foo HTTP/1.1\r\n\r\n").unwrap_err();
        assert!(matches!(err, RequestError::InvalidTarget { .. }));
        assert_eq!(err.status(), Some(StatusCode::BAD_REQUEST));
    }

    #[test]
    fn bad_percent_escape_is_rejected() {
        let err = RequestHead::parse(b"GET /a%zz HTTP/1.1\r\n\r\n").unwrap_err();
        assert!(matches!(err, RequestError::InvalidTarget { .. }));
    }

    #[test]
    fn malformed_request_line() {
        let err = RequestHead::parse(b"GARBAGE\r\n\r\n").unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::BAD_REQUEST));
    }

    #[test]
    fn illegal_header_name() {
        let err = RequestHead::parse(b"GET / HTTP/1.1\r\nBad(Name): x\r\n\r\n").unwrap_err();
        assert!(matches!(err, RequestError::HeaderName));
    }

    #[test]
    fn http10_keep_alive_rules() {
        let plain = RequestHead::parse(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        assert!(!plain.is_keep_alive());
        let explicit =
            RequestHead::parse(b"GET / HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n").unwrap();
        assert!(explicit.is_keep_alive());
        let close = RequestHead::parse(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").unwrap();
        assert!(!close.is_keep_alive());
    }

    #[test]
    fn framing_resolution() {
        assert_eq!(framing_of("GET / HTTP/1.1\r\n\r\n").unwrap(), Framing::Empty);
        assert_eq!(
            framing_of("POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\n").unwrap(),
            Framing::Length(5)
        );
        assert_eq!(
            framing_of("POST / HTTP/1.1\r\nTransfer-Encoding: Chunked\r\n\r\n").unwrap(),
            Framing::Chunked
        );
    }

    #[test]
    fn conflicting_framing_is_rejected() {
        let both = framing_of(
            "POST / HTTP/1.1\r\nContent-Length: 5\r\nTransfer-Encoding: chunked\r\n\r\n",
        );
        assert!(matches!(both, Err(RequestError::ConflictingFraming { .. })));

        let twice = framing_of("POST / HTTP/1.1\r\nContent-Length: 5\r\nContent-Length: 5\r\n\r\n");
        assert!(matches!(twice, Err(RequestError::ConflictingFraming { .. })));

        let te_twice = framing_of(concat!(
            "POST / HTTP/1.1\r\n",
            "Transfer-Encoding: chunked\r\n",
            "Transfer-Encoding: chunked\r\n\r\n",
        ));
        assert!(matches!(te_twice, Err(RequestError::ConflictingFraming { .. })));
    }

    #[test]
    fn invalid_content_length() {
        for value in ["-1", "abc", "", "1 2", "+5"] {
            let raw = format!("POST / HTTP/1.1\r\nContent-Length: {value}\r\n\r\n");
            let err = framing_of(&raw).unwrap_err();
            assert_eq!(err.status(), Some(StatusCode::BAD_REQUEST), "value {value:?}");
        }
    }

    #[test]
    fn unsupported_transfer_encoding() {
        let err = framing_of("POST / HTTP/1.1\r\nTransfer-Encoding: gzip\r\n\r\n").unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::NOT_IMPLEMENTED));
    }

    #[tokio::test]
    async fn read_skips_leading_blank_lines_and_leaves_body() {
        let raw: &[u8] = b"\r\nPOST /up HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc";
        let mut reader = BufReader::new(raw);
        let head = RequestHead::read(&mut reader, LIMITS).await.unwrap();
        assert_eq!(head.path(), "/up");
        assert_eq!(head.framing(), Framing::Length(3));

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"abc");
    }

    #[tokio::test]
    async fn read_reports_clean_close() {
        let mut reader = BufReader::new(&b""[..]);
        let err = RequestHead::read(&mut reader, LIMITS).await.unwrap_err();
        assert!(matches!(err, RequestError::Closed));
        assert!(err.status().is_none());
    }

    #[tokio::test]
    async fn read_enforces_header_count() {
        let mut raw = String::from("GET / HTTP/1.1\r\n");
        for i in 0..9 {
            raw.push_str(&format!("X-{i}: v\r\n"));
        }
        raw.push_str("\r\n");
        let mut reader = BufReader::new(raw.as_bytes());
        let err = RequestHead::read(&mut reader, LIMITS).await.unwrap_err();
        assert!(matches!(err, RequestError::TooManyHeaders { max: 8 }));
    }

    #[tokio::test]
    async fn read_enforces_head_size() {
        let raw = format!("GET / HTTP/1.1\r\nX-Big: {}\r\n\r\n", "a".repeat(2048));
        let mut reader = BufReader::new(raw.as_bytes());
        let err = RequestHead::read(&mut reader, LIMITS).await.unwrap_err();
        assert!(matches!(err, RequestError::HeadersTooLarge { .. }));
        assert_eq!(err.status(), Some(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE));
    }
}
