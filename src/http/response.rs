//! HTTP/1.1 response-head serialization.
//!
//! The engine writes response heads itself and then hands body framing to
//! [`crate::http::body::BodyWriter`]. This module also renders the small
//! HTML error pages sent when a request is rejected before any handler runs.

use bytes::{BufMut, BytesMut};

use super::{Headers, StatusCode};

/// Interim response written when a client sends `Expect: 100-continue`.
pub const CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Declared length of a response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseLength {
    /// No body follows the head (`Content-Length: 0` where permitted).
    Empty,
    /// Exactly this many body bytes will be written.
    Fixed(u64),
    /// Length unknown up front; the body is sent with chunked coding.
    Chunked,
}

/// Serializes a status line and header block into a buffer.
///
/// The caller is responsible for the framing headers; this function writes
/// exactly what is in `headers`, followed by the blank separator line.
///
/// # Examples
///
/// ```
/// use http_engine::http::{Headers, StatusCode, response::encode_head};
///
/// let mut headers = Headers::new();
/// headers.append("Content-Length", "2");
/// let buf = encode_head(StatusCode::OK, &headers);
/// assert_eq!(&buf[..], b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\n");
/// ```
pub fn encode_head(status: StatusCode, headers: &Headers) -> BytesMut {
    let mut buf = BytesMut::with_capacity(64 + headers.len() * 48);
    buf.put(format!("HTTP/1.1 {} {}\r\n", status.as_u16(), status.canonical_reason()).as_bytes());
    for (name, value) in headers.iter() {
        buf.put(name.as_bytes());
        buf.put(&b": "[..]);
        // Header values are ISO-8859-1 on the wire; anything wider is replaced.
        for ch in value.chars() {
            buf.put_u8(u8::try_from(u32::from(ch)).unwrap_or(b'?'));
        }
        buf.put(&b"\r\n"[..]);
    }
    buf.put(&b"\r\n"[..]);
    buf
}

/// Renders a complete error response with a short HTML body.
///
/// When `close` is set the response carries `Connection: close`.
pub fn error_page(status: StatusCode, detail: &str, close: bool) -> BytesMut {
    render_error(status, detail, close, true)
}

/// The head of [`error_page`] alone, for answering `HEAD` requests.
pub fn error_page_head(status: StatusCode, detail: &str, close: bool) -> BytesMut {
    render_error(status, detail, close, false)
}

fn render_error(status: StatusCode, detail: &str, close: bool, with_body: bool) -> BytesMut {
    let body = error_body(status, detail);

    let mut headers = Headers::with_capacity(3);
    headers.append("Content-Type", "text/html; charset=utf-8");
    headers.append("Content-Length", body.len().to_string());
    if close {
        headers.append("Connection", "close");
    }

    let mut buf = encode_head(status, &headers);
    if with_body {
        buf.put(body.as_bytes());
    }
    buf
}

/// HTML body of an error page: the status line as a heading, then `detail`.
pub fn error_body(status: StatusCode, detail: &str) -> String {
    format!(
        "<h1>{} {}</h1>{}",
        status.as_u16(),
        status.canonical_reason(),
        escape_html(detail)
    )
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}
