//! One request/response exchange on a connection.
//!
//! [`run`] is the unit of work the dispatcher submits to the executor for a
//! readable connection. It parses one request head, routes it, runs the
//! context's filter chain and handler against an [`Exchange`], finishes the
//! response and hands the stream back to the dispatcher for reuse, or
//! reports that the connection must close.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::Shared;
use super::dispatcher::Event;
use super::registry::{Connection, ConnectionRegistry};
use super::transport::ConnStream;
use crate::context::{Attributes, HttpContext};
use crate::filter::Chain;
use crate::http::body::{BodyReader, BodyWriter};
use crate::http::request::HeadLimits;
use crate::http::headers::{is_valid_name, is_valid_value};
use crate::http::response::{
    CONTINUE_RESPONSE, encode_head, error_body, error_page, error_page_head,
};
use crate::http::{Headers, Method, RequestError, RequestHead, ResponseLength, StatusCode, Version};

/// The request being served and the response being produced.
///
/// An `Exchange` owns the connection's stream for the duration of the
/// handler call. The request body is read with [`read_body`](Self::read_body);
/// the response is started with [`send_response_headers`](Self::send_response_headers)
/// and its body written with [`write_body`](Self::write_body). [`respond`](Self::respond)
/// does all three for a body held in memory.
///
/// # Examples
///
/// ```rust,no_run
/// use http_engine::filter::handler_fn;
/// use http_engine::http::{ResponseLength, StatusCode};
///
/// let echo = handler_fn(|ex| Box::pin(async move {
///     let body = ex.read_to_end().await?;
///     ex.response_headers_mut().set("Content-Type", "application/octet-stream");
///     ex.send_response_headers(StatusCode::OK, ResponseLength::Fixed(body.len() as u64)).await?;
///     ex.write_body(&body).await
/// }));
/// ```
pub struct Exchange {
    head: RequestHead,
    io: ConnStream,
    body: BodyReader,
    request_done: bool,
    response_headers: Headers,
    response: Option<(StatusCode, BodyWriter)>,
    close_after: bool,
    context: Arc<HttpContext>,
    local: SocketAddr,
    protocol: &'static str,
    attributes: Attributes,
    conn: Arc<Connection>,
    registry: Arc<ConnectionRegistry>,
}

impl Exchange {
    pub(crate) fn new(
        head: RequestHead,
        io: ConnStream,
        context: Arc<HttpContext>,
        conn: Arc<Connection>,
        registry: Arc<ConnectionRegistry>,
        local: SocketAddr,
        protocol: &'static str,
    ) -> Self {
        let framing = head.framing();
        let close_after = !head.is_keep_alive();
        Self {
            body: BodyReader::new(framing),
            request_done: framing.is_empty(),
            head,
            io,
            response_headers: Headers::new(),
            response: None,
            close_after,
            context,
            local,
            protocol,
            attributes: Attributes::new(),
            conn,
            registry,
        }
    }

    pub fn method(&self) -> &Method {
        self.head.method()
    }

    /// The request-target exactly as sent.
    pub fn uri(&self) -> &str {
        self.head.target()
    }

    /// Percent-decoded request path.
    pub fn path(&self) -> &str {
        self.head.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.head.query()
    }

    pub fn version(&self) -> Version {
        self.head.version()
    }

    pub fn request_headers(&self) -> &Headers {
        self.head.headers()
    }

    /// The context this request was routed to.
    pub fn context(&self) -> &Arc<HttpContext> {
        &self.context
    }

    pub fn context_path(&self) -> &str {
        self.context.path()
    }

    /// `"http"` or `"https"`.
    pub fn protocol(&self) -> &str {
        self.protocol
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.conn.peer_addr()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Per-exchange attributes, visible to every filter and the handler.
    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn attributes_mut(&mut self) -> &mut Attributes {
        &mut self.attributes
    }

    /// Reads decoded request body bytes into `buf`. Returns `0` at the end
    /// of the body.
    ///
    /// # Errors
    ///
    /// Any I/O error, or [`io::ErrorKind::InvalidData`] for malformed
    /// chunked framing. The connection is not reused after an error.
    pub async fn read_body(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.body.read(&mut self.io, buf).await.inspect_err(|_| {
            self.close_after = true;
        })?;
        if self.body.is_done() {
            self.mark_request_done();
        }
        Ok(n)
    }

    /// Reads the remainder of the request body.
    pub async fn read_to_end(&mut self) -> io::Result<Bytes> {
        let mut out = Vec::new();
        self.body
            .read_to_end(&mut self.io, &mut out)
            .await
            .inspect_err(|_| self.close_after = true)?;
        self.mark_request_done();
        Ok(Bytes::from(out))
    }

    pub fn response_headers(&self) -> &Headers {
        &self.response_headers
    }

    /// Headers to send with the response. Changes made after
    /// [`send_response_headers`](Self::send_response_headers) have no effect.
    pub fn response_headers_mut(&mut self) -> &mut Headers {
        &mut self.response_headers
    }

    /// Status of the response, once its headers have been sent.
    pub fn response_code(&self) -> Option<StatusCode> {
        self.response.as_ref().map(|(status, _)| *status)
    }

    pub fn is_response_started(&self) -> bool {
        self.response.is_some()
    }

    /// Writes the status line and headers and fixes the body framing.
    ///
    /// The framing headers are derived from `length` and replace any the
    /// handler set:
    ///
    /// - 1xx, 204 and 304 responses, and responses to `HEAD`, never carry a
    ///   body. For `HEAD` the declared length is still advertised.
    /// - [`ResponseLength::Chunked`] to an HTTP/1.0 client falls back to a
    ///   body delimited by closing the connection.
    /// - `Connection: close` is added whenever the connection will not be
    ///   reused after this exchange.
    ///
    /// # Errors
    ///
    /// [`io::ErrorKind::InvalidInput`] if headers were already sent or a
    /// response header has an illegal name or a value containing CR, LF or
    /// NUL; nothing is written in those cases. Any error writing to the peer.
    pub async fn send_response_headers(
        &mut self,
        status: StatusCode,
        length: ResponseLength,
    ) -> io::Result<()> {
        if self.response.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "response headers already sent",
            ));
        }
        if let Some((name, _)) = self
            .response_headers
            .iter()
            .find(|(name, value)| !is_valid_name(name) || !is_valid_value(value))
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid response header {name:?}"),
            ));
        }

        let headers = &mut self.response_headers;
        headers.remove("content-length");
        headers.remove("transfer-encoding");

        let writer = if status.forbids_body() {
            BodyWriter::no_body()
        } else if *self.head.method() == Method::Head {
            match length {
                ResponseLength::Empty => headers.set("Content-Length", "0"),
                ResponseLength::Fixed(n) => headers.set("Content-Length", n.to_string()),
                ResponseLength::Chunked => {}
            }
            BodyWriter::no_body()
        } else {
            match length {
                ResponseLength::Empty => {
                    headers.set("Content-Length", "0");
                    BodyWriter::no_body()
                }
                ResponseLength::Fixed(n) => {
                    headers.set("Content-Length", n.to_string());
                    BodyWriter::fixed(n)
                }
                ResponseLength::Chunked if self.head.version() == Version::Http11 => {
                    headers.set("Transfer-Encoding", "chunked");
                    BodyWriter::chunked()
                }
                ResponseLength::Chunked => {
                    self.close_after = true;
                    BodyWriter::close_delimited()
                }
            }
        };

        if self.close_after {
            headers.set("Connection", "close");
        } else if self.head.version() == Version::Http10 {
            headers.set("Connection", "keep-alive");
        }

        let head = encode_head(status, headers);
        self.response = Some((status, writer));
        self.mark_request_done();
        self.io.write_all(&head).await.inspect_err(|_| self.close_after = true)
    }

    /// Writes response body bytes.
    ///
    /// # Errors
    ///
    /// [`io::ErrorKind::InvalidInput`] if headers have not been sent, if
    /// `data` would overrun the declared length, or if the response has no
    /// body. Nothing is written in those cases.
    pub async fn write_body(&mut self, data: &[u8]) -> io::Result<()> {
        let Some((_, writer)) = self.response.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "response headers not sent"));
        };
        writer.write(&mut self.io, data).await
    }

    /// Completes the response body and flushes it to the peer.
    ///
    /// Called automatically once the handler returns; handlers only need it
    /// to push a response out before doing further work.
    ///
    /// # Errors
    ///
    /// [`io::ErrorKind::UnexpectedEof`] if fewer bytes were written than a
    /// fixed length declared. The connection is closed in that case.
    pub async fn finish(&mut self) -> io::Result<()> {
        let Some((_, writer)) = self.response.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "response headers not sent"));
        };
        writer.finish(&mut self.io).await.inspect_err(|_| self.close_after = true)
    }

    /// Sends a complete response with `body` as a fixed-length payload.
    pub async fn respond(&mut self, status: StatusCode, body: impl AsRef<[u8]>) -> io::Result<()> {
        let body = body.as_ref();
        let length = if body.is_empty() {
            ResponseLength::Empty
        } else {
            ResponseLength::Fixed(body.len() as u64)
        };
        self.send_response_headers(status, length).await?;
        if !self.is_bodyless() {
            self.write_body(body).await?;
        }
        self.finish().await
    }

    // True if the writer installed for this response refuses body bytes.
    fn is_bodyless(&self) -> bool {
        *self.head.method() == Method::Head
            || self.response_code().is_some_and(StatusCode::forbids_body)
    }

    async fn respond_error(&mut self, status: StatusCode, detail: &str) {
        self.close_after = true;
        self.response_headers = Headers::new();
        self.response_headers.set("Content-Type", "text/html; charset=utf-8");
        if let Err(e) = self.respond(status, error_body(status, detail)).await {
            debug!(conn = self.conn.id(), error = %e, "failed to send error response");
        }
    }

    fn mark_request_done(&mut self) {
        if self.request_done {
            return;
        }
        self.request_done = true;
        if let Err(e) = self.registry.request_completed(&self.conn, Instant::now()) {
            debug!(conn = self.conn.id(), error = %e, "request completion not recorded");
        }
    }

    /// Brings the exchange to an end after the chain returned and decides
    /// whether the stream can serve another request.
    async fn conclude(mut self, result: io::Result<()>, drain_amount: u64) -> Option<ConnStream> {
        if let Err(e) = result {
            warn!(conn = self.conn.id(), path = %self.head.path(), error = %e, "handler failed");
            if self.response.is_none() {
                self.respond_error(StatusCode::INTERNAL_SERVER_ERROR, "Handler failed").await;
            }
            return None;
        }

        if self.response.is_none() {
            warn!(
                conn = self.conn.id(),
                path = %self.head.path(),
                "handler returned without a response"
            );
            self.respond_error(StatusCode::INTERNAL_SERVER_ERROR, "No response was sent")
                .await;
            return None;
        }

        if let Some((_, writer)) = self.response.as_mut() {
            if let Err(e) = writer.finish(&mut self.io).await {
                debug!(conn = self.conn.id(), error = %e, "response not completed, closing");
                return None;
            }
            if writer.is_close_delimited() {
                return None;
            }
        }

        if self.close_after {
            return None;
        }

        if !self.body.is_done() {
            match self.body.drain(&mut self.io, drain_amount).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(
                        conn = self.conn.id(),
                        "unread request body exceeds drain limit, closing"
                    );
                    return None;
                }
                Err(e) => {
                    debug!(conn = self.conn.id(), error = %e, "failed to drain request body");
                    return None;
                }
            }
        }
        Some(self.io)
    }
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("conn", &self.conn.id())
            .field("method", self.method())
            .field("uri", &self.uri())
            .field("context", &self.context.path())
            .field("status", &self.response_code())
            .finish()
    }
}

/// Serves one exchange on `io` and reports the outcome to the dispatcher.
///
/// The exchange runs in its own task so a panicking handler only costs its
/// connection.
pub(crate) async fn run(
    shared: Arc<Shared>,
    conn: Arc<Connection>,
    io: ConnStream,
    events: mpsc::Sender<Event>,
) {
    let worker = tokio::spawn(process(Arc::clone(&shared), Arc::clone(&conn), io));
    let event = match worker.await {
        Ok(Some(io)) => Event::Reusable {
            conn: Arc::clone(&conn),
            io,
        },
        Ok(None) => Event::Close { conn: Arc::clone(&conn) },
        Err(e) => {
            if e.is_panic() {
                error!(conn = conn.id(), "exchange panicked, closing connection");
            }
            Event::Close { conn: Arc::clone(&conn) }
        }
    };
    if events.send(event).await.is_err() {
        // Dispatcher is gone; nothing will re-arm this connection.
        shared.registry.close(&conn);
    }
}

async fn process(shared: Arc<Shared>, conn: Arc<Connection>, io: ConnStream) -> Option<ConnStream> {
    tokio::select! {
        biased;
        () = conn.closed() => {
            debug!(conn = conn.id(), "connection closed during exchange");
            None
        }
        io = exchange_cycle(&shared, &conn, io) => io,
    }
}

async fn exchange_cycle(
    shared: &Shared,
    conn: &Arc<Connection>,
    mut io: ConnStream,
) -> Option<ConnStream> {
    let limits = HeadLimits {
        max_headers: shared.config.max_request_headers,
        max_header_bytes: shared.config.max_request_header_size,
    };

    let head = match RequestHead::read(&mut io, limits).await {
        Ok(head) => head,
        Err(RequestError::Closed) => {
            debug!(conn = conn.id(), "peer closed before sending a request");
            return None;
        }
        Err(err) => {
            match err.status() {
                Some(status) => {
                    warn!(
                        conn = conn.id(),
                        peer = %conn.peer_addr(),
                        error = %err,
                        "rejecting request"
                    );
                    write_page(&mut io, error_page(status, &err.to_string(), true)).await;
                }
                None => debug!(conn = conn.id(), error = %err, "failed to read request head"),
            }
            return None;
        }
    };

    debug!(
        conn = conn.id(),
        method = %head.method(),
        target = %head.target(),
        version = %head.version(),
        "request received"
    );

    let registry = &shared.registry;
    if head.framing().is_empty() {
        if let Err(e) = registry.request_completed(conn, Instant::now()) {
            debug!(conn = conn.id(), error = %e, "request completion not recorded");
        }
    }

    // A rejection can leave the connection open only if there is no body
    // left on the wire to skip.
    let reusable =
        head.framing().is_empty() && head.is_keep_alive() && *head.method() != Method::Head;

    let Some(context) = shared.router.find(shared.protocol, head.path()) else {
        debug!(conn = conn.id(), path = %head.path(), "no context found");
        let detail = "No context found for request";
        let page = rejection(&head, StatusCode::NOT_FOUND, detail, reusable);
        return reject(io, page, reusable).await;
    };
    let Some(handler) = context.handler() else {
        warn!(conn = conn.id(), context = %context.path(), "context has no handler");
        let detail = "No handler for context";
        let page = rejection(&head, StatusCode::INTERNAL_SERVER_ERROR, detail, reusable);
        return reject(io, page, reusable).await;
    };

    if head.expects_continue() && head.version() == Version::Http11 && !head.framing().is_empty() {
        if let Err(e) = write_all_flush(&mut io, CONTINUE_RESPONSE).await {
            debug!(conn = conn.id(), error = %e, "failed to send 100 Continue");
            return None;
        }
    }

    let filters = context.filter_chain();
    let mut exchange = Exchange::new(
        head,
        io,
        Arc::clone(&context),
        Arc::clone(conn),
        Arc::clone(registry),
        shared.local_addr,
        shared.protocol,
    );
    let result = Chain::new(&filters, handler.as_ref()).proceed(&mut exchange).await;
    exchange.conclude(result, shared.config.drain_amount).await
}

// Responses to HEAD carry the error page's head only.
fn rejection(head: &RequestHead, status: StatusCode, detail: &str, reusable: bool) -> BytesMut {
    if *head.method() == Method::Head {
        error_page_head(status, detail, !reusable)
    } else {
        error_page(status, detail, !reusable)
    }
}

async fn reject(mut io: ConnStream, page: BytesMut, reusable: bool) -> Option<ConnStream> {
    match write_all_flush(&mut io, &page).await {
        Ok(()) if reusable => Some(io),
        Ok(()) => None,
        Err(e) => {
            debug!(error = %e, "failed to send error response");
            None
        }
    }
}

async fn write_page(io: &mut ConnStream, page: BytesMut) {
    if let Err(e) = write_all_flush(io, &page).await {
        debug!(error = %e, "failed to send error response");
    }
}

async fn write_all_flush(io: &mut ConnStream, bytes: &[u8]) -> io::Result<()> {
    io.write_all(bytes).await?;
    io.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::registry::StateKind;
    use crate::server::transport::buffered;
    use tokio::io::{AsyncReadExt, DuplexStream};

    struct Harness {
        exchange: Exchange,
        client: DuplexStream,
        registry: Arc<ConnectionRegistry>,
        conn: Arc<Connection>,
    }

    async fn harness(raw_head: &str, body: &[u8]) -> Harness {
        let head = RequestHead::parse(raw_head.as_bytes()).unwrap();
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        // The body follows the head on the wire.
        client.write_all(body).await.unwrap();

        let registry = Arc::new(ConnectionRegistry::new(None, 10));
        let now = Instant::now();
        let conn = registry.mark_newly_accepted("127.0.0.1:5000".parse().unwrap(), now).unwrap();
        registry.request_started(&conn, now).unwrap();
        if head.framing().is_empty() {
            registry.request_completed(&conn, now).unwrap();
        }

        let exchange = Exchange::new(
            head,
            buffered(Box::new(server)),
            Arc::new(HttpContext::new("http", "/")),
            Arc::clone(&conn),
            Arc::clone(&registry),
            "127.0.0.1:8080".parse().unwrap(),
            "http",
        );
        Harness {
            exchange,
            client,
            registry,
            conn,
        }
    }

    async fn wire(h: Harness) -> String {
        let Harness { exchange, mut client, .. } = h;
        drop(exchange);
        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn respond_writes_fixed_length_response() {
        let mut h = harness("GET / HTTP/1.1\r\nHost: x\r\n\r\n", b"").await;
        h.exchange.response_headers_mut().set("X-Test", "1");
        h.exchange.respond(StatusCode::OK, "hello").await.unwrap();
        assert_eq!(h.exchange.response_code(), Some(StatusCode::OK));
        let out = wire(h).await;
        assert_eq!(out, "HTTP/1.1 200 OK\r\nX-Test: 1\r\nContent-Length: 5\r\n\r\nhello");
    }

    #[tokio::test]
    async fn headers_can_only_be_sent_once() {
        let mut h = harness("GET / HTTP/1.1\r\n\r\n", b"").await;
        h.exchange
            .send_response_headers(StatusCode::OK, ResponseLength::Empty)
            .await
            .unwrap();
        let err = h
            .exchange
            .send_response_headers(StatusCode::OK, ResponseLength::Empty)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn header_values_cannot_split_the_response() {
        let mut h = harness("GET / HTTP/1.1\r\n\r\n", b"").await;
        h.exchange
            .response_headers_mut()
            .set("X-Echo", "a\r\nSet-Cookie: evil=1");
        let err = h.exchange.respond(StatusCode::OK, "ok").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(!h.exchange.is_response_started());

        h.exchange.response_headers_mut().set("X-Echo", "a");
        h.exchange.respond(StatusCode::OK, "ok").await.unwrap();
        let out = wire(h).await;
        assert_eq!(out, "HTTP/1.1 200 OK\r\nX-Echo: a\r\nContent-Length: 2\r\n\r\nok");
    }

    #[tokio::test]
    async fn invalid_header_name_fails_into_clean_error_page() {
        let mut h = harness("GET / HTTP/1.1\r\n\r\n", b"").await;
        h.exchange.response_headers_mut().append("Bad Name", "x");
        let err = h
            .exchange
            .send_response_headers(StatusCode::OK, ResponseLength::Empty)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        let Harness { exchange, mut client, .. } = h;
        assert!(exchange.conclude(Err(err), 1024).await.is_none());
        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        assert!(out.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(!out.contains("Bad Name"));
    }

    #[test]
    fn rejection_of_head_request_has_no_body() {
        let head = RequestHead::parse(b"HEAD /nope HTTP/1.1\r\n\r\n").unwrap();
        let page = rejection(&head, StatusCode::NOT_FOUND, "No context found for request", false);
        assert!(page.ends_with(b"\r\n\r\n"));
        assert!(page.starts_with(b"HTTP/1.1 404 Not Found\r\n"));

        let get = RequestHead::parse(b"GET /nope HTTP/1.1\r\n\r\n").unwrap();
        let full = rejection(&get, StatusCode::NOT_FOUND, "No context found for request", false);
        assert!(full.ends_with(b"No context found for request"));
    }

    #[tokio::test]
    async fn write_before_headers_is_rejected() {
        let mut h = harness("GET / HTTP/1.1\r\n\r\n", b"").await;
        let err = h.exchange.write_body(b"x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn head_request_advertises_length_without_body() {
        let mut h = harness("HEAD / HTTP/1.1\r\n\r\n", b"").await;
        h.exchange.respond(StatusCode::OK, "ignored body").await.unwrap();
        let out = wire(h).await;
        assert_eq!(out, "HTTP/1.1 200 OK\r\nContent-Length: 12\r\n\r\n");
    }

    #[tokio::test]
    async fn no_content_has_no_framing_headers() {
        let mut h = harness("GET / HTTP/1.1\r\n\r\n", b"").await;
        h.exchange.response_headers_mut().set("Content-Length", "99");
        h.exchange
            .send_response_headers(StatusCode::NO_CONTENT, ResponseLength::Fixed(10))
            .await
            .unwrap();
        assert!(h.exchange.write_body(b"x").await.is_err());
        h.exchange.finish().await.unwrap();
        let out = wire(h).await;
        assert_eq!(out, "HTTP/1.1 204 No Content\r\n\r\n");
    }

    #[tokio::test]
    async fn chunked_response_to_http10_is_close_delimited() {
        let mut h = harness("GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n", b"").await;
        h.exchange
            .send_response_headers(StatusCode::OK, ResponseLength::Chunked)
            .await
            .unwrap();
        h.exchange.write_body(b"abc").await.unwrap();
        h.exchange.finish().await.unwrap();
        let out = wire(h).await;
        assert_eq!(out, "HTTP/1.1 200 OK\r\nConnection: close\r\n\r\nabc");
    }

    #[tokio::test]
    async fn http10_keep_alive_is_acknowledged() {
        let mut h = harness("GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n", b"").await;
        h.exchange.respond(StatusCode::OK, "").await.unwrap();
        let out = wire(h).await;
        assert_eq!(out, "HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: keep-alive\r\n\r\n");
    }

    #[tokio::test]
    async fn reading_the_body_completes_the_request() {
        let mut h = harness("POST / HTTP/1.1\r\nContent-Length: 4\r\n\r\n", b"ping").await;
        assert_eq!(
            h.registry.state_of(&h.conn).map(|s| s.kind()),
            Some(StateKind::Request)
        );
        let body = h.exchange.read_to_end().await.unwrap();
        assert_eq!(&body[..], b"ping");
        assert_eq!(
            h.registry.state_of(&h.conn).map(|s| s.kind()),
            Some(StateKind::Response)
        );
    }

    #[tokio::test]
    async fn conclude_drains_unread_body_and_keeps_connection() {
        let mut h = harness("POST / HTTP/1.1\r\nContent-Length: 4\r\n\r\n", b"ping").await;
        h.exchange.respond(StatusCode::OK, "ok").await.unwrap();
        let Harness { exchange, .. } = h;
        assert!(exchange.conclude(Ok(()), 1024).await.is_some());
    }

    #[tokio::test]
    async fn conclude_closes_when_body_exceeds_drain_limit() {
        let mut h = harness("POST / HTTP/1.1\r\nContent-Length: 4\r\n\r\n", b"ping").await;
        h.exchange.respond(StatusCode::OK, "ok").await.unwrap();
        let Harness { exchange, .. } = h;
        assert!(exchange.conclude(Ok(()), 2).await.is_none());
    }

    #[tokio::test]
    async fn conclude_sends_500_when_handler_sent_nothing() {
        let h = harness("GET / HTTP/1.1\r\n\r\n", b"").await;
        let Harness { exchange, mut client, .. } = h;
        assert!(exchange.conclude(Ok(()), 1024).await.is_none());
        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        assert!(out.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(out.contains("Connection: close\r\n"));
    }

    #[tokio::test]
    async fn conclude_closes_on_short_fixed_body() {
        let mut h = harness("GET / HTTP/1.1\r\n\r\n", b"").await;
        h.exchange
            .send_response_headers(StatusCode::OK, ResponseLength::Fixed(10))
            .await
            .unwrap();
        h.exchange.write_body(b"abc").await.unwrap();
        let Harness { exchange, .. } = h;
        assert!(exchange.conclude(Ok(()), 1024).await.is_none());
    }

    #[tokio::test]
    async fn connection_close_request_is_not_reused() {
        let mut h = harness("GET / HTTP/1.1\r\nConnection: close\r\n\r\n", b"").await;
        h.exchange.respond(StatusCode::OK, "bye").await.unwrap();
        assert!(
            h.exchange
                .response_headers()
                .get("connection")
                .is_some_and(|v| v == "close")
        );
        let Harness { exchange, .. } = h;
        assert!(exchange.conclude(Ok(()), 1024).await.is_none());
    }
}
