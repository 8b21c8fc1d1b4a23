//! End-to-end tests driving a real server over loopback.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use http_engine::http::{ResponseLength, StatusCode};
use http_engine::server::ConnectionStats;
use http_engine::{
    Filter, HttpHandler, HttpServer, ServerConfig, TraceFilter, filter_fn, handler_fn,
};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

const WAIT: Duration = Duration::from_secs(3);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn serve(config: ServerConfig) -> HttpServer {
    init_tracing();
    HttpServer::bind("127.0.0.1:0", config).await.unwrap()
}

async fn connect(server: &HttpServer) -> BufReader<TcpStream> {
    BufReader::new(TcpStream::connect(server.local_addr()).await.unwrap())
}

async fn send(io: &mut BufReader<TcpStream>, raw: &str) {
    io.get_mut().write_all(raw.as_bytes()).await.unwrap();
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn text(body: &'static str) -> Arc<dyn HttpHandler> {
    handler_fn(move |ex| Box::pin(async move { ex.respond(StatusCode::OK, body).await }))
}

#[derive(Debug)]
struct Reply {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Reply {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn text(&self) -> &str {
        std::str::from_utf8(&self.body).unwrap()
    }
}

async fn read_head(io: &mut BufReader<TcpStream>) -> (u16, Vec<(String, String)>) {
    let mut line = String::new();
    io.read_line(&mut line).await.unwrap();
    let status = line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| panic!("bad status line {line:?}"));

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        io.read_line(&mut line).await.unwrap();
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':').unwrap();
        headers.push((name.to_owned(), value.trim().to_owned()));
    }
    (status, headers)
}

async fn read_reply(io: &mut BufReader<TcpStream>) -> Reply {
    let read = async {
        let (status, headers) = read_head(io).await;
        let mut reply = Reply {
            status,
            headers,
            body: Vec::new(),
        };
        if let Some(len) = reply.header("content-length") {
            let mut body = vec![0u8; len.parse().unwrap()];
            io.read_exact(&mut body).await.unwrap();
            reply.body = body;
        } else if reply.header("transfer-encoding") == Some("chunked") {
            loop {
                let mut size = String::new();
                io.read_line(&mut size).await.unwrap();
                let size = usize::from_str_radix(size.trim(), 16).unwrap();
                let mut chunk = vec![0u8; size + 2];
                io.read_exact(&mut chunk).await.unwrap();
                if size == 0 {
                    break;
                }
                reply.body.extend_from_slice(&chunk[..size]);
            }
        } else if !(reply.status == 204 || reply.status == 304) {
            io.read_to_end(&mut reply.body).await.unwrap();
        }
        reply
    };
    tokio::time::timeout(WAIT, read).await.expect("response timed out")
}

async fn assert_closed(io: &mut BufReader<TcpStream>) {
    let mut rest = Vec::new();
    let read = tokio::time::timeout(WAIT, io.read_to_end(&mut rest))
        .await
        .expect("connection was not closed");
    // A reset counts as closed too.
    if read.is_ok() {
        assert!(rest.is_empty(), "unexpected bytes: {:?}", String::from_utf8_lossy(&rest));
    }
}

#[tokio::test]
async fn routes_to_longest_matching_context() {
    let server = serve(ServerConfig::default()).await;
    let echo_route = || {
        handler_fn(|ex| {
            Box::pin(async move {
                let body = format!("{} {}", ex.context_path(), ex.path());
                ex.respond(StatusCode::OK, body).await
            })
        })
    };
    server.create_context("/", echo_route()).unwrap();
    server.create_context("/foo", echo_route()).unwrap();
    server.start().unwrap();

    let mut io = connect(&server).await;
    send(&mut io, "GET /foo/bar HTTP/1.1\r\nHost: x\r\n\r\n").await;
    let reply = read_reply(&mut io).await;
    assert_eq!(reply.status, 200);
    assert_eq!(reply.text(), "/foo /foo/bar");

    send(&mut io, "GET /foobar HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert_eq!(read_reply(&mut io).await.text(), "/ /foobar");

    server.stop(Duration::ZERO).await.unwrap();
}

#[tokio::test]
async fn conflicting_framing_is_rejected_without_running_handler() {
    let server = serve(ServerConfig::default()).await;
    let invoked = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&invoked);
    server
        .create_context(
            "/",
            handler_fn(move |ex| {
                flag.store(true, Ordering::SeqCst);
                Box::pin(async move { ex.respond(StatusCode::OK, "").await })
            }),
        )
        .unwrap();
    server.start().unwrap();

    let mut io = connect(&server).await;
    send(
        &mut io,
        "POST / HTTP/1.1\r\nContent-Length: 5\r\nTransfer-Encoding: chunked\r\n\r\nhello",
    )
    .await;
    let reply = read_reply(&mut io).await;
    assert_eq!(reply.status, 400);
    assert_eq!(reply.header("connection"), Some("close"));
    assert_closed(&mut io).await;
    assert!(!invoked.load(Ordering::SeqCst));

    server.stop(Duration::ZERO).await.unwrap();
}

#[tokio::test]
async fn illegal_header_name_is_rejected() {
    let server = serve(ServerConfig::default()).await;
    server.create_context("/", text("ok")).unwrap();
    server.start().unwrap();

    let mut io = connect(&server).await;
    send(&mut io, "GET / HTTP/1.1\r\nBad Header: x\r\n\r\n").await;
    assert_eq!(read_reply(&mut io).await.status, 400);
    assert_closed(&mut io).await;

    server.stop(Duration::ZERO).await.unwrap();
}

#[tokio::test]
async fn silent_connection_is_reaped() {
    let config = ServerConfig::default()
        .with_idle_interval(Duration::from_millis(100))
        .with_idle_check(Duration::from_millis(20));
    let server = serve(config).await;
    server.start().unwrap();

    let mut io = connect(&server).await;
    eventually("connection registered", || server.connection_stats().newly_accepted == 1).await;
    assert_closed(&mut io).await;
    eventually("registry emptied", || {
        server.connection_stats() == ConnectionStats::default()
    })
    .await;

    server.stop(Duration::ZERO).await.unwrap();
}

#[tokio::test]
async fn slow_response_is_reaped() {
    let config = ServerConfig::default()
        .with_max_response_time(Some(Duration::from_millis(100)))
        .with_timer_check(Duration::from_millis(20));
    let server = serve(config).await;
    let finished = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&finished);
    server
        .create_context(
            "/",
            handler_fn(move |ex| {
                let flag = Arc::clone(&flag);
                Box::pin(async move {
                    ex.send_response_headers(StatusCode::OK, ResponseLength::Fixed(10)).await?;
                    ex.write_body(b"12345").await?;
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    flag.store(true, Ordering::SeqCst);
                    ex.write_body(b"67890").await
                })
            }),
        )
        .unwrap();
    server.start().unwrap();

    let mut io = connect(&server).await;
    send(&mut io, "GET / HTTP/1.1\r\n\r\n").await;
    let mut received = Vec::new();
    tokio::time::timeout(WAIT, io.read_to_end(&mut received))
        .await
        .expect("connection was not closed")
        .unwrap();
    let received = String::from_utf8(received).unwrap();
    assert!(received.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(received.ends_with("12345"));
    assert!(!finished.load(Ordering::SeqCst));
    eventually("registry emptied", || server.connection_stats().total == 0).await;

    server.stop(Duration::ZERO).await.unwrap();
}

#[tokio::test]
async fn idle_ceiling_closes_second_connection() {
    let server = serve(ServerConfig::default().with_max_idle_connections(1)).await;
    server.create_context("/", text("ok")).unwrap();
    server.start().unwrap();

    let mut first = connect(&server).await;
    send(&mut first, "GET / HTTP/1.1\r\n\r\n").await;
    assert_eq!(read_reply(&mut first).await.status, 200);
    eventually("first connection idle", || server.connection_stats().idle == 1).await;

    let mut second = connect(&server).await;
    send(&mut second, "GET / HTTP/1.1\r\n\r\n").await;
    assert_eq!(read_reply(&mut second).await.status, 200);
    assert_closed(&mut second).await;

    let stats = server.connection_stats();
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.total, 1);

    // The retained connection still serves requests.
    send(&mut first, "GET / HTTP/1.1\r\n\r\n").await;
    assert_eq!(read_reply(&mut first).await.text(), "ok");

    server.stop(Duration::ZERO).await.unwrap();
}

#[tokio::test]
async fn empty_content_length_does_not_block() {
    let server = serve(ServerConfig::default()).await;
    server
        .create_context(
            "/",
            handler_fn(|ex| {
                Box::pin(async move {
                    let body = ex.read_to_end().await?;
                    ex.respond(StatusCode::OK, format!("read {}", body.len())).await
                })
            }),
        )
        .unwrap();
    server.start().unwrap();

    let mut io = connect(&server).await;
    send(&mut io, "POST / HTTP/1.1\r\nContent-Length: 0\r\n\r\n").await;
    assert_eq!(read_reply(&mut io).await.text(), "read 0");

    server.stop(Duration::ZERO).await.unwrap();
}

#[tokio::test]
async fn keep_alive_serves_pipelined_requests() {
    let server = serve(ServerConfig::default()).await;
    server
        .create_context(
            "/",
            handler_fn(|ex| {
                Box::pin(async move {
                    let body = ex.read_to_end().await?;
                    ex.respond(StatusCode::OK, body).await
                })
            }),
        )
        .unwrap();
    server.start().unwrap();

    let mut io = connect(&server).await;
    send(
        &mut io,
        concat!(
            "POST /a HTTP/1.1\r\nContent-Length: 3\r\n\r\none",
            "GET /b HTTP/1.1\r\n\r\n",
            "POST /c HTTP/1.1\r\nContent-Length: 3\r\n\r\ntwo",
        ),
    )
    .await;
    assert_eq!(read_reply(&mut io).await.text(), "one");
    assert_eq!(read_reply(&mut io).await.text(), "");
    assert_eq!(read_reply(&mut io).await.text(), "two");

    server.stop(Duration::ZERO).await.unwrap();
}

#[tokio::test]
async fn short_fixed_response_closes_connection() {
    let server = serve(ServerConfig::default()).await;
    server
        .create_context(
            "/",
            handler_fn(|ex| {
                Box::pin(async move {
                    ex.send_response_headers(StatusCode::OK, ResponseLength::Fixed(10)).await?;
                    ex.write_body(b"abc").await
                })
            }),
        )
        .unwrap();
    server.start().unwrap();

    let mut io = connect(&server).await;
    send(&mut io, "GET / HTTP/1.1\r\n\r\n").await;
    let (status, _) = read_head(&mut io).await;
    assert_eq!(status, 200);
    let mut rest = Vec::new();
    tokio::time::timeout(WAIT, io.read_to_end(&mut rest))
        .await
        .expect("connection was not closed")
        .unwrap();
    assert_eq!(rest, b"abc");

    server.stop(Duration::ZERO).await.unwrap();
}

#[tokio::test]
async fn overrun_write_fails_without_breaking_response() {
    let server = serve(ServerConfig::default()).await;
    server
        .create_context(
            "/",
            handler_fn(|ex| {
                Box::pin(async move {
                    ex.send_response_headers(StatusCode::OK, ResponseLength::Fixed(2)).await?;
                    let overrun = ex.write_body(b"abc").await;
                    assert_eq!(overrun.unwrap_err().kind(), std::io::ErrorKind::InvalidInput);
                    ex.write_body(b"ab").await
                })
            }),
        )
        .unwrap();
    server.start().unwrap();

    let mut io = connect(&server).await;
    send(&mut io, "GET / HTTP/1.1\r\n\r\n").await;
    assert_eq!(read_reply(&mut io).await.text(), "ab");
    send(&mut io, "GET / HTTP/1.1\r\n\r\n").await;
    assert_eq!(read_reply(&mut io).await.text(), "ab");

    server.stop(Duration::ZERO).await.unwrap();
}

#[tokio::test]
async fn header_injection_is_refused() {
    let server = serve(ServerConfig::default()).await;
    server
        .create_context(
            "/",
            handler_fn(|ex| {
                Box::pin(async move {
                    let echoed = ex.query().unwrap_or_default().replace("%0D%0A", "\r\n");
                    ex.response_headers_mut().set("X-Echo", echoed);
                    ex.respond(StatusCode::OK, "ok").await
                })
            }),
        )
        .unwrap();
    server.start().unwrap();

    let mut io = connect(&server).await;
    send(&mut io, "GET /?a%0D%0ASet-Cookie:%20evil=1 HTTP/1.1\r\n\r\n").await;
    let reply = read_reply(&mut io).await;
    assert_eq!(reply.status, 500);
    assert!(reply.header("set-cookie").is_none());
    assert!(reply.header("x-echo").is_none());
    assert_closed(&mut io).await;

    server.stop(Duration::ZERO).await.unwrap();
}

#[tokio::test]
async fn expect_continue_gets_interim_response() {
    let server = serve(ServerConfig::default()).await;
    server
        .create_context(
            "/upload",
            handler_fn(|ex| {
                Box::pin(async move {
                    let body = ex.read_to_end().await?;
                    ex.respond(StatusCode::CREATED, body).await
                })
            }),
        )
        .unwrap();
    server.start().unwrap();

    let mut io = connect(&server).await;
    send(
        &mut io,
        "PUT /upload HTTP/1.1\r\nContent-Length: 4\r\nExpect: 100-continue\r\n\r\n",
    )
    .await;
    let (status, headers) = read_head(&mut io).await;
    assert_eq!(status, 100);
    assert!(headers.is_empty());

    send(&mut io, "data").await;
    let reply = read_reply(&mut io).await;
    assert_eq!(reply.status, 201);
    assert_eq!(reply.text(), "data");

    server.stop(Duration::ZERO).await.unwrap();
}

#[tokio::test]
async fn no_interim_response_without_body_or_for_http10() {
    let server = serve(ServerConfig::default()).await;
    server
        .create_context(
            "/",
            handler_fn(|ex| {
                Box::pin(async move {
                    let body = ex.read_to_end().await?;
                    ex.respond(StatusCode::OK, body).await
                })
            }),
        )
        .unwrap();
    server.start().unwrap();

    let mut io = connect(&server).await;
    send(&mut io, "GET / HTTP/1.1\r\nExpect: 100-continue\r\n\r\n").await;
    assert_eq!(read_reply(&mut io).await.status, 200);

    let mut io = connect(&server).await;
    send(
        &mut io,
        "POST / HTTP/1.0\r\nContent-Length: 2\r\nExpect: 100-continue\r\n\r\nhi",
    )
    .await;
    let reply = read_reply(&mut io).await;
    assert_eq!(reply.status, 200);
    assert_eq!(reply.text(), "hi");

    server.stop(Duration::ZERO).await.unwrap();
}

#[tokio::test]
async fn routing_errors_keep_connection_open() {
    let server = serve(ServerConfig::default()).await;
    server.create_context("/foo", text("foo")).unwrap();
    server.create_context_empty("/empty").unwrap();
    server.start().unwrap();

    let mut io = connect(&server).await;
    send(&mut io, "GET /foobar HTTP/1.1\r\n\r\n").await;
    let reply = read_reply(&mut io).await;
    assert_eq!(reply.status, 404);
    assert!(reply.text().contains("No context found for request"));

    send(&mut io, "GET /empty HTTP/1.1\r\n\r\n").await;
    assert_eq!(read_reply(&mut io).await.status, 500);

    send(&mut io, "GET /foo HTTP/1.1\r\n\r\n").await;
    assert_eq!(read_reply(&mut io).await.text(), "foo");

    server.stop(Duration::ZERO).await.unwrap();
}

#[tokio::test]
async fn head_request_to_unknown_path_gets_no_body() {
    let server = serve(ServerConfig::default()).await;
    server.create_context("/foo", text("foo")).unwrap();
    server.start().unwrap();

    let mut io = connect(&server).await;
    send(&mut io, "HEAD /nope HTTP/1.1\r\n\r\n").await;
    let (status, headers) = read_head(&mut io).await;
    assert_eq!(status, 404);
    assert!(headers.iter().any(|(n, _)| n.eq_ignore_ascii_case("content-length")));
    assert_closed(&mut io).await;

    server.stop(Duration::ZERO).await.unwrap();
}

#[tokio::test]
async fn handler_attached_after_start_is_used() {
    let server = serve(ServerConfig::default()).await;
    let context = server.create_context_empty("/late").unwrap();
    server.start().unwrap();

    context.set_handler(text("attached"));
    let mut io = connect(&server).await;
    send(&mut io, "GET /late HTTP/1.1\r\n\r\n").await;
    assert_eq!(read_reply(&mut io).await.text(), "attached");

    server.remove_context_ref(&context).unwrap();
    send(&mut io, "GET /late HTTP/1.1\r\n\r\n").await;
    assert_eq!(read_reply(&mut io).await.status, 404);

    server.stop(Duration::ZERO).await.unwrap();
}

#[tokio::test]
async fn chunked_request_and_response() {
    let server = serve(ServerConfig::default()).await;
    server
        .create_context(
            "/",
            handler_fn(|ex| {
                Box::pin(async move {
                    let body = ex.read_to_end().await?;
                    ex.send_response_headers(StatusCode::OK, ResponseLength::Chunked).await?;
                    ex.write_body(b"got ").await?;
                    ex.write_body(&body).await
                })
            }),
        )
        .unwrap();
    server.start().unwrap();

    let mut io = connect(&server).await;
    send(
        &mut io,
        "POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n",
    )
    .await;
    let reply = read_reply(&mut io).await;
    assert_eq!(reply.header("transfer-encoding"), Some("chunked"));
    assert_eq!(reply.text(), "got Wikipedia");

    // HTTP/1.0 cannot decode chunks: the body is delimited by closing.
    send(
        &mut io,
        "POST / HTTP/1.0\r\nConnection: keep-alive\r\nContent-Length: 2\r\n\r\nhi",
    )
    .await;
    let reply = read_reply(&mut io).await;
    assert_eq!(reply.header("connection"), Some("close"));
    assert_eq!(reply.text(), "got hi");

    server.stop(Duration::ZERO).await.unwrap();
}

#[tokio::test]
async fn http10_closes_unless_keep_alive() {
    let server = serve(ServerConfig::default()).await;
    server.create_context("/", text("ok")).unwrap();
    server.start().unwrap();

    let mut io = connect(&server).await;
    send(&mut io, "GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n").await;
    let reply = read_reply(&mut io).await;
    assert_eq!(reply.header("connection"), Some("keep-alive"));

    send(&mut io, "GET / HTTP/1.0\r\n\r\n").await;
    let reply = read_reply(&mut io).await;
    assert_eq!(reply.header("connection"), Some("close"));
    assert_closed(&mut io).await;

    server.stop(Duration::ZERO).await.unwrap();
}

#[tokio::test]
async fn filters_run_system_first_and_can_short_circuit() {
    fn tag(name: &'static str) -> Arc<dyn Filter> {
        filter_fn(move |ex, chain| {
            Box::pin(async move {
                match ex.attributes_mut().get_mut::<Vec<&'static str>>() {
                    Some(seen) => seen.push(name),
                    None => {
                        ex.attributes_mut().insert(vec![name]);
                    }
                }
                chain.proceed(ex).await
            })
        })
    }

    let server = serve(ServerConfig::default()).await;
    let context = server
        .create_context(
            "/",
            handler_fn(|ex| {
                Box::pin(async move {
                    let seen = ex
                        .attributes()
                        .get::<Vec<&'static str>>()
                        .map(|v| v.join(","))
                        .unwrap_or_default();
                    ex.respond(StatusCode::OK, seen).await
                })
            }),
        )
        .unwrap();
    context.add_filter(tag("user"));
    context.add_system_filter(Arc::new(TraceFilter));
    context.add_system_filter(tag("system"));
    context.add_filter(filter_fn(|ex, chain| {
        Box::pin(async move {
            if ex.request_headers().contains("x-deny") {
                return ex.respond(StatusCode::FORBIDDEN, "denied").await;
            }
            chain.proceed(ex).await
        })
    }));
    server.start().unwrap();

    let mut io = connect(&server).await;
    send(&mut io, "GET / HTTP/1.1\r\n\r\n").await;
    assert_eq!(read_reply(&mut io).await.text(), "system,user");

    send(&mut io, "GET / HTTP/1.1\r\nX-Deny: 1\r\n\r\n").await;
    let reply = read_reply(&mut io).await;
    assert_eq!(reply.status, 403);
    assert_eq!(reply.text(), "denied");

    server.stop(Duration::ZERO).await.unwrap();
}

#[tokio::test]
async fn handler_failures_close_the_connection() {
    let server = serve(ServerConfig::default()).await;
    server
        .create_context(
            "/",
            handler_fn(|ex| {
                Box::pin(async move {
                    if ex.path() == "/panic" {
                        panic!("handler exploded");
                    }
                    if ex.path() == "/error" {
                        return Err(std::io::Error::other("database unavailable"));
                    }
                    Ok(())
                })
            }),
        )
        .unwrap();
    server.start().unwrap();

    let mut io = connect(&server).await;
    send(&mut io, "GET /error HTTP/1.1\r\n\r\n").await;
    let reply = read_reply(&mut io).await;
    assert_eq!(reply.status, 500);
    assert_closed(&mut io).await;

    // Returning without a response is answered for the handler.
    let mut io = connect(&server).await;
    send(&mut io, "GET /silent HTTP/1.1\r\n\r\n").await;
    assert_eq!(read_reply(&mut io).await.status, 500);
    assert_closed(&mut io).await;

    let mut io = connect(&server).await;
    send(&mut io, "GET /panic HTTP/1.1\r\n\r\n").await;
    assert_closed(&mut io).await;

    // The server keeps serving after a panic.
    let mut io = connect(&server).await;
    send(&mut io, "GET /error HTTP/1.1\r\n\r\n").await;
    assert_eq!(read_reply(&mut io).await.status, 500);

    server.stop(Duration::ZERO).await.unwrap();
}

#[tokio::test]
async fn connection_ceiling_drops_extra_connections() {
    let server = serve(ServerConfig::default().with_max_connections(Some(1))).await;
    server.create_context("/", text("ok")).unwrap();
    server.start().unwrap();

    let mut first = connect(&server).await;
    send(&mut first, "GET / HTTP/1.1\r\n\r\n").await;
    assert_eq!(read_reply(&mut first).await.status, 200);

    let mut second = connect(&server).await;
    assert_closed(&mut second).await;
    assert_eq!(server.connection_stats().total, 1);

    server.stop(Duration::ZERO).await.unwrap();
}

#[tokio::test]
async fn stop_lets_in_flight_exchange_finish() {
    let server = serve(ServerConfig::default()).await;
    server
        .create_context(
            "/",
            handler_fn(|ex| {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    ex.respond(StatusCode::OK, "done").await
                })
            }),
        )
        .unwrap();
    server.start().unwrap();
    let addr = server.local_addr();

    let mut busy = connect(&server).await;
    let mut idle = connect(&server).await;
    send(&mut busy, "GET / HTTP/1.1\r\n\r\n").await;
    eventually("exchange in flight", || server.connection_stats().response == 1).await;

    server.stop(Duration::from_secs(2)).await.unwrap();

    let reply = read_reply(&mut busy).await;
    assert_eq!(reply.text(), "done");
    assert_closed(&mut busy).await;
    assert_closed(&mut idle).await;
    assert!(TcpStream::connect(addr).await.is_err());
    assert_eq!(server.connection_stats().total, 0);
}

#[tokio::test]
async fn stop_forces_close_after_grace() {
    let server = serve(ServerConfig::default()).await;
    server
        .create_context(
            "/",
            handler_fn(|ex| {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    ex.respond(StatusCode::OK, "too late").await
                })
            }),
        )
        .unwrap();
    server.start().unwrap();

    let mut io = connect(&server).await;
    send(&mut io, "GET / HTTP/1.1\r\n\r\n").await;
    eventually("exchange in flight", || server.connection_stats().response == 1).await;

    let started = tokio::time::Instant::now();
    server.stop(Duration::from_millis(100)).await.unwrap();
    assert!(started.elapsed() < WAIT);
    assert_closed(&mut io).await;
}
