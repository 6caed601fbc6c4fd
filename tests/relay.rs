//! End-to-end tests: a real `Server` + `Relay` + `HttpUpstream` talking to a
//! scripted upstream over loopback TCP.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

use ttlproxy::{FileCache, HttpUpstream, ProxyTarget, Relay, Scheme, Server};

// ── Scripted upstream ─────────────────────────────────────────────────────────

#[derive(Clone, Copy)]
enum Reply {
    /// Fixed status, content type and body.
    Fixed(u16, &'static str, &'static str),
    /// 200 with the request body echoed back.
    Echo,
    /// Read the request, then never answer.
    Hang,
}

#[derive(Debug, Clone)]
struct Seen {
    method: String,
    path: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

struct MockUpstream {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<Seen>>>,
    closed: Arc<Notify>,
}

impl MockUpstream {
    async fn start(reply: Reply) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(Notify::new());

        let (hits2, seen2, closed2) = (hits.clone(), seen.clone(), closed.clone());
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let (hits, seen, closed) = (hits2.clone(), seen2.clone(), closed2.clone());
                tokio::spawn(async move {
                    serve_one(stream, reply, hits, seen, closed).await;
                });
            }
        });

        Self {
            addr,
            hits,
            seen,
            closed,
        }
    }

    fn target(&self) -> ProxyTarget {
        ProxyTarget::new(Scheme::Http, "127.0.0.1", self.addr.port()).unwrap()
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

async fn serve_one(
    mut stream: TcpStream,
    reply: Reply,
    hits: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<Seen>>>,
    closed: Arc<Notify>,
) {
    let mut buf = Vec::new();
    let (mut request, head_len) = loop {
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).await.unwrap();
        if n == 0 {
            return;
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut req = httparse::Request::new(&mut headers);
        if let httparse::Status::Complete(len) = req.parse(&buf).unwrap() {
            break (
                Seen {
                    method: req.method.unwrap().to_owned(),
                    path: req.path.unwrap().to_owned(),
                    headers: req
                        .headers
                        .iter()
                        .map(|h| {
                            (
                                h.name.to_ascii_lowercase(),
                                String::from_utf8_lossy(h.value).into_owned(),
                            )
                        })
                        .collect(),
                    body: Vec::new(),
                },
                len,
            );
        }
    };
    hits.fetch_add(1, Ordering::SeqCst);

    let header = |name: &str| {
        request
            .headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
    };
    let mut rest = buf[head_len..].to_vec();
    if let Some(len) = header("content-length") {
        let len: usize = len.parse().unwrap();
        while rest.len() < len {
            let mut chunk = [0u8; 4096];
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "upstream saw a truncated body");
            rest.extend_from_slice(&chunk[..n]);
        }
        request.body = rest[..len].to_vec();
    } else if header("transfer-encoding").is_some() {
        while !rest.ends_with(b"0\r\n\r\n") {
            let mut chunk = [0u8; 4096];
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "upstream saw a truncated body");
            rest.extend_from_slice(&chunk[..n]);
        }
        request.body = dechunk(&rest);
    }

    let echo = request.body.clone();
    seen.lock().unwrap().push(request);

    let (status, content_type, body) = match reply {
        Reply::Fixed(status, content_type, body) => (status, content_type, body.as_bytes().to_vec()),
        Reply::Echo => (200, "application/octet-stream", echo),
        Reply::Hang => {
            let mut sink = [0u8; 64];
            while let Ok(n) = stream.read(&mut sink).await {
                if n == 0 {
                    break;
                }
            }
            closed.notify_one();
            return;
        }
    };

    let head = format!(
        "HTTP/1.1 {status} X\r\nContent-Type: {content_type}\r\nX-Upstream: mock\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(head.as_bytes()).await.unwrap();
    stream.write_all(&body).await.unwrap();
    let _ = stream.shutdown().await;
}

fn dechunk(mut raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let httparse::Status::Complete((offset, size)) = httparse::parse_chunk_size(raw).unwrap() else {
            panic!("partial chunk header");
        };
        let size = size as usize;
        if size == 0 {
            return out;
        }
        out.extend_from_slice(&raw[offset..offset + size]);
        raw = &raw[offset + size + 2..];
    }
}

// ── Proxy under test ──────────────────────────────────────────────────────────

struct Proxy {
    addr: SocketAddr,
    cache: FileCache,
    _dir: TempDir,
}

async fn start_proxy(target: ProxyTarget) -> Proxy {
    let dir = TempDir::new().unwrap();
    let cache = FileCache::open(dir.path()).await.unwrap();
    let upstream = Arc::new(HttpUpstream::new(Duration::from_secs(30)).unwrap());
    let relay = Arc::new(Relay::new(cache.clone(), upstream, target));

    let server = Server::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr();
    tokio::spawn(server.run(move |req| {
        let relay = Arc::clone(&relay);
        async move { relay.handle(req).await }
    }));

    Proxy {
        addr,
        cache,
        _dir: dir,
    }
}

struct ProxyReply {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl ProxyReply {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Reads one `Content-Length`-framed response, leaving any later bytes in `buf`.
async fn read_response(stream: &mut TcpStream, buf: &mut Vec<u8>) -> ProxyReply {
    loop {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut resp = httparse::Response::new(&mut headers);
        if let httparse::Status::Complete(head_len) = resp.parse(buf).unwrap() {
            let status = resp.code.unwrap();
            let headers: Vec<(String, String)> = resp
                .headers
                .iter()
                .map(|h| (h.name.to_owned(), String::from_utf8_lossy(h.value).into_owned()))
                .collect();
            let len: usize = headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
                .map(|(_, v)| v.parse().unwrap())
                .unwrap();
            while buf.len() < head_len + len {
                let mut chunk = [0u8; 4096];
                let n = stream.read(&mut chunk).await.unwrap();
                assert!(n > 0, "proxy closed mid-response");
                buf.extend_from_slice(&chunk[..n]);
            }
            let body = buf[head_len..head_len + len].to_vec();
            buf.drain(..head_len + len);
            return ProxyReply {
                status,
                headers,
                body,
            };
        }

        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "proxy closed before responding");
        buf.extend_from_slice(&chunk[..n]);
    }
}

async fn send(addr: SocketAddr, raw: &str) -> ProxyReply {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();
    read_response(&mut stream, &mut Vec::new()).await
}

fn get(path: &str) -> String {
    format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn miss_then_hit() {
    let upstream = MockUpstream::start(Reply::Fixed(200, "application/json", r#"{"x":1}"#)).await;
    let proxy = start_proxy(upstream.target()).await;

    let first = send(proxy.addr, &get("/bar")).await;
    assert_eq!(first.status, 200);
    assert_eq!(first.body, br#"{"x":1}"#);
    assert_eq!(first.header("x-upstream"), Some("mock"));
    assert_eq!(upstream.hits(), 1);

    let second = send(proxy.addr, &get("/bar")).await;
    assert_eq!(second.status, 200);
    assert_eq!(second.body, br#"{"x":1}"#);
    assert_eq!(second.header("content-type"), Some("application/json"));
    assert_eq!(second.header("x-upstream"), None);
    assert_eq!(upstream.hits(), 1);
}

#[tokio::test]
async fn prepopulated_entry_never_reaches_upstream() {
    let upstream = MockUpstream::start(Reply::Fixed(200, "text/plain", "upstream")).await;
    let proxy = start_proxy(upstream.target()).await;
    let key = format!("GET:http://127.0.0.1:{}/foo", upstream.addr.port());
    proxy
        .cache
        .set(&key, b"cached payload", Duration::from_secs(60))
        .await
        .unwrap();

    let reply = send(proxy.addr, &get("/foo")).await;

    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, b"cached payload");
    assert_eq!(upstream.hits(), 0);
}

#[tokio::test]
async fn forwards_method_path_headers_and_streamed_body() {
    let upstream = MockUpstream::start(Reply::Echo).await;
    let proxy = start_proxy(upstream.target()).await;

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    stream
        .write_all(
            b"POST /items?id=7 HTTP/1.1\r\nHost: localhost\r\nX-Client: t\r\n\
              Transfer-Encoding: chunked\r\nConnection: close\r\n\r\n5\r\nhello\r\n",
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    stream.write_all(b"6\r\n world\r\n0\r\n\r\n").await.unwrap();

    let reply = read_response(&mut stream, &mut Vec::new()).await;
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, b"hello world");

    let seen = upstream.seen.lock().unwrap()[0].clone();
    assert_eq!(seen.method, "POST");
    assert_eq!(seen.path, "/items?id=7");
    assert_eq!(seen.body, b"hello world");
    let header = |name: &str| seen.headers.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str());
    assert_eq!(header("x-client"), Some("t"));
    assert_eq!(header("host"), Some(format!("127.0.0.1:{}", upstream.addr.port()).as_str()));
}

#[tokio::test]
async fn get_and_post_are_cached_separately() {
    let upstream = MockUpstream::start(Reply::Echo).await;
    let proxy = start_proxy(upstream.target()).await;

    let post = "POST /same HTTP/1.1\r\nHost: x\r\nContent-Length: 4\r\nConnection: close\r\n\r\nbody";
    assert_eq!(send(proxy.addr, post).await.body, b"body");
    assert_eq!(send(proxy.addr, &get("/same")).await.body, b"");
    assert_eq!(upstream.hits(), 2);

    assert_eq!(send(proxy.addr, post).await.body, b"body");
    assert_eq!(upstream.hits(), 2);
}

#[tokio::test]
async fn unreachable_upstream_is_500_and_uncached() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let proxy = start_proxy(ProxyTarget::new(Scheme::Http, "127.0.0.1", port).unwrap()).await;

    let reply = send(proxy.addr, &get("/down")).await;

    assert_eq!(reply.status, 500);
    assert!(reply.header("content-type").unwrap().starts_with("text/plain"));
    assert!(!reply.body.is_empty());
    let key = format!("GET:http://127.0.0.1:{port}/down");
    assert!(proxy.cache.get(&key).await.unwrap().is_none());
    assert_eq!(std::fs::read_dir(proxy.cache.dir()).unwrap().count(), 0);
}

#[tokio::test]
async fn upstream_errors_are_relayed_verbatim_on_miss() {
    let upstream = MockUpstream::start(Reply::Fixed(404, "text/html", "<h1>nope</h1>")).await;
    let proxy = start_proxy(upstream.target()).await;

    let reply = send(proxy.addr, &get("/missing")).await;

    assert_eq!(reply.status, 404);
    assert_eq!(reply.header("content-type"), Some("text/html"));
    assert_eq!(reply.body, b"<h1>nope</h1>");
}

#[tokio::test]
async fn keep_alive_serves_pipelined_requests_in_order() {
    let upstream = MockUpstream::start(Reply::Echo).await;
    let proxy = start_proxy(upstream.target()).await;

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    stream
        .write_all(
            b"POST /a HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\n\r\none\
              POST /b HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\n\r\ntwo",
        )
        .await
        .unwrap();

    let mut buf = Vec::new();
    let first = read_response(&mut stream, &mut buf).await;
    let second = read_response(&mut stream, &mut buf).await;
    assert_eq!(first.body, b"one");
    assert_eq!(second.body, b"two");
    assert_eq!(first.header("connection"), Some("keep-alive"));
}

#[tokio::test]
async fn expect_continue_gets_interim_response() {
    let upstream = MockUpstream::start(Reply::Echo).await;
    let proxy = start_proxy(upstream.target()).await;

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    stream
        .write_all(b"PUT /up HTTP/1.1\r\nHost: x\r\nExpect: 100-continue\r\nContent-Length: 2\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let mut interim = [0u8; 25];
    stream.read_exact(&mut interim).await.unwrap();
    assert_eq!(&interim, b"HTTP/1.1 100 Continue\r\n\r\n");

    stream.write_all(b"ok").await.unwrap();
    let reply = read_response(&mut stream, &mut Vec::new()).await;
    assert_eq!(reply.body, b"ok");
    let seen = upstream.seen.lock().unwrap()[0].clone();
    assert!(seen.headers.iter().all(|(k, _)| k != "expect"));
}

#[tokio::test]
async fn malformed_request_is_400() {
    let upstream = MockUpstream::start(Reply::Echo).await;
    let proxy = start_proxy(upstream.target()).await;

    let reply = send(proxy.addr, "NOT AN HTTP REQUEST\r\n\r\n").await;

    assert_eq!(reply.status, 400);
    assert_eq!(upstream.hits(), 0);
}

#[tokio::test]
async fn half_closed_caller_still_gets_response() {
    let upstream = MockUpstream::start(Reply::Fixed(200, "application/json", r#"{"x":1}"#)).await;
    let proxy = start_proxy(upstream.target()).await;

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    stream.write_all(b"GET /bar HTTP/1.0\r\n\r\n").await.unwrap();
    stream.shutdown().await.unwrap();

    let mut raw = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut raw))
        .await
        .expect("proxy never answered")
        .unwrap();

    let text = String::from_utf8(raw).unwrap();
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "got {text:?}");
    assert!(text.ends_with(r#"{"x":1}"#), "got {text:?}");
    assert_eq!(upstream.hits(), 1);
}

// A reset, not a FIN: an orderly close is indistinguishable from a half-close.
#[tokio::test]
#[allow(deprecated)]
async fn caller_disconnect_abandons_upstream_exchange() {
    let upstream = MockUpstream::start(Reply::Hang).await;
    let proxy = start_proxy(upstream.target()).await;

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    stream.write_all(get("/slow").as_bytes()).await.unwrap();

    // Wait until the request has reached the upstream, then hang up.
    tokio::time::timeout(Duration::from_secs(5), async {
        while upstream.hits() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("request never reached upstream");
    stream.set_linger(Some(Duration::ZERO)).unwrap();
    drop(stream);

    tokio::time::timeout(Duration::from_secs(5), upstream.closed.notified())
        .await
        .expect("upstream connection was not dropped");
}
