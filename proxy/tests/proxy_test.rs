//! End-to-end tests for the proxy
//!
//! Each test starts the proxy on an ephemeral port in front of an in-process
//! fake origin that speaks the backend side of the protocol with trust
//! authentication.

use bytes::{BufMut, BytesMut};
use futures_util::StreamExt;
use pgproxy::config::{load_routes_from_str, ProxyConfig};
use pgproxy::protocol::{formatter, parser, ConnectionParams, Frame, FrameDecoder};
use pgproxy::routing::ProviderRegistry;
use pgproxy::server::ProxyServer;
use pgproxy::session::SessionContext;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::codec::FramedRead;

/// Default test timeout
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// What the fake origin has seen
#[derive(Default)]
struct OriginLog {
    connections: AtomicUsize,
    terminates: AtomicUsize,
    queries: Mutex<Vec<String>>,
}

impl OriginLog {
    fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

fn backend_message(tag: u8, body: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(body.len() + 5);
    buf.put_u8(tag);
    buf.put_i32(body.len() as i32 + 4);
    buf.put_slice(body);
    buf
}

fn cstring_pair(name: &str, value: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(name.as_bytes());
    body.push(0);
    body.extend_from_slice(value.as_bytes());
    body.push(0);
    body
}

fn command_complete(tag: &str, status: u8) -> BytesMut {
    let mut reply = backend_message(b'C', format!("{}\0", tag).as_bytes());
    reply.extend_from_slice(&backend_message(b'Z', &[status]));
    reply
}

async fn serve_origin_connection(mut socket: TcpStream, log: Arc<OriginLog>) -> std::io::Result<()> {
    let len = socket.read_i32().await?;
    let mut startup = vec![0u8; len as usize - 4];
    socket.read_exact(&mut startup).await?;

    let mut greeting = backend_message(b'R', &0i32.to_be_bytes());
    greeting.extend_from_slice(&backend_message(b'S', &cstring_pair("server_version", "16.0")));
    greeting.extend_from_slice(&backend_message(b'S', &cstring_pair("client_encoding", "UTF8")));
    greeting.extend_from_slice(&backend_message(b'K', &[0, 0, 0, 42, 0, 0, 0, 7]));
    greeting.extend_from_slice(&backend_message(b'Z', b"I"));
    socket.write_all(&greeting).await?;

    loop {
        let tag = match socket.read_u8().await {
            Ok(tag) => tag,
            Err(_) => return Ok(()),
        };
        let len = socket.read_i32().await?;
        let mut body = vec![0u8; len as usize - 4];
        socket.read_exact(&mut body).await?;

        match tag {
            b'X' => {
                log.terminates.fetch_add(1, Ordering::SeqCst);
                return Ok(());
            }
            b'Q' => {
                let text = String::from_utf8_lossy(&body[..body.len() - 1]).to_string();
                log.queries.lock().unwrap().push(text.clone());
                let reply = match text.as_str() {
                    "BEGIN" => command_complete("BEGIN", b'T'),
                    "DISCARD ALL" => command_complete("DISCARD ALL", b'I'),
                    _ => command_complete("SELECT 1", b'I'),
                };
                socket.write_all(&reply).await?;
            }
            _ => {}
        }
    }
}

async fn start_origin() -> (SocketAddr, Arc<OriginLog>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let log = Arc::new(OriginLog::default());

    let accept_log = Arc::clone(&log);
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            accept_log.connections.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(serve_origin_connection(socket, Arc::clone(&accept_log)));
        }
    });

    (addr, log)
}

struct TestProxy {
    addr: SocketAddr,
    context: Arc<SessionContext>,
    origin_addr: SocketAddr,
    origin: Arc<OriginLog>,
    shutdown: Option<oneshot::Sender<()>>,
    server: JoinHandle<pgproxy::Result<()>>,
}

async fn start_proxy() -> TestProxy {
    start_proxy_with(|_| {}).await
}

async fn start_proxy_with(tweak: impl FnOnce(&mut ProxyConfig)) -> TestProxy {
    let (origin_addr, origin) = start_origin().await;
    let routes = load_routes_from_str(&format!(
        r#"[{{
            "name": "main",
            "match": {{ "database": "app" }},
            "provider": "static",
            "provider_meta": {{ "url": "postgres://app@{}/app" }}
        }}]"#,
        origin_addr
    ))
    .unwrap();

    let mut config = ProxyConfig::for_testing(routes);
    tweak(&mut config);
    let providers = ProviderRegistry::with_builtin(config.connect_timeout);
    let server = ProxyServer::bind(config, providers).await.unwrap();
    let addr = server.local_addr().unwrap();
    let context = server.context();

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(server.run_until(async {
        let _ = shutdown_rx.await;
    }));

    TestProxy {
        addr,
        context,
        origin_addr,
        origin,
        shutdown: Some(shutdown_tx),
        server,
    }
}

impl TestProxy {
    async fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let stopped = timeout(TEST_TIMEOUT, &mut self.server).await;
        assert!(matches!(stopped, Ok(Ok(Ok(())))));
    }

    async fn wait_for_idle(&self, idle: usize) {
        let waited = timeout(TEST_TIMEOUT, async {
            loop {
                if let Some(stats) = self.context.pools.stats("main") {
                    if stats.idle == idle && stats.checked_out == 0 {
                        return;
                    }
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "pool never settled at {} idle", idle);
    }
}

struct TestClient {
    frames: FramedRead<OwnedReadHalf, FrameDecoder>,
    write: OwnedWriteHalf,
}

impl TestClient {
    async fn open(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, write) = stream.into_split();
        Self {
            frames: FramedRead::new(read, FrameDecoder::tagged()),
            write,
        }
    }

    async fn connect(addr: SocketAddr, database: &str) -> (Self, Vec<Frame>) {
        let mut client = Self::open(addr).await;
        client.send_startup(database).await;
        let greeting = client.read_until_ready().await;
        (client, greeting)
    }

    async fn send_startup(&mut self, database: &str) {
        let mut params = ConnectionParams::new();
        params.insert("user".to_string(), "alice".to_string());
        params.insert("database".to_string(), database.to_string());
        self.write.write_all(&formatter::startup(&params)).await.unwrap();
    }

    /// Frames up to and including ReadyForQuery, or up to end of stream
    async fn read_until_ready(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        loop {
            let next = timeout(TEST_TIMEOUT, self.frames.next())
                .await
                .expect("timed out waiting for the proxy");
            match next {
                Some(Ok(frame)) => {
                    let done = frame.is(b'Z');
                    frames.push(frame);
                    if done {
                        return frames;
                    }
                }
                Some(Err(_)) | None => return frames,
            }
        }
    }

    async fn query(&mut self, text: &str) -> Vec<Frame> {
        self.write.write_all(&formatter::query(text)).await.unwrap();
        self.read_until_ready().await
    }

    async fn terminate(mut self) {
        self.write.write_all(&formatter::terminate()).await.unwrap();
        let _ = self.read_until_ready().await;
    }
}

fn tags(frames: &[Frame]) -> Vec<u8> {
    frames.iter().filter_map(Frame::tag).collect()
}

#[tokio::test]
async fn test_greeting_and_query_relay() {
    let proxy = start_proxy().await;
    let (mut client, greeting) = TestClient::connect(proxy.addr, "app").await;

    assert_eq!(tags(&greeting), b"RSSSNZ".to_vec());
    let statuses: Vec<(String, String)> = greeting
        .iter()
        .filter(|frame| frame.is(b'S'))
        .map(|frame| parser::parse_parameter_status(frame).unwrap())
        .collect();
    assert_eq!(
        statuses,
        vec![
            ("server_version".to_string(), "16.0".to_string()),
            ("client_encoding".to_string(), "UTF8".to_string()),
            ("DateStyle".to_string(), "ISO".to_string()),
        ]
    );

    let notice = parser::parse_error_fields(&greeting[4]).unwrap();
    assert_eq!(
        notice[&'M'],
        format!(
            "PGPROXY: proxy successfully connected through to remote at: {}",
            proxy.origin_addr
        )
    );

    let reply = client.query("SELECT 1").await;
    assert_eq!(tags(&reply), b"CZ".to_vec());
    assert_eq!(proxy.origin.queries(), vec!["SELECT 1".to_string()]);
}

#[tokio::test]
async fn test_encryption_request_is_declined() {
    let proxy = start_proxy().await;
    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();

    stream.write_all(&formatter::ssl_request()).await.unwrap();
    let mut answer = [0u8; 1];
    stream.read_exact(&mut answer).await.unwrap();
    assert_eq!(&answer, b"N");

    let (read, write) = stream.into_split();
    let mut client = TestClient {
        frames: FramedRead::new(read, FrameDecoder::tagged()),
        write,
    };
    client.send_startup("app").await;
    let greeting = client.read_until_ready().await;
    assert_eq!(greeting.first().and_then(Frame::tag), Some(b'R'));
    assert_eq!(greeting.last().and_then(Frame::tag), Some(b'Z'));
}

#[tokio::test]
async fn test_terminate_releases_origin_for_reuse() {
    let proxy = start_proxy().await;

    let (mut first, _) = TestClient::connect(proxy.addr, "app").await;
    assert_eq!(tags(&first.query("SELECT 1").await), b"CZ".to_vec());
    first.terminate().await;
    proxy.wait_for_idle(1).await;

    let (mut second, greeting) = TestClient::connect(proxy.addr, "app").await;
    assert_eq!(tags(&greeting), b"RSSSNZ".to_vec());
    assert_eq!(tags(&second.query("SELECT 2").await), b"CZ".to_vec());

    assert_eq!(proxy.origin.connections.load(Ordering::SeqCst), 1);
    assert_eq!(proxy.origin.terminates.load(Ordering::SeqCst), 0);
    assert_eq!(
        proxy.origin.queries(),
        vec![
            "SELECT 1".to_string(),
            "DISCARD ALL".to_string(),
            "SELECT 2".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_open_transaction_evicts_origin() {
    let proxy = start_proxy().await;

    let (mut first, _) = TestClient::connect(proxy.addr, "app").await;
    first.query("BEGIN").await;
    first.terminate().await;
    proxy.wait_for_idle(0).await;

    let (mut second, _) = TestClient::connect(proxy.addr, "app").await;
    second.query("SELECT 1").await;

    assert_eq!(proxy.origin.connections.load(Ordering::SeqCst), 2);
    assert!(!proxy.origin.queries().contains(&"DISCARD ALL".to_string()));
}

#[tokio::test]
async fn test_routing_failure_closes_without_origin() {
    let proxy = start_proxy().await;
    let (_client, frames) = TestClient::connect(proxy.addr, "nope").await;

    assert_eq!(tags(&frames), b"E".to_vec());
    let fields = parser::parse_error_fields(&frames[0]).unwrap();
    assert_eq!(fields[&'S'], "FATAL");
    assert_eq!(fields[&'C'], "3D000");

    assert!(proxy.context.pools.stats("main").is_none());
    assert_eq!(proxy.origin.connections.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_decode_error_is_isolated_to_one_session() {
    let proxy = start_proxy().await;

    let (mut healthy, _) = TestClient::connect(proxy.addr, "app").await;
    let (mut broken, _) = TestClient::connect(proxy.addr, "app").await;

    // Declared length shorter than the length field itself
    broken.write.write_all(b"Q\0\0\0\x02").await.unwrap();
    assert!(broken.read_until_ready().await.is_empty());

    assert_eq!(tags(&healthy.query("SELECT 1").await), b"CZ".to_vec());
    assert_eq!(
        proxy
            .origin
            .queries()
            .iter()
            .filter(|q| q.as_str() == "SELECT 1")
            .count(),
        1
    );
}

#[tokio::test]
async fn test_full_pool_reports_exhaustion() {
    let proxy = start_proxy_with(|config| {
        config.pool.max_size = 1;
        config.pool.acquire_timeout = Duration::from_millis(200);
    })
    .await;

    let (_holder, greeting) = TestClient::connect(proxy.addr, "app").await;
    assert_eq!(greeting.last().and_then(Frame::tag), Some(b'Z'));

    let (_waiter, frames) = TestClient::connect(proxy.addr, "app").await;
    assert_eq!(tags(&frames), b"E".to_vec());
    let fields = parser::parse_error_fields(&frames[0]).unwrap();
    assert_eq!(fields[&'S'], "FATAL");
    assert_eq!(fields[&'C'], "53300");
    assert_eq!(proxy.origin.connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_shutdown_aborts_open_sessions() {
    let mut proxy = start_proxy_with(|config| {
        config.shutdown_timeout = Duration::from_millis(200);
    })
    .await;

    let (mut client, _) = TestClient::connect(proxy.addr, "app").await;
    assert_eq!(tags(&client.query("SELECT 1").await), b"CZ".to_vec());

    proxy.stop().await;

    // The aborted session no longer relays anything
    let _ = client.write.write_all(&formatter::query("SELECT 2")).await;
    assert!(client.read_until_ready().await.is_empty());
    assert_eq!(proxy.origin.queries(), vec!["SELECT 1".to_string()]);
}
