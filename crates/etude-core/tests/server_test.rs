use etude_core::config::{Config, TickSource};
use etude_core::metrics::ServerStats;
use etude_core::signal::Notifier;
use etude_core::store::{Backend, BackendError};
use etude_core::{BackendConfig, EtudeResult, MemoryBackend, Reactor, ResourcePool, UserStore};
use parking_lot::{Condvar, Mutex};
use std::fs;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

struct TestServer {
    addr: SocketAddr,
    notifier: Notifier,
    stats: Arc<ServerStats>,
    handle: Option<JoinHandle<EtudeResult<()>>>,
    _root: tempfile::TempDir,
}

impl TestServer {
    fn start(customize: impl FnOnce(&mut Config)) -> Self {
        Self::start_with(MemoryBackend::new().with_user("alice", "wonderland"), customize)
    }

    fn start_with<B: Backend>(backend: B, customize: impl FnOnce(&mut Config)) -> Self {
        let root = tempfile::tempdir().unwrap();
        for (name, body) in [
            ("judge.html", "<h1>judge</h1>"),
            ("welcome.html", "<h1>welcome</h1>"),
            ("log.html", "<h1>log in</h1>"),
            ("logError.html", "<h1>wrong password</h1>"),
            ("registerError.html", "<h1>name taken</h1>"),
        ] {
            let path = root.path().join(name);
            fs::write(&path, body).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
        }
        let sub = root.path().join("sub");
        fs::create_dir(&sub).unwrap();
        fs::set_permissions(&sub, fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = Config::default();
        config.host = "127.0.0.1".parse().unwrap();
        config.port = 0;
        config.doc_root = root.path().to_path_buf();
        config.workers.threads = 2;
        config.timer.tick_source = TickSource::Thread;
        config.timer.timeslot_ms = 1000;
        config.timer.idle_timeout_ms = 10_000;
        customize(&mut config);

        let pool = Arc::new(ResourcePool::initialize(backend, &BackendConfig::default(), 2).unwrap());
        let mut reactor = Reactor::bind(&config, pool).unwrap();
        let addr = reactor.local_addr();
        let notifier = reactor.notifier();
        let stats = reactor.stats();
        let handle = thread::spawn(move || reactor.run());

        Self {
            addr,
            notifier,
            stats,
            handle: Some(handle),
            _root: root,
        }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        stream
    }

    /// One request on a fresh connection, read until the server closes it.
    fn request(&self, raw: &str) -> String {
        let mut stream = self.connect();
        stream.write_all(raw.as_bytes()).unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        response
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.notifier.stop();
        if let Some(handle) = self.handle.take() {
            let result = handle.join().unwrap();
            if !thread::panicking() {
                result.unwrap();
            }
        }
    }
}

/// Read exactly one response, using its `Content-Length`.
fn read_response(stream: &mut TcpStream) -> (String, String) {
    let mut raw = Vec::new();
    let mut byte = [0u8; 1];
    while !raw.ends_with(b"\r\n\r\n") {
        assert_eq!(stream.read(&mut byte).unwrap(), 1, "connection closed mid-head");
        raw.push(byte[0]);
    }
    let head = String::from_utf8(raw).unwrap();
    let length: usize = head
        .lines()
        .find_map(|line| line.strip_prefix("Content-Length: "))
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).unwrap();
    (head, String::from_utf8(body).unwrap())
}

fn wait_until(what: &str, timeout: Duration, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + timeout;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

fn live(stats: &ServerStats) -> usize {
    stats.snapshot().active_conns
}

#[test]
fn test_root_serves_default_document() {
    let server = TestServer::start(|_| {});
    let res = server.request("GET / HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 200 OK\r\n"), "{res}");
    assert!(res.contains("Content-Length: 14\r\n"));
    assert!(res.contains("Connection: close\r\n"));
    assert!(res.ends_with("<h1>judge</h1>"));
}

#[test]
fn test_directory_and_missing_resources() {
    let server = TestServer::start(|_| {});

    let res = server.request("GET /sub HTTP/1.1\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{res}");
    assert!(res.ends_with("Invalid request format.\n"));

    let res = server.request("GET /nope.html HTTP/1.1\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 404 Not Found\r\n"), "{res}");
    assert!(res.ends_with("Resource not found.\n"));
}

#[test]
fn test_malformed_request_is_rejected_and_closed() {
    let server = TestServer::start(|_| {});
    let res = server.request("PATCH /judge.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{res}");
    assert!(res.contains("Connection: close\r\n"));
}

#[test]
fn test_login_match_and_mismatch() {
    let server = TestServer::start(|_| {});

    let body = "user=alice&password=wonderland";
    let res = server.request(&format!(
        "POST /login HTTP/1.1\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    ));
    assert!(res.starts_with("HTTP/1.1 200 OK\r\n"), "{res}");
    assert!(res.ends_with("<h1>welcome</h1>"));

    let body = "user=alice&password=looking-glass";
    let res = server.request(&format!(
        "POST /login HTTP/1.1\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    ));
    assert!(res.ends_with("<h1>wrong password</h1>"), "{res}");
}

#[test]
fn test_register_then_login() {
    let backend = MemoryBackend::new().with_user("alice", "wonderland");
    let server = TestServer::start_with(backend.clone(), |_| {});
    let body = "user=bob&password=builder";
    let post = |path: &str| {
        server.request(&format!(
            "POST {path} HTTP/1.1\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        ))
    };

    assert!(post("/register").ends_with("<h1>log in</h1>"));
    assert!(post("/register").ends_with("<h1>name taken</h1>"));
    assert!(post("/login").ends_with("<h1>welcome</h1>"));
    assert_eq!(backend.user_count(), 2);
}

#[test]
fn test_keep_alive_reuses_connection() {
    let server = TestServer::start(|_| {});
    let mut stream = server.connect();

    for path in ["/", "/welcome.html", "/nope.html"] {
        stream
            .write_all(format!("GET {path} HTTP/1.1\r\nConnection: keep-alive\r\n\r\n").as_bytes())
            .unwrap();
        let (head, _) = read_response(&mut stream);
        assert!(head.contains("Connection: keep-alive\r\n"), "{head}");
    }

    stream.write_all(b"GET /welcome.html HTTP/1.1\r\n\r\n").unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.contains("Connection: close\r\n"));
    assert_eq!(body, "<h1>welcome</h1>");

    let snap = server.stats.snapshot();
    assert_eq!(snap.accepted, 1);
    assert_eq!(snap.requests, 4);
}

#[test]
fn test_request_split_across_writes() {
    let server = TestServer::start(|_| {});
    let mut stream = server.connect();
    stream.write_all(b"GET /welcome.html HT").unwrap();
    thread::sleep(Duration::from_millis(50));
    stream.write_all(b"TP/1.1\r\nHost: local").unwrap();
    thread::sleep(Duration::from_millis(50));
    stream.write_all(b"host\r\n\r\n").unwrap();
    let mut res = String::new();
    stream.read_to_string(&mut res).unwrap();
    assert!(res.ends_with("<h1>welcome</h1>"), "{res}");
}

#[test]
fn test_idle_connection_evicted_after_timeout_not_before() {
    let server = TestServer::start(|config| {
        config.timer.timeslot_ms = 50;
        config.timer.idle_timeout_ms = 300;
    });

    let mut stream = server.connect();
    wait_until("accept", Duration::from_secs(2), || live(&server.stats) == 1);
    let accepted_at = Instant::now();

    thread::sleep(Duration::from_millis(100));
    assert_eq!(live(&server.stats), 1, "evicted before the idle timeout");

    let mut buf = [0u8; 16];
    assert_eq!(stream.read(&mut buf).unwrap(), 0);
    assert!(accepted_at.elapsed() >= Duration::from_millis(250));
    wait_until("eviction", Duration::from_secs(2), || live(&server.stats) == 0);
    assert_eq!(server.stats.snapshot().evicted, 1);
}

#[test]
fn test_activity_renews_idle_timer() {
    let server = TestServer::start(|config| {
        config.timer.timeslot_ms = 50;
        config.timer.idle_timeout_ms = 400;
    });

    let mut stream = server.connect();
    let started = Instant::now();
    while started.elapsed() < Duration::from_millis(900) {
        stream
            .write_all(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        let (head, _) = read_response(&mut stream);
        assert!(head.starts_with("HTTP/1.1 200 OK"));
        thread::sleep(Duration::from_millis(100));
    }
    assert_eq!(server.stats.snapshot().evicted, 0);
}

#[test]
fn test_connection_limit_answers_busy() {
    let server = TestServer::start(|config| config.max_connections = 1);

    let _first = server.connect();
    wait_until("first accept", Duration::from_secs(2), || live(&server.stats) == 1);

    let mut second = server.connect();
    let mut res = String::new();
    second.read_to_string(&mut res).unwrap();
    assert!(res.starts_with("HTTP/1.1 503 Service Unavailable\r\n"), "{res}");
    assert!(res.ends_with("Internal server busy\n"));
    assert_eq!(server.stats.snapshot().rejected, 1);
    assert_eq!(live(&server.stats), 1);
}

#[test]
fn test_bad_request_after_complete_parse_keeps_connection() {
    let server = TestServer::start(|_| {});
    let mut stream = server.connect();

    stream
        .write_all(b"GET /sub HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{head}");
    assert!(head.contains("Connection: keep-alive\r\n"));
    assert_eq!(body, "Invalid request format.\n");

    stream.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
    assert_eq!(body, "<h1>judge</h1>");
}

#[test]
fn test_request_filling_receive_buffer_is_answered() {
    let server = TestServer::start(|_| {});
    let head = "GET / HTTP/1.1\r\nX-Pad: ";
    let pad = "p".repeat(etude_core::parser::READ_BUFFER_SIZE - head.len() - 4);
    let request = format!("{head}{pad}\r\n\r\n");
    assert_eq!(request.len(), etude_core::parser::READ_BUFFER_SIZE);

    let res = server.request(&request);
    assert!(res.starts_with("HTTP/1.1 200 OK\r\n"), "{res}");
    assert!(res.ends_with("<h1>judge</h1>"));
}

/// Backend whose lookups block until the gate opens.
#[derive(Clone, Default)]
struct GatedBackend {
    gate: Arc<(Mutex<bool>, Condvar)>,
    waiting: Arc<AtomicUsize>,
}

impl GatedBackend {
    fn open(&self) {
        let (open, cvar) = &*self.gate;
        *open.lock() = true;
        cvar.notify_all();
    }
}

struct GatedConn(GatedBackend);

impl Backend for GatedBackend {
    type Conn = GatedConn;

    fn connect(&self, _config: &BackendConfig) -> Result<GatedConn, BackendError> {
        Ok(GatedConn(self.clone()))
    }
}

impl UserStore for GatedConn {
    fn password_of(&mut self, _user: &str) -> Result<Option<String>, BackendError> {
        self.0.waiting.fetch_add(1, Ordering::SeqCst);
        let (open, cvar) = &*self.0.gate;
        let mut open = open.lock();
        while !*open {
            cvar.wait(&mut open);
        }
        Ok(None)
    }

    fn insert(&mut self, _user: &str, _password: &str) -> Result<bool, BackendError> {
        Ok(true)
    }
}

/// Opens the gate when dropped so a failing test cannot leave the worker
/// blocked while the server shuts down.
struct OpenOnDrop(GatedBackend);

impl Drop for OpenOnDrop {
    fn drop(&mut self) {
        self.0.open();
    }
}

#[test]
fn test_full_work_queue_answers_busy() {
    let backend = GatedBackend::default();
    let server = TestServer::start_with(backend.clone(), |config| {
        config.workers.threads = 1;
        config.workers.max_requests = 1;
    });
    let gate = OpenOnDrop(backend.clone());

    // Occupies the only worker.
    let body = "user=alice&password=wonderland";
    let mut blocked = server.connect();
    blocked
        .write_all(
            format!("POST /login HTTP/1.1\r\nContent-Length: {}\r\n\r\n{body}", body.len())
                .as_bytes(),
        )
        .unwrap();
    wait_until("worker to block", Duration::from_secs(2), || {
        backend.waiting.load(Ordering::SeqCst) == 1
    });

    // Fills the queue.
    let mut queued = server.connect();
    queued.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
    thread::sleep(Duration::from_millis(200));

    let res = server.request("GET / HTTP/1.1\r\n\r\n");
    assert!(res.starts_with("HTTP/1.1 503 Service Unavailable\r\n"), "{res}");
    assert!(res.ends_with("Internal server busy\n"));
    assert_eq!(server.stats.snapshot().rejected, 1);

    drop(gate);
    let mut res = String::new();
    blocked.read_to_string(&mut res).unwrap();
    assert!(res.ends_with("<h1>wrong password</h1>"), "{res}");
    let mut res = String::new();
    queued.read_to_string(&mut res).unwrap();
    assert!(res.ends_with("<h1>judge</h1>"), "{res}");
}

struct PanickingBackend;

struct PanickingConn;

impl Backend for PanickingBackend {
    type Conn = PanickingConn;

    fn connect(&self, _config: &BackendConfig) -> Result<PanickingConn, BackendError> {
        Ok(PanickingConn)
    }
}

impl UserStore for PanickingConn {
    fn password_of(&mut self, user: &str) -> Result<Option<String>, BackendError> {
        panic!("lookup of {user} exploded");
    }

    fn insert(&mut self, _user: &str, _password: &str) -> Result<bool, BackendError> {
        Ok(false)
    }
}

#[test]
fn test_panicking_request_closes_connection_immediately() {
    let server = TestServer::start_with(PanickingBackend, |config| {
        config.timer.idle_timeout_ms = 30_000;
    });

    let started = Instant::now();
    let body = "user=alice&password=wonderland";
    let res = server.request(&format!(
        "POST /login HTTP/1.1\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    ));
    assert_eq!(res, "");
    assert!(started.elapsed() < Duration::from_secs(4));
    wait_until("close", Duration::from_secs(2), || live(&server.stats) == 0);

    // The worker survives the panic.
    let res = server.request("GET / HTTP/1.1\r\n\r\n");
    assert!(res.ends_with("<h1>judge</h1>"), "{res}");
}
