use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::rc::Rc;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use ember_http::{
    AppId, Body, ChunkFrame, Dispatcher, HttpConnection, Remote, RequestHead, Server, ServerConfig,
};

/// What the test dispatcher observed, reported over a channel.
#[derive(Debug)]
enum Observed {
    Request {
        method: String,
        target: String,
        host: Option<String>,
        body: Option<Vec<u8>>,
        first_chunk: Option<(usize, Option<Vec<u8>>)>,
    },
    Chunk {
        size: usize,
        data: Option<Vec<u8>>,
        trailers: Vec<(String, String)>,
    },
}

struct TestDispatcher {
    events: mpsc::Sender<Observed>,
}

impl TestDispatcher {
    fn respond(&self, conn: &HttpConnection) {
        let _ = conn.write(
            Bytes::from_static(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok"),
            None,
            false,
        );
        let _ = conn.finish(None);
    }
}

impl Dispatcher for TestDispatcher {
    fn resolve(&self, target: &http::Uri, _headers: &http::HeaderMap) -> Option<AppId> {
        if target.path() == "/missing" {
            None
        } else {
            Some(AppId(1))
        }
    }

    fn do_request(&self, _app: AppId, conn: &HttpConnection, head: &Rc<RequestHead>, body: Body) {
        let (body_bytes, first_chunk, terminal) = match body {
            Body::None => (None, None, true),
            Body::Full(data) => (Some(data.to_vec()), None, true),
            Body::Chunk(frame, _trailers) => {
                let terminal = frame.data.is_none();
                (None, Some((frame.size, frame.data.map(|d| d.to_vec()))), terminal)
            }
        };

        self.events
            .send(Observed::Request {
                method: head.method.to_string(),
                target: head.target.to_string(),
                host: head
                    .headers
                    .get("host")
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.to_string()),
                body: body_bytes,
                first_chunk,
            })
            .unwrap();

        // For chunked requests the response waits for the terminal chunk.
        if terminal {
            self.respond(conn);
        }
    }

    fn do_request_chunk(
        &self,
        _app: AppId,
        conn: &HttpConnection,
        _head: &Rc<RequestHead>,
        chunk: ChunkFrame,
        trailers: Option<http::HeaderMap>,
    ) {
        let terminal = chunk.data.is_none();

        self.events
            .send(Observed::Chunk {
                size: chunk.size,
                data: chunk.data.map(|d| d.to_vec()),
                trailers: trailers
                    .map(|map| {
                        map.iter()
                            .map(|(name, value)| {
                                (name.to_string(), String::from_utf8_lossy(value.as_bytes()).into_owned())
                            })
                            .collect()
                    })
                    .unwrap_or_default(),
            })
            .unwrap();

        if terminal {
            self.respond(conn);
        }
    }
}

struct TestServer {
    addr: SocketAddr,
    remote: Remote,
    events: mpsc::Receiver<Observed>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    fn start(mut config: ServerConfig) -> TestServer {
        let _ = env_logger::builder().is_test(true).try_init();

        config.host = "127.0.0.1".to_string();
        config.port = Some(0);

        let (events_tx, events_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();

        let handle = thread::spawn(move || {
            let dispatcher = Rc::new(TestDispatcher { events: events_tx });
            let server = Server::bind(config, dispatcher).unwrap();
            ready_tx.send((server.local_addrs()[0], server.remote())).unwrap();
            server.start().unwrap();
        });

        let (addr, remote) = ready_rx.recv().unwrap();

        TestServer {
            addr,
            remote,
            events: events_rx,
            handle: Some(handle),
        }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        stream
    }

    fn event(&self) -> Observed {
        self.events.recv_timeout(Duration::from_secs(5)).unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.remote.stop();
        if let Some(handle) = self.handle.take() {
            handle.join().unwrap();
        }
    }
}

/// Reads one response head (through the blank line) plus `body_len` body
/// bytes.
fn read_response(stream: &mut TcpStream, body_len: usize) -> (String, Vec<u8>) {
    let mut data = Vec::new();
    let mut buf = [0u8; 1024];

    let head_end = loop {
        if let Some(at) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break at + 4;
        }
        let n = stream.read(&mut buf).unwrap();
        assert!(n > 0, "connection closed before response head completed");
        data.extend_from_slice(&buf[..n]);
    };

    while data.len() < head_end + body_len {
        let n = stream.read(&mut buf).unwrap();
        assert!(n > 0, "connection closed before response body completed");
        data.extend_from_slice(&buf[..n]);
    }

    let head = String::from_utf8_lossy(&data[..head_end]).into_owned();
    let body = data[head_end..head_end + body_len].to_vec();
    assert_eq!(data.len(), head_end + body_len, "unexpected extra bytes");
    (head, body)
}

fn read_eof(stream: &mut TcpStream) {
    let mut buf = [0u8; 1024];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return,
            Ok(_) => continue,
            Err(err) => panic!("expected EOF, got error: {}", err),
        }
    }
}

#[test]
fn get_without_body_keeps_the_connection_open() {
    let server = TestServer::start(ServerConfig::default());
    let mut stream = server.connect();

    stream.write_all(b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n").unwrap();

    let (head, body) = read_response(&mut stream, 2);
    assert!(head.starts_with("HTTP/1.1 200 "), "head was {:?}", head);
    assert_eq!(body, b"ok");

    match server.event() {
        Observed::Request {
            method,
            target,
            host,
            body,
            ..
        } => {
            assert_eq!(method, "GET");
            assert_eq!(target, "/x");
            assert_eq!(host.as_deref(), Some("h"));
            assert_eq!(body, None);
        }
        other => panic!("unexpected event {:?}", other),
    }

    // Same connection serves a second request.
    stream.write_all(b"GET /y HTTP/1.1\r\nHost: h\r\n\r\n").unwrap();
    let (head, _) = read_response(&mut stream, 2);
    assert!(head.starts_with("HTTP/1.1 200 "));

    match server.event() {
        Observed::Request { target, .. } => assert_eq!(target, "/y"),
        other => panic!("unexpected event {:?}", other),
    }
}

#[test]
fn post_with_content_length_delivers_the_body() {
    let server = TestServer::start(ServerConfig::default());
    let mut stream = server.connect();

    stream
        .write_all(b"POST /p HTTP/1.1\r\nHost: h\r\nContent-Length: 5\r\n\r\nhello")
        .unwrap();

    let (head, _) = read_response(&mut stream, 2);
    assert!(head.starts_with("HTTP/1.1 200 "));

    match server.event() {
        Observed::Request { method, body, .. } => {
            assert_eq!(method, "POST");
            assert_eq!(body.as_deref(), Some(&b"hello"[..]));
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[test]
fn content_length_zero_dispatches_an_empty_body() {
    let server = TestServer::start(ServerConfig::default());
    let mut stream = server.connect();

    stream
        .write_all(b"POST /p HTTP/1.1\r\nHost: h\r\nContent-Length: 0\r\n\r\n")
        .unwrap();

    let (head, _) = read_response(&mut stream, 2);
    assert!(head.starts_with("HTTP/1.1 200 "));

    match server.event() {
        Observed::Request { body, .. } => assert_eq!(body.as_deref(), Some(&b""[..])),
        other => panic!("unexpected event {:?}", other),
    }
}

#[test]
fn chunked_post_dispatches_each_frame() {
    let server = TestServer::start(ServerConfig::default());
    let mut stream = server.connect();

    stream
        .write_all(b"POST /c HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: chunked\r\n\r\n")
        .unwrap();
    stream.write_all(b"5\r\nhello\r\n0\r\n\r\n").unwrap();

    let (head, _) = read_response(&mut stream, 2);
    assert!(head.starts_with("HTTP/1.1 200 "));

    match server.event() {
        Observed::Request { first_chunk, body, .. } => {
            assert_eq!(body, None);
            assert_eq!(first_chunk, Some((5, Some(b"hello".to_vec()))));
        }
        other => panic!("unexpected event {:?}", other),
    }

    match server.event() {
        Observed::Chunk { size, data, trailers } => {
            assert_eq!(size, 0);
            assert_eq!(data, None);
            assert!(trailers.is_empty());
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[test]
fn chunked_post_delivers_trailers() {
    let server = TestServer::start(ServerConfig::default());
    let mut stream = server.connect();

    stream
        .write_all(
            b"POST /c HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: chunked\r\nTrailer: X-Checksum\r\n\r\n",
        )
        .unwrap();
    stream
        .write_all(b"5\r\nhello\r\n0\r\nX-Checksum: abc\r\n\r\n")
        .unwrap();

    let (head, _) = read_response(&mut stream, 2);
    assert!(head.starts_with("HTTP/1.1 200 "));

    // First frame.
    match server.event() {
        Observed::Request { first_chunk, .. } => {
            assert_eq!(first_chunk, Some((5, Some(b"hello".to_vec()))));
        }
        other => panic!("unexpected event {:?}", other),
    }

    // Terminal frame carries the trailers.
    match server.event() {
        Observed::Chunk { size, data, trailers } => {
            assert_eq!(size, 0);
            assert_eq!(data, None);
            assert_eq!(trailers, vec![("x-checksum".to_string(), "abc".to_string())]);
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[test]
fn oversize_body_gets_413_and_the_connection_survives() {
    let mut config = ServerConfig::default();
    config.max_buffer_size = 1024;

    let server = TestServer::start(config);
    let mut stream = server.connect();

    let body = vec![b'x'; 5000];
    stream
        .write_all(b"POST /big HTTP/1.1\r\nHost: h\r\nContent-Length: 5000\r\n\r\n")
        .unwrap();
    stream.write_all(&body).unwrap();

    let (head, _) = read_response(&mut stream, 0);
    assert!(head.starts_with("HTTP/1.1 413 "), "head was {:?}", head);

    // The body was discarded, not dispatched, and the same connection
    // accepts the next request.
    stream.write_all(b"GET /after HTTP/1.1\r\nHost: h\r\n\r\n").unwrap();
    let (head, _) = read_response(&mut stream, 2);
    assert!(head.starts_with("HTTP/1.1 200 "));

    match server.event() {
        Observed::Request { target, .. } => assert_eq!(target, "/after"),
        other => panic!("unexpected event {:?}", other),
    }
}

#[test]
fn expect_100_continue_gets_the_preamble_first() {
    let server = TestServer::start(ServerConfig::default());
    let mut stream = server.connect();

    stream
        .write_all(
            b"PUT /u HTTP/1.1\r\nHost: h\r\nContent-Length: 3\r\nExpect: 100-continue\r\n\r\n",
        )
        .unwrap();

    // Exactly one interim response before any body byte is sent.
    let mut preamble = [0u8; 25];
    stream.read_exact(&mut preamble).unwrap();
    assert_eq!(&preamble, b"HTTP/1.1 100 (Continue)\r\n");
    let mut blank = [0u8; 2];
    stream.read_exact(&mut blank).unwrap();
    assert_eq!(&blank, b"\r\n");

    stream.write_all(b"abc").unwrap();

    let (head, _) = read_response(&mut stream, 2);
    assert!(head.starts_with("HTTP/1.1 200 "));

    match server.event() {
        Observed::Request { body, .. } => assert_eq!(body.as_deref(), Some(&b"abc"[..])),
        other => panic!("unexpected event {:?}", other),
    }
}

#[test]
fn non_http_1_1_request_gets_400_and_a_close() {
    let server = TestServer::start(ServerConfig::default());
    let mut stream = server.connect();

    stream.write_all(b"GET /x HTTP/1.0\r\nHost: h\r\n\r\n").unwrap();

    let (head, _) = read_response(&mut stream, 0);
    assert!(head.starts_with("HTTP/1.1 400 "), "head was {:?}", head);
    read_eof(&mut stream);
}

#[test]
fn malformed_start_line_gets_400() {
    let server = TestServer::start(ServerConfig::default());
    let mut stream = server.connect();

    stream.write_all(b"complete nonsense\r\n\r\n").unwrap();

    let (head, _) = read_response(&mut stream, 0);
    assert!(head.starts_with("HTTP/1.1 400 "));
    read_eof(&mut stream);
}

#[test]
fn unresolvable_target_gets_404_and_a_close() {
    let server = TestServer::start(ServerConfig::default());
    let mut stream = server.connect();

    stream.write_all(b"GET /missing HTTP/1.1\r\nHost: h\r\n\r\n").unwrap();

    let (head, _) = read_response(&mut stream, 0);
    assert!(head.starts_with("HTTP/1.1 404 "), "head was {:?}", head);
    read_eof(&mut stream);
}

#[test]
fn connection_close_header_is_honored() {
    let server = TestServer::start(ServerConfig::default());
    let mut stream = server.connect();

    stream
        .write_all(b"GET /x HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n")
        .unwrap();

    let (head, _) = read_response(&mut stream, 2);
    assert!(head.starts_with("HTTP/1.1 200 "));
    read_eof(&mut stream);
}

#[test]
fn no_keep_alive_closes_after_every_response() {
    let mut config = ServerConfig::default();
    config.no_keep_alive = true;

    let server = TestServer::start(config);
    let mut stream = server.connect();

    stream.write_all(b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n").unwrap();

    let (head, _) = read_response(&mut stream, 2);
    assert!(head.starts_with("HTTP/1.1 200 "));
    read_eof(&mut stream);
}

#[test]
fn leading_blank_lines_are_tolerated() {
    let server = TestServer::start(ServerConfig::default());
    let mut stream = server.connect();

    stream
        .write_all(b"\r\n\r\nGET /x HTTP/1.1\r\nHost: h\r\n\r\n")
        .unwrap();

    let (head, _) = read_response(&mut stream, 2);
    assert!(head.starts_with("HTTP/1.1 200 "));
}

#[test]
fn unbounded_garbage_overflows_and_closes() {
    let mut config = ServerConfig::default();
    config.max_buffer_size = 1024;

    let server = TestServer::start(config);
    let mut stream = server.connect();

    // No delimiter anywhere: the head read can never complete and the
    // buffer ceiling closes the stream.
    let garbage = vec![b'a'; 5000];
    let _ = stream.write_all(&garbage);

    read_eof(&mut stream);
}

#[test]
fn idle_connection_times_out() {
    let mut config = ServerConfig::default();
    config.connection_timeout = Duration::from_millis(100);

    let server = TestServer::start(config);
    let mut stream = server.connect();

    // Send nothing; the idle timer must disconnect us.
    read_eof(&mut stream);
}
