use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use bytes::Bytes;
use http::header::CONTENT_LENGTH;
use http::{Method, Version};
use log::{error, trace, warn};
use slab::Slab;

use crate::config::ServerConfig;
use crate::dispatch::{AppId, Body, Dispatcher};
use crate::error::{Error, Result};
use crate::reactor::Reactor;
use crate::stream::ByteStream;
use crate::timer::{Deadline, TimeoutHandle};

use super::chunk::{encode_chunk, parse_chunk_size, parse_trailers, ChunkFrame};
use super::head::{self, Framing, RequestHead};

const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";
const NOT_FOUND: &[u8] = b"HTTP/1.1 404 Not Found\r\n\r\n";
const ENTITY_TOO_LARGE: &[u8] = b"HTTP/1.1 413 Request Entity Too Large\r\n\r\n";
const INTERNAL_ERROR: &[u8] = b"HTTP/1.1 500 Internal Server Error\r\n\r\n";
const CONTINUE: &[u8] = b"HTTP/1.1 100 (Continue)\r\n\r\n";

/// Where the connection currently is in the request cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitingHead,
    AwaitingBody { remaining: usize },
    AwaitingChunkLine,
    AwaitingChunkData { size: usize },
    AwaitingTrailers,
    Dispatching,
    WritingResponse,
    Closing,
}

pub(crate) type ConnTable = Rc<RefCell<Slab<HttpConnection>>>;

type FinishCallback = Box<dyn FnOnce() -> Result<()>>;

/// One HTTP/1.1 client connection: wire parsing, body framing, response
/// emission and the keep-alive / close decision.
///
/// Only HTTP/1.1 requests are accepted; anything else is answered with
/// 400 and the connection is closed. Requests are handled strictly one at
/// a time (no pipelining).
#[derive(Clone)]
pub struct HttpConnection {
    inner: Rc<RefCell<ConnInner>>,
}

struct ConnInner {
    id: usize,
    stream: ByteStream,
    reactor: Rc<Reactor>,
    dispatcher: Rc<dyn Dispatcher>,
    config: Rc<ServerConfig>,
    server: Weak<RefCell<Slab<HttpConnection>>>,
    peer: SocketAddr,
    state: ConnectionState,
    /// Head of the in-flight request; at most one at a time.
    head: Option<Rc<RequestHead>>,
    app: Option<AppId>,
    /// Whether the in-flight request has been handed to the application.
    dispatched: bool,
    /// Size and extension of the chunk currently being read.
    cur_chunk: Option<(usize, Option<Bytes>)>,
    chunked_response: bool,
    write_cb: Option<FinishCallback>,
    close_cb: Option<FinishCallback>,
    finish_cb: Option<FinishCallback>,
    finish_pending: bool,
    timeout: Option<TimeoutHandle>,
    /// Still present in the server's connection table.
    registered: bool,
}

impl HttpConnection {
    pub(crate) fn new(
        id: usize,
        stream: ByteStream,
        reactor: Rc<Reactor>,
        dispatcher: Rc<dyn Dispatcher>,
        config: Rc<ServerConfig>,
        server: Weak<RefCell<Slab<HttpConnection>>>,
    ) -> HttpConnection {
        let peer = stream.peer_addr();

        HttpConnection {
            inner: Rc::new(RefCell::new(ConnInner {
                id,
                stream,
                reactor,
                dispatcher,
                config,
                server,
                peer,
                state: ConnectionState::AwaitingHead,
                head: None,
                app: None,
                dispatched: false,
                cur_chunk: None,
                chunked_response: false,
                write_cb: None,
                close_cb: None,
                finish_cb: None,
                finish_pending: false,
                timeout: None,
                registered: true,
            })),
        }
    }

    /// Arms the first head read, the close callback and the idle timeout.
    /// Called once the connection sits in the server's table, since a
    /// fast client may drive the whole request synchronously from here.
    pub(crate) fn start(&self) -> Result<()> {
        {
            let mut inner = self.inner.borrow_mut();

            let stream = inner.stream.clone();
            let weak = Rc::downgrade(&self.inner);
            stream.set_close_callback(move || match weak.upgrade() {
                Some(inner) => HttpConnection { inner }.on_connection_close(),
                None => Ok(()),
            });

            let weak = Rc::downgrade(&self.inner);
            let handle = inner.reactor.add_timeout(
                Deadline::In(inner.config.connection_timeout),
                move || match weak.upgrade() {
                    Some(inner) => HttpConnection { inner }.on_timeout(),
                    None => Ok(()),
                },
            );
            inner.timeout = Some(handle);
        }

        self.arm_head()
    }

    //---- Public surface used by dispatchers.

    /// Writes a chunk of response data. Refused when no request is in
    /// flight, unless `force` is set (used for the fixed error replies).
    /// In chunked-response mode each non-forced write is framed as one
    /// chunk. `callback` fires when the stream write buffer drains.
    pub fn write(&self, chunk: Bytes, callback: Option<FinishCallback>, force: bool) -> Result<()> {
        {
            let inner = self.inner.borrow();

            if !force && inner.head.is_none() {
                error!("response write without a request in flight");
                return Ok(());
            }

            if inner.stream.closed() {
                warn!("cannot write to closed stream {}", inner.peer);
                return Ok(());
            }
        }

        let data = {
            let inner = self.inner.borrow();
            if inner.chunked_response && !force {
                Bytes::from(encode_chunk(&chunk))
            } else {
                chunk
            }
        };

        let stream = {
            let mut inner = self.inner.borrow_mut();
            inner.write_cb = callback;
            if !force {
                inner.state = ConnectionState::WritingResponse;
            }
            inner.stream.clone()
        };

        let weak = Rc::downgrade(&self.inner);
        stream.write(
            data,
            Some(Box::new(move || match weak.upgrade() {
                Some(inner) => HttpConnection { inner }.on_write_complete(),
                None => Ok(()),
            })),
        )
    }

    /// Marks the response complete. If a write is still in flight the
    /// completion is deferred to write-complete; the keep-alive decision
    /// then either re-arms the head read or closes the connection.
    pub fn finish(&self, callback: Option<FinishCallback>) -> Result<()> {
        {
            let mut inner = self.inner.borrow_mut();

            if inner.head.is_none() {
                error!("cannot finish an already finished request");
                return Ok(());
            }

            if callback.is_some() {
                inner.finish_cb = callback;
            }
        }

        if self.inner.borrow().stream.writing() {
            self.inner.borrow_mut().finish_pending = true;
            Ok(())
        } else {
            self.do_finish()
        }
    }

    /// Closes the connection with the client unconditionally.
    pub fn close(&self) {
        if let Err(err) = self.try_close(true) {
            warn!("error closing connection: {}", err);
        }
    }

    pub fn set_close_callback<F>(&self, callback: F)
    where
        F: FnOnce() -> Result<()> + 'static,
    {
        self.inner.borrow_mut().close_cb = Some(Box::new(callback));
    }

    pub fn set_finish_callback<F>(&self, callback: F)
    where
        F: FnOnce() -> Result<()> + 'static,
    {
        self.inner.borrow_mut().finish_cb = Some(Box::new(callback));
    }

    /// Switches response emission to chunked transfer-coding framing.
    pub fn set_chunked_response(&self, chunked: bool) {
        self.inner.borrow_mut().chunked_response = chunked;
    }

    /// Whether the client speaks HTTP/1.1. False before a request head
    /// has been parsed.
    pub fn supports_http_1_1(&self) -> bool {
        self.inner
            .borrow()
            .head
            .as_ref()
            .map(|head| head.is_http_1_1())
            .unwrap_or(false)
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.borrow().state
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.borrow().peer
    }

    pub fn request_head(&self) -> Option<Rc<RequestHead>> {
        self.inner.borrow().head.clone()
    }

    /// The client certificate for TLS traffic, if one was presented.
    #[cfg(feature = "tls")]
    pub fn peer_certificate(&self) -> Option<openssl::x509::X509> {
        self.inner.borrow().stream.peer_certificate()
    }

    //---- Request progression.

    /// (Re-)arms the head read, waiting for the next request.
    fn arm_head(&self) -> Result<()> {
        {
            let inner = self.inner.borrow();
            if inner.stream.closed() || inner.stream.reading() {
                return Ok(());
            }
        }

        self.inner.borrow_mut().state = ConnectionState::AwaitingHead;

        let stream = self.inner.borrow().stream.clone();
        let weak = Rc::downgrade(&self.inner);
        stream.read_until(b"\r\n\r\n", move |data| match weak.upgrade() {
            Some(inner) => HttpConnection { inner }.on_request_headers(data),
            None => Ok(()),
        })
    }

    fn read_line<F>(&self, handler: F) -> Result<()>
    where
        F: FnOnce(&HttpConnection, Bytes) -> Result<()> + 'static,
    {
        let stream = self.inner.borrow().stream.clone();
        let weak = Rc::downgrade(&self.inner);
        stream.read_until(b"\r\n", move |data| match weak.upgrade() {
            Some(inner) => handler(&HttpConnection { inner }, data),
            None => Ok(()),
        })
    }

    fn on_request_headers(&self, data: Bytes) -> Result<()> {
        if self.inner.borrow().head.is_some() {
            // A second head cannot start while a request is in flight.
            error!("new request head while a request is still being processed");
            self.write_literal(INTERNAL_ERROR)?;
            self.try_close(true)?;
            return Ok(());
        }

        // Tolerate blank lines before the request head.
        if data.iter().all(|&b| b == b'\r' || b == b'\n') {
            return self.arm_head();
        }

        let head = match RequestHead::parse(&data) {
            Ok(head) => head,
            Err(_) => {
                warn!("malformed request from {}", self.inner.borrow().peer);
                self.write_literal(BAD_REQUEST)?;
                self.try_close(true)?;
                return Ok(());
            }
        };

        if !head.is_http_1_1() {
            self.write_literal(BAD_REQUEST)?;
            self.try_close(true)?;
            return Ok(());
        }

        let framing = match head::body_framing(&head.headers) {
            Ok(framing) => framing,
            Err(_) => {
                warn!("unparsable body framing from {}", self.inner.borrow().peer);
                self.write_literal(BAD_REQUEST)?;
                self.try_close(true)?;
                return Ok(());
            }
        };

        let mut head = head;
        if framing == Framing::Chunked {
            // The chunked coding governs; a Content-Length is dropped.
            head.headers.remove(CONTENT_LENGTH);
        }

        let max_buffer_size = self.inner.borrow().config.max_buffer_size;
        let expects_continue = head::expects_continue(&head.headers);
        self.inner.borrow_mut().head = Some(Rc::new(head));

        match framing {
            Framing::Chunked => {
                self.inner.borrow_mut().state = ConnectionState::AwaitingChunkLine;
                self.read_line(Self::on_request_chunk_line)
            }

            Framing::Length(n) => {
                let n = usize::try_from(n).unwrap_or(usize::MAX);

                if n > max_buffer_size {
                    warn!(
                        "{} byte body from {}: {}",
                        n,
                        self.inner.borrow().peer,
                        Error::PayloadTooLarge
                    );
                    self.write_literal(ENTITY_TOO_LARGE)?;
                    self.inner.borrow_mut().state = ConnectionState::AwaitingBody { remaining: n };

                    let stream = self.inner.borrow().stream.clone();
                    let weak = Rc::downgrade(&self.inner);
                    stream.read_bytes_streaming(
                        n,
                        move |data| match weak.upgrade() {
                            Some(inner) => HttpConnection { inner }.on_skip_request(data),
                            None => Ok(()),
                        },
                        |_| Ok(()),
                    )
                } else {
                    if expects_continue {
                        self.write_literal(CONTINUE)?;
                    }

                    self.inner.borrow_mut().state = ConnectionState::AwaitingBody { remaining: n };

                    let stream = self.inner.borrow().stream.clone();
                    let weak = Rc::downgrade(&self.inner);
                    stream.read_bytes(n, move |data| match weak.upgrade() {
                        Some(inner) => HttpConnection { inner }.on_request_body(data),
                        None => Ok(()),
                    })
                }
            }

            Framing::None => {
                self.dispatch_first(Body::None)?;
                self.arm_head()
            }
        }
    }

    /// The oversize body has been read and discarded; the connection
    /// stays open for the next request.
    fn on_skip_request(&self, _data: Bytes) -> Result<()> {
        // The rejected request was never dispatched, so nothing is in
        // flight any more.
        self.inner.borrow_mut().head = None;
        self.arm_head()
    }

    fn on_request_body(&self, data: Bytes) -> Result<()> {
        self.dispatch_first(Body::Full(data))?;
        self.arm_head()
    }

    fn on_request_chunk_line(&self, data: Bytes) -> Result<()> {
        let (size, extension) = match parse_chunk_size(&data) {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!("malformed chunk-size line from {}", self.inner.borrow().peer);
                self.write_literal(BAD_REQUEST)?;
                self.try_close(true)?;
                return Ok(());
            }
        };

        self.inner.borrow_mut().cur_chunk = Some((size, extension));

        if size == 0 {
            let has_trailer = {
                let inner = self.inner.borrow();
                inner
                    .head
                    .as_ref()
                    .map(|head| head::has_trailer(&head.headers))
                    .unwrap_or(false)
            };

            self.inner.borrow_mut().state = ConnectionState::AwaitingTrailers;

            if has_trailer {
                let stream = self.inner.borrow().stream.clone();
                let weak = Rc::downgrade(&self.inner);
                stream.read_until(b"\r\n\r\n", move |data| match weak.upgrade() {
                    Some(inner) => HttpConnection { inner }.on_request_trailers(data),
                    None => Ok(()),
                })
            } else {
                self.read_line(Self::on_request_chunks_done)
            }
        } else {
            self.inner.borrow_mut().state = ConnectionState::AwaitingChunkData { size };

            // Read the chunk plus its terminating CRLF.
            let stream = self.inner.borrow().stream.clone();
            let weak = Rc::downgrade(&self.inner);
            stream.read_bytes(size + 2, move |data| match weak.upgrade() {
                Some(inner) => HttpConnection { inner }.on_request_chunk_data(data),
                None => Ok(()),
            })
        }
    }

    fn on_request_chunk_data(&self, data: Bytes) -> Result<()> {
        let (size, extension) = self.inner.borrow_mut().cur_chunk.take().unwrap_or((0, None));

        let payload = data.slice(..data.len().saturating_sub(2));
        let frame = ChunkFrame {
            size,
            extension,
            data: Some(payload),
        };

        if self.inner.borrow().dispatched {
            self.dispatch_chunk(frame, None)?;
        } else {
            self.dispatch_first(Body::Chunk(frame, None))?;
        }

        self.inner.borrow_mut().state = ConnectionState::AwaitingChunkLine;
        self.read_line(Self::on_request_chunk_line)
    }

    fn on_request_trailers(&self, data: Bytes) -> Result<()> {
        let trailers = match parse_trailers(&data) {
            Ok(trailers) => trailers,
            Err(_) => {
                warn!("malformed trailers from {}", self.inner.borrow().peer);
                self.write_literal(BAD_REQUEST)?;
                self.try_close(true)?;
                return Ok(());
            }
        };

        let (_, extension) = self.inner.borrow_mut().cur_chunk.take().unwrap_or((0, None));
        let frame = ChunkFrame {
            size: 0,
            extension,
            data: None,
        };

        if self.inner.borrow().dispatched {
            self.dispatch_chunk(frame, Some(trailers))?;
        } else {
            self.dispatch_first(Body::Chunk(frame, Some(trailers)))?;
        }

        self.arm_head()
    }

    /// The terminal chunk arrived without trailers.
    fn on_request_chunks_done(&self, _data: Bytes) -> Result<()> {
        let (_, extension) = self.inner.borrow_mut().cur_chunk.take().unwrap_or((0, None));
        let frame = ChunkFrame {
            size: 0,
            extension,
            data: None,
        };

        if self.inner.borrow().dispatched {
            self.dispatch_chunk(frame, None)?;
        } else {
            self.dispatch_first(Body::Chunk(frame, None))?;
        }

        self.arm_head()
    }

    //---- Dispatch.

    /// Resolves the owning application and hands over the first frame of
    /// the request. An unresolvable target answers 404 and disconnects.
    fn dispatch_first(&self, body: Body) -> Result<()> {
        let (dispatcher, head) = {
            let inner = self.inner.borrow();
            let head = inner.head.clone().expect("dispatch without a request head");
            (inner.dispatcher.clone(), head)
        };

        match dispatcher.resolve(&head.target, &head.headers) {
            None => {
                error!("unable to resolve request for {}", head.target);
                self.write_literal(NOT_FOUND)?;
                self.try_close(true)?;
                Ok(())
            }
            Some(app) => {
                {
                    let mut inner = self.inner.borrow_mut();
                    inner.app = Some(app);
                    inner.dispatched = true;
                    inner.state = ConnectionState::Dispatching;
                }

                dispatcher.do_request(app, self, &head, body);
                Ok(())
            }
        }
    }

    fn dispatch_chunk(&self, chunk: ChunkFrame, trailers: Option<http::HeaderMap>) -> Result<()> {
        let (dispatcher, head, app) = {
            let inner = self.inner.borrow();
            let head = inner.head.clone().expect("chunk dispatch without a request head");
            let app = inner.app.expect("chunk dispatch without a resolved app");
            (inner.dispatcher.clone(), head, app)
        };

        dispatcher.do_request_chunk(app, self, &head, chunk, trailers);
        Ok(())
    }

    //---- Response completion and teardown.

    fn on_write_complete(&self) -> Result<()> {
        let callback = self.inner.borrow_mut().write_cb.take();
        if let Some(callback) = callback {
            if let Err(err) = callback() {
                error!("error in write callback: {}", err);
            }
        }

        let should_finish = {
            let inner = self.inner.borrow();
            inner.finish_pending && inner.head.is_some() && !inner.stream.writing()
        };

        if should_finish {
            self.inner.borrow_mut().finish_pending = false;
            self.do_finish()?;
        }

        Ok(())
    }

    /// The response is fully sent: decide keep-alive vs close, fire the
    /// finish callback, and reset per-request state.
    fn do_finish(&self) -> Result<()> {
        let disconnect = self.try_close(false)?;

        let callback = self.inner.borrow_mut().finish_cb.take();
        if let Some(callback) = callback {
            if let Err(err) = callback() {
                error!("error in finish callback: {}", err);
            }
        }

        {
            let mut inner = self.inner.borrow_mut();
            inner.head = None;
            inner.app = None;
            inner.dispatched = false;
            inner.chunked_response = false;
            inner.cur_chunk = None;
        }

        if !disconnect {
            self.arm_head()?;
        }

        Ok(())
    }

    /// Close the connection, or decide whether to. With `disconnect`
    /// unset the HTTP rules apply: an explicit `Connection: close` wins;
    /// otherwise requests that frame their own end (Content-Length, HEAD,
    /// GET) disconnect unless keep-alive was asked for.
    fn try_close(&self, mut disconnect: bool) -> Result<bool> {
        if !disconnect {
            let inner = self.inner.borrow();

            if let Some(head) = &inner.head {
                if inner.config.no_keep_alive {
                    disconnect = true;
                } else if head.version == Version::HTTP_11 {
                    disconnect = head::connection_has_token(&head.headers, "close");
                } else if head.headers.contains_key(CONTENT_LENGTH)
                    || head.method == Method::HEAD
                    || head.method == Method::GET
                {
                    disconnect = !head::connection_has_token(&head.headers, "keep-alive");
                }
            }
        }

        if disconnect {
            let (stream, timeout) = {
                let mut inner = self.inner.borrow_mut();
                inner.state = ConnectionState::Closing;
                (inner.stream.clone(), inner.timeout.take())
            };

            if let Some(handle) = timeout {
                self.inner.borrow().reactor.remove_timeout(&handle);
            }

            stream.close();

            let callback = self.inner.borrow_mut().finish_cb.take();
            if let Some(callback) = callback {
                if let Err(err) = callback() {
                    error!("error in finish callback: {}", err);
                }
            }

            self.remove_from_server();
        }

        Ok(disconnect)
    }

    fn write_literal(&self, data: &'static [u8]) -> Result<()> {
        self.write(Bytes::from_static(data), None, true)
    }

    fn remove_from_server(&self) {
        let (id, server) = {
            let mut inner = self.inner.borrow_mut();
            if !inner.registered {
                return;
            }
            inner.registered = false;
            (inner.id, inner.server.clone())
        };

        if let Some(table) = server.upgrade() {
            let _ = table.borrow_mut().try_remove(id);
        }
    }

    //---- Callbacks from the stream and reactor.

    fn on_connection_close(&self) -> Result<()> {
        let callback = self.inner.borrow_mut().close_cb.take();
        if let Some(callback) = callback {
            if let Err(err) = callback() {
                error!("error in close callback: {}", err);
            }
        }

        self.try_close(true)?;
        Ok(())
    }

    fn on_timeout(&self) -> Result<()> {
        trace!("idle connection {} timed out", self.inner.borrow().peer);
        self.inner.borrow_mut().timeout = None;
        self.try_close(true)?;
        Ok(())
    }
}
