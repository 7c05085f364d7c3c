use std::cell::RefCell;
use std::cmp;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;

use bytes::Bytes;
use log::{error, trace, warn};
use regex::bytes::Regex;

use crate::buffer::ChunkDeque;
use crate::error::{Error, Result};
use crate::net::TcpStream;
use crate::reactor::Reactor;
use crate::ready::Ready;

#[cfg(feature = "tls")]
use openssl::ssl::{ErrorCode, Ssl, SslAcceptor, SslStream};
#[cfg(feature = "tls")]
use openssl::x509::X509;

pub type ReadCallback = Box<dyn FnOnce(Bytes) -> Result<()>>;
pub type StreamingCallback = Box<dyn FnMut(Bytes) -> Result<()>>;
pub type WriteCallback = Box<dyn FnOnce() -> Result<()>>;
pub type CloseCallback = Box<dyn FnOnce() -> Result<()>>;

/// Large single sends upset some platforms, so multi-chunk prefixes are
/// coalesced to at most this much per send attempt.
const MAX_SEND_COALESCE: usize = 128 * 1024;

/// The read operation currently armed on a stream. At most one may be
/// active; registering a second is a programming error.
enum ReadOp {
    Idle,
    Until(Vec<u8>),
    UntilRegex(Regex),
    Exact { remaining: usize },
    UntilClose,
}

enum Transport {
    Plain(TcpStream),
    #[cfg(feature = "tls")]
    Tls {
        stream: SslStream<TcpStream>,
        accepting: bool,
    },
    Closed,
}

impl Transport {
    fn is_closed(&self) -> bool {
        matches!(self, Transport::Closed)
    }
}

enum SocketRead {
    Data(Bytes),
    WouldBlock,
    Eof,
}

/// A buffered, non-blocking byte transport wrapping one connected socket,
/// optionally with server-side TLS.
///
/// All reads are callback-driven: `read_until`, `read_until_regex`,
/// `read_bytes` and `read_until_close` complete from the read buffer and
/// otherwise register READ interest with the reactor. `write` appends to
/// the write buffer and flushes opportunistically, leaving the remainder
/// to WRITE readiness.
#[derive(Clone)]
pub struct ByteStream {
    inner: Rc<RefCell<StreamInner>>,
}

struct StreamInner {
    transport: Transport,
    fd: RawFd,
    peer: SocketAddr,
    reactor: Rc<Reactor>,
    max_buffer_size: usize,
    read_chunk_size: usize,
    read_buf: ChunkDeque,
    write_buf: ChunkDeque,
    /// After a short send the head chunk must be retried byte-identical
    /// (OpenSSL requires the same buffer on the next call), so prefix
    /// merging is suppressed until a send succeeds.
    write_frozen: bool,
    read_op: ReadOp,
    read_cb: Option<ReadCallback>,
    streaming_cb: Option<StreamingCallback>,
    write_cb: Option<WriteCallback>,
    close_cb: Option<CloseCallback>,
    /// Interest currently registered with the reactor, `None` before the
    /// first registration and after teardown.
    state: Option<Ready>,
    pending_callbacks: usize,
    hs_reading: bool,
    hs_writing: bool,
}

impl ByteStream {
    pub fn plain(
        socket: TcpStream,
        peer: SocketAddr,
        reactor: Rc<Reactor>,
        max_buffer_size: usize,
        read_chunk_size: usize,
    ) -> ByteStream {
        let fd = socket.as_raw_fd();
        ByteStream::with_transport(Transport::Plain(socket), fd, peer, reactor, max_buffer_size, read_chunk_size)
    }

    /// Wraps an accepted socket for server-side TLS; the handshake is
    /// driven lazily by readiness events.
    #[cfg(feature = "tls")]
    pub fn tls(
        socket: TcpStream,
        acceptor: &SslAcceptor,
        peer: SocketAddr,
        reactor: Rc<Reactor>,
        max_buffer_size: usize,
        read_chunk_size: usize,
    ) -> Result<ByteStream> {
        let fd = socket.as_raw_fd();
        let ssl = Ssl::new(acceptor.context()).map_err(|e| Error::TlsHandshake(e.to_string()))?;
        let stream = SslStream::new(ssl, socket).map_err(|e| Error::TlsHandshake(e.to_string()))?;

        Ok(ByteStream::with_transport(
            Transport::Tls { stream, accepting: true },
            fd,
            peer,
            reactor,
            max_buffer_size,
            read_chunk_size,
        ))
    }

    fn with_transport(
        transport: Transport,
        fd: RawFd,
        peer: SocketAddr,
        reactor: Rc<Reactor>,
        max_buffer_size: usize,
        read_chunk_size: usize,
    ) -> ByteStream {
        ByteStream {
            inner: Rc::new(RefCell::new(StreamInner {
                transport,
                fd,
                peer,
                reactor,
                max_buffer_size,
                read_chunk_size,
                read_buf: ChunkDeque::new(),
                write_buf: ChunkDeque::new(),
                write_frozen: false,
                read_op: ReadOp::Idle,
                read_cb: None,
                streaming_cb: None,
                write_cb: None,
                close_cb: None,
                state: None,
                pending_callbacks: 0,
                hs_reading: false,
                hs_writing: false,
            })),
        }
    }

    //---- API methods.

    /// Calls `callback` with everything up to and including the first
    /// occurrence of `delimiter`.
    pub fn read_until<F>(&self, delimiter: &[u8], callback: F) -> Result<()>
    where
        F: FnOnce(Bytes) -> Result<()> + 'static,
    {
        self.start_read(ReadOp::Until(delimiter.to_vec()), Box::new(callback), None)
    }

    /// Calls `callback` with everything up to the end of the first match
    /// of `pattern` against a prefix of the stream.
    pub fn read_until_regex<F>(&self, pattern: &Regex, callback: F) -> Result<()>
    where
        F: FnOnce(Bytes) -> Result<()> + 'static,
    {
        self.start_read(ReadOp::UntilRegex(pattern.clone()), Box::new(callback), None)
    }

    /// Calls `callback` with exactly `num_bytes` bytes.
    pub fn read_bytes<F>(&self, num_bytes: usize, callback: F) -> Result<()>
    where
        F: FnOnce(Bytes) -> Result<()> + 'static,
    {
        self.start_read(ReadOp::Exact { remaining: num_bytes }, Box::new(callback), None)
    }

    /// Like [`read_bytes`], but hands every intermediate chunk to
    /// `streaming` as it arrives; the final `callback` then receives
    /// whatever remains, which may be empty.
    ///
    /// [`read_bytes`]: ByteStream::read_bytes
    pub fn read_bytes_streaming<F, S>(&self, num_bytes: usize, callback: F, streaming: S) -> Result<()>
    where
        F: FnOnce(Bytes) -> Result<()> + 'static,
        S: FnMut(Bytes) -> Result<()> + 'static,
    {
        self.start_read(
            ReadOp::Exact { remaining: num_bytes },
            Box::new(callback),
            Some(Box::new(streaming)),
        )
    }

    /// Reads until the peer closes the socket; `callback` then receives
    /// the remaining buffered bytes. Without a streaming variant this is
    /// subject to `max_buffer_size`.
    pub fn read_until_close<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce(Bytes) -> Result<()> + 'static,
    {
        self.start_until_close(Box::new(callback), None)
    }

    pub fn read_until_close_streaming<F, S>(&self, callback: F, streaming: S) -> Result<()>
    where
        F: FnOnce(Bytes) -> Result<()> + 'static,
        S: FnMut(Bytes) -> Result<()> + 'static,
    {
        self.start_until_close(Box::new(callback), Some(Box::new(streaming)))
    }

    /// Appends `data` to the write buffer and attempts an immediate
    /// non-blocking send; the remainder is flushed on WRITE readiness.
    /// `callback` fires once the write buffer drains. A callback given
    /// while older buffered data is still in flight replaces the old one.
    pub fn write(&self, data: Bytes, callback: Option<WriteCallback>) -> Result<()> {
        self.check_closed()?;

        {
            let mut inner = self.inner.borrow_mut();
            inner.write_buf.push(data);
            inner.write_cb = callback;
        }

        self.handle_write()?;

        if self.writing() {
            self.add_io_state(Ready::writable())?;
        }

        self.maybe_add_error_listener();
        Ok(())
    }

    /// Calls `callback` when the socket is known closed, after pending
    /// completions have had their chance to run.
    pub fn set_close_callback<F>(&self, callback: F)
    where
        F: FnOnce() -> Result<()> + 'static,
    {
        self.inner.borrow_mut().close_cb = Some(Box::new(callback));
    }

    /// Closes the stream: a pending read-until-close receives the
    /// remaining buffered bytes, other pending reads are abandoned, the
    /// descriptor is unregistered and the socket dropped, and finally the
    /// close callback fires.
    pub fn close(&self) {
        let mut finished: Option<(ReadCallback, Bytes)> = None;

        {
            let mut inner = self.inner.borrow_mut();

            if !inner.transport.is_closed() {
                trace!("closing the stream for {}", inner.peer);

                if matches!(inner.read_op, ReadOp::UntilClose) {
                    if let Some(callback) = inner.read_cb.take() {
                        let data = inner.read_buf.consume_all();
                        finished = Some((callback, data));
                    }
                }

                inner.read_op = ReadOp::Idle;
                inner.read_cb = None;
                inner.streaming_cb = None;
                inner.write_cb = None;

                if inner.state.take().is_some() {
                    inner.reactor.remove_handler(inner.fd);
                }

                inner.transport = Transport::Closed;
            }
        }

        if let Some((callback, data)) = finished {
            if let Err(err) = callback(data) {
                error!("error in read callback: {}", err);
            }
        }

        self.try_close_callback();
    }

    /// Returns true if a read is currently pending on the stream.
    pub fn reading(&self) -> bool {
        let inner = self.inner.borrow();
        inner.hs_reading || inner.read_cb.is_some()
    }

    /// Returns true if unsent data is buffered on the stream.
    pub fn writing(&self) -> bool {
        let inner = self.inner.borrow();
        inner.hs_writing || !inner.write_buf.is_empty()
    }

    pub fn closed(&self) -> bool {
        self.inner.borrow().transport.is_closed()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.borrow().peer
    }

    /// The peer's certificate, once the TLS handshake has completed.
    #[cfg(feature = "tls")]
    pub fn peer_certificate(&self) -> Option<X509> {
        match &self.inner.borrow().transport {
            Transport::Tls { stream, .. } => stream.ssl().peer_certificate(),
            _ => None,
        }
    }

    //---- Internal protocol.

    fn start_read(&self, op: ReadOp, callback: ReadCallback, streaming: Option<StreamingCallback>) -> Result<()> {
        {
            let mut inner = self.inner.borrow_mut();

            if inner.read_cb.is_some() {
                return Err(Error::ReadInProgress);
            }

            inner.read_op = op;
            inner.read_cb = Some(callback);
            inner.streaming_cb = streaming;
        }

        // See if we've already got the data from a previous read.
        if self.try_satisfy()? {
            return Ok(());
        }

        self.check_closed()?;

        loop {
            if self.read_to_buffer() == 0 {
                break;
            }

            if self.try_satisfy()? {
                return Ok(());
            }

            self.check_overflow()?;

            if self.closed() {
                break;
            }
        }

        // And see if we've already got the data from this read.
        if self.try_satisfy()? {
            return Ok(());
        }

        self.check_closed()?;
        self.add_io_state(Ready::readable())
    }

    fn start_until_close(&self, callback: ReadCallback, streaming: Option<StreamingCallback>) -> Result<()> {
        {
            let inner = self.inner.borrow();

            if inner.read_cb.is_some() {
                return Err(Error::ReadInProgress);
            }
        }

        // Already closed: complete immediately with whatever is buffered.
        if self.closed() {
            let data = self.inner.borrow_mut().read_buf.consume_all();
            if let Err(err) = callback(data) {
                error!("error in read callback: {}", err);
            }
            return Ok(());
        }

        {
            let mut inner = self.inner.borrow_mut();
            inner.read_op = ReadOp::UntilClose;
            inner.read_cb = Some(callback);
            inner.streaming_cb = streaming;
        }

        self.add_io_state(Ready::readable())
    }

    /// Attempts to complete the pending read from buffered data. Streams
    /// intermediate chunks first, then fires the final callback when the
    /// operation's condition is met. Returns whether it completed.
    fn try_satisfy(&self) -> Result<bool> {
        self.drain_streaming();

        enum Probe {
            Exact(usize),
            Until(Vec<u8>),
            Regex(Regex),
            Never,
        }

        let probe = match &self.inner.borrow().read_op {
            ReadOp::Exact { remaining } => Probe::Exact(*remaining),
            ReadOp::Until(delimiter) => Probe::Until(delimiter.clone()),
            ReadOp::UntilRegex(pattern) => Probe::Regex(pattern.clone()),
            ReadOp::UntilClose | ReadOp::Idle => Probe::Never,
        };

        let complete: Option<usize> = {
            let mut inner = self.inner.borrow_mut();

            match probe {
                Probe::Exact(remaining) => (inner.read_buf.len() >= remaining).then_some(remaining),

                // A multi-byte delimiter may straddle two chunks, so the
                // prefix is merged gradually; large merges are expensive
                // and line-oriented protocols tend to find the delimiter
                // in the first few chunks anyway.
                Probe::Until(delimiter) => loop {
                    let found = inner
                        .read_buf
                        .first()
                        .and_then(|first| find_subsequence(first, &delimiter));

                    if let Some(loc) = found {
                        break Some(loc + delimiter.len());
                    }

                    if inner.read_buf.chunk_count() <= 1 {
                        break None;
                    }

                    inner.read_buf.double_prefix();
                },

                Probe::Regex(pattern) => loop {
                    let found = inner.read_buf.first().and_then(|first| pattern.find(first));

                    if let Some(m) = found {
                        break Some(m.end());
                    }

                    if inner.read_buf.chunk_count() <= 1 {
                        break None;
                    }

                    inner.read_buf.double_prefix();
                },

                Probe::Never => None,
            }
        };

        match complete {
            Some(n) => {
                self.do_callback(n);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Feed buffered bytes to the streaming callback, if one is armed.
    fn drain_streaming(&self) {
        let fed = {
            let mut inner = self.inner.borrow_mut();

            if inner.streaming_cb.is_none() || inner.read_buf.is_empty() {
                None
            } else {
                let take = match inner.read_op {
                    ReadOp::Exact { remaining } => cmp::min(remaining, inner.read_buf.len()),
                    ReadOp::UntilClose => inner.read_buf.len(),
                    _ => 0,
                };

                if take == 0 {
                    None
                } else {
                    let data = inner.read_buf.consume(take);
                    if let ReadOp::Exact { ref mut remaining } = inner.read_op {
                        *remaining -= take;
                    }
                    inner.streaming_cb.take().map(|cb| (cb, data))
                }
            }
        };

        if let Some((mut callback, data)) = fed {
            if let Err(err) = callback(data) {
                error!("error in streaming callback: {}", err);
            }

            // Re-arm unless the operation was torn down by the callback.
            let mut inner = self.inner.borrow_mut();
            if inner.read_cb.is_some() && inner.streaming_cb.is_none() {
                inner.streaming_cb = Some(callback);
            }
        }
    }

    /// Completes the pending read: consumes `n` bytes and fires the read
    /// callback with them.
    fn do_callback(&self, n: usize) {
        let (callback, data) = {
            let mut inner = self.inner.borrow_mut();

            inner.read_op = ReadOp::Idle;
            inner.streaming_cb = None;

            let callback = inner.read_cb.take();
            let data = inner.read_buf.consume(n);
            (callback, data)
        };

        if let Some(callback) = callback {
            if let Err(err) = callback(data) {
                error!("error in read callback: {}", err);
            }
        }
    }

    /// The reactor-facing event handler for this stream's descriptor.
    fn handle_events(&self, ready: Ready) -> Result<()> {
        if self.closed() {
            warn!("got events for closed stream {}", self.inner.borrow().peer);
            return Ok(());
        }

        if ready.is_readable() {
            self.handle_read()?;
        }

        if self.closed() {
            return Ok(());
        }

        if ready.is_writable() {
            self.handle_write()?;
        }

        if self.closed() {
            return Ok(());
        }

        if ready.is_error() || ready.is_hup() {
            // A completion may have been queued by the read or write
            // above; close from a deferred callback so it runs first.
            let this = self.clone();
            let reactor = self.inner.borrow().reactor.clone();
            reactor.add_callback(move || {
                this.close();
                Ok(())
            });
            return Ok(());
        }

        let mut state = Ready::error();
        if self.reading() {
            state |= Ready::readable();
        }
        if self.writing() {
            state |= Ready::writable();
        }
        if state == Ready::error() {
            // Keep at least a read listener armed so a peer close is
            // noticed while the stream is idle.
            state |= Ready::readable();
        }

        let mut inner = self.inner.borrow_mut();
        if inner.state != Some(state) {
            inner.state = Some(state);
            let fd = inner.fd;
            inner.reactor.update_handler(fd, state)?;
        }

        Ok(())
    }

    fn handle_read(&self) -> Result<()> {
        #[cfg(feature = "tls")]
        if self.is_accepting() {
            return self.do_handshake();
        }

        self.inner.borrow_mut().pending_callbacks += 1;
        let result = self.read_loop();
        self.inner.borrow_mut().pending_callbacks -= 1;

        match result {
            Ok(true) => Ok(()),
            Ok(false) => {
                self.try_close_callback();
                Ok(())
            }
            Err(err) => {
                warn!("error on read: {}", err);
                self.close();
                Ok(())
            }
        }
    }

    fn read_loop(&self) -> Result<bool> {
        loop {
            // Read until we get EWOULDBLOCK or equivalent: TLS buffers
            // internally, and data sitting there is invisible to epoll.
            if self.read_to_buffer() == 0 {
                break;
            }

            if self.try_satisfy()? {
                return Ok(true);
            }

            self.check_overflow()?;

            if self.closed() {
                break;
            }
        }

        self.try_satisfy()
    }

    /// Reads one chunk from the socket into the read buffer, returning
    /// the number of bytes appended. Zero means nothing to read; EOF and
    /// socket errors close the stream.
    fn read_to_buffer(&self) -> usize {
        let outcome = {
            let mut inner = self.inner.borrow_mut();
            let size = inner.read_chunk_size;
            inner.read_from_socket(size)
        };

        match outcome {
            Ok(SocketRead::Data(chunk)) => {
                let n = chunk.len();
                self.inner.borrow_mut().read_buf.push(chunk);
                n
            }
            Ok(SocketRead::WouldBlock) => 0,
            Ok(SocketRead::Eof) => {
                trace!("peer closed {}", self.inner.borrow().peer);
                self.close();
                0
            }
            Err(err) => {
                warn!("read error on fd {}: {}", self.inner.borrow().fd, err);
                self.close();
                0
            }
        }
    }

    fn check_overflow(&self) -> Result<()> {
        let over = {
            let inner = self.inner.borrow();
            inner.read_buf.len() >= inner.max_buffer_size
        };

        if over {
            error!("reached maximum read buffer size");
            self.close();
            return Err(Error::ParserOverflow);
        }

        Ok(())
    }

    fn handle_write(&self) -> Result<()> {
        #[cfg(feature = "tls")]
        if self.is_accepting() {
            return self.do_handshake();
        }

        enum Outcome {
            Sent,
            Blocked,
            Drained,
            Failed(io::Error),
        }

        loop {
            let outcome = {
                let mut inner = self.inner.borrow_mut();

                if inner.write_buf.is_empty() {
                    Outcome::Drained
                } else {
                    if !inner.write_frozen {
                        inner.write_buf.merge_prefix(MAX_SEND_COALESCE);
                    }

                    let head = inner.write_buf.first().expect("non-empty write buffer").clone();
                    match inner.write_to_socket(&head) {
                        Ok(0) => {
                            // An incomplete TLS send must be retried with
                            // the identical chunk, so suppress merging.
                            inner.write_frozen = true;
                            Outcome::Blocked
                        }
                        Ok(n) => {
                            inner.write_frozen = false;
                            inner.write_buf.consume(n);
                            Outcome::Sent
                        }
                        Err(err)
                            if err.kind() == io::ErrorKind::WouldBlock
                                || err.kind() == io::ErrorKind::Interrupted =>
                        {
                            inner.write_frozen = true;
                            Outcome::Blocked
                        }
                        Err(err) => Outcome::Failed(err),
                    }
                }
            };

            match outcome {
                Outcome::Sent => continue,
                Outcome::Blocked | Outcome::Drained => break,
                Outcome::Failed(err) => {
                    warn!("write error on fd {}: {}", self.inner.borrow().fd, err);
                    self.close();
                    return Ok(());
                }
            }
        }

        let callback = {
            let mut inner = self.inner.borrow_mut();
            if inner.write_buf.is_empty() {
                inner.write_cb.take()
            } else {
                None
            }
        };

        if let Some(callback) = callback {
            if let Err(err) = callback() {
                error!("error in write callback: {}", err);
            }
        }

        Ok(())
    }

    fn check_closed(&self) -> Result<()> {
        if self.closed() {
            return Err(Error::StreamClosed);
        }
        Ok(())
    }

    /// If a close callback is subscribed and the stream is closed, fire
    /// it, unless completions are still pending.
    fn try_close_callback(&self) {
        let callback = {
            let mut inner = self.inner.borrow_mut();

            if inner.transport.is_closed() && inner.pending_callbacks == 0 {
                inner.close_cb.take()
            } else {
                None
            }
        };

        if let Some(callback) = callback {
            if let Err(err) = callback() {
                error!("error in close callback: {}", err);
            }
        }
    }

    fn maybe_add_error_listener(&self) {
        let needs_listener = {
            let inner = self.inner.borrow();
            inner.state.is_none() && inner.pending_callbacks == 0
        };

        if needs_listener {
            if self.closed() {
                self.try_close_callback();
            } else {
                let _ = self.add_io_state(Ready::readable());
            }
        }
    }

    /// Merges `state` into the reactor registration for this stream's
    /// descriptor, registering the event handler on first use.
    fn add_io_state(&self, state: Ready) -> Result<()> {
        let mut inner = self.inner.borrow_mut();

        if inner.transport.is_closed() {
            return Ok(());
        }

        match inner.state {
            None => {
                let state = Ready::error() | state;
                inner.state = Some(state);

                let fd = inner.fd;
                let weak = Rc::downgrade(&self.inner);
                inner.reactor.add_handler(fd, state, move |_, ready| match weak.upgrade() {
                    Some(inner) => ByteStream { inner }.handle_events(ready),
                    None => Ok(()),
                })?;
            }
            Some(current) if !current.contains(state) => {
                let state = current | state;
                inner.state = Some(state);
                let fd = inner.fd;
                inner.reactor.update_handler(fd, state)?;
            }
            _ => {}
        }

        Ok(())
    }

    #[cfg(feature = "tls")]
    fn is_accepting(&self) -> bool {
        matches!(
            self.inner.borrow().transport,
            Transport::Tls { accepting: true, .. }
        )
    }

    #[cfg(feature = "tls")]
    fn do_handshake(&self) -> Result<()> {
        enum Handshake {
            Done,
            WantRead,
            WantWrite,
            CloseSilent,
            CloseError(String),
        }

        let outcome = {
            let mut inner = self.inner.borrow_mut();
            inner.hs_reading = false;
            inner.hs_writing = false;

            match &mut inner.transport {
                Transport::Tls { stream, accepting } => match stream.accept() {
                    Ok(()) => {
                        *accepting = false;
                        Handshake::Done
                    }
                    Err(err) => match err.code() {
                        ErrorCode::WANT_READ => Handshake::WantRead,
                        ErrorCode::WANT_WRITE => Handshake::WantWrite,
                        ErrorCode::ZERO_RETURN => Handshake::CloseSilent,
                        ErrorCode::SSL => Handshake::CloseError(err.to_string()),
                        _ => match err.into_io_error() {
                            Ok(ioe) if ioe.kind() == io::ErrorKind::ConnectionAborted => {
                                Handshake::CloseSilent
                            }
                            Ok(ioe) => Handshake::CloseError(ioe.to_string()),
                            Err(err) => Handshake::CloseError(err.to_string()),
                        },
                    },
                },
                _ => return Ok(()),
            }
        };

        match outcome {
            Handshake::Done => {
                trace!("TLS handshake complete for {}", self.inner.borrow().peer);
                Ok(())
            }
            Handshake::WantRead => {
                self.inner.borrow_mut().hs_reading = true;
                Ok(())
            }
            Handshake::WantWrite => {
                self.inner.borrow_mut().hs_writing = true;
                Ok(())
            }
            Handshake::CloseSilent => {
                self.close();
                Ok(())
            }
            Handshake::CloseError(msg) => {
                warn!("SSL error on fd {}: {}", self.inner.borrow().fd, msg);
                self.close();
                Ok(())
            }
        }
    }
}

impl StreamInner {
    /// Attempts to read one chunk from the socket. Yields no data while a
    /// TLS handshake is still in progress.
    fn read_from_socket(&mut self, size: usize) -> Result<SocketRead> {
        match &mut self.transport {
            Transport::Plain(socket) => {
                let mut buf = vec![0u8; size];
                match socket.read(&mut buf) {
                    Ok(0) => Ok(SocketRead::Eof),
                    Ok(n) => {
                        buf.truncate(n);
                        Ok(SocketRead::Data(Bytes::from(buf)))
                    }
                    Err(err)
                        if err.kind() == io::ErrorKind::WouldBlock
                            || err.kind() == io::ErrorKind::Interrupted =>
                    {
                        Ok(SocketRead::WouldBlock)
                    }
                    Err(err) => Err(err.into()),
                }
            }

            #[cfg(feature = "tls")]
            Transport::Tls { stream, accepting } => {
                if *accepting {
                    return Ok(SocketRead::WouldBlock);
                }

                let mut buf = vec![0u8; size];
                match stream.ssl_read(&mut buf) {
                    Ok(0) => Ok(SocketRead::Eof),
                    Ok(n) => {
                        buf.truncate(n);
                        Ok(SocketRead::Data(Bytes::from(buf)))
                    }
                    Err(err) => match err.code() {
                        ErrorCode::WANT_READ | ErrorCode::WANT_WRITE => Ok(SocketRead::WouldBlock),
                        ErrorCode::ZERO_RETURN => Ok(SocketRead::Eof),
                        _ => match err.into_io_error() {
                            Ok(ioe) => Err(ioe.into()),
                            Err(err) => Err(Error::Io(io::Error::other(err))),
                        },
                    },
                }
            }

            Transport::Closed => Ok(SocketRead::WouldBlock),
        }
    }

    fn write_to_socket(&mut self, data: &[u8]) -> io::Result<usize> {
        match &mut self.transport {
            Transport::Plain(socket) => socket.write(data),

            #[cfg(feature = "tls")]
            Transport::Tls { stream, accepting } => {
                if *accepting {
                    return Err(io::ErrorKind::WouldBlock.into());
                }

                match stream.ssl_write(data) {
                    Ok(n) => Ok(n),
                    Err(err) => match err.code() {
                        ErrorCode::WANT_WRITE | ErrorCode::WANT_READ => {
                            Err(io::ErrorKind::WouldBlock.into())
                        }
                        _ => match err.into_io_error() {
                            Ok(ioe) => Err(ioe),
                            Err(err) => Err(io::Error::other(err)),
                        },
                    },
                }
            }

            Transport::Closed => Err(io::ErrorKind::NotConnected.into()),
        }
    }
}

impl Drop for StreamInner {
    fn drop(&mut self) {
        if self.state.take().is_some() {
            self.reactor.remove_handler(self.fd);
        }
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }

    haystack.windows(needle.len()).position(|window| window == needle)
}
