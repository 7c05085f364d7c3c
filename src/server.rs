use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::rc::{Rc, Weak};

use log::{error, info, trace};
use slab::Slab;

use crate::config::{Scheme, ServerConfig};
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::http::conn::ConnTable;
use crate::http::HttpConnection;
use crate::net::{self, TcpListener, TcpStream};
use crate::queue::Remote;
use crate::reactor::Reactor;
use crate::ready::Ready;
use crate::stream::ByteStream;

#[cfg(feature = "tls")]
use crate::tls;
#[cfg(feature = "tls")]
use openssl::ssl::SslAcceptor;

/// A non-blocking, single-threaded HTTP/1.1 server.
///
/// Binds its listening sockets at construction, wires them into one
/// reactor, and tracks every live [`HttpConnection`]. Finishing a request
/// does not necessarily close its connection: HTTP/1.1 keep-alive applies
/// unless the request or configuration says otherwise.
///
/// ```no_run
/// use std::rc::Rc;
/// use ember_http::{Server, ServerConfig};
/// # use std::rc::Rc as R; use bytes::Bytes;
/// # use ember_http::{AppId, Body, Dispatcher, HttpConnection, RequestHead};
/// # struct Hello;
/// # impl Dispatcher for Hello {
/// #     fn resolve(&self, _: &http::Uri, _: &http::HeaderMap) -> Option<AppId> { Some(AppId(0)) }
/// #     fn do_request(&self, _: AppId, conn: &HttpConnection, _: &R<RequestHead>, _: Body) {
/// #         let _ = conn.write(Bytes::from_static(b"HTTP/1.1 204 No Content\r\n\r\n"), None, true);
/// #         let _ = conn.finish(None);
/// #     }
/// #     fn do_request_chunk(&self, _: AppId, _: &HttpConnection, _: &R<RequestHead>, _: ember_http::ChunkFrame, _: Option<http::HeaderMap>) {}
/// # }
///
/// let server = Server::bind(ServerConfig::default(), Rc::new(Hello)).unwrap();
/// server.start().unwrap();
/// ```
pub struct Server {
    reactor: Rc<Reactor>,
    config: Rc<ServerConfig>,
    connections: ConnTable,
    listeners: RefCell<Vec<Rc<TcpListener>>>,
    addrs: Vec<SocketAddr>,
}

/// Everything an accept handler needs to turn a fresh socket into a
/// tracked connection. Holds the reactor weakly: the reactor owns this
/// context through the registered handler, and a strong reference back
/// would keep both alive forever.
struct AcceptContext {
    reactor: Weak<Reactor>,
    config: Rc<ServerConfig>,
    dispatcher: Rc<dyn Dispatcher>,
    connections: ConnTable,
    #[cfg(feature = "tls")]
    acceptor: Option<Rc<SslAcceptor>>,
}

impl Server {
    /// Binds the configured addresses and prepares the accept handlers.
    /// Startup failures (resolution, bind, listen, TLS setup) surface
    /// here.
    pub fn bind(config: ServerConfig, dispatcher: Rc<dyn Dispatcher>) -> Result<Server> {
        let config = Rc::new(config);
        let reactor = Reactor::new(config.poll_timeout, config.poll_threshold)?;

        #[cfg(feature = "tls")]
        let acceptor: Option<Rc<SslAcceptor>> = match config.scheme {
            Scheme::Https => {
                let tls_config = config.tls.as_ref().ok_or_else(|| {
                    Error::Bind(io::Error::other("https scheme requires tls settings"))
                })?;
                Some(Rc::new(tls::build_acceptor(tls_config)?))
            }
            Scheme::Http => None,
        };

        #[cfg(not(feature = "tls"))]
        if config.scheme == Scheme::Https {
            return Err(Error::Bind(io::Error::other(
                "built without TLS support; enable the `tls` feature",
            )));
        }

        let sockets = net::bind_sockets(&config)?;
        let connections: ConnTable = Rc::new(RefCell::new(Slab::new()));

        let mut listeners = Vec::with_capacity(sockets.len());
        let mut addrs = Vec::with_capacity(sockets.len());

        for socket in sockets {
            let addr = socket.local_addr().map_err(Error::Bind)?;
            let listener = Rc::new(socket);

            let context = AcceptContext {
                reactor: Rc::downgrade(&reactor),
                config: config.clone(),
                dispatcher: dispatcher.clone(),
                connections: connections.clone(),
                #[cfg(feature = "tls")]
                acceptor: acceptor.clone(),
            };
            add_accept_handler(&reactor, listener.clone(), context)?;

            addrs.push(addr);
            listeners.push(listener);
        }

        Ok(Server {
            reactor,
            config,
            connections,
            listeners: RefCell::new(listeners),
            addrs,
        })
    }

    /// The addresses actually bound; useful with an ephemeral port.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }

    pub fn reactor(&self) -> &Rc<Reactor> {
        &self.reactor
    }

    /// A `Send` handle for enqueueing work or stopping from other
    /// threads.
    pub fn remote(&self) -> Remote {
        self.reactor.remote()
    }

    /// Runs the reactor until [`stop`] is observed, then releases it.
    ///
    /// [`stop`]: Server::stop
    pub fn start(&self) -> Result<()> {
        info!(
            "{:?} server listening on {:?}",
            self.config.scheme, self.addrs
        );

        if let Err(err) = self.reactor.start() {
            error!("reactor failed: {}", err);
            self.stop();
            return Err(err);
        }

        self.reactor.close()
    }

    /// Stops the reactor, closes every live connection, then the
    /// listening sockets.
    pub fn stop(&self) {
        info!("stopping server");

        self.reactor.stop();

        let connections: Vec<HttpConnection> = {
            let mut table = self.connections.borrow_mut();
            table.drain().collect()
        };
        for connection in connections {
            connection.close();
        }

        for listener in self.listeners.borrow_mut().drain(..) {
            self.reactor.remove_handler(listener.as_raw_fd());
        }
    }

    /// Number of connections currently tracked.
    pub fn connection_count(&self) -> usize {
        self.connections.borrow().len()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        // Listener handlers and tracked connections hold the reactor
        // alive; make sure they are released even without an explicit
        // stop.
        if !self.listeners.borrow().is_empty() {
            self.stop();
        }
    }
}

/// Registers the accept loop for one listening socket: on READ readiness
/// it accepts until would-block, spawning a connection per socket. Other
/// accept errors are logged and the loop yields to the next event.
fn add_accept_handler(reactor: &Rc<Reactor>, listener: Rc<TcpListener>, context: AcceptContext) -> Result<()> {
    let fd = listener.as_raw_fd();

    reactor.add_handler(fd, Ready::readable(), move |_, _| {
        loop {
            match listener.accept() {
                Ok((socket, addr)) => {
                    trace!("accepting new connection from {}", addr);
                    if let Err(err) = context.handle_connection(socket, addr) {
                        error!("error in connection from {}: {}", addr, err);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    info!("unable to accept connection: {}", err);
                    return Ok(());
                }
            }
        }
    })
}

impl AcceptContext {
    fn handle_connection(&self, socket: TcpStream, addr: SocketAddr) -> Result<()> {
        let Some(reactor) = self.reactor.upgrade() else {
            return Ok(());
        };

        let stream = self.wrap_socket(socket, addr, reactor.clone())?;

        let connection = {
            let mut table = self.connections.borrow_mut();
            let entry = table.vacant_entry();
            let connection = HttpConnection::new(
                entry.key(),
                stream,
                reactor,
                self.dispatcher.clone(),
                self.config.clone(),
                Rc::downgrade(&self.connections),
            );
            entry.insert(connection.clone());
            connection
        };

        // A fast client may drive the whole request from here, so the
        // table borrow above must already be released.
        connection.start()
    }

    #[cfg(feature = "tls")]
    fn wrap_socket(&self, socket: TcpStream, addr: SocketAddr, reactor: Rc<Reactor>) -> Result<ByteStream> {
        match &self.acceptor {
            Some(acceptor) => ByteStream::tls(
                socket,
                acceptor,
                addr,
                reactor,
                self.config.max_buffer_size,
                self.config.read_chunk_size,
            ),
            None => Ok(ByteStream::plain(
                socket,
                addr,
                reactor,
                self.config.max_buffer_size,
                self.config.read_chunk_size,
            )),
        }
    }

    #[cfg(not(feature = "tls"))]
    fn wrap_socket(&self, socket: TcpStream, addr: SocketAddr, reactor: Rc<Reactor>) -> Result<ByteStream> {
        Ok(ByteStream::plain(
            socket,
            addr,
            reactor,
            self.config.max_buffer_size,
            self.config.read_chunk_size,
        ))
    }
}
