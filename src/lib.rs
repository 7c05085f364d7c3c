//! An event-driven, non-blocking HTTP/1.1 server engine built around a
//! level-triggered epoll reactor.
//!
//! One thread owns the [`Reactor`] and all socket I/O; application
//! callbacks run on that same thread and must not block. Each accepted
//! socket is wrapped in a buffered [`ByteStream`] (plain TCP, or TLS with
//! the `tls` feature), on top of which an [`HttpConnection`] parses
//! request heads, content-length bodies and chunked transfer-coding with
//! trailers, and hands parsed requests to a [`Dispatcher`].
//!
//! ## Usage
//!
//! First, add this to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! ember-http = "0.1"
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::rc::Rc;
//!
//! use bytes::Bytes;
//! use ember_http::{AppId, Body, ChunkFrame, Dispatcher, HttpConnection};
//! use ember_http::{RequestHead, Server, ServerConfig};
//!
//! struct Hello;
//!
//! impl Dispatcher for Hello {
//!     fn resolve(&self, _target: &http::Uri, _headers: &http::HeaderMap) -> Option<AppId> {
//!         Some(AppId(0))
//!     }
//!
//!     fn do_request(&self, _app: AppId, conn: &HttpConnection, _head: &Rc<RequestHead>, _body: Body) {
//!         let body = b"hello\n";
//!         let head = format!(
//!             "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n",
//!             body.len()
//!         );
//!
//!         let mut response = head.into_bytes();
//!         response.extend_from_slice(body);
//!
//!         let _ = conn.write(Bytes::from(response), None, false);
//!         let _ = conn.finish(None);
//!     }
//!
//!     fn do_request_chunk(
//!         &self,
//!         _app: AppId,
//!         _conn: &HttpConnection,
//!         _head: &Rc<RequestHead>,
//!         _chunk: ChunkFrame,
//!         _trailers: Option<http::HeaderMap>,
//!     ) {
//!     }
//! }
//!
//! let mut config = ServerConfig::default();
//! config.port = Some(8080);
//!
//! let server = Server::bind(config, Rc::new(Hello)).unwrap();
//! server.start().unwrap();
//! ```

#[macro_use]
mod sys;

mod buffer;
mod config;
mod error;
mod net;
mod queue;
mod reactor;
mod ready;
mod server;
mod stream;
mod timer;
mod waker;

#[cfg(feature = "tls")]
mod tls;

pub mod dispatch;
pub mod http;

pub use config::{AddrFamily, CertReqs, Scheme, ServerConfig, TlsConfig};
pub use dispatch::{AppId, Body, Dispatcher};
pub use error::{Error, Result};
pub use self::http::{ChunkFrame, ConnectionState, HttpConnection, RequestHead};
pub use net::{TcpListener, TcpStream};
pub use queue::Remote;
pub use reactor::Reactor;
pub use ready::Ready;
pub use server::Server;
pub use stream::ByteStream;
pub use timer::{Deadline, TimeoutHandle};
pub use waker::Waker;
