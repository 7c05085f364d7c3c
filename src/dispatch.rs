use std::rc::Rc;

use bytes::Bytes;
use http::header::HeaderMap;
use http::Uri;

use crate::http::{ChunkFrame, HttpConnection, RequestHead};

/// Opaque handle for the application a request resolved to. The resolver
/// picks it; the core only passes it back on dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AppId(pub usize);

/// The payload handed over on the first dispatch of a request.
pub enum Body {
    /// The request carried no message body.
    None,
    /// A complete content-length body.
    Full(Bytes),
    /// The first frame of a chunked request, possibly already terminal.
    Chunk(ChunkFrame, Option<HeaderMap>),
}

/// The application boundary of the server core.
///
/// Parsed requests leave the engine through this trait and response bytes
/// come back in via [`HttpConnection::write`] and
/// [`HttpConnection::finish`]. All methods run on the reactor thread and
/// must not block; implementations handle their own failures.
///
/// [`HttpConnection::write`]: crate::HttpConnection::write
/// [`HttpConnection::finish`]: crate::HttpConnection::finish
pub trait Dispatcher {
    /// Picks the application serving `target`, or `None` when nothing
    /// does, in which case the connection answers 404 and closes.
    fn resolve(&self, target: &Uri, headers: &HeaderMap) -> Option<AppId>;

    /// First dispatch of a request: the full body, the first chunk of a
    /// chunked request, or nothing.
    fn do_request(&self, app: AppId, conn: &HttpConnection, head: &Rc<RequestHead>, body: Body);

    /// Continuation frames of an already-dispatched chunked request;
    /// trailers arrive with the terminal frame when present.
    fn do_request_chunk(
        &self,
        app: AppId,
        conn: &HttpConnection,
        head: &Rc<RequestHead>,
        chunk: ChunkFrame,
        trailers: Option<HeaderMap>,
    );
}
