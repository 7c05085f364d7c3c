mod chunk;
pub(crate) mod conn;
mod head;

pub use chunk::{encode_chunk, parse_chunk_size, parse_trailers, ChunkFrame};
pub use conn::{ConnectionState, HttpConnection};
pub use head::{body_framing, connection_has_token, expects_continue, has_trailer, Framing, RequestHead};
