use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};

use crate::error::{Error, Result};

use super::head::MAX_HEADERS;

/// One frame of a chunked message body. The terminal frame has size zero
/// and no data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFrame {
    pub size: usize,
    pub extension: Option<Bytes>,
    pub data: Option<Bytes>,
}

/// Parses a chunk-size line: `size[;extension]` with the size in hex,
/// optionally still carrying its trailing CRLF.
pub fn parse_chunk_size(line: &[u8]) -> Result<(usize, Option<Bytes>)> {
    let line = trim_crlf(line);

    let (size_part, extension) = match line.iter().position(|&b| b == b';') {
        Some(at) => (&line[..at], Some(Bytes::copy_from_slice(&line[at + 1..]))),
        None => (line, None),
    };

    let size_str = std::str::from_utf8(size_part).map_err(|_| Error::MalformedRequest)?;
    let size = usize::from_str_radix(size_str.trim(), 16).map_err(|_| Error::MalformedRequest)?;

    Ok((size, extension))
}

/// Parses the trailer section following the terminal chunk, up to and
/// including its blank line.
pub fn parse_trailers(data: &[u8]) -> Result<HeaderMap> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];

    match httparse::parse_headers(data, &mut headers)? {
        httparse::Status::Complete((_, parsed)) => {
            let mut map = HeaderMap::with_capacity(parsed.len());
            for header in parsed.iter() {
                let name = HeaderName::from_bytes(header.name.as_bytes())?;
                let value = HeaderValue::from_bytes(header.value)?;
                map.append(name, value);
            }
            Ok(map)
        }
        httparse::Status::Partial => Err(Error::MalformedRequest),
    }
}

/// Wraps a response chunk in chunked transfer-coding framing:
/// `hex(len)\r\n<chunk>\r\n`. An empty chunk yields the terminal frame.
pub fn encode_chunk(data: &[u8]) -> Vec<u8> {
    let mut out = format!("{:x}\r\n", data.len()).into_bytes();
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}

fn trim_crlf(mut line: &[u8]) -> &[u8] {
    while let [rest @ .., last] = line {
        if *last == b'\r' || *last == b'\n' {
            line = rest;
        } else {
            break;
        }
    }
    line
}
