use http::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, EXPECT, TRAILER, TRANSFER_ENCODING};
use http::{Method, Uri, Version};

use crate::error::{Error, Result};

pub const MAX_HEADERS: usize = 96;

/// The parsed start-line and headers of a request. Immutable once built;
/// shared for as long as the request is in flight.
#[derive(Debug)]
pub struct RequestHead {
    pub method: Method,
    pub target: Uri,
    pub version: Version,
    pub headers: HeaderMap,
}

/// How the request frames its message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Terminal chunked transfer-coding.
    Chunked,
    /// Content-Length of this many bytes.
    Length(u64),
    /// No message body.
    None,
}

impl RequestHead {
    /// Parses a complete request head (start-line plus headers, ending in
    /// the blank line). Leading empty lines are tolerated.
    pub fn parse(data: &[u8]) -> Result<RequestHead> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);

        match req.parse(data)? {
            httparse::Status::Complete(_) => {
                let method = Method::from_bytes(req.method.ok_or(Error::MalformedRequest)?.as_bytes())?;
                let target: Uri = req.path.ok_or(Error::MalformedRequest)?.parse()?;
                let version = match req.version {
                    Some(0) => Version::HTTP_10,
                    Some(1) => Version::HTTP_11,
                    _ => return Err(Error::MalformedRequest),
                };

                let mut map = HeaderMap::with_capacity(req.headers.len());
                for header in req.headers.iter() {
                    let name = HeaderName::from_bytes(header.name.as_bytes())?;
                    let value = HeaderValue::from_bytes(header.value)?;
                    map.append(name, value);
                }

                Ok(RequestHead {
                    method,
                    target,
                    version,
                    headers: map,
                })
            }

            // The caller hands us everything up to the blank line, so a
            // partial parse means the head itself is broken.
            httparse::Status::Partial => Err(Error::MalformedRequest),
        }
    }

    pub fn is_http_1_1(&self) -> bool {
        self.version == Version::HTTP_11
    }

    /// Re-emits the head as canonical wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();

        out.extend_from_slice(self.method.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.target.to_string().as_bytes());
        out.push(b' ');
        out.extend_from_slice(format!("{:?}", self.version).as_bytes());
        out.extend_from_slice(b"\r\n");

        for (name, value) in self.headers.iter() {
            out.extend_from_slice(name.as_str().as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }

        out.extend_from_slice(b"\r\n");
        out
    }
}

/// Decides body framing with the wire precedence: a terminal "chunked"
/// transfer-coding wins, then Content-Length, then no body. Other
/// transfer-codings are not understood and fall through to the
/// Content-Length rules.
pub fn body_framing(headers: &HeaderMap) -> Result<Framing> {
    if chunked_framing(headers)? {
        return Ok(Framing::Chunked);
    }

    match content_length(headers)? {
        Some(n) => Ok(Framing::Length(n)),
        None => Ok(Framing::None),
    }
}

fn chunked_framing(headers: &HeaderMap) -> Result<bool> {
    let mut last = None;

    for value in headers.get_all(TRANSFER_ENCODING).iter() {
        let value = value.to_str().map_err(|_| Error::MalformedRequest)?;
        for coding in value.split(',') {
            let coding = coding.trim();
            if !coding.is_empty() {
                last = Some(coding.to_ascii_lowercase());
            }
        }
    }

    Ok(last.as_deref() == Some("chunked"))
}

fn content_length(headers: &HeaderMap) -> Result<Option<u64>> {
    let mut length = None;

    for value in headers.get_all(CONTENT_LENGTH).iter() {
        let value = value.to_str().map_err(|_| Error::MalformedRequest)?;
        let parsed: u64 = value.trim().parse().map_err(|_| Error::MalformedRequest)?;

        // Duplicates are tolerated only when they agree.
        if length.is_some() && length != Some(parsed) {
            return Err(Error::MalformedRequest);
        }
        length = Some(parsed);
    }

    Ok(length)
}

pub fn expects_continue(headers: &HeaderMap) -> bool {
    headers
        .get(EXPECT)
        .map(|value| value.as_bytes().eq_ignore_ascii_case(b"100-continue"))
        .unwrap_or(false)
}

/// Whether the request announced trailer fields for its chunked body.
pub fn has_trailer(headers: &HeaderMap) -> bool {
    headers
        .get(TRAILER)
        .map(|value| !value.as_bytes().is_empty())
        .unwrap_or(false)
}

/// Whether any Connection header value lists `token`.
pub fn connection_has_token(headers: &HeaderMap, token: &str) -> bool {
    for value in headers.get_all(CONNECTION).iter() {
        if let Ok(value) = value.to_str() {
            for part in value.split(',') {
                if part.trim().eq_ignore_ascii_case(token) {
                    return true;
                }
            }
        }
    }

    false
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_simple_head() {
        let head = RequestHead::parse(b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n").unwrap();

        assert_eq!(head.method, Method::GET);
        assert_eq!(head.target.path(), "/x");
        assert_eq!(head.version, Version::HTTP_11);
        assert_eq!(head.headers.get("host").unwrap(), "h");
    }

    #[test]
    fn parse_tolerates_leading_blank_lines() {
        let head = RequestHead::parse(b"\r\n\r\nGET / HTTP/1.1\r\nHost: h\r\n\r\n").unwrap();
        assert_eq!(head.method, Method::GET);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(RequestHead::parse(b"not a request\r\n\r\n").is_err());
        assert!(RequestHead::parse(b"GET\r\n\r\n").is_err());
    }

    #[test]
    fn http_10_is_not_1_1() {
        let head = RequestHead::parse(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        assert!(!head.is_http_1_1());
    }

    #[test]
    fn headers_are_case_insensitive_multimap() {
        let head = RequestHead::parse(b"GET / HTTP/1.1\r\nX-Tag: a\r\nx-tag: b\r\n\r\n").unwrap();

        let values: Vec<_> = head.headers.get_all("x-tag").iter().collect();
        assert_eq!(values, vec!["a", "b"]);
    }

    #[test]
    fn framing_prefers_terminal_chunked() {
        let head = RequestHead::parse(
            b"POST / HTTP/1.1\r\nTransfer-Encoding: gzip, chunked\r\nContent-Length: 5\r\n\r\n",
        )
        .unwrap();

        assert_eq!(body_framing(&head.headers).unwrap(), Framing::Chunked);
    }

    #[test]
    fn framing_falls_through_on_unknown_coding() {
        let head =
            RequestHead::parse(b"POST / HTTP/1.1\r\nTransfer-Encoding: gzip\r\nContent-Length: 5\r\n\r\n")
                .unwrap();

        assert_eq!(body_framing(&head.headers).unwrap(), Framing::Length(5));
    }

    #[test]
    fn framing_content_length_and_none() {
        let with_len = RequestHead::parse(b"POST / HTTP/1.1\r\nContent-Length: 42\r\n\r\n").unwrap();
        assert_eq!(body_framing(&with_len.headers).unwrap(), Framing::Length(42));

        let without = RequestHead::parse(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(body_framing(&without.headers).unwrap(), Framing::None);
    }

    #[test]
    fn conflicting_content_lengths_are_malformed() {
        let head =
            RequestHead::parse(b"POST / HTTP/1.1\r\nContent-Length: 1\r\nContent-Length: 2\r\n\r\n")
                .unwrap();

        assert!(body_framing(&head.headers).is_err());
    }

    #[test]
    fn expect_and_trailer_detection() {
        let head = RequestHead::parse(
            b"PUT / HTTP/1.1\r\nExpect: 100-Continue\r\nTrailer: X-Checksum\r\n\r\n",
        )
        .unwrap();

        assert!(expects_continue(&head.headers));
        assert!(has_trailer(&head.headers));
    }

    #[test]
    fn connection_token_matching() {
        let head =
            RequestHead::parse(b"GET / HTTP/1.1\r\nConnection: Keep-Alive, Upgrade\r\n\r\n").unwrap();

        assert!(connection_has_token(&head.headers, "keep-alive"));
        assert!(!connection_has_token(&head.headers, "close"));
    }

    #[test]
    fn encode_round_trips() {
        let raw = b"POST /p?q=1 HTTP/1.1\r\nhost: h\r\ncontent-length: 5\r\n\r\n";
        let head = RequestHead::parse(raw).unwrap();

        let encoded = head.encode();
        let reparsed = RequestHead::parse(&encoded).unwrap();

        assert_eq!(reparsed.method, head.method);
        assert_eq!(reparsed.target, head.target);
        assert_eq!(reparsed.version, head.version);
        assert_eq!(reparsed.headers, head.headers);
    }
}
