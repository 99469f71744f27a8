// src/parser.rs
use crate::http::{Method, Version};

pub const MAX_HEADERS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// More bytes are needed; not a failure, the connection keeps reading.
    Incomplete,
    InvalidFormat,
    TooLarge,
}

/// A structured view over the raw inbound buffer. Borrows the buffer; the
/// connection owns the bytes across partial reads.
pub struct Request<'a> {
    pub method: Method,
    pub target: &'a str,
    pub query: Option<&'a str>,
    pub version: Version,
    pub headers: Vec<(&'a str, &'a str)>,
    pub body: &'a [u8],
}

impl<'a> Request<'a> {
    pub fn header(&self, name: &str) -> Option<&'a str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| *v)
    }

    pub fn content_length(&self) -> Option<usize> {
        self.header("Content-Length").and_then(|v| v.parse().ok())
    }

    /// Host header with any :port suffix stripped.
    pub fn host(&self) -> Option<&'a str> {
        self.header("Host")
            .map(|h| h.split(':').next().unwrap_or(h))
    }

    /// Keep-alive decision: the Connection header overrides the version
    /// default.
    pub fn keep_alive(&self) -> bool {
        match self.header("Connection") {
            Some(v) if v.eq_ignore_ascii_case("close") => false,
            Some(v) if v.eq_ignore_ascii_case("keep-alive") => true,
            _ => self.version.default_keep_alive(),
        }
    }
}

/// Parse the request line and header block out of `buf`.
///
/// Returns the request and the byte offset just past the blank line; the
/// body (if any) starts there and its completeness is judged by the caller
/// against Content-Length. `Incomplete` means the header block has not fully
/// arrived yet.
pub fn parse_request(buf: &[u8]) -> Result<(Request<'_>, usize), ParseError> {
    // Request line: METHOD SP TARGET SP HTTP/1.x CRLF
    let mut space1 = 0;
    while space1 < buf.len() && buf[space1] != b' ' {
        space1 += 1;
    }
    if space1 >= buf.len() {
        return Err(ParseError::Incomplete);
    }
    let method = Method::from_bytes(&buf[..space1]);

    let mut space2 = space1 + 1;
    while space2 < buf.len() && buf[space2] != b' ' {
        space2 += 1;
    }
    if space2 >= buf.len() {
        return Err(ParseError::Incomplete);
    }
    let target_bytes = &buf[space1 + 1..space2];
    let full_target = std::str::from_utf8(target_bytes).map_err(|_| ParseError::InvalidFormat)?;
    if !full_target.starts_with('/') {
        return Err(ParseError::InvalidFormat);
    }

    let (target, query) = match full_target.find('?') {
        Some(idx) => (&full_target[..idx], Some(&full_target[idx + 1..])),
        None => (full_target, None),
    };

    let mut line_end = space2 + 1;
    while line_end + 1 < buf.len() && !(buf[line_end] == b'\r' && buf[line_end + 1] == b'\n') {
        line_end += 1;
    }
    if line_end + 1 >= buf.len() {
        return Err(ParseError::Incomplete);
    }
    let version = match &buf[space2 + 1..line_end] {
        b"HTTP/1.0" => Version::Http10,
        b"HTTP/1.1" => Version::Http11,
        _ => return Err(ParseError::InvalidFormat),
    };

    let mut headers = Vec::new();
    let mut cursor = line_end + 2;

    loop {
        if cursor + 1 >= buf.len() {
            return Err(ParseError::Incomplete);
        }
        if buf[cursor] == b'\r' && buf[cursor + 1] == b'\n' {
            cursor += 2;
            break;
        }
        if headers.len() >= MAX_HEADERS {
            return Err(ParseError::TooLarge);
        }

        let mut colon_idx = cursor;
        while colon_idx < buf.len() && buf[colon_idx] != b':' && buf[colon_idx] != b'\r' {
            colon_idx += 1;
        }
        if colon_idx >= buf.len() || buf[colon_idx] == b'\r' {
            return Err(ParseError::InvalidFormat);
        }
        let name =
            std::str::from_utf8(&buf[cursor..colon_idx]).map_err(|_| ParseError::InvalidFormat)?;

        let mut value_end = colon_idx + 1;
        while value_end + 1 < buf.len() && !(buf[value_end] == b'\r' && buf[value_end + 1] == b'\n')
        {
            value_end += 1;
        }
        if value_end + 1 >= buf.len() {
            return Err(ParseError::Incomplete);
        }

        let mut value_start = colon_idx + 1;
        while value_start < value_end && buf[value_start] == b' ' {
            value_start += 1;
        }
        let value = std::str::from_utf8(&buf[value_start..value_end])
            .map_err(|_| ParseError::InvalidFormat)?;

        headers.push((name, value));
        cursor = value_end + 2;
    }

    let header_end = cursor;
    Ok((
        Request {
            method,
            target,
            query,
            version,
            headers,
            body: &buf[header_end..],
        },
        header_end,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_request() {
        let raw = b"GET /some/path?foo=bar HTTP/1.1\r\nHost: localhost\r\nAccept: */*\r\n\r\nBody";
        let (request, header_end) = parse_request(raw).unwrap();

        assert_eq!(request.method, Method::Get);
        assert_eq!(request.target, "/some/path");
        assert_eq!(request.query, Some("foo=bar"));
        assert_eq!(request.version, Version::Http11);
        assert_eq!(request.headers.len(), 2);
        assert_eq!(request.headers[0], ("Host", "localhost"));
        assert_eq!(request.body, b"Body");
        assert_eq!(header_end, raw.len() - 4);
    }

    #[test]
    fn incomplete_until_blank_line() {
        assert!(matches!(
            parse_request(b"GET / HTT"),
            Err(ParseError::Incomplete)
        ));
        assert!(matches!(
            parse_request(b"GET / HTTP/1.1\r\nHost: example"),
            Err(ParseError::Incomplete)
        ));
    }

    #[test]
    fn rejects_unknown_protocol() {
        assert!(matches!(
            parse_request(b"GET / HTTP/2.0\r\n\r\n"),
            Err(ParseError::InvalidFormat)
        ));
    }

    #[test]
    fn rejects_target_without_leading_slash() {
        assert!(matches!(
            parse_request(b"GET example.com HTTP/1.1\r\n\r\n"),
            Err(ParseError::InvalidFormat)
        ));
    }

    #[test]
    fn host_strips_port_and_connection_overrides() {
        let raw = b"GET / HTTP/1.1\r\nHost: example.com:8080\r\nConnection: close\r\n\r\n";
        let (request, _) = parse_request(raw).unwrap();
        assert_eq!(request.host(), Some("example.com"));
        assert!(!request.keep_alive());

        let raw = b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n";
        let (request, _) = parse_request(raw).unwrap();
        assert!(request.keep_alive());

        let raw = b"GET / HTTP/1.0\r\n\r\n";
        let (request, _) = parse_request(raw).unwrap();
        assert!(!request.keep_alive());
    }

    #[test]
    fn content_length_parses() {
        let raw = b"POST /u HTTP/1.1\r\nContent-Length: 11\r\n\r\nhello world";
        let (request, header_end) = parse_request(raw).unwrap();
        assert_eq!(request.content_length(), Some(11));
        assert_eq!(&raw[header_end..], b"hello world");
    }
}
