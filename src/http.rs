// src/http.rs
use std::time::SystemTime;

pub const SERVER_SOFTWARE: &str = concat!("ravel/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Unknown,
}

impl Method {
    pub fn from_bytes(b: &[u8]) -> Self {
        match b {
            b"GET" => Method::Get,
            b"POST" => Method::Post,
            b"PUT" => Method::Put,
            b"DELETE" => Method::Delete,
            b"HEAD" => Method::Head,
            _ => Method::Unknown,
        }
    }

    pub fn from_name(name: &str) -> Self {
        Self::from_bytes(name.as_bytes())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Unknown => "UNKNOWN",
        }
    }

    /// Methods that carry a request body.
    pub fn has_body(&self) -> bool {
        matches!(self, Method::Post | Method::Put)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    /// HTTP/1.1 defaults to keep-alive per RFC 7230; 1.0 to close.
    pub fn default_keep_alive(&self) -> bool {
        matches!(self, Version::Http11)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Ok,
    Created,
    NoContent,
    MovedPermanently,
    Found,
    BadRequest,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    RequestTimeout,
    PayloadTooLarge,
    InternalServerError,
    NotImplemented,
}

impl StatusCode {
    pub fn code(&self) -> u16 {
        match self {
            StatusCode::Ok => 200,
            StatusCode::Created => 201,
            StatusCode::NoContent => 204,
            StatusCode::MovedPermanently => 301,
            StatusCode::Found => 302,
            StatusCode::BadRequest => 400,
            StatusCode::Forbidden => 403,
            StatusCode::NotFound => 404,
            StatusCode::MethodNotAllowed => 405,
            StatusCode::RequestTimeout => 408,
            StatusCode::PayloadTooLarge => 413,
            StatusCode::InternalServerError => 500,
            StatusCode::NotImplemented => 501,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::Created => "Created",
            StatusCode::NoContent => "No Content",
            StatusCode::MovedPermanently => "Moved Permanently",
            StatusCode::Found => "Found",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::Forbidden => "Forbidden",
            StatusCode::NotFound => "Not Found",
            StatusCode::MethodNotAllowed => "Method Not Allowed",
            StatusCode::RequestTimeout => "Request Timeout",
            StatusCode::PayloadTooLarge => "Payload Too Large",
            StatusCode::InternalServerError => "Internal Server Error",
            StatusCode::NotImplemented => "Not Implemented",
        }
    }

    pub fn from_redirect_code(code: u16) -> StatusCode {
        match code {
            302 => StatusCode::Found,
            _ => StatusCode::MovedPermanently,
        }
    }

    pub fn is_error(&self) -> bool {
        self.code() >= 400
    }
}

/// A response under construction. `serialize` produces the final wire bytes;
/// the Connection header is decided at serialization time because keep-alive
/// is a property of the exchange, not of the payload.
pub struct Response {
    pub status: StatusCode,
    pub content_type: String,
    pub extra_headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: StatusCode, content_type: &str, body: Vec<u8>) -> Self {
        Self {
            status,
            content_type: content_type.to_string(),
            extra_headers: Vec::new(),
            body,
        }
    }

    pub fn html(status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
        Self::new(status, "text/html", body.into())
    }

    pub fn redirect(status: StatusCode, target: &str) -> Self {
        let mut response = Self::html(
            status,
            format!(
                "<html><body><h1>{} {}</h1></body></html>",
                status.code(),
                status.reason()
            ),
        );
        response
            .extra_headers
            .push(("Location".to_string(), target.to_string()));
        response
    }

    /// Default error body, used when no configured error page applies.
    pub fn error(status: StatusCode) -> Self {
        Self::html(
            status,
            format!(
                "<html><head><title>{code} {reason}</title></head>\
                 <body><h1>{code} {reason}</h1></body></html>",
                code = status.code(),
                reason = status.reason()
            ),
        )
    }

    pub fn serialize(&self, keep_alive: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.body.len());
        out.extend_from_slice(
            format!("HTTP/1.1 {} {}\r\n", self.status.code(), self.status.reason()).as_bytes(),
        );
        out.extend_from_slice(format!("Server: {}\r\n", SERVER_SOFTWARE).as_bytes());
        out.extend_from_slice(
            format!("Date: {}\r\n", httpdate::fmt_http_date(SystemTime::now())).as_bytes(),
        );
        out.extend_from_slice(format!("Content-Type: {}\r\n", self.content_type).as_bytes());
        out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        for (name, value) in &self.extra_headers {
            out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        let connection = if keep_alive { "keep-alive" } else { "close" };
        out.extend_from_slice(format!("Connection: {}\r\n\r\n", connection).as_bytes());
        out.extend_from_slice(&self.body);
        out
    }
}
