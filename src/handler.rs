// src/handler.rs
use crate::cgi::CgiRequest;
use crate::files;
use crate::http::{Method, Response, SERVER_SOFTWARE, StatusCode};
use crate::parser::{self, ParseError, Request};
use crate::vhost::{RouteDecision, RoutingTable, VirtualServer};
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::sync::Arc;

/// Client identity handed to the engine alongside the raw bytes.
pub struct ClientContext {
    pub fd: RawFd,
    pub binding: SocketAddr,
}

/// What one engine pass decided about the buffered bytes.
pub enum EngineOutcome {
    /// Header block or body not fully received; keep reading.
    Incomplete,
    /// A complete response, ready to queue. `consumed` bytes leave the
    /// inbound buffer; any remainder belongs to the next exchange.
    Response {
        bytes: Vec<u8>,
        consumed: usize,
        keep_alive: bool,
    },
    /// Routing picked a CGI script; the reactor owns the subprocess from
    /// here and the response is produced when the relay completes.
    Cgi {
        request: CgiRequest,
        consumed: usize,
        keep_alive: bool,
    },
}

/// The request-handling seam between the reactor and HTTP semantics.
///
/// The reactor knows descriptors and readiness; an engine knows how bytes
/// become responses. Tests plug in doubles without touching the reactor.
pub trait RequestEngine: Send {
    fn run(
        &self,
        ctx: &ClientContext,
        candidates: &[Arc<VirtualServer>],
        buf: &[u8],
    ) -> EngineOutcome;

    /// Synthesized error bytes with no request context (timeout sweep,
    /// internal failures). Always close semantics.
    fn error_response(&self, status: StatusCode) -> Vec<u8>;

    /// Wrap completed CGI output into response bytes.
    fn cgi_response(&self, output: &[u8], keep_alive: bool) -> Vec<u8>;
}

/// Production engine: HTTP/1.1 parsing, virtual-host routing, static
/// content, uploads, deletes, redirects, and CGI invocation parameters.
pub struct HttpEngine;

impl HttpEngine {
    pub fn new() -> Self {
        Self
    }

    fn error_with_pages(
        &self,
        status: StatusCode,
        server: Option<&VirtualServer>,
    ) -> Response {
        if let Some(server) = server {
            if let Some(page) = server.error_pages.get(&status.code()) {
                if let Ok(bytes) = files::load(page) {
                    return Response::new(status, &files::content_type(page), bytes);
                }
            }
        }
        Response::error(status)
    }

    fn serve_get(&self, decision: &RouteDecision, request: &Request<'_>) -> Response {
        let fs_path = PathBuf::from(&decision.path);

        if decision.path.ends_with('/') {
            let index_path = fs_path.join(&decision.index);
            match files::load(&index_path) {
                Ok(bytes) => {
                    return Response::new(StatusCode::Ok, &files::content_type(&index_path), bytes);
                }
                Err(_) if decision.autoindex => {
                    return match files::directory_listing(&fs_path, request.target) {
                        Ok(page) => Response::html(StatusCode::Ok, page),
                        Err(e) => self.io_error(e, &decision.server),
                    };
                }
                Err(e) => return self.io_error(e, &decision.server),
            }
        }

        match files::load(&fs_path) {
            Ok(bytes) => Response::new(StatusCode::Ok, &files::content_type(&fs_path), bytes),
            Err(e) => self.io_error(e, &decision.server),
        }
    }

    fn serve_upload(
        &self,
        decision: &RouteDecision,
        request: &Request<'_>,
        body: &[u8],
    ) -> Response {
        let Some(dir) = &decision.upload_directory else {
            return self.error_with_pages(StatusCode::Forbidden, Some(&decision.server));
        };
        let name = request.target.rsplit('/').next().unwrap_or("");
        if name.is_empty() {
            return self.error_with_pages(StatusCode::BadRequest, Some(&decision.server));
        }
        match files::save_upload(dir, name, body) {
            Ok(()) => Response::html(
                StatusCode::Created,
                "<html><body><h1>201 Created</h1></body></html>",
            ),
            Err(e) => self.io_error(e, &decision.server),
        }
    }

    fn serve_delete(&self, decision: &RouteDecision) -> Response {
        match files::delete(&PathBuf::from(&decision.path)) {
            Ok(()) => Response::new(StatusCode::NoContent, "text/html", Vec::new()),
            Err(e) => self.io_error(e, &decision.server),
        }
    }

    fn io_error(&self, e: io::Error, server: &Arc<VirtualServer>) -> Response {
        let status = match e.kind() {
            io::ErrorKind::NotFound => StatusCode::NotFound,
            io::ErrorKind::PermissionDenied => StatusCode::Forbidden,
            _ => StatusCode::InternalServerError,
        };
        self.error_with_pages(status, Some(server))
    }

    fn build_cgi_request(
        &self,
        ctx: &ClientContext,
        decision: &RouteDecision,
        request: &Request<'_>,
        body: &[u8],
    ) -> CgiRequest {
        let server_name = request
            .host()
            .map(str::to_string)
            .or_else(|| decision.server.server_names.first().cloned())
            .unwrap_or_else(|| ctx.binding.ip().to_string());

        let mut meta_variables = vec![
            ("GATEWAY_INTERFACE".to_string(), "CGI/1.1".to_string()),
            ("REQUEST_METHOD".to_string(), request.method.as_str().to_string()),
            ("SCRIPT_NAME".to_string(), request.target.to_string()),
            ("PATH_INFO".to_string(), request.target.to_string()),
            ("QUERY_STRING".to_string(), request.query.unwrap_or("").to_string()),
            ("SERVER_PROTOCOL".to_string(), "HTTP/1.1".to_string()),
            ("SERVER_SOFTWARE".to_string(), SERVER_SOFTWARE.to_string()),
            ("SERVER_NAME".to_string(), server_name),
            ("SERVER_PORT".to_string(), ctx.binding.port().to_string()),
        ];
        if !body.is_empty() {
            meta_variables.push(("CONTENT_LENGTH".to_string(), body.len().to_string()));
            if let Some(content_type) = request.header("Content-Type") {
                meta_variables.push(("CONTENT_TYPE".to_string(), content_type.to_string()));
            }
        }

        CgiRequest {
            script_path: PathBuf::from(&decision.path),
            meta_variables,
            body: body.to_vec(),
        }
    }

    fn finish(&self, response: Response, keep_alive: bool, consumed: usize) -> EngineOutcome {
        EngineOutcome::Response {
            bytes: response.serialize(keep_alive),
            consumed,
            keep_alive,
        }
    }
}

impl Default for HttpEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestEngine for HttpEngine {
    fn run(
        &self,
        ctx: &ClientContext,
        candidates: &[Arc<VirtualServer>],
        buf: &[u8],
    ) -> EngineOutcome {
        let (request, header_end) = match parser::parse_request(buf) {
            Ok(parsed) => parsed,
            Err(ParseError::Incomplete) => return EngineOutcome::Incomplete,
            Err(ParseError::InvalidFormat) | Err(ParseError::TooLarge) => {
                return self.finish(Response::error(StatusCode::BadRequest), false, buf.len());
            }
        };

        let keep_alive = request.keep_alive();
        let declared_body = request.content_length().unwrap_or(0);
        // A routing error answered before the declared body has arrived
        // cannot keep the connection: the unread body bytes would be
        // misparsed as the next request.
        let body_pending = header_end + declared_body > buf.len();
        let error_keep_alive = keep_alive && !body_pending;

        let decision = match RoutingTable::resolve(candidates, &request) {
            Ok(decision) => decision,
            Err(status) => {
                let server = RoutingTable::select_server(candidates, request.host());
                let response = self.error_with_pages(status, server.map(Arc::as_ref));
                let close = matches!(
                    status,
                    StatusCode::BadRequest
                        | StatusCode::PayloadTooLarge
                        | StatusCode::InternalServerError
                );
                return self.finish(response, error_keep_alive && !close, buf.len());
            }
        };

        if body_pending {
            return EngineOutcome::Incomplete;
        }
        let consumed = header_end + declared_body;
        let body = &buf[header_end..consumed];

        if request.method == Method::Unknown {
            let response = self.error_with_pages(StatusCode::NotImplemented, Some(&decision.server));
            return self.finish(response, keep_alive, consumed);
        }
        if !decision.allowed_methods.contains(&request.method) {
            let response =
                self.error_with_pages(StatusCode::MethodNotAllowed, Some(&decision.server));
            return self.finish(response, keep_alive, consumed);
        }

        if let Some(redirect) = &decision.redirect {
            let response = Response::redirect(
                StatusCode::from_redirect_code(redirect.status),
                &redirect.target,
            );
            return self.finish(response, keep_alive, consumed);
        }

        if request.target.contains("..") {
            let response = self.error_with_pages(StatusCode::Forbidden, Some(&decision.server));
            return self.finish(response, keep_alive, consumed);
        }

        if let Some(extension) = &decision.cgi_extension {
            if decision.path.ends_with(extension.as_str()) {
                return EngineOutcome::Cgi {
                    request: self.build_cgi_request(ctx, &decision, &request, body),
                    consumed,
                    keep_alive,
                };
            }
        }

        let response = match request.method {
            Method::Get | Method::Head => self.serve_get(&decision, &request),
            Method::Post | Method::Put => self.serve_upload(&decision, &request, body),
            Method::Delete => self.serve_delete(&decision),
            Method::Unknown => {
                self.error_with_pages(StatusCode::NotImplemented, Some(&decision.server))
            }
        };
        self.finish(response, keep_alive, consumed)
    }

    fn error_response(&self, status: StatusCode) -> Vec<u8> {
        Response::error(status).serialize(false)
    }

    fn cgi_response(&self, output: &[u8], keep_alive: bool) -> Vec<u8> {
        // Child output is the body verbatim; no CGI header splitting.
        Response::new(StatusCode::Ok, "text/html", output.to_vec()).serialize(keep_alive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn engine_parts(config_raw: &str) -> (HttpEngine, ClientContext, Vec<Arc<VirtualServer>>) {
        let routes = RoutingTable::new(&Config::from_str(config_raw).unwrap()).unwrap();
        let candidates = routes.servers().to_vec();
        let ctx = ClientContext {
            fd: 7,
            binding: "127.0.0.1:8080".parse().unwrap(),
        };
        (HttpEngine::new(), ctx, candidates)
    }

    fn static_site() -> (tempfile::TempDir, HttpEngine, ClientContext, Vec<Arc<VirtualServer>>) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), b"<h1>home</h1>").unwrap();
        let raw = format!(
            r#"
            [[server]]
            server_names = ["example.com"]
            listen = ["127.0.0.1:8080"]
            client_max_body_size = 64

            [[server.location]]
            prefix = "/"
            alias = "{}/"
            allowed_methods = ["GET", "POST", "DELETE"]

            [[server.location]]
            prefix = "/old/"
            redirect = {{ status = 301, target = "/new/path" }}

            [[server.location]]
            prefix = "/cgi-bin/"
            alias = "{}/cgi-bin/"
            allowed_methods = ["GET", "POST"]
            cgi_extension = ".cgi"

            [[server.location]]
            prefix = "/files/"
            alias = "{}/files/"
            allowed_methods = ["GET", "POST", "DELETE"]
            upload_directory = "{}/uploads"
            "#,
            dir.path().display(),
            dir.path().display(),
            dir.path().display(),
            dir.path().display(),
        );
        let (engine, ctx, candidates) = engine_parts(&raw);
        (dir, engine, ctx, candidates)
    }

    fn response_text(outcome: EngineOutcome) -> (String, usize, bool) {
        match outcome {
            EngineOutcome::Response {
                bytes,
                consumed,
                keep_alive,
            } => (String::from_utf8_lossy(&bytes).into_owned(), consumed, keep_alive),
            _ => panic!("expected a response outcome"),
        }
    }

    #[test]
    fn simple_get_closes_http10_connection() {
        let (_dir, engine, ctx, candidates) = static_site();
        let raw = b"GET /index.html HTTP/1.0\r\n\r\n";
        let (text, consumed, keep_alive) = response_text(engine.run(&ctx, &candidates, raw));

        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 13\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("<h1>home</h1>"));
        assert_eq!(consumed, raw.len());
        assert!(!keep_alive);
    }

    #[test]
    fn partial_request_stays_incomplete_until_blank_line() {
        let (_dir, engine, ctx, candidates) = static_site();
        let first = b"GET / HTTP/1.1\r\nHost: example";
        assert!(matches!(
            engine.run(&ctx, &candidates, first),
            EngineOutcome::Incomplete
        ));

        let full = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let (text, consumed, keep_alive) = response_text(engine.run(&ctx, &candidates, full));
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert_eq!(consumed, full.len());
        assert!(keep_alive);
    }

    #[test]
    fn redirect_needs_no_disk() {
        let (_dir, engine, ctx, candidates) = static_site();
        let raw = b"GET /old/page HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let (text, _, _) = response_text(engine.run(&ctx, &candidates, raw));
        assert!(text.starts_with("HTTP/1.1 301 Moved Permanently\r\n"));
        assert!(text.contains("Location: /new/path\r\n"));
    }

    #[test]
    fn oversized_body_is_rejected_before_routing() {
        let (_dir, engine, ctx, candidates) = static_site();
        let raw = b"POST /nowhere HTTP/1.1\r\nHost: example.com\r\nContent-Length: 100\r\n\r\n";
        let (text, _, keep_alive) = response_text(engine.run(&ctx, &candidates, raw));
        assert!(text.starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
        assert!(!keep_alive);
    }

    #[test]
    fn missing_file_is_not_found() {
        let (_dir, engine, ctx, candidates) = static_site();
        let raw = b"GET /ghost.html HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let (text, _, _) = response_text(engine.run(&ctx, &candidates, raw));
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
    }

    #[test]
    fn disallowed_method_is_405() {
        let (_dir, engine, ctx, candidates) = static_site();
        let raw = b"DELETE /old/page HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let (text, _, _) = response_text(engine.run(&ctx, &candidates, raw));
        assert!(text.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));
    }

    #[test]
    fn body_waits_for_declared_length() {
        let (_dir, engine, ctx, candidates) = static_site();
        let partial = b"POST /files/new.txt HTTP/1.1\r\nHost: example.com\r\nContent-Length: 10\r\n\r\n12345";
        assert!(matches!(
            engine.run(&ctx, &candidates, partial),
            EngineOutcome::Incomplete
        ));
    }

    #[test]
    fn upload_writes_into_upload_directory() {
        let (dir, engine, ctx, candidates) = static_site();
        let raw = b"POST /files/new.txt HTTP/1.1\r\nHost: example.com\r\nContent-Length: 5\r\n\r\nhello";
        let (text, consumed, _) = response_text(engine.run(&ctx, &candidates, raw));
        assert!(text.starts_with("HTTP/1.1 201 Created\r\n"));
        assert_eq!(consumed, raw.len());
        assert_eq!(
            std::fs::read(dir.path().join("uploads/new.txt")).unwrap(),
            b"hello"
        );
    }

    #[test]
    fn delete_removes_file() {
        let (dir, engine, ctx, candidates) = static_site();
        std::fs::create_dir_all(dir.path().join("files")).unwrap();
        std::fs::write(dir.path().join("files/gone.txt"), b"x").unwrap();

        let raw = b"DELETE /files/gone.txt HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let (text, _, _) = response_text(engine.run(&ctx, &candidates, raw));
        assert!(text.starts_with("HTTP/1.1 204 No Content\r\n"));
        assert!(!dir.path().join("files/gone.txt").exists());
    }

    #[test]
    fn dotdot_target_is_forbidden() {
        let (_dir, engine, ctx, candidates) = static_site();
        let raw = b"GET /../etc/passwd HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let (text, _, _) = response_text(engine.run(&ctx, &candidates, raw));
        assert!(text.starts_with("HTTP/1.1 403 Forbidden\r\n"));
    }

    #[test]
    fn cgi_request_carries_meta_variables_and_body() {
        let (dir, engine, ctx, candidates) = static_site();
        let raw = b"POST /cgi-bin/echo.cgi?x=1 HTTP/1.1\r\nHost: example.com\r\nContent-Length: 4\r\nContent-Type: text/plain\r\n\r\nping";
        let outcome = engine.run(&ctx, &candidates, raw);

        let EngineOutcome::Cgi {
            request,
            consumed,
            keep_alive,
        } = outcome
        else {
            panic!("expected a CGI outcome");
        };
        assert_eq!(consumed, raw.len());
        assert!(keep_alive);
        assert_eq!(
            request.script_path,
            dir.path().join("cgi-bin/echo.cgi")
        );
        assert_eq!(request.body, b"ping");

        let meta: std::collections::HashMap<_, _> = request
            .meta_variables
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        assert_eq!(meta["REQUEST_METHOD"], "POST");
        assert_eq!(meta["SCRIPT_NAME"], "/cgi-bin/echo.cgi");
        assert_eq!(meta["QUERY_STRING"], "x=1");
        assert_eq!(meta["CONTENT_LENGTH"], "4");
        assert_eq!(meta["CONTENT_TYPE"], "text/plain");
        assert_eq!(meta["SERVER_PORT"], "8080");
    }

    #[test]
    fn error_page_override_replaces_default_body() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("404.html"), b"custom missing page").unwrap();
        let raw = format!(
            r#"
            [[server]]
            listen = ["127.0.0.1:8080"]

            [server.error_pages]
            404 = "{}/404.html"

            [[server.location]]
            prefix = "/www/"
            "#,
            dir.path().display()
        );
        let (engine, ctx, candidates) = engine_parts(&raw);
        let request = b"GET /nothing HTTP/1.1\r\nHost: x\r\n\r\n";
        let (text, _, _) = response_text(engine.run(&ctx, &candidates, request));
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.ends_with("custom missing page"));
    }

    #[test]
    fn cgi_output_becomes_response_body_verbatim() {
        let engine = HttpEngine::new();
        let bytes = engine.cgi_response(b"raw child bytes", true);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 15\r\n"));
        assert!(text.ends_with("raw child bytes"));
    }
}
