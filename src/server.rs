// src/server.rs
use crate::cgi::{CgiRegistry, CgiRequest, CgiSession, FeedOutcome, RelayOutcome};
use crate::config::Config;
use crate::error::ServerResult;
use crate::handler::{ClientContext, EngineOutcome, HttpEngine, RequestEngine};
use crate::http::StatusCode;
use crate::listener::ListenerSet;
use crate::message::{ConnectionState, MessageStore, OutboundChunk};
use crate::syscalls::{self, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, Epoll, IoStep, epoll_event};
use crate::vhost::RoutingTable;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const MAX_EVENTS: usize = 1024;
const READ_CHUNK: usize = 4096;

/// The reactor. One thread, one epoll instance, every descriptor
/// non-blocking: listening sockets, client connections, and CGI pipes all
/// funnel through the same readiness loop. This is the only component that
/// sees all of the per-connection state at once.
pub struct Server {
    epoll: Epoll,
    listeners: ListenerSet,
    routes: RoutingTable,
    messages: MessageStore,
    cgi: CgiRegistry,
    engine: Box<dyn RequestEngine>,
    request_timeout: Duration,
    shutdown: Arc<AtomicBool>,
}

enum CgiAction {
    None,
    StdinDone(RawFd),
    Complete,
    Fail,
}

impl Server {
    pub fn new(config: &Config) -> ServerResult<Self> {
        Self::with_engine(config, Box::new(HttpEngine::new()))
    }

    /// Construct with an explicit engine; the reactor never assumes more
    /// than the `RequestEngine` contract.
    pub fn with_engine(config: &Config, engine: Box<dyn RequestEngine>) -> ServerResult<Self> {
        syscalls::ignore_sigpipe();

        let routes = RoutingTable::new(config)?;
        let listeners = ListenerSet::bind(&routes.listen_addrs())?;
        let epoll = Epoll::new()?;
        for fd in listeners.fds() {
            epoll.add(fd, EPOLLIN)?;
        }

        Ok(Self {
            epoll,
            listeners,
            routes,
            messages: MessageStore::new(),
            cgi: CgiRegistry::new(),
            engine,
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Flag checked once per loop iteration; setting it drains the server
    /// at the next readiness event.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Run until shutdown. Only a readiness-wait failure that is not an
    /// interrupt escapes; everything else stays within one connection.
    pub fn run(&mut self) -> ServerResult<()> {
        info!("entering event loop");
        let mut events = vec![epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        while !self.shutdown.load(Ordering::Acquire) {
            let n = self.epoll.wait(&mut events, -1)?;
            for i in 0..n {
                let fd = events[i].u64 as RawFd;
                let bits = events[i].events;
                self.dispatch(fd, bits);
            }
            self.sweep_timeouts();
            self.cgi.reap_pending();
        }

        info!("shutdown requested; closing {} connection(s)", self.messages.len());
        self.close_all();
        Ok(())
    }

    fn dispatch(&mut self, fd: RawFd, bits: u32) {
        if self.listeners.is_listen_fd(fd) {
            self.accept_clients(fd);
            return;
        }
        if let Some(client_fd) = self.cgi.owner_of(fd) {
            self.handle_cgi_event(fd, client_fd, bits);
            return;
        }
        if bits & (EPOLLERR | EPOLLHUP) as u32 != 0 {
            self.disconnect(fd);
            return;
        }
        if bits & EPOLLIN as u32 != 0 {
            self.handle_client_read(fd);
        }
        if bits & EPOLLOUT as u32 != 0 && self.messages.contains(fd) {
            self.handle_client_write(fd);
        }
    }

    // ---- accept ----

    fn accept_clients(&mut self, listen_fd: RawFd) {
        let Some(binding) = self.listeners.addr_of(listen_fd) else {
            return;
        };
        loop {
            match syscalls::accept_connection(listen_fd) {
                Ok(Some(client_fd)) => {
                    if let Err(e) = self.epoll.add(client_fd, EPOLLIN) {
                        warn!("cannot watch accepted fd {client_fd}: {e}");
                        syscalls::close_fd(client_fd);
                        continue;
                    }
                    self.messages.insert(client_fd, Instant::now());
                    self.routes.add_client(client_fd, binding);
                    debug!("accepted client {client_fd} on {binding}");
                }
                Ok(None) => break,
                Err(e) => {
                    // Transient: the connection raced away or limits bit.
                    debug!("accept on {binding} failed: {e}");
                    break;
                }
            }
        }
    }

    // ---- client read path ----

    fn handle_client_read(&mut self, fd: RawFd) {
        let mut chunk = [0u8; READ_CHUNK];
        match syscalls::read_nonblocking(fd, &mut chunk) {
            Ok(IoStep::Done(0)) => {
                debug!("client {fd} closed");
                self.disconnect(fd);
            }
            Ok(IoStep::Done(n)) => {
                self.messages.append_request(fd, &chunk[..n]);
                self.run_engine(fd);
            }
            Ok(IoStep::WouldBlock) => {}
            Err(e) => {
                debug!("read from client {fd} failed: {e}");
                self.disconnect(fd);
            }
        }
    }

    fn run_engine(&mut self, fd: RawFd) {
        // While a CGI child is in flight its response owns the queue front;
        // pipelined bytes wait in the inbound buffer.
        if self.cgi.session(fd).is_some() {
            return;
        }
        let Some(binding) = self.routes.binding_of(fd) else {
            return;
        };
        let Some(buf) = self.messages.request_buf(fd) else {
            return;
        };
        let buf = buf.to_vec();
        let candidates = self.routes.candidates_for_client(fd);
        let ctx = ClientContext { fd, binding };

        match self.engine.run(&ctx, &candidates, &buf) {
            EngineOutcome::Incomplete => {}
            EngineOutcome::Response {
                bytes,
                consumed,
                keep_alive,
            } => {
                self.messages.drain_request(fd, consumed);
                self.queue_response(fd, bytes, keep_alive);
            }
            EngineOutcome::Cgi {
                request,
                consumed,
                keep_alive,
            } => {
                self.messages.drain_request(fd, consumed);
                self.start_cgi(fd, request, keep_alive);
            }
        }
    }

    fn queue_response(&mut self, fd: RawFd, bytes: Vec<u8>, keep_alive: bool) {
        let state = if keep_alive {
            ConnectionState::Keep
        } else {
            ConnectionState::Close
        };
        self.messages.push_response(fd, OutboundChunk { state, bytes });
        self.messages.set_complete(fd, true);
        let interests = if keep_alive {
            EPOLLIN | EPOLLOUT
        } else {
            EPOLLOUT
        };
        if self.epoll.modify(fd, interests).is_err() {
            self.disconnect(fd);
        }
    }

    /// Error response that preempts anything queued, then close.
    fn set_internal_error(&mut self, fd: RawFd) {
        if !self.messages.contains(fd) {
            return;
        }
        let bytes = self.engine.error_response(StatusCode::InternalServerError);
        self.messages.push_front_response(
            fd,
            OutboundChunk {
                state: ConnectionState::Close,
                bytes,
            },
        );
        self.messages.set_complete(fd, true);
        if self.epoll.modify(fd, EPOLLOUT).is_err() {
            self.disconnect(fd);
        }
    }

    // ---- CGI paths ----

    fn start_cgi(&mut self, client_fd: RawFd, request: CgiRequest, keep_alive: bool) {
        let session = match CgiSession::spawn(&request, client_fd, keep_alive) {
            Ok(session) => session,
            Err(e) => {
                warn!("CGI spawn failed for client {client_fd}: {e}");
                self.set_internal_error(client_fd);
                return;
            }
        };

        if let Some(stdout_fd) = session.stdout_fd() {
            if let Err(e) = self.epoll.add(stdout_fd, EPOLLIN) {
                warn!("cannot watch CGI stdout for client {client_fd}: {e}");
                self.cgi.dispose(session);
                self.set_internal_error(client_fd);
                return;
            }
        }
        if let Some(stdin_fd) = session.stdin_fd() {
            if let Err(e) = self.epoll.add(stdin_fd, EPOLLOUT) {
                warn!("cannot watch CGI stdin for client {client_fd}: {e}");
                if let Some(stdout_fd) = session.stdout_fd() {
                    self.epoll.delete(stdout_fd).ok();
                }
                self.cgi.dispose(session);
                self.set_internal_error(client_fd);
                return;
            }
        }
        self.cgi.insert(session);
    }

    fn handle_cgi_event(&mut self, pipe_fd: RawFd, client_fd: RawFd, bits: u32) {
        let action = {
            let Some(session) = self.cgi.session_mut(client_fd) else {
                return;
            };
            if session.is_stdin(pipe_fd) {
                match session.feed_stdin() {
                    FeedOutcome::Progress => CgiAction::None,
                    FeedOutcome::Drained(fd) => CgiAction::StdinDone(fd),
                }
            } else if bits & EPOLLERR as u32 != 0 {
                CgiAction::Fail
            } else {
                // A hangup with buffered bytes still reads; end-of-stream
                // arrives as a zero-byte read once the pipe is dry.
                let mut chunk = [0u8; READ_CHUNK];
                match session.drain_stdout(&mut chunk) {
                    RelayOutcome::Progress => CgiAction::None,
                    RelayOutcome::Eof => CgiAction::Complete,
                    RelayOutcome::Failed => CgiAction::Fail,
                }
            }
        };

        match action {
            CgiAction::None => {}
            CgiAction::StdinDone(fd) => {
                self.epoll.delete(fd).ok();
                if let Some(session) = self.cgi.session_mut(client_fd) {
                    session.close_stdin();
                }
                self.cgi.forget_pipe(fd);
            }
            CgiAction::Complete => self.complete_cgi(client_fd),
            CgiAction::Fail => self.fail_cgi(client_fd),
        }
    }

    fn complete_cgi(&mut self, client_fd: RawFd) {
        let Some(mut session) = self.cgi.remove(client_fd) else {
            return;
        };
        for fd in session.pipe_fds() {
            self.epoll.delete(fd).ok();
        }
        let output = session.take_output();
        let keep_alive = session.keep_alive();
        self.cgi.dispose(session);
        debug!("CGI complete for client {client_fd}: {} byte(s)", output.len());

        let bytes = self.engine.cgi_response(&output, keep_alive);
        self.queue_response(client_fd, bytes, keep_alive);
    }

    fn fail_cgi(&mut self, client_fd: RawFd) {
        let Some(session) = self.cgi.remove(client_fd) else {
            return;
        };
        for fd in session.pipe_fds() {
            self.epoll.delete(fd).ok();
        }
        self.cgi.dispose(session);
        warn!("CGI session failed for client {client_fd}");
        self.set_internal_error(client_fd);
    }

    // ---- client write path ----

    fn handle_client_write(&mut self, fd: RawFd) {
        let Some(chunk) = self.messages.pop_response(fd) else {
            return;
        };
        match syscalls::send_nonblocking(fd, &chunk.bytes) {
            Ok(IoStep::Done(n)) if n < chunk.bytes.len() => {
                // Unsent remainder goes back to the FRONT of the queue.
                let bytes = chunk.bytes[n..].to_vec();
                self.messages.push_front_response(
                    fd,
                    OutboundChunk {
                        state: chunk.state,
                        bytes,
                    },
                );
            }
            Ok(IoStep::Done(_)) => {
                if self.messages.has_responses(fd) {
                    return;
                }
                match chunk.state {
                    ConnectionState::Close => self.disconnect(fd),
                    ConnectionState::Keep => self.keep_connection(fd),
                }
            }
            Ok(IoStep::WouldBlock) => {
                self.messages.push_front_response(fd, chunk);
            }
            Err(e) => {
                debug!("send to client {fd} failed: {e}");
                self.disconnect(fd);
            }
        }
    }

    fn keep_connection(&mut self, fd: RawFd) {
        if self.epoll.modify(fd, EPOLLIN).is_err() {
            self.disconnect(fd);
            return;
        }
        self.messages.touch(fd, Instant::now());
        self.messages.set_complete(fd, false);
        debug!("keep-alive: client {fd} ready for next request");

        // A pipelined request may already be sitting in the buffer.
        let buffered = self
            .messages
            .request_buf(fd)
            .map(|buf| !buf.is_empty())
            .unwrap_or(false);
        if buffered {
            self.run_engine(fd);
        }
    }

    // ---- timeout sweep ----

    fn sweep_timeouts(&mut self) {
        let expired = self.messages.expired(self.request_timeout, Instant::now());
        for (fd, complete) in expired {
            if complete {
                // Response delivery stalled on a slow reader; nothing a
                // timeout response could add.
                debug!("timeout: disconnecting client {fd}");
                self.disconnect(fd);
                continue;
            }
            // Abort an in-flight child before answering.
            if let Some(session) = self.cgi.remove(fd) {
                for pipe_fd in session.pipe_fds() {
                    self.epoll.delete(pipe_fd).ok();
                }
                self.cgi.dispose(session);
            }
            let bytes = self.engine.error_response(StatusCode::RequestTimeout);
            self.messages.push_front_response(
                fd,
                OutboundChunk {
                    state: ConnectionState::Close,
                    bytes,
                },
            );
            self.messages.set_complete(fd, true);
            if self.epoll.modify(fd, EPOLLOUT).is_err() {
                self.disconnect(fd);
                continue;
            }
            debug!("timeout: client {fd} queued 408");
        }
    }

    // ---- teardown ----

    /// Idempotent disconnect: read errors, write errors, and the timeout
    /// sweep may all race to close the same logical connection within one
    /// iteration. Removal order: event monitor, message store, routing
    /// client map, then the descriptor itself.
    fn disconnect(&mut self, fd: RawFd) {
        if !self.messages.contains(fd) {
            return;
        }
        if let Some(session) = self.cgi.remove(fd) {
            for pipe_fd in session.pipe_fds() {
                self.epoll.delete(pipe_fd).ok();
            }
            self.cgi.dispose(session);
        }
        self.epoll.delete(fd).ok();
        self.messages.remove(fd);
        self.routes.remove_client(fd);
        syscalls::close_fd(fd);
        debug!("disconnected client {fd}");
    }

    fn close_all(&mut self) {
        for fd in self.messages.client_fds() {
            self.disconnect(fd);
        }
        self.cgi.reap_pending();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::unix::net::UnixStream;

    fn test_server() -> Server {
        let config = Config::from_str(
            r#"
            [[server]]
            listen = ["127.0.0.1:0"]
            [[server.location]]
            prefix = "/"
            "#,
        )
        .unwrap();
        Server::new(&config).unwrap()
    }

    /// Wire a connected socket pair into the reactor as if accepted.
    fn attach_client(server: &mut Server) -> (RawFd, UnixStream) {
        use std::os::fd::IntoRawFd;
        let (ours, theirs) = UnixStream::pair().unwrap();
        let fd = ours.into_raw_fd();
        syscalls::set_nonblocking(fd).unwrap();
        let binding = server.routes.listen_addrs()[0];
        server.epoll.add(fd, EPOLLIN).unwrap();
        server.messages.insert(fd, Instant::now());
        server.routes.add_client(fd, binding);
        (fd, theirs)
    }

    fn chunk(state: ConnectionState, bytes: &[u8]) -> OutboundChunk {
        OutboundChunk {
            state,
            bytes: bytes.to_vec(),
        }
    }

    #[test]
    fn queued_chunks_arrive_in_fifo_order() {
        let mut server = test_server();
        let (fd, mut peer) = attach_client(&mut server);
        peer.set_nonblocking(false).unwrap();

        server
            .messages
            .push_response(fd, chunk(ConnectionState::Keep, b"alpha "));
        server
            .messages
            .push_response(fd, chunk(ConnectionState::Keep, b"beta "));
        server
            .messages
            .push_response(fd, chunk(ConnectionState::Keep, b"gamma"));

        while server.messages.has_responses(fd) {
            server.handle_client_write(fd);
        }

        let mut received = [0u8; 16];
        peer.read_exact(&mut received).unwrap();
        assert_eq!(&received, b"alpha beta gamma");
        // Keep-alive: the connection survives the drained queue.
        assert!(server.messages.contains(fd));
    }

    #[test]
    fn broken_pipe_removes_connection_exactly_once() {
        let mut server = test_server();
        let (fd, peer) = attach_client(&mut server);
        drop(peer);

        server
            .messages
            .push_response(fd, chunk(ConnectionState::Keep, b"never delivered"));
        server.handle_client_write(fd);
        assert!(!server.messages.contains(fd));
        assert!(server.routes.binding_of(fd).is_none());

        // Racing paths hitting the same fd again are no-ops.
        server.handle_client_write(fd);
        server.disconnect(fd);
        assert!(!server.messages.contains(fd));
    }

    #[test]
    fn close_state_disconnects_after_drain() {
        let mut server = test_server();
        let (fd, mut peer) = attach_client(&mut server);
        peer.set_nonblocking(false).unwrap();

        server
            .messages
            .push_response(fd, chunk(ConnectionState::Close, b"bye"));
        server.handle_client_write(fd);

        assert!(!server.messages.contains(fd));
        let mut received = Vec::new();
        peer.read_to_end(&mut received).unwrap();
        assert_eq!(received, b"bye");
    }

    #[test]
    fn timeout_sweep_answers_incomplete_requests() {
        let mut server = test_server();
        server.request_timeout = Duration::from_secs(1);
        let (fd, mut peer) = attach_client(&mut server);
        peer.set_nonblocking(false).unwrap();

        // Backdate the entry so the sweep sees it as stale.
        server.messages.remove(fd);
        server
            .messages
            .insert(fd, Instant::now() - Duration::from_secs(5));
        server.messages.append_request(fd, b"GET / HT");

        server.sweep_timeouts();
        assert!(server.messages.has_responses(fd));

        server.handle_client_write(fd);
        // 408 carries close semantics.
        assert!(!server.messages.contains(fd));
        let mut received = Vec::new();
        peer.read_to_end(&mut received).unwrap();
        let text = String::from_utf8_lossy(&received);
        assert!(text.starts_with("HTTP/1.1 408 Request Timeout"));
        assert!(text.contains("Connection: close"));
    }

    #[test]
    fn timeout_sweep_drops_clients_with_complete_requests() {
        let mut server = test_server();
        server.request_timeout = Duration::from_secs(1);
        let (fd, _peer) = attach_client(&mut server);

        server.messages.remove(fd);
        server
            .messages
            .insert(fd, Instant::now() - Duration::from_secs(5));
        server.messages.set_complete(fd, true);

        server.sweep_timeouts();
        assert!(!server.messages.contains(fd));
    }
}
