// src/cgi.rs
use crate::error::ServerResult;
use crate::syscalls::{self, IoStep};
use std::collections::HashMap;
use std::ffi::CString;
use std::io;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use tracing::debug;

/// Everything needed to invoke one CGI script: the filesystem path of the
/// script, the meta-variable environment, and the request body destined for
/// the child's standard input.
#[derive(Debug, Clone)]
pub struct CgiRequest {
    pub script_path: PathBuf,
    pub meta_variables: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Result of feeding one chunk of request body to the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedOutcome {
    Progress,
    /// Body fully delivered (or the child stopped reading). The caller
    /// deregisters the returned descriptor, then calls `close_stdin`.
    Drained(RawFd),
}

/// Result of draining one chunk of child output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Progress,
    /// End-of-stream: the accumulated output is the complete response body.
    Eof,
    Failed,
}

/// One in-flight CGI child: process handle, pipe ends owned by the parent,
/// pending request body, and the accumulated response bytes.
pub struct CgiSession {
    client_fd: RawFd,
    pid: libc::pid_t,
    stdin_fd: Option<RawFd>,
    stdout_fd: Option<RawFd>,
    body: Vec<u8>,
    body_sent: usize,
    output: Vec<u8>,
    keep_alive: bool,
}

fn build_env(meta_variables: &[(String, String)]) -> ServerResult<Vec<CString>> {
    meta_variables
        .iter()
        .map(|(name, value)| {
            CString::new(format!("{name}={value}"))
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL in CGI env").into())
        })
        .collect()
}

impl CgiSession {
    /// Fork the script with its stdio wired to fresh pipes.
    ///
    /// The request pipe exists only when the request carries a body. The
    /// child's pipe ends are closed in the parent immediately after the fork
    /// so end-of-stream is observable once the child exits; the parent's
    /// ends go non-blocking and are handed to the reactor.
    pub fn spawn(request: &CgiRequest, client_fd: RawFd, keep_alive: bool) -> ServerResult<Self> {
        let script = CString::new(request.script_path.as_os_str().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL in script path"))?;
        let argv = vec![script.clone()];
        let envp = build_env(&request.meta_variables)?;

        let (out_read, out_write) = syscalls::create_pipe()?;
        let body_pipe = if request.body.is_empty() {
            None
        } else {
            match syscalls::create_pipe() {
                Ok(pair) => Some(pair),
                Err(e) => {
                    syscalls::close_fd(out_read);
                    syscalls::close_fd(out_write);
                    return Err(e);
                }
            }
        };

        let child_stdin = body_pipe.map(|(read_end, _)| read_end);
        let mut close_in_child = vec![out_read];
        if let Some((_, write_end)) = body_pipe {
            close_in_child.push(write_end);
        }

        let pid = match syscalls::spawn_process(
            &script,
            &argv,
            &envp,
            child_stdin,
            out_write,
            &close_in_child,
        ) {
            Ok(pid) => pid,
            Err(e) => {
                syscalls::close_fd(out_read);
                syscalls::close_fd(out_write);
                if let Some((read_end, write_end)) = body_pipe {
                    syscalls::close_fd(read_end);
                    syscalls::close_fd(write_end);
                }
                return Err(e);
            }
        };

        // Parent keeps only its own ends, non-blocking.
        syscalls::close_fd(out_write);
        let stdin_fd = body_pipe.map(|(read_end, write_end)| {
            syscalls::close_fd(read_end);
            write_end
        });

        let ends: Vec<RawFd> = stdin_fd.iter().copied().chain([out_read]).collect();
        for fd in ends {
            if let Err(e) = syscalls::set_nonblocking(fd) {
                syscalls::close_fd(out_read);
                if let Some(fd) = stdin_fd {
                    syscalls::close_fd(fd);
                }
                syscalls::kill_process(pid);
                syscalls::reap_nonblocking(pid);
                return Err(e);
            }
        }

        debug!("spawned CGI pid {pid} for client {client_fd}");
        Ok(Self {
            client_fd,
            pid,
            stdin_fd,
            stdout_fd: Some(out_read),
            body: request.body.clone(),
            body_sent: 0,
            output: Vec::new(),
            keep_alive,
        })
    }

    pub fn client_fd(&self) -> RawFd {
        self.client_fd
    }

    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn stdin_fd(&self) -> Option<RawFd> {
        self.stdin_fd
    }

    pub fn stdout_fd(&self) -> Option<RawFd> {
        self.stdout_fd
    }

    pub fn is_stdin(&self, fd: RawFd) -> bool {
        self.stdin_fd == Some(fd)
    }

    /// Write the next slice of request body into the child. A broken pipe
    /// (child exited without reading everything) ends the feed quietly; the
    /// response side decides the session's fate.
    pub fn feed_stdin(&mut self) -> FeedOutcome {
        let Some(fd) = self.stdin_fd else {
            return FeedOutcome::Progress;
        };
        let remaining = &self.body[self.body_sent..];
        if remaining.is_empty() {
            return FeedOutcome::Drained(fd);
        }
        match syscalls::write_nonblocking(fd, remaining) {
            Ok(IoStep::Done(n)) => {
                self.body_sent += n;
                if self.body_sent >= self.body.len() {
                    FeedOutcome::Drained(fd)
                } else {
                    FeedOutcome::Progress
                }
            }
            Ok(IoStep::WouldBlock) => FeedOutcome::Progress,
            Err(e) => {
                debug!("CGI stdin write failed for pid {}: {e}", self.pid);
                FeedOutcome::Drained(fd)
            }
        }
    }

    /// Close the write pipe; this is the child's end-of-input signal. Call
    /// only after the descriptor has left the event monitor.
    pub fn close_stdin(&mut self) {
        if let Some(fd) = self.stdin_fd.take() {
            syscalls::close_fd(fd);
        }
    }

    /// Append one chunk of child output. Zero bytes is end-of-stream and
    /// completes the relay regardless of whether the child has been reaped.
    pub fn drain_stdout(&mut self, chunk: &mut [u8]) -> RelayOutcome {
        let Some(fd) = self.stdout_fd else {
            return RelayOutcome::Failed;
        };
        match syscalls::read_nonblocking(fd, chunk) {
            Ok(IoStep::Done(0)) => RelayOutcome::Eof,
            Ok(IoStep::Done(n)) => {
                self.output.extend_from_slice(&chunk[..n]);
                RelayOutcome::Progress
            }
            Ok(IoStep::WouldBlock) => RelayOutcome::Progress,
            Err(e) => {
                debug!("CGI stdout read failed for pid {}: {e}", self.pid);
                RelayOutcome::Failed
            }
        }
    }

    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.output)
    }

    /// Pipe descriptors still owned by the session.
    pub fn pipe_fds(&self) -> Vec<RawFd> {
        self.stdin_fd.iter().chain(self.stdout_fd.iter()).copied().collect()
    }
}

/// All live CGI sessions, keyed by owning client, with the reverse pipe-fd
/// index the dispatcher uses. Both directions are updated together so a
/// pipe never points at a session that is gone.
pub struct CgiRegistry {
    sessions: HashMap<RawFd, CgiSession>,
    pipe_owners: HashMap<RawFd, RawFd>,
    reap_queue: Vec<libc::pid_t>,
}

impl CgiRegistry {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            pipe_owners: HashMap::new(),
            reap_queue: Vec::new(),
        }
    }

    pub fn insert(&mut self, session: CgiSession) {
        let client_fd = session.client_fd();
        for fd in session.pipe_fds() {
            self.pipe_owners.insert(fd, client_fd);
        }
        self.sessions.insert(client_fd, session);
    }

    pub fn owner_of(&self, pipe_fd: RawFd) -> Option<RawFd> {
        self.pipe_owners.get(&pipe_fd).copied()
    }

    pub fn is_pipe(&self, fd: RawFd) -> bool {
        self.pipe_owners.contains_key(&fd)
    }

    pub fn session(&self, client_fd: RawFd) -> Option<&CgiSession> {
        self.sessions.get(&client_fd)
    }

    pub fn session_mut(&mut self, client_fd: RawFd) -> Option<&mut CgiSession> {
        self.sessions.get_mut(&client_fd)
    }

    /// Drop the reverse mapping for a pipe the session no longer owns
    /// (request pipe drained and closed).
    pub fn forget_pipe(&mut self, pipe_fd: RawFd) {
        self.pipe_owners.remove(&pipe_fd);
    }

    /// Detach a session and both directions of its lookup entries. The
    /// caller deregisters the returned session's descriptors, then hands it
    /// to `dispose`.
    pub fn remove(&mut self, client_fd: RawFd) -> Option<CgiSession> {
        let session = self.sessions.remove(&client_fd)?;
        self.pipe_owners.retain(|_, owner| *owner != client_fd);
        Some(session)
    }

    /// Close remaining pipe ends and settle the child: reap it if it has
    /// exited, otherwise kill it and queue the pid so the loop's reap pass
    /// collects it exactly once.
    pub fn dispose(&mut self, session: CgiSession) {
        for fd in session.pipe_fds() {
            syscalls::close_fd(fd);
        }
        let pid = session.pid();
        if !syscalls::reap_nonblocking(pid) {
            syscalls::kill_process(pid);
            self.reap_queue.push(pid);
        }
    }

    /// One non-blocking pass over pids still owed a reap.
    pub fn reap_pending(&mut self) {
        self.reap_queue.retain(|&pid| !syscalls::reap_nonblocking(pid));
    }

    pub fn client_fds(&self) -> Vec<RawFd> {
        self.sessions.keys().copied().collect()
    }
}

impl Default for CgiRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_entries_are_name_value_pairs() {
        let env = build_env(&[
            ("REQUEST_METHOD".to_string(), "POST".to_string()),
            ("SCRIPT_NAME".to_string(), "/cgi-bin/echo.cgi".to_string()),
        ])
        .unwrap();

        assert_eq!(env[0].to_str().unwrap(), "REQUEST_METHOD=POST");
        assert_eq!(env[1].to_str().unwrap(), "SCRIPT_NAME=/cgi-bin/echo.cgi");
    }

    #[test]
    fn env_rejects_interior_nul() {
        assert!(build_env(&[("X".to_string(), "a\0b".to_string())]).is_err());
    }

    fn spawn_true(client_fd: RawFd, body: &[u8]) -> CgiSession {
        let request = CgiRequest {
            script_path: "/bin/sh".into(),
            meta_variables: vec![("REQUEST_METHOD".to_string(), "GET".to_string())],
            body: body.to_vec(),
        };
        CgiSession::spawn(&request, client_fd, true).unwrap()
    }

    #[test]
    fn registry_maps_both_directions_transactionally() {
        let mut registry = CgiRegistry::new();
        let session = spawn_true(9, b"payload");
        let stdin_fd = session.stdin_fd().unwrap();
        let stdout_fd = session.stdout_fd().unwrap();

        registry.insert(session);
        assert_eq!(registry.owner_of(stdin_fd), Some(9));
        assert_eq!(registry.owner_of(stdout_fd), Some(9));
        assert!(registry.is_pipe(stdout_fd));
        assert!(registry.session(9).is_some());

        let session = registry.remove(9).unwrap();
        assert_eq!(registry.owner_of(stdin_fd), None);
        assert_eq!(registry.owner_of(stdout_fd), None);
        assert!(registry.session(9).is_none());
        registry.dispose(session);
        registry.reap_pending();
    }

    #[test]
    fn body_only_requests_get_a_stdin_pipe() {
        let mut registry = CgiRegistry::new();

        let session = spawn_true(1, b"");
        assert!(session.stdin_fd().is_none());
        registry.insert(session);

        let session = spawn_true(2, b"data");
        assert!(session.stdin_fd().is_some());
        registry.insert(session);

        for fd in [1, 2] {
            let session = registry.remove(fd).unwrap();
            registry.dispose(session);
        }
        registry.reap_pending();
    }
}
