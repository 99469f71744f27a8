// src/syscalls.rs
use crate::error::ServerResult;
use libc::{c_char, c_int, c_void, socklen_t};
use std::ffi::CString;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::ptr;

/// Outcome of a non-blocking read or write.
///
/// `WouldBlock` is "nothing to do this iteration", never an error. A read
/// that returns `Done(0)` is end-of-stream: the peer closed a socket, or
/// every write end of a pipe is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStep {
    Done(usize),
    WouldBlock,
}

// ---- Socket Operations ----

/// Create a non-blocking TCP listening socket bound to `addr`.
///
/// SO_REUSEADDR is set so restarts do not trip over TIME_WAIT remnants.
pub fn create_listen_socket(addr: &SocketAddr) -> ServerResult<c_int> {
    let domain = if addr.is_ipv6() {
        libc::AF_INET6
    } else {
        libc::AF_INET
    };

    unsafe {
        let fd = libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        );
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let one: c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        bind_addr(fd, addr)?;

        if libc::listen(fd, libc::SOMAXCONN) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        Ok(fd)
    }
}

fn bind_addr(fd: c_int, addr: &SocketAddr) -> ServerResult<()> {
    unsafe {
        match addr {
            SocketAddr::V4(a) => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: a.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(a.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                if libc::bind(
                    fd,
                    &sin as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin) as socklen_t,
                ) < 0
                {
                    let err = io::Error::last_os_error();
                    libc::close(fd);
                    return Err(err.into());
                }
            }
            SocketAddr::V6(a) => {
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: a.port().to_be(),
                    sin6_flowinfo: a.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: a.ip().octets(),
                    },
                    sin6_scope_id: a.scope_id(),
                };
                if libc::bind(
                    fd,
                    &sin6 as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin6) as socklen_t,
                ) < 0
                {
                    let err = io::Error::last_os_error();
                    libc::close(fd);
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }
}

/// Accept one pending connection, already in non-blocking mode.
///
/// Returns `Ok(None)` when no connection is waiting.
pub fn accept_connection(listen_fd: c_int) -> ServerResult<Option<c_int>> {
    unsafe {
        let fd = libc::accept4(
            listen_fd,
            ptr::null_mut(),
            ptr::null_mut(),
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        );

        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else {
            Ok(Some(fd))
        }
    }
}

// ---- Non-blocking I/O ----

pub fn read_nonblocking(fd: c_int, buf: &mut [u8]) -> ServerResult<IoStep> {
    unsafe {
        let res = libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len());
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(IoStep::WouldBlock)
            } else {
                Err(err.into())
            }
        } else {
            Ok(IoStep::Done(res as usize))
        }
    }
}

/// Send on a socket. MSG_NOSIGNAL turns a broken pipe into an EPIPE error
/// instead of a process-killing SIGPIPE.
pub fn send_nonblocking(fd: c_int, buf: &[u8]) -> ServerResult<IoStep> {
    unsafe {
        let res = libc::send(
            fd,
            buf.as_ptr() as *const c_void,
            buf.len(),
            libc::MSG_NOSIGNAL,
        );
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(IoStep::WouldBlock)
            } else {
                Err(err.into())
            }
        } else {
            Ok(IoStep::Done(res as usize))
        }
    }
}

/// Plain write for pipe descriptors.
pub fn write_nonblocking(fd: c_int, buf: &[u8]) -> ServerResult<IoStep> {
    unsafe {
        let res = libc::write(fd, buf.as_ptr() as *const c_void, buf.len());
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(IoStep::WouldBlock)
            } else {
                Err(err.into())
            }
        } else {
            Ok(IoStep::Done(res as usize))
        }
    }
}

pub fn set_nonblocking(fd: c_int) -> ServerResult<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok(())
}

pub fn close_fd(fd: c_int) {
    unsafe {
        libc::close(fd);
    }
}

// ---- Pipes and child processes ----

/// Create a pipe. Returns (read_fd, write_fd), both blocking; the parent
/// flips its own ends to non-blocking after the fork so the child's standard
/// streams stay in blocking mode. Close-on-exec keeps pipe ends out of
/// sibling CGI children; dup2 onto the standard streams clears the flag for
/// the ends a child actually uses.
pub fn create_pipe() -> ServerResult<(c_int, c_int)> {
    let mut fds = [0 as c_int; 2];
    unsafe {
        if libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok((fds[0], fds[1]))
}

/// Fork and exec `script` with the given argv/env.
///
/// In the child, `stdin_fd` (when present) and `stdout_fd` are moved onto
/// the standard streams and every other passed descriptor is closed before
/// `execve`. The child never returns from this call: on exec failure it
/// `_exit`s immediately so no parent code runs in the forked image.
/// `close_in_child` lists parent-side descriptors the child must not inherit.
pub fn spawn_process(
    script: &CString,
    argv: &[CString],
    envp: &[CString],
    stdin_fd: Option<c_int>,
    stdout_fd: c_int,
    close_in_child: &[c_int],
) -> ServerResult<libc::pid_t> {
    let mut argv_ptrs: Vec<*const c_char> = argv.iter().map(|s| s.as_ptr()).collect();
    argv_ptrs.push(ptr::null());
    let mut envp_ptrs: Vec<*const c_char> = envp.iter().map(|s| s.as_ptr()).collect();
    envp_ptrs.push(ptr::null());

    unsafe {
        let pid = libc::fork();
        if pid < 0 {
            return Err(io::Error::last_os_error().into());
        }
        if pid == 0 {
            // Child: only async-signal-safe calls between fork and execve.
            if let Some(in_fd) = stdin_fd {
                if libc::dup2(in_fd, libc::STDIN_FILENO) < 0 {
                    libc::_exit(127);
                }
                libc::close(in_fd);
            }
            if libc::dup2(stdout_fd, libc::STDOUT_FILENO) < 0 {
                libc::_exit(127);
            }
            libc::close(stdout_fd);
            for &fd in close_in_child {
                libc::close(fd);
            }
            libc::execve(
                script.as_ptr(),
                argv_ptrs.as_ptr() as *const *const c_char,
                envp_ptrs.as_ptr() as *const *const c_char,
            );
            libc::_exit(127);
        }
        Ok(pid)
    }
}

/// Non-blocking reap. Returns true once the pid has been collected (or is
/// already gone), false while the child is still running.
pub fn reap_nonblocking(pid: libc::pid_t) -> bool {
    unsafe {
        let mut status: c_int = 0;
        let res = libc::waitpid(pid, &mut status, libc::WNOHANG);
        res == pid || (res < 0 && io::Error::last_os_error().raw_os_error() == Some(libc::ECHILD))
    }
}

pub fn kill_process(pid: libc::pid_t) {
    unsafe {
        libc::kill(pid, libc::SIGKILL);
    }
}

/// Broken connections surface as EPIPE results, never as a fatal signal.
pub fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

// ---- Epoll Operations ----

pub use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, epoll_event};

/// Level-triggered epoll wrapper. Events carry the watched descriptor in
/// `u64`; ownership of what that descriptor means (listener, client, CGI
/// pipe) lives with the caller.
pub struct Epoll {
    fd: c_int,
}

impl Epoll {
    pub fn new() -> ServerResult<Self> {
        unsafe {
            let fd = libc::epoll_create1(libc::EPOLL_CLOEXEC);
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(Self { fd })
        }
    }

    pub fn add(&self, fd: c_int, interests: i32) -> ServerResult<()> {
        let mut event = epoll_event {
            events: interests as u32,
            u64: fd as u64,
        };
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_ADD, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    pub fn modify(&self, fd: c_int, interests: i32) -> ServerResult<()> {
        let mut event = epoll_event {
            events: interests as u32,
            u64: fd as u64,
        };
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_MOD, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    pub fn delete(&self, fd: c_int) -> ServerResult<()> {
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                let err = io::Error::last_os_error();
                // A descriptor that was never registered is not worth failing over.
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    /// Block until readiness. An interrupted wait reports zero events so the
    /// caller simply restarts its iteration; any other failure is fatal.
    pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> ServerResult<usize> {
        unsafe {
            let res = libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as c_int,
                timeout_ms,
            );

            if res < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    return Ok(0);
                }
                return Err(err.into());
            }

            Ok(res as usize)
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
