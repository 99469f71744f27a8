// src/listener.rs
use crate::error::{ServerError, ServerResult};
use crate::syscalls;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::RawFd;

/// The listening sockets, one per collapsed (address, port) binding.
///
/// Accepted client descriptors are tagged with the binding they arrived on
/// so routing can recover the eligible virtual-server candidates later.
pub struct ListenerSet {
    sockets: HashMap<RawFd, SocketAddr>,
}

impl ListenerSet {
    /// Open every binding, or fail startup with nothing left open.
    pub fn bind(addrs: &[SocketAddr]) -> ServerResult<Self> {
        let mut sockets = HashMap::new();
        for addr in addrs {
            match syscalls::create_listen_socket(addr) {
                Ok(fd) => {
                    tracing::info!("listening on {addr}");
                    sockets.insert(fd, *addr);
                }
                Err(e) => {
                    for fd in sockets.keys() {
                        syscalls::close_fd(*fd);
                    }
                    return Err(ServerError::Startup(format!("cannot listen on {addr}: {e}")));
                }
            }
        }
        Ok(Self { sockets })
    }

    pub fn is_listen_fd(&self, fd: RawFd) -> bool {
        self.sockets.contains_key(&fd)
    }

    pub fn addr_of(&self, fd: RawFd) -> Option<SocketAddr> {
        self.sockets.get(&fd).copied()
    }

    pub fn fds(&self) -> Vec<RawFd> {
        self.sockets.keys().copied().collect()
    }
}

impl Drop for ListenerSet {
    fn drop(&mut self) {
        for fd in self.sockets.keys() {
            syscalls::close_fd(*fd);
        }
    }
}
