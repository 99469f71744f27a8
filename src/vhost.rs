// src/vhost.rs
use crate::config::{Config, LocationBlock, ServerBlock};
use crate::error::{ServerError, ServerResult};
use crate::http::{Method, StatusCode};
use crate::parser::Request;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct Redirect {
    pub status: u16,
    pub target: String,
}

/// One routing rule inside a virtual server. Matching is longest-prefix-wins
/// over the ordered location list; ties keep the earlier declaration.
#[derive(Debug, Clone)]
pub struct Location {
    pub prefix: String,
    pub alias: Option<String>,
    pub index: String,
    pub autoindex: bool,
    pub allowed_methods: Vec<Method>,
    pub redirect: Option<Redirect>,
    pub cgi_extension: Option<String>,
    pub upload_directory: Option<PathBuf>,
}

impl Location {
    fn from_config(block: &LocationBlock) -> Self {
        Self {
            prefix: block.prefix.clone(),
            alias: block.alias.clone(),
            index: block.index.clone(),
            autoindex: block.autoindex,
            allowed_methods: block
                .allowed_methods
                .iter()
                .map(|m| Method::from_name(m))
                .collect(),
            redirect: block.redirect.as_ref().map(|r| Redirect {
                status: r.status,
                target: r.target.clone(),
            }),
            cgi_extension: block.cgi_extension.clone(),
            upload_directory: block.upload_directory.clone().map(PathBuf::from),
        }
    }
}

/// Immutable routing unit selected by the Host header. Built once from
/// configuration and shared read-only by every in-flight request.
#[derive(Debug)]
pub struct VirtualServer {
    pub server_names: Vec<String>,
    pub locations: Vec<Location>,
    pub bindings: Vec<SocketAddr>,
    pub client_max_body_size: usize,
    pub error_pages: HashMap<u16, PathBuf>,
}

impl VirtualServer {
    fn from_config(block: &ServerBlock) -> ServerResult<Self> {
        let mut bindings: Vec<SocketAddr> = Vec::new();
        for listen in &block.listen {
            let resolved = listen
                .to_socket_addrs()
                .map_err(|e| ServerError::Config(format!("cannot resolve {listen}: {e}")))?;
            for addr in resolved {
                if bindings.contains(&addr) {
                    return Err(ServerError::Config(format!("duplicate host:port {addr}")));
                }
                bindings.push(addr);
            }
        }

        let mut error_pages = HashMap::new();
        for (status, page) in &block.error_pages {
            // Status keys were validated with the config.
            if let Ok(code) = status.parse::<u16>() {
                error_pages.insert(code, PathBuf::from(page));
            }
        }

        Ok(Self {
            server_names: block.server_names.clone(),
            locations: block.locations.iter().map(Location::from_config).collect(),
            bindings,
            client_max_body_size: block.client_max_body_size,
            error_pages,
        })
    }

    /// Longest matching prefix; declaration order breaks length ties.
    pub fn match_location(&self, target: &str) -> Option<&Location> {
        let mut matched: Option<&Location> = None;
        for location in &self.locations {
            if !target.starts_with(location.prefix.as_str()) {
                continue;
            }
            match matched {
                Some(best) if location.prefix.len() <= best.prefix.len() => {}
                _ => matched = Some(location),
            }
        }
        matched
    }
}

/// Everything the request engine needs after routing: the rewritten path and
/// the matched location's directives, plus the owning server for error pages.
#[derive(Debug, Clone)]
pub struct RouteDecision {
    pub server: Arc<VirtualServer>,
    pub path: String,
    pub index: String,
    pub autoindex: bool,
    pub allowed_methods: Vec<Method>,
    pub redirect: Option<Redirect>,
    pub cgi_extension: Option<String>,
    pub upload_directory: Option<PathBuf>,
}

/// All virtual servers, indexed by listening binding, plus the live
/// client-fd to binding map the reactor maintains across accept/disconnect.
pub struct RoutingTable {
    servers: Vec<Arc<VirtualServer>>,
    listeners: HashMap<SocketAddr, Vec<Arc<VirtualServer>>>,
    clients: HashMap<RawFd, SocketAddr>,
}

impl RoutingTable {
    /// Build the table. A resolved (address, port) pair claimed by two
    /// virtual servers is ambiguous and fatal. Per port, a wildcard-address
    /// binding collapses every specific binding into one listener whose
    /// candidate list keeps declaration order.
    pub fn new(config: &Config) -> ServerResult<Self> {
        let mut servers = Vec::with_capacity(config.servers.len());
        let mut claimed: HashMap<SocketAddr, usize> = HashMap::new();

        for block in &config.servers {
            let server = Arc::new(VirtualServer::from_config(block)?);
            for addr in &server.bindings {
                if claimed.insert(*addr, servers.len()).is_some() {
                    return Err(ServerError::Config(format!(
                        "binding {addr} claimed by more than one server"
                    )));
                }
            }
            servers.push(server);
        }

        let mut wildcard_ports: Vec<u16> = Vec::new();
        for server in &servers {
            for addr in &server.bindings {
                if addr.ip().is_unspecified() && !wildcard_ports.contains(&addr.port()) {
                    wildcard_ports.push(addr.port());
                }
            }
        }

        let mut listeners: HashMap<SocketAddr, Vec<Arc<VirtualServer>>> = HashMap::new();
        for server in &servers {
            for addr in &server.bindings {
                let listen_addr = if wildcard_ports.contains(&addr.port()) {
                    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), addr.port())
                } else {
                    *addr
                };
                let candidates = listeners.entry(listen_addr).or_default();
                if !candidates.iter().any(|vs| Arc::ptr_eq(vs, server)) {
                    candidates.push(server.clone());
                }
            }
        }

        Ok(Self {
            servers,
            listeners,
            clients: HashMap::new(),
        })
    }

    /// Addresses the ListenerSet must open, one socket each.
    pub fn listen_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.keys().copied().collect()
    }

    pub fn servers(&self) -> &[Arc<VirtualServer>] {
        &self.servers
    }

    pub fn add_client(&mut self, fd: RawFd, binding: SocketAddr) {
        self.clients.insert(fd, binding);
    }

    pub fn remove_client(&mut self, fd: RawFd) {
        self.clients.remove(&fd);
    }

    pub fn binding_of(&self, fd: RawFd) -> Option<SocketAddr> {
        self.clients.get(&fd).copied()
    }

    /// Virtual servers eligible for the binding this client arrived on.
    pub fn candidates_for_client(&self, fd: RawFd) -> Vec<Arc<VirtualServer>> {
        self.clients
            .get(&fd)
            .and_then(|addr| self.listeners.get(addr))
            .cloned()
            .unwrap_or_default()
    }

    /// Host-header selection: exact server-name match, else the first
    /// virtual server declared for the binding (the configured default).
    pub fn select_server<'a>(
        candidates: &'a [Arc<VirtualServer>],
        host: Option<&str>,
    ) -> Option<&'a Arc<VirtualServer>> {
        if let Some(host) = host {
            for server in candidates {
                if server.server_names.iter().any(|name| name == host) {
                    return Some(server);
                }
            }
        }
        candidates.first()
    }

    /// Full resolution for one complete request. The body-size gate runs
    /// after server selection and before any location matching.
    pub fn resolve(
        candidates: &[Arc<VirtualServer>],
        request: &Request<'_>,
    ) -> Result<RouteDecision, StatusCode> {
        let server = Self::select_server(candidates, request.host())
            .ok_or(StatusCode::InternalServerError)?;

        if let Some(length) = request.content_length() {
            if length > server.client_max_body_size {
                return Err(StatusCode::PayloadTooLarge);
            }
        }

        let location = server
            .match_location(request.target)
            .ok_or(StatusCode::NotFound)?;

        let path = match &location.alias {
            Some(alias) => request.target.replacen(location.prefix.as_str(), alias, 1),
            None => request.target.to_string(),
        };

        Ok(RouteDecision {
            server: server.clone(),
            path,
            index: location.index.clone(),
            autoindex: location.autoindex,
            allowed_methods: location.allowed_methods.clone(),
            redirect: location.redirect.clone(),
            cgi_extension: location.cgi_extension.clone(),
            upload_directory: location.upload_directory.clone(),
        })
    }
}
