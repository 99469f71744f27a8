// src/config.rs
use crate::error::{ServerError, ServerResult};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

const DEFAULT_MAX_BODY_SIZE: usize = 1024 * 1024;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 3;

/// Whole-process configuration: an ordered list of virtual-server blocks.
///
/// ```toml
/// request_timeout_secs = 3
///
/// [[server]]
/// server_names = ["example.com"]
/// listen = ["127.0.0.1:8080"]
/// client_max_body_size = 1048576
///
/// [server.error_pages]
/// 404 = "/var/www/errors/404.html"
///
/// [[server.location]]
/// prefix = "/"
/// alias = "/var/www/html/"
/// index = "index.html"
/// allowed_methods = ["GET"]
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Seconds of inactivity before a connection is timed out.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(rename = "server")]
    pub servers: Vec<ServerBlock>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerBlock {
    #[serde(default)]
    pub server_names: Vec<String>,
    /// "host:port" bindings; hostnames are resolved at startup.
    pub listen: Vec<String>,
    #[serde(default = "default_max_body_size")]
    pub client_max_body_size: usize,
    /// Status code (as a TOML key) to error-page file path.
    #[serde(default)]
    pub error_pages: HashMap<String, String>,
    #[serde(rename = "location")]
    pub locations: Vec<LocationBlock>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocationBlock {
    /// Request-URI prefix this location matches; longest prefix wins.
    pub prefix: String,
    /// Filesystem substitution for the matched prefix.
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default = "default_index")]
    pub index: String,
    #[serde(default)]
    pub autoindex: bool,
    #[serde(default = "default_methods")]
    pub allowed_methods: Vec<String>,
    #[serde(default)]
    pub redirect: Option<RedirectBlock>,
    /// File extension (e.g. ".cgi") that routes a request to a CGI child.
    #[serde(default)]
    pub cgi_extension: Option<String>,
    #[serde(default)]
    pub upload_directory: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedirectBlock {
    pub status: u16,
    pub target: String,
}

fn default_request_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_max_body_size() -> usize {
    DEFAULT_MAX_BODY_SIZE
}

fn default_index() -> String {
    "index.html".to_string()
}

fn default_methods() -> Vec<String> {
    vec!["GET".to_string()]
}

impl Config {
    /// Load and validate a configuration file. Any failure here is fatal to
    /// startup; no socket is opened before the whole file checks out.
    pub fn load(path: &Path) -> ServerResult<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| ServerError::Config(format!("{}: {}", path.display(), e)))?;
        let config: Config =
            toml::from_str(&raw).map_err(|e| ServerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_str(raw: &str) -> ServerResult<Self> {
        let config: Config =
            toml::from_str(raw).map_err(|e| ServerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> ServerResult<()> {
        if self.servers.is_empty() {
            return Err(ServerError::Config("no server blocks defined".to_string()));
        }
        for server in &self.servers {
            server.validate()?;
        }
        Ok(())
    }
}

impl ServerBlock {
    fn validate(&self) -> ServerResult<()> {
        if self.listen.is_empty() {
            return Err(ServerError::Config(
                "server block has no listen directive".to_string(),
            ));
        }
        if self.locations.is_empty() {
            return Err(ServerError::Config(
                "server block has no locations".to_string(),
            ));
        }
        for (status, _) in &self.error_pages {
            let code: u16 = status.parse().map_err(|_| {
                ServerError::Config(format!("invalid error_pages status: {status}"))
            })?;
            if !(300..600).contains(&code) {
                return Err(ServerError::Config(format!(
                    "error_pages status out of range: {code}"
                )));
            }
        }
        for location in &self.locations {
            location.validate()?;
        }
        Ok(())
    }
}

impl LocationBlock {
    fn validate(&self) -> ServerResult<()> {
        if !self.prefix.starts_with('/') {
            return Err(ServerError::Config(format!(
                "location prefix must start with '/': {}",
                self.prefix
            )));
        }
        if let Some(redirect) = &self.redirect {
            if !(300..400).contains(&redirect.status) {
                return Err(ServerError::Config(format!(
                    "redirect status must be 3xx: {}",
                    redirect.status
                )));
            }
        }
        if let Some(ext) = &self.cgi_extension {
            if !ext.starts_with('.') || ext.len() < 2 {
                return Err(ServerError::Config(format!(
                    "cgi_extension must look like '.ext': {ext}"
                )));
            }
        }
        Ok(())
    }
}
