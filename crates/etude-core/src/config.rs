// src/config.rs
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ServerError, ServerResult};
use crate::parser::DEFAULT_MAX_REQUEST_BYTES;
use crate::syscalls::EPOLLET;

/// Which sockets are registered edge-triggered.
///
/// Built from the numeric mode used on the command line:
/// `0` both level, `1` connections edge, `2` listener edge, `3` both edge.
/// Unknown codes fall back to both edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerMode {
    pub listen_edge: bool,
    pub conn_edge: bool,
}

impl TriggerMode {
    pub fn from_code(code: u8) -> Self {
        let (listen_edge, conn_edge) = match code {
            0 => (false, false),
            1 => (false, true),
            2 => (true, false),
            _ => (true, true),
        };
        Self {
            listen_edge,
            conn_edge,
        }
    }

    pub fn listen_flags(&self) -> u32 {
        if self.listen_edge { EPOLLET } else { 0 }
    }

    pub fn conn_flags(&self) -> u32 {
        if self.conn_edge { EPOLLET } else { 0 }
    }
}

impl Default for TriggerMode {
    fn default() -> Self {
        Self::from_code(3)
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    pub host: IpAddr,

    /// Listen port (default: 1316). `0` asks the kernel for a free port.
    pub port: u16,

    pub trigger_mode: TriggerMode,

    /// Idle timeout in milliseconds; `0` disables eviction (default: 60000)
    pub timeout_ms: u64,

    /// SO_LINGER on close (default: false)
    pub linger: bool,

    /// Worker threads (default: number of CPUs)
    pub threads: usize,

    /// Directory files are served from (default: ./resources)
    pub doc_root: PathBuf,

    /// Connections beyond this get "Server busy!" (default: 65536)
    pub max_connections: usize,

    /// Largest request head plus body accepted (default: 1 MiB)
    pub max_request_bytes: usize,

    /// Write logs to rolling files here instead of stdout
    pub log_dir: Option<PathBuf>,

    /// Pending log lines buffered before writers block (default: 1024)
    pub log_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 1316,
            trigger_mode: TriggerMode::default(),
            timeout_ms: 60_000,
            linger: false,
            threads: num_cpus::get(),
            doc_root: PathBuf::from("./resources"),
            max_connections: 65_536,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            log_dir: None,
            log_queue: 1024,
        }
    }
}

impl ServerConfig {
    /// Load configuration from `ETUDE_*` environment variables (with .env
    /// support). Unset or unparsable values keep their defaults.
    pub fn from_env() -> Self {
        // Load .env file if present (ignore errors if missing)
        let _ = dotenvy::dotenv();

        let defaults = Self::default();
        Self {
            host: env_parse("ETUDE_HOST").unwrap_or(defaults.host),
            port: env_parse("ETUDE_PORT").unwrap_or(defaults.port),
            trigger_mode: env_parse("ETUDE_TRIGGER_MODE")
                .map(TriggerMode::from_code)
                .unwrap_or(defaults.trigger_mode),
            timeout_ms: env_parse("ETUDE_TIMEOUT_MS").unwrap_or(defaults.timeout_ms),
            linger: std::env::var("ETUDE_LINGER")
                .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
                .unwrap_or(defaults.linger),
            threads: env_parse("ETUDE_THREADS").unwrap_or(defaults.threads),
            doc_root: std::env::var("ETUDE_DOC_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.doc_root),
            max_connections: env_parse("ETUDE_MAX_CONNECTIONS")
                .unwrap_or(defaults.max_connections),
            max_request_bytes: env_parse("ETUDE_MAX_REQUEST_BYTES")
                .unwrap_or(defaults.max_request_bytes),
            log_dir: std::env::var("ETUDE_LOG_DIR").ok().map(PathBuf::from),
            log_queue: env_parse("ETUDE_LOG_QUEUE").unwrap_or(defaults.log_queue),
        }
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> ServerResult<()> {
        if self.port != 0 && self.port < 1024 {
            return Err(ServerError::Config(format!(
                "port {} is outside 1024-65535",
                self.port
            )));
        }
        if self.threads == 0 {
            return Err(ServerError::Config("threads must be at least 1".into()));
        }
        if self.max_connections == 0 {
            return Err(ServerError::Config(
                "max_connections must be at least 1".into(),
            ));
        }
        if self.max_request_bytes == 0 {
            return Err(ServerError::Config(
                "max_request_bytes must be at least 1".into(),
            ));
        }
        if !self.doc_root.is_dir() {
            return Err(ServerError::Config(format!(
                "document root {} is not a directory",
                self.doc_root.display()
            )));
        }
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// `None` when idle eviction is disabled.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.trim().parse().ok()
}
