use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use etude_core::logging::{self, RollingLog};
use etude_core::{Reactor, ServerConfig, TriggerMode};

/// Values left unset fall back to `ETUDE_*` environment variables (and
/// `.env`), then to built-in defaults.
#[derive(Parser, Debug)]
#[command(name = "etude")]
#[command(about = "Serve a directory of static files over HTTP/1.1 with epoll")]
#[command(version)]
struct Args {
    /// Address to bind
    #[arg(long)]
    host: Option<IpAddr>,

    /// Port to listen on (1024-65535)
    #[arg(short, long)]
    port: Option<u16>,

    /// 0: level/level, 1: connections edge, 2: listener edge, 3: both edge
    #[arg(short = 'm', long, value_parser = clap::value_parser!(u8).range(0..=3))]
    trigger_mode: Option<u8>,

    /// Idle timeout in milliseconds, 0 disables
    #[arg(short, long)]
    timeout_ms: Option<u64>,

    /// Enable SO_LINGER on close
    #[arg(long)]
    linger: bool,

    /// Worker threads
    #[arg(short = 'j', long)]
    threads: Option<usize>,

    /// Directory to serve
    #[arg(short, long)]
    root: Option<PathBuf>,

    #[arg(long)]
    max_connections: Option<usize>,

    #[arg(long)]
    max_request_bytes: Option<usize>,

    /// Write rolling log files here instead of stdout
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Log lines buffered before writers fall back to direct writes
    #[arg(long)]
    log_queue: Option<usize>,
}

impl Args {
    fn apply(self, config: &mut ServerConfig) {
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(code) = self.trigger_mode {
            config.trigger_mode = TriggerMode::from_code(code);
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.timeout_ms = timeout_ms;
        }
        if self.linger {
            config.linger = true;
        }
        if let Some(threads) = self.threads {
            config.threads = threads;
        }
        if let Some(root) = self.root {
            config.doc_root = root;
        }
        if let Some(max) = self.max_connections {
            config.max_connections = max;
        }
        if let Some(max) = self.max_request_bytes {
            config.max_request_bytes = max;
        }
        if let Some(dir) = self.log_dir {
            config.log_dir = Some(dir);
        }
        if let Some(queue) = self.log_queue {
            config.log_queue = queue;
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = ServerConfig::from_env();
    args.apply(&mut config);

    // dropped after the reactor, so its shutdown lines are written out
    let _log_guard = match &config.log_dir {
        Some(dir) => {
            let log = RollingLog::new(dir, config.log_queue)
                .with_context(|| format!("failed to open log directory {}", dir.display()))?;
            Some(logging::init_logging_to(log))
        }
        None => {
            logging::init_logging();
            None
        }
    };

    let mut reactor = Reactor::new(config).context("failed to start server")?;

    let handle = reactor.shutdown_handle();
    ctrlc::set_handler(move || {
        tracing::info!("received interrupt, shutting down");
        handle.shutdown();
    })
    .context("failed to install Ctrl-C handler")?;

    reactor.run()?;
    Ok(())
}
