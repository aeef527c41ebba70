//! fault-server
//!
//! An HTTP/HTTPS test double for exercising a network client against slow,
//! throttled, silent, broken and untrusted servers.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client Request
//!     ─────────────▶ net::listener ──▶ http::directives ──▶ http::routes / static_files
//!                    (keep-alive,      (delay, noCache,      (echo, redirect, no-reply,
//!                     idle timeout)     bytesPerSecond)       unexpected-close, files)
//!
//!     TLS Client
//!     ─────────────▶ net::tls (untrusted certificate) ──▶ "Hello!"
//!
//!     lifecycle::manager owns both listeners and the optional collaborator bridge.
//! ```

use std::path::PathBuf;

use clap::Parser;

use fault_server::config::{load_config, validate_config, ConfigError, ServerConfig};
use fault_server::observability::init_logging;
use fault_server::TestingServer;

#[derive(Parser)]
#[command(name = "fault-server")]
#[command(about = "HTTP/HTTPS test double with fault injection", long_about = None)]
struct Cli {
    /// TOML configuration file. Flags below override its values.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    host: Option<String>,

    /// Plain listener port (0 = OS-assigned).
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable the untrusted TLS listener on this port (0 = OS-assigned).
    #[arg(long)]
    bad_tls_port: Option<u16>,

    /// Directory served under /static.
    #[arg(long)]
    static_root: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    fn into_config(self) -> Result<ServerConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => ServerConfig::default(),
        };

        if let Some(host) = self.host {
            config.listener.listen_host = host;
        }
        if let Some(port) = self.port {
            config.listener.listen_port = port;
        }
        if let Some(port) = self.bad_tls_port {
            config.listener.bad_tls_listen_port = Some(port);
        }
        if let Some(root) = self.static_root {
            config.content.static_root = root;
        }
        if self.json_logs {
            config.observability.json_logs = true;
        }

        validate_config(&config).map_err(ConfigError::Validation)?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Cli::parse().into_config()?;
    init_logging(&config.observability)?;

    tracing::info!(
        host = %config.listener.listen_host,
        port = config.listener.listen_port,
        bad_tls_port = ?config.listener.bad_tls_listen_port,
        static_root = %config.content.static_root.display(),
        "Configuration loaded"
    );

    let mut server = TestingServer::new(config);
    server.start().await?;

    tracing::info!(
        address = %server.listen_addr()?,
        "Listening for connections, press Ctrl+C to stop"
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
    }

    server.stop().await?;
    tracing::info!("Shutdown complete");
    Ok(())
}
