//! # tetherd
//!
//! Tether server binary: loads configuration, installs logging and metrics,
//! registers the built-in handlers and serves WebSocket clients until
//! ctrl-c.

#![deny(unsafe_code)]

mod demo;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tether_core::logging::{LogFormat, init_subscriber};
use tether_server::config::{ServerConfig, load_config};
use tether_server::{HttpServer, Server, metrics};

/// How long in-flight tasks get after ctrl-c.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Tether real-time server.
#[derive(Parser, Debug)]
#[command(name = "tetherd", about = "Tether real-time server")]
struct Cli {
    /// Host to bind (overrides config).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides config).
    #[arg(long)]
    port: Option<u16>,

    /// Path to a JSON config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Default log filter, e.g. `info` or `tether_server=debug` (`RUST_LOG` wins).
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format: `compact` or `json`.
    #[arg(long)]
    log_format: Option<LogFormat>,
}

impl Cli {
    /// Lay command-line flags over the loaded config.
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(level) = &self.log_level {
            config.log_level.clone_from(level);
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }
    }
}

fn resolve_config(args: &Cli) -> Result<ServerConfig> {
    let mut config = load_config(args.config.as_deref()).context("Failed to load config")?;
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let config = resolve_config(&args)?;
    init_subscriber(&config.log_level, config.log_format);

    let metrics_handle = match metrics::install_recorder() {
        Ok(handle) => Some(handle),
        Err(err) => {
            tracing::warn!(error = %err, "metrics disabled");
            None
        }
    };

    let server = Server::new();
    demo::register(&server);
    let method_count = server.methods().methods().len();
    let publication_count = server.publications().publications().len();

    let http = HttpServer::new(config, server, metrics_handle);
    let (addr, handle) = http.listen().await.context("Failed to bind server")?;

    tracing::info!(
        "tetherd listening on ws://{addr}{} ({method_count} methods, {publication_count} publications)",
        http.config().ws_path
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    http.shutdown()
        .graceful_shutdown(http.server(), vec![handle], Some(SHUTDOWN_TIMEOUT))
        .await;

    tracing::info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn cli_defaults_leave_config_untouched() {
        let cli = Cli::parse_from(["tetherd"]);
        let mut config = ServerConfig::default();
        cli.apply(&mut config);
        assert_eq!(config, ServerConfig::default());
    }

    #[test]
    fn cli_flags_override_config() {
        let cli = Cli::parse_from([
            "tetherd",
            "--host",
            "0.0.0.0",
            "--port",
            "3000",
            "--log-level",
            "debug",
            "--log-format",
            "json",
        ]);
        let mut config = ServerConfig::default();
        cli.apply(&mut config);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn cli_rejects_unknown_log_format() {
        assert!(Cli::try_parse_from(["tetherd", "--log-format", "xml"]).is_err());
    }

    #[test]
    fn config_file_then_flags() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"port": 4000, "max_connections": 8}}"#).unwrap();
        let cli = Cli::parse_from([
            "tetherd",
            "--config",
            file.path().to_str().unwrap(),
            "--port",
            "5000",
        ]);
        let config = resolve_config(&cli).unwrap();
        assert_eq!(config.port, 5000);
        assert_eq!(config.max_connections, 8);
    }

    #[tokio::test]
    async fn server_graceful_shutdown() {
        let server = Server::new();
        demo::register(&server);
        let http = HttpServer::new(ServerConfig::default(), server, None);
        let (_, handle) = http.listen().await.unwrap();

        http.shutdown().shutdown();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("shutdown timed out")
            .expect("join error");
    }
}
