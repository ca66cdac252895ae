//! Veilproxy - Main entry point
//!
//! A transparent HTTP reverse proxy: every request is forwarded to one fixed
//! backend origin, and HTML responses are rewritten so the backend's absolute
//! URLs point at the public hostname instead.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use url::Url;
use veilproxy::{ProxyConfig, ProxyServer, DEFAULT_BACKEND_ORIGIN};

/// Veilproxy - A transparent HTTP reverse proxy with HTML rewriting
#[derive(Parser, Debug)]
#[command(name = "veilproxy")]
#[command(author = "Veilproxy Contributors")]
#[command(version = "0.1.0")]
#[command(about = "A transparent HTTP reverse proxy with HTML rewriting")]
struct Args {
    /// HTTP port to listen on
    #[arg(long, env = "HTTP_PORT", default_value = "8080")]
    http_port: u16,

    /// Backend origin every request is forwarded to
    #[arg(long, env = "BACKEND_URL", default_value = DEFAULT_BACKEND_ORIGIN)]
    backend: Url,

    /// Do not force the Referer header to the backend origin
    #[arg(long, env = "NO_REFERER", default_value = "false")]
    no_referer: bool,

    /// Connect timeout for the outbound client, in seconds
    #[arg(long, env = "CONNECT_TIMEOUT_SECS", default_value = "10")]
    connect_timeout_secs: u64,

    /// How long to wait for backend response headers, in seconds
    #[arg(long, env = "DISPATCH_TIMEOUT_SECS", default_value = "30")]
    dispatch_timeout_secs: u64,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting Veilproxy v0.1.0");
    info!("HTTP port: {}", args.http_port);
    info!("Backend origin: {}", args.backend);

    // Create proxy configuration
    let config = ProxyConfig {
        port: args.http_port,
        backend: args.backend,
        set_referer: !args.no_referer,
        connect_timeout: Duration::from_secs(args.connect_timeout_secs),
        dispatch_timeout: Duration::from_secs(args.dispatch_timeout_secs),
    };

    // Create and run proxy server
    let server = Arc::new(ProxyServer::new(config)?);

    info!("Veilproxy started successfully");

    server.run().await?;

    Ok(())
}
