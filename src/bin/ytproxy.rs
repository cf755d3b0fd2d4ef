#![forbid(unsafe_code)]

//! HTTP entry point: resolves settings, wires the search provider and the
//! media resolver into the router, and serves until Ctrl+C.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use ytproxy::{
    config::{SettingsOverrides, resolve_settings},
    http::{AppState, build_router},
    resolver::ResolverHandle,
    search::YtDlpSearch,
    security::ensure_not_root,
};

const DEFAULT_LOG_FILTER: &str = "ytproxy=info,tower_http=info";

/// Search YouTube and stream audio/video downloads through a local API.
#[derive(Debug, Parser)]
#[command(name = "ytproxy", version)]
struct Args {
    /// Address to listen on (overrides YTPROXY_HOST).
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on (overrides YTPROXY_PORT).
    #[arg(long)]
    port: Option<u16>,
    /// Directory holding the web UI (overrides WWW_ROOT).
    #[arg(long)]
    www_root: Option<PathBuf>,
    /// Path to the yt-dlp executable (overrides YTPROXY_YTDLP).
    #[arg(long = "yt-dlp")]
    yt_dlp: Option<PathBuf>,
    /// Path to the ffmpeg executable (overrides YTPROXY_FFMPEG).
    #[arg(long)]
    ffmpeg: Option<PathBuf>,
    /// Alternate .env file.
    #[arg(long)]
    env_file: Option<PathBuf>,
}

impl Args {
    fn into_overrides(self) -> SettingsOverrides {
        SettingsOverrides {
            www_root: self.www_root,
            host: self.host,
            port: self.port,
            yt_dlp: self.yt_dlp,
            ffmpeg: self.ffmpeg,
            env_path: self.env_file,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let args = Args::parse();
    ensure_not_root("ytproxy")?;

    let settings = resolve_settings(args.into_overrides())?;
    let host = parse_host(&settings.host)?;

    if !settings.www_root.is_dir() {
        warn!(
            "web root {} does not exist; only the API will be served",
            settings.www_root.display()
        );
    }

    let state = AppState {
        resolver: Arc::new(ResolverHandle::yt_dlp(settings.tools.clone())),
        search: Arc::new(YtDlpSearch::new(settings.tools.clone())),
        www_root: Arc::new(settings.www_root.clone()),
    };
    let app = build_router(state, &settings.allowed_origins);

    let addr = SocketAddr::new(host, settings.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!("listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!("failed to install Ctrl+C handler: {err}");
    }
}

fn parse_host(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/YTPROXY_HOST")
}
