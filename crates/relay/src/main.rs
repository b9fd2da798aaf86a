//! C9: a separate binary that lets a daemon instance behind NAT expose
//! its local web server through one outbound tunnel connection.

mod dashboard;
mod instance;
mod proxy;
mod tunnel;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::{any, get};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use instance::Registry;

pub struct AppState {
    pub registry: Registry,
    pub admin_token: String,
}

struct CliArgs {
    port: u16,
    token: String,
    base_path: String,
}

/// Manual argv loop in the teacher's style (no CLI-parsing crate).
fn parse_args() -> CliArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut out = CliArgs {
        port: 8443,
        token: String::new(),
        base_path: String::new(),
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    if let Ok(p) = args[i + 1].parse() {
                        out.port = p;
                    }
                    i += 1;
                }
            }
            "--token" | "-t" => {
                if i + 1 < args.len() {
                    out.token = args[i + 1].clone();
                    i += 1;
                }
            }
            "--base-path" => {
                if i + 1 < args.len() {
                    out.base_path = args[i + 1].clone();
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }
    out
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = parse_args();
    if args.token.is_empty() {
        tracing::error!("--token is required: the relay refuses to run with no shared admin secret");
        std::process::exit(1);
    }

    let state = Arc::new(AppState {
        registry: instance::new_registry(),
        admin_token: args.token,
    });

    let base = args.base_path.trim_end_matches('/');
    let event_route = format!("{base}/{{event_code}}/{{*subpath}}");

    let app = Router::new()
        .route(&format!("{base}/"), get(dashboard::handler))
        .route(&format!("{base}/tunnel"), get(tunnel::handler))
        .route(&event_route, any(proxy::handler))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::clone(&state));

    let addr: SocketAddr = format!("0.0.0.0:{}", args.port)
        .parse()
        .context("invalid bind address")?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;

    tracing::info!("matchbox-relay listening on http://{addr}");
    axum::serve(listener, app)
        .await
        .context("relay server error")
}
