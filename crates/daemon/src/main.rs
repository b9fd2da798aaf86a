mod bus;
mod clip_extractor;
mod config;
mod core;
mod obs_proxy;
mod orchestrator;
mod recording_monitor;
mod session;
mod switcher_client;
mod sync_worker;
mod tunnel_client;
mod web;
mod ws;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::connect_info::IntoMakeServiceWithConnectInfo;
use tokio::net::TcpListener;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::core::Core;

struct CliArgs {
    config_path: PathBuf,
    cli_mode: bool,
    event_code: Option<String>,
    scoring_host: Option<String>,
    scoring_port: Option<u16>,
    switcher_host: Option<String>,
    switcher_port: Option<u16>,
    switcher_password: Option<String>,
}

/// Manual argv loop in the teacher's style (no CLI-parsing crate). A CLI
/// flag only overrides a config-file value when it differs from this
/// parser's own default, the same precedence the original daemon used so
/// an unspecified flag never clobbers an explicit config-file value.
fn parse_args() -> CliArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut out = CliArgs {
        config_path: PathBuf::from("./matchbox.json"),
        cli_mode: false,
        event_code: None,
        scoring_host: None,
        scoring_port: None,
        switcher_host: None,
        switcher_port: None,
        switcher_password: None,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    out.config_path = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--cli" => out.cli_mode = true,
            "--event-code" => {
                if i + 1 < args.len() {
                    out.event_code = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--scoring-host" => {
                if i + 1 < args.len() {
                    let v = args[i + 1].clone();
                    if v != "localhost" {
                        out.scoring_host = Some(v);
                    }
                    i += 1;
                }
            }
            "--scoring-port" => {
                if i + 1 < args.len() {
                    if let Ok(port) = args[i + 1].parse::<u16>() {
                        if port != 80 {
                            out.scoring_port = Some(port);
                        }
                    }
                    i += 1;
                }
            }
            "--obs-host" => {
                if i + 1 < args.len() {
                    let v = args[i + 1].clone();
                    if v != "localhost" {
                        out.switcher_host = Some(v);
                    }
                    i += 1;
                }
            }
            "--obs-port" => {
                if i + 1 < args.len() {
                    if let Ok(port) = args[i + 1].parse::<u16>() {
                        if port != 4455 {
                            out.switcher_port = Some(port);
                        }
                    }
                    i += 1;
                }
            }
            "--obs-password" => {
                if i + 1 < args.len() {
                    let v = args[i + 1].clone();
                    if !v.is_empty() {
                        out.switcher_password = Some(v);
                    }
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }
    out
}

fn apply_cli_overrides(config: &mut matchbox_protocol::MatchBoxConfig, args: &CliArgs) {
    if let Some(v) = &args.event_code {
        config.event_code = v.clone();
    }
    if let Some(v) = &args.scoring_host {
        config.scoring_host = v.clone();
    }
    if let Some(v) = args.scoring_port {
        config.scoring_port = v;
    }
    if let Some(v) = &args.switcher_host {
        config.switcher_host = v.clone();
    }
    if let Some(v) = args.switcher_port {
        config.switcher_port = v;
    }
    if let Some(v) = &args.switcher_password {
        config.switcher_password = v.clone();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();
    let mut cfg = config::load_config(&args.config_path)?;
    apply_cli_overrides(&mut cfg, &args);

    let bus = bus::Bus::new();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(bus::BusLayer::new(bus.clone()))
        .init();

    if let Err(issues) = cfg.validate() {
        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                tracing::error!("{issue}");
            } else {
                tracing::warn!("{issue}");
            }
        }
        if has_errors {
            tracing::error!("configuration has {} issue(s); fix and restart", issues.len());
            std::process::exit(1);
        }
    }

    if args.cli_mode && cfg.event_code.is_empty() {
        tracing::error!("--cli requires an event code (set --event-code or event_code in config)");
        std::process::exit(1);
    }

    tracing::info!(
        event_code = cfg.event_code,
        web_port = cfg.web_port,
        "starting matchboxd"
    );

    let core = Core::new(cfg.clone(), args.config_path.clone(), bus);
    if let Err(e) = core.scan_clips().await {
        tracing::warn!("initial clip scan failed: {e:#}");
    }

    let shutdown = Arc::new(AtomicBool::new(false));

    let orchestrator = Arc::new(orchestrator::Orchestrator::new());
    {
        let core = Arc::clone(&core);
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.run(core).await });
    }
    {
        let switcher = Arc::clone(&core.switcher);
        tokio::spawn(async move { switcher.run().await });
    }
    {
        let monitor = Arc::clone(&core.recording_monitor);
        let switcher = Arc::clone(&core.switcher);
        tokio::spawn(async move { monitor.run(switcher).await });
    }
    {
        let core = Arc::clone(&core);
        tokio::spawn(async move { tunnel_client::run(core).await });
    }
    {
        let core = Arc::clone(&core);
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move { sync_worker::run(core, shutdown).await });
    }

    {
        let core = Arc::clone(&core);
        let ws_addr: SocketAddr = format!("0.0.0.0:{}", cfg.web_port + 1)
            .parse()
            .context("invalid ws bind address")?;
        let ws_listener = TcpListener::bind(ws_addr)
            .await
            .with_context(|| format!("failed to bind ws listener to {ws_addr}"))?;
        tracing::info!("matchboxd bus listening on ws://{ws_addr}");
        tokio::spawn(async move {
            let router = ws::build_router(core);
            if let Err(e) = axum::serve(ws_listener, router).await {
                tracing::error!("ws listener failed: {e:#}");
            }
        });
    }

    let mdns_guard = match web::register_mdns(&cfg.mdns_name, cfg.web_port, &cfg.event_code) {
        Ok(daemon) => Some(daemon),
        Err(e) => {
            tracing::warn!("mDNS registration failed: {e:#}");
            None
        }
    };

    let session_secret = session::generate_session_secret();
    let app_state = Arc::new(web::AppState {
        core: Arc::clone(&core),
        session_secret,
    });
    let app = web::build_router(app_state)
        .into_make_service_with_connect_info::<SocketAddr>();

    let bind_addr: SocketAddr = format!("0.0.0.0:{}", cfg.web_port)
        .parse()
        .context("invalid bind address")?;
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind to {bind_addr}"))?;

    tracing::info!("matchboxd listening on http://{bind_addr}");
    serve_with_shutdown(listener, app, Arc::clone(&shutdown)).await?;

    shutdown.store(true, std::sync::atomic::Ordering::Relaxed);
    drop(mdns_guard);
    tracing::info!("matchboxd shut down cleanly");
    Ok(())
}

async fn serve_with_shutdown(
    listener: TcpListener,
    app: IntoMakeServiceWithConnectInfo<axum::Router, SocketAddr>,
    _shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("received SIGINT, shutting down");
                }
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, shutting down");
                }
            }
        })
        .await
        .context("server error")
}
