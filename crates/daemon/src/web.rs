//! C5: the daemon's own local web server — clip/index serving, `/api/*`
//! JSON endpoints, an admin session gate with bundled static assets, and
//! mDNS advertisement.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Form, Path as AxumPath, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use matchbox_protocol::MatchBoxConfig;
use serde::Deserialize;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{info, warn};

use crate::session::{self, SESSION_COOKIE_NAME};

const ADMIN_ASSETS_DIR: &str = "assets/admin";
const OBS_WEB_ASSETS_DIR: &str = "assets/obs-web";
const INDEX_REFRESH_SECONDS: u32 = 30;

pub struct AppState {
    pub core: Arc<crate::core::Core>,
    pub session_secret: Vec<u8>,
}

/// Route table per spec §4.5: `/` and `/<filename>` are public (the clip
/// index and the clips themselves are meant to be glanced at from a phone
/// on the venue Wi-Fi without logging in), `/admin/_login` and
/// `/admin/_auth` are how a session cookie is obtained, and everything
/// else requires that cookie (or a loopback peer).
pub fn build_router(state: Arc<AppState>) -> Router {
    let authenticated = Router::new()
        .route("/api/status", get(get_status))
        .route("/api/config", get(get_config).put(put_config).post(put_config))
        .route("/api/clips", get(list_clips))
        .route("/api/start", post(start_orchestrator))
        .route("/api/stop", post(stop_orchestrator))
        .route("/api/sync/start", post(start_sync))
        .route("/api/sync/stop", post(stop_sync))
        .route("/api/tunnel/start", post(start_tunnel))
        .route("/api/tunnel/stop", post(stop_tunnel))
        .route("/api/configure-obs", post(configure_obs))
        .route("/api/save-config", post(save_config))
        .route("/admin/{*path}", get(serve_admin_static))
        .route("/obs-web/{*path}", get(serve_obs_web_static))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_session,
        ));

    let public = Router::new()
        .route("/", get(serve_index))
        .route("/admin/_login", get(admin_login_page))
        .route("/admin/_auth", post(admin_auth));

    authenticated
        .merge(public)
        .fallback(serve_clip)
        .layer(RequestBodyLimitLayer::new(10 * 1024 * 1024))
        .layer(middleware::from_fn(cors_and_options))
        .with_state(state)
}

/// Answers every `OPTIONS` preflight with 204 and stamps the fixed CORS
/// header set spec §4.5 requires on every response, authenticated or not.
async fn cors_and_options(req: axum::extract::Request, next: Next) -> Response {
    if req.method() == Method::OPTIONS {
        let mut resp = StatusCode::NO_CONTENT.into_response();
        apply_cors_headers(resp.headers_mut());
        return resp;
    }
    let mut resp = next.run(req).await;
    apply_cors_headers(resp.headers_mut());
    resp
}

fn apply_cors_headers(headers: &mut HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, PUT, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
}

/// Allows any request from `127.0.0.1`, or one presenting a valid,
/// unexpired `mb_session` cookie; everything else is rejected with 401,
/// per spec §5.
async fn require_session(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    jar: CookieJar,
    req: axum::extract::Request,
    next: Next,
) -> Response {
    if peer.ip().is_loopback() {
        return next.run(req).await;
    }

    let config = state.core.config_snapshot().await;
    let authorized = jar
        .get(SESSION_COOKIE_NAME)
        .map(|c| session::verify_session_cookie(&state.session_secret, &config.event_code, c.value()))
        .unwrap_or(false);

    if authorized {
        next.run(req).await
    } else {
        (StatusCode::UNAUTHORIZED, "session required").into_response()
    }
}

#[derive(Deserialize)]
struct AdminAuthRequest {
    password: String,
}

async fn admin_login_page() -> Response {
    Response::builder()
        .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
        .body(Body::from(
            "<!DOCTYPE html><html><head><title>MatchBox admin</title></head><body>\
             <form method=\"post\" action=\"/admin/_auth\">\
             <input type=\"password\" name=\"password\" placeholder=\"password\">\
             <button type=\"submit\">Log in</button></form></body></html>",
        ))
        .unwrap()
}

/// On success, sets the session cookie and redirects to `/admin/`; on
/// failure, reports the error without a cookie. Accepted as either the
/// instance's own `tunnel_password` or the compiled-in admin password,
/// gated by `tunnel_allow_admin` (spec §5).
async fn admin_auth(
    State(state): State<Arc<AppState>>,
    Form(req): Form<AdminAuthRequest>,
) -> Response {
    let config = state.core.config_snapshot().await;
    let ok = (!config.tunnel_password.is_empty() && req.password == config.tunnel_password)
        || (config.tunnel_allow_admin && session::verify_admin_password(&req.password));

    if !ok {
        return Json(serde_json::json!({"ok": false, "error": "invalid password"})).into_response();
    }

    let cookie_value = session::issue_session_cookie(&state.session_secret, &config.event_code);
    let jar = CookieJar::new().add(
        Cookie::build((SESSION_COOKIE_NAME, cookie_value))
            .path("/")
            .http_only(true)
            .build(),
    );
    let mut response = (jar, StatusCode::FOUND).into_response();
    response
        .headers_mut()
        .insert(header::LOCATION, HeaderValue::from_static("/admin/"));
    response
}

async fn get_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.core.status().await)
}

async fn get_config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let config = state.core.config_snapshot().await;
    let (_, warnings) = config.validate_report();
    Json(serde_json::json!({"config": config, "warnings": warnings}))
}

async fn put_config(
    State(state): State<Arc<AppState>>,
    Json(new_config): Json<MatchBoxConfig>,
) -> Response {
    if let Err(errors) = new_config.validate() {
        return (StatusCode::BAD_REQUEST, Json(serde_json::json!({"errors": errors}))).into_response();
    }
    match state.core.update_config(new_config).await {
        Ok(()) => Json(serde_json::json!({"ok": true})).into_response(),
        Err(e) => {
            warn!("failed to persist config: {e:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to save config").into_response()
        }
    }
}

/// Re-persists the currently held config, for an admin UI "save" button
/// that doesn't otherwise change any field.
async fn save_config(State(state): State<Arc<AppState>>) -> Response {
    let config = state.core.config_snapshot().await;
    match state.core.update_config(config).await {
        Ok(()) => Json(serde_json::json!({"ok": true})).into_response(),
        Err(e) => {
            warn!("failed to persist config: {e:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to save config").into_response()
        }
    }
}

#[derive(serde::Serialize)]
struct ClipEntry {
    name: String,
    size: u64,
    mtime: u64,
}

async fn list_clips(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if let Err(e) = state.core.scan_clips().await {
        warn!("clip scan failed: {e:#}");
    }
    let clips = state.core.clips().await;
    let mut entries = Vec::with_capacity(clips.len());
    for path in &clips {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let meta = tokio::fs::metadata(path).await.ok();
        let size = meta.as_ref().map(|m| m.len()).unwrap_or(0);
        let mtime = meta
            .and_then(|m| m.modified().ok())
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        entries.push(ClipEntry {
            name: name.to_string(),
            size,
            mtime,
        });
    }
    Json(entries)
}

async fn start_orchestrator(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.core.set_orchestrator_enabled(true).await;
    StatusCode::NO_CONTENT
}

async fn stop_orchestrator(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.core.set_orchestrator_enabled(false).await;
    StatusCode::NO_CONTENT
}

async fn start_tunnel(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.core.set_tunnel_enabled(true).await;
    StatusCode::NO_CONTENT
}

async fn stop_tunnel(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.core.set_tunnel_enabled(false).await;
    StatusCode::NO_CONTENT
}

async fn start_sync(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.core.set_sync_running(true).await;
    StatusCode::NO_CONTENT
}

async fn stop_sync(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.core.set_sync_running(false).await;
    StatusCode::NO_CONTENT
}

/// Pushes the switcher's field scenes per §4.3.1, overlaying the daemon's
/// own `/obs-web/overlay` page as each scene's browser source.
async fn configure_obs(State(state): State<Arc<AppState>>) -> Response {
    let config = state.core.config_snapshot().await;
    let overlay_url = format!("http://127.0.0.1:{}/obs-web/overlay", config.web_port);
    match state.core.configure_scenes(&overlay_url).await {
        Ok(()) => Json(serde_json::json!({"ok": true})).into_response(),
        Err(e) => {
            warn!("configure-obs failed: {e:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")).into_response()
        }
    }
}

async fn serve_admin_static(AxumPath(path): AxumPath<String>) -> Response {
    serve_bundled_static(ADMIN_ASSETS_DIR, &path).await
}

async fn serve_obs_web_static(AxumPath(path): AxumPath<String>) -> Response {
    serve_bundled_static(OBS_WEB_ASSETS_DIR, &path).await
}

/// Serves a file out of a bundled static asset directory, containment-
/// checked the same way clip serving is: the resolved path must still live
/// under the asset root after canonicalization.
async fn serve_bundled_static(base: &str, rel_path: &str) -> Response {
    let base_dir = Path::new(base);
    let requested = base_dir.join(rel_path);

    let canonical_base = match tokio::fs::canonicalize(base_dir).await {
        Ok(p) => p,
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    };
    let canonical_file = match tokio::fs::canonicalize(&requested).await {
        Ok(p) => p,
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    };
    if !canonical_file.starts_with(&canonical_base) {
        return StatusCode::FORBIDDEN.into_response();
    }

    match tokio::fs::read(&canonical_file).await {
        Ok(data) => Response::builder()
            .header(header::CONTENT_TYPE, content_type_for(&canonical_file))
            .body(Body::from(data))
            .unwrap(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("svg") => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

/// Serves the generated clip index at `/`, regenerating it first if it
/// doesn't exist yet (e.g. before the first clip or scan has run).
async fn serve_index(State(state): State<Arc<AppState>>) -> Response {
    let config = state.core.config_snapshot().await;
    let dir = config.clips_dir();
    let index_path = dir.join("index.html");
    if !tokio::fs::try_exists(&index_path).await.unwrap_or(false) {
        if let Err(e) = regenerate_index(&dir).await {
            warn!("failed to generate clip index: {e:#}");
        }
    }
    match tokio::fs::read(&index_path).await {
        Ok(data) => Response::builder()
            .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
            .body(Body::from(data))
            .unwrap(),
        Err(_) => (StatusCode::OK, axum::response::Html(empty_index_html())).into_response(),
    }
}

fn empty_index_html() -> String {
    format!(
        "<!DOCTYPE html>\n<html><head><meta http-equiv=\"refresh\" content=\"{INDEX_REFRESH_SECONDS}\">\
         <title>MatchBox clips</title></head><body><p>No clips yet.</p></body></html>\n"
    )
}

/// Rewrites `index.html` in `clips_dir` to list every `VIDEO_EXTENSIONS`
/// file present, newest first by modification time. Idempotent: running it
/// twice against an unchanged directory produces byte-identical output.
pub async fn regenerate_index(clips_dir: &Path) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(clips_dir).await?;

    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(clips_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            continue;
        };
        if !matchbox_protocol::config::VIDEO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) {
            continue;
        }
        let modified = entry
            .metadata()
            .await?
            .modified()
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
        files.push((path, modified));
    }
    files.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let mut rows = String::new();
    for (path, _) in &files {
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            use std::fmt::Write;
            let _ = write!(rows, "<li><a href=\"/{name}\">{name}</a></li>\n");
        }
    }

    let html = format!(
        "<!DOCTYPE html>\n<html><head><meta http-equiv=\"refresh\" content=\"{INDEX_REFRESH_SECONDS}\">\
         <title>MatchBox clips</title></head><body><ul>\n{rows}</ul></body></html>\n"
    );
    tokio::fs::write(clips_dir.join("index.html"), html).await?;
    Ok(())
}

/// Serve a clip file, honoring a single-range `Range: bytes=start-end`
/// request the way a video player's seek bar expects. Any range whose
/// start is past end-of-file (including `end >= size`, clamped rather
/// than rejected) returns 416. Used as the router's fallback so arbitrary
/// clip filenames don't need to be registered as explicit routes.
async fn serve_clip(State(state): State<Arc<AppState>>, uri: Uri, headers: HeaderMap) -> Response {
    let rel_path = uri.path().trim_start_matches('/');
    if rel_path.is_empty() || rel_path == "index.html" {
        return StatusCode::NOT_FOUND.into_response();
    }

    let config = state.core.config_snapshot().await;
    let full_path = config.clips_dir().join(rel_path);

    let canonical_dir = match tokio::fs::canonicalize(config.clips_dir()).await {
        Ok(p) => p,
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    };
    let canonical_file = match tokio::fs::canonicalize(&full_path).await {
        Ok(p) => p,
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    };
    if !canonical_file.starts_with(&canonical_dir) {
        return StatusCode::FORBIDDEN.into_response();
    }

    let data = match tokio::fs::read(&canonical_file).await {
        Ok(d) => d,
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    };
    let size = data.len() as u64;

    let Some(range_header) = headers.get(header::RANGE).and_then(|v| v.to_str().ok()) else {
        return Response::builder()
            .header(header::CONTENT_TYPE, "video/mp4")
            .header(header::ACCEPT_RANGES, "bytes")
            .body(Body::from(data))
            .unwrap();
    };

    match parse_range(range_header, size) {
        Some((start, end)) => {
            let chunk = data[start as usize..=end as usize].to_vec();
            Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_TYPE, "video/mp4")
                .header(header::ACCEPT_RANGES, "bytes")
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes {start}-{end}/{size}"),
                )
                .header(header::CONTENT_LENGTH, chunk.len())
                .body(Body::from(chunk))
                .unwrap()
        }
        None => Response::builder()
            .status(StatusCode::RANGE_NOT_SATISFIABLE)
            .header(header::CONTENT_RANGE, format!("bytes */{size}"))
            .body(Body::empty())
            .unwrap(),
    }
}

/// Parse a `bytes=start-end` range header against a file of `size` bytes.
/// `end` is clamped to `size - 1` when omitted or beyond EOF; `None` means
/// unsatisfiable (`start >= size`).
fn parse_range(header: &str, size: u64) -> Option<(u64, u64)> {
    let spec = header.strip_prefix("bytes=")?;
    let (start_str, end_str) = spec.split_once('-')?;
    let start: u64 = start_str.parse().ok()?;
    if start >= size {
        return None;
    }
    let end = if end_str.is_empty() {
        size - 1
    } else {
        end_str.parse::<u64>().ok()?.min(size - 1)
    };
    if end < start {
        return None;
    }
    Some((start, end))
}

/// Register `_http._tcp.local.` so `mdns_name` resolves on the venue LAN,
/// with the TXT properties a discovery client needs to find the right
/// event without a manual IP lookup. There is no precedent for mDNS in the
/// retrieval pack; see DESIGN.md.
pub fn register_mdns(
    mdns_name: &str,
    web_port: u16,
    event_code: &str,
) -> anyhow::Result<mdns_sd::ServiceDaemon> {
    let daemon = mdns_sd::ServiceDaemon::new()?;
    let host = format!("{}.", mdns_name.trim_end_matches('.'));

    let mut properties: HashMap<String, String> = HashMap::new();
    properties.insert("path".to_string(), "/".to_string());
    properties.insert("event".to_string(), event_code.to_string());
    properties.insert("service".to_string(), "matchbox".to_string());
    properties.insert(
        "description".to_string(),
        format!("MatchBox event-day automation ({event_code})"),
    );

    let info = mdns_sd::ServiceInfo::new(
        "_http._tcp.local.",
        mdns_name.trim_end_matches(".local"),
        &host,
        "",
        web_port,
        properties,
    )?
    .enable_addr_auto();
    daemon.register(info)?;
    info!(mdns_name, web_port, event_code, "registered mDNS service");
    Ok(daemon)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_full_file_when_end_omitted() {
        assert_eq!(parse_range("bytes=0-", 1000), Some((0, 999)));
    }

    #[test]
    fn range_explicit_bounds() {
        assert_eq!(parse_range("bytes=100-199", 1000), Some((100, 199)));
    }

    #[test]
    fn range_end_past_eof_is_clamped_not_rejected() {
        assert_eq!(parse_range("bytes=900-2000", 1000), Some((900, 999)));
    }

    #[test]
    fn range_start_past_eof_is_unsatisfiable() {
        assert_eq!(parse_range("bytes=1000-1001", 1000), None);
    }

    #[test]
    fn range_malformed_header_is_none() {
        assert_eq!(parse_range("not-a-range", 1000), None);
    }

    #[test]
    fn range_end_before_start_is_none() {
        assert_eq!(parse_range("bytes=500-100", 1000), None);
    }

    #[tokio::test]
    async fn regenerate_index_lists_video_files_newest_first() {
        let dir = std::env::temp_dir().join(format!("mb-web-index-test-{}", std::process::id()));
        let _ = tokio::fs::remove_dir_all(&dir).await;
        tokio::fs::create_dir_all(&dir).await.unwrap();

        tokio::fs::write(dir.join("old.mp4"), b"a").await.unwrap();
        tokio::fs::write(dir.join("not-a-clip.txt"), b"b").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        tokio::fs::write(dir.join("new.mp4"), b"c").await.unwrap();

        regenerate_index(&dir).await.unwrap();
        let html = tokio::fs::read_to_string(dir.join("index.html")).await.unwrap();

        assert!(html.contains("new.mp4"));
        assert!(html.contains("old.mp4"));
        assert!(!html.contains("not-a-clip.txt"));
        assert!(html.find("new.mp4").unwrap() < html.find("old.mp4").unwrap());
    }

    #[tokio::test]
    async fn regenerate_index_is_idempotent() {
        let dir = std::env::temp_dir().join(format!("mb-web-index-idem-{}", std::process::id()));
        let _ = tokio::fs::remove_dir_all(&dir).await;
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("clip.mp4"), b"x").await.unwrap();

        regenerate_index(&dir).await.unwrap();
        let first = tokio::fs::read_to_string(dir.join("index.html")).await.unwrap();
        regenerate_index(&dir).await.unwrap();
        let second = tokio::fs::read_to_string(dir.join("index.html")).await.unwrap();

        assert_eq!(first, second);
    }
}
