//! `GET /`: a plain HTML dashboard listing live instances, refreshing
//! every 10 seconds via a meta tag — the source's dashboard interval,
//! distinct from C5's own 30-second index page (see DESIGN.md).

use std::fmt::Write;
use std::sync::Arc;

use axum::extract::State;
use axum::response::{Html, IntoResponse};

use crate::instance;
use crate::AppState;

const REFRESH_SECONDS: u32 = 10;

pub async fn handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let instances = instance::snapshot(&state.registry).await;

    let mut rows = String::new();
    for (event_code, uptime) in &instances {
        let _ = write!(
            rows,
            "<tr><td>{event_code}</td><td>{uptime}s</td><td><a href=\"/{event_code}/\">admin</a></td></tr>\n"
        );
    }
    if rows.is_empty() {
        rows = "<tr><td colspan=\"3\">no instances registered</td></tr>".to_string();
    }

    Html(format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta http-equiv="refresh" content="{REFRESH_SECONDS}">
<title>MatchBox relay</title>
</head>
<body>
<h1>MatchBox relay</h1>
<p>{count} instance(s) online</p>
<table border="1" cellpadding="4">
<tr><th>event code</th><th>uptime</th><th>link</th></tr>
{rows}
</table>
</body>
</html>
"#,
        count = instances.len(),
    ))
}
