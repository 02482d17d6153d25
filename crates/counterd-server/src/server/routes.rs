use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::{
    body::to_bytes,
    extract::{ConnectInfo, Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use super::AppState;
use crate::metrics;

const FORWARDED_FOR: &str = "X-Forwarded-For";

/// Largest request body `/dump` will read.
pub const MAX_DUMP_BODY: usize = 1024 * 1024;

/// Upper bound for `/debug/sleep`.
const MAX_SLEEP: Duration = Duration::from_secs(60);

/// Bump the counter and report who is asking.
pub async fn count(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> String {
    let count = state.count.fetch_add(1, Ordering::Relaxed) + 1;

    let mut body = format!("host: {}\ncount: {count}\nremote: {remote}\n", state.host);
    if let Some(fwd_for) = headers
        .get(FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        let _ = writeln!(body, "{FORWARDED_FOR}: {fwd_for}");
    }
    body
}

/// Log the full request and answer with an empty 200.
pub async fn dump(request: Request) -> impl IntoResponse {
    let (parts, body) = request.into_parts();

    let body = match to_bytes(body, MAX_DUMP_BODY).await {
        Ok(body) => body,
        Err(e) => {
            error!(error = %e, "Failed to read request body for dump");
            return (StatusCode::INTERNAL_SERVER_ERROR, "failed to dump request\n");
        }
    };

    let mut dump = format!("{} {} {:?}\n", parts.method, parts.uri, parts.version);
    for (name, value) in &parts.headers {
        let _ = writeln!(dump, "{}: {}", name, String::from_utf8_lossy(value.as_bytes()));
    }
    dump.push('\n');
    dump.push_str(&String::from_utf8_lossy(&body));

    info!(target: "counterd_server::dump", method = %parts.method, uri = %parts.uri, "{dump}");
    (StatusCode::OK, "")
}

pub async fn ping() -> &'static str {
    "OK\n"
}

/// Prometheus metrics endpoint.
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        metrics::render_metrics(&state),
    )
}

#[derive(Debug, Serialize)]
pub struct GenerationInfo {
    generation: u64,
    pid: u32,
    state: &'static str,
    listeners: Vec<String>,
    in_flight: usize,
    connections: usize,
}

/// Identity and load of the generation answering the request.
pub async fn generation(State(state): State<AppState>) -> Json<GenerationInfo> {
    let generation = &state.generation;
    Json(GenerationInfo {
        generation: generation.number(),
        pid: generation.pid(),
        state: generation.state().as_str(),
        listeners: generation
            .registry()
            .addresses()
            .iter()
            .map(ToString::to_string)
            .collect(),
        in_flight: generation.active_requests(),
        connections: generation.open_connections(),
    })
}

#[derive(Debug, Deserialize)]
pub struct SleepParams {
    #[serde(default)]
    ms: u64,
}

/// Hold the request open for a while, to observe drains with work in flight.
pub async fn sleep(Query(params): Query<SleepParams>) -> String {
    let duration = Duration::from_millis(params.ms).min(MAX_SLEEP);
    tokio::time::sleep(duration).await;
    format!("slept {}ms\n", duration.as_millis())
}
