//! faultgate/src/admin.rs
//! HTTP control plane for mutating policies and reading counters.

use crate::policy::PolicyError;
use crate::state::ProxyState;
use crate::types::{LatencyRule, Phase, UnknownPhase};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Every recoverable failure surfaces to the caller as a 400 with the error
/// message as the body.
struct AdminError(String);

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        (StatusCode::BAD_REQUEST, self.0).into_response()
    }
}

impl From<PolicyError> for AdminError {
    fn from(e: PolicyError) -> Self {
        AdminError(e.to_string())
    }
}

impl From<UnknownPhase> for AdminError {
    fn from(e: UnknownPhase) -> Self {
        AdminError(e.to_string())
    }
}

impl From<humantime::DurationError> for AdminError {
    fn from(e: humantime::DurationError) -> Self {
        AdminError(format!("bad latency duration: {}", e))
    }
}

pub fn router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/whitelist/{host}/{action}", get(set_whitelist))
        .route("/whitelisted", get(whitelisted))
        .route("/blacklist/{host}/{action}", get(set_blacklist))
        .route("/blacklisted", get(blacklisted))
        .route("/set_latency/{host}/{phase}", get(set_latency))
        // Historical spelling, kept for compatibility with existing tooling.
        .route("/get_latancy/all/{phase}", get(all_latency))
        .route("/get_latancy/{host}/{phase}", get(get_latency))
        .route("/counters", get(counters))
        .route("/counters/reset", get(reset_counters))
        .route("/dependencies", get(dependencies))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: Arc<ProxyState>) -> std::io::Result<()> {
    axum::serve(listener, router(state)).await
}

async fn index() -> Json<Vec<&'static str>> {
    Json(vec![
        "/whitelist/{host}/{add|remove}",
        "/blacklist/{host}/{add|remove}",
        "/whitelisted",
        "/blacklisted",
        "/set_latency/{host}/per_remote_write?latency=100ms[&count=1]",
        "/set_latency/{host}/per_remote_read?latency=100ms[&count=1]",
        "/set_latency/{host}/per_remote_connect?latency=100ms[&count=1]",
        "/get_latancy/{host}/{phase}",
        "/get_latancy/all/{phase}",
        "/counters",
        "/counters/reset",
        "/dependencies",
    ])
}

#[derive(Deserialize)]
struct LatencyParams {
    latency: String,
    count: Option<i32>,
}

#[derive(Serialize)]
struct LatencyChange {
    host: String,
    ip: String,
    phase: String,
    latency: String,
    count: i32,
}

async fn set_latency(
    State(state): State<Arc<ProxyState>>,
    Path((host, phase)): Path<(String, String)>,
    Query(params): Query<LatencyParams>,
) -> Result<Json<LatencyChange>, AdminError> {
    let phase: Phase = phase.parse()?;
    let latency = humantime::parse_duration(&params.latency)?;
    let count = params.count.unwrap_or(-1);
    let ip = state.policy.set_latency(&host, phase, latency, count).await?;
    info!(%host, %ip, %phase, "set latency to {} (count {})", humantime::format_duration(latency), count);
    Ok(Json(LatencyChange {
        host,
        ip: ip.to_string(),
        phase: phase.to_string(),
        latency: humantime::format_duration(latency).to_string(),
        count,
    }))
}

#[derive(Serialize)]
struct LatencyLookup {
    host: String,
    ip: String,
    phase: String,
    latency: Option<String>,
    count: Option<i32>,
    found: bool,
}

async fn get_latency(
    State(state): State<Arc<ProxyState>>,
    Path((host, phase)): Path<(String, String)>,
) -> Result<Json<LatencyLookup>, AdminError> {
    let phase: Phase = phase.parse()?;
    let (ip, rule) = state.policy.get_latency(&host, phase).await?;
    Ok(Json(LatencyLookup {
        host,
        ip: ip.to_string(),
        phase: phase.to_string(),
        latency: rule.map(|r| humantime::format_duration(r.latency).to_string()),
        count: rule.map(|r| r.remaining),
        found: rule.is_some(),
    }))
}

async fn all_latency(
    State(state): State<Arc<ProxyState>>,
    Path(phase): Path<String>,
) -> Result<Json<HashMap<String, LatencyRule>>, AdminError> {
    let phase: Phase = phase.parse()?;
    Ok(Json(state.policy.latency_rules(phase)))
}

#[derive(Serialize)]
struct ListChange {
    host: String,
    ip: String,
    added: bool,
}

async fn set_whitelist(
    State(state): State<Arc<ProxyState>>,
    Path((host, action)): Path<(String, String)>,
) -> Result<Json<ListChange>, AdminError> {
    let add = action == "add";
    let ip = state.policy.set_whitelist(&host, add).await?;
    info!(%host, %ip, added = add, "whitelist updated");
    Ok(Json(ListChange {
        host,
        ip: ip.to_string(),
        added: add,
    }))
}

async fn set_blacklist(
    State(state): State<Arc<ProxyState>>,
    Path((host, action)): Path<(String, String)>,
) -> Result<Json<ListChange>, AdminError> {
    let add = action == "add";
    let ip = state.policy.set_blacklist(&host, add).await?;
    info!(%host, %ip, added = add, "blacklist updated");
    Ok(Json(ListChange {
        host,
        ip: ip.to_string(),
        added: add,
    }))
}

async fn whitelisted(State(state): State<Arc<ProxyState>>) -> Json<Vec<String>> {
    Json(state.policy.whitelisted())
}

async fn blacklisted(State(state): State<Arc<ProxyState>>) -> Json<Vec<String>> {
    Json(state.policy.blacklisted())
}

async fn counters(State(state): State<Arc<ProxyState>>) -> Json<HashMap<String, f64>> {
    Json(state.metrics.snapshot())
}

async fn reset_counters(State(state): State<Arc<ProxyState>>) -> Json<&'static str> {
    state.metrics.reset();
    Json("reset counters")
}

/// Every host the proxy has forwarded bytes to, extracted from the
/// `writes;host:port;Out` counter keys.
async fn dependencies(State(state): State<Arc<ProxyState>>) -> Json<Vec<String>> {
    let mut hosts = Vec::new();
    for key in state.metrics.snapshot().keys() {
        if key.contains("writes") && key.contains("Out") {
            if let Some(subject) = key.split(';').nth(1) {
                if let Some(host) = subject.split(':').next() {
                    hosts.push(host.to_string());
                }
            }
        }
    }
    Json(hosts)
}
