//! Management surface the desktop shell talks to: route CRUD, global config,
//! and the remote model list helper.

use std::sync::Arc;

use axum::extract::{Path, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use anyproxy_common::{GlobalConfig, GlobalConfigPatch};
use anyproxy_core::{ProxyEngine, ProxyError};
use anyproxy_storage::{entities, RouteInput};

#[derive(Clone)]
pub struct AdminState {
    pub engine: Arc<ProxyEngine>,
}

pub fn admin_router(engine: Arc<ProxyEngine>) -> Router {
    let state = AdminState { engine };
    Router::new()
        .route("/routes", get(list_routes).post(create_route))
        .route("/routes/{id}", put(update_route).delete(delete_route))
        .route("/routes/fetch_models", post(fetch_models))
        .route("/config", get(get_config).put(update_config))
        .layer(middleware::from_fn_with_state(state.clone(), require_admin))
        .with_state(state)
}

async fn require_admin(State(state): State<AdminState>, req: Request, next: Next) -> Response {
    let expected = state.engine.state().config().local_credential.clone();
    if expected.is_empty() {
        return next.run(req).await;
    }
    let presented = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .and_then(|value| value.strip_prefix("Bearer "))
        .or_else(|| {
            req.headers()
                .get("x-api-key")
                .and_then(|value| value.to_str().ok())
        })
        .map(str::trim);
    if presented == Some(expected.as_str()) {
        return next.run(req).await;
    }
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "unauthorized"})),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct RoutePayload {
    display_name: String,
    logical_model: String,
    upstream_url: String,
    #[serde(default)]
    credential: Option<String>,
    #[serde(default)]
    group_name: Option<String>,
    format_tag: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl RoutePayload {
    fn validate(&self) -> Result<(), String> {
        if self.logical_model.trim().is_empty() {
            return Err("logical_model is required".to_string());
        }
        if self.upstream_url.trim().is_empty() {
            return Err("upstream_url is required".to_string());
        }
        if !matches!(self.format_tag.as_str(), "openai" | "anthropic" | "gemini") {
            return Err(format!("unknown format_tag '{}'", self.format_tag));
        }
        Ok(())
    }

    fn into_input(self) -> RouteInput {
        RouteInput {
            display_name: self.display_name,
            logical_model: self.logical_model.trim().to_string(),
            upstream_url: self.upstream_url.trim().to_string(),
            credential: self.credential.filter(|value| !value.is_empty()),
            group_name: self.group_name.filter(|value| !value.is_empty()),
            format_tag: self.format_tag,
            enabled: self.enabled,
        }
    }
}

fn route_json(route: &entities::routes::Model) -> serde_json::Value {
    json!({
        "id": route.id,
        "display_name": route.display_name,
        "logical_model": route.logical_model,
        "upstream_url": route.upstream_url,
        "credential": route.credential,
        "group_name": route.group_name,
        "format_tag": route.format_tag,
        "enabled": route.enabled,
        "created_at": route.created_at.unix_timestamp(),
        "updated_at": route.updated_at.unix_timestamp(),
    })
}

async fn list_routes(State(state): State<AdminState>) -> Response {
    match state.engine.storage().list_routes().await {
        Ok(routes) => {
            let routes: Vec<serde_json::Value> = routes.iter().map(route_json).collect();
            Json(json!({"routes": routes})).into_response()
        }
        Err(err) => storage_error(err),
    }
}

async fn create_route(
    State(state): State<AdminState>,
    Json(payload): Json<RoutePayload>,
) -> Response {
    if let Err(message) = payload.validate() {
        return bad_request(message);
    }
    match state.engine.storage().insert_route(payload.into_input()).await {
        Ok(route) => (StatusCode::CREATED, Json(route_json(&route))).into_response(),
        Err(err) => storage_error(err),
    }
}

async fn update_route(
    State(state): State<AdminState>,
    Path(id): Path<i64>,
    Json(payload): Json<RoutePayload>,
) -> Response {
    if let Err(message) = payload.validate() {
        return bad_request(message);
    }
    match state
        .engine
        .storage()
        .update_route(id, payload.into_input())
        .await
    {
        Ok(Some(route)) => Json(route_json(&route)).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "route not found"})),
        )
            .into_response(),
        Err(err) => storage_error(err),
    }
}

async fn delete_route(State(state): State<AdminState>, Path(id): Path<i64>) -> Response {
    match state.engine.storage().delete_route(id).await {
        Ok(true) => Json(json!({"deleted": true})).into_response(),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "route not found"})),
        )
            .into_response(),
        Err(err) => storage_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct FetchModelsPayload {
    api_url: String,
    #[serde(default)]
    api_key: Option<String>,
}

async fn fetch_models(
    State(state): State<AdminState>,
    Json(payload): Json<FetchModelsPayload>,
) -> Response {
    match state
        .engine
        .fetch_remote_models(&payload.api_url, payload.api_key.as_deref())
        .await
    {
        Ok(models) => Json(json!({"models": models})).into_response(),
        Err(ProxyError::UpstreamError { status, body }) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({
                "error": "upstream_error",
                "status": status,
                "detail": String::from_utf8_lossy(&body),
            })),
        )
            .into_response(),
        Err(err) => bad_request(err.to_string()),
    }
}

#[derive(Debug, Deserialize, Default)]
struct ConfigPayload {
    #[serde(default)]
    bind_host: Option<String>,
    #[serde(default)]
    bind_port: Option<u16>,
    #[serde(default)]
    local_credential: Option<String>,
    #[serde(default)]
    redirect_enabled: Option<bool>,
    #[serde(default)]
    redirect_keyword: Option<String>,
    #[serde(default)]
    redirect_target_model: Option<String>,
}

fn config_json(config: &GlobalConfig) -> serde_json::Value {
    json!({
        "bind_host": config.bind_host,
        "bind_port": config.bind_port,
        "local_credential": config.local_credential,
        "database_path": config.database_path,
        "redirect_enabled": config.redirect_enabled,
        "redirect_keyword": config.redirect_keyword,
        "redirect_target_model": config.redirect_target_model,
    })
}

async fn get_config(State(state): State<AdminState>) -> Response {
    Json(config_json(&state.engine.state().config())).into_response()
}

/// Patch, persist, and apply live. Bind address changes only take effect on
/// the next start.
async fn update_config(
    State(state): State<AdminState>,
    Json(payload): Json<ConfigPayload>,
) -> Response {
    let current = state.engine.state().config().as_ref().clone();
    let mut merged = GlobalConfigPatch::from(current);
    merged.overlay(GlobalConfigPatch {
        bind_host: payload.bind_host,
        bind_port: payload.bind_port,
        local_credential: payload.local_credential,
        database_path: None,
        redirect_enabled: payload.redirect_enabled,
        redirect_keyword: payload.redirect_keyword,
        redirect_target_model: payload.redirect_target_model,
    });
    let next = match merged.into_config() {
        Ok(next) => next,
        Err(err) => return bad_request(err.to_string()),
    };

    if let Err(err) = state.engine.storage().save_config(&next).await {
        return storage_error(err);
    }
    state.engine.state().apply_config(next.clone());
    Json(config_json(&next)).into_response()
}

fn bad_request(message: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": message})),
    )
        .into_response()
}

fn storage_error(err: impl std::fmt::Display) -> Response {
    tracing::error!(event = "admin_storage_error", error = %err);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "storage_error"})),
    )
        .into_response()
}
