//! Control-panel request handlers
//!
//! Thin JSON front-end over the store and reconciler. Mutation handlers
//! apply the change to the store, answer the client, and trigger a
//! background mutation reconcile; reconciliation errors surface through the
//! same `{success, message}` envelope the panel renders as notifications.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::error;

use super::AppState;
use crate::error::StoreError;
use crate::logbuf::LogEntry;
use crate::rules::RuleStats;
use crate::store::Bundle;

/// Response envelope shared by all endpoints
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            message: None,
        })
    }
}

impl ApiResponse<()> {
    fn ok_message(msg: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            data: None,
            message: Some(msg.into()),
        })
    }

    fn error(msg: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: false,
            data: None,
            message: Some(msg.into()),
        })
    }
}

type ApiError = (StatusCode, Json<ApiResponse<()>>);

fn store_error(err: StoreError) -> ApiError {
    let status = match &err {
        StoreError::BundleNotFound(_) | StoreError::SelectorNotFound { .. } => {
            StatusCode::NOT_FOUND
        }
        StoreError::BundleExists(_) | StoreError::SelectorExists { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, ApiResponse::error(err.to_string()))
}

// ==================== Requests ====================

#[derive(Debug, Deserialize)]
pub struct CreateBundleRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SelectorRequest {
    pub value: String,
}

// ==================== Status ====================

#[derive(Debug, Serialize)]
pub struct Status {
    pub version: &'static str,
    pub mode: String,
    pub proxy_active: bool,
    pub tracked_domains: usize,
    pub tracked_addresses: usize,
    pub rules: RuleStats,
    pub bundles: usize,
    pub enabled_selectors: usize,
}

pub async fn status(State(state): State<Arc<AppState>>) -> Json<ApiResponse<Status>> {
    let (tracked_domains, tracked_addresses) = state.tracker.count();
    let bundles = state.store.list().map(|b| b.len()).unwrap_or(0);
    let enabled_selectors = state
        .store
        .enabled_selectors()
        .map(|s| s.len())
        .unwrap_or(0);

    ApiResponse::ok(Status {
        version: crate::VERSION,
        mode: state.reconciler.mode().name().to_string(),
        proxy_active: state.reconciler.mode().is_active(&state.cancel).await,
        tracked_domains,
        tracked_addresses,
        rules: state.matcher.stats(),
        bundles,
        enabled_selectors,
    })
}

pub async fn logs(State(state): State<Arc<AppState>>) -> Json<ApiResponse<Vec<LogEntry>>> {
    ApiResponse::ok(state.logbuf.entries())
}

// ==================== Bundles ====================

pub async fn list_bundles(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ApiResponse<Vec<Bundle>>>, ApiError> {
    let bundles = state.store.list().map_err(store_error)?;
    Ok(ApiResponse::ok(bundles))
}

pub async fn get_bundle(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<ApiResponse<Bundle>>, ApiError> {
    let bundle = state.store.get(&name).map_err(store_error)?;
    Ok(ApiResponse::ok(bundle))
}

pub async fn create_bundle(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateBundleRequest>,
) -> Result<Json<ApiResponse<()>>, ApiError> {
    if req.name.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            ApiResponse::error("name is required"),
        ));
    }

    let mut bundle = Bundle::new(req.name);
    bundle.description = req.description;
    bundle.source = req.source;
    state.store.create(bundle).map_err(store_error)?;

    state.trigger_mutation();
    Ok(ApiResponse::ok_message("bundle created"))
}

pub async fn delete_bundle(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<ApiResponse<()>>, ApiError> {
    state.store.delete(&name).map_err(store_error)?;
    state.trigger_mutation();
    Ok(ApiResponse::ok_message("bundle deleted"))
}

pub async fn enable_bundle(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<ApiResponse<()>>, ApiError> {
    state.store.set_enabled(&name, true).map_err(store_error)?;
    state.trigger_mutation();
    Ok(ApiResponse::ok_message("bundle enabled"))
}

pub async fn disable_bundle(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<ApiResponse<()>>, ApiError> {
    state.store.set_enabled(&name, false).map_err(store_error)?;
    state.trigger_mutation();
    Ok(ApiResponse::ok_message("bundle disabled"))
}

// ==================== Selectors ====================

pub async fn add_selector(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(req): Json<SelectorRequest>,
) -> Result<Json<ApiResponse<()>>, ApiError> {
    if req.value.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            ApiResponse::error("value is required"),
        ));
    }
    state
        .store
        .add_selector(&name, &req.value)
        .map_err(store_error)?;
    state.trigger_mutation();
    Ok(ApiResponse::ok_message("selector added"))
}

pub async fn remove_selector(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(req): Json<SelectorRequest>,
) -> Result<Json<ApiResponse<()>>, ApiError> {
    state
        .store
        .remove_selector(&name, &req.value)
        .map_err(store_error)?;
    state.trigger_mutation();
    Ok(ApiResponse::ok_message("selector removed"))
}

// ==================== Import / export ====================

pub async fn export(State(state): State<Arc<AppState>>) -> Result<String, ApiError> {
    state.store.export().map_err(store_error)
}

pub async fn import(
    State(state): State<Arc<AppState>>,
    body: String,
) -> Result<Json<ApiResponse<()>>, ApiError> {
    state.store.import(&body).map_err(store_error)?;
    state.trigger_mutation();
    Ok(ApiResponse::ok_message("bundles imported"))
}

// ==================== Actions ====================

pub async fn apply(State(state): State<Arc<AppState>>) -> Result<Json<ApiResponse<()>>, ApiError> {
    match state.reconciler.reconcile(&state.cancel).await {
        Ok(()) => Ok(ApiResponse::ok_message("reconcile complete")),
        Err(e) => {
            error!(error = %e, "reconcile via control panel failed");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiResponse::error(e.to_string()),
            ))
        }
    }
}
