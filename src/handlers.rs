use crate::app::AppState;
use crate::error::{AppError, AppResult};
use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

fn model_object(id: &str) -> Value {
    json!({
        "id": id,
        "object": "model",
        "created": 1626777600,
        "owned_by": "relaygate",
        "root": id,
        "parent": null
    })
}

/// Models routable for the caller's group.
pub async fn list_models(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Response> {
    let caller = state
        .auth
        .authenticate_headers(&headers, &state.user_store)
        .await?;
    let data: Vec<Value> = state
        .channel_pool
        .models_for_group(caller.group())
        .iter()
        .map(|id| model_object(id))
        .collect();
    Ok(Json(json!({ "object": "list", "data": data })).into_response())
}

pub async fn retrieve_model(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(model): Path<String>,
) -> AppResult<Response> {
    let caller = state
        .auth
        .authenticate_headers(&headers, &state.user_store)
        .await?;
    let known = state
        .channel_pool
        .models_for_group(caller.group())
        .contains(&model);
    if !known {
        return Err(AppError::new(
            StatusCode::NOT_FOUND,
            "model_not_found",
            format!("The model '{model}' does not exist"),
        )
        .with_type("invalid_request_error")
        .with_param("model"));
    }
    Ok(Json(model_object(&model)).into_response())
}

pub async fn not_implemented() -> AppError {
    AppError::new(
        StatusCode::NOT_IMPLEMENTED,
        "api_not_implemented",
        "API not implemented",
    )
    .with_type("relaygate_error")
}

pub async fn not_found(method: Method, uri: Uri) -> AppError {
    AppError::new(
        StatusCode::NOT_FOUND,
        "not_found",
        format!("Invalid URL ({method} {})", uri.path()),
    )
    .with_type("invalid_request_error")
}
