use axum::{
    body::{Body, Bytes},
    extract::{Extension, Query},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use dlqt_oauth2::{Access, Authority};
use dlqt_tower::{Authenticated, Gateway, RouteTable, TerseErrorHandler};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tower_http::trace::TraceLayer;

use crate::config::Scopes;

/// The requirement each protected route imposes
pub fn route_table(scopes: &Scopes) -> RouteTable {
    RouteTable::new()
        .with_route(Method::POST, "/check-auth", Access::Identified)
        .with_route(Method::GET, "/fetch", Access::Grant(scopes.fetch.clone()))
        .with_route(Method::PATCH, "/retrigger", Access::Grant(scopes.retrigger.clone()))
        .with_route(Method::POST, "/purge", Access::Grant(scopes.purge.clone()))
}

/// The API router, with every route but `/healthz` behind the gateway
pub fn router(authority: Authority, scopes: &Scopes) -> Router {
    let gateway: Gateway<TerseErrorHandler<Body>> = Gateway::new(authority, route_table(scopes));

    Router::new()
        .route("/check-auth", post(check_auth))
        .route("/fetch", get(fetch))
        .route("/retrigger", patch(retrigger))
        .route("/purge", post(purge))
        .layer(gateway.into_layer())
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Default, Deserialize)]
struct QueueTarget {
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    queue: String,
}

#[derive(Debug, Deserialize)]
struct RetriggerRequest {
    #[serde(rename = "message-id")]
    message_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct Confirmation {
    authorized: bool,
    #[serde(rename = "userID")]
    user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    action: Option<&'static str>,
    namespace: String,
    queue: String,
    #[serde(rename = "messageID", skip_serializing_if = "Option::is_none")]
    message_id: Option<String>,
    timestamp: String,
}

impl Confirmation {
    fn new(
        caller: &Authenticated,
        action: Option<&'static str>,
        target: QueueTarget,
    ) -> Result<Self, ApiError> {
        Ok(Self {
            authorized: true,
            user_id: caller.principal().to_string(),
            scope: caller.grant().map(|g| g.as_str().to_owned()),
            action,
            namespace: target.namespace,
            queue: target.queue,
            message_id: None,
            timestamp: OffsetDateTime::now_utc().format(&Rfc3339)?,
        })
    }
}

#[derive(Debug, Error)]
enum ApiError {
    #[error("request body is not valid JSON")]
    InvalidJson(#[source] serde_json::Error),
    #[error("message-id not provided")]
    MissingMessageId,
    #[error("unable to format timestamp")]
    Timestamp(#[from] time::error::Format),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let error: &dyn std::error::Error = &self;
        match &self {
            Self::InvalidJson(_) => {
                tracing::debug!(error, "bad request");
                (StatusCode::BAD_REQUEST, "invalid JSON").into_response()
            }
            Self::MissingMessageId => {
                tracing::debug!(error, "bad request");
                (StatusCode::BAD_REQUEST, "message-id not provided").into_response()
            }
            Self::Timestamp(_) => {
                tracing::error!(error, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
            }
        }
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn check_auth(
    Extension(caller): Extension<Authenticated>,
    body: Bytes,
) -> Result<Json<Confirmation>, ApiError> {
    let target: QueueTarget = serde_json::from_slice(&body).map_err(ApiError::InvalidJson)?;

    tracing::info!(
        principal = %caller.principal(),
        namespace = %target.namespace,
        queue = %target.queue,
        "authorization checked"
    );
    Confirmation::new(&caller, None, target).map(Json)
}

async fn fetch(
    Extension(caller): Extension<Authenticated>,
    Query(target): Query<QueueTarget>,
) -> Result<Json<Confirmation>, ApiError> {
    tracing::info!(
        principal = %caller.principal(),
        namespace = %target.namespace,
        queue = %target.queue,
        "fetch authorized"
    );
    Confirmation::new(&caller, Some("fetch"), target).map(Json)
}

async fn retrigger(
    Extension(caller): Extension<Authenticated>,
    Query(target): Query<QueueTarget>,
    body: Bytes,
) -> Result<Json<Confirmation>, ApiError> {
    let request: RetriggerRequest = serde_json::from_slice(&body).map_err(ApiError::InvalidJson)?;
    let message_id = request.message_id.ok_or(ApiError::MissingMessageId)?;

    tracing::info!(
        principal = %caller.principal(),
        namespace = %target.namespace,
        queue = %target.queue,
        message_id = %message_id,
        "retrigger authorized"
    );

    let mut confirmation = Confirmation::new(&caller, Some("retrigger"), target)?;
    confirmation.message_id = Some(message_id);
    Ok(Json(confirmation))
}

async fn purge(
    Extension(caller): Extension<Authenticated>,
    Query(target): Query<QueueTarget>,
) -> Result<Json<Confirmation>, ApiError> {
    tracing::info!(
        principal = %caller.principal(),
        namespace = %target.namespace,
        queue = %target.queue,
        "purge authorized"
    );
    Confirmation::new(&caller, Some("purge"), target).map(Json)
}
