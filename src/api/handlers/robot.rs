//! Signed chat-robot webhook for order review.
//!
//! The body is authenticated with a hex HMAC-SHA256 over the raw bytes before it is parsed, so
//! the handler reads `Bytes` instead of going through [`JsonBody`](crate::api::gateway::JsonBody).

use crate::api::{
    HandlerDeps,
    error::{ApiError, ApiResult},
    handlers::{dto::OkResponse, orders::conflict_as},
};
use crate::signature::verify_hmac;
use axum::{Json, body::Bytes, extract::Extension, http::HeaderMap};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};
use utoipa::ToSchema;

const ENABLED_SETTING: &str = "robot_webhook_enabled";
const SECRET_SETTING: &str = "robot_webhook_secret";
const SIGNATURE_HEADERS: [&str; 2] = ["x-signature", "x-robot-signature"];

/// Operator id recorded for robot-driven reviews.
pub const ROBOT_OPERATOR_ID: i64 = 0;

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(default)]
pub struct RobotCommand {
    /// `approve` or `reject`.
    pub action: String,
    pub order_id: i64,
    pub reason: String,
}

fn signature(headers: &HeaderMap) -> &str {
    SIGNATURE_HEADERS
        .iter()
        .find_map(|name| {
            headers
                .get(*name)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
        })
        .unwrap_or_default()
}

async fn webhook_secret(deps: &HandlerDeps) -> ApiResult<Option<String>> {
    let enabled = deps.settings.get(ENABLED_SETTING).await?;
    if enabled.as_deref().map(str::trim) == Some("false") {
        return Ok(None);
    }
    Ok(deps
        .settings
        .get(SECRET_SETTING)
        .await?
        .map(|secret| secret.trim().to_string())
        .filter(|secret| !secret.is_empty()))
}

#[utoipa::path(
    post,
    path = "/api/v1/integrations/robot/webhook",
    request_body = RobotCommand,
    responses(
        (status = 200, description = "Command applied.", body = OkResponse),
        (status = 400, description = "Unknown action or malformed body."),
        (status = 401, description = "Invalid signature."),
        (status = 403, description = "Webhook disabled."),
        (status = 409, description = "Order status not editable."),
    ),
    tag = "integrations"
)]
pub async fn webhook(
    headers: HeaderMap,
    Extension(deps): Extension<Arc<HandlerDeps>>,
    body: Bytes,
) -> ApiResult<Json<OkResponse>> {
    let Some(secret) = webhook_secret(&deps).await? else {
        return Err(ApiError::forbidden("forbidden"));
    };
    if !verify_hmac(&body, &secret, signature(&headers)) {
        warn!("Robot webhook signature rejected");
        return Err(ApiError::unauthorized("invalid signature"));
    }

    let command: RobotCommand =
        serde_json::from_slice(&body).map_err(|_| ApiError::bad_request("invalid body"))?;
    if command.order_id <= 0 {
        return Err(ApiError::bad_request("invalid input"));
    }
    match command.action.trim() {
        "approve" => deps
            .orders
            .approve_order(ROBOT_OPERATOR_ID, command.order_id)
            .await
            .map_err(conflict_as("order status not editable"))?,
        "reject" => deps
            .orders
            .reject_order(ROBOT_OPERATOR_ID, command.order_id, command.reason.trim())
            .await
            .map_err(conflict_as("order status not editable"))?,
        _ => return Err(ApiError::bad_request("invalid input")),
    }
    info!(
        order_id = command.order_id,
        action = command.action.trim(),
        "Robot review applied"
    );
    Ok(Json(OkResponse::ok()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn either_signature_header_is_accepted() {
        let mut headers = HeaderMap::new();
        assert_eq!(signature(&headers), "");
        headers.insert("X-Robot-Signature", HeaderValue::from_static("abc"));
        assert_eq!(signature(&headers), "abc");
        headers.insert("X-Signature", HeaderValue::from_static("def"));
        assert_eq!(signature(&headers), "def");
    }
}
