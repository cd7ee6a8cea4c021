use crate::api::{
    HandlerDeps,
    error::{ApiError, ApiResult},
    gateway::{JsonBody, require_admin},
    handlers::dto::OkResponse,
};
use crate::domain::Setting;
use crate::settings::validate_setting_json_value;
use axum::{Json, extract::Extension, http::HeaderMap};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use utoipa::ToSchema;

#[derive(Debug, Serialize, ToSchema)]
pub struct SettingsResponse {
    pub items: Vec<Setting>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct SettingUpdate {
    pub key: String,
    pub value: String,
}

/// Either a single `{key, value}` pair or a batch under `items`.
#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(default)]
pub struct UpdateSettingsRequest {
    pub key: String,
    pub value: String,
    pub items: Vec<SettingUpdate>,
}

impl UpdateSettingsRequest {
    /// Trims keys and validates every pair before anything is written.
    fn into_updates(self) -> ApiResult<Vec<SettingUpdate>> {
        let updates = if self.items.is_empty() {
            vec![SettingUpdate {
                key: self.key,
                value: self.value,
            }]
        } else {
            self.items
        };
        updates
            .into_iter()
            .map(|update| {
                let key = update.key.trim().to_string();
                if key.is_empty() {
                    return Err(ApiError::bad_request("invalid key"));
                }
                validate_setting_json_value(&key, &update.value)
                    .map_err(|err| ApiError::bad_request(err.to_string()))?;
                Ok(SettingUpdate {
                    key,
                    value: update.value,
                })
            })
            .collect()
    }
}

#[utoipa::path(
    get,
    path = "/admin/api/v1/settings",
    responses(
        (status = 200, description = "All stored settings.", body = SettingsResponse),
        (status = 403, description = "Admin gate failed."),
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn list(
    headers: HeaderMap,
    Extension(deps): Extension<Arc<HandlerDeps>>,
) -> ApiResult<Json<SettingsResponse>> {
    require_admin(&headers, &deps, Some("settings.view")).await?;
    let items = deps.settings.list().await?;
    Ok(Json(SettingsResponse { items }))
}

#[utoipa::path(
    patch,
    path = "/admin/api/v1/settings",
    request_body = UpdateSettingsRequest,
    responses(
        (status = 200, description = "Settings stored.", body = OkResponse),
        (status = 400, description = "Empty key, or a JSON setting that is malformed or double-encoded."),
        (status = 403, description = "Admin gate failed."),
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn update(
    headers: HeaderMap,
    Extension(deps): Extension<Arc<HandlerDeps>>,
    JsonBody(payload): JsonBody<UpdateSettingsRequest>,
) -> ApiResult<Json<OkResponse>> {
    let operator = require_admin(&headers, &deps, Some("settings.update")).await?;
    for update in payload.into_updates()? {
        deps.settings.update(&update.key, &update.value).await?;
        info!(
            operator_id = operator.user_id(),
            key = %update.key,
            "Setting updated"
        );
    }
    Ok(Json(OkResponse::ok()))
}
