use crate::api::{HandlerDeps, error::ApiResult, gateway::load_auth_settings};
use crate::settings::CaptchaProvider;
use axum::{Json, extract::Extension};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use utoipa::ToSchema;

const CAPTCHA_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Serialize, ToSchema)]
pub struct CaptchaResponse {
    pub captcha_provider: CaptchaProvider,
    pub captcha_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_base64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_server: Option<String>,
}

#[utoipa::path(
    get,
    path = "/api/v1/captcha",
    responses(
        (status = 200, description = "Captcha challenge for the configured provider.", body = CaptchaResponse),
    ),
    tag = "auth"
)]
pub async fn captcha(
    Extension(deps): Extension<Arc<HandlerDeps>>,
) -> ApiResult<Json<CaptchaResponse>> {
    let settings = load_auth_settings(&deps).await?;
    if settings.captcha_provider == CaptchaProvider::Geetest {
        return Ok(Json(CaptchaResponse {
            captcha_provider: CaptchaProvider::Geetest,
            captcha_id: settings.geetest_captcha_id,
            image_base64: None,
            api_server: Some(settings.geetest_api_server),
        }));
    }
    let captcha = deps
        .auth
        .create_captcha(settings.captcha_code.policy(CAPTCHA_TTL))
        .await?;
    Ok(Json(CaptchaResponse {
        captcha_provider: CaptchaProvider::Image,
        captcha_id: captcha.id,
        image_base64: Some(captcha.image_base64),
        api_server: None,
    }))
}
