//! Orders against an existing VPS instance, and coupon preview.
//!
//! Resize and refund consult the per-instance capability policy before the order pipeline; the
//! pipeline itself enforces at most one in-flight resize, refund or emergency renew per instance.

use crate::api::{
    HandlerDeps,
    error::{ApiError, ApiResult},
    gateway::{JsonBody, require_user},
    handlers::dto::{CouponPreviewView, OrderView, ResizeQuoteView},
};
use crate::capability::{CapabilityPolicy, Feature};
use crate::domain::{OrderItemInput, RenewInput, ResizeInput, VpsInstance};
use crate::money::cents_to_yuan;
use crate::settings::SettingsSnapshot;
use axum::{
    Json,
    extract::{Extension, Path},
    http::HeaderMap,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};
use utoipa::ToSchema;

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(default)]
pub struct RenewRequest {
    pub renew_days: Option<i32>,
    pub duration_months: Option<i32>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(default)]
pub struct ResizeRequest {
    #[schema(value_type = Option<Object>)]
    pub spec: Option<Value>,
    pub target_package_id: i64,
    pub reset_addons: bool,
    /// RFC 3339; empty resizes immediately.
    pub scheduled_at: String,
}

impl ResizeRequest {
    fn into_input(self) -> ApiResult<ResizeInput> {
        Ok(ResizeInput {
            scheduled_at: parse_scheduled_at(&self.scheduled_at)?,
            spec: self.spec,
            target_package_id: self.target_package_id,
            reset_addons: self.reset_addons,
        })
    }
}

fn parse_scheduled_at(raw: &str) -> ApiResult<Option<DateTime<Utc>>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|at| Some(at.with_timezone(&Utc)))
        .map_err(|_| ApiError::bad_request("invalid scheduled_at"))
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(default)]
pub struct RefundRequest {
    pub reason: String,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(default)]
pub struct CouponPreviewRequest {
    pub coupon_code: String,
    pub items: Vec<OrderItemInput>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct VpsOrderResponse {
    pub order: OrderView,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ResizeQuoteResponse {
    pub quote: ResizeQuoteView,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ResizeOrderResponse {
    pub order: OrderView,
    pub quote: ResizeQuoteView,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RefundResponse {
    pub order: OrderView,
    pub refund_amount: f64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CouponPreviewResponse {
    pub preview: CouponPreviewView,
}

async fn owned_instance(deps: &HandlerDeps, user_id: i64, vps_id: i64) -> ApiResult<VpsInstance> {
    let instance = deps
        .vps
        .get_instance(vps_id)
        .await
        .map_err(|err| ApiError::or_not_found(err, "vps not found"))?;
    if instance.user_id == user_id {
        Ok(instance)
    } else {
        Err(ApiError::not_found("vps not found"))
    }
}

/// Resolve the capability policy for one instance.
async fn ensure_feature(
    deps: &HandlerDeps,
    user_id: i64,
    vps_id: i64,
    feature: Feature,
) -> ApiResult<()> {
    let instance = owned_instance(deps, user_id, vps_id).await?;
    let features = match deps.vps.automation_features(&instance).await {
        Ok(features) => features,
        Err(err) => {
            warn!(vps_id, "Automation features unavailable: {err}");
            None
        }
    };
    let snapshot = SettingsSnapshot::load(deps.settings.as_ref()).await?;
    if CapabilityPolicy::from_settings(&snapshot).allows(&instance, feature, features.as_deref()) {
        Ok(())
    } else {
        Err(ApiError::forbidden(format!("{} disabled", feature.as_str())))
    }
}

#[utoipa::path(
    post,
    path = "/api/v1/vps/{id}/renew",
    request_body = RenewRequest,
    params(("id" = i64, Path, description = "VPS instance id")),
    responses(
        (status = 200, description = "Renew order created.", body = VpsOrderResponse),
        (status = 401, description = "Missing or invalid token."),
        (status = 404, description = "Instance not found."),
    ),
    security(("bearer" = [])),
    tag = "orders"
)]
pub async fn renew(
    headers: HeaderMap,
    Extension(deps): Extension<Arc<HandlerDeps>>,
    Path(id): Path<i64>,
    JsonBody(payload): JsonBody<RenewRequest>,
) -> ApiResult<Json<VpsOrderResponse>> {
    let principal = require_user(&headers, &deps).await?;
    let order = deps
        .orders
        .create_renew_order(
            principal.user_id(),
            id,
            RenewInput {
                renew_days: payload.renew_days,
                duration_months: payload.duration_months,
            },
        )
        .await
        .map_err(|err| ApiError::or_not_found(err, "vps not found"))?;
    Ok(Json(VpsOrderResponse {
        order: OrderView::from(&order),
    }))
}

#[utoipa::path(
    post,
    path = "/api/v1/vps/{id}/resize/quote",
    request_body = ResizeRequest,
    params(("id" = i64, Path, description = "VPS instance id")),
    responses(
        (status = 200, description = "Cost deltas for the resize, in yuan.", body = ResizeQuoteResponse),
        (status = 400, description = "Invalid target or schedule."),
        (status = 403, description = "Resize disabled for this instance."),
        (status = 404, description = "Instance not found."),
    ),
    security(("bearer" = [])),
    tag = "orders"
)]
pub async fn resize_quote(
    headers: HeaderMap,
    Extension(deps): Extension<Arc<HandlerDeps>>,
    Path(id): Path<i64>,
    JsonBody(payload): JsonBody<ResizeRequest>,
) -> ApiResult<Json<ResizeQuoteResponse>> {
    let principal = require_user(&headers, &deps).await?;
    let input = payload.into_input()?;
    ensure_feature(&deps, principal.user_id(), id, Feature::Resize).await?;
    let quote = deps
        .orders
        .quote_resize(principal.user_id(), id, &input)
        .await?;
    Ok(Json(ResizeQuoteResponse {
        quote: ResizeQuoteView::from(quote),
    }))
}

#[utoipa::path(
    post,
    path = "/api/v1/vps/{id}/resize",
    request_body = ResizeRequest,
    params(("id" = i64, Path, description = "VPS instance id")),
    responses(
        (status = 200, description = "Resize order created.", body = ResizeOrderResponse),
        (status = 400, description = "Invalid target or schedule."),
        (status = 403, description = "Resize disabled for this instance."),
        (status = 404, description = "Instance not found."),
        (status = 409, description = "Another resize, refund or emergency renew is in flight."),
    ),
    security(("bearer" = [])),
    tag = "orders"
)]
pub async fn resize(
    headers: HeaderMap,
    Extension(deps): Extension<Arc<HandlerDeps>>,
    Path(id): Path<i64>,
    JsonBody(payload): JsonBody<ResizeRequest>,
) -> ApiResult<Json<ResizeOrderResponse>> {
    let principal = require_user(&headers, &deps).await?;
    let input = payload.into_input()?;
    ensure_feature(&deps, principal.user_id(), id, Feature::Resize).await?;
    let (order, quote) = deps
        .orders
        .create_resize_order(principal.user_id(), id, input)
        .await?;
    info!(order_id = order.id, vps_id = id, "Resize order created");
    Ok(Json(ResizeOrderResponse {
        order: OrderView::from(&order),
        quote: ResizeQuoteView::from(quote),
    }))
}

#[utoipa::path(
    post,
    path = "/api/v1/vps/{id}/refund",
    request_body = RefundRequest,
    params(("id" = i64, Path, description = "VPS instance id")),
    responses(
        (status = 200, description = "Refund order created.", body = RefundResponse),
        (status = 403, description = "Refund disabled for this instance."),
        (status = 404, description = "Instance not found."),
        (status = 409, description = "Another resize, refund or emergency renew is in flight."),
    ),
    security(("bearer" = [])),
    tag = "orders"
)]
pub async fn refund(
    headers: HeaderMap,
    Extension(deps): Extension<Arc<HandlerDeps>>,
    Path(id): Path<i64>,
    JsonBody(payload): JsonBody<RefundRequest>,
) -> ApiResult<Json<RefundResponse>> {
    let principal = require_user(&headers, &deps).await?;
    ensure_feature(&deps, principal.user_id(), id, Feature::Refund).await?;
    let result = deps
        .orders
        .request_refund(principal.user_id(), id, payload.reason.trim())
        .await?;
    info!(order_id = result.order.id, vps_id = id, "Refund requested");
    Ok(Json(RefundResponse {
        order: OrderView::from(&result.order),
        refund_amount: cents_to_yuan(result.refund_amount),
    }))
}

#[utoipa::path(
    post,
    path = "/api/v1/vps/{id}/emergency-renew",
    params(("id" = i64, Path, description = "VPS instance id")),
    responses(
        (status = 200, description = "Zero-amount renew order created.", body = VpsOrderResponse),
        (status = 403, description = "Emergency renew not allowed for this instance."),
        (status = 404, description = "Instance not found."),
        (status = 409, description = "Cooldown active or another order in flight."),
    ),
    security(("bearer" = [])),
    tag = "orders"
)]
pub async fn emergency_renew(
    headers: HeaderMap,
    Extension(deps): Extension<Arc<HandlerDeps>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<VpsOrderResponse>> {
    let principal = require_user(&headers, &deps).await?;
    let order = deps
        .orders
        .create_emergency_renew_order(principal.user_id(), id)
        .await
        .map_err(|err| ApiError::or_not_found(err, "vps not found"))?;
    Ok(Json(VpsOrderResponse {
        order: OrderView::from(&order),
    }))
}

#[utoipa::path(
    post,
    path = "/api/v1/coupons/preview",
    request_body = CouponPreviewRequest,
    responses(
        (status = 200, description = "Discount for the items, or the cart when none are given.", body = CouponPreviewResponse),
        (status = 400, description = "Missing or unusable coupon."),
        (status = 401, description = "Missing or invalid token."),
    ),
    security(("bearer" = [])),
    tag = "orders"
)]
pub async fn coupon_preview(
    headers: HeaderMap,
    Extension(deps): Extension<Arc<HandlerDeps>>,
    JsonBody(payload): JsonBody<CouponPreviewRequest>,
) -> ApiResult<Json<CouponPreviewResponse>> {
    let principal = require_user(&headers, &deps).await?;
    let code = payload.coupon_code.trim();
    if code.is_empty() {
        return Err(ApiError::bad_request("invalid input"));
    }
    let preview = deps
        .orders
        .preview_coupon(principal.user_id(), code, payload.items)
        .await?;
    Ok(Json(CouponPreviewResponse {
        preview: CouponPreviewView::from(preview),
    }))
}
