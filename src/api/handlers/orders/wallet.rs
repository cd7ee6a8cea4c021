//! Wallet balance, recharge and withdraw requests.
//!
//! Every wallet order starts in `pending_review`; the balance moves only on approval, either by
//! an admin or by a verified provider notify for provider-mode recharges.

use super::{callback_base, currency_or_default};
use crate::api::{
    HandlerDeps,
    error::{ApiError, ApiResult},
    gateway::{JsonBody, Paging, require_user},
    handlers::dto::{ListResponse, PaymentSelectView, WalletOrderView, WalletView},
};
use crate::domain::{ProviderPaymentInput, WalletOrderInput};
use crate::money::parse_amount_cents;
use axum::{
    Json,
    extract::{Extension, Query},
    http::HeaderMap,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::info;
use utoipa::ToSchema;

const APPROVAL_METHOD: &str = "approval";
const BALANCE_METHOD: &str = "balance";
const WALLET_SCENE: &str = "wallet";

#[derive(Debug, Serialize, ToSchema)]
pub struct WalletResponse {
    pub wallet: WalletView,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(default)]
pub struct RechargeRequest {
    /// Yuan, as a number or decimal string.
    #[schema(value_type = f64)]
    pub amount: Value,
    pub currency: String,
    pub note: String,
    /// `approval` (default) or a provider method offered for the wallet.
    pub method: String,
    pub return_url: String,
    pub notify_url: String,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(default)]
pub struct WithdrawRequest {
    #[schema(value_type = f64)]
    pub amount: Value,
    pub currency: String,
    pub note: String,
    #[schema(value_type = Object)]
    pub meta: Map<String, Value>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct WalletOrderResponse {
    pub order: WalletOrderView,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment: Option<PaymentSelectView>,
}

fn positive_cents(amount: &Value) -> ApiResult<i64> {
    parse_amount_cents(amount)
        .ok()
        .filter(|cents| *cents > 0)
        .ok_or_else(|| ApiError::bad_request("invalid amount"))
}

#[utoipa::path(
    get,
    path = "/api/v1/wallet",
    responses(
        (status = 200, description = "Current balance.", body = WalletResponse),
        (status = 401, description = "Missing or invalid token."),
    ),
    security(("bearer" = [])),
    tag = "wallet"
)]
pub async fn wallet(
    headers: HeaderMap,
    Extension(deps): Extension<Arc<HandlerDeps>>,
) -> ApiResult<Json<WalletResponse>> {
    let principal = require_user(&headers, &deps).await?;
    let wallet = deps.wallet.get_wallet(principal.user_id()).await?;
    Ok(Json(WalletResponse {
        wallet: WalletView::from(&wallet),
    }))
}

#[utoipa::path(
    get,
    path = "/api/v1/wallet/orders",
    params(Paging),
    responses(
        (status = 200, description = "The caller's wallet orders.", body = ListResponse<WalletOrderView>),
        (status = 401, description = "Missing or invalid token."),
    ),
    security(("bearer" = [])),
    tag = "wallet"
)]
pub async fn orders(
    headers: HeaderMap,
    Extension(deps): Extension<Arc<HandlerDeps>>,
    Query(paging): Query<Paging>,
) -> ApiResult<Json<ListResponse<WalletOrderView>>> {
    let principal = require_user(&headers, &deps).await?;
    let (orders, total) = deps
        .wallet
        .list_user_orders(principal.user_id(), paging.limit(), paging.offset())
        .await?;
    Ok(Json(ListResponse {
        items: orders.iter().map(WalletOrderView::from).collect(),
        total,
    }))
}

#[utoipa::path(
    post,
    path = "/api/v1/wallet/recharge",
    request_body = RechargeRequest,
    responses(
        (status = 200, description = "Recharge pending review; provider mode also returns the payment.", body = WalletOrderResponse),
        (status = 400, description = "Invalid amount or provider failure."),
        (status = 401, description = "Missing or invalid token."),
        (status = 403, description = "Method not offered for wallet recharge."),
    ),
    security(("bearer" = [])),
    tag = "wallet"
)]
pub async fn recharge(
    headers: HeaderMap,
    Extension(deps): Extension<Arc<HandlerDeps>>,
    JsonBody(payload): JsonBody<RechargeRequest>,
) -> ApiResult<Json<WalletOrderResponse>> {
    let principal = require_user(&headers, &deps).await?;
    let user_id = principal.user_id();
    let amount = positive_cents(&payload.amount)?;
    let currency = currency_or_default(&payload.currency);
    let method = match payload.method.trim() {
        "" => APPROVAL_METHOD,
        method => method,
    };

    if method == APPROVAL_METHOD {
        let order = deps
            .wallet
            .create_recharge(
                user_id,
                WalletOrderInput {
                    amount,
                    currency,
                    note: payload.note,
                    meta: Map::new(),
                },
            )
            .await?;
        return Ok(Json(WalletOrderResponse {
            order: WalletOrderView::from(&order),
            payment: None,
        }));
    }

    let offered = deps
        .payments
        .list_user_methods(user_id, WALLET_SCENE)
        .await?
        .iter()
        .any(|candidate| candidate.key == method);
    if method == BALANCE_METHOD || !offered {
        return Err(ApiError::forbidden("forbidden"));
    }

    let base = callback_base(&deps, &headers).await?;
    let return_url = match payload.return_url.trim() {
        "" => format!("{base}/console/billing"),
        url => url.to_string(),
    };
    let notify_url = match payload.notify_url.trim() {
        "" => format!("{base}/api/v1/wallet/payments/notify/{method}"),
        url => url.to_string(),
    };
    let order_no = format!(
        "WALLET-{user_id}-{}",
        Utc::now().timestamp_nanos_opt().unwrap_or_default()
    );
    let payment = deps
        .payments
        .create_provider_payment(
            method,
            ProviderPaymentInput {
                user_id,
                order_no: order_no.clone(),
                subject: "Wallet recharge".to_string(),
                amount,
                currency: currency.clone(),
                return_url,
                notify_url,
            },
        )
        .await?;

    let mut meta = Map::new();
    meta.insert("payment_method".into(), Value::from(method));
    meta.insert("payment_order_no".into(), Value::from(order_no));
    meta.insert("payment_trade_no".into(), Value::from(payment.trade_no.clone()));
    meta.insert("payment_pay_url".into(), Value::from(payment.pay_url.clone()));
    let order = deps
        .wallet
        .create_recharge(
            user_id,
            WalletOrderInput {
                amount,
                currency,
                note: payload.note,
                meta,
            },
        )
        .await?;
    info!(
        user_id,
        wallet_order_id = order.id,
        method,
        "Provider wallet recharge started"
    );

    Ok(Json(WalletOrderResponse {
        order: WalletOrderView::from(&order),
        payment: Some(PaymentSelectView::from(payment)),
    }))
}

#[utoipa::path(
    post,
    path = "/api/v1/wallet/withdraw",
    request_body = WithdrawRequest,
    responses(
        (status = 200, description = "Withdraw pending review.", body = WalletOrderResponse),
        (status = 400, description = "Invalid amount."),
        (status = 401, description = "Missing or invalid token."),
        (status = 409, description = "Insufficient balance."),
    ),
    security(("bearer" = [])),
    tag = "wallet"
)]
pub async fn withdraw(
    headers: HeaderMap,
    Extension(deps): Extension<Arc<HandlerDeps>>,
    JsonBody(payload): JsonBody<WithdrawRequest>,
) -> ApiResult<Json<WalletOrderResponse>> {
    let principal = require_user(&headers, &deps).await?;
    let amount = positive_cents(&payload.amount)?;
    let order = deps
        .wallet
        .create_withdraw(
            principal.user_id(),
            WalletOrderInput {
                amount,
                currency: currency_or_default(&payload.currency),
                note: payload.note,
                meta: payload.meta,
            },
        )
        .await?;
    Ok(Json(WalletOrderResponse {
        order: WalletOrderView::from(&order),
        payment: None,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn amount_must_be_positive() {
        assert_eq!(positive_cents(&json!("10.5")), Ok(1050));
        assert!(positive_cents(&json!(0)).is_err());
        assert!(positive_cents(&json!(-3)).is_err());
        assert!(positive_cents(&Value::Null).is_err());
    }
}
