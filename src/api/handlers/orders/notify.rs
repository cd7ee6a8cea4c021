//! Provider payment callbacks.
//!
//! Both endpoints accept any method and raw body; the provider's plugin verifies the request.
//! Replays are acknowledged without side effects, so providers can retry freely.

use crate::api::{
    HandlerDeps,
    error::{ApiError, ApiResult},
};
use crate::domain::{NotifyOutcome, NotifyRequest, NotifyResult};
use crate::error::ServiceError;
use axum::{
    Json,
    body::Bytes,
    extract::{Extension, Path, RawQuery},
    http::{HeaderMap, Method, StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, info, warn};

#[derive(Debug, Serialize)]
struct NotifyAck {
    ok: bool,
    trade_no: String,
}

fn notify_request(
    method: &Method,
    headers: &HeaderMap,
    query: Option<String>,
    body: Bytes,
) -> NotifyRequest {
    let headers = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect::<HashMap<_, _>>();
    NotifyRequest {
        method: method.as_str().to_string(),
        headers,
        query: query.unwrap_or_default(),
        body: body.to_vec(),
    }
}

async fn verify(
    deps: &HandlerDeps,
    provider: &str,
    request: NotifyRequest,
) -> ApiResult<NotifyResult> {
    deps.payments
        .verify_notify(provider, request)
        .await
        .map_err(|err| {
            warn!(provider, "Payment notify rejected: {err}");
            match err {
                ServiceError::Internal(_) => ApiError::from(err),
                other => ApiError::bad_request(other.to_string()),
            }
        })
}

/// The provider's expected acknowledgement, or `{ok, trade_no}` when it has none.
fn acknowledge(result: &NotifyResult) -> Response {
    let ack = result.ack_body.trim();
    if ack.is_empty() {
        return Json(NotifyAck {
            ok: true,
            trade_no: result.trade_no.clone(),
        })
        .into_response();
    }
    let content_type = if ack.starts_with('{') || ack.starts_with('[') {
        "application/json"
    } else {
        "text/plain; charset=utf-8"
    };
    (
        StatusCode::OK,
        [(CONTENT_TYPE, content_type)],
        result.ack_body.clone(),
    )
        .into_response()
}

/// `ANY /api/v1/payments/notify/{provider}`
pub async fn payment_notify(
    method: Method,
    headers: HeaderMap,
    Extension(deps): Extension<Arc<HandlerDeps>>,
    Path(provider): Path<String>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> ApiResult<Response> {
    let request = notify_request(&method, &headers, query, body);
    let result = verify(&deps, &provider, request).await?;
    if !result.paid {
        debug!(provider = %provider, trade_no = %result.trade_no, "Unpaid notify acknowledged");
        return Ok(acknowledge(&result));
    }

    match deps
        .orders
        .approve_payment_by_trade_no(&provider, &result.trade_no, result.amount)
        .await?
    {
        NotifyOutcome::Approved(payment) => {
            info!(
                provider = %provider,
                trade_no = %result.trade_no,
                order_id = payment.order_id,
                "Payment approved by provider notify"
            );
        }
        NotifyOutcome::AlreadyApproved(payment) => {
            debug!(
                provider = %provider,
                trade_no = %result.trade_no,
                order_id = payment.order_id,
                "Replayed payment notify"
            );
        }
    }
    Ok(acknowledge(&result))
}

/// `ANY /api/v1/wallet/payments/notify/{provider}`
pub async fn wallet_notify(
    method: Method,
    headers: HeaderMap,
    Extension(deps): Extension<Arc<HandlerDeps>>,
    Path(provider): Path<String>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> ApiResult<Response> {
    let request = notify_request(&method, &headers, query, body);
    let result = verify(&deps, &provider, request).await?;
    if !result.paid {
        return Ok(acknowledge(&result));
    }
    if result.order_no.trim().is_empty() && result.trade_no.trim().is_empty() {
        return Err(ApiError::bad_request("invalid input"));
    }

    let order = deps
        .wallet
        .find_recharge_by_payment(&provider, &result.order_no, &result.trade_no)
        .await?
        .ok_or_else(|| ApiError::bad_request("invalid input"))?;
    match deps.wallet.approve(0, order.id).await {
        Ok(order) => {
            info!(
                provider = %provider,
                wallet_order_id = order.id,
                user_id = order.user_id,
                "Wallet recharge approved by provider notify"
            );
        }
        Err(ServiceError::Conflict) => {
            debug!(provider = %provider, wallet_order_id = order.id, "Replayed wallet notify");
        }
        Err(err) => return Err(err.into()),
    }
    Ok(acknowledge(&result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use axum::body::to_bytes;

    fn result(ack: &str) -> NotifyResult {
        NotifyResult {
            order_no: "ORD-1".to_string(),
            trade_no: "T-1".to_string(),
            paid: true,
            amount: 100,
            ack_body: ack.to_string(),
        }
    }

    #[tokio::test]
    async fn plain_ack_is_text() -> Result<()> {
        let response = acknowledge(&result("success"));
        assert_eq!(
            response.headers().get(CONTENT_TYPE).map(|v| v.as_bytes()),
            Some(b"text/plain; charset=utf-8".as_slice())
        );
        let body = to_bytes(response.into_body(), usize::MAX).await?;
        assert_eq!(&body[..], b"success");
        Ok(())
    }

    #[tokio::test]
    async fn json_ack_keeps_provider_body() -> Result<()> {
        let response = acknowledge(&result(r#"{"code":"SUCCESS"}"#));
        assert_eq!(
            response.headers().get(CONTENT_TYPE).map(|v| v.as_bytes()),
            Some(b"application/json".as_slice())
        );
        Ok(())
    }

    #[tokio::test]
    async fn empty_ack_reports_trade_no() -> Result<()> {
        let body = to_bytes(acknowledge(&result("")).into_body(), usize::MAX).await?;
        let json: serde_json::Value = serde_json::from_slice(&body)?;
        assert_eq!(json["ok"], true);
        assert_eq!(json["trade_no"], "T-1");
        Ok(())
    }

    #[test]
    fn request_captures_headers_and_query() {
        let mut headers = HeaderMap::new();
        headers.insert("x-signature", "abc".parse().unwrap());
        let request = notify_request(
            &Method::POST,
            &headers,
            Some("a=1".to_string()),
            Bytes::from_static(b"{}"),
        );
        assert_eq!(request.method, "POST");
        assert_eq!(request.query, "a=1");
        assert_eq!(request.headers.get("x-signature").map(String::as_str), Some("abc"));
        assert_eq!(request.body, b"{}");
    }
}
