//! End-user order endpoints: creation, listing, manual and provider payments, live events.
//!
//! Flow Overview:
//! 1) `POST /orders` builds an order from the cart (or explicit items), keyed by `Idempotency-Key`.
//! 2) The user either submits a manual payment for review or selects a provider method.
//! 3) Provider callbacks land in [`notify`]; approval and provisioning are published as order
//!    events and streamed to the console over SSE.

pub mod notify;
pub mod vps;
pub mod wallet;

use crate::api::{
    HandlerDeps,
    error::{ApiError, ApiResult},
    gateway::{
        ClientIp, JsonBody, Paging, callback_base_url, detect_device, idempotency_key,
        require_user,
    },
    handlers::dto::{
        ListResponse, OkResponse, OrderEventView, OrderItemView, OrderPaymentView, OrderView,
        PaymentSelectView,
    },
};
use crate::domain::{
    DEFAULT_CURRENCY, OrderDetail, OrderFilter, OrderItemInput, OrderStatus, PaymentInput,
    PaymentMethod, PaymentSelectInput,
};
use crate::error::ServiceError;
use crate::money::parse_amount_cents;
use axum::{
    Json,
    extract::{Extension, Path, Query},
    http::{HeaderMap, header::USER_AGENT},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tracing::debug;
use utoipa::{IntoParams, ToSchema};

const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(default)]
pub struct CreateOrderRequest {
    /// Empty means "order the cart".
    pub items: Vec<OrderItemInput>,
    pub coupon_code: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OrderCreatedResponse {
    pub order: OrderView,
    pub items: Vec<OrderItemView>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OrderDetailResponse {
    pub order: OrderView,
    pub items: Vec<OrderItemView>,
    pub payments: Vec<OrderPaymentView>,
}

impl From<&OrderDetail> for OrderDetailResponse {
    fn from(detail: &OrderDetail) -> Self {
        Self {
            order: OrderView::from(&detail.order),
            items: detail.items.iter().map(OrderItemView::from).collect(),
            payments: detail.payments.iter().map(OrderPaymentView::from).collect(),
        }
    }
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct OrderListQuery {
    /// Order status, or `all`.
    pub status: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl OrderListQuery {
    fn paging(&self) -> Paging {
        Paging {
            limit: self.limit,
            offset: self.offset,
        }
    }

    fn status_filter(&self) -> ApiResult<Option<OrderStatus>> {
        order_status_filter(self.status.as_deref())
    }
}

/// `None` for no filter (`all` or empty); `Err` for an unknown status.
pub(crate) fn order_status_filter(raw: Option<&str>) -> ApiResult<Option<OrderStatus>> {
    match raw.map(str::trim) {
        None | Some("" | "all") => Ok(None),
        Some(raw) => raw
            .parse::<OrderStatus>()
            .map(Some)
            .map_err(|()| ApiError::bad_request("invalid status")),
    }
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(default)]
pub struct SubmitPaymentRequest {
    pub method: String,
    /// Yuan, as a number or decimal string.
    #[schema(value_type = f64)]
    pub amount: Value,
    pub currency: String,
    pub trade_no: String,
    pub note: String,
    pub screenshot_url: String,
}

impl SubmitPaymentRequest {
    pub(crate) fn into_input(self) -> ApiResult<PaymentInput> {
        let amount =
            parse_amount_cents(&self.amount).map_err(|_| ApiError::bad_request("invalid amount"))?;
        Ok(PaymentInput {
            method: self.method.trim().to_string(),
            amount,
            currency: currency_or_default(&self.currency),
            trade_no: self.trade_no.trim().to_string(),
            note: self.note,
            screenshot_url: self.screenshot_url.trim().to_string(),
        })
    }

    /// Admin variant: an omitted amount means the order total.
    pub(crate) fn into_mark_paid_input(mut self) -> ApiResult<PaymentInput> {
        if self.amount.is_null() {
            self.amount = Value::from(0);
        }
        self.into_input()
    }
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(default)]
pub struct PayRequest {
    pub method: String,
    pub return_url: String,
    pub notify_url: String,
    pub extra: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct PaymentMethodsQuery {
    /// `order` (default) or `wallet`.
    pub scene: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PaymentMethodsResponse {
    pub items: Vec<PaymentMethod>,
}

pub(crate) fn currency_or_default(raw: &str) -> String {
    let currency = raw.trim();
    if currency.is_empty() {
        DEFAULT_CURRENCY.to_string()
    } else {
        currency.to_string()
    }
}

/// The order's detail, provided it belongs to `user_id`.
async fn owned_order(deps: &HandlerDeps, user_id: i64, order_id: i64) -> ApiResult<OrderDetail> {
    let detail = deps
        .orders
        .get_order_detail(order_id)
        .await
        .map_err(|err| ApiError::or_not_found(err, "order not found"))?;
    if detail.order.user_id == user_id {
        Ok(detail)
    } else {
        Err(ApiError::not_found("order not found"))
    }
}

async fn site_url(deps: &HandlerDeps) -> ApiResult<Option<String>> {
    Ok(deps.settings.get("site_url").await?)
}

pub(crate) async fn callback_base(deps: &HandlerDeps, headers: &HeaderMap) -> ApiResult<String> {
    let site = site_url(deps).await?;
    Ok(callback_base_url(headers, site.as_deref()))
}

async fn create_order(
    deps: &HandlerDeps,
    headers: &HeaderMap,
    payload: CreateOrderRequest,
) -> ApiResult<Json<OrderCreatedResponse>> {
    let principal = require_user(headers, deps).await?;
    let key = idempotency_key(headers);
    let coupon = payload.coupon_code.trim();
    let (order, items) = if payload.items.is_empty() {
        deps.orders
            .create_order_from_cart(principal.user_id(), DEFAULT_CURRENCY, coupon, &key)
            .await?
    } else {
        deps.orders
            .create_order_from_items(
                principal.user_id(),
                DEFAULT_CURRENCY,
                payload.items,
                coupon,
                &key,
            )
            .await?
    };
    Ok(Json(OrderCreatedResponse {
        order: OrderView::from(&order),
        items: items.iter().map(OrderItemView::from).collect(),
    }))
}

#[utoipa::path(
    post,
    path = "/api/v1/orders",
    request_body = CreateOrderRequest,
    params(("Idempotency-Key" = Option<String>, Header, description = "Replays return the original order.")),
    responses(
        (status = 200, description = "Order created from the cart or the given items.", body = OrderCreatedResponse),
        (status = 400, description = "Empty cart or invalid items."),
        (status = 401, description = "Missing or invalid token."),
    ),
    security(("bearer" = [])),
    tag = "orders"
)]
pub async fn create(
    headers: HeaderMap,
    Extension(deps): Extension<Arc<HandlerDeps>>,
    JsonBody(payload): JsonBody<CreateOrderRequest>,
) -> ApiResult<Json<OrderCreatedResponse>> {
    create_order(&deps, &headers, payload).await
}

#[utoipa::path(
    post,
    path = "/api/v1/orders/items",
    request_body = CreateOrderRequest,
    params(("Idempotency-Key" = Option<String>, Header, description = "Replays return the original order.")),
    responses(
        (status = 200, description = "Order created from explicit items.", body = OrderCreatedResponse),
        (status = 400, description = "No items."),
        (status = 401, description = "Missing or invalid token."),
    ),
    security(("bearer" = [])),
    tag = "orders"
)]
pub async fn create_items(
    headers: HeaderMap,
    Extension(deps): Extension<Arc<HandlerDeps>>,
    JsonBody(payload): JsonBody<CreateOrderRequest>,
) -> ApiResult<Json<OrderCreatedResponse>> {
    if payload.items.is_empty() {
        return Err(ApiError::bad_request("items required"));
    }
    create_order(&deps, &headers, payload).await
}

#[utoipa::path(
    get,
    path = "/api/v1/orders",
    params(OrderListQuery),
    responses(
        (status = 200, description = "The caller's orders, newest first.", body = ListResponse<OrderView>),
        (status = 400, description = "Unknown status filter."),
        (status = 401, description = "Missing or invalid token."),
    ),
    security(("bearer" = [])),
    tag = "orders"
)]
pub async fn list(
    headers: HeaderMap,
    Extension(deps): Extension<Arc<HandlerDeps>>,
    Query(query): Query<OrderListQuery>,
) -> ApiResult<Json<ListResponse<OrderView>>> {
    let principal = require_user(&headers, &deps).await?;
    let paging = query.paging();
    let (orders, total) = deps
        .orders
        .list_orders(OrderFilter {
            user_id: Some(principal.user_id()),
            status: query.status_filter()?,
            limit: paging.limit(),
            offset: paging.offset(),
        })
        .await?;
    Ok(Json(ListResponse {
        items: orders.iter().map(OrderView::from).collect(),
        total,
    }))
}

#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}",
    params(("id" = i64, Path, description = "Order id")),
    responses(
        (status = 200, description = "Order with items and payments.", body = OrderDetailResponse),
        (status = 401, description = "Missing or invalid token."),
        (status = 404, description = "Order not found."),
    ),
    security(("bearer" = [])),
    tag = "orders"
)]
pub async fn detail(
    headers: HeaderMap,
    Extension(deps): Extension<Arc<HandlerDeps>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<OrderDetailResponse>> {
    let principal = require_user(&headers, &deps).await?;
    let detail = owned_order(&deps, principal.user_id(), id).await?;
    Ok(Json(OrderDetailResponse::from(&detail)))
}

#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/cancel",
    params(("id" = i64, Path, description = "Order id")),
    responses(
        (status = 200, description = "Order canceled.", body = OkResponse),
        (status = 401, description = "Missing or invalid token."),
        (status = 404, description = "Order not found."),
        (status = 409, description = "Order can no longer be canceled."),
    ),
    security(("bearer" = [])),
    tag = "orders"
)]
pub async fn cancel(
    headers: HeaderMap,
    Extension(deps): Extension<Arc<HandlerDeps>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<OkResponse>> {
    let principal = require_user(&headers, &deps).await?;
    deps.orders
        .cancel_order(principal.user_id(), id)
        .await
        .map_err(|err| ApiError::or_not_found(err, "order not found"))?;
    Ok(Json(OkResponse::ok()))
}

#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/payments",
    request_body = SubmitPaymentRequest,
    params(
        ("id" = i64, Path, description = "Order id"),
        ("Idempotency-Key" = Option<String>, Header, description = "Replays return the original payment."),
    ),
    responses(
        (status = 200, description = "Manual payment submitted for review.", body = OrderPaymentView),
        (status = 400, description = "Invalid amount or payment."),
        (status = 401, description = "Missing or invalid token."),
        (status = 404, description = "Order not found."),
        (status = 409, description = "Order does not accept payments."),
    ),
    security(("bearer" = [])),
    tag = "orders"
)]
pub async fn submit_payment(
    headers: HeaderMap,
    Extension(deps): Extension<Arc<HandlerDeps>>,
    Path(id): Path<i64>,
    JsonBody(payload): JsonBody<SubmitPaymentRequest>,
) -> ApiResult<Json<OrderPaymentView>> {
    let principal = require_user(&headers, &deps).await?;
    let input = payload.into_input()?;
    let payment = deps
        .orders
        .submit_payment(principal.user_id(), id, input, &idempotency_key(&headers))
        .await
        .map_err(|err| ApiError::or_not_found(err, "order not found"))?;
    Ok(Json(OrderPaymentView::from(&payment)))
}

#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/pay",
    request_body = PayRequest,
    params(("id" = i64, Path, description = "Order id")),
    responses(
        (status = 200, description = "Payment started; follow `pay_url` or read `paid`.", body = PaymentSelectView),
        (status = 400, description = "Unknown method or provider failure."),
        (status = 401, description = "Missing or invalid token."),
        (status = 404, description = "Order not found."),
        (status = 409, description = "Insufficient balance."),
    ),
    security(("bearer" = [])),
    tag = "orders"
)]
pub async fn pay(
    headers: HeaderMap,
    Extension(deps): Extension<Arc<HandlerDeps>>,
    ClientIp(ip): ClientIp,
    Path(id): Path<i64>,
    JsonBody(payload): JsonBody<PayRequest>,
) -> ApiResult<Json<PaymentSelectView>> {
    let principal = require_user(&headers, &deps).await?;
    let method = payload.method.trim();
    if method.is_empty() {
        return Err(ApiError::bad_request("method required"));
    }

    let base = callback_base(&deps, &headers).await?;
    let return_url = match payload.return_url.trim() {
        "" => format!("{base}/console/orders/{id}"),
        url => url.to_string(),
    };
    let notify_url = match payload.notify_url.trim() {
        "" => format!("{base}/api/v1/payments/notify/{method}"),
        url => url.to_string(),
    };
    let user_agent = headers
        .get(USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    let result = deps
        .payments
        .select_payment(
            principal.user_id(),
            id,
            PaymentSelectInput {
                method: method.to_string(),
                return_url,
                notify_url,
                extra: payload.extra,
                client_ip: ip,
                device: detect_device(user_agent).to_string(),
            },
        )
        .await
        .map_err(|err| ApiError::or_not_found(err, "order not found"))?;
    Ok(Json(PaymentSelectView::from(result)))
}

#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}/events",
    params(
        ("id" = i64, Path, description = "Order id"),
        ("Last-Event-ID" = Option<i64>, Header, description = "Resume after this sequence number."),
    ),
    responses(
        (status = 200, description = "Server-sent order events; `id` is the sequence number.", content_type = "text/event-stream"),
        (status = 401, description = "Missing or invalid token."),
        (status = 404, description = "Order not found."),
    ),
    security(("bearer" = [])),
    tag = "orders"
)]
pub async fn events(
    headers: HeaderMap,
    Extension(deps): Extension<Arc<HandlerDeps>>,
    Path(id): Path<i64>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, axum::Error>>>> {
    let principal = require_user(&headers, &deps).await?;
    owned_order(&deps, principal.user_id(), id).await?;

    let last_seq = headers
        .get("last-event-id")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<i64>().ok())
        .unwrap_or(0);
    debug!(order_id = id, last_seq, "Opening order event stream");

    let stream = deps.events.stream(id, last_seq).await?.map(|event| {
        Event::default()
            .id(event.seq.to_string())
            .event(event.event_type.clone())
            .json_data(OrderEventView::from(&event))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE).text("ping")))
}

#[utoipa::path(
    get,
    path = "/api/v1/payments/methods",
    params(PaymentMethodsQuery),
    responses(
        (status = 200, description = "Payment methods offered to the caller.", body = PaymentMethodsResponse),
        (status = 401, description = "Missing or invalid token."),
    ),
    security(("bearer" = [])),
    tag = "orders"
)]
pub async fn payment_methods(
    headers: HeaderMap,
    Extension(deps): Extension<Arc<HandlerDeps>>,
    Query(query): Query<PaymentMethodsQuery>,
) -> ApiResult<Json<PaymentMethodsResponse>> {
    let principal = require_user(&headers, &deps).await?;
    let scene = match query.scene.as_deref().map(str::trim) {
        None | Some("") => "order",
        Some(scene) => scene,
    };
    let items = deps
        .payments
        .list_user_methods(principal.user_id(), scene)
        .await?;
    Ok(Json(PaymentMethodsResponse { items }))
}

/// Collaborator conflicts on review endpoints read better with a specific message.
pub(crate) fn conflict_as(message: &'static str) -> impl Fn(ServiceError) -> ApiError {
    move |err| match err {
        ServiceError::Conflict => ApiError::conflict(message),
        other => other.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(status: Option<&str>) -> OrderListQuery {
        OrderListQuery {
            status: status.map(str::to_string),
            ..OrderListQuery::default()
        }
    }

    #[test]
    fn all_and_empty_mean_no_filter() {
        assert_eq!(query(None).status_filter(), Ok(None));
        assert_eq!(query(Some("all")).status_filter(), Ok(None));
        assert_eq!(query(Some(" ")).status_filter(), Ok(None));
    }

    #[test]
    fn unknown_status_is_rejected() {
        let err = query(Some("shipping")).status_filter().err();
        assert_eq!(err.map(|e| e.message().to_string()).as_deref(), Some("invalid status"));
    }

    #[test]
    fn manual_payment_amount_is_parsed() -> anyhow::Result<()> {
        let request: SubmitPaymentRequest =
            serde_json::from_str(r#"{"method":"approval","amount":"12.50","trade_no":" T1 "}"#)?;
        let input = request.into_input()?;
        assert_eq!(input.amount, 1250);
        assert_eq!(input.currency, DEFAULT_CURRENCY);
        assert_eq!(input.trade_no, "T1");

        let bad: SubmitPaymentRequest = serde_json::from_str(r#"{"method":"approval"}"#)?;
        assert!(bad.into_input().is_err());

        let omitted: SubmitPaymentRequest = serde_json::from_str("{}")?;
        assert_eq!(omitted.into_mark_paid_input()?.amount, 0);
        Ok(())
    }
}
