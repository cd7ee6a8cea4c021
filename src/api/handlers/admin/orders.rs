//! Order and wallet-order review.

use crate::api::{
    HandlerDeps,
    error::{ApiError, ApiResult},
    gateway::{JsonBody, Paging, require_admin},
    handlers::{
        dto::{
            ListResponse, OkResponse, OrderEventView, OrderItemView, OrderPaymentView, OrderView,
            WalletOrderView,
        },
        orders::{SubmitPaymentRequest, conflict_as, order_status_filter},
    },
};
use crate::domain::{OrderFilter, WalletOrderStatus};
use axum::{
    Json,
    extract::{Extension, Path, Query},
    http::HeaderMap,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;
use utoipa::{IntoParams, ToSchema};

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct AdminOrderQuery {
    /// Order status, or `all`.
    pub status: Option<String>,
    pub user_id: Option<i64>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct WalletOrderQuery {
    /// Wallet order status, or `all`.
    pub status: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(default)]
pub struct ReasonRequest {
    pub reason: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AdminOrderDetail {
    pub order: OrderView,
    pub items: Vec<OrderItemView>,
    pub payments: Vec<OrderPaymentView>,
    pub events: Vec<OrderEventView>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct WalletOrderReviewResponse {
    pub order: WalletOrderView,
}

fn wallet_status(raw: Option<&str>) -> ApiResult<Option<WalletOrderStatus>> {
    match raw.map(str::trim) {
        None | Some("" | "all") => Ok(None),
        Some(raw) => serde_json::from_value(Value::from(raw.to_ascii_lowercase()))
            .map(Some)
            .map_err(|_| ApiError::bad_request("invalid status")),
    }
}

#[utoipa::path(
    get,
    path = "/admin/api/v1/orders",
    params(AdminOrderQuery),
    responses(
        (status = 200, description = "Orders across all users.", body = ListResponse<OrderView>),
        (status = 400, description = "Unknown status filter."),
        (status = 403, description = "Admin gate failed."),
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn list(
    headers: HeaderMap,
    Extension(deps): Extension<Arc<HandlerDeps>>,
    Query(query): Query<AdminOrderQuery>,
) -> ApiResult<Json<ListResponse<OrderView>>> {
    require_admin(&headers, &deps, Some("order.list")).await?;
    let paging = Paging {
        limit: query.limit,
        offset: query.offset,
    };
    let (orders, total) = deps
        .orders
        .list_orders(OrderFilter {
            user_id: query.user_id,
            status: order_status_filter(query.status.as_deref())?,
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
    path = "/admin/api/v1/orders/{id}",
    params(("id" = i64, Path, description = "Order id")),
    responses(
        (status = 200, description = "Order with items, payments and its event log.", body = AdminOrderDetail),
        (status = 403, description = "Admin gate failed."),
        (status = 404, description = "Order not found."),
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn detail(
    headers: HeaderMap,
    Extension(deps): Extension<Arc<HandlerDeps>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<AdminOrderDetail>> {
    require_admin(&headers, &deps, Some("order.view")).await?;
    let detail = deps
        .orders
        .get_order_detail(id)
        .await
        .map_err(|err| ApiError::or_not_found(err, "order not found"))?;
    let events = deps.events.list(id, 0).await?;
    Ok(Json(AdminOrderDetail {
        order: OrderView::from(&detail.order),
        items: detail.items.iter().map(OrderItemView::from).collect(),
        payments: detail.payments.iter().map(OrderPaymentView::from).collect(),
        events: events.iter().map(OrderEventView::from).collect(),
    }))
}

#[utoipa::path(
    post,
    path = "/admin/api/v1/orders/{id}/approve",
    params(("id" = i64, Path, description = "Order id")),
    responses(
        (status = 200, description = "Approved; provisioning starts.", body = OkResponse),
        (status = 403, description = "Admin gate failed."),
        (status = 404, description = "Order not found."),
        (status = 409, description = "Order status not editable."),
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn approve(
    headers: HeaderMap,
    Extension(deps): Extension<Arc<HandlerDeps>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<OkResponse>> {
    let operator = require_admin(&headers, &deps, Some("order.approve")).await?;
    deps.orders
        .approve_order(operator.user_id(), id)
        .await
        .map_err(conflict_as("order status not editable"))?;
    info!(operator_id = operator.user_id(), order_id = id, "Order approved");
    Ok(Json(OkResponse::ok()))
}

#[utoipa::path(
    post,
    path = "/admin/api/v1/orders/{id}/reject",
    params(("id" = i64, Path, description = "Order id")),
    request_body = ReasonRequest,
    responses(
        (status = 200, description = "Rejected.", body = OkResponse),
        (status = 403, description = "Admin gate failed."),
        (status = 404, description = "Order not found."),
        (status = 409, description = "Order status not editable."),
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn reject(
    headers: HeaderMap,
    Extension(deps): Extension<Arc<HandlerDeps>>,
    Path(id): Path<i64>,
    JsonBody(payload): JsonBody<ReasonRequest>,
) -> ApiResult<Json<OkResponse>> {
    let operator = require_admin(&headers, &deps, Some("order.reject")).await?;
    deps.orders
        .reject_order(operator.user_id(), id, payload.reason.trim())
        .await
        .map_err(conflict_as("order status not editable"))?;
    info!(operator_id = operator.user_id(), order_id = id, "Order rejected");
    Ok(Json(OkResponse::ok()))
}

#[utoipa::path(
    post,
    path = "/admin/api/v1/orders/{id}/mark-paid",
    params(("id" = i64, Path, description = "Order id")),
    request_body = SubmitPaymentRequest,
    responses(
        (status = 200, description = "Payment recorded as approved.", body = OrderPaymentView),
        (status = 400, description = "Invalid amount."),
        (status = 403, description = "Admin gate failed."),
        (status = 409, description = "Order status not editable."),
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn mark_paid(
    headers: HeaderMap,
    Extension(deps): Extension<Arc<HandlerDeps>>,
    Path(id): Path<i64>,
    JsonBody(payload): JsonBody<SubmitPaymentRequest>,
) -> ApiResult<Json<OrderPaymentView>> {
    let operator = require_admin(&headers, &deps, Some("order.mark_paid")).await?;
    let input = payload.into_mark_paid_input()?;
    let payment = deps
        .orders
        .mark_paid(operator.user_id(), id, input)
        .await
        .map_err(conflict_as("order status not editable"))?;
    info!(operator_id = operator.user_id(), order_id = id, "Order marked paid");
    Ok(Json(OrderPaymentView::from(&payment)))
}

#[utoipa::path(
    post,
    path = "/admin/api/v1/orders/{id}/retry",
    params(("id" = i64, Path, description = "Order id")),
    responses(
        (status = 200, description = "Provisioning retried.", body = OkResponse),
        (status = 403, description = "Admin gate failed."),
        (status = 409, description = "Provisioning already running or order not retryable."),
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn retry(
    headers: HeaderMap,
    Extension(deps): Extension<Arc<HandlerDeps>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<OkResponse>> {
    let operator = require_admin(&headers, &deps, Some("order.retry")).await?;
    deps.orders.retry_provision(operator.user_id(), id).await?;
    Ok(Json(OkResponse::ok()))
}

#[utoipa::path(
    delete,
    path = "/admin/api/v1/orders/{id}",
    params(("id" = i64, Path, description = "Order id")),
    responses(
        (status = 200, description = "Deleted.", body = OkResponse),
        (status = 403, description = "Admin gate failed."),
        (status = 404, description = "Order not found."),
        (status = 409, description = "Approved orders cannot be deleted."),
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn delete(
    headers: HeaderMap,
    Extension(deps): Extension<Arc<HandlerDeps>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<OkResponse>> {
    let operator = require_admin(&headers, &deps, Some("order.delete")).await?;
    deps.orders
        .delete_order(operator.user_id(), id)
        .await
        .map_err(conflict_as("approved order cannot be deleted"))?;
    info!(operator_id = operator.user_id(), order_id = id, "Order deleted");
    Ok(Json(OkResponse::ok()))
}

#[utoipa::path(
    get,
    path = "/admin/api/v1/wallet/orders",
    params(WalletOrderQuery),
    responses(
        (status = 200, description = "Wallet orders across all users.", body = ListResponse<WalletOrderView>),
        (status = 400, description = "Unknown status filter."),
        (status = 403, description = "Admin gate failed."),
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn wallet_orders(
    headers: HeaderMap,
    Extension(deps): Extension<Arc<HandlerDeps>>,
    Query(query): Query<WalletOrderQuery>,
) -> ApiResult<Json<ListResponse<WalletOrderView>>> {
    require_admin(&headers, &deps, Some("wallet_order.list")).await?;
    let paging = Paging {
        limit: query.limit,
        offset: query.offset,
    };
    let (orders, total) = deps
        .wallet
        .list_orders(
            wallet_status(query.status.as_deref())?,
            paging.limit(),
            paging.offset(),
        )
        .await?;
    Ok(Json(ListResponse {
        items: orders.iter().map(WalletOrderView::from).collect(),
        total,
    }))
}

#[utoipa::path(
    post,
    path = "/admin/api/v1/wallet/orders/{id}/approve",
    params(("id" = i64, Path, description = "Wallet order id")),
    responses(
        (status = 200, description = "Approved; the balance moved.", body = WalletOrderReviewResponse),
        (status = 403, description = "Admin gate failed."),
        (status = 404, description = "Wallet order not found."),
        (status = 409, description = "Not pending, or insufficient balance for a withdraw."),
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn wallet_approve(
    headers: HeaderMap,
    Extension(deps): Extension<Arc<HandlerDeps>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<WalletOrderReviewResponse>> {
    let operator = require_admin(&headers, &deps, Some("wallet_order.approve")).await?;
    let order = deps
        .wallet
        .approve(operator.user_id(), id)
        .await
        .map_err(|err| ApiError::or_not_found(err, "wallet order not found"))?;
    info!(
        operator_id = operator.user_id(),
        wallet_order_id = id,
        "Wallet order approved"
    );
    Ok(Json(WalletOrderReviewResponse {
        order: WalletOrderView::from(&order),
    }))
}

#[utoipa::path(
    post,
    path = "/admin/api/v1/wallet/orders/{id}/reject",
    params(("id" = i64, Path, description = "Wallet order id")),
    request_body = ReasonRequest,
    responses(
        (status = 200, description = "Rejected.", body = WalletOrderReviewResponse),
        (status = 403, description = "Admin gate failed."),
        (status = 404, description = "Wallet order not found."),
        (status = 409, description = "Not pending."),
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn wallet_reject(
    headers: HeaderMap,
    Extension(deps): Extension<Arc<HandlerDeps>>,
    Path(id): Path<i64>,
    JsonBody(payload): JsonBody<ReasonRequest>,
) -> ApiResult<Json<WalletOrderReviewResponse>> {
    let operator = require_admin(&headers, &deps, Some("wallet_order.reject")).await?;
    let order = deps
        .wallet
        .reject(operator.user_id(), id, payload.reason.trim())
        .await
        .map_err(|err| ApiError::or_not_found(err, "wallet order not found"))?;
    Ok(Json(WalletOrderReviewResponse {
        order: WalletOrderView::from(&order),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wallet_status_filter() {
        assert_eq!(wallet_status(None), Ok(None));
        assert_eq!(wallet_status(Some("all")), Ok(None));
        assert_eq!(
            wallet_status(Some("PENDING_REVIEW")),
            Ok(Some(WalletOrderStatus::PendingReview))
        );
        assert!(wallet_status(Some("paid")).is_err());
    }

    #[test]
    fn order_status_filter_is_shared() {
        assert_eq!(
            order_status_filter(Some("approved")),
            Ok(Some(crate::domain::OrderStatus::Approved))
        );
        assert!(order_status_filter(Some("nope")).is_err());
    }
}
