//! Wire projections of domain records. Money leaves the process as yuan.

use crate::api::gateway::{mask_email, mask_phone};
use crate::domain::{
    CouponPreview, ItemAction, Order, OrderEvent, OrderItem, OrderPayment, OrderSource,
    OrderStatus, PaymentSelectResult, PaymentStatus, ResizeQuote, User, UserRole, Wallet,
    WalletOrder, WalletOrderStatus, WalletOrderType,
};
use crate::money::cents_to_yuan;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use utoipa::ToSchema;

/// Resize item spec fields stored in cents.
const RESIZE_MONEY_FIELDS: [&str; 4] = [
    "current_monthly",
    "target_monthly",
    "charge_amount",
    "refund_amount",
];

#[derive(Debug, Serialize, ToSchema)]
pub struct OkResponse {
    pub ok: bool,
}

impl OkResponse {
    #[must_use]
    pub const fn ok() -> Self {
        Self { ok: true }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
    pub total: usize,
}

/// Session view of the account, with contacts masked.
#[derive(Debug, Serialize, ToSchema)]
pub struct UserView {
    pub id: i64,
    pub username: String,
    pub role: UserRole,
    pub totp_enabled: bool,
    pub email_bound: bool,
    pub phone_bound: bool,
    pub email_masked: String,
    pub phone_masked: String,
}

impl From<&User> for UserView {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            role: user.role,
            totp_enabled: user.totp_enabled,
            email_bound: user.email_bound(),
            phone_bound: user.phone_bound(),
            email_masked: mask_email(&user.email),
            phone_masked: mask_phone(&user.phone),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct UserBrief {
    pub id: i64,
    pub username: String,
    pub role: UserRole,
}

impl From<&User> for UserBrief {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            role: user.role,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OrderView {
    pub id: i64,
    pub user_id: i64,
    pub order_no: String,
    pub source: OrderSource,
    pub status: OrderStatus,
    pub total_amount: f64,
    pub currency: String,
    pub coupon_id: Option<i64>,
    pub coupon_discount: f64,
    pub idempotency_key: String,
    pub pending_reason: String,
    pub approved_by: Option<i64>,
    pub rejected_reason: String,
    pub can_review: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Order> for OrderView {
    fn from(order: &Order) -> Self {
        Self {
            id: order.id,
            user_id: order.user_id,
            order_no: order.order_no.clone(),
            source: order.source,
            status: order.status,
            total_amount: cents_to_yuan(order.total_amount),
            currency: order.currency.clone(),
            coupon_id: order.coupon_id,
            coupon_discount: cents_to_yuan(order.coupon_discount),
            idempotency_key: order.idempotency_key.clone(),
            pending_reason: order.pending_reason.clone(),
            approved_by: order.approved_by,
            rejected_reason: order.rejected_reason.clone(),
            can_review: order.status.is_reviewable(),
            created_at: order.created_at,
            updated_at: order.updated_at,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OrderItemView {
    pub id: i64,
    pub order_id: i64,
    pub package_id: i64,
    pub system_id: i64,
    #[schema(value_type = Object)]
    pub spec: Value,
    pub qty: i32,
    pub amount: f64,
    pub status: String,
    pub automation_instance_id: String,
    pub action: ItemAction,
    pub duration_months: i32,
}

impl From<&OrderItem> for OrderItemView {
    fn from(item: &OrderItem) -> Self {
        let spec = if item.action == ItemAction::Resize {
            resize_spec_in_yuan(&item.spec)
        } else {
            item.spec.clone()
        };
        Self {
            id: item.id,
            order_id: item.order_id,
            package_id: item.package_id,
            system_id: item.system_id,
            spec,
            qty: item.qty,
            amount: cents_to_yuan(item.amount),
            status: item.status.clone(),
            automation_instance_id: item.automation_instance_id.clone(),
            action: item.action,
            duration_months: item.duration_months,
        }
    }
}

fn resize_spec_in_yuan(spec: &Value) -> Value {
    let Some(fields) = spec.as_object() else {
        return spec.clone();
    };
    let mut converted: Map<String, Value> = fields.clone();
    for key in RESIZE_MONEY_FIELDS {
        if let Some(cents) = fields.get(key).and_then(Value::as_i64) {
            converted.insert(key.to_string(), Value::from(cents_to_yuan(cents)));
        }
    }
    Value::Object(converted)
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OrderPaymentView {
    pub id: i64,
    pub order_id: i64,
    pub user_id: i64,
    pub method: String,
    pub amount: f64,
    pub currency: String,
    pub trade_no: String,
    pub note: String,
    pub screenshot_url: String,
    pub status: PaymentStatus,
    pub idempotency_key: String,
    pub reviewed_by: Option<i64>,
    pub review_reason: String,
    pub created_at: DateTime<Utc>,
}

impl From<&OrderPayment> for OrderPaymentView {
    fn from(payment: &OrderPayment) -> Self {
        Self {
            id: payment.id,
            order_id: payment.order_id,
            user_id: payment.user_id,
            method: payment.method.clone(),
            amount: cents_to_yuan(payment.amount),
            currency: payment.currency.clone(),
            trade_no: payment.trade_no.clone(),
            note: payment.note.clone(),
            screenshot_url: payment.screenshot_url.clone(),
            status: payment.status,
            idempotency_key: payment.idempotency_key.clone(),
            reviewed_by: payment.reviewed_by,
            review_reason: payment.review_reason.clone(),
            created_at: payment.created_at,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OrderEventView {
    pub id: i64,
    pub order_id: i64,
    pub seq: i64,
    #[serde(rename = "type")]
    pub event_type: String,
    #[schema(value_type = Object)]
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

impl From<&OrderEvent> for OrderEventView {
    fn from(event: &OrderEvent) -> Self {
        Self {
            id: event.id,
            order_id: event.order_id,
            seq: event.seq,
            event_type: event.event_type.clone(),
            data: event.data.clone(),
            created_at: event.created_at,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PaymentSelectView {
    pub method: String,
    pub status: String,
    pub trade_no: String,
    pub pay_url: String,
    pub extra: HashMap<String, String>,
    pub paid: bool,
    pub message: String,
    pub balance: f64,
}

impl From<PaymentSelectResult> for PaymentSelectView {
    fn from(result: PaymentSelectResult) -> Self {
        Self {
            method: result.method,
            status: result.status,
            trade_no: result.trade_no,
            pay_url: result.pay_url,
            extra: result.extra,
            paid: result.paid,
            message: result.message,
            balance: cents_to_yuan(result.balance),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ResizeQuoteView {
    pub current_package_id: i64,
    pub target_package_id: i64,
    pub current_monthly: f64,
    pub target_monthly: f64,
    pub charge_amount: f64,
    pub refund_amount: f64,
}

impl From<ResizeQuote> for ResizeQuoteView {
    fn from(quote: ResizeQuote) -> Self {
        Self {
            current_package_id: quote.current_package_id,
            target_package_id: quote.target_package_id,
            current_monthly: cents_to_yuan(quote.current_monthly),
            target_monthly: cents_to_yuan(quote.target_monthly),
            charge_amount: cents_to_yuan(quote.charge_amount),
            refund_amount: cents_to_yuan(quote.refund_amount),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CouponPreviewView {
    pub coupon_code: String,
    pub original: f64,
    pub discount: f64,
    #[serde(rename = "final")]
    pub final_total: f64,
}

impl From<CouponPreview> for CouponPreviewView {
    fn from(preview: CouponPreview) -> Self {
        Self {
            coupon_code: preview.coupon_code,
            original: cents_to_yuan(preview.original),
            discount: cents_to_yuan(preview.discount),
            final_total: cents_to_yuan(preview.final_total),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct WalletView {
    pub user_id: i64,
    pub balance: f64,
    pub updated_at: DateTime<Utc>,
}

impl From<&Wallet> for WalletView {
    fn from(wallet: &Wallet) -> Self {
        Self {
            user_id: wallet.user_id,
            balance: cents_to_yuan(wallet.balance),
            updated_at: wallet.updated_at,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct WalletOrderView {
    pub id: i64,
    pub user_id: i64,
    #[serde(rename = "type")]
    pub order_type: WalletOrderType,
    pub amount: f64,
    pub currency: String,
    pub status: WalletOrderStatus,
    pub note: String,
    #[schema(value_type = Object)]
    pub meta: Map<String, Value>,
    pub reviewed_by: Option<i64>,
    pub review_reason: String,
    pub created_at: DateTime<Utc>,
}

impl From<&WalletOrder> for WalletOrderView {
    fn from(order: &WalletOrder) -> Self {
        Self {
            id: order.id,
            user_id: order.user_id,
            order_type: order.order_type,
            amount: cents_to_yuan(order.amount),
            currency: order.currency.clone(),
            status: order.status,
            note: order.note.clone(),
            meta: order.meta.clone(),
            reviewed_by: order.reviewed_by,
            review_reason: order.reason.clone(),
            created_at: order.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resize_spec_money_becomes_yuan() {
        let spec = json!({
            "vps_id": 3,
            "current_monthly": 1000,
            "target_monthly": 2550,
            "charge_amount": 775,
            "refund_amount": 0,
        });
        let converted = resize_spec_in_yuan(&spec);
        assert_eq!(converted["vps_id"], 3);
        assert_eq!(converted["target_monthly"], 25.5);
        assert_eq!(converted["charge_amount"], 7.75);
        assert_eq!(converted["refund_amount"], 0.0);
    }

    #[test]
    fn non_object_spec_is_untouched() {
        assert_eq!(resize_spec_in_yuan(&Value::Null), Value::Null);
    }
}
