use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::HashMap, str::FromStr};
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum OrderSource {
    Cart,
    Direct,
    Renew,
    Resize,
    Refund,
    EmergencyRenew,
    OpenApi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Draft,
    PendingPayment,
    PendingReview,
    Approved,
    Provisioning,
    Active,
    Rejected,
    Failed,
    Canceled,
}

impl OrderStatus {
    pub const ALL: [Self; 9] = [
        Self::Draft,
        Self::PendingPayment,
        Self::PendingReview,
        Self::Approved,
        Self::Provisioning,
        Self::Active,
        Self::Rejected,
        Self::Failed,
        Self::Canceled,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::PendingPayment => "pending_payment",
            Self::PendingReview => "pending_review",
            Self::Approved => "approved",
            Self::Provisioning => "provisioning",
            Self::Active => "active",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    /// Statuses an admin may still approve or reject.
    #[must_use]
    pub const fn is_reviewable(self) -> bool {
        matches!(self, Self::PendingPayment | Self::PendingReview)
    }

    /// Orders that still block another resize/refund/emergency renew on the same instance.
    #[must_use]
    pub const fn is_in_flight(self) -> bool {
        matches!(
            self,
            Self::Draft
                | Self::PendingPayment
                | Self::PendingReview
                | Self::Approved
                | Self::Provisioning
        )
    }
}

impl FromStr for OrderStatus {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == value)
            .ok_or(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ItemAction {
    Create,
    Renew,
    Resize,
    Refund,
    EmergencyRenew,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    PendingPayment,
    PendingReview,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    pub user_id: i64,
    pub order_no: String,
    pub source: OrderSource,
    pub status: OrderStatus,
    /// Cents, already net of `coupon_discount`.
    pub total_amount: i64,
    pub currency: String,
    pub idempotency_key: String,
    pub coupon_id: Option<i64>,
    pub coupon_discount: i64,
    pub pending_reason: String,
    pub approved_by: Option<i64>,
    pub rejected_reason: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: i64,
    pub order_id: i64,
    pub package_id: i64,
    pub system_id: i64,
    pub spec: Value,
    pub qty: i32,
    pub amount: i64,
    pub status: String,
    pub action: ItemAction,
    pub duration_months: i32,
    pub automation_instance_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPayment {
    pub id: i64,
    pub order_id: i64,
    pub user_id: i64,
    pub method: String,
    pub amount: i64,
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

/// Append-only record; `seq` is monotonic per order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderEvent {
    pub id: i64,
    pub order_id: i64,
    pub seq: i64,
    pub event_type: String,
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct OrderItemInput {
    pub package_id: i64,
    #[serde(default)]
    pub system_id: i64,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub spec: Value,
    #[serde(default = "default_qty")]
    pub qty: i32,
    #[serde(default = "default_duration_months")]
    pub duration_months: i32,
    #[serde(default)]
    pub action: Option<ItemAction>,
}

const fn default_qty() -> i32 {
    1
}

const fn default_duration_months() -> i32 {
    1
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaymentInput {
    pub method: String,
    pub amount: i64,
    pub currency: String,
    pub trade_no: String,
    pub note: String,
    pub screenshot_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaymentSelectInput {
    pub method: String,
    pub return_url: String,
    pub notify_url: String,
    pub extra: HashMap<String, String>,
    pub client_ip: String,
    pub device: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSelectResult {
    pub method: String,
    pub status: String,
    pub trade_no: String,
    pub pay_url: String,
    pub extra: HashMap<String, String>,
    pub paid: bool,
    pub message: String,
    /// Wallet balance in cents after a balance payment.
    pub balance: i64,
}

/// Raw provider callback, passed to the verifier untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotifyRequest {
    pub method: String,
    pub headers: HashMap<String, String>,
    pub query: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotifyResult {
    pub order_no: String,
    pub trade_no: String,
    pub paid: bool,
    pub amount: i64,
    /// Provider-specific acknowledgement to echo back verbatim.
    pub ack_body: String,
}

#[derive(Debug, Clone)]
pub enum NotifyOutcome {
    Approved(OrderPayment),
    AlreadyApproved(OrderPayment),
}

impl NotifyOutcome {
    #[must_use]
    pub fn payment(&self) -> &OrderPayment {
        match self {
            Self::Approved(payment) | Self::AlreadyApproved(payment) => payment,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenewInput {
    pub renew_days: Option<i32>,
    pub duration_months: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResizeInput {
    pub spec: Option<Value>,
    pub target_package_id: i64,
    pub reset_addons: bool,
    pub scheduled_at: Option<DateTime<Utc>>,
}

/// Cost deltas for changing an instance's package, in cents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeQuote {
    pub current_package_id: i64,
    pub target_package_id: i64,
    pub current_monthly: i64,
    pub target_monthly: i64,
    pub charge_amount: i64,
    pub refund_amount: i64,
}

#[derive(Debug, Clone)]
pub struct RefundResult {
    pub order: Order,
    pub refund_amount: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CouponPreview {
    pub coupon_code: String,
    pub original: i64,
    pub discount: i64,
    pub final_total: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderFilter {
    pub user_id: Option<i64>,
    pub status: Option<OrderStatus>,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Clone)]
pub struct OrderDetail {
    pub order: Order,
    pub items: Vec<OrderItem>,
    pub payments: Vec<OrderPayment>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in OrderStatus::ALL {
            assert_eq!(status.as_str().parse::<OrderStatus>(), Ok(status));
        }
        assert!("all".parse::<OrderStatus>().is_err());
    }

    #[test]
    fn reviewable_statuses() {
        assert!(OrderStatus::PendingReview.is_reviewable());
        assert!(OrderStatus::PendingPayment.is_reviewable());
        assert!(!OrderStatus::Approved.is_reviewable());
        assert!(!OrderStatus::Canceled.is_reviewable());
    }

    #[test]
    fn item_input_defaults() -> anyhow::Result<()> {
        let input: OrderItemInput = serde_json::from_str(r#"{"package_id": 3}"#)?;
        assert_eq!(input.qty, 1);
        assert_eq!(input.duration_months, 1);
        assert!(input.action.is_none());
        Ok(())
    }
}
