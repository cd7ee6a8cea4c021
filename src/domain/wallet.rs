use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum WalletOrderType {
    Recharge,
    Withdraw,
    Refund,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum WalletOrderStatus {
    PendingReview,
    Approved,
    Rejected,
    Canceled,
}

/// Balance is adjusted only when the order is approved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletOrder {
    pub id: i64,
    pub user_id: i64,
    pub order_type: WalletOrderType,
    pub amount: i64,
    pub currency: String,
    pub status: WalletOrderStatus,
    pub note: String,
    pub meta: Map<String, Value>,
    pub reviewed_by: Option<i64>,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl WalletOrder {
    #[must_use]
    pub fn meta_str(&self, key: &str) -> &str {
        self.meta.get(key).and_then(Value::as_str).unwrap_or("")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub user_id: i64,
    pub balance: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WalletOrderInput {
    pub amount: i64,
    pub currency: String,
    pub note: String,
    pub meta: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PaymentMethod {
    pub key: String,
    pub name: String,
    pub provider: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderPaymentInput {
    pub user_id: i64,
    pub order_no: String,
    pub subject: String,
    pub amount: i64,
    pub currency: String,
    pub return_url: String,
    pub notify_url: String,
}
