//! Collaborator contracts consumed by the HTTP handlers.
//!
//! Persistence, provider plugins and delivery transports live behind these traits. Handlers hold
//! them as `Arc<dyn …>` inside [`crate::api::HandlerDeps`]; [`crate::store::memory`] implements
//! all of them in-process.
//!
//! Every method returns [`ServiceError`]; sentinel kinds map onto fixed HTTP statuses and every
//! other failure is surfaced with its own message.

use crate::domain::{
    Captcha, Channel, CodePolicy, ContactKind, CouponPreview, GeoLocation, NotifyOutcome,
    NotifyRequest,
    NotifyResult, Order, OrderDetail, OrderEvent, OrderFilter, OrderItem, OrderItemInput,
    OrderPayment, PaymentInput, PaymentMethod, PaymentSelectInput, PaymentSelectResult,
    Permission, ProviderPaymentInput, RefundResult, RegisterInput, RenewInput, ResizeInput,
    ResizeQuote, Setting, Ticket, TotpSetup, User, UserStatus, VpsInstance, Wallet, WalletOrder,
    WalletOrderInput, WalletOrderStatus,
};
use crate::error::ServiceError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::info;

pub type ServiceResult<T> = Result<T, ServiceError>;

#[async_trait]
pub trait AuthService: Send + Sync {
    async fn register(&self, input: RegisterInput) -> ServiceResult<User>;

    /// `account` may be a username, email or phone number.
    async fn login(&self, account: &str, password: &str) -> ServiceResult<User>;

    async fn get_user(&self, user_id: i64) -> ServiceResult<User>;

    async fn find_user_by_username(&self, username: &str) -> ServiceResult<Option<User>>;

    async fn find_user_by_email(&self, email: &str) -> ServiceResult<Option<User>>;

    async fn find_user_by_phone(&self, phone: &str) -> ServiceResult<Option<User>>;

    async fn verify_password(&self, user_id: i64, password: &str) -> ServiceResult<()>;

    /// Rotates the password and advances `password_changed_at`.
    async fn update_password(&self, user_id: i64, password: &str) -> ServiceResult<User>;

    async fn update_contact(
        &self,
        user_id: i64,
        kind: ContactKind,
        value: &str,
    ) -> ServiceResult<User>;

    async fn record_login(&self, user_id: i64, ip: &str, at: DateTime<Utc>) -> ServiceResult<()>;

    /// Stores a fresh code for `(channel, receiver, purpose)` and returns it for delivery.
    async fn create_verification_code(
        &self,
        channel: Channel,
        receiver: &str,
        purpose: &str,
        policy: CodePolicy,
    ) -> ServiceResult<String>;

    /// Consumes the code on success.
    async fn verify_verification_code(
        &self,
        channel: Channel,
        receiver: &str,
        purpose: &str,
        code: &str,
    ) -> ServiceResult<()>;

    async fn create_captcha(&self, policy: CodePolicy) -> ServiceResult<Captcha>;

    async fn verify_captcha(&self, captcha_id: &str, code: &str) -> ServiceResult<()>;

    /// Generates a pending secret. Rebinding an enrolled user requires `current_code`.
    async fn setup_totp(
        &self,
        user_id: i64,
        password: &str,
        current_code: Option<&str>,
    ) -> ServiceResult<TotpSetup>;

    async fn confirm_totp(&self, user_id: i64, code: &str) -> ServiceResult<()>;

    async fn verify_totp(&self, user_id: i64, code: &str) -> ServiceResult<()>;
}

#[async_trait]
pub trait AdminService: Send + Sync {
    async fn update_admin_status(
        &self,
        operator_id: i64,
        user_id: i64,
        status: UserStatus,
    ) -> ServiceResult<()>;
}

#[async_trait]
pub trait SettingsService: Send + Sync {
    async fn get(&self, key: &str) -> ServiceResult<Option<String>>;

    async fn list(&self) -> ServiceResult<Vec<Setting>>;

    async fn update(&self, key: &str, value: &str) -> ServiceResult<()>;
}

#[async_trait]
pub trait PermissionService: Send + Sync {
    async fn is_primary_admin(&self, user_id: i64) -> ServiceResult<bool>;

    async fn has_permission(&self, user_id: i64, code: &str) -> ServiceResult<bool>;

    async fn list_permissions(&self) -> ServiceResult<Vec<Permission>>;
}

/// Order construction and lifecycle.
///
/// Creation calls keyed by `(user_id, idempotency_key)` must return the original order on replay,
/// and provisioning must run at most once per order.
#[async_trait]
pub trait OrderService: Send + Sync {
    /// Orders the user's cart and clears it. A non-empty `coupon_code` is applied to the total.
    async fn create_order_from_cart(
        &self,
        user_id: i64,
        currency: &str,
        coupon_code: &str,
        idempotency_key: &str,
    ) -> ServiceResult<(Order, Vec<OrderItem>)>;

    async fn create_order_from_items(
        &self,
        user_id: i64,
        currency: &str,
        items: Vec<OrderItemInput>,
        coupon_code: &str,
        idempotency_key: &str,
    ) -> ServiceResult<(Order, Vec<OrderItem>)>;

    async fn create_renew_order(
        &self,
        user_id: i64,
        vps_id: i64,
        input: RenewInput,
    ) -> ServiceResult<Order>;

    async fn create_emergency_renew_order(&self, user_id: i64, vps_id: i64)
    -> ServiceResult<Order>;

    async fn quote_resize(
        &self,
        user_id: i64,
        vps_id: i64,
        input: &ResizeInput,
    ) -> ServiceResult<ResizeQuote>;

    async fn create_resize_order(
        &self,
        user_id: i64,
        vps_id: i64,
        input: ResizeInput,
    ) -> ServiceResult<(Order, ResizeQuote)>;

    async fn request_refund(
        &self,
        user_id: i64,
        vps_id: i64,
        reason: &str,
    ) -> ServiceResult<RefundResult>;

    /// Empty `items` evaluates the user's cart.
    async fn preview_coupon(
        &self,
        user_id: i64,
        coupon_code: &str,
        items: Vec<OrderItemInput>,
    ) -> ServiceResult<CouponPreview>;

    async fn submit_payment(
        &self,
        user_id: i64,
        order_id: i64,
        input: PaymentInput,
        idempotency_key: &str,
    ) -> ServiceResult<OrderPayment>;

    async fn cancel_order(&self, user_id: i64, order_id: i64) -> ServiceResult<()>;

    async fn list_orders(&self, filter: OrderFilter) -> ServiceResult<(Vec<Order>, usize)>;

    async fn get_order_detail(&self, order_id: i64) -> ServiceResult<OrderDetail>;

    async fn approve_order(&self, operator_id: i64, order_id: i64) -> ServiceResult<()>;

    async fn reject_order(&self, operator_id: i64, order_id: i64, reason: &str)
    -> ServiceResult<()>;

    async fn mark_paid(
        &self,
        operator_id: i64,
        order_id: i64,
        input: PaymentInput,
    ) -> ServiceResult<OrderPayment>;

    async fn retry_provision(&self, operator_id: i64, order_id: i64) -> ServiceResult<()>;

    async fn delete_order(&self, operator_id: i64, order_id: i64) -> ServiceResult<()>;

    /// Approves the payment identified by `trade_no` and its order, then provisions once.
    /// A replay reports [`NotifyOutcome::AlreadyApproved`] without side effects.
    async fn approve_payment_by_trade_no(
        &self,
        provider: &str,
        trade_no: &str,
        amount: i64,
    ) -> ServiceResult<NotifyOutcome>;
}

#[async_trait]
pub trait PaymentService: Send + Sync {
    async fn list_user_methods(&self, user_id: i64, scene: &str)
    -> ServiceResult<Vec<PaymentMethod>>;

    async fn select_payment(
        &self,
        user_id: i64,
        order_id: i64,
        input: PaymentSelectInput,
    ) -> ServiceResult<PaymentSelectResult>;

    async fn create_provider_payment(
        &self,
        method: &str,
        input: ProviderPaymentInput,
    ) -> ServiceResult<PaymentSelectResult>;

    /// Verifies the raw callback with the provider's plugin.
    async fn verify_notify(
        &self,
        provider: &str,
        request: NotifyRequest,
    ) -> ServiceResult<NotifyResult>;
}

#[async_trait]
pub trait WalletOrderService: Send + Sync {
    async fn get_wallet(&self, user_id: i64) -> ServiceResult<Wallet>;

    async fn create_recharge(
        &self,
        user_id: i64,
        input: WalletOrderInput,
    ) -> ServiceResult<WalletOrder>;

    /// Rejects with [`ServiceError::InsufficientBalance`] when the balance cannot cover it.
    async fn create_withdraw(
        &self,
        user_id: i64,
        input: WalletOrderInput,
    ) -> ServiceResult<WalletOrder>;

    async fn list_user_orders(
        &self,
        user_id: i64,
        limit: usize,
        offset: usize,
    ) -> ServiceResult<(Vec<WalletOrder>, usize)>;

    async fn list_orders(
        &self,
        status: Option<WalletOrderStatus>,
        limit: usize,
        offset: usize,
    ) -> ServiceResult<(Vec<WalletOrder>, usize)>;

    /// Adjusts the balance in the same step as the status change.
    async fn approve(&self, operator_id: i64, order_id: i64) -> ServiceResult<WalletOrder>;

    async fn reject(
        &self,
        operator_id: i64,
        order_id: i64,
        reason: &str,
    ) -> ServiceResult<WalletOrder>;

    async fn find_recharge_by_payment(
        &self,
        provider: &str,
        order_no: &str,
        trade_no: &str,
    ) -> ServiceResult<Option<WalletOrder>>;
}

#[async_trait]
pub trait VpsService: Send + Sync {
    async fn get_instance(&self, vps_id: i64) -> ServiceResult<VpsInstance>;

    /// Features advertised by the instance's automation plugin, if it reports any.
    async fn automation_features(&self, instance: &VpsInstance) -> ServiceResult<Option<Vec<String>>>;
}

/// Storage for security and reset tickets.
#[async_trait]
pub trait TicketStore: Send + Sync {
    async fn insert(&self, ticket: Ticket) -> ServiceResult<()>;

    async fn get(&self, token: &str) -> ServiceResult<Option<Ticket>>;

    async fn mark_used(&self, token: &str, at: DateTime<Utc>) -> ServiceResult<()>;
}

/// IP to location lookup for login alerts.
#[async_trait]
pub trait GeoResolver: Send + Sync {
    /// Resolves a public `ip` against the database at `source` (the `auth_geoip_mmdb_path`
    /// setting).
    ///
    /// # Errors
    /// [`ServiceError::InvalidInput`] for an unparsable or non-public address and
    /// [`ServiceError::NotFound`] when the address has no record or no source is configured.
    async fn resolve(&self, ip: &str, source: &str) -> ServiceResult<GeoLocation>;
}

/// Append-only order event log with live fan-out.
#[async_trait]
pub trait EventBroker: Send + Sync {
    async fn publish(&self, order_id: i64, event_type: &str, data: Value)
    -> ServiceResult<OrderEvent>;

    /// Events with `seq > after_seq`, in order.
    async fn list(&self, order_id: i64, after_seq: i64) -> ServiceResult<Vec<OrderEvent>>;

    /// Replays events after `last_seq`, then yields live events until dropped.
    async fn stream(
        &self,
        order_id: i64,
        last_seq: i64,
    ) -> ServiceResult<BoxStream<'static, OrderEvent>>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundMessage {
    pub to: String,
    pub template: String,
    pub vars: BTreeMap<String, String>,
}

impl OutboundMessage {
    #[must_use]
    pub fn new(to: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            template: template.into(),
            vars: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn var(mut self, key: &str, value: impl Into<String>) -> Self {
        self.vars.insert(key.to_string(), value.into());
        self
    }
}

/// Email or SMS delivery. Transport failures come back as [`ServiceError::Transport`].
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> ServiceResult<()>;
}

/// Local sender that logs the template and recipient instead of delivering.
#[derive(Clone, Debug)]
pub struct LogSender {
    channel: Channel,
}

impl LogSender {
    #[must_use]
    pub const fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl MessageSender for LogSender {
    async fn send(&self, message: &OutboundMessage) -> ServiceResult<()> {
        info!(
            channel = %self.channel,
            to = %message.to,
            template = %message.template,
            "message send stub"
        );
        Ok(())
    }
}

/// Sender whose transport is switched off; every delivery fails with `"<name> disabled"`.
#[derive(Clone, Debug)]
pub struct DisabledSender {
    name: &'static str,
}

impl DisabledSender {
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self { name }
    }
}

#[async_trait]
impl MessageSender for DisabledSender {
    async fn send(&self, _message: &OutboundMessage) -> ServiceResult<()> {
        Err(ServiceError::transport(format!("{} disabled", self.name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_sender_reports_transport() {
        let sender = DisabledSender::new("smtp");
        let result = sender
            .send(&OutboundMessage::new("a@example.com", "t"))
            .await;
        assert_eq!(result, Err(ServiceError::transport("smtp disabled")));
    }

    #[tokio::test]
    async fn log_sender_accepts() {
        let sender = LogSender::new(Channel::Sms);
        let message = OutboundMessage::new("13900010001", "register_verify_code").var("code", "123456");
        assert_eq!(message.vars.get("code").map(String::as_str), Some("123456"));
        assert!(sender.send(&message).await.is_ok());
    }
}
