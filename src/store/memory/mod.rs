//! In-process implementation of every collaborator.
//!
//! All records live in one [`State`] behind a `tokio` mutex, so each trait call is a single
//! serialized transition. That gives the uniqueness rules the adapter relies on for free:
//! `(user, idempotency key) -> order`, unique `trade_no`, one approved payment per order, one
//! in-flight resize/refund/emergency renew per instance and at most one provisioning run per
//! order. Order events are published to the shared [`MemoryBroker`] after the state lock is
//! released.

mod auth;
mod orders;
mod payments;

use crate::domain::{
    Channel, GeoLocation, NotifyResult, Order, OrderItem, OrderItemInput, OrderPayment,
    Permission, Setting, Ticket, User, UserRole, UserStatus, VpsInstance, Wallet, WalletOrder,
};
use crate::error::ServiceError;
use crate::events::MemoryBroker;
use crate::services::{EventBroker, ServiceResult};
use chrono::{DateTime, Utc};
use rand::{Rng, RngCore, rngs::OsRng};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use subtle::ConstantTimeEq;
use tokio::sync::Mutex;
use tracing::warn;

pub(crate) const TOTP_ISSUER: &str = "Xiaoheiplay";

/// Catalog entry priced per month, in cents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub id: i64,
    pub name: String,
    pub goods_type_id: i64,
    pub monthly_price: i64,
    pub cpu: i32,
    pub memory_gb: i32,
    pub disk_gb: i32,
    pub bandwidth_mbps: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CouponKind {
    /// Whole percent off the original total.
    Percent(i64),
    /// Fixed discount in cents.
    Amount(i64),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct StoredCoupon {
    pub id: i64,
    pub kind: CouponKind,
}

#[derive(Debug, Clone)]
pub(crate) struct UserRecord {
    pub user: User,
    pub salt: String,
    pub password_hash: String,
    pub totp_secret: Option<Vec<u8>>,
    pub pending_totp: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub(crate) struct StoredCode {
    pub code: String,
    pub expires_at: DateTime<Utc>,
}

/// Scripted or HMAC-verified notify handling for one provider.
#[derive(Debug, Clone, Default)]
pub(crate) struct ProviderConfig {
    pub name: String,
    pub secret: String,
    pub scripted: Option<NotifyResult>,
}

#[derive(Default)]
pub(crate) struct State {
    pub users: BTreeMap<i64, UserRecord>,
    pub codes: HashMap<(Channel, String, String), StoredCode>,
    pub captchas: HashMap<String, StoredCode>,
    pub settings: BTreeMap<String, String>,
    pub permissions: Vec<Permission>,
    pub grants: HashMap<i64, HashSet<String>>,
    pub tickets: HashMap<String, Ticket>,
    pub locations: HashMap<IpAddr, GeoLocation>,
    pub packages: BTreeMap<i64, Package>,
    pub coupons: HashMap<String, StoredCoupon>,
    pub carts: HashMap<i64, Vec<OrderItemInput>>,
    pub orders: BTreeMap<i64, Order>,
    pub items: BTreeMap<i64, OrderItem>,
    pub payments: BTreeMap<i64, OrderPayment>,
    pub order_keys: HashMap<(i64, String), i64>,
    pub instances: BTreeMap<i64, VpsInstance>,
    pub automation_features: HashMap<i64, Vec<String>>,
    pub wallets: HashMap<i64, Wallet>,
    pub wallet_orders: BTreeMap<i64, WalletOrder>,
    pub providers: BTreeMap<String, ProviderConfig>,
    pub provisioned: HashSet<i64>,
    pub fail_provisioning: bool,
    next_id: i64,
}

impl State {
    pub fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn user(&self, user_id: i64) -> ServiceResult<&UserRecord> {
        self.users.get(&user_id).ok_or(ServiceError::NotFound)
    }

    pub fn user_mut(&mut self, user_id: i64) -> ServiceResult<&mut UserRecord> {
        self.users.get_mut(&user_id).ok_or(ServiceError::NotFound)
    }

    pub fn wallet_mut(&mut self, user_id: i64, now: DateTime<Utc>) -> &mut Wallet {
        self.wallets.entry(user_id).or_insert_with(|| Wallet {
            user_id,
            balance: 0,
            updated_at: now,
        })
    }
}

/// Events produced inside a state transition, published once the lock is released.
pub(crate) type PendingEvents = Vec<(i64, &'static str, Value)>;

pub struct MemoryStore {
    state: Mutex<State>,
    broker: Arc<MemoryBroker>,
    provision_calls: AtomicUsize,
}

impl MemoryStore {
    #[must_use]
    pub fn new(broker: Arc<MemoryBroker>) -> Self {
        let state = State {
            permissions: default_permissions(),
            ..State::default()
        };
        Self {
            state: Mutex::new(state),
            broker,
            provision_calls: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn broker(&self) -> Arc<MemoryBroker> {
        self.broker.clone()
    }

    pub(crate) async fn lock(&self) -> tokio::sync::MutexGuard<'_, State> {
        self.state.lock().await
    }

    /// Number of provisioning runs started so far.
    #[must_use]
    pub fn provision_count(&self) -> usize {
        self.provision_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn record_provision(&self) {
        self.provision_calls.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) async fn publish_all(&self, events: PendingEvents) {
        for (order_id, event_type, data) in events {
            if let Err(err) = self.broker.publish(order_id, event_type, data).await {
                warn!(order_id, event_type, "Failed to publish order event: {err}");
            }
        }
    }

    /// Creates an account directly, bypassing registration policy.
    ///
    /// # Errors
    /// Returns [`ServiceError::Conflict`] when the username is taken.
    pub async fn seed_user(
        &self,
        username: &str,
        password: &str,
        role: UserRole,
    ) -> ServiceResult<User> {
        let mut state = self.lock().await;
        if find_by(&state, |u| u.username.eq_ignore_ascii_case(username.trim())).is_some() {
            return Err(ServiceError::Conflict);
        }
        let id = state.next_id();
        let (salt, password_hash) = hash_new_password(password)?;
        let user = User {
            id,
            username: username.trim().to_string(),
            email: String::new(),
            phone: String::new(),
            qq: String::new(),
            role,
            status: UserStatus::Active,
            totp_enabled: false,
            last_login_ip: String::new(),
            last_login_at: None,
            permission_group_id: None,
            user_tier_id: None,
            tier_expire_at: None,
            password_changed_at: None,
            created_at: Utc::now(),
        };
        state.users.insert(
            id,
            UserRecord {
                user: user.clone(),
                salt,
                password_hash,
                totp_secret: None,
                pending_totp: None,
            },
        );
        Ok(user)
    }

    pub async fn set_setting(&self, key: &str, value: &str) {
        self.lock()
            .await
            .settings
            .insert(key.trim().to_string(), value.to_string());
    }

    pub async fn settings_snapshot(&self) -> Vec<Setting> {
        self.lock()
            .await
            .settings
            .iter()
            .map(|(key, value)| Setting {
                key: key.clone(),
                value: value.clone(),
            })
            .collect()
    }

    pub async fn grant_permission(&self, user_id: i64, code: &str) {
        self.lock()
            .await
            .grants
            .entry(user_id)
            .or_default()
            .insert(code.to_string());
    }

    pub async fn add_package(&self, package: Package) {
        self.lock().await.packages.insert(package.id, package);
    }

    /// Registers a coupon under its upper-cased code and returns its id.
    pub async fn add_coupon(&self, code: &str, kind: CouponKind) -> i64 {
        let mut state = self.lock().await;
        let id = state.next_id();
        state
            .coupons
            .insert(code.trim().to_ascii_uppercase(), StoredCoupon { id, kind });
        id
    }

    pub async fn add_cart_item(&self, user_id: i64, item: OrderItemInput) {
        self.lock().await.carts.entry(user_id).or_default().push(item);
    }

    /// Registers an instance for `user_id` on `package_id`, expiring at `expire_at`.
    ///
    /// # Errors
    /// Returns [`ServiceError::NotFound`] for an unknown package.
    pub async fn add_instance(
        &self,
        user_id: i64,
        package_id: i64,
        expire_at: Option<DateTime<Utc>>,
    ) -> ServiceResult<VpsInstance> {
        let mut state = self.lock().await;
        let package = state
            .packages
            .get(&package_id)
            .cloned()
            .ok_or(ServiceError::NotFound)?;
        let id = state.next_id();
        let instance = instance_for(id, user_id, 0, &package, expire_at);
        state.instances.insert(id, instance.clone());
        Ok(instance)
    }

    pub async fn set_automation_features(&self, vps_id: i64, features: Vec<String>) {
        self.lock()
            .await
            .automation_features
            .insert(vps_id, features);
    }

    pub async fn credit_wallet(&self, user_id: i64, amount: i64) {
        let mut state = self.lock().await;
        let wallet = state.wallet_mut(user_id, Utc::now());
        wallet.balance += amount;
        wallet.updated_at = Utc::now();
    }

    /// Enables a payment provider whose notify callbacks are signed with `secret`.
    pub async fn register_provider(&self, name: &str, secret: &str) {
        let name = name.trim().to_ascii_lowercase();
        self.lock().await.providers.insert(
            name.clone(),
            ProviderConfig {
                name,
                secret: secret.to_string(),
                scripted: None,
            },
        );
    }

    /// Makes the provider's verifier return `result` for every callback.
    pub async fn script_notify(&self, name: &str, result: NotifyResult) {
        let name = name.trim().to_ascii_lowercase();
        self.lock()
            .await
            .providers
            .entry(name.clone())
            .or_insert_with(|| ProviderConfig {
                name,
                ..ProviderConfig::default()
            })
            .scripted = Some(result);
    }

    pub async fn set_fail_provisioning(&self, fail: bool) {
        self.lock().await.fail_provisioning = fail;
    }

    pub async fn find_order(&self, order_id: i64) -> Option<Order> {
        self.lock().await.orders.get(&order_id).cloned()
    }

    pub async fn find_payment_by_trade_no(&self, trade_no: &str) -> Option<OrderPayment> {
        self.lock()
            .await
            .payments
            .values()
            .find(|payment| payment.trade_no == trade_no)
            .cloned()
    }
}

pub(crate) fn find_by(state: &State, pred: impl Fn(&User) -> bool) -> Option<&UserRecord> {
    state.users.values().find(|record| pred(&record.user))
}

pub(crate) fn instance_for(
    id: i64,
    user_id: i64,
    order_item_id: i64,
    package: &Package,
    expire_at: Option<DateTime<Utc>>,
) -> VpsInstance {
    VpsInstance {
        id,
        user_id,
        order_item_id,
        automation_instance_id: format!("auto-{id}"),
        name: format!("vps-{id}"),
        region: "default".to_string(),
        package_id: package.id,
        goods_type_id: package.goods_type_id,
        cpu: package.cpu,
        memory_gb: package.memory_gb,
        disk_gb: package.disk_gb,
        bandwidth_mbps: package.bandwidth_mbps,
        status: "running".to_string(),
        admin_status: "normal".to_string(),
        expire_at,
        last_emergency_renew_at: None,
        spec: Value::Object(serde_json::Map::new()),
    }
}

pub(crate) fn random_hex(len_bytes: usize) -> ServiceResult<String> {
    let mut bytes = vec![0u8; len_bytes];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| ServiceError::internal(format!("random source failed: {e}")))?;
    Ok(hex::encode(bytes))
}

pub(crate) fn random_code(alphabet: &[u8], length: usize) -> String {
    let mut rng = OsRng;
    (0..length)
        .map(|_| char::from(alphabet[rng.gen_range(0..alphabet.len())]))
        .collect()
}

fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

pub(crate) fn hash_new_password(password: &str) -> ServiceResult<(String, String)> {
    let salt = random_hex(16)?;
    let hash = hash_password(&salt, password);
    Ok((salt, hash))
}

pub(crate) fn password_matches(record: &UserRecord, password: &str) -> bool {
    let candidate = hash_password(&record.salt, password);
    candidate
        .as_bytes()
        .ct_eq(record.password_hash.as_bytes())
        .into()
}

fn default_permissions() -> Vec<Permission> {
    let entries: &[(&str, &str, &str, i32)] = &[
        ("order", "Orders", "", 1),
        ("order.list", "List orders", "order", 1),
        ("order.view", "View order", "order", 2),
        ("order.approve", "Approve order", "order", 3),
        ("order.reject", "Reject order", "order", 4),
        ("order.mark_paid", "Mark order paid", "order", 5),
        ("order.retry", "Retry provisioning", "order", 6),
        ("order.delete", "Delete order", "order", 7),
        ("wallet_order", "Wallet orders", "", 2),
        ("wallet_order.list", "List wallet orders", "wallet_order", 1),
        ("wallet_order.approve", "Approve wallet order", "wallet_order", 2),
        ("wallet_order.reject", "Reject wallet order", "wallet_order", 3),
        ("user", "Users", "", 3),
        ("user.impersonate", "Impersonate user", "user", 1),
        ("settings", "Settings", "", 4),
        ("settings.view", "View settings", "settings", 1),
        ("settings.update", "Update settings", "settings", 2),
        ("permission", "Permissions", "", 5),
        ("permission.tree", "Permission tree", "permission", 1),
        ("permission.list", "Permission list", "permission", 2),
    ];
    entries
        .iter()
        .map(|(code, name, parent, sort)| Permission {
            code: (*code).to_string(),
            name: (*name).to_string(),
            parent_code: (*parent).to_string(),
            sort_order: *sort,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[tokio::test]
    async fn seeded_passwords_are_salted() -> Result<()> {
        let store = MemoryStore::new(Arc::new(MemoryBroker::new()));
        let a = store.seed_user("alice", "secret1", UserRole::User).await?;
        let b = store.seed_user("bob", "secret1", UserRole::User).await?;
        let state = store.lock().await;
        let (ra, rb) = (state.user(a.id)?, state.user(b.id)?);
        assert_ne!(ra.password_hash, rb.password_hash);
        assert!(password_matches(ra, "secret1"));
        assert!(!password_matches(ra, "secret2"));
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_seed_conflicts() -> Result<()> {
        let store = MemoryStore::new(Arc::new(MemoryBroker::new()));
        store.seed_user("alice", "pw", UserRole::User).await?;
        assert!(matches!(
            store.seed_user(" ALICE ", "pw", UserRole::User).await,
            Err(ServiceError::Conflict)
        ));
        Ok(())
    }

    #[test]
    fn codes_use_alphabet() {
        let code = random_code(b"0123456789", 6);
        assert_eq!(code.len(), 6);
        assert!(code.bytes().all(|b| b.is_ascii_digit()));
    }
}
