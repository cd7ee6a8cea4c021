use super::{MemoryStore, PendingEvents, State, random_hex};
use crate::domain::{
    DEFAULT_CURRENCY, NotifyRequest, NotifyResult, OrderStatus, PaymentInput, PaymentMethod,
    PaymentSelectInput, PaymentSelectResult, PaymentStatus, ProviderPaymentInput, VpsInstance,
    Wallet, WalletOrder, WalletOrderInput, WalletOrderStatus, WalletOrderType,
};
use crate::error::ServiceError;
use crate::money::parse_amount_cents;
use crate::services::{PaymentService, ServiceResult, VpsService, WalletOrderService};
use crate::signature::verify_hmac;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use tracing::{info, warn};

pub(crate) const BALANCE_METHOD: &str = "balance";
const SIGNATURE_HEADER: &str = "x-signature";
const DEFAULT_ACK: &str = "success";

/// Methods offered for `scene`; wallet top-ups cannot be paid from the wallet itself.
fn methods_for(state: &State, scene: &str) -> Vec<PaymentMethod> {
    let mut methods = Vec::with_capacity(state.providers.len() + 1);
    if scene != "wallet" {
        methods.push(PaymentMethod {
            key: BALANCE_METHOD.to_string(),
            name: "Wallet balance".to_string(),
            provider: BALANCE_METHOD.to_string(),
        });
    }
    methods.extend(state.providers.values().map(|provider| PaymentMethod {
        key: provider.name.clone(),
        name: provider.name.clone(),
        provider: provider.name.clone(),
    }));
    methods
}

/// Provider callback body: `{order_no, trade_no, status | paid, amount}` with amount in yuan.
#[derive(Deserialize)]
struct NotifyBody {
    #[serde(default)]
    order_no: String,
    #[serde(default)]
    trade_no: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    paid: Option<bool>,
    #[serde(default)]
    amount: Value,
}

fn header<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

fn pending_withdrawals(state: &State, user_id: i64) -> i64 {
    state
        .wallet_orders
        .values()
        .filter(|order| {
            order.user_id == user_id
                && order.order_type == WalletOrderType::Withdraw
                && order.status == WalletOrderStatus::PendingReview
        })
        .map(|order| order.amount)
        .sum()
}

fn insert_wallet_order(
    state: &mut State,
    user_id: i64,
    order_type: WalletOrderType,
    input: WalletOrderInput,
    now: DateTime<Utc>,
) -> WalletOrder {
    let id = state.next_id();
    let order = WalletOrder {
        id,
        user_id,
        order_type,
        amount: input.amount,
        currency: if input.currency.trim().is_empty() {
            DEFAULT_CURRENCY.to_string()
        } else {
            input.currency.trim().to_ascii_uppercase()
        },
        status: WalletOrderStatus::PendingReview,
        note: input.note,
        meta: input.meta,
        reviewed_by: None,
        reason: String::new(),
        created_at: now,
    };
    state.wallet_orders.insert(id, order.clone());
    order
}

fn page<T: Clone>(rows: Vec<&T>, limit: usize, offset: usize) -> (Vec<T>, usize) {
    let total = rows.len();
    let limit = if limit == 0 { 20 } else { limit };
    (
        rows.into_iter().skip(offset).take(limit).cloned().collect(),
        total,
    )
}

#[async_trait]
impl PaymentService for MemoryStore {
    async fn list_user_methods(
        &self,
        _user_id: i64,
        scene: &str,
    ) -> ServiceResult<Vec<PaymentMethod>> {
        Ok(methods_for(&*self.lock().await, scene))
    }

    async fn select_payment(
        &self,
        user_id: i64,
        order_id: i64,
        input: PaymentSelectInput,
    ) -> ServiceResult<PaymentSelectResult> {
        let method = input.method.trim().to_ascii_lowercase();
        let now = Utc::now();
        let mut state = self.lock().await;
        let order = state
            .orders
            .get(&order_id)
            .cloned()
            .filter(|order| order.user_id == user_id)
            .ok_or(ServiceError::NotFound)?;
        if order.status != OrderStatus::PendingPayment {
            return Err(ServiceError::Conflict);
        }
        if order.total_amount == 0 {
            return Err(ServiceError::NoPaymentRequired);
        }

        if method == BALANCE_METHOD {
            let wallet = state.wallet_mut(user_id, now);
            if wallet.balance < order.total_amount {
                return Err(ServiceError::InsufficientBalance);
            }
            wallet.balance -= order.total_amount;
            wallet.updated_at = now;
            let balance = wallet.balance;
            let trade_no = format!("BAL{}", order.order_no);
            let payment_input = PaymentInput {
                method: BALANCE_METHOD.to_string(),
                amount: order.total_amount,
                currency: order.currency.clone(),
                trade_no: trade_no.clone(),
                ..PaymentInput::default()
            };
            state.new_payment(&order, payment_input, PaymentStatus::Approved, "", now);
            let mut events: PendingEvents = vec![(
                order_id,
                "order.paid",
                json!({ "method": BALANCE_METHOD, "amount": order.total_amount }),
            )];
            self.approve_and_provision(&mut state, order_id, None, now, &mut events);
            drop(state);
            self.publish_all(events).await;
            return Ok(PaymentSelectResult {
                method,
                status: "approved".to_string(),
                trade_no,
                paid: true,
                balance,
                ..PaymentSelectResult::default()
            });
        }

        if !state.providers.contains_key(&method) {
            return Err(ServiceError::NotSupported);
        }
        let trade_no = format!("{}-{}", method.to_ascii_uppercase(), random_hex(8)?);
        let payment_input = PaymentInput {
            method: method.clone(),
            amount: order.total_amount,
            currency: order.currency.clone(),
            trade_no: trade_no.clone(),
            ..PaymentInput::default()
        };
        state.new_payment(&order, payment_input, PaymentStatus::PendingPayment, "", now);
        drop(state);
        info!(order_id, method = %method, device = %input.device, "Provider payment created");

        let mut extra = input.extra;
        extra.insert("notify_url".to_string(), input.notify_url);
        Ok(PaymentSelectResult {
            pay_url: format!(
                "https://pay.invalid/{method}/{trade_no}?return_url={}",
                input.return_url
            ),
            method,
            status: "pending_payment".to_string(),
            trade_no,
            extra,
            ..PaymentSelectResult::default()
        })
    }

    async fn create_provider_payment(
        &self,
        method: &str,
        input: ProviderPaymentInput,
    ) -> ServiceResult<PaymentSelectResult> {
        let method = method.trim().to_ascii_lowercase();
        if !self.lock().await.providers.contains_key(&method) {
            return Err(ServiceError::NotSupported);
        }
        if input.amount <= 0 {
            return Err(ServiceError::InvalidInput);
        }
        let trade_no = format!("{}-{}", method.to_ascii_uppercase(), random_hex(8)?);
        info!(user_id = input.user_id, order_no = %input.order_no, "Provider payment created");
        Ok(PaymentSelectResult {
            pay_url: format!("https://pay.invalid/{method}/{trade_no}"),
            method,
            status: "pending_payment".to_string(),
            trade_no,
            ..PaymentSelectResult::default()
        })
    }

    async fn verify_notify(
        &self,
        provider: &str,
        request: NotifyRequest,
    ) -> ServiceResult<NotifyResult> {
        let provider = provider.trim().to_ascii_lowercase();
        let config = self
            .lock()
            .await
            .providers
            .get(&provider)
            .cloned()
            .ok_or(ServiceError::NotSupported)?;
        if let Some(scripted) = config.scripted {
            return Ok(scripted);
        }
        let signature = header(&request.headers, SIGNATURE_HEADER).unwrap_or("");
        if !verify_hmac(&request.body, &config.secret, signature) {
            warn!(provider = %provider, "Notify signature rejected");
            return Err(ServiceError::rejected("invalid signature"));
        }
        let body: NotifyBody = serde_json::from_slice(&request.body)
            .map_err(|_| ServiceError::rejected("invalid notify body"))?;
        let amount = if body.amount.is_null() {
            0
        } else {
            parse_amount_cents(&body.amount).map_err(|_| ServiceError::rejected("invalid amount"))?
        };
        let paid = body.paid.unwrap_or_else(|| {
            matches!(body.status.to_ascii_lowercase().as_str(), "paid" | "success")
        });
        Ok(NotifyResult {
            order_no: body.order_no,
            trade_no: body.trade_no,
            paid,
            amount,
            ack_body: DEFAULT_ACK.to_string(),
        })
    }
}

#[async_trait]
impl WalletOrderService for MemoryStore {
    async fn get_wallet(&self, user_id: i64) -> ServiceResult<Wallet> {
        Ok(self.lock().await.wallet_mut(user_id, Utc::now()).clone())
    }

    async fn create_recharge(
        &self,
        user_id: i64,
        input: WalletOrderInput,
    ) -> ServiceResult<WalletOrder> {
        if input.amount <= 0 {
            return Err(ServiceError::InvalidInput);
        }
        let mut state = self.lock().await;
        state.user(user_id)?;
        Ok(insert_wallet_order(
            &mut state,
            user_id,
            WalletOrderType::Recharge,
            input,
            Utc::now(),
        ))
    }

    async fn create_withdraw(
        &self,
        user_id: i64,
        input: WalletOrderInput,
    ) -> ServiceResult<WalletOrder> {
        if input.amount <= 0 {
            return Err(ServiceError::InvalidInput);
        }
        let now = Utc::now();
        let mut state = self.lock().await;
        let balance = state.wallet_mut(user_id, now).balance;
        if balance - pending_withdrawals(&state, user_id) < input.amount {
            return Err(ServiceError::InsufficientBalance);
        }
        Ok(insert_wallet_order(
            &mut state,
            user_id,
            WalletOrderType::Withdraw,
            input,
            now,
        ))
    }

    async fn list_user_orders(
        &self,
        user_id: i64,
        limit: usize,
        offset: usize,
    ) -> ServiceResult<(Vec<WalletOrder>, usize)> {
        let state = self.lock().await;
        let rows = state
            .wallet_orders
            .values()
            .rev()
            .filter(|order| order.user_id == user_id)
            .collect();
        Ok(page(rows, limit, offset))
    }

    async fn list_orders(
        &self,
        status: Option<WalletOrderStatus>,
        limit: usize,
        offset: usize,
    ) -> ServiceResult<(Vec<WalletOrder>, usize)> {
        let state = self.lock().await;
        let rows = state
            .wallet_orders
            .values()
            .rev()
            .filter(|order| status.is_none_or(|s| order.status == s))
            .collect();
        Ok(page(rows, limit, offset))
    }

    async fn approve(&self, operator_id: i64, order_id: i64) -> ServiceResult<WalletOrder> {
        let now = Utc::now();
        let mut state = self.lock().await;
        let order = state
            .wallet_orders
            .get(&order_id)
            .cloned()
            .ok_or(ServiceError::NotFound)?;
        if order.status != WalletOrderStatus::PendingReview {
            return Err(ServiceError::Conflict);
        }
        let delta = match order.order_type {
            WalletOrderType::Recharge | WalletOrderType::Refund => order.amount,
            WalletOrderType::Withdraw => -order.amount,
        };
        let wallet = state.wallet_mut(order.user_id, now);
        if wallet.balance + delta < 0 {
            return Err(ServiceError::InsufficientBalance);
        }
        wallet.balance += delta;
        wallet.updated_at = now;
        let stored = state
            .wallet_orders
            .get_mut(&order_id)
            .ok_or(ServiceError::NotFound)?;
        stored.status = WalletOrderStatus::Approved;
        stored.reviewed_by = Some(operator_id);
        info!(operator_id, order_id, delta, "Wallet order approved");
        Ok(stored.clone())
    }

    async fn reject(
        &self,
        operator_id: i64,
        order_id: i64,
        reason: &str,
    ) -> ServiceResult<WalletOrder> {
        let mut state = self.lock().await;
        let stored = state
            .wallet_orders
            .get_mut(&order_id)
            .ok_or(ServiceError::NotFound)?;
        if stored.status != WalletOrderStatus::PendingReview {
            return Err(ServiceError::Conflict);
        }
        stored.status = WalletOrderStatus::Rejected;
        stored.reviewed_by = Some(operator_id);
        stored.reason = reason.trim().to_string();
        Ok(stored.clone())
    }

    async fn find_recharge_by_payment(
        &self,
        provider: &str,
        order_no: &str,
        trade_no: &str,
    ) -> ServiceResult<Option<WalletOrder>> {
        let state = self.lock().await;
        Ok(state
            .wallet_orders
            .values()
            .find(|order| {
                order.order_type == WalletOrderType::Recharge
                    && order.meta_str("payment_method").eq_ignore_ascii_case(provider)
                    && ((!order_no.is_empty() && order.meta_str("payment_order_no") == order_no)
                        || (!trade_no.is_empty()
                            && order.meta_str("payment_trade_no") == trade_no))
            })
            .cloned())
    }
}

#[async_trait]
impl VpsService for MemoryStore {
    async fn get_instance(&self, vps_id: i64) -> ServiceResult<VpsInstance> {
        self.lock()
            .await
            .instances
            .get(&vps_id)
            .cloned()
            .ok_or(ServiceError::NotFound)
    }

    async fn automation_features(
        &self,
        instance: &VpsInstance,
    ) -> ServiceResult<Option<Vec<String>>> {
        Ok(self
            .lock()
            .await
            .automation_features
            .get(&instance.id)
            .cloned())
    }
}
