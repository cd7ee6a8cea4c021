use super::{CouponKind, MemoryStore, Package, PendingEvents, State, instance_for};
use crate::domain::{
    CouponPreview, DEFAULT_CURRENCY, ItemAction, NotifyOutcome, Order, OrderDetail, OrderFilter,
    OrderItem, OrderItemInput, OrderPayment, OrderSource, OrderStatus, PaymentInput,
    PaymentStatus, RefundResult, RenewInput, ResizeInput, ResizeQuote, VpsInstance,
    WalletOrder, WalletOrderStatus, WalletOrderType,
};
use crate::error::ServiceError;
use crate::money::prorate_cents;
use crate::services::{OrderService, ServiceResult};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value, json};
use tracing::{info, warn};

/// Days in a billing month for pro-rating.
const BILLING_DAYS: i64 = 30;
const EMERGENCY_WINDOW_DAYS: i64 = 7;
const EMERGENCY_RENEW_DAYS: i64 = 1;
const EMERGENCY_INTERVAL_HOURS: i64 = 720;

fn order_no(id: i64, now: DateTime<Utc>) -> String {
    format!("ORD{}{id:06}", now.format("%Y%m%d"))
}

fn remaining_days(instance: &VpsInstance, now: DateTime<Utc>) -> i64 {
    instance.expire_at.map_or(0, |expire| {
        let secs = (expire - now).num_seconds();
        if secs <= 0 { 0 } else { (secs + 86_399) / 86_400 }
    })
}

fn owned_instance(state: &State, user_id: i64, vps_id: i64) -> ServiceResult<VpsInstance> {
    let instance = state
        .instances
        .get(&vps_id)
        .cloned()
        .ok_or(ServiceError::NotFound)?;
    if instance.user_id != user_id {
        return Err(ServiceError::NotFound);
    }
    if instance.is_locked() {
        return Err(ServiceError::Forbidden);
    }
    Ok(instance)
}

fn package(state: &State, package_id: i64) -> ServiceResult<Package> {
    state
        .packages
        .get(&package_id)
        .cloned()
        .ok_or(ServiceError::NotFound)
}

/// Whether an unfinished resize, refund or emergency renew already targets the instance.
fn has_in_flight(state: &State, vps_id: i64) -> bool {
    state.items.values().any(|item| {
        matches!(
            item.action,
            ItemAction::Resize | ItemAction::Refund | ItemAction::EmergencyRenew
        ) && item.spec.get("vps_id").and_then(Value::as_i64) == Some(vps_id)
            && state
                .orders
                .get(&item.order_id)
                .is_some_and(|order| order.status.is_in_flight())
    })
}

fn price_items(state: &State, inputs: &[OrderItemInput]) -> ServiceResult<Vec<(OrderItemInput, i64)>> {
    if inputs.is_empty() {
        return Err(ServiceError::rejected("cart is empty"));
    }
    inputs
        .iter()
        .map(|input| {
            if input.qty <= 0 || input.duration_months <= 0 {
                return Err(ServiceError::InvalidInput);
            }
            if !matches!(input.action, None | Some(ItemAction::Create)) {
                return Err(ServiceError::InvalidInput);
            }
            let package = package(state, input.package_id)?;
            let amount = package
                .monthly_price
                .checked_mul(i64::from(input.duration_months))
                .and_then(|v| v.checked_mul(i64::from(input.qty)))
                .ok_or(ServiceError::InvalidInput)?;
            Ok((input.clone(), amount))
        })
        .collect()
}

/// Resolves `code` to `(coupon_id, discount)`, the discount capped at `original`.
fn coupon_discount(state: &State, code: &str, original: i64) -> ServiceResult<(i64, i64)> {
    let coupon = state
        .coupons
        .get(&code.trim().to_ascii_uppercase())
        .copied()
        .ok_or_else(|| ServiceError::rejected("coupon not found"))?;
    let discount = match coupon.kind {
        CouponKind::Percent(pct) => prorate_cents(original, pct.clamp(0, 100), 100),
        CouponKind::Amount(cents) => cents.max(0),
    };
    Ok((coupon.id, discount.min(original)))
}

struct NewOrder {
    user_id: i64,
    source: OrderSource,
    status: OrderStatus,
    currency: String,
    idempotency_key: String,
    pending_reason: String,
    items: Vec<(ItemAction, i64, Value, i32, i32, i64)>,
    /// `(coupon_id, discount)` subtracted from the item sum.
    coupon: Option<(i64, i64)>,
}

impl State {
    fn insert_order(&mut self, new: NewOrder, now: DateTime<Utc>) -> (Order, Vec<OrderItem>) {
        let id = self.next_id();
        let subtotal: i64 = new.items.iter().map(|item| item.5).sum();
        let discount = new.coupon.map_or(0, |(_, discount)| discount);
        let order = Order {
            id,
            user_id: new.user_id,
            order_no: order_no(id, now),
            source: new.source,
            status: new.status,
            total_amount: (subtotal - discount).max(0),
            currency: new.currency,
            idempotency_key: new.idempotency_key.clone(),
            coupon_id: new.coupon.map(|(coupon_id, _)| coupon_id),
            coupon_discount: discount,
            pending_reason: new.pending_reason,
            approved_by: None,
            rejected_reason: String::new(),
            created_at: now,
            updated_at: now,
        };
        let mut items = Vec::with_capacity(new.items.len());
        for (action, package_id, spec, qty, duration_months, amount) in new.items {
            let item_id = self.next_id();
            let automation_instance_id = spec
                .get("vps_id")
                .and_then(Value::as_i64)
                .and_then(|vps| self.instances.get(&vps))
                .map(|instance| instance.automation_instance_id.clone())
                .unwrap_or_default();
            let item = OrderItem {
                id: item_id,
                order_id: id,
                package_id,
                system_id: spec.get("system_id").and_then(Value::as_i64).unwrap_or(0),
                spec,
                qty,
                amount,
                status: "pending".to_string(),
                action,
                duration_months,
                automation_instance_id,
            };
            self.items.insert(item_id, item.clone());
            items.push(item);
        }
        if !new.idempotency_key.is_empty() {
            self.order_keys
                .insert((new.user_id, new.idempotency_key), id);
        }
        self.orders.insert(id, order.clone());
        (order, items)
    }

    fn order_items(&self, order_id: i64) -> Vec<OrderItem> {
        self.items
            .values()
            .filter(|item| item.order_id == order_id)
            .cloned()
            .collect()
    }

    fn order_payments(&self, order_id: i64) -> Vec<OrderPayment> {
        self.payments
            .values()
            .filter(|payment| payment.order_id == order_id)
            .cloned()
            .collect()
    }

    fn has_approved_payment(&self, order_id: i64) -> bool {
        self.payments
            .values()
            .any(|p| p.order_id == order_id && p.status == PaymentStatus::Approved)
    }

    fn set_status(&mut self, order_id: i64, status: OrderStatus, now: DateTime<Utc>) {
        if let Some(order) = self.orders.get_mut(&order_id) {
            order.status = status;
            order.updated_at = now;
        }
    }

    fn existing_for_key(&self, user_id: i64, key: &str) -> Option<(Order, Vec<OrderItem>)> {
        if key.is_empty() {
            return None;
        }
        let id = self.order_keys.get(&(user_id, key.to_string()))?;
        let order = self.orders.get(id)?.clone();
        Some((order.clone(), self.order_items(order.id)))
    }

    /// Prices `items`, applies the coupon and inserts a direct order.
    ///
    /// The flag is false when the idempotency key replays an earlier order.
    fn create_direct_order(
        &mut self,
        user_id: i64,
        currency: &str,
        items: Vec<OrderItemInput>,
        coupon_code: &str,
        idempotency_key: &str,
        now: DateTime<Utc>,
    ) -> ServiceResult<((Order, Vec<OrderItem>), bool)> {
        let key = idempotency_key.trim();
        if let Some(existing) = self.existing_for_key(user_id, key) {
            info!(order_id = existing.0.id, "Idempotent order replay");
            return Ok((existing, false));
        }
        let priced = price_items(self, &items)?;
        let subtotal: i64 = priced.iter().map(|(_, amount)| amount).sum();
        let coupon = match coupon_code.trim() {
            "" => None,
            code => Some(coupon_discount(self, code, subtotal)?),
        };
        let currency = if currency.trim().is_empty() {
            DEFAULT_CURRENCY.to_string()
        } else {
            currency.trim().to_ascii_uppercase()
        };
        let new = NewOrder {
            user_id,
            source: OrderSource::Direct,
            status: OrderStatus::PendingPayment,
            currency,
            idempotency_key: key.to_string(),
            pending_reason: String::new(),
            coupon,
            items: priced
                .into_iter()
                .map(|(input, amount)| {
                    let mut spec = match input.spec {
                        Value::Object(map) => map,
                        _ => Map::new(),
                    };
                    spec.insert("system_id".to_string(), json!(input.system_id));
                    (
                        ItemAction::Create,
                        input.package_id,
                        Value::Object(spec),
                        input.qty,
                        input.duration_months,
                        amount,
                    )
                })
                .collect(),
        };
        Ok((self.insert_order(new, now), true))
    }

    pub(crate) fn new_payment(
        &mut self,
        order: &Order,
        input: PaymentInput,
        status: PaymentStatus,
        idempotency_key: &str,
        now: DateTime<Utc>,
    ) -> OrderPayment {
        let id = self.next_id();
        let payment = OrderPayment {
            id,
            order_id: order.id,
            user_id: order.user_id,
            method: input.method,
            amount: input.amount,
            currency: if input.currency.trim().is_empty() {
                order.currency.clone()
            } else {
                input.currency
            },
            trade_no: input.trade_no,
            note: input.note,
            screenshot_url: input.screenshot_url,
            status,
            idempotency_key: idempotency_key.to_string(),
            reviewed_by: None,
            review_reason: String::new(),
            created_at: now,
        };
        self.payments.insert(id, payment.clone());
        payment
    }
}

impl MemoryStore {
    async fn publish_created(&self, order: &Order) {
        self.publish_all(vec![(
            order.id,
            "order.created",
            json!({
                "order_no": order.order_no,
                "total_amount": order.total_amount,
                "coupon_discount": order.coupon_discount,
            }),
        )])
        .await;
    }

    /// Creates a payment row directly, for provider flows that start outside this adapter.
    ///
    /// # Errors
    /// Returns [`ServiceError::NotFound`] for an unknown order and [`ServiceError::Conflict`] when
    /// the trade number is already recorded.
    pub async fn insert_payment(
        &self,
        order_id: i64,
        method: &str,
        trade_no: &str,
        status: PaymentStatus,
    ) -> ServiceResult<OrderPayment> {
        let mut state = self.lock().await;
        if state.payments.values().any(|p| p.trade_no == trade_no) {
            return Err(ServiceError::Conflict);
        }
        let order = state
            .orders
            .get(&order_id)
            .cloned()
            .ok_or(ServiceError::NotFound)?;
        let input = PaymentInput {
            method: method.to_string(),
            amount: order.total_amount,
            currency: order.currency.clone(),
            trade_no: trade_no.to_string(),
            ..PaymentInput::default()
        };
        Ok(state.new_payment(&order, input, status, "", Utc::now()))
    }

    /// Approves `order_id` and provisions it unless it already ran.
    pub(crate) fn approve_and_provision(
        &self,
        state: &mut State,
        order_id: i64,
        operator_id: Option<i64>,
        now: DateTime<Utc>,
        events: &mut PendingEvents,
    ) {
        if let Some(order) = state.orders.get_mut(&order_id) {
            order.status = OrderStatus::Approved;
            order.approved_by = operator_id;
            order.updated_at = now;
        }
        events.push((order_id, "order.approved", json!({ "operator_id": operator_id })));
        self.provision(state, order_id, now, events);
    }

    /// Single-flight per order: a second call for the same order is a no-op.
    pub(crate) fn provision(
        &self,
        state: &mut State,
        order_id: i64,
        now: DateTime<Utc>,
        events: &mut PendingEvents,
    ) {
        if !state.provisioned.insert(order_id) {
            info!(order_id, "Provisioning already started, skipping");
            return;
        }
        self.record_provision();
        state.set_status(order_id, OrderStatus::Provisioning, now);
        events.push((order_id, "order.provisioning", json!({})));

        if state.fail_provisioning {
            state.set_status(order_id, OrderStatus::Failed, now);
            state.provisioned.remove(&order_id);
            warn!(order_id, "Provisioning failed");
            events.push((order_id, "order.failed", json!({ "reason": "automation unavailable" })));
            return;
        }

        let Some(order) = state.orders.get(&order_id).cloned() else {
            return;
        };
        for item in state.order_items(order_id) {
            apply_item(state, &order, &item, now);
            if let Some(stored) = state.items.get_mut(&item.id) {
                stored.status = "done".to_string();
            }
        }
        state.set_status(order_id, OrderStatus::Active, now);
        events.push((order_id, "order.active", json!({})));
    }
}

fn apply_item(state: &mut State, order: &Order, item: &OrderItem, now: DateTime<Utc>) {
    let vps_id = item.spec.get("vps_id").and_then(Value::as_i64);
    match item.action {
        ItemAction::Create => {
            let Some(package) = state.packages.get(&item.package_id).cloned() else {
                return;
            };
            for _ in 0..item.qty.max(1) {
                let id = state.next_id();
                let expire = now + Duration::days(BILLING_DAYS * i64::from(item.duration_months));
                let instance = instance_for(id, order.user_id, item.id, &package, Some(expire));
                state.instances.insert(id, instance);
            }
        }
        ItemAction::Renew | ItemAction::EmergencyRenew => {
            let days = item
                .spec
                .get("renew_days")
                .and_then(Value::as_i64)
                .unwrap_or(BILLING_DAYS * i64::from(item.duration_months));
            if let Some(instance) = vps_id.and_then(|id| state.instances.get_mut(&id)) {
                let base = instance.expire_at.filter(|at| *at > now).unwrap_or(now);
                instance.expire_at = Some(base + Duration::days(days));
                if item.action == ItemAction::EmergencyRenew {
                    instance.last_emergency_renew_at = Some(now);
                }
            }
        }
        ItemAction::Resize => {
            let target = item
                .spec
                .get("target_package_id")
                .and_then(Value::as_i64)
                .and_then(|id| state.packages.get(&id).cloned());
            if let (Some(package), Some(instance)) =
                (target, vps_id.and_then(|id| state.instances.get_mut(&id)))
            {
                instance.package_id = package.id;
                instance.goods_type_id = package.goods_type_id;
                instance.cpu = package.cpu;
                instance.memory_gb = package.memory_gb;
                instance.disk_gb = package.disk_gb;
                instance.bandwidth_mbps = package.bandwidth_mbps;
            }
            let refund = item
                .spec
                .get("refund_amount")
                .and_then(Value::as_i64)
                .unwrap_or(0);
            if refund > 0 {
                credit_refund(state, order, refund, now);
            }
        }
        ItemAction::Refund => {
            credit_refund(state, order, item.amount, now);
            if let Some(instance) = vps_id.and_then(|id| state.instances.get_mut(&id)) {
                instance.status = "refunded".to_string();
                instance.admin_status = "locked".to_string();
                instance.expire_at = Some(now);
            }
        }
    }
}

fn credit_refund(state: &mut State, order: &Order, amount: i64, now: DateTime<Utc>) {
    let id = state.next_id();
    let mut meta = Map::new();
    meta.insert("order_id".to_string(), json!(order.id));
    meta.insert("order_no".to_string(), json!(order.order_no));
    state.wallet_orders.insert(
        id,
        WalletOrder {
            id,
            user_id: order.user_id,
            order_type: WalletOrderType::Refund,
            amount,
            currency: order.currency.clone(),
            status: WalletOrderStatus::Approved,
            note: "order refund".to_string(),
            meta,
            reviewed_by: None,
            reason: String::new(),
            created_at: now,
        },
    );
    let wallet = state.wallet_mut(order.user_id, now);
    wallet.balance += amount;
    wallet.updated_at = now;
}

fn quote(state: &State, instance: &VpsInstance, input: &ResizeInput, now: DateTime<Utc>) -> ServiceResult<ResizeQuote> {
    let current = package(state, instance.package_id)?;
    if input.target_package_id <= 0 {
        return Err(ServiceError::InvalidInput);
    }
    let target = package(state, input.target_package_id)?;
    if target.id == current.id {
        return Err(ServiceError::rejected("target package unchanged"));
    }
    let remain = remaining_days(instance, now);
    let diff = target.monthly_price - current.monthly_price;
    let (charge_amount, refund_amount) = if diff >= 0 {
        (prorate_cents(diff, remain, BILLING_DAYS), 0)
    } else {
        (0, prorate_cents(-diff, remain, BILLING_DAYS))
    };
    Ok(ResizeQuote {
        current_package_id: current.id,
        target_package_id: target.id,
        current_monthly: current.monthly_price,
        target_monthly: target.monthly_price,
        charge_amount,
        refund_amount,
    })
}

#[async_trait]
impl OrderService for MemoryStore {
    async fn create_order_from_cart(
        &self,
        user_id: i64,
        currency: &str,
        coupon_code: &str,
        idempotency_key: &str,
    ) -> ServiceResult<(Order, Vec<OrderItem>)> {
        let mut state = self.lock().await;
        let cart = state.carts.get(&user_id).cloned().unwrap_or_default();
        let (created, fresh) = state.create_direct_order(
            user_id,
            currency,
            cart,
            coupon_code,
            idempotency_key,
            Utc::now(),
        )?;
        if fresh {
            state.carts.remove(&user_id);
        }
        drop(state);
        if fresh {
            self.publish_created(&created.0).await;
        }
        Ok(created)
    }

    async fn create_order_from_items(
        &self,
        user_id: i64,
        currency: &str,
        items: Vec<OrderItemInput>,
        coupon_code: &str,
        idempotency_key: &str,
    ) -> ServiceResult<(Order, Vec<OrderItem>)> {
        let mut state = self.lock().await;
        let (created, fresh) = state.create_direct_order(
            user_id,
            currency,
            items,
            coupon_code,
            idempotency_key,
            Utc::now(),
        )?;
        drop(state);
        if fresh {
            self.publish_created(&created.0).await;
        }
        Ok(created)
    }

    async fn create_renew_order(
        &self,
        user_id: i64,
        vps_id: i64,
        input: RenewInput,
    ) -> ServiceResult<Order> {
        let now = Utc::now();
        let mut state = self.lock().await;
        let instance = owned_instance(&state, user_id, vps_id)?;
        let package = package(&state, instance.package_id)?;
        let (spec, months, amount) = match (input.renew_days, input.duration_months) {
            (Some(days), _) if days > 0 => (
                json!({ "vps_id": vps_id, "renew_days": days }),
                1,
                prorate_cents(package.monthly_price, i64::from(days), BILLING_DAYS),
            ),
            (None, Some(months)) | (Some(_), Some(months)) if months > 0 => (
                json!({ "vps_id": vps_id, "duration_months": months }),
                months,
                package.monthly_price * i64::from(months),
            ),
            (None, None) => (
                json!({ "vps_id": vps_id, "duration_months": 1 }),
                1,
                package.monthly_price,
            ),
            _ => return Err(ServiceError::InvalidInput),
        };
        let (order, _) = state.insert_order(
            NewOrder {
                user_id,
                source: OrderSource::Renew,
                status: OrderStatus::PendingPayment,
                currency: DEFAULT_CURRENCY.to_string(),
                idempotency_key: String::new(),
                pending_reason: String::new(),
                coupon: None,
                items: vec![(ItemAction::Renew, package.id, spec, 1, months, amount)],
            },
            now,
        );
        drop(state);
        self.publish_all(vec![(order.id, "order.created", json!({ "source": "renew" }))])
            .await;
        Ok(order)
    }

    async fn create_emergency_renew_order(
        &self,
        user_id: i64,
        vps_id: i64,
    ) -> ServiceResult<Order> {
        let now = Utc::now();
        let mut state = self.lock().await;
        let instance = owned_instance(&state, user_id, vps_id)?;
        let Some(expire) = instance.expire_at else {
            return Err(ServiceError::Forbidden);
        };
        if expire - now > Duration::days(EMERGENCY_WINDOW_DAYS) {
            return Err(ServiceError::Forbidden);
        }
        if instance
            .last_emergency_renew_at
            .is_some_and(|last| now - last < Duration::hours(EMERGENCY_INTERVAL_HOURS))
        {
            return Err(ServiceError::Conflict);
        }
        if has_in_flight(&state, vps_id) {
            return Err(ServiceError::Conflict);
        }
        let (order, _) = state.insert_order(
            NewOrder {
                user_id,
                source: OrderSource::EmergencyRenew,
                status: OrderStatus::Approved,
                currency: DEFAULT_CURRENCY.to_string(),
                idempotency_key: String::new(),
                pending_reason: String::new(),
                coupon: None,
                items: vec![(
                    ItemAction::EmergencyRenew,
                    instance.package_id,
                    json!({ "vps_id": vps_id, "renew_days": EMERGENCY_RENEW_DAYS }),
                    1,
                    0,
                    0,
                )],
            },
            now,
        );
        let mut events: PendingEvents = vec![(order.id, "order.created", json!({ "source": "emergency_renew" }))];
        self.approve_and_provision(&mut state, order.id, None, now, &mut events);
        let order = state.orders.get(&order.id).cloned().unwrap_or(order);
        drop(state);
        self.publish_all(events).await;
        Ok(order)
    }

    async fn quote_resize(
        &self,
        user_id: i64,
        vps_id: i64,
        input: &ResizeInput,
    ) -> ServiceResult<ResizeQuote> {
        let state = self.lock().await;
        let instance = owned_instance(&state, user_id, vps_id)?;
        quote(&state, &instance, input, Utc::now())
    }

    async fn create_resize_order(
        &self,
        user_id: i64,
        vps_id: i64,
        input: ResizeInput,
    ) -> ServiceResult<(Order, ResizeQuote)> {
        let now = Utc::now();
        let mut state = self.lock().await;
        let instance = owned_instance(&state, user_id, vps_id)?;
        if has_in_flight(&state, vps_id) {
            return Err(ServiceError::ResizeInProgress);
        }
        let quote = quote(&state, &instance, &input, now)?;
        let spec = json!({
            "vps_id": vps_id,
            "current_package_id": quote.current_package_id,
            "target_package_id": quote.target_package_id,
            "current_monthly": quote.current_monthly,
            "target_monthly": quote.target_monthly,
            "charge_amount": quote.charge_amount,
            "refund_amount": quote.refund_amount,
            "reset_addons": input.reset_addons,
            "scheduled_at": input.scheduled_at.map(|at| at.to_rfc3339()),
            "spec": input.spec.clone().unwrap_or(Value::Null),
        });
        let free = quote.charge_amount == 0;
        let (order, _) = state.insert_order(
            NewOrder {
                user_id,
                source: OrderSource::Resize,
                status: OrderStatus::PendingPayment,
                currency: DEFAULT_CURRENCY.to_string(),
                idempotency_key: String::new(),
                pending_reason: String::new(),
                coupon: None,
                items: vec![(
                    ItemAction::Resize,
                    quote.target_package_id,
                    spec,
                    1,
                    0,
                    quote.charge_amount,
                )],
            },
            now,
        );
        let mut events: PendingEvents = vec![(order.id, "order.created", json!({ "source": "resize" }))];
        if free {
            self.approve_and_provision(&mut state, order.id, None, now, &mut events);
        }
        let order = state.orders.get(&order.id).cloned().unwrap_or(order);
        drop(state);
        self.publish_all(events).await;
        Ok((order, quote))
    }

    async fn request_refund(
        &self,
        user_id: i64,
        vps_id: i64,
        reason: &str,
    ) -> ServiceResult<RefundResult> {
        let now = Utc::now();
        let mut state = self.lock().await;
        let instance = owned_instance(&state, user_id, vps_id)?;
        if has_in_flight(&state, vps_id) {
            return Err(ServiceError::Conflict);
        }
        let package = package(&state, instance.package_id)?;
        let refund_amount = prorate_cents(
            package.monthly_price,
            remaining_days(&instance, now).min(BILLING_DAYS),
            BILLING_DAYS,
        );
        let (mut order, _) = state.insert_order(
            NewOrder {
                user_id,
                source: OrderSource::Refund,
                status: OrderStatus::PendingReview,
                currency: DEFAULT_CURRENCY.to_string(),
                idempotency_key: String::new(),
                pending_reason: reason.trim().to_string(),
                coupon: None,
                items: vec![(
                    ItemAction::Refund,
                    package.id,
                    json!({ "vps_id": vps_id, "reason": reason.trim() }),
                    1,
                    0,
                    refund_amount,
                )],
            },
            now,
        );
        // The customer pays nothing; the item carries the amount owed back.
        order.total_amount = 0;
        if let Some(stored) = state.orders.get_mut(&order.id) {
            stored.total_amount = 0;
        }
        drop(state);
        self.publish_all(vec![(order.id, "order.created", json!({ "source": "refund" }))])
            .await;
        Ok(RefundResult {
            order,
            refund_amount,
        })
    }

    async fn preview_coupon(
        &self,
        user_id: i64,
        coupon_code: &str,
        items: Vec<OrderItemInput>,
    ) -> ServiceResult<CouponPreview> {
        if coupon_code.trim().is_empty() {
            return Err(ServiceError::InvalidInput);
        }
        let state = self.lock().await;
        let items = if items.is_empty() {
            state.carts.get(&user_id).cloned().unwrap_or_default()
        } else {
            items
        };
        let original: i64 = price_items(&state, &items)?.iter().map(|(_, amount)| amount).sum();
        let (_, discount) = coupon_discount(&state, coupon_code, original)?;
        Ok(CouponPreview {
            coupon_code: coupon_code.trim().to_ascii_uppercase(),
            original,
            discount,
            final_total: (original - discount).max(0),
        })
    }

    async fn submit_payment(
        &self,
        user_id: i64,
        order_id: i64,
        input: PaymentInput,
        idempotency_key: &str,
    ) -> ServiceResult<OrderPayment> {
        let key = idempotency_key.trim();
        let now = Utc::now();
        let mut state = self.lock().await;
        let order = state
            .orders
            .get(&order_id)
            .cloned()
            .filter(|order| order.user_id == user_id)
            .ok_or(ServiceError::NotFound)?;
        if !key.is_empty() {
            if let Some(existing) = state
                .payments
                .values()
                .find(|p| p.order_id == order_id && p.idempotency_key == key)
            {
                return Ok(existing.clone());
            }
        }
        if state.has_approved_payment(order_id) || !order.status.is_reviewable() {
            return Err(ServiceError::Conflict);
        }
        if input.amount <= 0 || input.method.trim().is_empty() {
            return Err(ServiceError::InvalidInput);
        }
        if !input.trade_no.is_empty() && state.payments.values().any(|p| p.trade_no == input.trade_no) {
            return Err(ServiceError::Conflict);
        }
        let payment = state.new_payment(&order, input, PaymentStatus::PendingReview, key, now);
        state.set_status(order_id, OrderStatus::PendingReview, now);
        drop(state);
        self.publish_all(vec![(
            order_id,
            "order.pending_review",
            json!({ "payment_id": payment.id }),
        )])
        .await;
        Ok(payment)
    }

    async fn cancel_order(&self, user_id: i64, order_id: i64) -> ServiceResult<()> {
        let now = Utc::now();
        let mut state = self.lock().await;
        let order = state
            .orders
            .get(&order_id)
            .cloned()
            .filter(|order| order.user_id == user_id)
            .ok_or(ServiceError::NotFound)?;
        if !matches!(order.status, OrderStatus::Draft | OrderStatus::PendingPayment) {
            return Err(ServiceError::Conflict);
        }
        state.set_status(order_id, OrderStatus::Canceled, now);
        drop(state);
        self.publish_all(vec![(order_id, "order.canceled", json!({}))])
            .await;
        Ok(())
    }

    async fn list_orders(&self, filter: OrderFilter) -> ServiceResult<(Vec<Order>, usize)> {
        let state = self.lock().await;
        let matching: Vec<&Order> = state
            .orders
            .values()
            .rev()
            .filter(|order| filter.user_id.is_none_or(|id| order.user_id == id))
            .filter(|order| filter.status.is_none_or(|s| order.status == s))
            .collect();
        let total = matching.len();
        let limit = if filter.limit == 0 { 20 } else { filter.limit };
        let page = matching
            .into_iter()
            .skip(filter.offset)
            .take(limit)
            .cloned()
            .collect();
        Ok((page, total))
    }

    async fn get_order_detail(&self, order_id: i64) -> ServiceResult<OrderDetail> {
        let state = self.lock().await;
        let order = state
            .orders
            .get(&order_id)
            .cloned()
            .ok_or(ServiceError::NotFound)?;
        Ok(OrderDetail {
            items: state.order_items(order_id),
            payments: state.order_payments(order_id),
            order,
        })
    }

    async fn approve_order(&self, operator_id: i64, order_id: i64) -> ServiceResult<()> {
        let now = Utc::now();
        let mut state = self.lock().await;
        let order = state
            .orders
            .get(&order_id)
            .cloned()
            .ok_or(ServiceError::NotFound)?;
        if !order.status.is_reviewable() {
            return Err(ServiceError::Conflict);
        }
        for payment in state.payments.values_mut() {
            if payment.order_id == order_id && payment.status == PaymentStatus::PendingReview {
                payment.status = PaymentStatus::Approved;
                payment.reviewed_by = Some(operator_id);
                break;
            }
        }
        let mut events = PendingEvents::new();
        self.approve_and_provision(&mut state, order_id, Some(operator_id), now, &mut events);
        drop(state);
        self.publish_all(events).await;
        Ok(())
    }

    async fn reject_order(
        &self,
        operator_id: i64,
        order_id: i64,
        reason: &str,
    ) -> ServiceResult<()> {
        let now = Utc::now();
        let mut state = self.lock().await;
        let order = state
            .orders
            .get_mut(&order_id)
            .ok_or(ServiceError::NotFound)?;
        if !order.status.is_reviewable() {
            return Err(ServiceError::Conflict);
        }
        order.status = OrderStatus::Rejected;
        order.rejected_reason = reason.trim().to_string();
        order.updated_at = now;
        for payment in state.payments.values_mut() {
            if payment.order_id == order_id && payment.status != PaymentStatus::Approved {
                payment.status = PaymentStatus::Rejected;
                payment.reviewed_by = Some(operator_id);
                payment.review_reason = reason.trim().to_string();
            }
        }
        drop(state);
        self.publish_all(vec![(
            order_id,
            "order.rejected",
            json!({ "operator_id": operator_id, "reason": reason.trim() }),
        )])
        .await;
        Ok(())
    }

    async fn mark_paid(
        &self,
        operator_id: i64,
        order_id: i64,
        input: PaymentInput,
    ) -> ServiceResult<OrderPayment> {
        let now = Utc::now();
        let mut state = self.lock().await;
        let order = state
            .orders
            .get(&order_id)
            .cloned()
            .ok_or(ServiceError::NotFound)?;
        if state.has_approved_payment(order_id) || !order.status.is_reviewable() {
            return Err(ServiceError::Conflict);
        }
        let input = PaymentInput {
            method: if input.method.trim().is_empty() {
                "manual".to_string()
            } else {
                input.method
            },
            amount: if input.amount > 0 {
                input.amount
            } else {
                order.total_amount
            },
            ..input
        };
        if !input.trade_no.is_empty() && state.payments.values().any(|p| p.trade_no == input.trade_no) {
            return Err(ServiceError::Conflict);
        }
        let mut payment = state.new_payment(&order, input, PaymentStatus::Approved, "", now);
        payment.reviewed_by = Some(operator_id);
        state.payments.insert(payment.id, payment.clone());
        let mut events = PendingEvents::new();
        self.approve_and_provision(&mut state, order_id, Some(operator_id), now, &mut events);
        drop(state);
        self.publish_all(events).await;
        Ok(payment)
    }

    async fn retry_provision(&self, operator_id: i64, order_id: i64) -> ServiceResult<()> {
        let now = Utc::now();
        let mut state = self.lock().await;
        let order = state
            .orders
            .get(&order_id)
            .cloned()
            .ok_or(ServiceError::NotFound)?;
        if !matches!(order.status, OrderStatus::Failed | OrderStatus::Approved) {
            return Err(ServiceError::Conflict);
        }
        info!(operator_id, order_id, "Retrying provisioning");
        let mut events = PendingEvents::new();
        self.provision(&mut state, order_id, now, &mut events);
        drop(state);
        self.publish_all(events).await;
        Ok(())
    }

    async fn delete_order(&self, operator_id: i64, order_id: i64) -> ServiceResult<()> {
        let mut state = self.lock().await;
        let order = state
            .orders
            .get(&order_id)
            .cloned()
            .ok_or(ServiceError::NotFound)?;
        if matches!(
            order.status,
            OrderStatus::Approved | OrderStatus::Provisioning | OrderStatus::Active
        ) {
            return Err(ServiceError::Conflict);
        }
        state.orders.remove(&order_id);
        state.items.retain(|_, item| item.order_id != order_id);
        state.payments.retain(|_, payment| payment.order_id != order_id);
        state.order_keys.retain(|_, id| *id != order_id);
        info!(operator_id, order_id, "Order deleted");
        Ok(())
    }

    async fn approve_payment_by_trade_no(
        &self,
        provider: &str,
        trade_no: &str,
        amount: i64,
    ) -> ServiceResult<NotifyOutcome> {
        let now = Utc::now();
        let mut state = self.lock().await;
        let payment = state
            .payments
            .values()
            .find(|p| p.trade_no == trade_no)
            .cloned()
            .ok_or(ServiceError::NotFound)?;
        if payment.status == PaymentStatus::Approved {
            return Ok(NotifyOutcome::AlreadyApproved(payment));
        }
        if amount > 0 && amount != payment.amount {
            return Err(ServiceError::rejected("amount mismatch"));
        }
        if state.has_approved_payment(payment.order_id) {
            return Err(ServiceError::Conflict);
        }
        let order_status = state
            .orders
            .get(&payment.order_id)
            .map(|order| order.status)
            .ok_or(ServiceError::NotFound)?;
        if !order_status.is_reviewable() {
            return Err(ServiceError::Conflict);
        }
        let approved = {
            let stored = state
                .payments
                .get_mut(&payment.id)
                .ok_or(ServiceError::NotFound)?;
            stored.status = PaymentStatus::Approved;
            stored.clone()
        };
        info!(provider, trade_no, order_id = payment.order_id, "Payment approved by notify");
        let mut events = PendingEvents::new();
        self.approve_and_provision(&mut state, payment.order_id, None, now, &mut events);
        drop(state);
        self.publish_all(events).await;
        Ok(NotifyOutcome::Approved(approved))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::UserRole;
    use crate::events::MemoryBroker;
    use anyhow::Result;
    use std::sync::Arc;

    async fn store_with_package() -> Result<(Arc<MemoryStore>, i64)> {
        let store = Arc::new(MemoryStore::new(Arc::new(MemoryBroker::new())));
        store
            .add_package(Package {
                id: 100,
                name: "Basic".to_string(),
                goods_type_id: 1,
                monthly_price: 3000,
                cpu: 1,
                memory_gb: 1,
                disk_gb: 20,
                bandwidth_mbps: 10,
            })
            .await;
        store
            .add_package(Package {
                id: 200,
                name: "Pro".to_string(),
                goods_type_id: 1,
                monthly_price: 6000,
                cpu: 2,
                memory_gb: 4,
                disk_gb: 40,
                bandwidth_mbps: 20,
            })
            .await;
        let user = store.seed_user("buyer", "pw123456", UserRole::User).await?;
        Ok((store, user.id))
    }

    fn item(package_id: i64) -> OrderItemInput {
        OrderItemInput {
            package_id,
            qty: 1,
            duration_months: 1,
            ..OrderItemInput::default()
        }
    }

    #[tokio::test]
    async fn idempotency_key_returns_original_order() -> Result<()> {
        let (store, user_id) = store_with_package().await?;
        let (first, _) = store
            .create_order_from_items(user_id, "cny", vec![item(100)], "", "key-1")
            .await?;
        let (second, items) = store
            .create_order_from_items(user_id, "cny", vec![item(200)], "", "key-1")
            .await?;
        assert_eq!(first.id, second.id);
        assert_eq!(items.len(), 1);
        assert_eq!(first.total_amount, 3000);
        assert_eq!(first.currency, "CNY");
        Ok(())
    }

    #[tokio::test]
    async fn parallel_creation_with_one_key_yields_one_order() -> Result<()> {
        let (store, user_id) = store_with_package().await?;
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .create_order_from_items(user_id, "CNY", vec![item(100)], "", "same")
                    .await
            }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await??.0.id);
        }
        assert_eq!(ids.len(), 8);
        assert!(ids.iter().all(|id| *id == ids[0]));
        Ok(())
    }

    #[tokio::test]
    async fn payment_then_approve_provisions_once() -> Result<()> {
        let (store, user_id) = store_with_package().await?;
        let (order, _) = store
            .create_order_from_items(user_id, "CNY", vec![item(100)], "", "")
            .await?;
        let input = PaymentInput {
            method: "bank".to_string(),
            amount: 3000,
            ..PaymentInput::default()
        };
        let payment = store
            .submit_payment(user_id, order.id, input.clone(), "pay-1")
            .await?;
        let replay = store.submit_payment(user_id, order.id, input, "pay-1").await?;
        assert_eq!(payment.id, replay.id);

        store.approve_order(1, order.id).await?;
        assert!(matches!(
            store.approve_order(1, order.id).await,
            Err(ServiceError::Conflict)
        ));
        assert_eq!(store.provision_count(), 1);
        let detail = store.get_order_detail(order.id).await?;
        assert_eq!(detail.order.status, OrderStatus::Active);
        assert_eq!(detail.payments[0].status, PaymentStatus::Approved);
        Ok(())
    }

    #[tokio::test]
    async fn resize_is_single_in_flight_per_instance() -> Result<()> {
        let (store, user_id) = store_with_package().await?;
        let instance = store
            .add_instance(user_id, 100, Some(Utc::now() + Duration::days(15)))
            .await?;
        let input = ResizeInput {
            target_package_id: 200,
            ..ResizeInput::default()
        };
        let quote = store.quote_resize(user_id, instance.id, &input).await?;
        assert_eq!(quote.charge_amount, 1500);
        assert_eq!(quote.refund_amount, 0);

        store
            .create_resize_order(user_id, instance.id, input.clone())
            .await?;
        assert!(matches!(
            store.create_resize_order(user_id, instance.id, input).await,
            Err(ServiceError::ResizeInProgress)
        ));
        assert!(matches!(
            store.request_refund(user_id, instance.id, "").await,
            Err(ServiceError::Conflict)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn emergency_renew_enforces_window_and_interval() -> Result<()> {
        let (store, user_id) = store_with_package().await?;
        let far = store
            .add_instance(user_id, 100, Some(Utc::now() + Duration::days(20)))
            .await?;
        assert!(store.create_emergency_renew_order(user_id, far.id).await.is_err());

        let near = store
            .add_instance(user_id, 100, Some(Utc::now() + Duration::days(2)))
            .await?;
        let order = store.create_emergency_renew_order(user_id, near.id).await?;
        assert_eq!(order.total_amount, 0);
        assert_eq!(order.status, OrderStatus::Active);
        assert!(matches!(
            store.create_emergency_renew_order(user_id, near.id).await,
            Err(ServiceError::Conflict)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn foreign_instance_is_not_found() -> Result<()> {
        let (store, user_id) = store_with_package().await?;
        let other = store.seed_user("other", "pw", UserRole::User).await?;
        let instance = store.add_instance(other.id, 100, None).await?;
        assert!(matches!(
            store
                .create_renew_order(user_id, instance.id, RenewInput::default())
                .await,
            Err(ServiceError::NotFound)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn coupon_preview_uses_cart_when_no_items() -> Result<()> {
        let (store, user_id) = store_with_package().await?;
        store.add_coupon("HALF", CouponKind::Percent(50)).await;
        store.add_cart_item(user_id, item(200)).await;
        let preview = store.preview_coupon(user_id, "half", Vec::new()).await?;
        assert_eq!((preview.original, preview.discount, preview.final_total), (6000, 3000, 3000));
        Ok(())
    }

    #[tokio::test]
    async fn cart_order_applies_coupon_and_clears_cart() -> Result<()> {
        let (store, user_id) = store_with_package().await?;
        let coupon_id = store.add_coupon("HALF", CouponKind::Percent(50)).await;
        store.add_cart_item(user_id, item(200)).await;
        let (order, items) = store
            .create_order_from_cart(user_id, "CNY", "half", "cart-1")
            .await?;
        assert_eq!(items.len(), 1);
        assert_eq!(order.total_amount, 3000);
        assert_eq!(order.coupon_discount, 3000);
        assert_eq!(order.coupon_id, Some(coupon_id));
        assert!(matches!(
            store.create_order_from_cart(user_id, "CNY", "", "cart-2").await,
            Err(ServiceError::Rejected(_))
        ));

        let (replay, _) = store
            .create_order_from_cart(user_id, "CNY", "half", "cart-1")
            .await?;
        assert_eq!(replay.id, order.id);
        Ok(())
    }

    #[tokio::test]
    async fn fixed_coupon_floors_total_at_zero() -> Result<()> {
        let (store, user_id) = store_with_package().await?;
        store.add_coupon("BIG", CouponKind::Amount(1_000_000)).await;
        let (order, _) = store
            .create_order_from_items(user_id, "CNY", vec![item(100)], "BIG", "")
            .await?;
        assert_eq!((order.total_amount, order.coupon_discount), (0, 3000));
        assert!(matches!(
            store
                .create_order_from_items(user_id, "CNY", vec![item(100)], "NOPE", "")
                .await,
            Err(ServiceError::Rejected(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn approved_order_cannot_be_deleted() -> Result<()> {
        let (store, user_id) = store_with_package().await?;
        let (order, _) = store
            .create_order_from_items(user_id, "CNY", vec![item(100)], "", "")
            .await?;
        store.set_fail_provisioning(true).await;
        store.mark_paid(1, order.id, PaymentInput::default()).await?;
        assert_eq!(
            store.get_order_detail(order.id).await?.order.status,
            OrderStatus::Failed
        );
        store.set_fail_provisioning(false).await;
        store.retry_provision(1, order.id).await?;
        assert!(matches!(
            store.delete_order(1, order.id).await,
            Err(ServiceError::Conflict)
        ));
        assert_eq!(store.provision_count(), 2);
        Ok(())
    }
}
