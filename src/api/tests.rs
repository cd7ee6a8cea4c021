//! Router-level tests: requests go through the full layer stack with an in-memory store.

use super::{HandlerDeps, RunMode, app};
use crate::domain::{Channel, NotifyResult, OrderStatus, PaymentStatus, UserRole};
use crate::events::MemoryBroker;
use crate::guards::admin_login_key;
use crate::services::{DisabledSender, LogSender, MessageSender};
use crate::signature::sign_hmac;
use crate::store::memory::{MemoryStore, Package};
use crate::token::TokenSigner;
use anyhow::{Context, Result, anyhow};
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{
        Method, Request, StatusCode,
        header::{AUTHORIZATION, CONTENT_TYPE},
    },
};
use chrono::Utc;
use secrecy::SecretString;
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;

struct Harness {
    store: Arc<MemoryStore>,
    deps: Arc<HandlerDeps>,
    app: Router,
}

impl Harness {
    /// `email_delivery` picks a logging email sender; otherwise email reports `smtp disabled`.
    fn new(email_delivery: bool) -> Self {
        let store = Arc::new(MemoryStore::new(Arc::new(MemoryBroker::new())));
        let email: Arc<dyn MessageSender> = if email_delivery {
            Arc::new(LogSender::new(Channel::Email))
        } else {
            Arc::new(DisabledSender::new("smtp"))
        };
        let deps = Arc::new(HandlerDeps::in_memory(
            store.clone(),
            TokenSigner::new(SecretString::from("test-secret".to_string())),
            email,
            Arc::new(LogSender::new(Channel::Sms)),
            RunMode::Release,
        ));
        let app = app(deps.clone(), None);
        Self { store, deps, app }
    }

    async fn send(&self, request: Request<Body>) -> Result<(StatusCode, Value)> {
        let response = self.app.clone().oneshot(request).await?;
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await?;
        let json = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&body).into_owned()))
        };
        Ok((status, json))
    }

    async fn call(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> Result<(StatusCode, Value)> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        let body = match body {
            Some(value) => {
                builder = builder.header(CONTENT_TYPE, "application/json");
                Body::from(serde_json::to_vec(&value)?)
            }
            None => Body::empty(),
        };
        self.send(builder.body(body)?).await
    }

    async fn post(&self, uri: &str, token: Option<&str>, body: Value) -> Result<(StatusCode, Value)> {
        self.call(Method::POST, uri, token, Some(body)).await
    }

    async fn get(&self, uri: &str, token: Option<&str>) -> Result<(StatusCode, Value)> {
        self.call(Method::GET, uri, token, None).await
    }

    async fn captcha(&self) -> Result<(String, String)> {
        let (status, body) = self.get("/api/v1/captcha", None).await?;
        assert_eq!(status, StatusCode::OK);
        let id = body["captcha_id"]
            .as_str()
            .context("captcha_id missing")?
            .to_string();
        let code = self
            .store
            .peek_captcha(&id)
            .await
            .context("captcha not stored")?;
        Ok((id, code))
    }

    fn access_token(&self, user_id: i64, role: UserRole, mfa: u8) -> Result<String> {
        Ok(self.deps.tokens.issue_pair(user_id, role, mfa)?.access_token)
    }

    async fn admin(&self) -> Result<(i64, String)> {
        let admin = self
            .store
            .seed_user("admin", "admin-pass", UserRole::Admin)
            .await?;
        let token = self.access_token(admin.id, UserRole::Admin, 1)?;
        Ok((admin.id, token))
    }

    async fn order_for(&self, token: &str) -> Result<i64> {
        self.store
            .add_package(Package {
                id: 100,
                name: "Basic".to_string(),
                goods_type_id: 1,
                monthly_price: 1000,
                cpu: 1,
                memory_gb: 1,
                disk_gb: 20,
                bandwidth_mbps: 10,
            })
            .await;
        let (status, body) = self
            .post(
                "/api/v1/orders/items",
                Some(token),
                json!({"items": [{"package_id": 100, "qty": 1, "duration_months": 1}]}),
            )
            .await?;
        assert_eq!(status, StatusCode::OK, "{body}");
        body["order"]["id"].as_i64().context("order id missing")
    }
}

fn error_of(body: &Value) -> &str {
    body["error"].as_str().unwrap_or_default()
}

#[tokio::test]
async fn health_answers_with_app_header() -> Result<()> {
    let harness = Harness::new(false);
    let response = harness
        .app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-app"));
    assert!(response.headers().contains_key("x-request-id"));
    Ok(())
}

#[tokio::test]
async fn register_then_login_via_sms() -> Result<()> {
    let harness = Harness::new(false);
    harness
        .store
        .set_setting("auth_register_verify_channels", r#"["sms"]"#)
        .await;

    let (captcha_id, captcha_code) = harness.captcha().await?;
    let (status, body) = harness
        .post(
            "/api/v1/auth/register/code",
            None,
            json!({
                "channel": "sms",
                "phone": "13900010001",
                "captcha_id": captcha_id,
                "captcha_code": captcha_code,
            }),
        )
        .await?;
    assert_eq!(status, StatusCode::OK, "{body}");
    let code = harness
        .store
        .peek_code(Channel::Sms, "13900010001", "register")
        .await
        .context("register code not issued")?;

    let (captcha_id, captcha_code) = harness.captcha().await?;
    let (status, body) = harness
        .post(
            "/api/v1/auth/register",
            None,
            json!({
                "username": "overall-sms-reg",
                "phone": "13900010001",
                "password": "pass123",
                "verify_channel": "sms",
                "verify_code": code,
                "captcha_id": captcha_id,
                "captcha_code": captcha_code,
            }),
        )
        .await?;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["email"], "");

    let (status, body) = harness
        .post(
            "/api/v1/auth/login",
            None,
            json!({"username": "13900010001", "password": "pass123"}),
        )
        .await?;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert!(body["access_token"].as_str().is_some_and(|t| !t.is_empty()));
    assert_eq!(body["mfa_bind_required"], true);
    Ok(())
}

#[tokio::test]
async fn register_rejects_wrong_code() -> Result<()> {
    let harness = Harness::new(false);
    harness
        .store
        .set_setting("auth_register_verify_channels", r#"["sms"]"#)
        .await;
    let (captcha_id, captcha_code) = harness.captcha().await?;
    let (status, body) = harness
        .post(
            "/api/v1/auth/register",
            None,
            json!({
                "username": "guess",
                "phone": "13900010002",
                "password": "pass123",
                "verify_channel": "sms",
                "verify_code": "000000",
                "captcha_id": captcha_id,
                "captcha_code": captcha_code,
            }),
        )
        .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_of(&body), "invalid verification code");
    Ok(())
}

#[tokio::test]
async fn admin_login_cooldown() -> Result<()> {
    let harness = Harness::new(false);
    harness
        .store
        .seed_user("admin", "admin-pass", UserRole::Admin)
        .await?;

    let bad = json!({"username": "admin", "password": "wrong"});
    for attempt in 1..=9 {
        let (status, _) = harness.post("/admin/api/v1/auth/login", None, bad.clone()).await?;
        assert_eq!(status, StatusCode::UNAUTHORIZED, "attempt {attempt}");
    }
    let before = Utc::now().timestamp();
    let (status, body) = harness.post("/admin/api/v1/auth/login", None, bad.clone()).await?;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    let locked_until = body["locked_until"].as_i64().context("locked_until missing")?;
    assert!((locked_until - (before + 600)).abs() <= 5);

    let (status, _) = harness.post("/admin/api/v1/auth/login", None, bad).await?;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

    harness
        .deps
        .guards
        .login_cooldown
        .reset(&admin_login_key("admin"));
    let (status, body) = harness
        .post(
            "/admin/api/v1/auth/login",
            None,
            json!({"username": "admin", "password": "admin-pass"}),
        )
        .await?;
    assert_eq!(status, StatusCode::OK, "{body}");
    Ok(())
}

#[tokio::test]
async fn admin_login_checks_admin_path_first() -> Result<()> {
    let harness = Harness::new(false);
    harness
        .store
        .seed_user("admin", "admin-pass", UserRole::Admin)
        .await?;
    harness.store.set_setting("admin_path", "backstage").await;

    let login = |path: &str| json!({"username": "admin", "password": "admin-pass", "admin_path": path});
    let (status, body) = harness.post("/admin/api/v1/auth/login", None, login("admin")).await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(error_of(&body), "admin path mismatch");

    let (status, _) = harness.post("/admin/api/v1/auth/login", None, login("a/b")).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = harness
        .post("/admin/api/v1/auth/login", None, login("backstage"))
        .await?;
    assert_eq!(status, StatusCode::OK, "{body}");
    Ok(())
}

#[tokio::test]
async fn user_accounts_cannot_sign_into_admin() -> Result<()> {
    let harness = Harness::new(false);
    harness.store.seed_user("buyer", "pass123", UserRole::User).await?;
    let (status, body) = harness
        .post(
            "/admin/api/v1/auth/login",
            None,
            json!({"username": "buyer", "password": "pass123"}),
        )
        .await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(error_of(&body), "invalid credentials");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn concurrent_payment_notify_provisions_once() -> Result<()> {
    let harness = Harness::new(false);
    let buyer = harness.store.seed_user("buyer", "pass123", UserRole::User).await?;
    let token = harness.access_token(buyer.id, UserRole::User, 0)?;
    let order_id = harness.order_for(&token).await?;
    harness
        .store
        .insert_payment(order_id, "fake", "TN-1", PaymentStatus::PendingPayment)
        .await?;
    harness.store.register_provider("fake", "provider-secret").await;
    harness
        .store
        .script_notify(
            "fake",
            NotifyResult {
                trade_no: "TN-1".to_string(),
                paid: true,
                amount: 1000,
                ..NotifyResult::default()
            },
        )
        .await;

    let mut deliveries = Vec::new();
    for _ in 0..3 {
        let app = harness.app.clone();
        deliveries.push(tokio::spawn(async move {
            let request = Request::builder()
                .method(Method::POST)
                .uri("/api/v1/payments/notify/fake")
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"trade_no":"TN-1"}"#))?;
            let response = app.oneshot(request).await?;
            anyhow::Ok(response.status())
        }));
    }
    for delivery in deliveries {
        assert_eq!(delivery.await??, StatusCode::OK);
    }

    let payment = harness
        .store
        .find_payment_by_trade_no("TN-1")
        .await
        .context("payment missing")?;
    assert_eq!(payment.status, PaymentStatus::Approved);
    assert_eq!(harness.store.provision_count(), 1);
    Ok(())
}

#[tokio::test]
async fn admin_refresh_rejects_user_tokens() -> Result<()> {
    let harness = Harness::new(false);
    let buyer = harness.store.seed_user("buyer", "pass123", UserRole::User).await?;
    let user_pair = harness.deps.tokens.issue_pair(buyer.id, UserRole::User, 0)?;
    let (status, body) = harness
        .post(
            "/admin/api/v1/auth/refresh",
            None,
            json!({"refresh_token": user_pair.refresh_token}),
        )
        .await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(error_of(&body), "invalid refresh token");

    // Admin role claim on a token whose stored account is a plain user.
    let forged = harness.deps.tokens.issue_pair(buyer.id, UserRole::Admin, 0)?;
    let (status, body) = harness
        .post(
            "/admin/api/v1/auth/refresh",
            None,
            json!({"refresh_token": forged.refresh_token}),
        )
        .await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(error_of(&body), "invalid refresh token");

    let (admin_id, _) = harness.admin().await?;
    let admin_pair = harness.deps.tokens.issue_pair(admin_id, UserRole::Admin, 1)?;
    let (status, body) = harness
        .post(
            "/admin/api/v1/auth/refresh",
            None,
            json!({"refresh_token": admin_pair.refresh_token}),
        )
        .await?;
    assert_eq!(status, StatusCode::OK, "{body}");
    Ok(())
}

#[tokio::test]
async fn order_total_applies_coupon() -> Result<()> {
    let harness = Harness::new(false);
    let buyer = harness.store.seed_user("buyer", "pass123", UserRole::User).await?;
    let token = harness.access_token(buyer.id, UserRole::User, 0)?;
    harness.order_for(&token).await?;
    harness
        .store
        .add_coupon("HALF", crate::store::memory::CouponKind::Percent(50))
        .await;
    let items = json!([{"package_id": 100, "qty": 1, "duration_months": 1}]);

    let (status, preview) = harness
        .post(
            "/api/v1/coupons/preview",
            Some(&token),
            json!({"coupon_code": "HALF", "items": items}),
        )
        .await?;
    assert_eq!(status, StatusCode::OK, "{preview}");

    let (status, body) = harness
        .post(
            "/api/v1/orders/items",
            Some(&token),
            json!({"coupon_code": "half", "items": items}),
        )
        .await?;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["order"]["total_amount"], preview["final"]);
    assert_eq!(body["order"]["coupon_discount"], preview["discount"]);
    assert!(body["order"]["coupon_id"].is_i64());

    let (status, _) = harness
        .post(
            "/api/v1/orders/items",
            Some(&token),
            json!({"coupon_code": "MISSING", "items": items}),
        )
        .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn login_alert_location_comes_from_geoip() -> Result<()> {
    use crate::api::{gateway::load_auth_settings, handlers::auth::login::login_location};

    let harness = Harness::new(false);
    harness
        .store
        .add_location("203.0.113.9".parse()?, "Shanghai", "GMT+08:00")
        .await;

    let settings = load_auth_settings(&harness.deps).await?;
    let unset = login_location(&harness.deps, &settings, "203.0.113.9").await;
    assert_eq!((unset.city.as_str(), unset.tz.as_str()), ("unknown", "GMT+00:00"));

    harness
        .store
        .set_setting("auth_geoip_mmdb_path", "/srv/geo/city.mmdb")
        .await;
    let settings = load_auth_settings(&harness.deps).await?;
    let found = login_location(&harness.deps, &settings, "203.0.113.9").await;
    assert_eq!((found.city.as_str(), found.tz.as_str()), ("Shanghai", "GMT+08:00"));
    let private = login_location(&harness.deps, &settings, "192.168.1.5").await;
    assert_eq!(private.city, "unknown");
    Ok(())
}

#[tokio::test]
async fn notify_from_unknown_provider_is_rejected() -> Result<()> {
    let harness = Harness::new(false);
    let (status, _) = harness
        .post("/api/v1/payments/notify/nobody", None, json!({}))
        .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn contact_rebind_requires_security_ticket() -> Result<()> {
    let harness = Harness::new(false);
    for (key, value) in [
        ("auth_2fa_enabled", "true"),
        ("auth_2fa_bind_enabled", "true"),
        ("auth_rebind_require_password_when_no_2fa", "true"),
    ] {
        harness.store.set_setting(key, value).await;
    }
    let user = harness.store.seed_user("overall-bind", "pass123", UserRole::User).await?;
    harness
        .store
        .seed_contact(user.id, crate::domain::ContactKind::Email, "old@example.com")
        .await?;
    let token = harness.access_token(user.id, UserRole::User, 0)?;

    let (status, body) = harness
        .post(
            "/api/v1/me/security/2fa/setup",
            Some(&token),
            json!({"password": "pass123"}),
        )
        .await?;
    assert_eq!(status, StatusCode::OK, "{body}");
    let pending = harness
        .store
        .current_totp(user.id, true)
        .await
        .ok_or_else(|| anyhow!("pending secret missing"))?;
    let (status, body) = harness
        .post("/api/v1/me/security/2fa/confirm", Some(&token), json!({"code": pending}))
        .await?;
    assert_eq!(status, StatusCode::OK, "{body}");

    let (status, body) = harness
        .post(
            "/api/v1/me/security/email/send-code",
            Some(&token),
            json!({"value": "new@example.com", "current_password": "pass123"}),
        )
        .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_of(&body), "security ticket required");

    let totp = harness
        .store
        .current_totp(user.id, false)
        .await
        .ok_or_else(|| anyhow!("secret missing"))?;
    let (status, body) = harness
        .post(
            "/api/v1/me/security/email/verify-2fa",
            Some(&token),
            json!({"totp_code": totp}),
        )
        .await?;
    assert_eq!(status, StatusCode::OK, "{body}");
    let ticket = body["security_ticket"]
        .as_str()
        .context("security_ticket missing")?
        .to_string();

    let (status, body) = harness
        .post(
            "/api/v1/me/security/email/send-code",
            Some(&token),
            json!({"value": "new@example.com", "security_ticket": ticket}),
        )
        .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_of(&body), "smtp disabled");
    Ok(())
}

#[tokio::test]
async fn password_reset_state_machine() -> Result<()> {
    let harness = Harness::new(true);
    harness
        .store
        .set_setting("auth_password_reset_channels", r#"["email","sms"]"#)
        .await;
    let user = harness.store.seed_user("overall-reset", "pass123", UserRole::User).await?;
    harness
        .store
        .seed_contact(user.id, crate::domain::ContactKind::Email, "reset@example.com")
        .await?;
    harness
        .store
        .seed_contact(user.id, crate::domain::ContactKind::Phone, "13900010009")
        .await?;

    let (status, body) = harness
        .post(
            "/api/v1/auth/password-reset/options",
            None,
            json!({"account": "overall-reset"}),
        )
        .await?;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["channels"], json!(["email", "sms"]));
    assert_eq!(body["sms_requires_phone_full"], true);

    let send = "/api/v1/auth/password-reset/send-code";
    let (status, body) = harness
        .post(send, None, json!({"account": "overall-reset", "channel": "sms"}))
        .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_of(&body), "phone_full required");

    let (status, body) = harness
        .post(
            send,
            None,
            json!({"account": "overall-reset", "channel": "sms", "phone_full": "13900000000"}),
        )
        .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_of(&body), "phone mismatch");

    let (status, body) = harness
        .post(send, None, json!({"account": "overall-reset", "channel": "email"}))
        .await?;
    assert_eq!(status, StatusCode::OK, "{body}");
    let code = harness
        .store
        .peek_code(Channel::Email, "reset@example.com", "password_reset")
        .await
        .context("reset code not issued")?;

    let (status, body) = harness
        .post(
            "/api/v1/auth/password-reset/verify-code",
            None,
            json!({"account": "overall-reset", "channel": "email", "code": code}),
        )
        .await?;
    assert_eq!(status, StatusCode::OK, "{body}");
    let ticket = body["reset_ticket"]
        .as_str()
        .filter(|ticket| !ticket.is_empty())
        .context("reset_ticket missing")?
        .to_string();

    let confirm = json!({"reset_ticket": ticket, "new_password": "newpass456"});
    let (status, body) = harness
        .post("/api/v1/auth/password-reset/confirm", None, confirm.clone())
        .await?;
    assert_eq!(status, StatusCode::OK, "{body}");

    let (status, body) = harness
        .post("/api/v1/auth/password-reset/confirm", None, confirm)
        .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_of(&body), "invalid reset ticket");

    let (status, _) = harness
        .post(
            "/api/v1/auth/login",
            None,
            json!({"username": "overall-reset", "password": "newpass456"}),
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = harness
        .post(
            "/api/v1/auth/login",
            None,
            json!({"username": "overall-reset", "password": "pass123"}),
        )
        .await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn setting_json_double_encode_rejected() -> Result<()> {
    let harness = Harness::new(false);
    let (_, token) = harness.admin().await?;

    let (status, body) = harness
        .call(
            Method::PATCH,
            "/admin/api/v1/settings",
            Some(&token),
            Some(json!({"key": "site_nav_items", "value": "\"[{\\\"label\\\":\\\"A\\\"}]\""})),
        )
        .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(error_of(&body).contains("double-encoded"));

    let (status, body) = harness
        .call(
            Method::PATCH,
            "/admin/api/v1/settings",
            Some(&token),
            Some(json!({"key": "site_nav_items", "value": "[{\"label\":\"A\"}]"})),
        )
        .await?;
    assert_eq!(status, StatusCode::OK, "{body}");

    let (status, body) = harness.get("/admin/api/v1/settings", Some(&token)).await?;
    assert_eq!(status, StatusCode::OK);
    let stored = body["items"]
        .as_array()
        .into_iter()
        .flatten()
        .any(|item| item["key"] == "site_nav_items");
    assert!(stored);
    Ok(())
}

#[tokio::test]
async fn admin_routes_require_unlocked_mfa() -> Result<()> {
    let harness = Harness::new(false);
    let (admin_id, _) = harness.admin().await?;
    let locked = harness.access_token(admin_id, UserRole::Admin, 0)?;

    let (status, body) = harness.get("/admin/api/v1/orders", Some(&locked)).await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "admin_2fa_bind_required");

    harness.store.set_setting("auth_2fa_enabled", "false").await;
    let (status, _) = harness.get("/admin/api/v1/orders", Some(&locked)).await?;
    assert_eq!(status, StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn secondary_admins_need_permission_codes() -> Result<()> {
    let harness = Harness::new(false);
    harness.admin().await?;
    let helper = harness
        .store
        .seed_user("helper", "helper-pass", UserRole::Admin)
        .await?;
    let token = harness.access_token(helper.id, UserRole::Admin, 1)?;

    let (status, body) = harness.get("/admin/api/v1/orders", Some(&token)).await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(error_of(&body), "permission denied");

    harness.store.grant_permission(helper.id, "order").await;
    let (status, body) = harness.get("/admin/api/v1/orders", Some(&token)).await?;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["total"], 0);
    Ok(())
}

#[tokio::test]
async fn admin_approves_and_deletes_orders() -> Result<()> {
    let harness = Harness::new(false);
    let (_, admin_token) = harness.admin().await?;
    let buyer = harness.store.seed_user("buyer", "pass123", UserRole::User).await?;
    let buyer_token = harness.access_token(buyer.id, UserRole::User, 0)?;
    let order_id = harness.order_for(&buyer_token).await?;

    let uri = format!("/admin/api/v1/orders/{order_id}/approve");
    let (status, body) = harness.post(&uri, Some(&admin_token), json!({})).await?;
    assert_eq!(status, StatusCode::OK, "{body}");
    let order = harness.store.find_order(order_id).await.context("order missing")?;
    assert_ne!(order.status, OrderStatus::PendingPayment);

    let (status, body) = harness.post(&uri, Some(&admin_token), json!({})).await?;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error_of(&body), "order status not editable");

    let (status, body) = harness
        .call(
            Method::DELETE,
            &format!("/admin/api/v1/orders/{order_id}"),
            Some(&admin_token),
            None,
        )
        .await?;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error_of(&body), "approved order cannot be deleted");

    let (status, body) = harness
        .get(&format!("/admin/api/v1/orders/{order_id}"), Some(&admin_token))
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert!(body["events"].as_array().is_some_and(|events| !events.is_empty()));
    Ok(())
}

#[tokio::test]
async fn wallet_withdraw_review() -> Result<()> {
    let harness = Harness::new(false);
    let (_, admin_token) = harness.admin().await?;
    let buyer = harness.store.seed_user("buyer", "pass123", UserRole::User).await?;
    let token = harness.access_token(buyer.id, UserRole::User, 0)?;
    harness.store.credit_wallet(buyer.id, 5000).await;

    let (status, body) = harness
        .post("/api/v1/wallet/withdraw", Some(&token), json!({"amount": "20"}))
        .await?;
    assert_eq!(status, StatusCode::OK, "{body}");
    let id = body["order"]["id"].as_i64().context("wallet order id missing")?;

    let (status, body) = harness
        .get("/admin/api/v1/wallet/orders?status=pending_review", Some(&admin_token))
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);

    let (status, body) = harness
        .post(
            &format!("/admin/api/v1/wallet/orders/{id}/approve"),
            Some(&admin_token),
            json!({}),
        )
        .await?;
    assert_eq!(status, StatusCode::OK, "{body}");

    let (status, body) = harness.get("/api/v1/wallet", Some(&token)).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["wallet"]["balance"].as_f64(), Some(30.0));
    Ok(())
}

#[tokio::test]
async fn robot_webhook_is_signed() -> Result<()> {
    let harness = Harness::new(false);
    let buyer = harness.store.seed_user("buyer", "pass123", UserRole::User).await?;
    let token = harness.access_token(buyer.id, UserRole::User, 0)?;
    let order_id = harness.order_for(&token).await?;
    let payload = serde_json::to_vec(&json!({"action": "approve", "order_id": order_id}))?;
    let webhook = |signature: &str| -> Result<Request<Body>> {
        Ok(Request::builder()
            .method(Method::POST)
            .uri("/api/v1/integrations/robot/webhook")
            .header(CONTENT_TYPE, "application/json")
            .header("x-robot-signature", signature)
            .body(Body::from(payload.clone()))?)
    };

    let (status, _) = harness.send(webhook("00")?).await?;
    assert_eq!(status, StatusCode::FORBIDDEN);

    harness.store.set_setting("robot_webhook_secret", "robot-secret").await;
    let (status, body) = harness.send(webhook("00")?).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(error_of(&body), "invalid signature");

    let signature = sign_hmac(&payload, "robot-secret");
    let (status, body) = harness.send(webhook(&signature)?).await?;
    assert_eq!(status, StatusCode::OK, "{body}");
    let order = harness.store.find_order(order_id).await.context("order missing")?;
    assert_ne!(order.status, OrderStatus::PendingPayment);
    Ok(())
}

#[tokio::test]
async fn user_routes_require_a_token() -> Result<()> {
    let harness = Harness::new(false);
    let (status, body) = harness.get("/api/v1/wallet", None).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(error_of(&body), "invalid token");

    let (status, _) = harness.get("/api/v1/wallet", Some("not-a-jwt")).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn refund_follows_capability_policy() -> Result<()> {
    let harness = Harness::new(false);
    let buyer = harness.store.seed_user("buyer", "pass123", UserRole::User).await?;
    let token = harness.access_token(buyer.id, UserRole::User, 0)?;
    harness.order_for(&token).await?;
    let expire_at = Some(Utc::now() + chrono::Duration::days(20));

    let limited = harness.store.add_instance(buyer.id, 100, expire_at).await?;
    harness
        .store
        .set_automation_features(limited.id, vec!["upgrade".to_string()])
        .await;
    let (status, body) = harness
        .post(&format!("/api/v1/vps/{}/refund", limited.id), Some(&token), json!({}))
        .await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(error_of(&body), "refund disabled");

    harness.store.set_setting("refund_enabled", "false").await;
    let plain = harness.store.add_instance(buyer.id, 100, expire_at).await?;
    let (status, _) = harness
        .post(&format!("/api/v1/vps/{}/refund", plain.id), Some(&token), json!({}))
        .await?;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = harness
        .post("/api/v1/vps/999999/refund", Some(&token), json!({}))
        .await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}
