use super::{
    MemoryStore, StoredCode, TOTP_ISSUER, UserRecord, find_by, hash_new_password,
    password_matches, random_code, random_hex,
};
use crate::domain::{
    Captcha, Channel, CodePolicy, ContactKind, GeoLocation, Permission, RegisterInput, Setting,
    Ticket, TotpSetup, User, UserRole, UserStatus,
};
use crate::error::ServiceError;
use crate::services::{
    AdminService, AuthService, GeoResolver, PermissionService, ServiceResult, SettingsService,
    TicketStore,
};
use async_trait::async_trait;
use base64ct::{Base64, Encoding};
use chrono::{DateTime, Duration, Utc};
use std::net::IpAddr;
use totp_rs::{Algorithm, Secret, TOTP};
use tracing::{info, warn};

fn normalize_receiver(channel: Channel, receiver: &str) -> String {
    match channel {
        Channel::Email => receiver.trim().to_lowercase(),
        Channel::Sms => receiver.trim().to_string(),
    }
}

fn is_public(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_multicast()
                || v4.is_broadcast())
        }
        IpAddr::V6(v6) => {
            !(v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_multicast()
                || v6.is_unicast_link_local()
                || v6.is_unique_local())
        }
    }
}

fn ttl(policy: CodePolicy) -> Duration {
    Duration::from_std(policy.ttl).unwrap_or_else(|_| Duration::minutes(10))
}

fn totp_for(secret: Vec<u8>, account: &str) -> ServiceResult<TOTP> {
    TOTP::new(
        Algorithm::SHA1,
        6,
        1,
        30,
        secret,
        Some(TOTP_ISSUER.to_string()),
        account.replace(':', "_"),
    )
    .map_err(|e| ServiceError::internal(format!("totp init error: {e}")))
}

fn totp_matches(secret: &[u8], account: &str, code: &str) -> ServiceResult<bool> {
    let code = code.trim();
    if code.is_empty() {
        return Ok(false);
    }
    let totp = totp_for(secret.to_vec(), account)?;
    Ok(totp.check_current(code).unwrap_or(false))
}

/// Minimal SVG with the code text; real rendering belongs to a captcha service.
fn render_captcha(code: &str) -> String {
    let svg = format!(
        "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"120\" height=\"40\">\
         <text x=\"10\" y=\"28\" font-size=\"24\" font-family=\"monospace\">{code}</text></svg>"
    );
    format!(
        "data:image/svg+xml;base64,{}",
        Base64::encode_string(svg.as_bytes())
    )
}

impl MemoryStore {
    /// Current TOTP code for an enrolled user, or for the pending secret when `pending`.
    pub async fn current_totp(&self, user_id: i64, pending: bool) -> Option<String> {
        let state = self.lock().await;
        let record = state.users.get(&user_id)?;
        let secret = if pending {
            record.pending_totp.clone()?
        } else {
            record.totp_secret.clone()?
        };
        totp_for(secret, &record.user.username)
            .ok()?
            .generate_current()
            .ok()
    }

    /// Last code issued for `(channel, receiver, purpose)`, for local delivery stubs and tests.
    pub async fn peek_code(&self, channel: Channel, receiver: &str, purpose: &str) -> Option<String> {
        let key = (
            channel,
            normalize_receiver(channel, receiver),
            purpose.to_string(),
        );
        self.lock().await.codes.get(&key).map(|c| c.code.clone())
    }

    pub async fn peek_captcha(&self, captcha_id: &str) -> Option<String> {
        self.lock()
            .await
            .captchas
            .get(captcha_id)
            .map(|c| c.code.clone())
    }

    /// Seeds the location table consulted by [`GeoResolver::resolve`].
    pub async fn add_location(&self, ip: IpAddr, city: &str, tz: &str) {
        self.lock().await.locations.insert(
            ip,
            GeoLocation {
                city: city.to_string(),
                tz: tz.to_string(),
            },
        );
    }

    /// Binds a contact without verification, for seeding.
    ///
    /// # Errors
    /// Returns [`ServiceError::NotFound`] for an unknown user.
    pub async fn seed_contact(&self, user_id: i64, kind: ContactKind, value: &str) -> ServiceResult<()> {
        let mut state = self.lock().await;
        let record = state.user_mut(user_id)?;
        match kind {
            ContactKind::Email => record.user.email = value.trim().to_string(),
            ContactKind::Phone => record.user.phone = value.trim().to_string(),
        }
        Ok(())
    }
}

#[async_trait]
impl AuthService for MemoryStore {
    async fn register(&self, input: RegisterInput) -> ServiceResult<User> {
        let username = input.username.trim();
        if username.is_empty() || input.password.is_empty() {
            return Err(ServiceError::InvalidInput);
        }
        let email = input.email.trim().to_lowercase();
        let phone = input.phone.trim().to_string();
        let mut state = self.lock().await;
        if find_by(&state, |u| u.username.eq_ignore_ascii_case(username)).is_some() {
            return Err(ServiceError::rejected("username already exists"));
        }
        if !email.is_empty() && find_by(&state, |u| u.email.eq_ignore_ascii_case(&email)).is_some() {
            return Err(ServiceError::rejected("email already exists"));
        }
        if !phone.is_empty() && find_by(&state, |u| u.phone == phone).is_some() {
            return Err(ServiceError::rejected("phone already exists"));
        }
        let (salt, password_hash) = hash_new_password(&input.password)?;
        let id = state.next_id();
        let user = User {
            id,
            username: username.to_string(),
            email,
            phone,
            qq: input.qq.trim().to_string(),
            role: UserRole::User,
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

    async fn login(&self, account: &str, password: &str) -> ServiceResult<User> {
        let account = account.trim();
        if account.is_empty() {
            return Err(ServiceError::InvalidCredentials);
        }
        let state = self.lock().await;
        let record = find_by(&state, |u| {
            u.username.eq_ignore_ascii_case(account)
                || (!u.email.is_empty() && u.email.eq_ignore_ascii_case(account))
                || (!u.phone.is_empty() && u.phone == account)
        })
        .ok_or(ServiceError::InvalidCredentials)?;
        if !password_matches(record, password) {
            return Err(ServiceError::InvalidCredentials);
        }
        if !record.user.is_active() {
            return Err(ServiceError::Forbidden);
        }
        Ok(record.user.clone())
    }

    async fn get_user(&self, user_id: i64) -> ServiceResult<User> {
        Ok(self.lock().await.user(user_id)?.user.clone())
    }

    async fn find_user_by_username(&self, username: &str) -> ServiceResult<Option<User>> {
        let username = username.trim();
        let state = self.lock().await;
        Ok(find_by(&state, |u| u.username.eq_ignore_ascii_case(username)).map(|r| r.user.clone()))
    }

    async fn find_user_by_email(&self, email: &str) -> ServiceResult<Option<User>> {
        let email = email.trim();
        if email.is_empty() {
            return Ok(None);
        }
        let state = self.lock().await;
        Ok(find_by(&state, |u| u.email.eq_ignore_ascii_case(email)).map(|r| r.user.clone()))
    }

    async fn find_user_by_phone(&self, phone: &str) -> ServiceResult<Option<User>> {
        let phone = phone.trim();
        if phone.is_empty() {
            return Ok(None);
        }
        let state = self.lock().await;
        Ok(find_by(&state, |u| u.phone == phone).map(|r| r.user.clone()))
    }

    async fn verify_password(&self, user_id: i64, password: &str) -> ServiceResult<()> {
        let state = self.lock().await;
        if password_matches(state.user(user_id)?, password) {
            Ok(())
        } else {
            Err(ServiceError::InvalidCredentials)
        }
    }

    async fn update_password(&self, user_id: i64, password: &str) -> ServiceResult<User> {
        if password.is_empty() {
            return Err(ServiceError::InvalidInput);
        }
        let (salt, password_hash) = hash_new_password(password)?;
        let mut state = self.lock().await;
        let record = state.user_mut(user_id)?;
        record.salt = salt;
        record.password_hash = password_hash;
        record.user.password_changed_at = Some(Utc::now());
        Ok(record.user.clone())
    }

    async fn update_contact(
        &self,
        user_id: i64,
        kind: ContactKind,
        value: &str,
    ) -> ServiceResult<User> {
        let value = match kind {
            ContactKind::Email => value.trim().to_lowercase(),
            ContactKind::Phone => value.trim().to_string(),
        };
        let mut state = self.lock().await;
        let taken = find_by(&state, |u| {
            u.id != user_id
                && match kind {
                    ContactKind::Email => u.email.eq_ignore_ascii_case(&value),
                    ContactKind::Phone => u.phone == value,
                }
        })
        .is_some();
        if taken && !value.is_empty() {
            return Err(ServiceError::Conflict);
        }
        let record = state.user_mut(user_id)?;
        match kind {
            ContactKind::Email => record.user.email = value,
            ContactKind::Phone => record.user.phone = value,
        }
        Ok(record.user.clone())
    }

    async fn record_login(&self, user_id: i64, ip: &str, at: DateTime<Utc>) -> ServiceResult<()> {
        let mut state = self.lock().await;
        let record = state.user_mut(user_id)?;
        record.user.last_login_ip = ip.trim().to_string();
        record.user.last_login_at = Some(at);
        Ok(())
    }

    async fn create_verification_code(
        &self,
        channel: Channel,
        receiver: &str,
        purpose: &str,
        policy: CodePolicy,
    ) -> ServiceResult<String> {
        let receiver = normalize_receiver(channel, receiver);
        if receiver.is_empty() || purpose.trim().is_empty() {
            return Err(ServiceError::InvalidInput);
        }
        let code = random_code(policy.complexity.alphabet(), policy.length.max(4));
        let stored = StoredCode {
            code: code.clone(),
            expires_at: Utc::now() + ttl(policy),
        };
        self.lock()
            .await
            .codes
            .insert((channel, receiver, purpose.trim().to_string()), stored);
        Ok(code)
    }

    async fn verify_verification_code(
        &self,
        channel: Channel,
        receiver: &str,
        purpose: &str,
        code: &str,
    ) -> ServiceResult<()> {
        let key = (
            channel,
            normalize_receiver(channel, receiver),
            purpose.trim().to_string(),
        );
        let code = code.trim();
        let mut state = self.lock().await;
        let valid = state.codes.get(&key).is_some_and(|stored| {
            stored.expires_at > Utc::now() && stored.code.eq_ignore_ascii_case(code)
        });
        if !valid || code.is_empty() {
            return Err(ServiceError::rejected("invalid verification code"));
        }
        state.codes.remove(&key);
        Ok(())
    }

    async fn create_captcha(&self, policy: CodePolicy) -> ServiceResult<Captcha> {
        let id = random_hex(16)?;
        let code = random_code(policy.complexity.alphabet(), policy.length.max(4));
        let image_base64 = render_captcha(&code);
        self.lock().await.captchas.insert(
            id.clone(),
            StoredCode {
                code,
                expires_at: Utc::now() + ttl(policy),
            },
        );
        Ok(Captcha { id, image_base64 })
    }

    async fn verify_captcha(&self, captcha_id: &str, code: &str) -> ServiceResult<()> {
        // Single use: the entry is dropped whatever the outcome.
        let stored = self.lock().await.captchas.remove(captcha_id.trim());
        let code = code.trim();
        match stored {
            Some(stored)
                if stored.expires_at > Utc::now()
                    && !code.is_empty()
                    && stored.code.eq_ignore_ascii_case(code) =>
            {
                Ok(())
            }
            _ => Err(ServiceError::rejected("captcha failed")),
        }
    }

    async fn setup_totp(
        &self,
        user_id: i64,
        password: &str,
        current_code: Option<&str>,
    ) -> ServiceResult<TotpSetup> {
        let mut state = self.lock().await;
        let record = state.user_mut(user_id)?;
        if !password_matches(record, password) {
            return Err(ServiceError::rejected("invalid password"));
        }
        if let Some(secret) = record.totp_secret.as_deref() {
            let code = current_code.unwrap_or_default();
            if !totp_matches(secret, &record.user.username, code)? {
                return Err(ServiceError::rejected("invalid 2fa code"));
            }
        }
        let secret = Secret::generate_secret()
            .to_bytes()
            .map_err(|e| ServiceError::internal(format!("secret gen error: {e}")))?;
        let totp = totp_for(secret.clone(), &record.user.username)?;
        record.pending_totp = Some(secret);
        Ok(TotpSetup {
            secret: totp.get_secret_base32(),
            otpauth_url: totp.get_url(),
        })
    }

    async fn confirm_totp(&self, user_id: i64, code: &str) -> ServiceResult<()> {
        let mut state = self.lock().await;
        let record = state.user_mut(user_id)?;
        let Some(pending) = record.pending_totp.clone() else {
            return Err(ServiceError::rejected("2fa setup required"));
        };
        if !totp_matches(&pending, &record.user.username, code)? {
            return Err(ServiceError::rejected("invalid 2fa code"));
        }
        record.totp_secret = Some(pending);
        record.pending_totp = None;
        record.user.totp_enabled = true;
        Ok(())
    }

    async fn verify_totp(&self, user_id: i64, code: &str) -> ServiceResult<()> {
        let state = self.lock().await;
        let record = state.user(user_id)?;
        let Some(secret) = record.totp_secret.as_deref() else {
            return Err(ServiceError::rejected("2fa not enabled"));
        };
        if totp_matches(secret, &record.user.username, code)? {
            Ok(())
        } else {
            Err(ServiceError::rejected("invalid 2fa code"))
        }
    }
}

#[async_trait]
impl AdminService for MemoryStore {
    async fn update_admin_status(
        &self,
        operator_id: i64,
        user_id: i64,
        status: UserStatus,
    ) -> ServiceResult<()> {
        let mut state = self.lock().await;
        let record = state.user_mut(user_id)?;
        if !record.user.is_admin() {
            return Err(ServiceError::rejected("not an admin account"));
        }
        record.user.status = status;
        info!(operator_id, user_id, ?status, "Admin status updated");
        Ok(())
    }
}

#[async_trait]
impl SettingsService for MemoryStore {
    async fn get(&self, key: &str) -> ServiceResult<Option<String>> {
        Ok(self.lock().await.settings.get(key.trim()).cloned())
    }

    async fn list(&self) -> ServiceResult<Vec<Setting>> {
        Ok(self.settings_snapshot().await)
    }

    async fn update(&self, key: &str, value: &str) -> ServiceResult<()> {
        let key = key.trim();
        if key.is_empty() {
            return Err(ServiceError::InvalidInput);
        }
        self.set_setting(key, value).await;
        Ok(())
    }
}

#[async_trait]
impl PermissionService for MemoryStore {
    async fn is_primary_admin(&self, user_id: i64) -> ServiceResult<bool> {
        let state = self.lock().await;
        // The first admin account ever created owns every permission.
        let primary = state
            .users
            .values()
            .find(|record| record.user.is_admin())
            .map(|record| record.user.id);
        Ok(primary == Some(user_id))
    }

    async fn has_permission(&self, user_id: i64, code: &str) -> ServiceResult<bool> {
        let state = self.lock().await;
        let Some(granted) = state.grants.get(&user_id) else {
            return Ok(false);
        };
        // A parent grant covers its children: "order" allows "order.view".
        let mut candidate = code.trim();
        loop {
            if granted.contains(candidate) {
                return Ok(true);
            }
            match candidate.rfind('.') {
                Some(idx) => candidate = &candidate[..idx],
                None => return Ok(false),
            }
        }
    }

    async fn list_permissions(&self) -> ServiceResult<Vec<Permission>> {
        Ok(self.lock().await.permissions.clone())
    }
}

#[async_trait]
impl TicketStore for MemoryStore {
    async fn insert(&self, ticket: Ticket) -> ServiceResult<()> {
        let mut state = self.lock().await;
        if state.tickets.contains_key(&ticket.token) {
            warn!("Ticket collision, refusing to overwrite");
            return Err(ServiceError::Conflict);
        }
        let now = Utc::now();
        state.tickets.retain(|_, t| t.expires_at > now);
        state.tickets.insert(ticket.token.clone(), ticket);
        Ok(())
    }

    async fn get(&self, token: &str) -> ServiceResult<Option<Ticket>> {
        Ok(self.lock().await.tickets.get(token.trim()).cloned())
    }

    async fn mark_used(&self, token: &str, at: DateTime<Utc>) -> ServiceResult<()> {
        let mut state = self.lock().await;
        let ticket = state
            .tickets
            .get_mut(token.trim())
            .ok_or(ServiceError::NotFound)?;
        if ticket.used_at.is_some() {
            return Err(ServiceError::Conflict);
        }
        ticket.used_at = Some(at);
        Ok(())
    }
}

/// Lookups come from the seeded table; `source` only has to be configured.
#[async_trait]
impl GeoResolver for MemoryStore {
    async fn resolve(&self, ip: &str, source: &str) -> ServiceResult<GeoLocation> {
        if source.trim().is_empty() {
            return Err(ServiceError::NotFound);
        }
        let ip: IpAddr = ip.trim().parse().map_err(|_| ServiceError::InvalidInput)?;
        if !is_public(ip) {
            return Err(ServiceError::InvalidInput);
        }
        self.lock()
            .await
            .locations
            .get(&ip)
            .cloned()
            .ok_or(ServiceError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::CodeComplexity;
    use crate::events::MemoryBroker;
    use anyhow::{Result, anyhow};
    use std::sync::Arc;

    fn store() -> MemoryStore {
        MemoryStore::new(Arc::new(MemoryBroker::new()))
    }

    fn policy() -> CodePolicy {
        CodePolicy {
            ttl: std::time::Duration::from_secs(300),
            length: 6,
            complexity: CodeComplexity::Digits,
        }
    }

    #[tokio::test]
    async fn login_accepts_username_email_or_phone() -> Result<()> {
        let store = store();
        let user = store
            .register(RegisterInput {
                username: "carol".to_string(),
                email: "Carol@Example.com".to_string(),
                phone: "13900010002".to_string(),
                password: "pass123".to_string(),
                ..RegisterInput::default()
            })
            .await?;
        assert_eq!(user.email, "carol@example.com");
        for account in ["carol", "CAROL@example.com", "13900010002"] {
            assert_eq!(store.login(account, "pass123").await?.id, user.id);
        }
        assert!(matches!(
            store.login("carol", "nope").await,
            Err(ServiceError::InvalidCredentials)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn verification_codes_are_single_use() -> Result<()> {
        let store = store();
        let code = store
            .create_verification_code(Channel::Email, "A@Example.com", "register", policy())
            .await?;
        assert_eq!(code.len(), 6);
        assert!(store
            .verify_verification_code(Channel::Email, "a@example.com", "bind_email", &code)
            .await
            .is_err());
        store
            .verify_verification_code(Channel::Email, "a@example.com", "register", &code)
            .await?;
        assert!(store
            .verify_verification_code(Channel::Email, "a@example.com", "register", &code)
            .await
            .is_err());
        Ok(())
    }

    #[tokio::test]
    async fn captcha_is_dropped_after_one_attempt() -> Result<()> {
        let store = store();
        let captcha = store.create_captcha(policy()).await?;
        assert!(captcha.image_base64.starts_with("data:image/svg+xml;base64,"));
        let code = store
            .peek_captcha(&captcha.id)
            .await
            .ok_or_else(|| anyhow!("captcha missing"))?;
        assert!(store.verify_captcha(&captcha.id, "wrong").await.is_err());
        assert!(store.verify_captcha(&captcha.id, &code).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn totp_enrollment_and_rebind() -> Result<()> {
        let store = store();
        let user = store.seed_user("dave", "pw123456", UserRole::Admin).await?;
        assert!(store.setup_totp(user.id, "bad", None).await.is_err());

        let setup = store.setup_totp(user.id, "pw123456", None).await?;
        assert!(setup.otpauth_url.starts_with("otpauth://totp/"));
        let code = store
            .current_totp(user.id, true)
            .await
            .ok_or_else(|| anyhow!("pending secret missing"))?;
        store.confirm_totp(user.id, &code).await?;
        assert!(store.get_user(user.id).await?.totp_enabled);

        let current = store
            .current_totp(user.id, false)
            .await
            .ok_or_else(|| anyhow!("secret missing"))?;
        store.verify_totp(user.id, &current).await?;
        assert!(store.setup_totp(user.id, "pw123456", None).await.is_err());
        store
            .setup_totp(user.id, "pw123456", Some(current.as_str()))
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn parent_grant_covers_children() -> Result<()> {
        let store = store();
        let primary = store.seed_user("root", "pw", UserRole::Admin).await?;
        let staff = store.seed_user("staff", "pw", UserRole::Admin).await?;
        store.grant_permission(staff.id, "order").await;
        assert!(store.is_primary_admin(primary.id).await?);
        assert!(!store.is_primary_admin(staff.id).await?);
        assert!(store.has_permission(staff.id, "order.delete").await?);
        assert!(!store.has_permission(staff.id, "wallet_order.approve").await?);
        Ok(())
    }

    #[tokio::test]
    async fn password_update_advances_changed_at() -> Result<()> {
        let store = store();
        let user = store.seed_user("erin", "old-pass", UserRole::User).await?;
        assert!(user.password_changed_at.is_none());
        let updated = store.update_password(user.id, "new-pass").await?;
        assert!(updated.password_changed_at.is_some());
        store.verify_password(user.id, "new-pass").await?;
        Ok(())
    }

    #[tokio::test]
    async fn geo_lookup_skips_private_addresses() -> Result<()> {
        let store = store();
        store
            .add_location("203.0.113.9".parse()?, "Shanghai", "GMT+08:00")
            .await;
        let found = store.resolve(" 203.0.113.9 ", "/var/lib/geo.mmdb").await?;
        assert_eq!(found.city, "Shanghai");
        assert!(matches!(
            store.resolve("203.0.113.9", "").await,
            Err(ServiceError::NotFound)
        ));
        for ip in ["10.1.2.3", "127.0.0.1", "::1", "fe80::1", "not-an-ip"] {
            assert!(matches!(
                store.resolve(ip, "/var/lib/geo.mmdb").await,
                Err(ServiceError::InvalidInput)
            ));
        }
        assert!(matches!(
            store.resolve("198.51.100.7", "/var/lib/geo.mmdb").await,
            Err(ServiceError::NotFound)
        ));
        Ok(())
    }
}
