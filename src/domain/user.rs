use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    User,
    Admin,
}

impl UserRole {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
        }
    }

    /// Parse a role claim; unknown values fall back to `user`.
    #[must_use]
    pub fn from_claim(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("admin") {
            Self::Admin
        } else {
            Self::User
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    Active,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub phone: String,
    pub qq: String,
    pub role: UserRole,
    pub status: UserStatus,
    pub totp_enabled: bool,
    pub last_login_ip: String,
    pub last_login_at: Option<DateTime<Utc>>,
    pub permission_group_id: Option<i64>,
    pub user_tier_id: Option<i64>,
    pub tier_expire_at: Option<DateTime<Utc>>,
    pub password_changed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl User {
    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == UserStatus::Active
    }

    #[must_use]
    pub fn email_bound(&self) -> bool {
        !self.email.trim().is_empty()
    }

    #[must_use]
    pub fn phone_bound(&self) -> bool {
        !self.phone.trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Permission {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub parent_code: String,
    #[serde(default)]
    pub sort_order: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_from_claim() {
        assert_eq!(UserRole::from_claim("admin"), UserRole::Admin);
        assert_eq!(UserRole::from_claim(" Admin "), UserRole::Admin);
        assert_eq!(UserRole::from_claim(""), UserRole::User);
        assert_eq!(UserRole::from_claim("root"), UserRole::User);
    }
}
