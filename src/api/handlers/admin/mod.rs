//! Back-office endpoints under `/admin/api/v1`.
//!
//! Flow Overview:
//! 1) `auth` signs admins in behind the admin-path check and its own cooldown namespace; the
//!    2FA endpoints there accept `mfa=0` tokens.
//! 2) Every other admin route goes through [`require_admin`](crate::api::gateway::require_admin),
//!    which adds the MFA scope check and the route's permission code.

pub mod auth;
pub mod orders;
pub mod settings;
pub mod users;
