//! # Xiaoheiplay (VPS resale and service console adapter)
//!
//! `xiaoheiplay` is the HTTP adapter of a multi-tenant VPS resale platform. It serves the
//! end-user shop and console under `/api/v1` and the administrative back-office under
//! `/admin/api/v1`.
//!
//! ## Account security
//!
//! Access and refresh tokens are HS256 JWTs carrying `{user_id, role, type, mfa, iat, exp}`.
//! The `mfa` claim is a scalar scope: only the 2FA unlock endpoint can raise it from `0` to `1`,
//! and refresh copies it forward. Tokens issued before a password change are rejected.
//!
//! Contact rebinding and password resets are driven by short-lived, single-use tickets. Failed
//! logins and failed 2FA attempts are tracked by process-local guards (see [`guards`]); the
//! guards are advisory and never replace the checks performed by the domain services.
//!
//! ## Order pipeline
//!
//! Orders are created from the cart or from explicit items (including renew, resize, refund and
//! emergency renew). Mutating requests honour an `Idempotency-Key` header. Payments are either
//! submitted manually for review or selected through a provider, whose asynchronous notify
//! callback is handled idempotently per `(provider, trade_no)`. Order progress is streamed with
//! Server-Sent Events.
//!
//! ## Collaborators
//!
//! Persistence and domain rules live behind the traits in [`services`]. The [`store::memory`]
//! backend implements all of them in-process so the binary can run standalone.

pub mod api;
pub mod capability;
pub mod cli;
pub mod domain;
pub mod error;
pub mod events;
pub mod guards;
pub mod money;
pub mod permissions;
pub mod services;
pub mod settings;
pub mod signature;
pub mod store;
pub mod token;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            // Acceptable in non-git build environments
            return;
        }
        assert!(
            GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()),
            "GIT_COMMIT_HASH should be a hex string, got: {GIT_COMMIT_HASH}"
        );
        assert!(
            GIT_COMMIT_HASH.len() >= 7,
            "GIT_COMMIT_HASH should be at least 7 characters long, got: {GIT_COMMIT_HASH}"
        );
    }
}
