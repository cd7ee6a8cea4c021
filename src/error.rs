//! Errors returned by collaborator services.
//!
//! The sentinel kinds map onto fixed HTTP statuses at the API boundary; every other failure
//! carries the collaborator's own message so it can be surfaced verbatim.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("forbidden")]
    Forbidden,
    #[error("conflict")]
    Conflict,
    #[error("insufficient balance")]
    InsufficientBalance,
    #[error("resize in progress")]
    ResizeInProgress,
    #[error("resize disabled")]
    ResizeDisabled,
    #[error("not found")]
    NotFound,
    #[error("real name required")]
    RealNameRequired,
    #[error("invalid input")]
    InvalidInput,
    #[error("not supported")]
    NotSupported,
    #[error("no payment required")]
    NoPaymentRequired,
    #[error("invalid credentials")]
    InvalidCredentials,
    /// Delivery failures from SMTP, SMS gateways or payment providers.
    #[error("{0}")]
    Transport(String),
    /// Any other domain rejection; surfaced as a client error with this message.
    #[error("{0}")]
    Rejected(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected(message.into())
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_message_is_verbatim() {
        assert_eq!(
            ServiceError::transport("smtp disabled").to_string(),
            "smtp disabled"
        );
        assert_eq!(
            ServiceError::rejected("phone mismatch").to_string(),
            "phone mismatch"
        );
    }

    #[test]
    fn sentinel_messages() {
        assert_eq!(ServiceError::Conflict.to_string(), "conflict");
        assert_eq!(
            ServiceError::InsufficientBalance.to_string(),
            "insufficient balance"
        );
    }
}
