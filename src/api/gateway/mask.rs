//! Contact masking for user projections and reset options.

/// `13900010001` becomes `13*****01`; short values pass through.
#[must_use]
pub fn mask_phone(phone: &str) -> String {
    let phone = phone.trim();
    if phone.len() < 7 || !phone.is_ascii() {
        return phone.to_string();
    }
    format!("{}*****{}", &phone[..2], &phone[phone.len() - 2..])
}

/// `alice@example.com` becomes `a*****e@example.com`.
#[must_use]
pub fn mask_email(email: &str) -> String {
    let email = email.trim();
    match email.find('@') {
        Some(at) if at > 1 && email.is_char_boundary(at - 1) && email.is_char_boundary(1) => {
            format!("{}*****{}", &email[..1], &email[at - 1..])
        }
        _ => email.to_string(),
    }
}

/// At least six characters drawn from digits, `+`, `-` and space.
#[must_use]
pub fn looks_like_phone(value: &str) -> bool {
    let value = value.trim();
    value.len() >= 6
        && value
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | ' '))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_phone() {
        assert_eq!(mask_phone("13900010001"), "13*****01");
        assert_eq!(mask_phone("12345"), "12345");
    }

    #[test]
    fn masks_email() {
        assert_eq!(mask_email("alice@example.com"), "a*****e@example.com");
        assert_eq!(mask_email("a@example.com"), "a@example.com");
        assert_eq!(mask_email("not-an-email"), "not-an-email");
    }

    #[test]
    fn phone_detection() {
        assert!(looks_like_phone("13900010001"));
        assert!(looks_like_phone("+86 139-0001"));
        assert!(!looks_like_phone("12345"));
        assert!(!looks_like_phone("overall-reset"));
    }
}
