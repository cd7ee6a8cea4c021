//! Admin path validation and matching for admin login.

pub const DEFAULT_ADMIN_PATH: &str = "admin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AdminPathError {
    #[error("admin path required")]
    Empty,
    #[error("admin path must not contain whitespace")]
    Whitespace,
    #[error("admin path must not contain slashes")]
    Slash,
    #[error("admin path must be ascii")]
    NonAscii,
}

/// Accepts a single ASCII segment without whitespace or path separators.
///
/// # Errors
/// Returns the first rule the value violates.
pub fn validate_admin_path(value: &str) -> Result<(), AdminPathError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(AdminPathError::Empty);
    }
    if !value.is_ascii() {
        return Err(AdminPathError::NonAscii);
    }
    if value.chars().any(char::is_whitespace) {
        return Err(AdminPathError::Whitespace);
    }
    if value.contains('/') || value.contains('\\') {
        return Err(AdminPathError::Slash);
    }
    Ok(())
}

/// Configured admin path, falling back to the default when the stored value is unusable.
#[must_use]
pub fn effective_admin_path(configured: Option<&str>) -> String {
    match configured.map(str::trim) {
        Some(value) if validate_admin_path(value).is_ok() => value.to_string(),
        _ => DEFAULT_ADMIN_PATH.to_string(),
    }
}

/// An absent or blank `requested` path stands for the default path; either way it must equal
/// `configured` exactly.
#[must_use]
pub fn admin_path_matches(requested: Option<&str>, configured: &str) -> bool {
    match requested.map(str::trim) {
        None | Some("") => configured == DEFAULT_ADMIN_PATH,
        Some(value) => validate_admin_path(value).is_ok() && value == configured,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_admin_path() {
        assert!(validate_admin_path("admin").is_ok());
        assert!(validate_admin_path("ops-2024").is_ok());
        assert_eq!(validate_admin_path(" "), Err(AdminPathError::Empty));
        assert_eq!(validate_admin_path("a b"), Err(AdminPathError::Whitespace));
        assert_eq!(validate_admin_path("a/b"), Err(AdminPathError::Slash));
        assert_eq!(validate_admin_path("a\\b"), Err(AdminPathError::Slash));
        assert_eq!(validate_admin_path("管理"), Err(AdminPathError::NonAscii));
    }

    #[test]
    fn effective_path_falls_back() {
        assert_eq!(effective_admin_path(None), "admin");
        assert_eq!(effective_admin_path(Some("bad path")), "admin");
        assert_eq!(effective_admin_path(Some(" backstage ")), "backstage");
    }

    #[test]
    fn matches_requested_path() {
        assert!(admin_path_matches(None, "admin"));
        assert!(admin_path_matches(Some(""), "admin"));
        assert!(!admin_path_matches(None, "backstage"));
        assert!(admin_path_matches(Some(" backstage "), "backstage"));
        assert!(!admin_path_matches(Some("/backstage/"), "backstage"));
        assert!(!admin_path_matches(Some("admin"), "backstage"));
        assert!(!admin_path_matches(Some("back stage"), "back stage"));
    }
}
