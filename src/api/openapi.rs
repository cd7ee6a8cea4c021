use super::handlers::{admin, auth, health, orders, robot};
use utoipa::openapi::{
    Components, Contact, InfoBuilder, License, OpenApiBuilder, Tag,
    security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
};
use utoipa_axum::{router::OpenApiRouter, routes};

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    // Reuse the same router wiring and only return the generated OpenAPI spec.
    let (_router, openapi) = api_router().split_for_parts();
    openapi
}

/// Build the router that also drives the `OpenAPI` document.
///
/// Add new endpoints here via `.routes(routes!(...))` so they are both served
/// and included in the generated `OpenAPI` spec.
/// Handlers sharing a path are grouped in one `routes!` call.
pub(crate) fn api_router() -> OpenApiRouter {
    let mut router = OpenApiRouter::with_openapi(cargo_openapi())
        .routes(routes!(health::health))
        // auth
        .routes(routes!(auth::captcha::captcha))
        .routes(routes!(auth::register::register))
        .routes(routes!(auth::register::register_code))
        .routes(routes!(auth::login::login))
        .routes(routes!(auth::login::refresh))
        .routes(routes!(auth::login::logout))
        .routes(routes!(auth::login::auth_settings))
        .routes(routes!(auth::password_reset::options))
        .routes(routes!(auth::password_reset::send_code))
        .routes(routes!(auth::password_reset::verify_code))
        .routes(routes!(auth::password_reset::confirm))
        // security
        .routes(routes!(auth::security::me))
        .routes(routes!(auth::security::contacts))
        .routes(routes!(auth::security::two_fa_status))
        .routes(routes!(auth::security::two_fa_setup))
        .routes(routes!(auth::security::two_fa_confirm))
        .routes(routes!(auth::security::verify_2fa))
        .routes(routes!(auth::security::contact_send_code))
        .routes(routes!(auth::security::contact_confirm))
        // orders
        .routes(routes!(orders::create, orders::list))
        .routes(routes!(orders::create_items))
        .routes(routes!(orders::detail))
        .routes(routes!(orders::cancel))
        .routes(routes!(orders::submit_payment))
        .routes(routes!(orders::pay))
        .routes(routes!(orders::events))
        .routes(routes!(orders::payment_methods))
        .routes(routes!(orders::vps::renew))
        .routes(routes!(orders::vps::resize_quote))
        .routes(routes!(orders::vps::resize))
        .routes(routes!(orders::vps::refund))
        .routes(routes!(orders::vps::emergency_renew))
        .routes(routes!(orders::vps::coupon_preview))
        // wallet
        .routes(routes!(orders::wallet::wallet))
        .routes(routes!(orders::wallet::orders))
        .routes(routes!(orders::wallet::recharge))
        .routes(routes!(orders::wallet::withdraw))
        // admin
        .routes(routes!(admin::auth::login))
        .routes(routes!(admin::auth::refresh))
        .routes(routes!(admin::auth::two_fa_setup))
        .routes(routes!(admin::auth::two_fa_confirm))
        .routes(routes!(admin::auth::two_fa_unlock))
        .routes(routes!(admin::users::impersonate))
        .routes(routes!(admin::users::permission_tree))
        .routes(routes!(admin::users::permission_list))
        .routes(routes!(admin::settings::list, admin::settings::update))
        .routes(routes!(admin::orders::list))
        .routes(routes!(admin::orders::detail, admin::orders::delete))
        .routes(routes!(admin::orders::approve))
        .routes(routes!(admin::orders::reject))
        .routes(routes!(admin::orders::mark_paid))
        .routes(routes!(admin::orders::retry))
        .routes(routes!(admin::orders::wallet_orders))
        .routes(routes!(admin::orders::wallet_approve))
        .routes(routes!(admin::orders::wallet_reject))
        // integrations
        .routes(routes!(robot::webhook));

    let openapi = router.get_openapi_mut();
    openapi.tags = Some(vec![
        tag("health", "Liveness probe"),
        tag("auth", "Registration, login, tokens and password reset"),
        tag("security", "Profile, 2FA and contact binding"),
        tag("orders", "Orders, payments and VPS lifecycle"),
        tag("wallet", "Wallet balance, recharge and withdraw"),
        tag("admin", "Back-office review, settings and permissions"),
        tag("integrations", "Signed inbound webhooks"),
    ]);
    openapi
        .components
        .get_or_insert_with(Components::new)
        .add_security_scheme(
            "bearer",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );

    router
}

fn tag(name: &str, description: &str) -> Tag {
    let mut tag = Tag::new(name);
    tag.description = Some(description.to_string());
    tag
}

fn cargo_openapi() -> utoipa::openapi::OpenApi {
    // Use Cargo.toml metadata instead of the utoipa-axum crate info defaults.
    let mut info = InfoBuilder::new()
        .title(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .description(optional_str(env!("CARGO_PKG_DESCRIPTION")))
        .build();

    info.contact = cargo_contact();
    info.license = cargo_license();

    OpenApiBuilder::new().info(info).build()
}

fn cargo_contact() -> Option<Contact> {
    // Cargo authors are `;` separated and may include "Name <email>".
    let authors = env!("CARGO_PKG_AUTHORS");
    let primary = authors.split(';').next().map(str::trim)?;
    if primary.is_empty() {
        return None;
    }

    let (name, email) = parse_author(primary);
    if name.is_none() && email.is_none() {
        return None;
    }

    let mut contact = Contact::new();
    contact.name = name.map(str::to_string);
    contact.email = email.map(str::to_string);
    Some(contact)
}

fn cargo_license() -> Option<License> {
    let identifier = optional_str(env!("CARGO_PKG_LICENSE"))?;
    let mut license = License::new(identifier);
    license.identifier = Some(identifier.to_string());
    Some(license)
}

fn optional_str(value: &'static str) -> Option<&'static str> {
    Some(value.trim()).filter(|trimmed| !trimmed.is_empty())
}

fn parse_author<'a>(author: &'a str) -> (Option<&'a str>, Option<&'a str>) {
    let non_empty = |value: &'a str| -> Option<&'a str> { Some(value.trim()).filter(|value| !value.is_empty()) };
    match author.find('<') {
        Some(start) => (
            non_empty(&author[..start]),
            non_empty(author[start + 1..].trim_end_matches('>')),
        ),
        None => (non_empty(author), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openapi_info_from_cargo() {
        let spec = openapi();
        assert_eq!(spec.info.title, env!("CARGO_PKG_NAME"));
        assert_eq!(spec.info.version, env!("CARGO_PKG_VERSION"));

        let contact = spec.info.contact;
        assert!(contact.is_some());
        if let Some(contact) = contact {
            assert_eq!(contact.name.as_deref(), Some("Team Xiaoheiplay"));
            assert_eq!(contact.email.as_deref(), Some("team@xiaoheiplay.dev"));
        }

        let license = spec.info.license;
        assert!(license.is_some());
        if let Some(license) = license {
            assert_eq!(license.name, "BSD-3-Clause");
            assert_eq!(license.identifier.as_deref(), Some("BSD-3-Clause"));
        }
    }

    #[test]
    fn openapi_tags_and_paths() {
        let spec = openapi();
        let tags = spec.tags.clone().unwrap_or_default();
        for name in ["auth", "security", "orders", "wallet", "admin", "integrations"] {
            assert!(tags.iter().any(|tag| tag.name == name), "missing tag {name}");
        }
        let paths = &spec.paths.paths;
        assert!(paths.contains_key("/api/v1/auth/login"));
        assert!(paths.contains_key("/admin/api/v1/orders/{id}/mark-paid"));
        assert!(!paths.contains_key("/api/v1/payments/notify/{provider}"));
    }

    #[test]
    fn bearer_scheme_is_registered() {
        let spec = openapi();
        let schemes = spec
            .components
            .map(|components| components.security_schemes)
            .unwrap_or_default();
        assert!(schemes.contains_key("bearer"));
    }

    #[test]
    fn author_parsing() {
        assert_eq!(
            parse_author("Team X <team@x.dev>"),
            (Some("Team X"), Some("team@x.dev"))
        );
        assert_eq!(parse_author("Solo"), (Some("Solo"), None));
        assert_eq!(parse_author("<only@mail>"), (None, Some("only@mail")));
    }
}
