//! HTTP surface: shared handler dependencies, router assembly and the server loop.
//!
//! Documented routes are registered in `openapi.rs`; provider notify callbacks accept any method
//! and body, so they are mounted here outside the `OpenAPI` document together with the
//! preflight-only `OPTIONS /health`.

use crate::{
    api::handlers::{health, orders::notify},
    domain::{Channel, UserRole},
    events::MemoryBroker,
    guards::SecurityGuards,
    services::{
        AdminService, AuthService, DisabledSender, EventBroker, GeoResolver, LogSender,
        MessageSender, OrderService, PaymentService, PermissionService, SettingsService,
        TicketStore, VpsService, WalletOrderService,
    },
    store::memory::MemoryStore,
    token::TokenSigner,
};
use anyhow::{Context, Result, anyhow};
use axum::{
    Extension, Router,
    body::Body,
    extract::MatchedPath,
    http::{
        HeaderName, HeaderValue, Method, Request,
        header::{AUTHORIZATION, CONTENT_TYPE},
    },
    routing::{any, options},
};
use secrecy::{ExposeSecret, SecretString};
use std::{fmt, net::SocketAddr, str::FromStr, sync::Arc};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer,
    trace::TraceLayer,
};
use tracing::{Span, error, info, info_span};
use ulid::Ulid;
use url::Url;
use utoipa_axum::router::OpenApiRouter;
use utoipa_swagger_ui::SwaggerUi;

pub mod error;
pub mod gateway;
pub(crate) mod handlers;
// OpenAPI router wiring and route registration live in openapi.rs.
mod openapi;
#[cfg(test)]
mod tests;

pub use error::{ApiError, ApiResult, ErrorBody};
pub use openapi::openapi;

/// Build the API router with all documented routes registered.
#[must_use]
pub fn router() -> OpenApiRouter {
    openapi::api_router()
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RunMode {
    Debug,
    #[default]
    Release,
}

impl RunMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Release => "release",
        }
    }

    #[must_use]
    pub const fn is_debug(self) -> bool {
        matches!(self, Self::Debug)
    }
}

impl FromStr for RunMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "release" => Ok(Self::Release),
            other => Err(anyhow!("unknown mode: {other}")),
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Collaborators and process-local state shared by every handler.
#[derive(Clone)]
pub struct HandlerDeps {
    pub auth: Arc<dyn AuthService>,
    pub admin: Arc<dyn AdminService>,
    pub settings: Arc<dyn SettingsService>,
    pub permissions: Arc<dyn PermissionService>,
    pub orders: Arc<dyn OrderService>,
    pub payments: Arc<dyn PaymentService>,
    pub wallet: Arc<dyn WalletOrderService>,
    pub vps: Arc<dyn VpsService>,
    pub tickets: Arc<dyn TicketStore>,
    pub geo: Arc<dyn GeoResolver>,
    pub events: Arc<dyn EventBroker>,
    pub email: Arc<dyn MessageSender>,
    pub sms: Arc<dyn MessageSender>,
    pub tokens: Arc<TokenSigner>,
    pub guards: Arc<SecurityGuards>,
    pub mode: RunMode,
}

impl HandlerDeps {
    /// Wire every collaborator to one in-memory store.
    #[must_use]
    pub fn in_memory(
        store: Arc<MemoryStore>,
        tokens: TokenSigner,
        email: Arc<dyn MessageSender>,
        sms: Arc<dyn MessageSender>,
        mode: RunMode,
    ) -> Self {
        Self {
            auth: store.clone(),
            admin: store.clone(),
            settings: store.clone(),
            permissions: store.clone(),
            orders: store.clone(),
            payments: store.clone(),
            wallet: store.clone(),
            vps: store.clone(),
            tickets: store.clone(),
            geo: store.clone(),
            events: store.broker(),
            email,
            sms,
            tokens: Arc::new(tokens),
            guards: Arc::new(SecurityGuards::new()),
            mode,
        }
    }

    #[must_use]
    pub fn sender(&self, channel: Channel) -> &dyn MessageSender {
        match channel {
            Channel::Email => self.email.as_ref(),
            Channel::Sms => self.sms.as_ref(),
        }
    }
}

impl fmt::Debug for HandlerDeps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerDeps")
            .field("tokens", &self.tokens)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

/// Process-wide configuration assembled by the CLI.
#[derive(Debug)]
pub struct ServerConfig {
    pub port: u16,
    pub mode: RunMode,
    pub jwt_secret: SecretString,
    pub frontend_base_url: Option<String>,
    pub admin_username: Option<String>,
    pub admin_password: Option<SecretString>,
    /// Log outbound email instead of reporting `smtp disabled`.
    pub email_delivery: bool,
}

/// Assemble the application: documented routes, notify callbacks, layers and dependencies.
#[must_use]
pub fn app(deps: Arc<HandlerDeps>, frontend_origin: Option<HeaderValue>) -> Router {
    let (router, openapi) = router().split_for_parts();
    let mut app = router
        .route("/health", options(health::health))
        .route(
            "/api/v1/payments/notify/{provider}",
            any(notify::payment_notify),
        )
        .route(
            "/api/v1/wallet/payments/notify/{provider}",
            any(notify::wallet_notify),
        );

    if deps.mode.is_debug() {
        app = app.merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", openapi));
    }

    let cors = frontend_origin.map_or_else(CorsLayer::new, |origin| {
        CorsLayer::new()
            .allow_headers([
                CONTENT_TYPE,
                AUTHORIZATION,
                HeaderName::from_static(gateway::IDEMPOTENCY_KEY),
                HeaderName::from_static("last-event-id"),
            ])
            .allow_methods([
                Method::GET,
                Method::POST,
                Method::PATCH,
                Method::DELETE,
            ])
            .allow_origin(AllowOrigin::exact(origin))
            .allow_credentials(true)
    });

    app.layer(
        ServiceBuilder::new()
            .layer(SetRequestHeaderLayer::if_not_present(
                HeaderName::from_static("x-request-id"),
                |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
            ))
            .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                "x-request-id",
            )))
            .layer(TraceLayer::new_for_http().make_span_with(make_span))
            .layer(cors)
            .layer(Extension(deps)),
    )
}

/// Start the server
/// # Errors
/// Return error if failed to seed the admin account, bind the port or serve
pub async fn serve(config: ServerConfig) -> Result<()> {
    let store = Arc::new(MemoryStore::new(Arc::new(MemoryBroker::new())));

    if let (Some(username), Some(password)) = (&config.admin_username, &config.admin_password) {
        store
            .seed_user(username, password.expose_secret(), UserRole::Admin)
            .await
            .map_err(|err| anyhow!("Failed to seed admin account: {err}"))?;
        info!("Seeded admin account: {username}");
    }

    let email: Arc<dyn MessageSender> = if config.email_delivery {
        Arc::new(LogSender::new(Channel::Email))
    } else {
        Arc::new(DisabledSender::new("smtp"))
    };
    let deps = Arc::new(HandlerDeps::in_memory(
        store,
        TokenSigner::new(config.jwt_secret),
        email,
        Arc::new(LogSender::new(Channel::Sms)),
        config.mode,
    ));

    let origin = config
        .frontend_base_url
        .as_deref()
        .map(frontend_origin)
        .transpose()?;
    let app = app(deps, origin);

    let port = config.port;
    let listener = TcpListener::bind(format!("::0:{port}"))
        .await
        .with_context(|| format!("Failed to bind port {port}"))?;

    info!("Listening on [::]:{}, mode: {}", port, config.mode);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {err}");
        }
        info!("Gracefully shutdown");
    })
    .await?;

    Ok(())
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}

fn frontend_origin(frontend_base_url: &str) -> Result<HeaderValue> {
    let parsed = Url::parse(frontend_base_url)
        .with_context(|| format!("Invalid frontend base URL: {frontend_base_url}"))?;
    let host = parsed.host_str().ok_or_else(|| {
        anyhow!("Frontend base URL must include a valid host: {frontend_base_url}")
    })?;
    let port = parsed
        .port()
        .map_or_else(String::new, |port| format!(":{port}"));
    let origin = format!("{}://{}{}", parsed.scheme(), host, port);
    HeaderValue::from_str(&origin).context("Failed to build frontend origin header")
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    #[test]
    fn run_mode_parsing() -> Result<()> {
        assert_eq!("debug".parse::<RunMode>()?, RunMode::Debug);
        assert_eq!(" RELEASE ".parse::<RunMode>()?, RunMode::Release);
        assert!("test".parse::<RunMode>().is_err());
        assert_eq!(RunMode::default(), RunMode::Release);
        Ok(())
    }

    #[test]
    fn frontend_origin_strips_path() -> Result<()> {
        let origin = frontend_origin("https://console.example.com:8443/app/?x=1")?;
        assert_eq!(origin, "https://console.example.com:8443");
        assert!(frontend_origin("not a url").is_err());
        Ok(())
    }
}
