use crate::api::{self, RunMode, ServerConfig};
use crate::cli::telemetry;
use anyhow::Result;
use secrecy::SecretString;
use tracing::info;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub mode: RunMode,
    pub jwt_secret: SecretString,
    pub frontend_base_url: Option<String>,
    pub admin_username: Option<String>,
    pub admin_password: Option<SecretString>,
    pub email_delivery: bool,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            port: args.port,
            mode: args.mode,
            jwt_secret: args.jwt_secret,
            frontend_base_url: args.frontend_base_url,
            admin_username: args.admin_username,
            admin_password: args.admin_password,
            email_delivery: args.email_delivery,
        }
    }
}

/// Execute the server action.
/// # Errors
/// Returns an error if the origin is invalid, the admin cannot be seeded or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    log_startup_args(&args);

    let result = api::serve(args.into()).await;
    telemetry::shutdown_tracer();
    result
}

fn log_startup_args(args: &Args) {
    let entries = [
        ("listen", format!("tcp:{}", args.port)),
        ("mode", args.mode.to_string()),
        (
            "frontend_base_url",
            args.frontend_base_url
                .clone()
                .unwrap_or_else(|| "none".to_string()),
        ),
        (
            "admin_username",
            args.admin_username
                .clone()
                .unwrap_or_else(|| "n/a".to_string()),
        ),
        ("admin_password_set", args.admin_password.is_some().to_string()),
        ("jwt_secret", "REDACTED".to_string()),
        ("email_delivery", args.email_delivery.to_string()),
    ];
    log_entries("Startup configuration", &entries);
}

fn log_entries(title: &str, entries: &[(&str, String)]) {
    let max_key_len = entries.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    let mut message = format!("{}\n\n{title}:", banner());
    for (key, value) in entries {
        let padding = " ".repeat(max_key_len.saturating_sub(key.len()));
        let _ =
            std::fmt::Write::write_fmt(&mut message, format_args!("\n  {key}:{padding} {value}"));
    }
    info!("{message}");
}

fn banner() -> String {
    let short_hash = short_commit(crate::GIT_COMMIT_HASH);
    BANNER.replace(
        "{VERSION}",
        &format!(" - {} - {}", env!("CARGO_PKG_VERSION"), short_hash),
    )
}

fn short_commit(hash: &str) -> String {
    let trimmed = hash.trim();
    trimmed.chars().take(7).collect()
}

const BANNER: &str = r"
   _______
  |  ___  |
  | |___| |   X I A O H E I P L A Y {VERSION}
  |_______|
    |___|";

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn short_commit_truncates() {
        assert_eq!(short_commit("0123456789abcdef"), "0123456");
        assert_eq!(short_commit(" abc "), "abc");
        assert_eq!(short_commit("unknown"), "unknown");
    }

    #[test]
    fn banner_carries_version() {
        assert!(banner().contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn args_become_server_config() {
        let config: ServerConfig = Args {
            port: 8081,
            mode: RunMode::Debug,
            jwt_secret: SecretString::from("s3cret"),
            frontend_base_url: None,
            admin_username: None,
            admin_password: None,
            email_delivery: true,
        }
        .into();
        assert_eq!(config.port, 8081);
        assert_eq!(config.mode, RunMode::Debug);
        assert_eq!(config.jwt_secret.expose_secret(), "s3cret");
        assert!(config.email_delivery);
    }
}
