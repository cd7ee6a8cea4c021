use crate::api::RunMode;
use crate::cli::actions::{Action, server::Args};
use anyhow::{Context, Result};
use secrecy::SecretString;

/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>("port").copied().unwrap_or(8080);
    let mode = matches
        .get_one::<String>("mode")
        .map_or(Ok(RunMode::default()), |mode| mode.parse::<RunMode>())
        .context("invalid --mode")?;

    let jwt_secret = matches
        .get_one::<String>("jwt-secret")
        .cloned()
        .filter(|secret| !secret.trim().is_empty())
        .context("missing required argument: --jwt-secret")?;

    let frontend_base_url = matches
        .get_one::<String>("frontend-base-url")
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty());
    let admin_username = matches.get_one::<String>("admin-username").cloned();
    let admin_password = matches
        .get_one::<String>("admin-password")
        .cloned()
        .map(SecretString::from);

    Ok(Action::Server(Args {
        port,
        mode,
        jwt_secret: SecretString::from(jwt_secret),
        frontend_base_url,
        admin_username,
        admin_password,
        email_delivery: matches.get_flag("email-delivery"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::commands;
    use secrecy::ExposeSecret;

    #[test]
    fn builds_server_action() -> Result<()> {
        let matches = commands::new().try_get_matches_from(vec![
            "xiaoheiplay",
            "--port",
            "9000",
            "--mode",
            "debug",
            "--jwt-secret",
            "s3cret",
            "--frontend-base-url",
            " https://shop.example.com ",
            "--admin-username",
            "root",
            "--admin-password",
            "hunter22",
        ])?;

        let Action::Server(args) = handler(&matches)?;
        assert_eq!(args.port, 9000);
        assert_eq!(args.mode, RunMode::Debug);
        assert_eq!(args.jwt_secret.expose_secret(), "s3cret");
        assert_eq!(
            args.frontend_base_url.as_deref(),
            Some("https://shop.example.com")
        );
        assert_eq!(args.admin_username.as_deref(), Some("root"));
        assert_eq!(
            args.admin_password
                .as_ref()
                .map(|password| password.expose_secret().to_string()),
            Some("hunter22".to_string())
        );
        Ok(())
    }

    #[test]
    fn blank_jwt_secret_is_rejected() -> Result<()> {
        let matches =
            commands::new().try_get_matches_from(vec!["xiaoheiplay", "--jwt-secret", "  "])?;
        assert!(handler(&matches).is_err());
        Ok(())
    }
}
