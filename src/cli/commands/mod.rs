pub mod logging;

use clap::{
    Arg, ArgAction, ColorChoice, Command,
    builder::styling::{AnsiColor, Effects, Styles},
};

#[must_use]
pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    let long_version: &'static str = Box::leak(
        format!("{} - {}", env!("CARGO_PKG_VERSION"), crate::GIT_COMMIT_HASH).into_boxed_str(),
    );

    let command = Command::new("xiaoheiplay")
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .version(env!("CARGO_PKG_VERSION"))
        .long_version(long_version)
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .help("Port to listen on")
                .default_value("8080")
                .env("XIAOHEIPLAY_PORT")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .help("Run mode, debug also serves Swagger UI")
                .default_value("release")
                .env("XIAOHEIPLAY_MODE")
                .value_parser(["debug", "release"]),
        )
        .arg(
            Arg::new("jwt-secret")
                .long("jwt-secret")
                .help("Secret used to sign access and refresh tokens (HS256)")
                .env("JWT_SECRET")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new("frontend-base-url")
                .long("frontend-base-url")
                .help("Frontend origin allowed for credentialed CORS requests")
                .env("XIAOHEIPLAY_FRONTEND_BASE_URL"),
        )
        .arg(
            Arg::new("admin-username")
                .long("admin-username")
                .help("Bootstrap admin account seeded at startup")
                .env("XIAOHEIPLAY_ADMIN_USERNAME")
                .requires("admin-password"),
        )
        .arg(
            Arg::new("admin-password")
                .long("admin-password")
                .help("Password of the bootstrap admin account")
                .env("XIAOHEIPLAY_ADMIN_PASSWORD")
                .hide_env_values(true)
                .requires("admin-username"),
        )
        .arg(
            Arg::new("email-delivery")
                .long("email-delivery")
                .help("Log outbound email instead of reporting smtp disabled")
                .env("XIAOHEIPLAY_EMAIL_DELIVERY")
                .action(ArgAction::SetTrue),
        );

    logging::with_args(command)
}
