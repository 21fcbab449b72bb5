use std::process::ExitCode;
use std::str::FromStr;

use anyhow::Result;
use clap::Parser;
use tapline_config::{Config, ConfigError};
use tapline_core::{CancellationToken, PROGRAM};
use tapline_deploy::PlatformService;
use tokio::signal;
use tracing::{debug, info};

mod args;
mod settings;
mod verbs;

use args::{Cli, Command, ServiceArg};

/// Logs go to stderr; stdout carries command output and the bridge protocol.
fn init_tracing(quiet: bool) {
    let default = if quiet { "warn" } else { "info" };
    let env = std::env::var("TAPLINE_LOG").unwrap_or_else(|_| default.to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("TAPLINE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid TAPLINE_METRICS_ADDR; expected host:port");
        }
    }
}

/// Config file plus `--set` plus flags, in that order.
fn effective_config(cli: &Cli) -> Result<Config> {
    let path = tapline_config::config_path()?;
    let mut cfg = Config::load_with_overrides(&path, &cli.set)?;
    settings::apply_global_flags(&mut cfg, cli);
    match &cli.command {
        Command::Start { regex, namespaces, all_namespaces, ns, dry_run, headless } => {
            settings::apply_self_namespace(&mut cfg, ns);
            settings::apply_start_flags(&mut cfg, regex.as_deref(), namespaces, *all_namespaces, *dry_run, *headless);
        }
        Command::StdioBridge { url, allow_destructive, ns } => {
            settings::apply_self_namespace(&mut cfg, ns);
            if let Some(u) = url {
                cfg.bridge.url = Some(u.clone());
            }
            cfg.bridge.allow_destructive |= *allow_destructive;
        }
        Command::Stop { ns } | Command::Expose { ns, .. } | Command::Open { ns } | Command::Check { ns } => {
            settings::apply_self_namespace(&mut cfg, ns);
        }
        Command::Config { .. } | Command::Version => {}
    }
    debug!(path = %path.display(), "effective config assembled");
    Ok(cfg)
}

async fn run(cli: Cli, root: &CancellationToken) -> Result<ExitCode> {
    let cfg = effective_config(&cli)?;
    match cli.command {
        Command::Start { .. } => verbs::start(&cfg, root).await,
        Command::Stop { .. } => verbs::stop(&cfg).await,
        Command::Expose { service, .. } => {
            let which = match service {
                ServiceArg::Front => PlatformService::Front,
                ServiceArg::Hub => PlatformService::Hub,
            };
            verbs::expose(&cfg, which, false, root).await
        }
        Command::Open { .. } => verbs::expose(&cfg, PlatformService::Front, !cfg.tap.headless, root).await,
        Command::Check { .. } => verbs::check(&cfg).await,
        Command::StdioBridge { .. } => verbs::stdio_bridge(&cfg, root).await,
        Command::Config { regenerate } => verbs::config(&cfg, regenerate),
        Command::Version => {
            println!("{PROGRAM} {}", env!("CARGO_PKG_VERSION"));
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// One line per failure, a hint when the error carries one.
fn report(err: &anyhow::Error) -> ExitCode {
    if let Some(e) = err.downcast_ref::<tapline_core::Error>() {
        eprintln!("{}", e.render_line());
        if let Some(hint) = e.remediation() {
            eprintln!("hint: {hint}");
        }
        return ExitCode::from(1);
    }
    if err.downcast_ref::<ConfigError>().is_some() || err.downcast_ref::<regex::Error>().is_some() {
        eprintln!("error[config]: {err:#}");
        return ExitCode::from(2);
    }
    eprintln!("error: {err:#}");
    ExitCode::from(1)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.command.quiet_logs());
    init_metrics();

    let root = CancellationToken::new();
    tokio::spawn({
        let root = root.clone();
        async move {
            if signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received; shutting down");
                root.cancel();
            }
        }
    });

    match run(cli, &root).await {
        Ok(code) => code,
        Err(e) if matches!(e.downcast_ref::<tapline_core::Error>(), Some(tapline_core::Error::Cancelled)) => ExitCode::SUCCESS,
        Err(e) => report(&e),
    }
}
