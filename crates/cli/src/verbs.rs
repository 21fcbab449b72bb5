use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use tapline_bridge::{serve_stdio, BackendMode, Bridge, BridgeOptions, ClusterPlatform};
use tapline_config::Config;
use tapline_core::{CancellationToken, PROGRAM};
use tapline_deploy::check::run_checks;
use tapline_deploy::{expose_service, stop_platform, Collaborators, Controller, HelmInstaller, PlatformService, RunOutcome, UninstallOutcome};
use tapline_kubehub::Cluster;
use tapline_ops::{Ingress, KubeBackend};
use tracing::{info, warn};

use crate::settings;

pub async fn start(cfg: &Config, root: &CancellationToken) -> Result<ExitCode> {
    let opts = settings::deploy_options(cfg)?;
    let cluster_opts = settings::cluster_options(cfg);
    let cluster = Cluster::connect(&cluster_opts).await?;
    let collab = Collaborators::for_cluster(&cluster, &opts.names, Arc::new(HelmInstaller::new(cluster_opts)));
    match Controller::new(opts, collab).run(root).await? {
        RunOutcome::DryRun { matched } => info!(matched, "dry run finished"),
        RunOutcome::Stopped => info!("stopped"),
    }
    Ok(ExitCode::SUCCESS)
}

pub async fn stop(cfg: &Config) -> Result<ExitCode> {
    let names = settings::names(cfg);
    let installer = HelmInstaller::new(settings::cluster_options(cfg));
    match stop_platform(&installer, &cfg.tap.release.name, &names).await? {
        UninstallOutcome::Removed => println!("{PROGRAM} removed from namespace {}", names.self_namespace),
        UninstallOutcome::NotInstalled => println!("{PROGRAM} is not installed in namespace {}", names.self_namespace),
    }
    Ok(ExitCode::SUCCESS)
}

/// Expose `which` and hold the session until interrupted.
pub async fn expose(cfg: &Config, which: PlatformService, open_browser: bool, root: &CancellationToken) -> Result<ExitCode> {
    let names = settings::names(cfg);
    let ingress_opts = settings::ingress_options(cfg);
    let cluster = Cluster::connect(&settings::cluster_options(cfg)).await?;
    let ingress = Ingress::new(Arc::new(KubeBackend::new(cluster.clone())), root).with_port_forward_host(ingress_opts.port_forward_host.clone());
    let session = expose_service(&ingress, &cluster, &names, &ingress_opts, which).await?;
    println!("{} is available at {} ({})", session.service, session.base_url, session.mode);
    if open_browser {
        if let Err(e) = webbrowser::open(&session.base_url) {
            warn!(error = %e, url = %session.base_url, "could not open a browser");
        }
    }
    root.cancelled().await;
    ingress.stop_all().await;
    Ok(ExitCode::SUCCESS)
}

pub async fn check(cfg: &Config) -> Result<ExitCode> {
    let report = run_checks(&settings::cluster_options(cfg), &settings::names(cfg), &settings::ingress_options(cfg)).await;
    print!("{report}");
    Ok(if report.passed() { ExitCode::SUCCESS } else { ExitCode::from(1) })
}

pub async fn stdio_bridge(cfg: &Config, root: &CancellationToken) -> Result<ExitCode> {
    let options = BridgeOptions { allow_destructive: cfg.bridge.allow_destructive, ..BridgeOptions::default() };
    let mode = match cfg.bridge.url.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
        Some(url) => BackendMode::Url(url.to_string()),
        None => {
            let deploy_cfg = cfg.with_overrides(&cfg.bridge.set).context("applying bridge.set overrides")?;
            let template = settings::deploy_options(&deploy_cfg)?;
            let cluster_opts = settings::cluster_options(cfg);
            let installer = Arc::new(HelmInstaller::new(cluster_opts.clone()));
            BackendMode::Cluster(Arc::new(ClusterPlatform::new(cluster_opts, template, installer, root)))
        }
    };
    let bridge = Bridge::new(options, mode)?;
    bridge.validate().await.context("tool endpoint did not return a catalog")?;
    tokio::select! {
        res = serve_stdio(&bridge) => res?,
        _ = root.cancelled() => info!("stdio bridge interrupted"),
    }
    Ok(ExitCode::SUCCESS)
}

pub fn config(cfg: &Config, regenerate: bool) -> Result<ExitCode> {
    if regenerate {
        let path = tapline_config::config_path()?;
        cfg.save(&path)?;
        eprintln!("config written to {}", path.display());
    }
    print!("{}", cfg.to_yaml()?);
    Ok(ExitCode::SUCCESS)
}
