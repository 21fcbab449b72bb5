//! Folding command-line flags into the config record and deriving the
//! option structs the library crates take.

use std::time::Duration;

use regex::Regex;
use tapline_config::Config;
use tapline_core::PlatformNames;
use tapline_deploy::installer::chart_reference;
use tapline_deploy::{readiness_deadline_from_env, DeployOptions, IngressOptions, ReleaseOptions};
use tapline_kubehub::ClusterOptions;

use crate::args::{Cli, SelfNamespace};

/// Overrides the port-forward bind host.
pub const PF_BIND_ENV: &str = "TAPLINE_PF_BIND";

/// Global flags win over the config file.
pub fn apply_global_flags(cfg: &mut Config, cli: &Cli) {
    if let Some(p) = &cli.kubeconfig {
        cfg.kube.config_path = Some(p.clone());
    }
    if let Some(c) = &cli.context {
        cfg.kube.context = Some(c.clone());
    }
    if let Some(h) = &cli.proxy_host {
        cfg.tap.proxy.host = h.clone();
    }
    if let Some(p) = cli.front_port {
        cfg.tap.proxy.front_port = p;
    }
    if let Some(p) = cli.hub_port {
        cfg.tap.proxy.hub_port = p;
    }
}

pub fn apply_self_namespace(cfg: &mut Config, ns: &SelfNamespace) {
    if let Some(s) = ns.self_namespace.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        cfg.tap.self_namespace = s.to_string();
    }
}

/// `start` flags. A non-empty `-n` list replaces the configured one.
pub fn apply_start_flags(cfg: &mut Config, regex: Option<&str>, namespaces: &[String], all: bool, dry_run: bool, headless: bool) {
    if let Some(re) = regex {
        cfg.tap.regex = re.to_string();
    }
    if !namespaces.is_empty() {
        cfg.tap.namespaces = namespaces.to_vec();
    }
    cfg.tap.all_namespaces |= all;
    cfg.tap.dry_run |= dry_run;
    cfg.tap.headless |= headless;
}

pub fn cluster_options(cfg: &Config) -> ClusterOptions {
    ClusterOptions { kubeconfig: cfg.kube.config_path.clone(), context: cfg.kube.context.clone() }
}

pub fn names(cfg: &Config) -> PlatformNames {
    PlatformNames::new(cfg.tap.self_namespace.clone())
}

pub fn ingress_options(cfg: &Config) -> IngressOptions {
    IngressOptions {
        host: cfg.tap.proxy.host.clone(),
        front_port: cfg.tap.proxy.front_port,
        hub_port: cfg.tap.proxy.hub_port,
        port_forward_host: std::env::var(PF_BIND_ENV).ok().filter(|h| !h.trim().is_empty()),
    }
}

pub fn deploy_options(cfg: &Config) -> Result<DeployOptions, regex::Error> {
    let mut opts = DeployOptions::new(Regex::new(&cfg.tap.regex)?);
    opts.namespaces = cfg.tap.namespaces.clone();
    opts.all_namespaces = cfg.tap.all_namespaces;
    opts.names = names(cfg);
    opts.release = ReleaseOptions { name: cfg.tap.release.name.clone(), chart: chart_reference(&cfg.tap.release.chart) };
    opts.ingress = ingress_options(cfg);
    opts.dry_run = cfg.tap.dry_run;
    opts.headless = cfg.tap.headless;
    opts.readiness_deadline = readiness_deadline_from_env(Duration::from_secs(cfg.timeouts.readiness_secs.max(1)));
    Ok(opts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn flags_override_file_values() {
        let mut cfg = Config::default().with_overrides(&["tap.proxy.front_port=7000".into(), "kube.context=file".into()]).expect("set");
        let cli = Cli::parse_from(["tapline", "--front-port", "9000", "--context", "flag", "check"]);
        apply_global_flags(&mut cfg, &cli);
        assert_eq!(cfg.tap.proxy.front_port, 9000);
        assert_eq!(cluster_options(&cfg).context.as_deref(), Some("flag"));
    }

    #[test]
    fn start_flags_shape_deploy_options() {
        let mut cfg = Config::default();
        cfg.tap.namespaces = vec!["from-file".into()];
        apply_start_flags(&mut cfg, Some("^api"), &["shop".into()], false, true, true);
        apply_self_namespace(&mut cfg, &SelfNamespace { self_namespace: Some(" obs ".into()) });
        let opts = deploy_options(&cfg).expect("options");
        assert_eq!(opts.regex.as_str(), "^api");
        assert_eq!(opts.namespaces, vec!["shop"]);
        assert!(opts.dry_run && opts.headless);
        assert_eq!(opts.names.self_namespace, "obs");
        assert_eq!(opts.ingress.front_port, 8899);
    }

    #[test]
    fn empty_namespace_flag_keeps_config() {
        let mut cfg = Config::default();
        cfg.tap.namespaces = vec!["from-file".into()];
        apply_start_flags(&mut cfg, None, &[], false, false, false);
        assert_eq!(cfg.tap.namespaces, vec!["from-file"]);
        assert_eq!(cfg.tap.regex, ".*");
    }

    #[test]
    fn bad_regex_is_rejected() {
        let mut cfg = Config::default();
        cfg.tap.regex = "(".into();
        assert!(deploy_options(&cfg).is_err());
    }
}
