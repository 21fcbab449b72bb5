//! Credential discovery and proxy detection.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use kube::config::Kubeconfig;
use tapline_core::Error;
use tracing::debug;

/// How the operator selected their cluster credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterOptions {
    /// Explicit kubeconfig path (`--kubeconfig`); wins over everything else.
    pub kubeconfig: Option<PathBuf>,
    /// Context name (`--context`); defaults to the file's current context.
    pub context: Option<String>,
}

/// Ordered kubeconfig files to read: explicit path, else the `KUBECONFIG`
/// path list, else `~/.kube/config`.
pub fn kubeconfig_paths(explicit: Option<&Path>, env: Option<&OsStr>, home: Option<&Path>) -> Vec<PathBuf> {
    if let Some(p) = explicit {
        return vec![p.to_path_buf()];
    }
    if let Some(v) = env {
        let list: Vec<PathBuf> = std::env::split_paths(v).filter(|p| !p.as_os_str().is_empty()).collect();
        if !list.is_empty() {
            return list;
        }
    }
    home.map(|h| vec![h.join(".kube").join("config")]).unwrap_or_default()
}

/// Paths for the current process environment.
pub fn default_kubeconfig_paths(explicit: Option<&Path>) -> Vec<PathBuf> {
    let env = std::env::var_os("KUBECONFIG");
    let home = dirs::home_dir();
    kubeconfig_paths(explicit, env.as_deref(), home.as_deref())
}

/// Read and merge every existing file in `paths`; earlier files win on
/// conflicting names. No usable file is `AuthMissing`.
pub fn load_kubeconfig(paths: &[PathBuf]) -> Result<Kubeconfig, Error> {
    let mut merged: Option<Kubeconfig> = None;
    for p in paths {
        if !p.exists() {
            debug!(path = %p.display(), "kubeconfig candidate missing");
            continue;
        }
        let kc = Kubeconfig::read_from(p).map_err(|e| Error::AuthMissing(format!("{}: {}", p.display(), e)))?;
        merged = Some(match merged {
            None => kc,
            Some(acc) => acc.merge(kc).map_err(|e| Error::AuthMissing(format!("{}: {}", p.display(), e)))?,
        });
    }
    let looked = paths.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(", ");
    match merged {
        Some(kc) if !kc.clusters.is_empty() => Ok(kc),
        Some(_) => Err(Error::AuthMissing(format!("kubeconfig has no clusters (read {looked})"))),
        None => Err(Error::AuthMissing(format!("no kubeconfig found (looked in {looked})"))),
    }
}

/// What the selected cluster entry says about proxies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyVerdict {
    /// Plain `https://host:port` server.
    Direct,
    /// The cluster entry sets `proxy-url`.
    ExplicitProxy { server: String },
    /// The server URL carries a path, which is how local API proxies
    /// (Lens, Rancher) rewrite kubeconfigs. Needs a probe to confirm.
    PathPrefixed { server: String },
}

pub fn proxy_verdict(kc: &Kubeconfig, context: Option<&str>) -> Result<ProxyVerdict, Error> {
    let ctx_name = context
        .map(str::to_string)
        .or_else(|| kc.current_context.clone())
        .ok_or_else(|| Error::AuthMissing("kubeconfig has no current context".into()))?;
    let ctx = kc
        .contexts
        .iter()
        .find(|c| c.name == ctx_name)
        .and_then(|c| c.context.as_ref())
        .ok_or_else(|| Error::AuthMissing(format!("context {ctx_name} not found in kubeconfig")))?;
    let cluster = kc
        .clusters
        .iter()
        .find(|c| c.name == ctx.cluster)
        .and_then(|c| c.cluster.as_ref())
        .ok_or_else(|| Error::AuthMissing(format!("cluster {} not found in kubeconfig", ctx.cluster)))?;
    let server = cluster.server.clone().unwrap_or_default();
    if cluster.proxy_url.as_deref().is_some_and(|p| !p.is_empty()) {
        return Ok(ProxyVerdict::ExplicitProxy { server });
    }
    if has_path(&server) {
        return Ok(ProxyVerdict::PathPrefixed { server });
    }
    Ok(ProxyVerdict::Direct)
}

fn has_path(server: &str) -> bool {
    match server.parse::<http::Uri>() {
        Ok(uri) => !matches!(uri.path(), "" | "/"),
        Err(_) => false,
    }
}

/// `scheme://authority/` of `uri`, dropping any path prefix.
pub fn host_only(uri: &http::Uri) -> Option<http::Uri> {
    let scheme = uri.scheme()?.clone();
    let authority = uri.authority()?.clone();
    http::Uri::builder().scheme(scheme).authority(authority).path_and_query("/").build().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
current-context: dev
clusters:
- name: dev
  cluster:
    server: https://10.0.0.1:6443
- name: lens
  cluster:
    server: http://127.0.0.1:34567/api-proxy/dev
- name: corp
  cluster:
    server: https://k8s.corp:6443
    proxy-url: http://proxy.corp:3128
contexts:
- name: dev
  context: { cluster: dev, user: me, namespace: shop }
- name: lens
  context: { cluster: lens, user: me }
- name: corp
  context: { cluster: corp, user: me }
users:
- name: me
  user: { token: abc }
"#;

    fn write_config(dir: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
        let p = dir.path().join(name);
        std::fs::write(&p, body).expect("write kubeconfig");
        p
    }

    #[test]
    fn explicit_path_wins_over_env_and_home() {
        let paths = kubeconfig_paths(Some(Path::new("/x/cfg")), Some(OsStr::new("/a:/b")), Some(Path::new("/home/u")));
        assert_eq!(paths, vec![PathBuf::from("/x/cfg")]);
    }

    #[test]
    fn env_path_list_is_split_in_order() {
        let paths = kubeconfig_paths(None, Some(OsStr::new("/a:/b")), Some(Path::new("/home/u")));
        assert_eq!(paths, vec![PathBuf::from("/a"), PathBuf::from("/b")]);
    }

    #[test]
    fn home_default_when_nothing_else() {
        let paths = kubeconfig_paths(None, Some(OsStr::new("")), Some(Path::new("/home/u")));
        assert_eq!(paths, vec![PathBuf::from("/home/u/.kube/config")]);
    }

    #[test]
    fn missing_files_are_auth_missing() {
        let err = load_kubeconfig(&[PathBuf::from("/definitely/not/here")]).expect_err("no config");
        assert!(matches!(err, Error::AuthMissing(_)));
        assert!(err.remediation().is_some());
    }

    #[test]
    fn verdicts_for_each_context() {
        let dir = tempfile::tempdir().expect("tempdir");
        let p = write_config(&dir, "config", KUBECONFIG);
        let kc = load_kubeconfig(&[p]).expect("loads");
        assert_eq!(proxy_verdict(&kc, None).expect("dev"), ProxyVerdict::Direct);
        assert!(matches!(proxy_verdict(&kc, Some("lens")).expect("lens"), ProxyVerdict::PathPrefixed { .. }));
        assert!(matches!(proxy_verdict(&kc, Some("corp")).expect("corp"), ProxyVerdict::ExplicitProxy { .. }));
        assert!(matches!(proxy_verdict(&kc, Some("nope")), Err(Error::AuthMissing(_))));
    }

    #[test]
    fn merge_keeps_first_file_on_conflict() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = write_config(&dir, "a", KUBECONFIG);
        let b = write_config(
            &dir,
            "b",
            "apiVersion: v1\nkind: Config\ncurrent-context: other\nclusters:\n- name: other\n  cluster: { server: https://10.9.9.9 }\ncontexts:\n- name: other\n  context: { cluster: other, user: me }\nusers: []\n",
        );
        let kc = load_kubeconfig(&[a, b]).expect("merged");
        assert_eq!(kc.current_context.as_deref(), Some("dev"));
        assert!(kc.clusters.iter().any(|c| c.name == "other"));
    }

    #[test]
    fn host_only_strips_path() {
        let uri: http::Uri = "http://127.0.0.1:34567/api-proxy/dev".parse().expect("uri");
        assert_eq!(host_only(&uri).expect("host").to_string(), "http://127.0.0.1:34567/");
    }
}
