use std::fmt::Debug;
use std::time::{Duration, Instant};

use k8s_openapi::api::authorization::v1::{ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::version::Info;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Config};
use kube::{Client, Resource, ResourceExt};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tapline_core::{names, Error, ALL_NAMESPACES};
use tracing::{debug, info, warn};

use crate::kubeconfig::{default_kubeconfig_paths, host_only, load_kubeconfig, proxy_verdict, ClusterOptions, ProxyVerdict};

/// Oldest API server the platform supports.
pub const MIN_KUBE_VERSION: (u32, u32) = (1, 16);

/// Namespaced, statically typed Kubernetes object.
pub trait NamespacedResource:
    Resource<DynamicType = (), Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Serialize + Debug + Send + Sync + 'static
{
}

impl<K> NamespacedResource for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Serialize + Debug + Send + Sync + 'static
{
}

/// Translate a kube client error into the shared taxonomy.
pub fn map_kube_error(e: kube::Error) -> Error {
    match e {
        kube::Error::Api(ae) => match ae.code {
            404 => Error::NotFound(ae.message),
            403 => Error::PermissionDenied(ae.message),
            409 => Error::AlreadyExists(ae.message),
            code => Error::Api { code, reason: ae.reason, message: ae.message },
        },
        other => Error::Transport(other.to_string()),
    }
}

/// Typed access to one cluster. Cheap to clone.
#[derive(Clone)]
pub struct Cluster {
    client: Client,
    default_namespace: String,
    server: String,
}

impl Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster").field("server", &self.server).field("namespace", &self.default_namespace).finish()
    }
}

impl Cluster {
    /// Resolve credentials and build a client, rejecting proxied clusters.
    pub async fn connect(opts: &ClusterOptions) -> Result<Self, Error> {
        let started = Instant::now();
        let paths = default_kubeconfig_paths(opts.kubeconfig.as_deref());
        let kc = load_kubeconfig(&paths)?;
        let verdict = proxy_verdict(&kc, opts.context.as_deref())?;
        let kco = KubeConfigOptions { context: opts.context.clone(), cluster: None, user: None };
        let config = Config::from_custom_kubeconfig(kc, &kco).await.map_err(|e| Error::AuthMissing(e.to_string()))?;
        let server = config.cluster_url.to_string();
        match verdict {
            ProxyVerdict::Direct => {}
            ProxyVerdict::ExplicitProxy { server } => return Err(Error::ClusterBehindProxy { server }),
            ProxyVerdict::PathPrefixed { server } => {
                if !probe_host_only(&config).await {
                    return Err(Error::ClusterBehindProxy { server });
                }
            }
        }
        let default_namespace = config.default_namespace.clone();
        let client = Client::try_from(config).map_err(|e| Error::AuthMissing(e.to_string()))?;
        info!(server = %server, ns = %default_namespace, took_ms = started.elapsed().as_millis() as u64, "cluster client ready");
        Ok(Self { client, default_namespace, server })
    }

    pub fn from_client(client: Client) -> Self {
        let default_namespace = client.default_namespace().to_string();
        Self { client, default_namespace, server: String::new() }
    }

    pub fn current_namespace(&self) -> &str {
        &self.default_namespace
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub(crate) fn client(&self) -> Client {
        self.client.clone()
    }

    pub(crate) fn client_ref(&self) -> &Client {
        &self.client
    }

    pub(crate) fn api<K: NamespacedResource>(&self, ns: &str) -> Api<K> {
        if ns == ALL_NAMESPACES {
            Api::all(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), ns)
        }
    }

    pub async fn server_version(&self) -> Result<Info, Error> {
        self.client.apiserver_version().await.map_err(map_kube_error)
    }

    pub async fn exists<K: NamespacedResource>(&self, ns: &str, name: &str) -> Result<bool, Error> {
        match self.api::<K>(ns).get_opt(name).await {
            Ok(found) => Ok(found.is_some()),
            Err(e) => Err(map_kube_error(e)),
        }
    }

    pub async fn get<K: NamespacedResource>(&self, ns: &str, name: &str) -> Result<K, Error> {
        self.api::<K>(ns).get(name).await.map_err(map_kube_error)
    }

    /// Create `obj`, stamping the ownership labels.
    pub async fn create<K: NamespacedResource>(&self, ns: &str, obj: &K) -> Result<K, Error> {
        let mut obj = obj.clone();
        obj.labels_mut().extend(names::ownership_labels());
        let created = self.api::<K>(ns).create(&PostParams::default(), &obj).await.map_err(map_kube_error)?;
        debug!(ns = %ns, name = %created.name_any(), kind = %K::kind(&()), "created");
        Ok(created)
    }

    pub async fn delete<K: NamespacedResource>(&self, ns: &str, name: &str) -> Result<(), Error> {
        self.api::<K>(ns).delete(name, &DeleteParams::default()).await.map_err(map_kube_error)?;
        Ok(())
    }

    /// Teardown-path delete: an object that is already gone, or that the
    /// caller may not delete, is not an error.
    pub async fn delete_quietly<K: NamespacedResource>(&self, ns: &str, name: &str) -> Result<(), Error> {
        match self.delete::<K>(ns, name).await {
            Err(e) if e.is_teardown_benign() => {
                debug!(ns = %ns, name = %name, error = %e, "teardown delete skipped");
                Ok(())
            }
            other => other,
        }
    }

    pub async fn patch_merge<K: NamespacedResource>(&self, ns: &str, name: &str, patch: &serde_json::Value) -> Result<K, Error> {
        self.api::<K>(ns).patch(name, &PatchParams::default(), &Patch::Merge(patch)).await.map_err(map_kube_error)
    }

    pub async fn list_by_label<K: NamespacedResource>(&self, ns: &str, selector: &str) -> Result<Vec<K>, Error> {
        let lp = ListParams::default().labels(selector);
        Ok(self.api::<K>(ns).list(&lp).await.map_err(map_kube_error)?.items)
    }

    /// Pods in `namespaces` whose name matches `regex`. `""` lists every namespace.
    pub async fn list_pods_by_regex(&self, namespaces: &[String], regex: &Regex, only_running: bool) -> Result<Vec<Pod>, Error> {
        let mut out = Vec::new();
        for ns in namespaces {
            let pods = self.api::<Pod>(ns).list(&ListParams::default()).await.map_err(map_kube_error)?;
            out.extend(pods.items.into_iter().filter(|p| {
                let name_ok = p.metadata.name.as_deref().is_some_and(|n| regex.is_match(n));
                let phase_ok = !only_running
                    || p.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running");
                name_ok && phase_ok
            }));
        }
        Ok(out)
    }

    /// SelfSubjectAccessReview for the current identity.
    pub async fn can_i(&self, ns: Option<&str>, group: &str, resource: &str, subresource: Option<&str>, verb: &str) -> Result<bool, Error> {
        let api: Api<SelfSubjectAccessReview> = Api::all(self.client.clone());
        let ra = ResourceAttributes {
            group: if group.is_empty() { None } else { Some(group.to_string()) },
            resource: Some(resource.to_string()),
            subresource: subresource.map(|s| s.to_string()),
            verb: Some(verb.to_string()),
            namespace: ns.map(|s| s.to_string()),
            ..Default::default()
        };
        let ssar = SelfSubjectAccessReview {
            spec: SelfSubjectAccessReviewSpec { resource_attributes: Some(ra), ..Default::default() },
            ..Default::default()
        };
        let created = api.create(&PostParams::default(), &ssar).await.map_err(map_kube_error)?;
        Ok(created.status.map(|s| s.allowed).unwrap_or(false))
    }

    /// Send a raw request through the API server (service-proxy paths).
    pub async fn send_raw(&self, req: http::Request<kube::client::Body>) -> Result<http::Response<kube::client::Body>, Error> {
        self.client.send(req).await.map_err(map_kube_error)
    }
}

async fn probe_host_only(config: &Config) -> bool {
    let Some(host) = host_only(&config.cluster_url) else { return false };
    let mut cfg = config.clone();
    cfg.cluster_url = host;
    let Ok(client) = Client::try_from(cfg) else { return false };
    match tokio::time::timeout(Duration::from_secs(5), client.apiserver_version()).await {
        Ok(Ok(info)) => !info.git_version.is_empty(),
        Ok(Err(e)) => {
            warn!(error = %e, "host-only version probe failed");
            false
        }
        Err(_) => false,
    }
}

/// Parse `major`/`minor` as reported by `/version` ("1", "27+").
pub fn parse_version(info: &Info) -> Option<(u32, u32)> {
    let digits = |s: &str| s.chars().take_while(|c| c.is_ascii_digit()).collect::<String>().parse::<u32>().ok();
    Some((digits(&info.major)?, digits(&info.minor)?))
}

pub fn meets_min_version(info: &Info) -> bool {
    parse_version(info).is_some_and(|v| v >= MIN_KUBE_VERSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(major: &str, minor: &str) -> Info {
        Info { major: major.into(), minor: minor.into(), git_version: format!("v{major}.{minor}"), ..Default::default() }
    }

    #[test]
    fn version_parsing_tolerates_plus_suffix() {
        assert_eq!(parse_version(&info("1", "27+")), Some((1, 27)));
        assert!(meets_min_version(&info("1", "16")));
        assert!(!meets_min_version(&info("1", "15")));
        assert!(!meets_min_version(&info("", "")));
    }

    #[test]
    fn api_codes_map_to_taxonomy() {
        let api = |code: u16| {
            kube::Error::Api(kube::core::ErrorResponse { status: "Failure".into(), message: "m".into(), reason: "r".into(), code })
        };
        assert_eq!(map_kube_error(api(404)), Error::NotFound("m".into()));
        assert_eq!(map_kube_error(api(403)), Error::PermissionDenied("m".into()));
        assert_eq!(map_kube_error(api(409)), Error::AlreadyExists("m".into()));
        assert!(matches!(map_kube_error(api(500)), Error::Api { code: 500, .. }));
    }
}
