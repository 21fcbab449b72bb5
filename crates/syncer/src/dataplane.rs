use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use serde_json::{json, Value};
use tapline_core::{Error, PlatformNames};
use tapline_kubehub::Cluster;
use tracing::debug;

/// Label no node carries; selecting on it parks the workers without deleting
/// the DaemonSet.
const PARKING_LABEL: &str = "tapline-non-existing-label";

/// Per-node capture workers.
#[async_trait]
pub trait DataPlane: Send + Sync + 'static {
    /// Run workers on exactly `nodes` (sorted, non-empty).
    async fn apply(&self, nodes: &[String]) -> Result<(), Error>;
    /// Run no workers while keeping the per-node resources in place.
    async fn reset(&self) -> Result<(), Error>;
}

/// Places the worker DaemonSet through its node affinity.
#[derive(Debug, Clone)]
pub struct WorkerDaemonSet {
    cluster: Cluster,
    namespace: String,
    name: String,
}

impl WorkerDaemonSet {
    pub fn new(cluster: Cluster, names: &PlatformNames) -> Self {
        Self { cluster, namespace: names.self_namespace.clone(), name: names.worker_daemonset.clone() }
    }

    async fn patch_affinity(&self, terms: Value) -> Result<(), Error> {
        let patch = json!({
            "spec": { "template": { "spec": { "affinity": { "nodeAffinity": {
                "requiredDuringSchedulingIgnoredDuringExecution": { "nodeSelectorTerms": terms }
            }}}}}
        });
        self.cluster
            .patch_merge::<DaemonSet>(&self.namespace, &self.name, &patch)
            .await
            .map(|_| ())
            .map_err(|e| Error::DataPlaneUpdate(e.to_string()))
    }
}

pub(crate) fn node_terms(nodes: &[String]) -> Value {
    Value::Array(
        nodes
            .iter()
            .map(|n| json!({ "matchFields": [{ "key": "metadata.name", "operator": "In", "values": [n] }] }))
            .collect(),
    )
}

pub(crate) fn parking_terms() -> Value {
    json!([{ "matchExpressions": [{ "key": PARKING_LABEL, "operator": "Exists" }] }])
}

#[async_trait]
impl DataPlane for WorkerDaemonSet {
    async fn apply(&self, nodes: &[String]) -> Result<(), Error> {
        debug!(ds = %self.name, nodes = ?nodes, "placing workers");
        self.patch_affinity(node_terms(nodes)).await
    }

    async fn reset(&self) -> Result<(), Error> {
        debug!(ds = %self.name, "parking workers");
        self.patch_affinity(parking_terms()).await
    }
}
