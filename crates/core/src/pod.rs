use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};

/// Identity of a pod inside the targeted set.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PodKey {
    pub namespace: String,
    pub name: String,
}

impl std::fmt::Display for PodKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStatusRef {
    pub name: String,
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
}

/// The slice of a pod the control plane cares about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodRef {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub phase: String,
    #[serde(default, rename = "podIP")]
    pub pod_ip: String,
    #[serde(default)]
    pub container_statuses: Vec<ContainerStatusRef>,
}

impl PodRef {
    pub fn key(&self) -> PodKey {
        PodKey { namespace: self.namespace.clone(), name: self.name.clone() }
    }

    pub fn is_running(&self) -> bool {
        self.phase == "Running"
    }

    /// Running with an address assigned; the only shape the targeted set accepts.
    pub fn is_targetable(&self) -> bool {
        self.is_running() && !self.pod_ip.is_empty()
    }
}

impl From<&Pod> for PodRef {
    fn from(pod: &Pod) -> Self {
        let meta = &pod.metadata;
        let spec = pod.spec.as_ref();
        let status = pod.status.as_ref();
        let container_statuses = status
            .and_then(|s| s.container_statuses.as_ref())
            .map(|cs| {
                cs.iter()
                    .map(|c| ContainerStatusRef { name: c.name.clone(), ready: c.ready, container_id: c.container_id.clone() })
                    .collect()
            })
            .unwrap_or_default();
        Self {
            name: meta.name.clone().unwrap_or_default(),
            namespace: meta.namespace.clone().unwrap_or_default(),
            node_name: spec.and_then(|s| s.node_name.clone()).unwrap_or_default(),
            phase: status.and_then(|s| s.phase.clone()).unwrap_or_default(),
            pod_ip: status.and_then(|s| s.pod_ip.clone()).unwrap_or_default(),
            container_statuses,
        }
    }
}

impl From<Pod> for PodRef {
    fn from(pod: Pod) -> Self {
        PodRef::from(&pod)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod_json(phase: &str, ip: Option<&str>) -> Pod {
        let mut status = serde_json::json!({ "phase": phase });
        if let Some(ip) = ip {
            status["podIP"] = serde_json::Value::String(ip.to_string());
        }
        serde_json::from_value(serde_json::json!({
            "metadata": { "name": "api-7f9", "namespace": "shop" },
            "spec": { "nodeName": "node-a", "containers": [] },
            "status": status,
        }))
        .expect("pod")
    }

    #[test]
    fn projects_pod_fields() {
        let p = PodRef::from(&pod_json("Running", Some("10.0.0.4")));
        assert_eq!(p.key(), PodKey { namespace: "shop".into(), name: "api-7f9".into() });
        assert_eq!(p.node_name, "node-a");
        assert!(p.is_targetable());
    }

    #[test]
    fn running_without_ip_is_not_targetable() {
        let p = PodRef::from(&pod_json("Running", None));
        assert!(p.is_running());
        assert!(!p.is_targetable());
    }

    #[test]
    fn serializes_with_upstream_field_names() {
        let p = PodRef::from(&pod_json("Running", Some("10.0.0.4")));
        let v = serde_json::to_value(&p).expect("json");
        assert_eq!(v["podIP"], "10.0.0.4");
        assert_eq!(v["nodeName"], "node-a");
    }
}
