use async_trait::async_trait;
use regex::Regex;
use tapline_core::{Error, PodRef};
use tapline_kubehub::Cluster;

/// Authoritative source of running pods for a reconcile.
#[async_trait]
pub trait PodLister: Send + Sync + 'static {
    async fn list_running(&self, namespaces: &[String], regex: &Regex) -> Result<Vec<PodRef>, Error>;
}

#[async_trait]
impl PodLister for Cluster {
    async fn list_running(&self, namespaces: &[String], regex: &Regex) -> Result<Vec<PodRef>, Error> {
        let pods = self.list_pods_by_regex(namespaces, regex, true).await?;
        Ok(pods.iter().map(PodRef::from).collect())
    }
}
