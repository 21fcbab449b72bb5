use std::sync::Arc;

use async_trait::async_trait;
use tapline_core::{CancellationToken, Error};
use tapline_kubehub::Cluster;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::proxy::{router, serve_router};
use crate::target::ServiceTarget;

/// A spawned listener task and the token that stops it.
#[derive(Debug)]
pub struct ServingTask {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl ServingTask {
    pub fn new(stop: CancellationToken, task: JoinHandle<()>) -> Self {
        Self { stop, task }
    }

    /// Stop accepting, let in-flight work drain, and wait for the task.
    pub async fn shutdown(self) {
        self.stop.cancel();
        let _ = self.task.await;
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// The two ways of carrying local traffic into the cluster.
#[async_trait]
pub trait IngressBackend: Send + Sync + 'static {
    /// Serve the path-rewriting reverse proxy on `listener`.
    async fn serve_proxy(&self, target: &ServiceTarget, listener: TcpListener, parent: &CancellationToken) -> Result<ServingTask, Error>;

    /// Serve a port-forward tunnel to a pod behind the service on `listener`.
    async fn serve_port_forward(
        &self,
        target: &ServiceTarget,
        listener: TcpListener,
        parent: &CancellationToken,
    ) -> Result<ServingTask, Error>;
}

/// Backend talking to the real API server.
#[derive(Debug, Clone)]
pub struct KubeBackend {
    cluster: Cluster,
}

impl KubeBackend {
    pub fn new(cluster: Cluster) -> Self {
        Self { cluster }
    }
}

#[async_trait]
impl IngressBackend for KubeBackend {
    async fn serve_proxy(&self, target: &ServiceTarget, listener: TcpListener, parent: &CancellationToken) -> Result<ServingTask, Error> {
        let app = router(&target.proxy_prefix(), Arc::new(self.cluster.clone()));
        Ok(serve_router(listener, app, parent))
    }

    async fn serve_port_forward(
        &self,
        target: &ServiceTarget,
        listener: TcpListener,
        parent: &CancellationToken,
    ) -> Result<ServingTask, Error> {
        let pod = self.cluster.pick_ready_pod(&target.namespace, &target.pod_selector()).await?;
        debug!(service = %target.service, pod = %pod, "port-forward target");
        let stop = parent.child_token();
        let handle = self.cluster.serve_port_forward(listener, &target.namespace, &pod, target.remote_port, &stop)?;
        let wait = stop.clone();
        let task = tokio::spawn(async move {
            wait.cancelled().await;
            handle.shutdown().await;
        });
        Ok(ServingTask::new(stop, task))
    }
}
