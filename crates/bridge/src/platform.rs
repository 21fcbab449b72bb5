//! The cluster-side operations behind the bridge's local tools.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tapline_core::{CancellationToken, Error, PlatformNames, RetryPolicy};
use tapline_deploy::{
    expose_service, platform_status, stop_platform, wait_for_hub, Collaborators, Controller, DeployOptions, HubPoll, Installer,
    PlatformService, PlatformStatus, RunOutcome, UninstallOutcome,
};
use tapline_kubehub::{Cluster, ClusterOptions};
use tapline_ops::{probe, Ingress, KubeBackend};
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What `start_platform` asks for.
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    /// Self-namespace override.
    pub release_namespace: Option<String>,
    /// Empty means every namespace.
    pub namespaces: Vec<String>,
    pub pod_regex: Option<Regex>,
}

#[async_trait]
pub trait PlatformControl: Send + Sync + 'static {
    /// Namespace used when a tool call names none.
    fn default_namespace(&self) -> String;

    async fn status(&self, namespace: &str) -> Result<PlatformStatus, Error>;

    /// Launch a deploy run and wait for the hub. `Ok(false)` when the hub
    /// did not come up within the poll schedule.
    async fn start(&self, req: StartRequest) -> Result<bool, Error>;

    async fn stop(&self, namespace: &str) -> Result<UninstallOutcome, Error>;

    /// Base URL of the front, exposing it locally when nothing serves it yet.
    async fn front_base(&self) -> Result<String, Error>;
}

struct BackgroundRun {
    namespace: String,
    cancel: CancellationToken,
    task: JoinHandle<Result<RunOutcome, Error>>,
}

/// [`PlatformControl`] over a real cluster. The cluster is connected on first
/// use so that the bridge can start without credentials.
pub struct ClusterPlatform {
    cluster_opts: ClusterOptions,
    template: DeployOptions,
    installer: Arc<dyn Installer>,
    poll: HubPoll,
    root: CancellationToken,
    cluster: OnceCell<Cluster>,
    ingress: OnceCell<Ingress>,
    run: Mutex<Option<BackgroundRun>>,
}

impl ClusterPlatform {
    /// `template` supplies every deploy setting a tool call cannot override.
    pub fn new(cluster_opts: ClusterOptions, template: DeployOptions, installer: Arc<dyn Installer>, root: &CancellationToken) -> Self {
        Self {
            cluster_opts,
            template,
            installer,
            poll: HubPoll::default(),
            root: root.clone(),
            cluster: OnceCell::new(),
            ingress: OnceCell::new(),
            run: Mutex::new(None),
        }
    }

    pub fn with_poll(mut self, poll: HubPoll) -> Self {
        self.poll = poll;
        self
    }

    async fn cluster(&self) -> Result<&Cluster, Error> {
        self.cluster.get_or_try_init(|| Cluster::connect(&self.cluster_opts)).await
    }

    fn deploy_options(&self, req: &StartRequest, namespace: &str) -> DeployOptions {
        let mut opts = self.template.clone();
        opts.names = PlatformNames::new(namespace);
        if let Some(re) = &req.pod_regex {
            opts.regex = re.clone();
        }
        opts.all_namespaces = req.namespaces.is_empty();
        opts.namespaces = req.namespaces.clone();
        opts.headless = true;
        opts.quiet = true;
        opts.dry_run = false;
        opts
    }

    async fn cancel_run(&self) {
        if let Some(run) = self.run.lock().await.take() {
            info!(ns = %run.namespace, "stopping background deploy run");
            run.cancel.cancel();
            match run.task.await {
                Ok(Ok(_)) | Ok(Err(Error::Cancelled)) => {}
                Ok(Err(e)) => debug!(error = %e, "background deploy run ended with error"),
                Err(e) => warn!(error = %e, "background deploy run panicked"),
            }
        }
    }
}

#[async_trait]
impl PlatformControl for ClusterPlatform {
    fn default_namespace(&self) -> String {
        self.template.names.self_namespace.clone()
    }

    async fn status(&self, namespace: &str) -> Result<PlatformStatus, Error> {
        let cluster = self.cluster().await?;
        platform_status(cluster, &PlatformNames::new(namespace)).await
    }

    async fn start(&self, req: StartRequest) -> Result<bool, Error> {
        let namespace = req.release_namespace.clone().unwrap_or_else(|| self.default_namespace());
        let cluster = self.cluster().await?.clone();
        let names = PlatformNames::new(&namespace);

        let mut slot = self.run.lock().await;
        if slot.as_ref().is_some_and(|r| r.task.is_finished()) {
            slot.take();
        }
        if slot.is_none() {
            let opts = self.deploy_options(&req, &namespace);
            let collab = Collaborators::for_cluster(&cluster, &names, self.installer.clone());
            let cancel = self.root.child_token();
            let task = tokio::spawn({
                let cancel = cancel.clone();
                async move { Controller::new(opts, collab).run(&cancel).await }
            });
            info!(ns = %namespace, "deploy run launched");
            *slot = Some(BackgroundRun { namespace: namespace.clone(), cancel, task });
        } else {
            debug!(ns = %namespace, "deploy run already active");
        }
        let Some(run) = slot.as_mut() else {
            return Err(Error::Cancelled);
        };

        tokio::select! {
            ready = wait_for_hub(&cluster, &names, self.poll, &run.cancel) => ready,
            joined = &mut run.task => {
                slot.take();
                match joined {
                    Ok(Ok(outcome)) => {
                        debug!(?outcome, "deploy run finished before the hub came up");
                        Ok(false)
                    }
                    Ok(Err(e)) => Err(e),
                    Err(e) => Err(Error::Transport(format!("deploy run aborted: {e}"))),
                }
            }
        }
    }

    async fn stop(&self, namespace: &str) -> Result<UninstallOutcome, Error> {
        self.cancel_run().await;
        if let Some(ingress) = self.ingress.get() {
            ingress.stop_all().await;
        }
        stop_platform(self.installer.as_ref(), &self.template.release.name, &PlatformNames::new(namespace)).await
    }

    async fn front_base(&self) -> Result<String, Error> {
        let opts = &self.template.ingress;
        let local = format!("http://{}:{}", opts.host, opts.front_port);
        let quick = RetryPolicy { retries: 1, attempt_timeout: Duration::from_secs(2), interval: Duration::ZERO };
        if probe(&format!("{local}/"), &quick, &self.root).await.is_ok() {
            debug!(url = %local, "front already served locally");
            return Ok(local);
        }
        let cluster = self.cluster().await?;
        let ingress = self
            .ingress
            .get_or_init(|| async {
                Ingress::new(Arc::new(KubeBackend::new(cluster.clone())), &self.root).with_port_forward_host(opts.port_forward_host.clone())
            })
            .await;
        let session = expose_service(ingress, cluster, &self.template.names, opts, PlatformService::Front).await?;
        Ok(session.base_url)
    }
}
