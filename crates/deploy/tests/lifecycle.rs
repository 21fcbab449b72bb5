use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Event, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::WatchEvent as RawEvent;
use regex::Regex;
use tapline_core::{CancellationToken, Error, PodRef};
use tapline_deploy::{Collaborators, Controller, DeployOptions, IngressOptions, InstallRequest, Installer, RunOutcome, UninstallOutcome};
use tapline_kubehub::watch::RawStream;
use tapline_kubehub::{WatchSource, WatchedObject};
use tapline_ops::proxy::serve_router;
use tapline_ops::{IngressBackend, ServiceTarget, ServingTask};
use tapline_syncer::{DataPlane, PodLister};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Every `open` subscribes to the same event feed.
struct Feed<K: Clone> {
    tx: broadcast::Sender<RawEvent<K>>,
}

impl<K: Clone> Feed<K> {
    fn new() -> Self {
        Self { tx: broadcast::channel(64).0 }
    }

    fn send(&self, ev: RawEvent<K>) {
        self.tx.send(ev).ok().expect("feed has subscribers");
    }

    async fn wait_for_watchers(&self, n: usize) {
        wait_until(|| self.tx.receiver_count() >= n).await;
    }
}

impl<K: WatchedObject> WatchSource<K> for Feed<K> {
    fn open<'a>(&'a self, _ns: &'a str, _rv: &'a str) -> BoxFuture<'a, Result<RawStream<'a, K>, Error>> {
        let rx = self.tx.subscribe();
        Box::pin(async move {
            let stream = futures::stream::unfold(rx, |mut rx| async move {
                loop {
                    match rx.recv().await {
                        Ok(ev) => return Some((Ok(ev), rx)),
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            });
            Ok(stream.boxed())
        })
    }
}

/// Serves 200 on every path and records which services were exposed.
#[derive(Default)]
struct Backend {
    exposed: Mutex<Vec<String>>,
}

impl Backend {
    fn count(&self, service: &str) -> usize {
        self.exposed.lock().expect("lock").iter().filter(|s| *s == service).count()
    }
}

#[async_trait]
impl IngressBackend for Backend {
    async fn serve_proxy(&self, target: &ServiceTarget, listener: TcpListener, parent: &CancellationToken) -> Result<ServingTask, Error> {
        self.exposed.lock().expect("lock").push(target.service.clone());
        let ok = Router::new().fallback(|| async { "ok" });
        Ok(serve_router(listener, ok, parent))
    }

    async fn serve_port_forward(&self, target: &ServiceTarget, _l: TcpListener, _p: &CancellationToken) -> Result<ServingTask, Error> {
        Err(Error::Transport(format!("no pods behind {}", target.service)))
    }
}

struct NoPods;

#[async_trait]
impl PodLister for NoPods {
    async fn list_running(&self, _ns: &[String], _re: &Regex) -> Result<Vec<PodRef>, Error> {
        Ok(vec![])
    }
}

struct Idle;

#[async_trait]
impl DataPlane for Idle {
    async fn apply(&self, _nodes: &[String]) -> Result<(), Error> {
        Ok(())
    }
    async fn reset(&self) -> Result<(), Error> {
        Ok(())
    }
}

struct FakeInstaller {
    result: Result<(), Error>,
    installs: Mutex<Vec<InstallRequest>>,
}

impl FakeInstaller {
    fn new(result: Result<(), Error>) -> Self {
        Self { result, installs: Mutex::new(Vec::new()) }
    }
}

#[async_trait]
impl Installer for FakeInstaller {
    async fn install(&self, req: &InstallRequest) -> Result<(), Error> {
        self.installs.lock().expect("lock").push(req.clone());
        self.result.clone()
    }
    async fn uninstall(&self, _release: &str, _ns: &str) -> Result<UninstallOutcome, Error> {
        Ok(UninstallOutcome::NotInstalled)
    }
}

struct Rig {
    pods: Arc<Feed<Pod>>,
    events: Arc<Feed<Event>>,
    backend: Arc<Backend>,
    installer: Arc<FakeInstaller>,
}

impl Rig {
    fn new(install: Result<(), Error>) -> Self {
        Self {
            pods: Arc::new(Feed::new()),
            events: Arc::new(Feed::new()),
            backend: Arc::new(Backend::default()),
            installer: Arc::new(FakeInstaller::new(install)),
        }
    }

    fn collab(&self) -> Collaborators {
        Collaborators {
            current_namespace: "default".into(),
            pod_watch: self.pods.clone(),
            event_watch: self.events.clone(),
            lister: Arc::new(NoPods),
            installer: self.installer.clone(),
            ingress: self.backend.clone(),
            data_plane: Arc::new(Idle),
        }
    }
}

fn options() -> DeployOptions {
    let mut opts = DeployOptions::new(Regex::new("^api").expect("re"));
    opts.namespaces = vec!["shop".into()];
    opts.ingress = IngressOptions { host: "127.0.0.1".into(), front_port: 0, hub_port: 0, port_forward_host: None };
    opts.headless = true;
    opts.quiet = true;
    opts.readiness_deadline = Duration::from_secs(120);
    opts
}

fn platform_pod(name: &str, phase: &str) -> Pod {
    serde_json::from_value(serde_json::json!({
        "metadata": { "name": name, "namespace": "tapline", "resourceVersion": "1" },
        "status": { "phase": phase, "podIP": "10.9.0.1" }
    }))
    .expect("pod")
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn front_handoff_fires_once_and_only_after_front_runs() {
    let rig = Rig::new(Ok(()));
    let cancel = CancellationToken::new();
    let run = tokio::spawn({
        let ctl = Controller::new(options(), rig.collab());
        let cancel = cancel.clone();
        async move { ctl.run(&cancel).await }
    });

    rig.pods.wait_for_watchers(2).await;
    rig.pods.send(RawEvent::Modified(platform_pod("tapline-hub", "Running")));
    wait_until(|| rig.backend.count("tapline-hub") == 1).await;
    // the target syncer's pod watch joins the feed
    rig.pods.wait_for_watchers(3).await;
    assert_eq!(rig.backend.count("tapline-front"), 0, "front waits for its own pod");

    rig.pods.send(RawEvent::Modified(platform_pod("tapline-front", "Pending")));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(rig.backend.count("tapline-front"), 0);

    rig.pods.send(RawEvent::Modified(platform_pod("tapline-front", "Running")));
    wait_until(|| rig.backend.count("tapline-front") == 1).await;
    rig.pods.send(RawEvent::Modified(platform_pod("tapline-front", "Running")));
    rig.pods.send(RawEvent::Modified(platform_pod("tapline-hub", "Running")));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(rig.backend.count("tapline-front"), 1);
    assert_eq!(rig.backend.count("tapline-hub"), 1);

    cancel.cancel();
    let outcome = run.await.expect("join").expect("clean stop");
    assert_eq!(outcome, RunOutcome::Stopped);
    let installs = rig.installer.installs.lock().expect("lock").clone();
    assert_eq!(installs.len(), 1);
    assert_eq!(installs[0].values["tap"]["namespaces"][0], "shop");
}

#[tokio::test]
async fn existing_install_is_reused() {
    let rig = Rig::new(Err(Error::AlreadyExists("release tapline".into())));
    let cancel = CancellationToken::new();
    let run = tokio::spawn({
        let ctl = Controller::new(options(), rig.collab());
        let cancel = cancel.clone();
        async move { ctl.run(&cancel).await }
    });
    rig.pods.wait_for_watchers(2).await;
    rig.pods.send(RawEvent::Added(platform_pod("tapline-front", "Running")));
    rig.pods.send(RawEvent::Added(platform_pod("tapline-hub", "Running")));
    wait_until(|| rig.backend.count("tapline-front") == 1).await;
    cancel.cancel();
    assert_eq!(run.await.expect("join"), Ok(RunOutcome::Stopped));
}

#[tokio::test(start_paused = true)]
async fn missed_readiness_deadline_cancels_root() {
    let rig = Rig::new(Ok(()));
    let cancel = CancellationToken::new();
    let err = Controller::new(options(), rig.collab()).run(&cancel).await.expect_err("deadline");
    assert_eq!(err, Error::ReadinessDeadline { target: "tapline-hub, tapline-front".into(), secs: 120 });
    assert!(cancel.is_cancelled());
}

#[tokio::test]
async fn deleted_platform_pod_is_fatal() {
    let rig = Rig::new(Ok(()));
    let cancel = CancellationToken::new();
    let run = tokio::spawn({
        let ctl = Controller::new(options(), rig.collab());
        let cancel = cancel.clone();
        async move { ctl.run(&cancel).await }
    });
    rig.pods.wait_for_watchers(2).await;
    rig.pods.send(RawEvent::Deleted(platform_pod("tapline-front", "Running")));
    let err = run.await.expect("join").expect_err("fatal");
    assert!(matches!(err, Error::PlatformFailure(ref m) if m.contains("tapline-front")), "{err:?}");
}

#[tokio::test]
async fn scheduling_failure_after_start_aborts() {
    let rig = Rig::new(Ok(()));
    let cancel = CancellationToken::new();
    let run = tokio::spawn({
        let ctl = Controller::new(options(), rig.collab());
        let cancel = cancel.clone();
        async move { ctl.run(&cancel).await }
    });
    rig.events.wait_for_watchers(1).await;
    let mut ev: Event = serde_json::from_value(serde_json::json!({
        "metadata": { "name": "tapline-hub.17f2", "namespace": "tapline", "resourceVersion": "3" },
        "involvedObject": { "kind": "Pod", "name": "tapline-hub" },
        "reason": "FailedScheduling",
        "message": "0/2 nodes are available: 2 Insufficient memory."
    }))
    .expect("event");
    ev.metadata.creation_timestamp = Some(Time(Utc::now() + chrono::Duration::seconds(5)));
    rig.events.send(RawEvent::Added(ev));
    let err = run.await.expect("join").expect_err("aborted");
    assert!(matches!(err, Error::PlatformFailure(ref m) if m.contains("Insufficient memory")), "{err:?}");
    assert!(cancel.is_cancelled());
}

#[tokio::test]
async fn dry_run_stops_after_preview() {
    let rig = Rig::new(Ok(()));
    let mut opts = options();
    opts.dry_run = true;
    let outcome = Controller::new(opts, rig.collab()).run(&CancellationToken::new()).await.expect("dry run");
    assert_eq!(outcome, RunOutcome::DryRun { matched: 0 });
    assert!(rig.installer.installs.lock().expect("lock").is_empty());
}
