//! Watch multiplexer: per-namespace watch loops feeding one filtered,
//! typed event channel plus an error lane.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{Event, Pod};
use kube::api::WatchParams;
use kube::core::{Request, WatchEvent as RawEvent};
use kube::Resource;
use metrics::counter;
use regex::Regex;
use tapline_core::{CancellationToken, Error};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cluster::{map_kube_error, Cluster, NamespacedResource};

/// Bounded depth of the event and error channels.
pub const CHANNEL_DEPTH: usize = 100;
/// Pause before resubscribing after the server closes a stream.
pub const RESTART_DELAY: Duration = Duration::from_secs(5);
/// Two closures inside this window mark the watch as unstable.
pub const UNSTABLE_WINDOW: Duration = Duration::from_secs(60);
/// Server-side timeout requested for each watch call.
const WATCH_TIMEOUT_SECS: u32 = 290;

/// Typed event union emitted to consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
    /// Resource version carried by the bookmark.
    Bookmark(String),
    Error(String),
}

impl<K> WatchEvent<K> {
    pub fn object(&self) -> Option<&K> {
        match self {
            WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => Some(o),
            WatchEvent::Bookmark(_) | WatchEvent::Error(_) => None,
        }
    }
}

/// Object types the multiplexer can filter.
pub trait WatchedObject: Clone + std::fmt::Debug + Send + Sync + 'static {
    /// Name the filter regex is matched against.
    fn watch_name(&self) -> &str;
    /// Kind compared with the optional kind filter.
    fn watch_kind(&self) -> &str;
    fn resource_version(&self) -> Option<&str>;
}

impl WatchedObject for Pod {
    fn watch_name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }
    fn watch_kind(&self) -> &str {
        "Pod"
    }
    fn resource_version(&self) -> Option<&str> {
        self.metadata.resource_version.as_deref()
    }
}

/// Core events are filtered by their own name and the kind of the object
/// they describe.
impl WatchedObject for Event {
    fn watch_name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }
    fn watch_kind(&self) -> &str {
        self.involved_object.kind.as_deref().unwrap_or_default()
    }
    fn resource_version(&self) -> Option<&str> {
        self.metadata.resource_version.as_deref()
    }
}

#[derive(Debug, Clone)]
pub struct EventFilter {
    pub name: Regex,
    pub kind: Option<String>,
}

impl EventFilter {
    pub fn new(name: Regex) -> Self {
        Self { name, kind: None }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    /// Exact-name filter.
    pub fn exact(name: &str) -> Result<Self, regex::Error> {
        Ok(Self::new(Regex::new(&format!("^{}$", regex::escape(name)))?))
    }

    pub fn matches<K: WatchedObject>(&self, obj: &K) -> bool {
        if !self.name.is_match(obj.watch_name()) {
            return false;
        }
        match &self.kind {
            Some(k) => obj.watch_kind().eq_ignore_ascii_case(k),
            None => true,
        }
    }
}

pub type RawStream<'a, K> = BoxStream<'a, Result<RawEvent<K>, Error>>;

/// Something that can open a raw watch for one namespace.
pub trait WatchSource<K>: Send + Sync + 'static {
    fn open<'a>(&'a self, namespace: &'a str, resource_version: &'a str) -> BoxFuture<'a, Result<RawStream<'a, K>, Error>>;
}

impl<K> WatchSource<K> for Cluster
where
    K: NamespacedResource + WatchedObject,
{
    fn open<'a>(&'a self, namespace: &'a str, resource_version: &'a str) -> BoxFuture<'a, Result<RawStream<'a, K>, Error>> {
        Box::pin(async move {
            let url = K::url_path(&(), if namespace.is_empty() { None } else { Some(namespace) });
            let wp = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
            let mut req = Request::new(url).watch(&wp, resource_version).map_err(|e| Error::Transport(e.to_string()))?;
            req.extensions_mut().insert("watch");
            let stream = self.client_ref().request_events::<K>(req).await.map_err(map_kube_error)?;
            Ok(stream.map(|item| item.map_err(map_kube_error)).boxed())
        })
    }
}

/// Two receivers handed to the consumer of one multiplexed watch.
#[derive(Debug)]
pub struct WatchChannels<K> {
    pub events: mpsc::Receiver<WatchEvent<K>>,
    pub errors: mpsc::Receiver<Error>,
}

/// Spawns one supervised watch loop per namespace.
pub struct Multiplexer<S: ?Sized> {
    source: Arc<S>,
    restart_delay: Duration,
    unstable_window: Duration,
}

impl<S: ?Sized> Multiplexer<S> {
    pub fn new(source: Arc<S>) -> Self {
        Self { source, restart_delay: RESTART_DELAY, unstable_window: UNSTABLE_WINDOW }
    }

    pub fn with_restart_delay(mut self, d: Duration) -> Self {
        self.restart_delay = d;
        self
    }

    pub fn with_unstable_window(mut self, d: Duration) -> Self {
        self.unstable_window = d;
        self
    }

    /// Start watching `namespaces`; channels close once `cancel` fires and
    /// every loop has exited.
    pub fn spawn<K>(&self, namespaces: &[String], filter: EventFilter, cancel: &CancellationToken) -> WatchChannels<K>
    where
        S: WatchSource<K>,
        K: WatchedObject,
    {
        let (ev_tx, events) = mpsc::channel(CHANNEL_DEPTH);
        let (err_tx, errors) = mpsc::channel(CHANNEL_DEPTH);
        for ns in namespaces {
            let lp = NamespaceLoop {
                source: Arc::clone(&self.source),
                namespace: ns.clone(),
                filter: filter.clone(),
                events: ev_tx.clone(),
                errors: err_tx.clone(),
                cancel: cancel.clone(),
                restart_delay: self.restart_delay,
                unstable_window: self.unstable_window,
            };
            tokio::spawn(lp.run());
        }
        WatchChannels { events, errors }
    }
}

struct NamespaceLoop<S: ?Sized, K> {
    source: Arc<S>,
    namespace: String,
    filter: EventFilter,
    events: mpsc::Sender<WatchEvent<K>>,
    errors: mpsc::Sender<Error>,
    cancel: CancellationToken,
    restart_delay: Duration,
    unstable_window: Duration,
}

enum StreamEnd {
    Cancelled,
    ConsumerGone,
    Closed,
}

impl<S, K> NamespaceLoop<S, K>
where
    S: WatchSource<K> + ?Sized,
    K: WatchedObject,
{
    async fn run(self) {
        let ns_label = if self.namespace.is_empty() { "*" } else { self.namespace.as_str() };
        info!(ns = %ns_label, name = %self.filter.name, kind = ?self.filter.kind, "watch started");
        let mut resource_version = String::from("0");
        let mut last_close: Option<Instant> = None;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.pump(&mut resource_version).await {
                StreamEnd::Cancelled | StreamEnd::ConsumerGone => break,
                StreamEnd::Closed => {}
            }
            counter!("tapline_watch_restarts_total").increment(1);
            let now = Instant::now();
            if last_close.is_some_and(|t| now.duration_since(t) < self.unstable_window) {
                warn!(ns = %ns_label, "watch closes frequently");
                if self.errors.send(Error::PodWatch("watch unstable, closes frequently".into())).await.is_err() {
                    break;
                }
            } else {
                debug!(ns = %ns_label, "watch stream closed; resubscribing");
            }
            last_close = Some(now);
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.restart_delay) => {}
            }
        }
        debug!(ns = %ns_label, "watch loop exited");
    }

    async fn pump(&self, resource_version: &mut String) -> StreamEnd {
        let from = resource_version.clone();
        let opened = tokio::select! {
            _ = self.cancel.cancelled() => return StreamEnd::Cancelled,
            r = self.source.open(&self.namespace, &from) => r,
        };
        let mut stream = match opened {
            Ok(s) => s,
            Err(e) => {
                warn!(ns = %self.namespace, error = %e, "watch subscribe failed");
                return StreamEnd::Closed;
            }
        };
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return StreamEnd::Cancelled,
                n = stream.next() => n,
            };
            let raw = match next {
                None => return StreamEnd::Closed,
                Some(Err(e)) => {
                    debug!(ns = %self.namespace, error = %e, "watch stream error");
                    return StreamEnd::Closed;
                }
                Some(Ok(raw)) => raw,
            };
            let out = match raw {
                RawEvent::Added(o) => self.admit(o, resource_version).map(WatchEvent::Added),
                RawEvent::Modified(o) => self.admit(o, resource_version).map(WatchEvent::Modified),
                RawEvent::Deleted(o) => self.admit(o, resource_version).map(WatchEvent::Deleted),
                RawEvent::Bookmark(b) => {
                    *resource_version = b.metadata.resource_version.clone();
                    Some(WatchEvent::Bookmark(b.metadata.resource_version))
                }
                RawEvent::Error(er) if er.code == 410 => {
                    debug!(ns = %self.namespace, "resource version expired; relisting from 0");
                    *resource_version = String::from("0");
                    return StreamEnd::Closed;
                }
                RawEvent::Error(er) => {
                    let msg = format!("{} ({})", er.message, er.reason);
                    if self.errors.send(Error::PodWatch(msg.clone())).await.is_err() {
                        return StreamEnd::ConsumerGone;
                    }
                    if self.events.send(WatchEvent::Error(msg)).await.is_err() {
                        return StreamEnd::ConsumerGone;
                    }
                    return StreamEnd::Closed;
                }
            };
            if let Some(ev) = out {
                counter!("tapline_watch_events_total").increment(1);
                if self.events.send(ev).await.is_err() {
                    return StreamEnd::ConsumerGone;
                }
            }
        }
    }

    fn admit(&self, obj: K, resource_version: &mut String) -> Option<K> {
        if let Some(rv) = obj.resource_version() {
            *resource_version = rv.to_string();
        }
        self.filter.matches(&obj).then_some(obj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Serves scripted streams, one per `open` call, and records the
    /// resource versions it was asked for.
    struct Scripted<K> {
        scripts: Mutex<VecDeque<Vec<RawEvent<K>>>>,
        opened_with: Mutex<Vec<String>>,
    }

    impl<K> Scripted<K> {
        fn new(scripts: Vec<Vec<RawEvent<K>>>) -> Self {
            Self { scripts: Mutex::new(scripts.into()), opened_with: Mutex::new(Vec::new()) }
        }
    }

    impl<K: WatchedObject> WatchSource<K> for Scripted<K> {
        fn open<'a>(&'a self, _ns: &'a str, rv: &'a str) -> BoxFuture<'a, Result<RawStream<'a, K>, Error>> {
            Box::pin(async move {
                self.opened_with.lock().expect("lock").push(rv.to_string());
                let next = self.scripts.lock().expect("lock").pop_front();
                match next {
                    Some(events) => Ok(futures::stream::iter(events.into_iter().map(Ok)).boxed()),
                    // Out of script: hang like an idle watch.
                    None => Ok(futures::stream::pending().boxed()),
                }
            })
        }
    }

    fn pod(name: &str, rv: &str) -> Pod {
        serde_json::from_value(serde_json::json!({
            "metadata": { "name": name, "namespace": "shop", "resourceVersion": rv }
        }))
        .expect("pod")
    }

    fn event(name: &str, kind: &str) -> Event {
        serde_json::from_value(serde_json::json!({
            "metadata": { "name": name, "namespace": "tapline", "resourceVersion": "5" },
            "involvedObject": { "kind": kind, "name": "tapline-hub" },
            "reason": "FailedScheduling"
        }))
        .expect("event")
    }

    #[tokio::test(start_paused = true)]
    async fn filter_drops_non_matching_names() {
        let src = Arc::new(Scripted::new(vec![vec![
            RawEvent::Added(pod("api-1", "10")),
            RawEvent::Added(pod("db-1", "11")),
            RawEvent::Modified(pod("api-1", "12")),
        ]]));
        let cancel = CancellationToken::new();
        let mut ch = Multiplexer::new(src).spawn::<Pod>(&["shop".into()], EventFilter::new(Regex::new("^api").expect("re")), &cancel);
        let first = ch.events.recv().await.expect("first");
        assert!(matches!(first, WatchEvent::Added(ref p) if p.watch_name() == "api-1"));
        let second = ch.events.recv().await.expect("second");
        assert!(matches!(second, WatchEvent::Modified(ref p) if p.watch_name() == "api-1"));
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn resubscribes_from_last_version_and_flags_unstable_watch() {
        let src = Arc::new(Scripted::new(vec![
            vec![RawEvent::Added(pod("api-1", "10"))],
            vec![RawEvent::Modified(pod("api-1", "20"))],
        ]));
        let cancel = CancellationToken::new();
        let mux = Multiplexer::new(Arc::clone(&src)).with_restart_delay(Duration::from_secs(1));
        let mut ch = mux.spawn::<Pod>(&["shop".into()], EventFilter::new(Regex::new(".*").expect("re")), &cancel);
        assert!(matches!(ch.events.recv().await, Some(WatchEvent::Added(_))));
        assert!(matches!(ch.events.recv().await, Some(WatchEvent::Modified(_))));
        let err = ch.errors.recv().await.expect("unstable error");
        assert_eq!(err, Error::PodWatch("watch unstable, closes frequently".into()));
        // let the third subscription start
        tokio::time::sleep(Duration::from_secs(2)).await;
        let opened = src.opened_with.lock().expect("lock").clone();
        assert_eq!(&opened[..3], &["0".to_string(), "10".to_string(), "20".to_string()]);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn bookmarks_pass_through_unfiltered() {
        let bookmark: RawEvent<Pod> = serde_json::from_value(serde_json::json!({
            "type": "BOOKMARK",
            "object": { "kind": "Pod", "apiVersion": "v1", "metadata": { "resourceVersion": "42" } }
        }))
        .expect("bookmark");
        let src = Arc::new(Scripted::new(vec![vec![bookmark]]));
        let cancel = CancellationToken::new();
        let mut ch = Multiplexer::new(src).spawn::<Pod>(&["shop".into()], EventFilter::exact("nothing").expect("re"), &cancel);
        assert_eq!(ch.events.recv().await, Some(WatchEvent::Bookmark("42".into())));
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn event_adapter_filters_by_involved_kind() {
        let src = Arc::new(Scripted::new(vec![vec![
            RawEvent::Added(event("tapline-hub.17a", "Node")),
            RawEvent::Added(event("tapline-hub.17b", "pod")),
        ]]));
        let cancel = CancellationToken::new();
        let filter = EventFilter::new(Regex::new("^tapline-").expect("re")).with_kind("Pod");
        let mut ch = Multiplexer::new(src).spawn::<Event>(&["tapline".into()], filter, &cancel);
        let got = ch.events.recv().await.expect("event");
        assert_eq!(got.object().map(|e| e.watch_name()), Some("tapline-hub.17b"));
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn error_events_surface_on_both_lanes() {
        let err: RawEvent<Pod> = serde_json::from_value(serde_json::json!({
            "type": "ERROR",
            "object": { "status": "Failure", "message": "etcd unavailable", "reason": "InternalError", "code": 500 }
        }))
        .expect("error event");
        let src = Arc::new(Scripted::new(vec![vec![err]]));
        let cancel = CancellationToken::new();
        let mut ch = Multiplexer::new(src).spawn::<Pod>(&["shop".into()], EventFilter::new(Regex::new(".*").expect("re")), &cancel);
        assert!(matches!(ch.errors.recv().await, Some(Error::PodWatch(m)) if m.contains("etcd unavailable")));
        assert!(matches!(ch.events.recv().await, Some(WatchEvent::Error(_))));
        cancel.cancel();
    }

    #[tokio::test]
    async fn cancellation_closes_channels() {
        let src: Arc<Scripted<Pod>> = Arc::new(Scripted::new(vec![]));
        let cancel = CancellationToken::new();
        let mut ch = Multiplexer::new(src).spawn::<Pod>(&["a".into(), "b".into()], EventFilter::new(Regex::new(".*").expect("re")), &cancel);
        cancel.cancel();
        assert!(ch.events.recv().await.is_none());
        assert!(ch.errors.recv().await.is_none());
    }
}
