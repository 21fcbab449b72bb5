//! Port-forward tunnels and pod exec.

use std::net::SocketAddr;

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams, ListParams};
use tapline_core::{CancellationToken, Error};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cluster::{map_kube_error, Cluster};

/// Bind a local listener, reporting an occupied port as `PortInUse`.
pub async fn bind_local(host: &str, port: u16) -> Result<TcpListener, Error> {
    match TcpListener::bind((host, port)).await {
        Ok(l) => Ok(l),
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => Err(Error::PortInUse(port)),
        Err(e) => Err(Error::Transport(format!("bind {host}:{port}: {e}"))),
    }
}

/// A live port-forward listener. Dropping the handle leaves the tunnel running;
/// call [`PortForwardHandle::shutdown`] or cancel the parent token.
#[derive(Debug)]
pub struct PortForwardHandle {
    pub local_addr: SocketAddr,
    pub pod: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PortForwardHandle {
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

fn pod_is_ready(p: &Pod) -> bool {
    let Some(status) = p.status.as_ref() else { return false };
    if status.phase.as_deref() != Some("Running") {
        return false;
    }
    status
        .conditions
        .as_ref()
        .map(|cs| cs.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
        .unwrap_or(true)
}

/// Streams wired into [`Cluster::exec`]. Unset streams are not attached.
#[derive(Default)]
pub struct ExecStreams {
    pub stdin: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub stdout: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    pub stderr: Option<Box<dyn AsyncWrite + Send + Unpin>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecStatus {
    pub success: bool,
    pub message: Option<String>,
}

impl Cluster {
    /// Name of any ready pod matching `selector` in `ns`.
    pub async fn pick_ready_pod(&self, ns: &str, selector: &str) -> Result<String, Error> {
        let api: Api<Pod> = Api::namespaced(self.client(), ns);
        let pods = api.list(&ListParams::default().labels(selector)).await.map_err(map_kube_error)?;
        pods.items
            .iter()
            .find(|p| pod_is_ready(p))
            .and_then(|p| p.metadata.name.clone())
            .ok_or_else(|| Error::NotFound(format!("no ready pod matches {selector} in {ns}")))
    }

    /// Forward `host:local_port` to `remote_port` of a ready pod matching `selector`.
    pub async fn port_forward(
        &self,
        ns: &str,
        selector: &str,
        host: &str,
        local_port: u16,
        remote_port: u16,
        cancel: &CancellationToken,
    ) -> Result<PortForwardHandle, Error> {
        let pod = self.pick_ready_pod(ns, selector).await?;
        let listener = bind_local(host, local_port).await?;
        self.serve_port_forward(listener, ns, &pod, remote_port, cancel)
    }

    /// Accept on `listener` and open one tunnel stream per connection.
    pub fn serve_port_forward(
        &self,
        listener: TcpListener,
        ns: &str,
        pod: &str,
        remote_port: u16,
        parent: &CancellationToken,
    ) -> Result<PortForwardHandle, Error> {
        let local_addr = listener.local_addr().map_err(|e| Error::Transport(e.to_string()))?;
        let cancel = parent.child_token();
        let api: Api<Pod> = Api::namespaced(self.client(), ns);
        let pod_name = pod.to_string();
        let task_cancel = cancel.clone();
        info!(local = %local_addr, ns = %ns, pod = %pod_name, remote_port, "port-forward listening");
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    accepted = listener.accept() => {
                        let (mut inbound, peer) = match accepted {
                            Ok(v) => v,
                            Err(e) => { warn!(error = %e, "port-forward accept failed"); break; }
                        };
                        let api = api.clone();
                        let pod_name = pod_name.clone();
                        let conn_cancel = task_cancel.clone();
                        tokio::spawn(async move {
                            debug!(peer = %peer, pod = %pod_name, "port-forward connection");
                            let mut pf = match api.portforward(&pod_name, &[remote_port]).await {
                                Ok(pf) => pf,
                                Err(e) => { warn!(pod = %pod_name, error = %e, "port-forward tunnel failed"); return; }
                            };
                            let Some(mut upstream) = pf.take_stream(remote_port) else {
                                warn!(pod = %pod_name, "port-forward stream missing");
                                return;
                            };
                            tokio::select! {
                                _ = conn_cancel.cancelled() => {}
                                res = tokio::io::copy_bidirectional(&mut inbound, &mut upstream) => {
                                    if let Err(e) = res { debug!(peer = %peer, error = %e, "port-forward copy ended"); }
                                }
                            }
                            drop(upstream);
                            let _ = pf.join().await;
                        });
                    }
                }
            }
            info!(local = %local_addr, "port-forward stopped");
        });
        Ok(PortForwardHandle { local_addr, pod: pod.to_string(), cancel, task })
    }

    /// Run `argv` in `pod`, streaming whichever standard streams are provided.
    pub async fn exec(&self, ns: &str, pod: &str, container: Option<&str>, argv: &[String], streams: ExecStreams) -> Result<ExecStatus, Error> {
        let api: Api<Pod> = Api::namespaced(self.client(), ns);
        let ExecStreams { stdin, stdout, stderr } = streams;
        let mut ap = AttachParams::default().stdin(stdin.is_some()).stdout(stdout.is_some()).stderr(stderr.is_some());
        if let Some(c) = container {
            ap = ap.container(c);
        }
        let mut attached = api.exec(pod, argv.to_vec(), &ap).await.map_err(map_kube_error)?;
        let status = attached.take_status();
        let remote_stdin = attached.stdin();
        let remote_stdout = attached.stdout();
        let remote_stderr = attached.stderr();

        let stdin_pump = async {
            if let (Some(mut src), Some(mut dst)) = (stdin, remote_stdin) {
                let _ = tokio::io::copy(&mut src, &mut dst).await;
                let _ = dst.shutdown().await;
            }
        };
        let stdout_pump = async {
            if let (Some(mut dst), Some(mut src)) = (stdout, remote_stdout) {
                let _ = tokio::io::copy(&mut src, &mut dst).await;
                let _ = dst.flush().await;
            }
        };
        let stderr_pump = async {
            if let (Some(mut dst), Some(mut src)) = (stderr, remote_stderr) {
                let _ = tokio::io::copy(&mut src, &mut dst).await;
                let _ = dst.flush().await;
            }
        };
        tokio::join!(stdin_pump, stdout_pump, stderr_pump);

        let st = match status {
            Some(fut) => fut.await,
            None => None,
        };
        attached.join().await.map_err(|e| Error::Transport(e.to_string()))?;
        Ok(match st {
            Some(s) => ExecStatus { success: s.status.as_deref() == Some("Success"), message: s.message },
            None => ExecStatus { success: true, message: None },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn occupied_port_is_port_in_use() {
        let first = bind_local("127.0.0.1", 0).await.expect("bind ephemeral");
        let port = first.local_addr().expect("addr").port();
        let err = bind_local("127.0.0.1", port).await.expect_err("second bind");
        assert_eq!(err, Error::PortInUse(port));
    }

    #[test]
    fn readiness_requires_running_and_ready_condition() {
        let pod: Pod = serde_json::from_value(serde_json::json!({
            "metadata": { "name": "tapline-front" },
            "status": { "phase": "Running", "conditions": [{ "type": "Ready", "status": "False" }] }
        }))
        .expect("pod");
        assert!(!pod_is_ready(&pod));
        let pod: Pod = serde_json::from_value(serde_json::json!({
            "metadata": { "name": "tapline-front" },
            "status": { "phase": "Running", "conditions": [{ "type": "Ready", "status": "True" }] }
        }))
        .expect("pod");
        assert!(pod_is_ready(&pod));
    }
}
