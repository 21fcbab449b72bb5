use async_trait::async_trait;
use serde::Serialize;
use tapline_core::{retry_with_context, CancellationToken, Error, PodRef, RetryPolicy};
use tracing::debug;

/// Receives the full targeted set after every change.
#[async_trait]
pub trait UpstreamReporter: Send + Sync + 'static {
    async fn report(&self, pods: &[PodRef]) -> Result<(), Error>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TargetedPods<'a> {
    targeted_pods: &'a [PodRef],
}

/// Posts the targeted set to the hub's `/pods/targeted` endpoint.
#[derive(Debug, Clone)]
pub struct HttpReporter {
    url: String,
    client: reqwest::Client,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl HttpReporter {
    pub fn new(hub_base: &str, cancel: &CancellationToken) -> Result<Self, Error> {
        let policy = RetryPolicy::default();
        let client = reqwest::Client::builder()
            .timeout(policy.attempt_timeout)
            .build()
            .map_err(|e| Error::Transport(e.to_string()))?;
        Ok(Self { url: format!("{}/pods/targeted", hub_base.trim_end_matches('/')), client, policy, cancel: cancel.clone() })
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl UpstreamReporter for HttpReporter {
    async fn report(&self, pods: &[PodRef]) -> Result<(), Error> {
        let body = TargetedPods { targeted_pods: pods };
        retry_with_context(&self.policy, &self.cancel, |attempt| {
            let req = self.client.post(&self.url).json(&body);
            async move {
                let resp = req.send().await?.error_for_status()?;
                debug!(attempt, status = resp.status().as_u16(), "targeted pods reported");
                Ok(())
            }
        })
        .await
        .map_err(|e| match e.downcast_ref::<Error>() {
            Some(inner) => inner.clone(),
            None => Error::Transport(format!("report to {}: {e}", self.url)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn pod() -> PodRef {
        PodRef {
            name: "api-1".into(),
            namespace: "shop".into(),
            node_name: "n1".into(),
            phase: "Running".into(),
            pod_ip: "10.1.2.3".into(),
            container_statuses: vec![],
        }
    }

    #[tokio::test]
    async fn posts_targeted_pods_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/pods/targeted"))
            .and(body_json(serde_json::json!({
                "targetedPods": [{
                    "name": "api-1", "namespace": "shop", "nodeName": "n1",
                    "phase": "Running", "podIP": "10.1.2.3", "containerStatuses": []
                }]
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        let reporter = HttpReporter::new(&format!("{}/", server.uri()), &CancellationToken::new()).expect("client");
        reporter.report(&[pod()]).await.expect("reported");
    }

    #[tokio::test]
    async fn server_errors_are_retried_then_surface() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/pods/targeted"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;
        let policy = RetryPolicy { retries: 3, attempt_timeout: Duration::from_secs(2), interval: Duration::from_millis(10) };
        let reporter = HttpReporter::new(&server.uri(), &CancellationToken::new()).expect("client").with_policy(policy);
        let err = reporter.report(&[pod()]).await.expect_err("fails");
        assert!(matches!(err, Error::Transport(_)), "{err:?}");
    }
}
