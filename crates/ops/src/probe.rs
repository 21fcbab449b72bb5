use anyhow::anyhow;
use tapline_core::{retry_with_context, CancellationToken, Error, RetryPolicy};
use tracing::debug;

/// GET `url` under `policy` until it answers 2xx.
///
/// Exhausting the policy is `HealthCheckTimeout`; cancellation is `Cancelled`.
pub async fn probe(url: &str, policy: &RetryPolicy, cancel: &CancellationToken) -> Result<(), Error> {
    let client = reqwest::Client::builder()
        .timeout(policy.attempt_timeout)
        // A fallback listener reuses the port; never reuse a pooled connection.
        .pool_max_idle_per_host(0)
        .build()
        .map_err(|e| Error::Transport(e.to_string()))?;
    let res = retry_with_context(policy, cancel, |attempt| {
        let client = client.clone();
        async move {
            let resp = client.get(url).send().await?;
            let status = resp.status();
            debug!(url = %url, attempt, status = status.as_u16(), "health probe");
            if status.is_success() {
                Ok(())
            } else {
                Err(anyhow!("HTTP {}", status.as_u16()))
            }
        }
    })
    .await;
    res.map_err(|e| match e.downcast_ref::<Error>() {
        Some(Error::Cancelled) => Error::Cancelled,
        _ => Error::HealthCheckTimeout { url: url.to_string(), attempts: policy.attempts(), last: e.to_string() },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;

    async fn serve(status: StatusCode) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let app = Router::new().route("/echo", get(move || async move { status }));
        tokio::spawn(async move { axum::serve(listener, app).await });
        format!("http://{addr}/echo")
    }

    fn quick() -> RetryPolicy {
        RetryPolicy { retries: 3, attempt_timeout: Duration::from_secs(2), interval: Duration::from_millis(20) }
    }

    #[tokio::test]
    async fn healthy_endpoint_passes() {
        let url = serve(StatusCode::OK).await;
        probe(&url, &quick(), &CancellationToken::new()).await.expect("healthy");
    }

    #[tokio::test]
    async fn bad_gateway_exhausts_into_timeout_error() {
        let url = serve(StatusCode::BAD_GATEWAY).await;
        let err = probe(&url, &quick(), &CancellationToken::new()).await.expect_err("unhealthy");
        match err {
            Error::HealthCheckTimeout { attempts, last, .. } => {
                assert_eq!(attempts, 3);
                assert!(last.contains("502"), "{last}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_wins() {
        let url = serve(StatusCode::BAD_GATEWAY).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(probe(&url, &quick(), &cancel).await, Err(Error::Cancelled));
    }
}
