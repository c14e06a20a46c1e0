use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::error::{UpdateError, UpdateResult};
use crate::observability;
use crate::retry::RetryPolicy;

pub const IDENTITY_PATH: &str = "/instance-identity/";
pub const METRICS_PATH: &str = "/metrics/evergreen/healthcheck";
pub const PUBLIC_KEY_MARKER: &str = "-----BEGIN PUBLIC KEY-----";

const HEALTH_FIELDS: [&str; 2] = ["thread-deadlock", "plugins"];

#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub name: String,
    pub ok: bool,
    pub attempts: u32,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub message: String,
    pub identity: ProbeResult,
    pub metrics: ProbeResult,
}

#[async_trait]
pub trait HealthGate: Send + Sync {
    async fn check(&self) -> HealthReport;
}

#[derive(Debug, Clone)]
pub struct HealthChecker {
    client: Client,
    base_url: String,
    identity_policy: RetryPolicy,
    metrics_policy: RetryPolicy,
}

impl HealthChecker {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> UpdateResult<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|err| UpdateError::Network {
                url: String::new(),
                attempts: 0,
                message: format!("failed building http client: {err}"),
            })?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            identity_policy: RetryPolicy::identity_probe(),
            metrics_policy: RetryPolicy::metrics_probe(),
        })
    }

    pub fn with_policies(mut self, identity: RetryPolicy, metrics: RetryPolicy) -> Self {
        self.identity_policy = identity;
        self.metrics_policy = metrics;
        self
    }

    #[instrument(name = "health.check", skip(self), fields(base_url = %self.base_url))]
    pub async fn run(&self) -> HealthReport {
        let (identity, metrics) = tokio::join!(self.probe_identity(), self.probe_metrics());

        let failures = [&identity, &metrics]
            .into_iter()
            .filter(|probe| !probe.ok)
            .map(|probe| {
                format!(
                    "{} probe failed after {} attempt(s): {}",
                    probe.name,
                    probe.attempts,
                    probe.error.as_deref().unwrap_or("unknown error")
                )
            })
            .collect::<Vec<_>>();

        let healthy = failures.is_empty();
        let message = if healthy {
            "instance identity and health metrics are ok".to_string()
        } else {
            failures.join("; ")
        };

        observability::record_healthcheck(healthy);
        if healthy {
            info!("health check passed");
        } else {
            warn!(reason = %message, "health check failed");
        }

        HealthReport {
            healthy,
            message,
            identity,
            metrics,
        }
    }

    async fn probe_identity(&self) -> ProbeResult {
        let url = format!("{}{}", self.base_url, IDENTITY_PATH);
        self.probe("identity", &url, self.identity_policy, |body| {
            if body.contains(PUBLIC_KEY_MARKER) {
                Ok(())
            } else {
                Err("response does not contain a public key block".to_string())
            }
        })
        .await
    }

    async fn probe_metrics(&self) -> ProbeResult {
        let url = format!("{}{}", self.base_url, METRICS_PATH);
        self.probe("metrics", &url, self.metrics_policy, evaluate_metrics_body)
            .await
    }

    async fn probe<F>(&self, name: &str, url: &str, policy: RetryPolicy, evaluate: F) -> ProbeResult
    where
        F: Fn(&str) -> Result<(), String>,
    {
        let total_attempts = policy.total_attempts();
        let mut last_error = String::new();

        for attempt in 0..total_attempts {
            let attempt_no = attempt + 1;
            match self.fetch_body(url).await.and_then(|body| evaluate(&body)) {
                Ok(()) => {
                    debug!(probe = name, attempt = attempt_no, "probe passed");
                    return ProbeResult {
                        name: name.to_string(),
                        ok: true,
                        attempts: attempt_no,
                        error: None,
                    };
                }
                Err(err) => {
                    last_error = err;
                    if attempt_no < total_attempts {
                        let delay = policy.delay_before_retry(attempt);
                        debug!(
                            probe = name,
                            attempt = attempt_no,
                            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            error = %last_error,
                            "probe not ready, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        ProbeResult {
            name: name.to_string(),
            ok: false,
            attempts: total_attempts,
            error: Some(last_error),
        }
    }

    async fn fetch_body(&self, url: &str) -> Result<String, String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| format!("request failed: {err}"))?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("http_status={}", status.as_u16()));
        }
        response
            .text()
            .await
            .map_err(|err| format!("failed reading body: {err}"))
    }
}

#[async_trait]
impl HealthGate for HealthChecker {
    async fn check(&self) -> HealthReport {
        self.run().await
    }
}

// Both `thread-deadlock.healthy` and `plugins.healthy` must be `true`.
fn evaluate_metrics_body(body: &str) -> Result<(), String> {
    let value: Value =
        serde_json::from_str(body).map_err(|err| format!("body is not json: {err}"))?;
    for field in HEALTH_FIELDS {
        let healthy = value
            .get(field)
            .and_then(|entry| entry.get("healthy"))
            .and_then(Value::as_bool)
            .ok_or_else(|| format!("missing boolean '{field}.healthy'"))?;
        if !healthy {
            let detail = value
                .get(field)
                .and_then(|entry| entry.get("message"))
                .and_then(Value::as_str)
                .map(|msg| format!(" ({msg})"))
                .unwrap_or_default();
            return Err(format!("'{field}' reports unhealthy{detail}"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::routing::get;
    use axum::Router;
    use serde_json::json;

    use super::{evaluate_metrics_body, HealthChecker, PUBLIC_KEY_MARKER};
    use crate::retry::RetryPolicy;

    async fn start_jenkins(plugins_healthy: bool, with_identity: bool) -> String {
        let identity = if with_identity {
            format!("{PUBLIC_KEY_MARKER}\nMIIBIjANBgkqhkiG9w0BAQEFAAOCAQ8A\n-----END PUBLIC KEY-----")
        } else {
            "<html>starting</html>".to_string()
        };
        let metrics = json!({
            "thread-deadlock": { "healthy": true },
            "plugins": { "healthy": plugins_healthy, "message": "failed to load: git" }
        })
        .to_string();

        let app = Router::new()
            .route(
                "/instance-identity/",
                get(move || {
                    let body = identity.clone();
                    async move { body }
                }),
            )
            .route(
                "/metrics/evergreen/healthcheck",
                get(move || {
                    let body = metrics.clone();
                    async move { body }
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind listener");
        let addr = listener.local_addr().expect("listener addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve test server");
        });
        format!("http://{addr}")
    }

    fn checker(base: &str) -> HealthChecker {
        HealthChecker::new(base, Duration::from_secs(2))
            .expect("checker")
            .with_policies(RetryPolicy::new(1, 5, 1.0), RetryPolicy::new(1, 5, 1.0))
    }

    #[tokio::test]
    async fn healthy_instance_passes_both_probes() {
        let base = start_jenkins(true, true).await;
        let report = checker(&base).run().await;
        assert!(report.healthy, "{}", report.message);
        assert_eq!(report.identity.attempts, 1);
        assert_eq!(report.metrics.attempts, 1);
    }

    #[tokio::test]
    async fn unhealthy_plugins_flag_is_reported() {
        let base = start_jenkins(false, true).await;
        let report = checker(&base).run().await;
        assert!(!report.healthy);
        assert!(report.identity.ok);
        assert!(!report.metrics.ok);
        assert_eq!(report.metrics.attempts, 2);
        assert!(report.message.contains("'plugins' reports unhealthy"));
    }

    #[tokio::test]
    async fn missing_identity_marker_is_reported() {
        let base = start_jenkins(true, false).await;
        let report = checker(&base).run().await;
        assert!(!report.healthy);
        assert!(report.message.contains("identity probe failed"));
    }

    #[tokio::test]
    async fn unreachable_instance_exhausts_retries() {
        let report = checker("http://127.0.0.1:1").run().await;
        assert!(!report.healthy);
        assert_eq!(report.identity.attempts, 2);
        assert!(report.identity.error.is_some());
    }

    #[test]
    fn metrics_body_shape_is_checked() {
        assert!(evaluate_metrics_body(
            r#"{"thread-deadlock":{"healthy":true},"plugins":{"healthy":true}}"#
        )
        .is_ok());
        assert!(evaluate_metrics_body(r#"{"plugins":{"healthy":true}}"#)
            .expect_err("missing field")
            .contains("thread-deadlock"));
        assert!(evaluate_metrics_body("not json").is_err());
    }
}
