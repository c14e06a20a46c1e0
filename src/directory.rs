use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::json;
use tracing::{debug, info, instrument};

use crate::error::{UpdateError, UpdateResult};
use crate::manifest::UpdateManifest;

#[async_trait]
pub trait DirectoryApi: Send + Sync {
    /// `None` means there is nothing newer than `level`.
    async fn query(&self, instance_id: &str, level: u64) -> UpdateResult<Option<UpdateManifest>>;

    async fn taint(&self, instance_id: &str, level: u64) -> UpdateResult<()>;
}

#[derive(Debug, Clone)]
pub struct HttpDirectory {
    client: Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpDirectory {
    pub fn new(
        endpoint: impl Into<String>,
        token: Option<String>,
        request_timeout: Duration,
    ) -> UpdateResult<Self> {
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
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token: token.filter(|value| !value.trim().is_empty()),
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.header(reqwest::header::AUTHORIZATION, token),
            None => request,
        }
    }
}

fn network_error(url: &str, message: impl Into<String>) -> UpdateError {
    UpdateError::Network {
        url: url.to_string(),
        attempts: 1,
        message: message.into(),
    }
}

#[async_trait]
impl DirectoryApi for HttpDirectory {
    #[instrument(name = "directory.query", skip(self), fields(endpoint = %self.endpoint))]
    async fn query(&self, instance_id: &str, level: u64) -> UpdateResult<Option<UpdateManifest>> {
        let url = format!("{}/update/{}?level={}", self.endpoint, instance_id, level);
        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(|err| network_error(&url, err.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            debug!(level = level, "directory reports no newer level");
            return Ok(None);
        }
        if !status.is_success() {
            return Err(network_error(&url, format!("http_status={}", status.as_u16())));
        }

        let body = response
            .text()
            .await
            .map_err(|err| network_error(&url, format!("failed reading body: {err}")))?;
        let manifest = UpdateManifest::from_json(&body)?;
        info!(
            current_level = level,
            offered_level = manifest.level(),
            artifacts = manifest.artifact_count(),
            "directory offered update"
        );
        Ok(Some(manifest))
    }

    #[instrument(name = "directory.taint", skip(self), fields(endpoint = %self.endpoint))]
    async fn taint(&self, instance_id: &str, level: u64) -> UpdateResult<()> {
        let url = format!("{}/update/tainted", self.endpoint);
        let response = self
            .authorize(
                self.client
                    .post(&url)
                    .json(&json!({ "uuid": instance_id, "level": level })),
            )
            .send()
            .await
            .map_err(|err| network_error(&url, err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(network_error(&url, format!("http_status={}", status.as_u16())));
        }
        info!(level = level, "level reported as tainted");
        Ok(())
    }
}
