//! HTTP client for the nvent API.

use crate::config::ClientConfig;
use crate::error::{NventError, NventResult};
use nvent_core::types::{FlowEvent, RunRecord, Trigger};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use url::Url;

/// Client for starting, observing, and steering flow runs.
#[derive(Clone)]
pub struct NventClient {
    config: Arc<ClientConfig>,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
pub struct StartedRun {
    #[serde(rename = "flowId")]
    pub flow_id: String,
}

#[derive(Debug, Deserialize)]
pub struct RunPage {
    pub items: Vec<RunRecord>,
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
    #[serde(rename = "hasMore")]
    pub has_more: bool,
}

#[derive(Debug, Deserialize)]
pub struct RestartedRun {
    #[serde(rename = "newRunId")]
    pub new_run_id: String,
}

#[derive(Debug, Deserialize)]
struct RunEventsResponse {
    events: Vec<FlowEvent>,
}

#[derive(Debug, Deserialize)]
struct TriggersResponse {
    triggers: Vec<Trigger>,
}

impl NventClient {
    pub fn new(base_url: &str) -> NventResult<Self> {
        let config = ClientConfig::new(Url::parse(base_url)?);
        Self::with_config(config)
    }

    pub fn with_config(config: ClientConfig) -> NventResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            config: Arc::new(config),
            http,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Start a run; the input becomes the run's `flow.start` payload.
    pub async fn start_flow(&self, flow: &str, input: &Value) -> NventResult<StartedRun> {
        self.post(&format!("api/_flows/{flow}/start"), Some(input))
            .await
    }

    /// Page through a flow's runs, newest first.
    pub async fn list_runs(&self, flow: &str, offset: usize, limit: usize) -> NventResult<RunPage> {
        self.get(&format!(
            "api/_flows/{flow}/runs?offset={offset}&limit={limit}"
        ))
        .await
    }

    pub async fn run_events(&self, flow: &str, run_id: &str) -> NventResult<Vec<FlowEvent>> {
        let response: RunEventsResponse = self
            .get(&format!("api/_flows/{flow}/runs/{run_id}/events"))
            .await?;
        Ok(response.events)
    }

    pub async fn cancel_run(&self, flow: &str, run_id: &str) -> NventResult<()> {
        let _: Value = self
            .post(
                &format!("api/_flows/{flow}/runs/{run_id}/cancel"),
                None::<&Value>,
            )
            .await?;
        Ok(())
    }

    /// Start a new run with the original input of an old one.
    pub async fn restart_run(&self, flow: &str, run_id: &str) -> NventResult<RestartedRun> {
        self.post(
            &format!("api/_flows/{flow}/runs/{run_id}/restart"),
            None::<&Value>,
        )
        .await
    }

    pub async fn clear_history(&self, flow: &str) -> NventResult<()> {
        let url = self.url(&format!("api/_flows/{flow}/clear-history"))?;
        let response = self.http.delete(url).send().await?;
        Self::check(response).await?;
        Ok(())
    }

    /// Resolve a webhook await with the given trigger data.
    pub async fn resolve_await(
        &self,
        flow: &str,
        run_id: &str,
        step: &str,
        data: &Value,
    ) -> NventResult<()> {
        let _: Value = self
            .post(
                &format!("api/_webhook/await/{flow}/{run_id}/{step}"),
                Some(data),
            )
            .await?;
        Ok(())
    }

    pub async fn list_triggers(&self) -> NventResult<Vec<Trigger>> {
        let response: TriggersResponse = self.get("api/_triggers").await?;
        Ok(response.triggers)
    }

    pub async fn fire_trigger(&self, name: &str, data: &Value) -> NventResult<()> {
        let _: Value = self
            .post(&format!("api/_triggers/{name}/fire"), Some(data))
            .await?;
        Ok(())
    }

    fn url(&self, path: &str) -> NventResult<Url> {
        Ok(self.config.base_url.join(path)?)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> NventResult<T> {
        let url = self.url(path)?;
        self.with_retry(|| self.http.get(url.clone()).send()).await
    }

    async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: Option<&B>,
    ) -> NventResult<T> {
        let url = self.url(path)?;
        self.with_retry(|| {
            let mut request = self.http.post(url.clone());
            if let Some(body) = body {
                request = request.json(body);
            }
            request.send()
        })
        .await
    }

    async fn with_retry<T, F, Fut>(&self, send: F) -> NventResult<T>
    where
        T: DeserializeOwned,
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = reqwest::Result<reqwest::Response>>,
    {
        let retry = &self.config.retry;
        let mut attempt = 0;
        loop {
            let outcome = match send().await {
                Ok(response) => Self::check(response).await,
                Err(e) => Err(NventError::Http(e)),
            };
            match outcome {
                Ok(response) => return Ok(response.json::<T>().await?),
                Err(e) if e.is_retryable() && attempt < retry.max_retries => {
                    let backoff = retry.backoff_for_attempt(attempt);
                    tracing::debug!(attempt, error = %e, "retrying request in {:?}", backoff);
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn check(response: reqwest::Response) -> NventResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(NventError::from_response(status.as_u16(), &body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn start_flow_parses_flow_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/_flows/orders/start"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"flowId": "abc"})),
            )
            .mount(&server)
            .await;

        let client = NventClient::new(&server.uri()).unwrap();
        let started = client
            .start_flow("orders", &serde_json::json!({"x": 1}))
            .await
            .unwrap();
        assert_eq!(started.flow_id, "abc");
    }

    #[tokio::test]
    async fn server_errors_retry_then_surface() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/_flows/orders/runs"))
            .respond_with(
                ResponseTemplate::new(500).set_body_json(serde_json::json!({"error": "boom"})),
            )
            .expect(4) // initial try + 3 retries
            .mount(&server)
            .await;

        let mut config = ClientConfig::new(Url::parse(&server.uri()).unwrap());
        config.retry.initial_backoff = std::time::Duration::from_millis(1);
        let client = NventClient::with_config(config).unwrap();

        let err = client.list_runs("orders", 0, 10).await.unwrap_err();
        match err {
            NventError::Api { status, message } => {
                assert_eq!(status, 500);
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn client_errors_do_not_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/_flows/missing/runs"))
            .respond_with(
                ResponseTemplate::new(404)
                    .set_body_json(serde_json::json!({"error": "unknown flow: missing"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = NventClient::new(&server.uri()).unwrap();
        let err = client.list_runs("missing", 0, 10).await.unwrap_err();
        assert!(matches!(err, NventError::Api { status: 404, .. }));
    }
}
