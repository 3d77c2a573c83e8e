// estuary - wavefront-compatible telemetry ingestion proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::model::{EntityType, SourceOperationType, SourceTagAction, SourceTagOp};
use async_trait::async_trait;
use bytes::Bytes;
use estuary_common::duration::DurationExt;
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use time::Duration;
use time::ext::NumericalDuration;
use uuid::Uuid;

//
// ApiError
//

// Transport-level failures. HTTP responses, including errors, surface as status codes so the
// caller can apply the retry taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
  #[error("transport error: {0}")]
  Transport(String),
  #[error("request timeout")]
  Timeout,
}

pub type ApiResult<T> = Result<T, ApiError>;

//
// AgentConfiguration
//

// Dynamic configuration returned by the backend on each check-in. Every field is optional so a
// minimal response leaves local settings untouched.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfiguration {
  pub current_time: Option<u64>,
  pub shut_off_agents: bool,
  pub collector_rate_limit: Option<f64>,
  pub histogram_rate_limit: Option<f64>,
  pub span_rate_limit: Option<f64>,
  pub span_logs_rate_limit: Option<f64>,
  pub points_per_batch: Option<u32>,
  pub histograms_per_batch: Option<u32>,
  pub spans_per_batch: Option<u32>,
  pub span_logs_per_batch: Option<u32>,
  pub retry_backoff_base_seconds: Option<f64>,
  pub split_push_when_rate_limited: Option<bool>,
  pub histogram_disabled: Option<bool>,
  pub trace_disabled: Option<bool>,
  pub span_logs_disabled: Option<bool>,
  pub span_sampling_rate: Option<f64>,
}

//
// CheckinRequest
//

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckinRequest {
  pub proxy_id: Uuid,
  pub hostname: String,
  pub version: String,
  pub current_millis: u64,
  pub metrics: serde_json::Value,
  pub ephemeral: bool,
}

// A completed check-in exchange: the HTTP status plus the parsed configuration on success.
#[derive(Debug)]
pub struct CheckinResponse {
  pub status: StatusCode,
  pub config: Option<AgentConfiguration>,
}

//
// BackendApi
//

// The backend surface the proxy consumes. Mocked in tests so no sender or check-in test touches
// the network.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BackendApi: Send + Sync {
  // Submit a batch of serialized items for an entity type. Returns the response status.
  async fn report(&self, entity_type: EntityType, body: Bytes) -> ApiResult<StatusCode>;

  // Apply a source tag operation. Idempotent on the backend side.
  async fn source_tag(&self, op: &SourceTagOp) -> ApiResult<StatusCode>;

  async fn checkin(&self, request: CheckinRequest) -> ApiResult<CheckinResponse>;

  // Swap the base URL, used when check-in detects a missing /api suffix.
  fn set_base_url(&self, base_url: String);
}

//
// HyperBackendApi
//

fn make_tls_connector(connect_timeout: Duration) -> HttpsConnector<HttpConnector> {
  let mut connector = HttpConnector::new();
  connector.set_connect_timeout(Some(connect_timeout.unsigned()));
  connector.enforce_http(false);

  HttpsConnectorBuilder::new()
    .with_native_roots()
    .unwrap()
    .https_or_http()
    .enable_http1()
    .wrap_connector(connector)
}

pub struct HyperBackendApi {
  client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
  base_url: RwLock<String>,
  token: String,
  request_timeout: Duration,
}

impl HyperBackendApi {
  #[must_use]
  pub fn new(base_url: String, token: String, request_timeout: Duration) -> Self {
    Self {
      client: Client::builder(TokioExecutor::new()).build(make_tls_connector(250.milliseconds())),
      base_url: RwLock::new(base_url.trim_end_matches('/').to_string()),
      token,
      request_timeout,
    }
  }

  fn url(&self, path: &str) -> String {
    format!("{}{path}", self.base_url.read())
  }

  async fn execute(
    &self,
    method: Method,
    url: String,
    content_type: &str,
    body: Bytes,
  ) -> ApiResult<(StatusCode, Bytes)> {
    let request = Request::builder()
      .method(method)
      .uri(url)
      .header("content-type", content_type)
      .header("authorization", format!("Bearer {}", self.token))
      .body(Full::new(body))
      .map_err(|e| ApiError::Transport(e.to_string()))?;

    let Ok(result) = self
      .request_timeout
      .timeout(self.client.request(request))
      .await
    else {
      return Err(ApiError::Timeout);
    };
    let response = result.map_err(|e| ApiError::Transport(e.to_string()))?;
    let status = response.status();
    let body = response
      .into_body()
      .collect()
      .await
      .map(http_body_util::Collected::to_bytes)
      .unwrap_or_default();
    Ok((status, body))
  }

  const fn report_format(entity_type: EntityType) -> (&'static str, &'static str) {
    match entity_type {
      EntityType::Point | EntityType::DeltaCounter => ("wavefront", "text/plain"),
      EntityType::Histogram => ("histogram", "text/plain"),
      EntityType::Span => ("trace", "text/plain"),
      EntityType::SpanLogs => ("spanLogs", "application/json"),
      // Source tags never go through the batched report path.
      EntityType::SourceTag => ("sourceTag", "application/json"),
    }
  }
}

#[async_trait]
impl BackendApi for HyperBackendApi {
  async fn report(&self, entity_type: EntityType, body: Bytes) -> ApiResult<StatusCode> {
    let (format, content_type) = Self::report_format(entity_type);
    let (status, _) = self
      .execute(
        Method::POST,
        self.url(&format!("/report?f={format}")),
        content_type,
        body,
      )
      .await?;
    Ok(status)
  }

  async fn source_tag(&self, op: &SourceTagOp) -> ApiResult<StatusCode> {
    let (method, url, body) = match (op.op, op.action) {
      (SourceOperationType::SourceDescription, SourceTagAction::Delete) => (
        Method::DELETE,
        self.url(&format!("/source/{}/description", op.source)),
        Bytes::new(),
      ),
      (SourceOperationType::SourceDescription, _) => (
        Method::POST,
        self.url(&format!("/source/{}/description", op.source)),
        Bytes::from(op.annotations.first().cloned().unwrap_or_default()),
      ),
      (SourceOperationType::SourceTag, SourceTagAction::Add) => (
        Method::PUT,
        self.url(&format!(
          "/source/{}/tag/{}",
          op.source,
          op.annotations.first().cloned().unwrap_or_default()
        )),
        Bytes::new(),
      ),
      (SourceOperationType::SourceTag, SourceTagAction::Delete) => (
        Method::DELETE,
        self.url(&format!(
          "/source/{}/tag/{}",
          op.source,
          op.annotations.first().cloned().unwrap_or_default()
        )),
        Bytes::new(),
      ),
      (SourceOperationType::SourceTag, SourceTagAction::Save) => (
        Method::POST,
        self.url(&format!("/source/{}/tags", op.source)),
        Bytes::from(serde_json::to_vec(&op.annotations).unwrap_or_default()),
      ),
    };
    let (status, _) = self.execute(method, url, "application/json", body).await?;
    Ok(status)
  }

  async fn checkin(&self, request: CheckinRequest) -> ApiResult<CheckinResponse> {
    let body = serde_json::to_vec(&request).map_err(|e| ApiError::Transport(e.to_string()))?;
    let (status, body) = self
      .execute(
        Method::POST,
        self.url(&format!("/daemon/{}/checkin", request.proxy_id)),
        "application/json",
        Bytes::from(body),
      )
      .await?;
    let config = if status.is_success() {
      serde_json::from_slice(&body).ok()
    } else {
      None
    };
    Ok(CheckinResponse { status, config })
  }

  fn set_base_url(&self, base_url: String) {
    *self.base_url.write() = base_url.trim_end_matches('/').to_string();
  }
}
