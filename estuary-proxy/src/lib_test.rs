// estuary - wavefront-compatible telemetry ingestion proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::{EXIT_OK, Proxy, run_server};
use crate::config::ProxyConfig;
use estuary_common::stats::Collector;
use estuary_ingest::api::{ApiResult, BackendApi, CheckinRequest, CheckinResponse};
use estuary_ingest::clock::Clock;
use estuary_ingest::handler::AnyHandler;
use estuary_ingest::model::{EntityType, HandlerKey, SourceTagOp};
use http::StatusCode;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tempfile::TempDir;

// A benign stand-in backend so pipeline wiring tests never touch the network.
struct StubApi;

#[async_trait::async_trait]
impl BackendApi for StubApi {
  async fn report(&self, _entity_type: EntityType, _body: bytes::Bytes) -> ApiResult<StatusCode> {
    Ok(StatusCode::ACCEPTED)
  }

  async fn source_tag(&self, _op: &SourceTagOp) -> ApiResult<StatusCode> {
    Ok(StatusCode::OK)
  }

  async fn checkin(&self, _request: CheckinRequest) -> ApiResult<CheckinResponse> {
    Ok(CheckinResponse {
      status: StatusCode::OK,
      config: None,
    })
  }

  fn set_base_url(&self, _base_url: String) {}
}

fn make_config(spool_dir: &TempDir) -> ProxyConfig {
  serde_yaml::from_str(&format!(
    r#"
server: https://host/api
token: t
spool_dir: {}
listeners:
  points: ["2878"]
  delta_counters: ["2879"]
  histograms:
    - handle: "40001"
      granularity: minute
  spans: ["30001"]
  source_tags: ["4878"]
"#,
    spool_dir.path().display()
  ))
  .unwrap()
}

#[tokio::test]
async fn wiring_provisions_one_entry_per_handler_key() {
  let spool_dir = TempDir::new().unwrap();
  let collector = Collector::default();
  let scope = collector.scope("proxy");
  let proxy = Proxy::new_with_api(
    make_config(&spool_dir),
    collector,
    scope,
    Arc::new(StubApi),
    Clock::default(),
  )
  .unwrap();

  let mut keys = proxy.registry.keys();
  keys.sort_by_key(ToString::to_string);
  assert_eq!(5, keys.len());
  assert!(
    proxy
      .registry
      .get(&HandlerKey::new(EntityType::Point, "2878"))
      .is_some()
  );
  assert!(proxy.fan_in.is_some());

  // Spool directories exist per handler key.
  assert!(spool_dir.path().join("points.2878").is_dir());
  assert!(spool_dir.path().join("spans.30001").is_dir());

  proxy.shutdown().await;
}

#[tokio::test]
async fn report_flows_through_the_wired_pipeline() {
  let spool_dir = TempDir::new().unwrap();
  let collector = Collector::default();
  let scope = collector.scope("proxy");
  let proxy = Proxy::new_with_api(
    make_config(&spool_dir),
    collector,
    scope,
    Arc::new(StubApi),
    Clock::default(),
  )
  .unwrap();

  let entry = proxy
    .registry
    .get(&HandlerKey::new(EntityType::Point, "2878"))
    .unwrap();
  let AnyHandler::Point(handler) = &entry.handler else {
    panic!("expected a point handler");
  };
  let now_ms = u64::try_from(time::OffsetDateTime::now_utc().unix_timestamp()).unwrap() * 1000;
  handler.report(estuary_ingest::model::Point {
    metric: "requests.count".to_string(),
    source: "web-1".to_string(),
    timestamp_ms: now_ms,
    value: estuary_ingest::model::PointValue::Number(1.0),
    annotations: std::collections::BTreeMap::new(),
  });
  assert_eq!(1, entry.pool.total_buffered());

  proxy.shutdown().await;
}

#[tokio::test]
async fn config_check_exits_clean_without_checkin() {
  let spool_dir = TempDir::new().unwrap();
  let exit = run_server(make_config(&spool_dir), true, std::future::pending())
    .await
    .unwrap();
  assert_eq!(EXIT_OK, exit);
}
