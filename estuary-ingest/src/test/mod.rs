// estuary - wavefront-compatible telemetry ingestion proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::api::MockBackendApi;
use crate::clock::Clock;
use crate::handler::{HandlerCommon, HandlerMetrics};
use crate::model::{Annotation, EntityType, HandlerKey, Point, PointValue, Span};
use crate::queue::FileTaskQueue;
use crate::sender::{EntityProperties, EntityPropertiesConfig, SenderTaskPool};
use estuary_common::stats::{Collector, Scope};
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;

pub const TEST_NOW_MS: u64 = 1_700_000_000_000;

#[must_use]
pub fn make_point(metric: &str, source: &str, timestamp_ms: u64, value: f64) -> Point {
  Point {
    metric: metric.to_string(),
    source: source.to_string(),
    timestamp_ms,
    value: PointValue::Number(value),
    annotations: BTreeMap::new(),
  }
}

#[must_use]
pub fn make_span(name: &str, source: &str, start_ms: u64, duration_ms: u64) -> Span {
  Span {
    name: name.to_string(),
    source: source.to_string(),
    trace_id: "7b3bf470-9456-11e8-9eb6-529269fb1459".to_string(),
    span_id: "0313bafe-9457-11e8-9eb6-529269fb1459".to_string(),
    parents: vec![],
    follows_from: vec![],
    start_ms,
    duration_ms,
    annotations: vec![
      Annotation::new("application", "shop"),
      Annotation::new("service", "cart"),
    ],
  }
}

#[must_use]
pub fn pinned_clock() -> Clock {
  let clock = Clock::default();
  clock.pin_for_test(TEST_NOW_MS);
  clock
}

// Everything a sender/handler test needs wired together against a mock API and a real file
// queue in a temp dir.
pub struct PipelineHarness {
  pub collector: Collector,
  pub scope: Scope,
  pub key: HandlerKey,
  pub props: Arc<EntityProperties>,
  pub metrics: Arc<HandlerMetrics>,
  pub common: Arc<HandlerCommon>,
  pub pool: Arc<SenderTaskPool>,
  pub queue: Arc<FileTaskQueue>,
  pub clock: Clock,
  pub spool_dir: TempDir,
}

pub fn make_pipeline(
  entity_type: EntityType,
  api: MockBackendApi,
  mutate_config: impl FnOnce(&mut EntityPropertiesConfig),
) -> PipelineHarness {
  let collector = Collector::default();
  let key = HandlerKey::new(entity_type, "2878");
  let scope = collector.scope(&key.to_string());
  let mut config = EntityPropertiesConfig::defaults_for(entity_type);
  mutate_config(&mut config);
  let props = EntityProperties::new(config);
  let metrics = HandlerMetrics::new(&scope);
  let common = HandlerCommon::new(key.clone(), 10, metrics.clone(), &scope);
  let spool_dir = TempDir::new().unwrap();
  let queue = Arc::new(FileTaskQueue::open(spool_dir.path(), &scope).unwrap());
  let clock = pinned_clock();
  let pool = SenderTaskPool::new(
    key.clone(),
    1,
    Arc::new(api),
    props.clone(),
    metrics.clone(),
    queue.clone(),
    &scope,
    clock.clone(),
  );
  PipelineHarness {
    collector,
    scope,
    key,
    props,
    metrics,
    common,
    pool,
    queue,
    clock,
    spool_dir,
  }
}
