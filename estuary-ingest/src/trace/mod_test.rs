// estuary - wavefront-compatible telemetry ingestion proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::{RateSampler, SpanFanIn};
use crate::api::MockBackendApi;
use crate::handler::SpanHandler;
use crate::model::{Annotation, EntityType};
use crate::test::{PipelineHarness, TEST_NOW_MS, make_pipeline, make_span};
use crate::validation::ValidationConfig;
use estuary_common::stats::test::Helper;
use pretty_assertions::assert_eq;
use prometheus::labels;
use std::sync::Arc;

struct FanInHarness {
  fan_in: Arc<SpanFanIn>,
  spans: PipelineHarness,
  points: PipelineHarness,
}

fn make_fan_in(rate: f64, always_sample_errors: bool) -> FanInHarness {
  let spans = make_pipeline(EntityType::Span, MockBackendApi::new(), |_| {});
  let points = make_pipeline(EntityType::Point, MockBackendApi::new(), |_| {});
  let span_handler = SpanHandler::new(
    spans.common.clone(),
    ValidationConfig::default(),
    spans.pool.clone(),
    spans.clock.clone(),
  );
  let fan_in = SpanFanIn::new(
    None,
    Arc::new(RateSampler::new(rate)),
    always_sample_errors,
    span_handler,
    None,
    points.pool.clone(),
    &spans.scope,
    spans.clock.clone(),
  );
  FanInHarness {
    fan_in,
    spans,
    points,
  }
}

#[tokio::test(start_paused = true)]
async fn error_spans_bypass_a_zero_sampler() {
  let harness = make_fan_in(0.0, true);

  for i in 0..10 {
    let mut span = make_span("op", "web-1", TEST_NOW_MS, 10);
    span.trace_id = format!("trace-{i}");
    if i < 3 {
      span.annotations.push(Annotation::new("error", "true"));
    }
    harness.fan_in.ingest(span, None);
  }

  // Three error spans forwarded; RED metrics accrue for all ten.
  assert_eq!(3, harness.spans.metrics.received.get());
  let helper = Helper::new(harness.spans.collector.clone());
  helper.assert_counter_eq(
    10,
    "spans_2878:traces:derived_requests",
    &labels! {
      "application" => "shop",
      "service" => "cart",
      "cluster" => "cart",
      "shard" => "none",
      "component" => "none",
      "source" => "web-1",
    },
  );
  helper.assert_counter_eq(
    3,
    "spans_2878:traces:derived_errors",
    &labels! {
      "application" => "shop",
      "service" => "cart",
      "cluster" => "cart",
      "shard" => "none",
      "component" => "none",
      "source" => "web-1",
    },
  );
}

#[tokio::test(start_paused = true)]
async fn missing_identity_discards_without_red() {
  let harness = make_fan_in(1.0, false);

  let mut span = make_span("op", "web-1", TEST_NOW_MS, 10);
  span.annotations.retain(|a| a.key != "service");
  harness.fan_in.ingest(span, None);

  assert_eq!(0, harness.spans.metrics.received.get());
  assert_eq!(0, harness.fan_in.heartbeat_count());
}

#[tokio::test(start_paused = true)]
async fn explicit_cluster_tag_overwrites_service_seed() {
  let harness = make_fan_in(1.0, false);

  let mut span = make_span("op", "web-1", TEST_NOW_MS, 10);
  span.annotations.push(Annotation::new("cluster", "us-west"));
  harness.fan_in.ingest(span, None);

  let helper = Helper::new(harness.spans.collector.clone());
  helper.assert_counter_eq(
    1,
    "spans_2878:traces:derived_requests",
    &labels! {
      "application" => "shop",
      "service" => "cart",
      "cluster" => "us-west",
      "shard" => "none",
      "component" => "none",
      "source" => "web-1",
    },
  );
}

#[tokio::test(start_paused = true)]
async fn heartbeats_emit_per_tuple_and_expire() {
  let harness = make_fan_in(1.0, false);

  harness
    .fan_in
    .ingest(make_span("op", "web-1", TEST_NOW_MS, 10), None);
  assert_eq!(1, harness.fan_in.heartbeat_count());

  harness.fan_in.emit_heartbeats();
  assert_eq!(1, harness.points.pool.total_buffered());

  // Past the TTL the tuple expires and stops emitting.
  harness.spans.clock.pin_for_test(TEST_NOW_MS + 11 * 60 * 1000);
  harness.fan_in.emit_heartbeats();
  assert_eq!(0, harness.fan_in.heartbeat_count());
  assert_eq!(1, harness.points.pool.total_buffered());
}

#[tokio::test(start_paused = true)]
async fn unsampled_spans_count_by_sampler() {
  let harness = make_fan_in(0.0, false);
  harness
    .fan_in
    .ingest(make_span("op", "web-1", TEST_NOW_MS, 10), None);
  assert_eq!(0, harness.spans.metrics.received.get());
  let helper = Helper::new(harness.spans.collector.clone());
  helper.assert_counter_eq(1, "spans_2878:traces:sampler_discarded", &labels! {});
}
