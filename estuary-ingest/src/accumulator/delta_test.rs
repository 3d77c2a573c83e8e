// estuary - wavefront-compatible telemetry ingestion proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::DeltaAccumulator;
use crate::api::MockBackendApi;
use crate::model::{EntityType, HostMetricTagsPair};
use crate::test::{TEST_NOW_MS, make_pipeline, make_point};
use http::StatusCode;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use time::ext::NumericalDuration;

fn delta_pair() -> HostMetricTagsPair {
  let mut point = make_point("\u{2206}my.ctr", "web-1", TEST_NOW_MS, 0.0);
  point
    .annotations
    .insert("env".to_string(), "prod".to_string());
  HostMetricTagsPair::of(&point)
}

#[tokio::test(start_paused = true)]
async fn deltas_accumulate_into_one_emission() {
  let bodies = Arc::new(Mutex::new(vec![]));
  let cloned_bodies = bodies.clone();
  let mut api = MockBackendApi::new();
  api.expect_report().times(1).returning(move |_, body| {
    cloned_bodies
      .lock()
      .push(String::from_utf8(body.to_vec()).unwrap());
    Ok(StatusCode::ACCEPTED)
  });
  let harness = make_pipeline(EntityType::DeltaCounter, api, |_| {});
  let accumulator = DeltaAccumulator::new(
    60.seconds(),
    harness.pool.clone(),
    &harness.scope,
    harness.clock.clone(),
  );

  for value in 1..=5 {
    accumulator.add(delta_pair(), f64::from(value));
  }
  accumulator.flush();

  // One submission per flush window carrying the sum.
  assert_eq!(1, harness.pool.total_buffered());
  harness.pool.flush_all().await;
  let bodies = bodies.lock();
  assert_eq!(1, bodies.len());
  assert!(
    bodies[0].contains("\"\u{2206}my.ctr\" 15 "),
    "unexpected line: {}",
    bodies[0]
  );
  assert!(bodies[0].contains("source=\"web-1\""));
  assert!(bodies[0].contains("\"env\"=\"prod\""));
}

#[tokio::test(start_paused = true)]
async fn cell_reads_zero_after_emission() {
  let api = MockBackendApi::new();
  let harness = make_pipeline(EntityType::DeltaCounter, api, |_| {});
  let accumulator = DeltaAccumulator::new(
    60.seconds(),
    harness.pool.clone(),
    &harness.scope,
    harness.clock.clone(),
  );

  accumulator.add(delta_pair(), 3.0);
  accumulator.flush();
  assert_eq!(1, harness.pool.total_buffered());

  // A second flush with no new deltas emits nothing: the cell was reset to zero.
  accumulator.flush();
  assert_eq!(1, harness.pool.total_buffered());
}

#[tokio::test(start_paused = true)]
async fn idle_cells_evict_after_ttl_and_emit_residue() {
  let api = MockBackendApi::new();
  let harness = make_pipeline(EntityType::DeltaCounter, api, |_| {});
  let accumulator = DeltaAccumulator::new(
    60.seconds(),
    harness.pool.clone(),
    &harness.scope,
    harness.clock.clone(),
  );

  accumulator.add(delta_pair(), 2.0);
  // Jump past the idle TTL (5 aggregation intervals). The flush pass emits the pending value
  // and the eviction pass removes the cell.
  harness.clock.pin_for_test(TEST_NOW_MS + 6 * 60 * 1000);
  accumulator.flush();
  assert_eq!(1, harness.pool.total_buffered());

  // The cell is gone; nothing further is emitted.
  accumulator.flush();
  assert_eq!(1, harness.pool.total_buffered());
}
