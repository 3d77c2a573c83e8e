// estuary - wavefront-compatible telemetry ingestion proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::Collector;
use super::test::Helper;
use pretty_assertions::assert_eq;
use prometheus::labels;
use std::collections::HashMap;

#[test]
fn scoped_names_and_dedup() {
  let collector = Collector::default();
  let scope = collector.scope("proxy").scope("points");
  let counter = scope.counter("received");
  counter.inc_by(3);

  // Asking for the same metric again must return the same series.
  scope.counter("received").inc();

  let helper = Helper::new(collector);
  helper.assert_counter_eq(4, "proxy:points:received", &labels! {});
}

#[test]
fn labeled_counters_are_distinct_series() {
  let collector = Collector::default();
  let scope = collector.scope("queue");
  scope
    .counter_with_labels(
      "queued",
      HashMap::from([("reason".to_string(), "bufferSize".to_string())]),
    )
    .inc_by(2);
  scope
    .counter_with_labels(
      "queued",
      HashMap::from([("reason".to_string(), "rateLimit".to_string())]),
    )
    .inc();

  let helper = Helper::new(collector);
  helper.assert_counter_eq(2, "queue:queued", &labels! {"reason" => "bufferSize"});
  helper.assert_counter_eq(1, "queue:queued", &labels! {"reason" => "rateLimit"});
}

#[test]
fn names_are_sanitized_for_prometheus() {
  let collector = Collector::default();
  // Handler keys contain dots and lead with digits once split; both must map to legal names.
  let scope = collector.scope("points.2878");
  scope.counter("received").inc();
  let helper = Helper::new(collector);
  helper.assert_counter_eq(1, "points_2878:received", &labels! {});
}

#[test]
fn snapshot_contains_counters_and_histograms() {
  let collector = Collector::default();
  let scope = collector.scope("proxy");
  scope.counter("received").inc_by(5);
  scope.gauge("buffer").set(7);
  scope.histogram("lag").observe(0.25);

  let snapshot = collector.snapshot_json();
  assert_eq!(5.0, snapshot["proxy:received"].as_f64().unwrap());
  assert_eq!(7.0, snapshot["proxy:buffer"].as_f64().unwrap());
  assert_eq!(1, snapshot["proxy:lag.count"].as_u64().unwrap());
  assert_eq!(0.25, snapshot["proxy:lag.sum"].as_f64().unwrap());
}
