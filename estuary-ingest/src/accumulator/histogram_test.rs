// estuary - wavefront-compatible telemetry ingestion proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::{AgentDigest, Granularity, HistogramAccumulator};
use crate::api::MockBackendApi;
use crate::model::{Centroid, EntityType, HistogramValue};
use crate::test::{TEST_NOW_MS, make_pipeline, make_point};
use pretty_assertions::assert_eq;
use time::ext::NumericalDuration;

#[test]
fn granularity_mapping() {
  assert_eq!(Granularity::Minute, Granularity::from_duration_ms(60_000));
  assert_eq!(Granularity::Hour, Granularity::from_duration_ms(3_600_000));
  assert_eq!(Granularity::Day, Granularity::from_duration_ms(86_400_000));
  assert!(Granularity::Hour > Granularity::Minute);
}

#[test]
fn digest_merge_and_counts() {
  let mut digest = AgentDigest::default();
  digest.add(1.0, 2);
  digest.merge(&HistogramValue {
    duration_ms: 60_000,
    centroids: vec![
      Centroid {
        value: 1.0,
        count: 3,
      },
      Centroid {
        value: 2.5,
        count: 1,
      },
    ],
  });
  assert_eq!(6, digest.sample_count());
  let value = digest.to_value(60_000);
  assert_eq!(2, value.centroids.len());
  assert_eq!(5, value.centroids[0].count);
}

#[test]
fn digest_compression_bounds_centroids() {
  let mut digest = AgentDigest::default();
  for i in 0..1000 {
    digest.add(f64::from(i), 1);
  }
  assert_eq!(1000, digest.sample_count());
  assert!(digest.to_value(60_000).centroids.len() <= 100);
}

#[tokio::test(start_paused = true)]
async fn settled_bins_flush_once() {
  let api = MockBackendApi::new();
  let harness = make_pipeline(EntityType::Histogram, api, |_| {});
  let accumulator = HistogramAccumulator::new(
    Granularity::Minute,
    60.seconds(),
    harness.pool.clone(),
    &harness.scope,
    harness.clock.clone(),
  );

  let point = make_point("request.latency", "web-1", TEST_NOW_MS, 0.0);
  accumulator.put_sample(&point, 10.0);
  accumulator.put_sample(&point, 20.0);

  // The current bin is not settled yet.
  accumulator.flush_up_to(TEST_NOW_MS);
  assert_eq!(0, harness.pool.total_buffered());

  let bin_start = Granularity::Minute.bin_start(TEST_NOW_MS);
  accumulator.flush_up_to(bin_start + 60_001);
  assert_eq!(1, harness.pool.total_buffered());

  // The bin was cleared: flushing again emits nothing.
  accumulator.flush_up_to(bin_start + 120_000);
  assert_eq!(1, harness.pool.total_buffered());
}

#[tokio::test(start_paused = true)]
async fn distributions_merge_per_key() {
  let api = MockBackendApi::new();
  let harness = make_pipeline(EntityType::Histogram, api, |_| {});
  let accumulator = HistogramAccumulator::new(
    Granularity::Minute,
    60.seconds(),
    harness.pool.clone(),
    &harness.scope,
    harness.clock.clone(),
  );

  let point = make_point("request.latency", "web-1", TEST_NOW_MS, 0.0);
  accumulator.put_distribution(
    &point,
    &HistogramValue {
      duration_ms: 60_000,
      centroids: vec![Centroid {
        value: 1.0,
        count: 2,
      }],
    },
  );
  accumulator.put_distribution(
    &point,
    &HistogramValue {
      duration_ms: 60_000,
      centroids: vec![Centroid {
        value: 1.0,
        count: 3,
      }],
    },
  );

  let bin_start = Granularity::Minute.bin_start(TEST_NOW_MS);
  accumulator.flush_up_to(bin_start + 60_001);
  // One combined histogram for the key, merged bin-by-bin.
  assert_eq!(1, harness.pool.total_buffered());
}
