// estuary - wavefront-compatible telemetry ingestion proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::HandlerCommon;
use crate::accumulator::HistogramAccumulator;
use crate::clock::Clock;
use crate::model::{Point, PointValue};
use crate::preprocessor::Preprocessor;
use crate::validation::{ValidationConfig, validate_point};
use estuary_common::stats::Scope;
use prometheus::{Histogram, IntCounter};
use std::sync::Arc;

struct Stats {
  sample_added: IntCounter,
  histogram_added: IntCounter,
  histogram_rejected: IntCounter,
  histogram_bins: Histogram,
  histogram_samples: Histogram,
}

//
// HistogramHandler
//

// Routes numeric samples and incoming distributions into the digest accumulator at the port's
// granularity. Distributions coarser than the port granularity are rejected.
pub struct HistogramHandler {
  common: Arc<HandlerCommon>,
  validation: ValidationConfig,
  preprocessor: Option<Arc<Preprocessor>>,
  accumulator: Arc<HistogramAccumulator>,
  clock: Clock,
  stats: Stats,
}

impl HistogramHandler {
  #[must_use]
  pub fn new(
    common: Arc<HandlerCommon>,
    validation: ValidationConfig,
    preprocessor: Option<Arc<Preprocessor>>,
    accumulator: Arc<HistogramAccumulator>,
    scope: &Scope,
    clock: Clock,
  ) -> Arc<Self> {
    Arc::new(Self {
      common,
      validation,
      preprocessor,
      accumulator,
      clock,
      stats: Stats {
        sample_added: scope.counter("sample_added"),
        histogram_added: scope.counter("histogram_added"),
        histogram_rejected: scope.counter("histogram_rejected"),
        histogram_bins: scope.histogram("histogram_bins"),
        histogram_samples: scope.histogram("histogram_samples"),
      },
    })
  }

  pub fn report(&self, mut point: Point) {
    if let Some(preprocessor) = &self.preprocessor {
      preprocessor.preprocess_point(&mut point);
    }
    let now_ms = self.clock.now_ms();
    if let Err(e) = validate_point(&point, &self.validation, now_ms) {
      self.reject(Some(&point), Some(&e.to_string()));
      return;
    }
    match &point.value {
      PointValue::Number(value) => {
        let value = *value;
        self.accumulator.put_sample(&point, value);
        self.stats.sample_added.inc();
      },
      PointValue::Distribution(histogram) => {
        // Compare raw durations: the three-way granularity quantization would let a multi-day
        // distribution through on a day-granularity port.
        if histogram.duration_ms > self.accumulator.granularity().duration_ms() {
          self.stats.histogram_rejected.inc();
          self.reject(
            Some(&point),
            Some("attempting to send a coarser granularity distribution to a finer granularity port"),
          );
          return;
        }
        #[allow(clippy::cast_precision_loss)]
        {
          self
            .stats
            .histogram_bins
            .observe(histogram.centroids.len() as f64);
          self
            .stats
            .histogram_samples
            .observe(histogram.sample_count() as f64);
        }
        let histogram = histogram.clone();
        self.accumulator.put_distribution(&point, &histogram);
        self.stats.histogram_added.inc();
      },
    }
    self.common.observe_lag(now_ms, point.timestamp_ms);
    self.common.metrics.received.inc();
  }

  pub fn reject(&self, item: Option<&Point>, reason: Option<&str>) {
    self.common.reject(item.map(Point::to_line), reason);
  }

  pub fn block(&self, item: Option<&Point>, reason: Option<&str>) {
    self.common.block(item.map(Point::to_line), reason);
  }

  #[must_use]
  pub fn common(&self) -> &Arc<HandlerCommon> {
    &self.common
  }
}
