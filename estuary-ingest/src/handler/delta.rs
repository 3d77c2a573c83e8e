// estuary - wavefront-compatible telemetry ingestion proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::HandlerCommon;
use crate::accumulator::DeltaAccumulator;
use crate::clock::Clock;
use crate::model::{HostMetricTagsPair, Point, PointValue};
use crate::preprocessor::Preprocessor;
use crate::validation::{ValidationConfig, validate_point};
use std::sync::Arc;

//
// DeltaCounterHandler
//

// Accepts delta counter points only, folding each increment into the accumulator rather than
// forwarding it. The accumulator emits one summed point per key per aggregation window.
pub struct DeltaCounterHandler {
  common: Arc<HandlerCommon>,
  validation: ValidationConfig,
  preprocessor: Option<Arc<Preprocessor>>,
  accumulator: Arc<DeltaAccumulator>,
  clock: Clock,
}

impl DeltaCounterHandler {
  #[must_use]
  pub fn new(
    common: Arc<HandlerCommon>,
    validation: ValidationConfig,
    preprocessor: Option<Arc<Preprocessor>>,
    accumulator: Arc<DeltaAccumulator>,
    clock: Clock,
  ) -> Arc<Self> {
    Arc::new(Self {
      common,
      validation,
      preprocessor,
      accumulator,
      clock,
    })
  }

  pub fn report(&self, mut point: Point) {
    if let Some(preprocessor) = &self.preprocessor {
      preprocessor.preprocess_point(&mut point);
    }
    if !point.is_delta() {
      self.reject(
        Some(&point),
        Some("port is not configured to accept non-delta counter data"),
      );
      return;
    }
    point.normalize_delta();
    let now_ms = self.clock.now_ms();
    if let Err(e) = validate_point(&point, &self.validation, now_ms) {
      self.reject(Some(&point), Some(&e.to_string()));
      return;
    }
    let PointValue::Number(value) = point.value else {
      self.reject(Some(&point), Some("delta counters must carry numeric values"));
      return;
    };
    self.common.observe_lag(now_ms, point.timestamp_ms);
    self.accumulator.add(HostMetricTagsPair::of(&point), value);
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
