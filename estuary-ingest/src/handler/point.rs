// estuary - wavefront-compatible telemetry ingestion proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::HandlerCommon;
use crate::clock::Clock;
use crate::model::Point;
use crate::preprocessor::Preprocessor;
use crate::sender::SenderTaskPool;
use crate::validation::{ValidationConfig, validate_point};
use std::sync::Arc;

//
// PointHandler
//

// Validates incoming points and hands them to the sender pool. Delta-prefixed metrics do not
// belong on a plain point port and are rejected.
pub struct PointHandler {
  common: Arc<HandlerCommon>,
  validation: ValidationConfig,
  preprocessor: Option<Arc<Preprocessor>>,
  pool: Arc<SenderTaskPool>,
  clock: Clock,
}

impl PointHandler {
  #[must_use]
  pub fn new(
    common: Arc<HandlerCommon>,
    validation: ValidationConfig,
    preprocessor: Option<Arc<Preprocessor>>,
    pool: Arc<SenderTaskPool>,
    clock: Clock,
  ) -> Arc<Self> {
    Arc::new(Self {
      common,
      validation,
      preprocessor,
      pool,
      clock,
    })
  }

  pub fn report(&self, mut point: Point) {
    if let Some(preprocessor) = &self.preprocessor {
      preprocessor.preprocess_point(&mut point);
    }
    if point.is_delta() {
      self.reject(
        Some(&point),
        Some("port is not configured to accept delta counter data"),
      );
      return;
    }
    let now_ms = self.clock.now_ms();
    if let Err(e) = validate_point(&point, &self.validation, now_ms) {
      self.reject(Some(&point), Some(&e.to_string()));
      return;
    }
    self.common.observe_lag(now_ms, point.timestamp_ms);
    self.pool.submit_line(point.to_line());
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
