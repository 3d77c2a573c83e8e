// estuary - wavefront-compatible telemetry ingestion proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::HandlerCommon;
use crate::clock::Clock;
use crate::model::{Span, SpanLogs};
use crate::sender::SenderTaskPool;
use crate::validation::{ValidationConfig, validate_span};
use std::sync::Arc;

//
// SpanHandler
//

// Validates sampled spans and forwards them as span lines. Preprocessing happens upstream in
// the trace fan-in, before the sampling decision.
pub struct SpanHandler {
  common: Arc<HandlerCommon>,
  validation: ValidationConfig,
  pool: Arc<SenderTaskPool>,
  clock: Clock,
}

impl SpanHandler {
  #[must_use]
  pub fn new(
    common: Arc<HandlerCommon>,
    validation: ValidationConfig,
    pool: Arc<SenderTaskPool>,
    clock: Clock,
  ) -> Arc<Self> {
    Arc::new(Self {
      common,
      validation,
      pool,
      clock,
    })
  }

  pub fn report(&self, span: Span) {
    let now_ms = self.clock.now_ms();
    if let Err(e) = validate_span(&span, &self.validation, now_ms) {
      self.reject(Some(&span), Some(&e.to_string()));
      return;
    }
    self.common.observe_lag(now_ms, span.start_ms);
    self.pool.submit_line(span.to_line());
    self.common.metrics.received.inc();
  }

  pub fn reject(&self, item: Option<&Span>, reason: Option<&str>) {
    self.common.reject(item.map(Span::to_line), reason);
  }

  pub fn block(&self, item: Option<&Span>, reason: Option<&str>) {
    self.common.block(item.map(Span::to_line), reason);
  }

  #[must_use]
  pub fn common(&self) -> &Arc<HandlerCommon> {
    &self.common
  }
}

//
// SpanLogsHandler
//

// Span logs ship as one JSON document per span. Logs for spans that were not forwarded are
// dropped by the fan-in before they get here.
pub struct SpanLogsHandler {
  common: Arc<HandlerCommon>,
  pool: Arc<SenderTaskPool>,
}

impl SpanLogsHandler {
  #[must_use]
  pub fn new(common: Arc<HandlerCommon>, pool: Arc<SenderTaskPool>) -> Arc<Self> {
    Arc::new(Self { common, pool })
  }

  pub fn report(&self, span_logs: SpanLogs) {
    if span_logs.trace_id.is_empty() || span_logs.span_id.is_empty() {
      self.reject(Some(&span_logs), Some("span logs are missing trace or span id"));
      return;
    }
    self.pool.submit_line(span_logs.to_line());
    self.common.metrics.received.inc();
  }

  pub fn reject(&self, item: Option<&SpanLogs>, reason: Option<&str>) {
    self.common.reject(item.map(SpanLogs::to_line), reason);
  }

  pub fn block(&self, item: Option<&SpanLogs>, reason: Option<&str>) {
    self.common.block(item.map(SpanLogs::to_line), reason);
  }

  #[must_use]
  pub fn common(&self) -> &Arc<HandlerCommon> {
    &self.common
  }
}
