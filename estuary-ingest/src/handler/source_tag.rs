// estuary - wavefront-compatible telemetry ingestion proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::HandlerCommon;
use crate::model::SourceTagOp;
use crate::sender::{Item, SenderTaskPool};
use std::sync::Arc;

//
// SourceTagHandler
//

// Source tag mutations bypass batching; each operation becomes its own single-weight submission
// task.
pub struct SourceTagHandler {
  common: Arc<HandlerCommon>,
  pool: Arc<SenderTaskPool>,
}

impl SourceTagHandler {
  #[must_use]
  pub fn new(common: Arc<HandlerCommon>, pool: Arc<SenderTaskPool>) -> Arc<Self> {
    Arc::new(Self { common, pool })
  }

  pub fn report(&self, op: SourceTagOp) {
    if op.source.is_empty() {
      self.reject(Some(&op), Some("source tag operation is missing a source"));
      return;
    }
    if op.annotations.is_empty() && op.action != crate::model::SourceTagAction::Delete {
      self.reject(Some(&op), Some("source tag operation carries no values"));
      return;
    }
    self.pool.submit(Item::SourceTag(op));
    self.common.metrics.received.inc();
  }

  pub fn reject(&self, item: Option<&SourceTagOp>, reason: Option<&str>) {
    self.common.reject(item.map(SourceTagOp::to_line), reason);
  }

  pub fn block(&self, item: Option<&SourceTagOp>, reason: Option<&str>) {
    self.common.block(item.map(SourceTagOp::to_line), reason);
  }

  #[must_use]
  pub fn common(&self) -> &Arc<HandlerCommon> {
    &self.common
  }
}
