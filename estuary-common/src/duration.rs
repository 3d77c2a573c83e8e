// estuary - wavefront-compatible telemetry ingestion proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use std::future::Future;
use time::Duration;
use tokio::time::{Interval, MissedTickBehavior, Sleep, Timeout};

// Bridges time::Duration (used for all configuration) to the tokio clock.
pub trait DurationExt {
  fn sleep(&self) -> Sleep;
  fn timeout<F: Future>(&self, future: F) -> Timeout<F>;
  fn interval(&self) -> Interval;
  fn unsigned(&self) -> std::time::Duration;
}

impl DurationExt for Duration {
  fn sleep(&self) -> Sleep {
    tokio::time::sleep(self.unsigned())
  }

  fn timeout<F: Future>(&self, future: F) -> Timeout<F> {
    tokio::time::timeout(self.unsigned(), future)
  }

  // An interval that skips missed ticks rather than bursting to catch up.
  fn interval(&self) -> Interval {
    let mut interval = tokio::time::interval(self.unsigned());
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
  }

  fn unsigned(&self) -> std::time::Duration {
    self.unsigned_abs()
  }
}
