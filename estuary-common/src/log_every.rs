// estuary - wavefront-compatible telemetry ingestion proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./log_every_test.rs"]
mod log_every_test;

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

fn process_start() -> Instant {
  static START: OnceLock<Instant> = OnceLock::new();
  *START.get_or_init(Instant::now)
}

//
// RateGate
//

// Callsite state for warn_every!. Admits the first call and then at most one call per interval.
pub struct RateGate {
  last_ms: AtomicU64,
}

impl RateGate {
  #[must_use]
  pub const fn new() -> Self {
    Self {
      last_ms: AtomicU64::new(u64::MAX),
    }
  }

  pub fn should_log(&self, interval: time::Duration) -> bool {
    let now_ms = u64::try_from(process_start().elapsed().as_millis()).unwrap_or(u64::MAX - 1);
    let interval_ms = u64::try_from(interval.whole_milliseconds().max(0)).unwrap_or(u64::MAX);
    let last = self.last_ms.load(Ordering::Relaxed);
    if last != u64::MAX && now_ms.saturating_sub(last) < interval_ms {
      return false;
    }
    self
      .last_ms
      .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
      .is_ok()
  }
}

impl Default for RateGate {
  fn default() -> Self {
    Self::new()
  }
}

// Log a warning at most once per interval per callsite.
#[macro_export]
macro_rules! warn_every {
  ($interval:expr, $($arg:tt)+) => {{
    static GATE: $crate::log_every::RateGate = $crate::log_every::RateGate::new();
    if GATE.should_log($interval) {
      ::log::warn!($($arg)+);
    }
  }};
}
