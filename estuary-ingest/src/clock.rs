// estuary - wavefront-compatible telemetry ingestion proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

//
// Clock
//

// The proxy's logical wall clock. The backend may rebase it at check-in time so that emitted
// timestamps line up with the server view. Tests pin it to a fixed value.
#[derive(Clone)]
pub struct Clock {
  offset_ms: Arc<AtomicI64>,
  fixed_ms: Arc<AtomicI64>,
}

impl Default for Clock {
  fn default() -> Self {
    Self {
      offset_ms: Arc::new(AtomicI64::new(0)),
      fixed_ms: Arc::new(AtomicI64::new(-1)),
    }
  }
}

impl Clock {
  #[must_use]
  pub fn now_ms(&self) -> u64 {
    let fixed = self.fixed_ms.load(Ordering::Relaxed);
    if fixed >= 0 {
      #[allow(clippy::cast_sign_loss)]
      return fixed as u64;
    }
    let system_ms = i64::try_from(
      SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis(),
    )
    .unwrap_or(i64::MAX);
    let adjusted = system_ms.saturating_add(self.offset_ms.load(Ordering::Relaxed));
    u64::try_from(adjusted).unwrap_or(0)
  }

  // Rebase so that now_ms() tracks the provided server time.
  pub fn rebase(&self, server_now_ms: u64) {
    let system_ms = i64::try_from(
      SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis(),
    )
    .unwrap_or(i64::MAX);
    let server_ms = i64::try_from(server_now_ms).unwrap_or(i64::MAX);
    self
      .offset_ms
      .store(server_ms.saturating_sub(system_ms), Ordering::Relaxed);
  }

  pub fn pin_for_test(&self, now_ms: u64) {
    self
      .fixed_ms
      .store(i64::try_from(now_ms).unwrap_or(i64::MAX), Ordering::Relaxed);
  }
}

impl std::fmt::Debug for Clock {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Clock").field("now_ms", &self.now_ms()).finish()
  }
}
