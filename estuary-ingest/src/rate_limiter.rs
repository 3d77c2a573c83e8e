// estuary - wavefront-compatible telemetry ingestion proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./rate_limiter_test.rs"]
mod rate_limiter_test;

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;

struct State {
  available: f64,
  last_refill: Instant,
}

//
// RecyclableRateLimiter
//

// A smoothed token bucket. Capacity is rate * max_burst_seconds so short bursts are absorbed
// without exceeding the configured rate over longer windows. Permits acquired for work that did
// not end up consuming backend capacity can be recycled back into the bucket.
pub struct RecyclableRateLimiter {
  rate_bits: AtomicU64,
  burst_seconds: f64,
  locked: Mutex<State>,
}

impl RecyclableRateLimiter {
  #[must_use]
  pub fn new(rate: f64, max_burst_seconds: u32) -> Arc<Self> {
    let burst_seconds = f64::from(max_burst_seconds).max(1.0);
    Arc::new(Self {
      rate_bits: AtomicU64::new(rate.to_bits()),
      burst_seconds,
      locked: Mutex::new(State {
        available: rate * burst_seconds,
        last_refill: Instant::now(),
      }),
    })
  }

  #[must_use]
  pub fn rate(&self) -> f64 {
    f64::from_bits(self.rate_bits.load(Ordering::Relaxed))
  }

  fn capacity(&self) -> f64 {
    self.rate() * self.burst_seconds
  }

  pub fn set_rate(&self, rate: f64) {
    self.rate_bits.store(rate.to_bits(), Ordering::Relaxed);
    let mut state = self.locked.lock();
    state.available = state.available.min(self.capacity());
  }

  fn refill(&self, state: &mut State) {
    let now = Instant::now();
    let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
    state.last_refill = now;
    state.available = (state.available + elapsed * self.rate()).min(self.capacity());
  }

  // Take permits if the bucket holds enough of them right now. Never blocks.
  pub fn try_acquire(&self, permits: f64) -> bool {
    let mut state = self.locked.lock();
    self.refill(&mut state);
    if state.available >= permits {
      state.available -= permits;
      true
    } else {
      false
    }
  }

  // Return permits that were acquired but not spent against the backend.
  pub fn recycle(&self, permits: f64) {
    let mut state = self.locked.lock();
    state.available = (state.available + permits).min(self.capacity());
  }
}
