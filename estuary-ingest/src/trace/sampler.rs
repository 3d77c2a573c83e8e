// estuary - wavefront-compatible telemetry ingestion proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./sampler_test.rs"]
mod sampler_test;

use crate::model::Span;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

//
// Sampler
//

pub trait Sampler: Send + Sync {
  fn decide(&self, span: &Span) -> bool;
}

//
// RateSampler
//

// Probabilistic sampler keyed on the trace id, so every span of a trace gets the same decision.
// The rate is updatable at runtime via check-in.
pub struct RateSampler {
  rate_bits: AtomicU64,
}

impl RateSampler {
  #[must_use]
  pub fn new(rate: f64) -> Self {
    Self {
      rate_bits: AtomicU64::new(rate.clamp(0.0, 1.0).to_bits()),
    }
  }

  #[must_use]
  pub fn rate(&self) -> f64 {
    f64::from_bits(self.rate_bits.load(Ordering::Relaxed))
  }

  pub fn set_rate(&self, rate: Option<f64>) {
    if let Some(rate) = rate {
      self
        .rate_bits
        .store(rate.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }
  }
}

impl Sampler for RateSampler {
  fn decide(&self, span: &Span) -> bool {
    let rate = self.rate();
    if rate >= 1.0 {
      return true;
    }
    if rate <= 0.0 {
      return false;
    }
    let mut hasher = DefaultHasher::new();
    span.trace_id.hash(&mut hasher);
    #[allow(clippy::cast_precision_loss)]
    let bucket = (hasher.finish() % 10_000) as f64 / 10_000.0;
    bucket < rate
  }
}

//
// CompositeSampler
//

// Combines samplers with any-of semantics: a span is kept when any member votes to keep it.
pub struct CompositeSampler {
  samplers: Vec<Arc<dyn Sampler>>,
}

impl CompositeSampler {
  #[must_use]
  pub fn new(samplers: Vec<Arc<dyn Sampler>>) -> Self {
    Self { samplers }
  }
}

impl Sampler for CompositeSampler {
  fn decide(&self, span: &Span) -> bool {
    self.samplers.iter().any(|sampler| sampler.decide(span))
  }
}

//
// DurationSampler
//

// Samples spans whose duration exceeds a threshold.
pub struct DurationSampler {
  threshold_ms: AtomicU64,
}

impl DurationSampler {
  #[must_use]
  pub const fn new(threshold_ms: u64) -> Self {
    Self {
      threshold_ms: AtomicU64::new(threshold_ms),
    }
  }

  pub fn set_threshold_ms(&self, threshold_ms: u64) {
    self.threshold_ms.store(threshold_ms, Ordering::Relaxed);
  }
}

impl Sampler for DurationSampler {
  fn decide(&self, span: &Span) -> bool {
    span.duration_ms > self.threshold_ms.load(Ordering::Relaxed)
  }
}
