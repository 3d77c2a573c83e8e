// estuary - wavefront-compatible telemetry ingestion proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./properties_test.rs"]
mod properties_test;

use crate::model::EntityType;
use crate::rate_limiter::RecyclableRateLimiter;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use time::Duration;

// What we consider "unlimited".
pub const NO_RATE_LIMIT: f64 = 10_000_000.0;

pub const DEFAULT_BATCH_SIZE: u32 = 40_000;
pub const DEFAULT_BATCH_SIZE_HISTOGRAMS: u32 = 10_000;
pub const DEFAULT_BATCH_SIZE_SPANS: u32 = 5_000;
pub const DEFAULT_BATCH_SIZE_SPAN_LOGS: u32 = 1_000;
pub const DEFAULT_BATCH_SIZE_SOURCE_TAGS: u32 = 50;
pub const DEFAULT_MIN_SPLIT_BATCH_SIZE: u32 = 100;
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_MAX_BURST_SECONDS: u32 = 10;
pub const DEFAULT_RETRY_BACKOFF_BASE_SECONDS: f64 = 2.0;
pub const DEFAULT_MAX_TASK_ATTEMPTS: u32 = 100;
pub const DEFAULT_MAX_QUEUE_AGE_MS: u64 = 24 * 60 * 60 * 1000;

//
// EntityPropertiesConfig
//

// Initial values for one entity type's dynamic properties.
#[derive(Clone, Debug)]
pub struct EntityPropertiesConfig {
  pub items_per_batch: u32,
  pub rate_limit: f64,
  pub rate_limit_max_burst_seconds: u32,
  pub push_flush_interval_ms: u64,
  pub min_batch_split_size: u32,
  pub split_push_when_rate_limited: bool,
  pub retry_backoff_base_seconds: f64,
  pub max_task_attempts: u32,
  pub max_queue_age_ms: u64,
}

impl EntityPropertiesConfig {
  // Per-entity defaults; everything else is shared.
  #[must_use]
  pub fn defaults_for(entity_type: EntityType) -> Self {
    let items_per_batch = match entity_type {
      EntityType::Point | EntityType::DeltaCounter => DEFAULT_BATCH_SIZE,
      EntityType::Histogram => DEFAULT_BATCH_SIZE_HISTOGRAMS,
      EntityType::Span => DEFAULT_BATCH_SIZE_SPANS,
      EntityType::SpanLogs => DEFAULT_BATCH_SIZE_SPAN_LOGS,
      EntityType::SourceTag => DEFAULT_BATCH_SIZE_SOURCE_TAGS,
    };
    Self {
      items_per_batch,
      rate_limit: NO_RATE_LIMIT,
      rate_limit_max_burst_seconds: DEFAULT_MAX_BURST_SECONDS,
      push_flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
      min_batch_split_size: DEFAULT_MIN_SPLIT_BATCH_SIZE,
      split_push_when_rate_limited: false,
      retry_backoff_base_seconds: DEFAULT_RETRY_BACKOFF_BASE_SECONDS,
      max_task_attempts: DEFAULT_MAX_TASK_ATTEMPTS,
      max_queue_age_ms: DEFAULT_MAX_QUEUE_AGE_MS,
    }
  }
}

//
// EntityProperties
//

// Dynamic entity-specific properties that may change at runtime via check-in. Senders read the
// atomic slots on every flush, so updates apply without coordination. Setting a property to None
// restores the originally configured value.
pub struct EntityProperties {
  original: EntityPropertiesConfig,
  items_per_batch: AtomicU32,
  split_push_when_rate_limited: AtomicBool,
  retry_backoff_base_seconds_bits: AtomicU64,
  push_flush_interval_ms: AtomicU64,
  feature_disabled: AtomicBool,
  limiter: Arc<RecyclableRateLimiter>,
}

impl EntityProperties {
  #[must_use]
  pub fn new(config: EntityPropertiesConfig) -> Arc<Self> {
    let limiter =
      RecyclableRateLimiter::new(config.rate_limit, config.rate_limit_max_burst_seconds);
    Arc::new(Self {
      items_per_batch: AtomicU32::new(config.items_per_batch),
      split_push_when_rate_limited: AtomicBool::new(config.split_push_when_rate_limited),
      retry_backoff_base_seconds_bits: AtomicU64::new(
        config.retry_backoff_base_seconds.to_bits(),
      ),
      push_flush_interval_ms: AtomicU64::new(config.push_flush_interval_ms),
      feature_disabled: AtomicBool::new(false),
      limiter,
      original: config,
    })
  }

  #[must_use]
  pub fn items_per_batch(&self) -> usize {
    self.items_per_batch.load(Ordering::Relaxed) as usize
  }

  pub fn set_items_per_batch(&self, items_per_batch: Option<u32>) {
    self.items_per_batch.store(
      items_per_batch.unwrap_or(self.original.items_per_batch),
      Ordering::Relaxed,
    );
  }

  // Max number of items that can stay in memory buffers before spooling to disk.
  #[must_use]
  pub fn memory_buffer_limit(&self) -> usize {
    let items_per_batch = self.items_per_batch();
    (16 * items_per_batch).max(items_per_batch)
  }

  #[must_use]
  pub fn is_split_push_when_rate_limited(&self) -> bool {
    self.split_push_when_rate_limited.load(Ordering::Relaxed)
  }

  pub fn set_split_push_when_rate_limited(&self, split: Option<bool>) {
    self.split_push_when_rate_limited.store(
      split.unwrap_or(self.original.split_push_when_rate_limited),
      Ordering::Relaxed,
    );
  }

  #[must_use]
  pub fn retry_backoff_base_seconds(&self) -> f64 {
    f64::from_bits(self.retry_backoff_base_seconds_bits.load(Ordering::Relaxed))
  }

  pub fn set_retry_backoff_base_seconds(&self, base: Option<f64>) {
    self.retry_backoff_base_seconds_bits.store(
      base
        .unwrap_or(self.original.retry_backoff_base_seconds)
        .to_bits(),
      Ordering::Relaxed,
    );
  }

  #[must_use]
  pub fn push_flush_interval(&self) -> Duration {
    Duration::milliseconds(
      i64::try_from(self.push_flush_interval_ms.load(Ordering::Relaxed)).unwrap_or(i64::MAX),
    )
  }

  pub fn set_push_flush_interval_ms(&self, interval_ms: Option<u64>) {
    self.push_flush_interval_ms.store(
      interval_ms.unwrap_or(self.original.push_flush_interval_ms),
      Ordering::Relaxed,
    );
  }

  #[must_use]
  pub fn rate_limit(&self) -> f64 {
    self.limiter.rate()
  }

  pub fn set_rate_limit(&self, rate_limit: Option<f64>) {
    self
      .limiter
      .set_rate(rate_limit.unwrap_or(self.original.rate_limit));
  }

  #[must_use]
  pub fn rate_limiter(&self) -> Arc<RecyclableRateLimiter> {
    self.limiter.clone()
  }

  #[must_use]
  pub fn min_batch_split_size(&self) -> usize {
    self.original.min_batch_split_size as usize
  }

  #[must_use]
  pub fn is_feature_disabled(&self) -> bool {
    self.feature_disabled.load(Ordering::Relaxed)
  }

  pub fn set_feature_disabled(&self, disabled: Option<bool>) {
    self
      .feature_disabled
      .store(disabled.unwrap_or(false), Ordering::Relaxed);
  }

  #[must_use]
  pub const fn max_task_attempts(&self) -> u32 {
    self.original.max_task_attempts
  }

  #[must_use]
  pub const fn max_queue_age_ms(&self) -> u64 {
    self.original.max_queue_age_ms
  }
}
