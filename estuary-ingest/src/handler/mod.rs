// estuary - wavefront-compatible telemetry ingestion proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt


mod delta;
mod histogram;
mod point;
mod source_tag;
mod span;

pub use delta::DeltaCounterHandler;
pub use histogram::HistogramHandler;
pub use point::PointHandler;
pub use source_tag::SourceTagHandler;
pub use span::{SpanHandler, SpanLogsHandler};

use crate::model::HandlerKey;
use crate::queue::TaskQueue;
use crate::rate_limiter::RecyclableRateLimiter;
use crate::sender::SenderTaskPool;
use estuary_common::LossyIntoToFloat;
use estuary_common::duration::DurationExt;
use estuary_common::shutdown::ComponentShutdown;
use estuary_common::stats::Scope;
use parking_lot::{Mutex, RwLock};
use prometheus::{Histogram, IntCounter, IntGauge};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use time::ext::NumericalDuration;

const RATE_HISTORY_SECONDS: usize = 15 * 60;

//
// HandlerMetrics
//

// The per-handler-key counter set, shared between the handler (received/blocked/rejected) and
// its sender tasks (sent/delivered/failed).
pub struct HandlerMetrics {
  pub received: IntCounter,
  pub sent: IntCounter,
  pub delivered: IntCounter,
  pub blocked: IntCounter,
  pub rejected: IntCounter,
  pub failed: IntCounter,
  pub received_lag: Histogram,
}

impl HandlerMetrics {
  #[must_use]
  pub fn new(scope: &Scope) -> Arc<Self> {
    Arc::new(Self {
      received: scope.counter("received"),
      sent: scope.counter("sent"),
      delivered: scope.counter("delivered"),
      blocked: scope.counter("blocked"),
      rejected: scope.counter("rejected"),
      failed: scope.counter("failed"),
      received_lag: scope.histogram("received_lag"),
    })
  }
}

//
// RateTracker
//

// Derives 1/5/15-minute rates and a max single-second burst from a monotonically increasing
// counter. Sampled once per second by the handler's stats task, so the ingest path never pays
// for it.
struct RateTracker {
  last_total: u64,
  history: VecDeque<u64>,
  max_burst: u64,
}

impl RateTracker {
  const fn new() -> Self {
    Self {
      last_total: 0,
      history: VecDeque::new(),
      max_burst: 0,
    }
  }

  fn roll(&mut self, total: u64) {
    let delta = total.saturating_sub(self.last_total);
    self.last_total = total;
    self.history.push_front(delta);
    self.history.truncate(RATE_HISTORY_SECONDS);
    self.max_burst = self.max_burst.max(delta);
  }

  fn rate_over(&self, seconds: usize) -> f64 {
    if self.history.is_empty() {
      return 0.0;
    }
    let window = seconds.min(self.history.len());
    let total: u64 = self.history.iter().take(window).sum();
    total.lossy_to_f64() / window.lossy_to_f64()
  }

  fn current_rate(&self) -> u64 {
    self.history.front().copied().unwrap_or(0)
  }

  fn count_over(&self, seconds: usize) -> u64 {
    self.history.iter().take(seconds).sum()
  }

  fn max_burst_and_clear(&mut self) -> u64 {
    std::mem::replace(&mut self.max_burst, 0)
  }
}

//
// HandlerCommon
//

// Functionality shared by every entity handler: blocked/rejected bookkeeping, the blocked items
// log, the rate limited main-log line, and the periodic stats printers.
pub struct HandlerCommon {
  pub key: HandlerKey,
  pub metrics: Arc<HandlerMetrics>,
  blocked_log_limiter: Option<Arc<RecyclableRateLimiter>>,
  received_rates: Mutex<RateTracker>,
  delivered_rates: Mutex<RateTracker>,
  max_burst_gauge: IntGauge,
}

impl HandlerCommon {
  #[must_use]
  pub fn new(
    key: HandlerKey,
    blocked_items_per_batch: u32,
    metrics: Arc<HandlerMetrics>,
    scope: &Scope,
  ) -> Arc<Self> {
    // Blocked items are logged to the main log at a tenth of the blocked batch size per second.
    let blocked_log_limiter = if blocked_items_per_batch == 0 {
      None
    } else {
      Some(RecyclableRateLimiter::new(
        f64::from(blocked_items_per_batch) / 10.0,
        1,
      ))
    };
    Arc::new(Self {
      key,
      metrics,
      blocked_log_limiter,
      received_rates: Mutex::new(RateTracker::new()),
      delivered_rates: Mutex::new(RateTracker::new()),
      max_burst_gauge: scope.gauge("received_max_burst_rate"),
    })
  }

  // Validation failure: counted as blocked and rejected, logged to the blocked items log at full
  // rate and to the main log at a limited rate.
  pub fn reject(&self, item: Option<String>, reason: Option<&str>) {
    self.metrics.blocked.inc();
    self.metrics.rejected.inc();
    if let Some(line) = item {
      log::warn!(target: "blocked", "{line}");
    }
    if let Some(reason) = reason {
      if self
        .blocked_log_limiter
        .as_ref()
        .is_some_and(|limiter| limiter.try_acquire(1.0))
      {
        log::info!("[{}] blocked input: [{reason}]", self.key.handle);
      }
    }
  }

  // Backend-suppressed delivery: counted as blocked only.
  pub fn block(&self, item: Option<String>, reason: Option<&str>) {
    self.metrics.blocked.inc();
    if let Some(line) = item {
      log::info!(target: "blocked", "{line}");
    }
    if let Some(reason) = reason {
      log::info!(target: "blocked", "{reason}");
    }
  }

  pub fn observe_lag(&self, now_ms: u64, timestamp_ms: u64) {
    #[allow(clippy::cast_precision_loss)]
    self
      .metrics
      .received_lag
      .observe(now_ms.saturating_sub(timestamp_ms) as f64 / 1000.0);
  }

  fn print_stats(&self) {
    let entity = self.key.entity_type;
    let rates = self.received_rates.lock();
    log::info!(
      "[{}] {} received rate: {:.0} {} (1 min), {:.0} {} (5 min), {} {} (current).",
      self.key.handle,
      entity.capitalized(),
      rates.rate_over(60),
      entity.rate_unit(),
      rates.rate_over(300),
      entity.rate_unit(),
      rates.current_rate(),
      entity.rate_unit(),
    );
    drop(rates);

    let delivered = self.delivered_rates.lock();
    if delivered.count_over(300) == 0 {
      return;
    }
    log::info!(
      "[{}] {} delivered rate: {:.0} {} (1 min), {:.0} {} (5 min)",
      self.key.handle,
      entity.capitalized(),
      delivered.rate_over(60),
      entity.rate_unit(),
      delivered.rate_over(300),
      entity.rate_unit(),
    );
  }

  fn print_total(&self) {
    log::info!(
      "[{}] {} processed since start: {}; blocked: {}",
      self.key.handle,
      self.key.entity_type.capitalized(),
      self.metrics.sent.get(),
      self.metrics.blocked.get(),
    );
  }

  // One task per handler: samples counters every second, prints rates every 10 s and totals
  // every 60 s.
  pub fn start_stats_task(self: &Arc<Self>, mut shutdown: ComponentShutdown) {
    let common = self.clone();
    tokio::spawn(async move {
      let mut ticks = 0u64;
      let mut interval = 1.seconds().interval();
      loop {
        tokio::select! {
          () = shutdown.cancelled() => break,
          _ = interval.tick() => {},
        }
        ticks += 1;
        {
          let mut rates = common.received_rates.lock();
          rates.roll(common.metrics.received.get());
          if ticks % 60 == 0 {
            let burst = rates.max_burst_and_clear();
            common
              .max_burst_gauge
              .set(i64::try_from(burst).unwrap_or(i64::MAX));
          }
        }
        common
          .delivered_rates
          .lock()
          .roll(common.metrics.delivered.get());
        if ticks % 10 == 0 {
          common.print_stats();
        }
        if ticks % 60 == 0 {
          common.print_total();
        }
      }
      drop(shutdown);
    });
  }
}

//
// HandlerRegistry
//

// Tagged handler reference, one variant per entity type.
#[derive(Clone)]
pub enum AnyHandler {
  Point(Arc<PointHandler>),
  Delta(Arc<DeltaCounterHandler>),
  Histogram(Arc<HistogramHandler>),
  Span(Arc<SpanHandler>),
  SpanLogs(Arc<SpanLogsHandler>),
  SourceTag(Arc<SourceTagHandler>),
}

pub struct RegistryEntry {
  pub handler: AnyHandler,
  pub pool: Arc<SenderTaskPool>,
  pub queue: Arc<dyn TaskQueue>,
}

// Single arena mapping a handler key to its pipeline pieces. Components reference each other by
// key through this registry rather than by owning pointers.
#[derive(Default)]
pub struct HandlerRegistry {
  entries: RwLock<HashMap<HandlerKey, Arc<RegistryEntry>>>,
}

impl HandlerRegistry {
  pub fn insert(&self, key: HandlerKey, entry: RegistryEntry) {
    self.entries.write().insert(key, Arc::new(entry));
  }

  #[must_use]
  pub fn get(&self, key: &HandlerKey) -> Option<Arc<RegistryEntry>> {
    self.entries.read().get(key).cloned()
  }

  #[must_use]
  pub fn keys(&self) -> Vec<HandlerKey> {
    self.entries.read().keys().cloned().collect()
  }

  #[must_use]
  pub fn pools(&self) -> Vec<Arc<SenderTaskPool>> {
    self.entries.read().values().map(|e| e.pool.clone()).collect()
  }
}
