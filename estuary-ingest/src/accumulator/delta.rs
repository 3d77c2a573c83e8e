// estuary - wavefront-compatible telemetry ingestion proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./delta_test.rs"]
mod delta_test;

use crate::clock::Clock;
use crate::model::{HostMetricTagsPair, Point, PointValue};
use crate::sender::SenderTaskPool;
use estuary_common::duration::DurationExt;
use estuary_common::shutdown::ComponentShutdown;
use estuary_common::stats::Scope;
use parking_lot::Mutex;
use prometheus::{IntCounter, IntGauge};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use time::Duration;

//
// DeltaCell
//

// One live accumulation cell. The value is an atomic f64 (bit-cast CAS) so ingest threads fold
// deltas in without a lock.
struct DeltaCell {
  bits: AtomicU64,
  last_access_ms: AtomicU64,
}

impl DeltaCell {
  fn new(now_ms: u64) -> Arc<Self> {
    Arc::new(Self {
      bits: AtomicU64::new(0f64.to_bits()),
      last_access_ms: AtomicU64::new(now_ms),
    })
  }

  fn add(&self, value: f64, now_ms: u64) {
    self.last_access_ms.store(now_ms, Ordering::Relaxed);
    let mut current = self.bits.load(Ordering::Relaxed);
    loop {
      let next = (f64::from_bits(current) + value).to_bits();
      match self
        .bits
        .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
      {
        Ok(_) => return,
        Err(actual) => current = actual,
      }
    }
  }

  // Read and reset to zero. At most one emission observes any given increment.
  fn get_and_set_zero(&self) -> f64 {
    f64::from_bits(self.bits.swap(0f64.to_bits(), Ordering::Relaxed))
  }
}

struct Stats {
  flushed: IntCounter,
  evicted: IntCounter,
  size: IntGauge,
}

//
// DeltaAccumulator
//

// Aggregates delta counter increments per HostMetricTagsPair and emits one summed point per key
// per flush window. Cells idle for five aggregation intervals are evicted, emitting any residue.
pub struct DeltaAccumulator {
  cells: Mutex<HashMap<HostMetricTagsPair, Arc<DeltaCell>>>,
  interval: Duration,
  pool: Arc<SenderTaskPool>,
  clock: Clock,
  stats: Stats,
}

impl DeltaAccumulator {
  #[must_use]
  pub fn new(
    interval: Duration,
    pool: Arc<SenderTaskPool>,
    scope: &Scope,
    clock: Clock,
  ) -> Arc<Self> {
    let scope = scope.scope("accumulator");
    Arc::new(Self {
      cells: Mutex::default(),
      interval,
      pool,
      clock,
      stats: Stats {
        flushed: scope.counter("flushed"),
        evicted: scope.counter("evicted"),
        size: scope.gauge("size"),
      },
    })
  }

  // Invariant: at most one live cell per key.
  pub fn add(&self, key: HostMetricTagsPair, value: f64) {
    let now_ms = self.clock.now_ms();
    let cell = {
      let mut cells = self.cells.lock();
      let cell = cells
        .entry(key)
        .or_insert_with(|| DeltaCell::new(now_ms))
        .clone();
      #[allow(clippy::cast_possible_wrap)]
      self.stats.size.set(cells.len() as i64);
      cell
    };
    cell.add(value, now_ms);
  }

  fn emit(&self, key: &HostMetricTagsPair, value: f64) {
    if value == 0.0 {
      return;
    }
    let point = Point {
      metric: key.metric.clone(),
      source: key.host.clone(),
      timestamp_ms: self.clock.now_ms(),
      value: PointValue::Number(value),
      annotations: key.tags.clone(),
    };
    self.pool.submit_line(point.to_line());
    self.stats.flushed.inc();
  }

  // Emit every non-zero cell and reset it, then evict cells idle longer than the TTL.
  pub fn flush(&self) {
    let snapshot: Vec<(HostMetricTagsPair, Arc<DeltaCell>)> = self
      .cells
      .lock()
      .iter()
      .map(|(key, cell)| (key.clone(), cell.clone()))
      .collect();
    for (key, cell) in snapshot {
      self.emit(&key, cell.get_and_set_zero());
    }

    let ttl_ms = u64::try_from(self.interval.whole_milliseconds() * 5).unwrap_or(u64::MAX);
    let now_ms = self.clock.now_ms();
    let mut evicted = vec![];
    {
      let mut cells = self.cells.lock();
      cells.retain(|key, cell| {
        let idle = now_ms.saturating_sub(cell.last_access_ms.load(Ordering::Relaxed)) > ttl_ms;
        if idle {
          evicted.push((key.clone(), cell.clone()));
        }
        !idle
      });
      #[allow(clippy::cast_possible_wrap)]
      self.stats.size.set(cells.len() as i64);
    }
    // Eviction also emits any residue accumulated since the pass above.
    for (key, cell) in evicted {
      self.emit(&key, cell.get_and_set_zero());
      self.stats.evicted.inc();
    }
  }

  pub fn start(self: &Arc<Self>, mut shutdown: ComponentShutdown) {
    let accumulator = self.clone();
    tokio::spawn(async move {
      let mut interval = accumulator.interval.interval();
      // The first tick fires immediately; skip it so the first flush covers a full window.
      interval.tick().await;
      loop {
        tokio::select! {
          () = shutdown.cancelled() => break,
          _ = interval.tick() => accumulator.flush(),
        }
      }
      drop(shutdown);
    });
  }
}
