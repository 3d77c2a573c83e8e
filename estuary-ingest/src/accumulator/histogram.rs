// estuary - wavefront-compatible telemetry ingestion proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./histogram_test.rs"]
mod histogram_test;

use crate::clock::Clock;
use crate::model::{Centroid, HistogramValue, Point, PointValue};
use crate::sender::SenderTaskPool;
use estuary_common::duration::DurationExt;
use estuary_common::shutdown::ComponentShutdown;
use estuary_common::stats::Scope;
use parking_lot::Mutex;
use prometheus::{IntCounter, IntGauge};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use time::Duration;

const MAX_CENTROIDS: usize = 100;

//
// Granularity
//

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum Granularity {
  Minute,
  Hour,
  Day,
}

impl Granularity {
  #[must_use]
  pub const fn duration_ms(self) -> u64 {
    match self {
      Self::Minute => 60 * 1000,
      Self::Hour => 60 * 60 * 1000,
      Self::Day => 24 * 60 * 60 * 1000,
    }
  }

  #[must_use]
  pub const fn from_duration_ms(duration_ms: u64) -> Self {
    if duration_ms <= 60 * 1000 {
      Self::Minute
    } else if duration_ms <= 60 * 60 * 1000 {
      Self::Hour
    } else {
      Self::Day
    }
  }

  #[must_use]
  pub const fn bin_start(self, timestamp_ms: u64) -> u64 {
    timestamp_ms - timestamp_ms % self.duration_ms()
  }
}

//
// AgentDigest
//

// A centroid-merging digest. Not a faithful t-digest, but the same shape: samples accumulate
// into weighted centroids, merges fold bins together, and compression keeps the centroid count
// bounded by pairing nearest neighbors.
#[derive(Clone, Debug, Default)]
pub struct AgentDigest {
  centroids: BTreeMap<u64, u64>,
}

fn value_key(value: f64) -> u64 {
  // Total order over finite sample values.
  value.to_bits() ^ if value.is_sign_negative() { !0 } else { 1 << 63 }
}

fn key_value(key: u64) -> f64 {
  let bits = if key & (1 << 63) == 0 { !key } else { key ^ (1 << 63) };
  f64::from_bits(bits)
}

impl AgentDigest {
  pub fn add(&mut self, value: f64, count: u64) {
    if count == 0 || !value.is_finite() {
      return;
    }
    *self.centroids.entry(value_key(value)).or_insert(0) += count;
    self.compress();
  }

  // Merge an incoming distribution bin-by-bin.
  pub fn merge(&mut self, other: &HistogramValue) {
    for centroid in &other.centroids {
      if centroid.count == 0 || !centroid.value.is_finite() {
        continue;
      }
      *self.centroids.entry(value_key(centroid.value)).or_insert(0) +=
        u64::from(centroid.count);
    }
    self.compress();
  }

  #[must_use]
  pub fn sample_count(&self) -> u64 {
    self.centroids.values().sum()
  }

  fn compress(&mut self) {
    while self.centroids.len() > MAX_CENTROIDS {
      // Find the two adjacent centroids closest in value and fold them into their weighted
      // mean.
      let keys: Vec<u64> = self.centroids.keys().copied().collect();
      let mut best = (0usize, f64::MAX);
      for (i, pair) in keys.windows(2).enumerate() {
        let gap = key_value(pair[1]) - key_value(pair[0]);
        if gap < best.1 {
          best = (i, gap);
        }
      }
      let (left, right) = (keys[best.0], keys[best.0 + 1]);
      let left_count = self.centroids.remove(&left).unwrap_or(0);
      let right_count = self.centroids.remove(&right).unwrap_or(0);
      let total = left_count + right_count;
      if total == 0 {
        continue;
      }
      #[allow(clippy::cast_precision_loss)]
      let mean = (key_value(left) * left_count as f64 + key_value(right) * right_count as f64)
        / total as f64;
      *self.centroids.entry(value_key(mean)).or_insert(0) += total;
    }
  }

  #[must_use]
  pub fn to_value(&self, duration_ms: u64) -> HistogramValue {
    HistogramValue {
      duration_ms,
      centroids: self
        .centroids
        .iter()
        .map(|(key, count)| Centroid {
          value: key_value(*key),
          count: u32::try_from(*count).unwrap_or(u32::MAX),
        })
        .collect(),
    }
  }
}

//
// HistogramAccumulator
//

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct HistogramKey {
  metric: String,
  source: String,
  tags: BTreeMap<String, String>,
  bin_start_ms: u64,
}

struct Stats {
  flushed: IntCounter,
  size: IntGauge,
}

// Accumulates samples and distributions into per-key digests at a fixed granularity. Writes go
// through the per-cell mutex, so a flush never observes a half-merged digest.
pub struct HistogramAccumulator {
  granularity: Granularity,
  cells: Mutex<HashMap<HistogramKey, Arc<Mutex<AgentDigest>>>>,
  flush_interval: Duration,
  pool: Arc<SenderTaskPool>,
  clock: Clock,
  stats: Stats,
}

impl HistogramAccumulator {
  #[must_use]
  pub fn new(
    granularity: Granularity,
    flush_interval: Duration,
    pool: Arc<SenderTaskPool>,
    scope: &Scope,
    clock: Clock,
  ) -> Arc<Self> {
    let scope = scope.scope("accumulator");
    Arc::new(Self {
      granularity,
      cells: Mutex::default(),
      flush_interval,
      pool,
      clock,
      stats: Stats {
        flushed: scope.counter("flushed"),
        size: scope.gauge("size"),
      },
    })
  }

  #[must_use]
  pub const fn granularity(&self) -> Granularity {
    self.granularity
  }

  fn cell(&self, point: &Point) -> Arc<Mutex<AgentDigest>> {
    let key = HistogramKey {
      metric: point.metric.clone(),
      source: point.source.clone(),
      tags: point.annotations.clone(),
      bin_start_ms: self.granularity.bin_start(point.timestamp_ms),
    };
    let mut cells = self.cells.lock();
    let cell = cells.entry(key).or_default().clone();
    #[allow(clippy::cast_possible_wrap)]
    self.stats.size.set(cells.len() as i64);
    cell
  }

  pub fn put_sample(&self, point: &Point, value: f64) {
    self.cell(point).lock().add(value, 1);
  }

  pub fn put_distribution(&self, point: &Point, value: &HistogramValue) {
    self.cell(point).lock().merge(value);
  }

  // Emit one combined histogram per settled bin and clear it. A bin settles once its window has
  // fully elapsed.
  pub fn flush(&self) {
    let now_ms = self.clock.now_ms();
    self.flush_up_to(now_ms);
  }

  pub fn flush_up_to(&self, now_ms: u64) {
    let settled: Vec<(HistogramKey, Arc<Mutex<AgentDigest>>)> = {
      let mut cells = self.cells.lock();
      let keys: Vec<HistogramKey> = cells
        .keys()
        .filter(|key| key.bin_start_ms + self.granularity.duration_ms() <= now_ms)
        .cloned()
        .collect();
      let settled = keys
        .into_iter()
        .filter_map(|key| cells.remove_entry(&key))
        .collect();
      #[allow(clippy::cast_possible_wrap)]
      self.stats.size.set(cells.len() as i64);
      settled
    };

    for (key, cell) in settled {
      let digest = cell.lock();
      if digest.sample_count() == 0 {
        continue;
      }
      let point = Point {
        metric: key.metric,
        source: key.source,
        timestamp_ms: key.bin_start_ms,
        value: PointValue::Distribution(digest.to_value(self.granularity.duration_ms())),
        annotations: key.tags,
      };
      drop(digest);
      self.pool.submit_line(point.to_line());
      self.stats.flushed.inc();
    }
  }

  pub fn start(self: &Arc<Self>, mut shutdown: ComponentShutdown) {
    let accumulator = self.clone();
    tokio::spawn(async move {
      let mut interval = accumulator.flush_interval.interval();
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
