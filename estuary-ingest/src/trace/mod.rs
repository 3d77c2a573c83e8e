// estuary - wavefront-compatible telemetry ingestion proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./mod_test.rs"]
mod mod_test;

pub mod sampler;

pub use sampler::{CompositeSampler, DurationSampler, RateSampler, Sampler};

use crate::clock::Clock;
use crate::handler::{SpanHandler, SpanLogsHandler};
use crate::model::{Point, PointValue, Span, SpanLogs};
use crate::preprocessor::Preprocessor;
use crate::sender::SenderTaskPool;
use estuary_common::duration::DurationExt;
use estuary_common::shutdown::ComponentShutdown;
use estuary_common::stats::Scope;
use parking_lot::Mutex;
use prometheus::{Histogram, IntCounter};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use time::ext::NumericalDuration;

const HEARTBEAT_METRIC: &str = "~component.heartbeat";
const HEARTBEAT_TTL_MS: u64 = 10 * 60 * 1000;
const NULL_TAG_VALUE: &str = "none";

//
// RedKey
//

// Key for RED-style derived metrics and heartbeats.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct RedKey {
  pub application: String,
  pub service: String,
  pub cluster: String,
  pub shard: String,
  pub component: String,
  pub source: String,
}

impl RedKey {
  fn labels(&self) -> HashMap<String, String> {
    HashMap::from([
      ("application".to_string(), self.application.clone()),
      ("service".to_string(), self.service.clone()),
      ("cluster".to_string(), self.cluster.clone()),
      ("shard".to_string(), self.shard.clone()),
      ("component".to_string(), self.component.clone()),
      ("source".to_string(), self.source.clone()),
    ])
  }
}

struct RedMetrics {
  requests: IntCounter,
  errors: IntCounter,
  duration: Histogram,
}

//
// SpanFanIn
//

// The single entry point for decoded spans regardless of wire protocol. Applies preprocessing,
// makes the sampling decision, forwards sampled spans (and their logs), and derives RED metrics
// and heartbeats for every span seen.
pub struct SpanFanIn {
  preprocessor: Option<Arc<Preprocessor>>,
  sampler: Arc<dyn Sampler>,
  always_sample_errors: AtomicBool,
  span_handler: Arc<SpanHandler>,
  span_logs_handler: Option<Arc<SpanLogsHandler>>,
  point_pool: Arc<SenderTaskPool>,
  scope: Scope,
  red: Mutex<HashMap<RedKey, RedMetrics>>,
  heartbeats: Mutex<HashMap<RedKey, u64>>,
  discarded_spans: IntCounter,
  discarded_by_sampler: IntCounter,
  clock: Clock,
}

impl SpanFanIn {
  #[must_use]
  pub fn new(
    preprocessor: Option<Arc<Preprocessor>>,
    sampler: Arc<dyn Sampler>,
    always_sample_errors: bool,
    span_handler: Arc<SpanHandler>,
    span_logs_handler: Option<Arc<SpanLogsHandler>>,
    point_pool: Arc<SenderTaskPool>,
    scope: &Scope,
    clock: Clock,
  ) -> Arc<Self> {
    let scope = scope.scope("traces");
    Arc::new(Self {
      preprocessor,
      sampler,
      always_sample_errors: AtomicBool::new(always_sample_errors),
      span_handler,
      span_logs_handler,
      point_pool,
      red: Mutex::default(),
      heartbeats: Mutex::default(),
      discarded_spans: scope.counter("discarded"),
      discarded_by_sampler: scope.counter("sampler_discarded"),
      scope,
      clock,
    })
  }

  pub fn set_always_sample_errors(&self, always: bool) {
    self.always_sample_errors.store(always, Ordering::Relaxed);
  }

  pub fn ingest(&self, mut span: Span, span_logs: Option<SpanLogs>) {
    if let Some(preprocessor) = &self.preprocessor {
      preprocessor.preprocess_span(&mut span);
    }

    let mut application = None;
    let mut service = None;
    let mut cluster = None;
    let mut shard = None;
    let mut component = None;
    let mut is_error = false;
    for annotation in &span.annotations {
      let value = annotation.value.clone();
      match annotation.key.as_str() {
        "application" => application = Some(value),
        "service" => {
          // The service tag also seeds the cluster slot before any explicit cluster tag can
          // overwrite it. Suspected bug, preserved until confirmed.
          service = Some(value.clone());
          cluster = Some(value);
        },
        "cluster" => cluster = Some(value),
        "shard" => shard = Some(value),
        "component" => component = Some(value),
        "error" => is_error = value == "true",
        _ => {},
      }
    }

    // A span without application/service identity cannot be attributed; discard with a counter,
    // never an error.
    let (Some(application), Some(service)) = (application, service) else {
      self.discarded_spans.inc();
      return;
    };

    let sampled = self.sampler.decide(&span)
      || (self.always_sample_errors.load(Ordering::Relaxed) && is_error);
    let key = RedKey {
      application,
      service,
      cluster: cluster.unwrap_or_else(|| NULL_TAG_VALUE.to_string()),
      shard: shard.unwrap_or_else(|| NULL_TAG_VALUE.to_string()),
      component: component.unwrap_or_else(|| NULL_TAG_VALUE.to_string()),
      source: span.source.clone(),
    };
    let duration_ms = span.duration_ms;

    if sampled {
      self.span_handler.report(span);
      if let (Some(handler), Some(span_logs)) = (&self.span_logs_handler, span_logs) {
        handler.report(span_logs);
      }
    } else {
      self.discarded_by_sampler.inc();
    }

    // RED metrics accrue for every span regardless of the sampling outcome.
    {
      let mut red = self.red.lock();
      let metrics = red.entry(key.clone()).or_insert_with(|| RedMetrics {
        requests: self
          .scope
          .counter_with_labels("derived_requests", key.labels()),
        errors: self.scope.counter_with_labels("derived_errors", key.labels()),
        duration: self
          .scope
          .histogram_with_labels("derived_duration", key.labels()),
      });
      metrics.requests.inc();
      if is_error {
        metrics.errors.inc();
      }
      #[allow(clippy::cast_precision_loss)]
      metrics.duration.observe(duration_ms as f64);
    }

    self.heartbeats.lock().insert(key, self.clock.now_ms());
  }

  // Emit one synthetic heartbeat point per live tuple and drop expired entries.
  pub fn emit_heartbeats(&self) {
    let now_ms = self.clock.now_ms();
    let mut heartbeats = self.heartbeats.lock();
    heartbeats.retain(|_, last_seen| now_ms.saturating_sub(*last_seen) <= HEARTBEAT_TTL_MS);
    for key in heartbeats.keys() {
      let mut annotations = BTreeMap::new();
      annotations.insert("application".to_string(), key.application.clone());
      annotations.insert("service".to_string(), key.service.clone());
      annotations.insert("cluster".to_string(), key.cluster.clone());
      annotations.insert("shard".to_string(), key.shard.clone());
      annotations.insert("component".to_string(), key.component.clone());
      let point = Point {
        metric: HEARTBEAT_METRIC.to_string(),
        source: key.source.clone(),
        timestamp_ms: now_ms,
        value: PointValue::Number(1.0),
        annotations,
      };
      self.point_pool.submit_line(point.to_line());
    }
  }

  #[must_use]
  pub fn heartbeat_count(&self) -> usize {
    self.heartbeats.lock().len()
  }

  pub fn start_heartbeat_task(self: &Arc<Self>, mut shutdown: ComponentShutdown) {
    let fan_in = self.clone();
    tokio::spawn(async move {
      let mut interval = 60.seconds().interval();
      interval.tick().await;
      loop {
        tokio::select! {
          () = shutdown.cancelled() => break,
          _ = interval.tick() => fan_in.emit_heartbeats(),
        }
      }
      drop(shutdown);
    });
  }
}
