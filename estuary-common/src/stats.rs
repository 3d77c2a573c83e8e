// estuary - wavefront-compatible telemetry ingestion proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./stats_test.rs"]
mod stats_test;

use parking_lot::Mutex;
use prometheus::proto::MetricType;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

struct Inner {
  registry: Registry,
  counters: Mutex<HashMap<String, IntCounter>>,
  gauges: Mutex<HashMap<String, IntGauge>>,
  histograms: Mutex<HashMap<String, Histogram>>,
}

// Prometheus metric names are limited to [a-zA-Z0-9_:] with a non-digit lead. Scope names come
// from handler keys (which contain dots) so anything else maps to '_'.
fn sanitize(name: &str) -> String {
  let mut sanitized: String = name
    .chars()
    .map(|c| {
      if c.is_ascii_alphanumeric() || c == '_' || c == ':' {
        c
      } else {
        '_'
      }
    })
    .collect();
  if sanitized.chars().next().is_some_and(|c| c.is_ascii_digit()) {
    sanitized.insert(0, '_');
  }
  sanitized
}

fn metric_key(name: &str, labels: Option<&HashMap<String, String>>) -> String {
  labels.map_or_else(
    || name.to_string(),
    |labels| {
      let sorted: BTreeMap<_, _> = labels.iter().collect();
      format!("{name}{sorted:?}")
    },
  )
}

//
// Collector
//

// Owns the process metric registry. Components create namespaced metrics through scopes. The
// JSON snapshot feeds periodic reporting to the backend.
#[derive(Clone)]
pub struct Collector {
  inner: Arc<Inner>,
}

impl Default for Collector {
  fn default() -> Self {
    Self {
      inner: Arc::new(Inner {
        registry: Registry::new(),
        counters: Mutex::default(),
        gauges: Mutex::default(),
        histograms: Mutex::default(),
      }),
    }
  }
}

impl Collector {
  #[must_use]
  pub fn scope(&self, name: &str) -> Scope {
    Scope {
      inner: self.inner.clone(),
      prefix: name.to_string(),
    }
  }

  // Flatten the current registry contents into a JSON document. Histograms are emitted as
  // .count/.sum pairs.
  #[must_use]
  pub fn snapshot_json(&self) -> serde_json::Value {
    let mut doc = serde_json::Map::new();
    for family in self.inner.registry.gather() {
      for metric in family.get_metric() {
        let mut name = family.get_name().to_string();
        let labels = metric.get_label();
        if !labels.is_empty() {
          let rendered: Vec<String> = labels
            .iter()
            .map(|l| format!("{}={}", l.get_name(), l.get_value()))
            .collect();
          name = format!("{}[{}]", name, rendered.join(","));
        }
        match family.get_field_type() {
          MetricType::COUNTER => {
            doc.insert(name, metric.get_counter().get_value().into());
          },
          MetricType::GAUGE => {
            doc.insert(name, metric.get_gauge().get_value().into());
          },
          MetricType::HISTOGRAM => {
            let histogram = metric.get_histogram();
            doc.insert(
              format!("{name}.count"),
              histogram.get_sample_count().into(),
            );
            doc.insert(format!("{name}.sum"), histogram.get_sample_sum().into());
          },
          _ => {},
        }
      }
    }
    serde_json::Value::Object(doc)
  }
}

//
// Scope
//

// A namespaced view of the collector. Nested scopes join their names with ':'. Creating the same
// metric twice yields the same underlying instance.
#[derive(Clone)]
pub struct Scope {
  inner: Arc<Inner>,
  prefix: String,
}

impl Scope {
  #[must_use]
  pub fn scope(&self, name: &str) -> Self {
    Self {
      inner: self.inner.clone(),
      prefix: if self.prefix.is_empty() {
        name.to_string()
      } else {
        format!("{}:{}", self.prefix, name)
      },
    }
  }

  fn full_name(&self, name: &str) -> String {
    if self.prefix.is_empty() {
      sanitize(name)
    } else {
      sanitize(&format!("{}:{}", self.prefix, name))
    }
  }

  #[must_use]
  pub fn counter(&self, name: &str) -> IntCounter {
    self.counter_inner(name, None)
  }

  #[must_use]
  pub fn counter_with_labels(&self, name: &str, labels: HashMap<String, String>) -> IntCounter {
    self.counter_inner(name, Some(labels))
  }

  fn counter_inner(&self, name: &str, labels: Option<HashMap<String, String>>) -> IntCounter {
    let full_name = self.full_name(name);
    let key = metric_key(&full_name, labels.as_ref());
    let mut counters = self.inner.counters.lock();
    if let Some(counter) = counters.get(&key) {
      return counter.clone();
    }
    let mut opts = Opts::new(full_name.clone(), full_name);
    if let Some(labels) = labels {
      opts = opts.const_labels(labels);
    }
    let counter = IntCounter::with_opts(opts).unwrap();
    self.inner.registry.register(Box::new(counter.clone())).unwrap();
    counters.insert(key, counter.clone());
    counter
  }

  #[must_use]
  pub fn gauge(&self, name: &str) -> IntGauge {
    let full_name = self.full_name(name);
    let mut gauges = self.inner.gauges.lock();
    if let Some(gauge) = gauges.get(&full_name) {
      return gauge.clone();
    }
    let gauge = IntGauge::with_opts(Opts::new(full_name.clone(), full_name.clone())).unwrap();
    self.inner.registry.register(Box::new(gauge.clone())).unwrap();
    gauges.insert(full_name, gauge.clone());
    gauge
  }

  #[must_use]
  pub fn histogram(&self, name: &str) -> Histogram {
    self.histogram_inner(name, None)
  }

  #[must_use]
  pub fn histogram_with_labels(&self, name: &str, labels: HashMap<String, String>) -> Histogram {
    self.histogram_inner(name, Some(labels))
  }

  fn histogram_inner(&self, name: &str, labels: Option<HashMap<String, String>>) -> Histogram {
    let full_name = self.full_name(name);
    let key = metric_key(&full_name, labels.as_ref());
    let mut histograms = self.inner.histograms.lock();
    if let Some(histogram) = histograms.get(&key) {
      return histogram.clone();
    }
    let mut opts = HistogramOpts::new(full_name.clone(), full_name);
    if let Some(labels) = labels {
      opts = opts.const_labels(labels);
    }
    let histogram = Histogram::with_opts(opts).unwrap();
    self
      .inner
      .registry
      .register(Box::new(histogram.clone()))
      .unwrap();
    histograms.insert(key, histogram.clone());
    histogram
  }
}

//
// Helper
//

// Test support for asserting on collector contents.
pub mod test {
  use super::Collector;
  use std::collections::HashMap;

  pub struct Helper {
    collector: Collector,
  }

  impl Helper {
    #[must_use]
    pub const fn new(collector: Collector) -> Self {
      Self { collector }
    }

    #[must_use]
    pub fn counter_value(&self, name: &str, labels: &HashMap<&str, &str>) -> Option<u64> {
      for family in self.collector.inner.registry.gather() {
        if family.get_name() != name {
          continue;
        }
        for metric in family.get_metric() {
          let metric_labels: HashMap<&str, &str> = metric
            .get_label()
            .iter()
            .map(|l| (l.get_name(), l.get_value()))
            .collect();
          if &metric_labels == labels {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            return Some(metric.get_counter().get_value() as u64);
          }
        }
      }
      None
    }

    pub fn assert_counter_eq(&self, expected: u64, name: &str, labels: &HashMap<&str, &str>) {
      assert_eq!(
        Some(expected),
        self.counter_value(name, labels),
        "counter {name} {labels:?}"
      );
    }
  }
}
