// estuary - wavefront-compatible telemetry ingestion proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./model_test.rs"]
mod model_test;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Write;

// Delta counter metric names lead with one of these markers. The uppercase variant is accepted
// on the wire and normalized to the canonical lowercase one.
pub const DELTA_PREFIX: char = '\u{2206}';
pub const DELTA_PREFIX_ALT: char = '\u{0394}';

//
// EntityType
//

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum EntityType {
  Point,
  DeltaCounter,
  Histogram,
  Span,
  SpanLogs,
  SourceTag,
}

impl EntityType {
  #[must_use]
  pub const fn rate_unit(self) -> &'static str {
    match self {
      Self::Point | Self::DeltaCounter => "pps",
      Self::Histogram => "dps",
      Self::Span => "sps",
      Self::SpanLogs => "lps",
      Self::SourceTag => "tps",
    }
  }

  #[must_use]
  pub const fn capitalized(self) -> &'static str {
    match self {
      Self::Point => "Points",
      Self::DeltaCounter => "Delta counters",
      Self::Histogram => "Histograms",
      Self::Span => "Spans",
      Self::SpanLogs => "Span logs",
      Self::SourceTag => "Source tags",
    }
  }
}

impl fmt::Display for EntityType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Self::Point => "points",
      Self::DeltaCounter => "deltaCounters",
      Self::Histogram => "histograms",
      Self::Span => "spans",
      Self::SpanLogs => "spanLogs",
      Self::SourceTag => "sourceTags",
    })
  }
}

//
// HandlerKey
//

// The primary routing key inside the proxy: an entity type plus the listener handle (customarily
// the port number as a string).
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct HandlerKey {
  pub entity_type: EntityType,
  pub handle: String,
}

impl HandlerKey {
  #[must_use]
  pub fn new(entity_type: EntityType, handle: &str) -> Self {
    Self {
      entity_type,
      handle: handle.to_string(),
    }
  }
}

impl fmt::Display for HandlerKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}.{}", self.entity_type, self.handle)
  }
}

//
// HistogramValue
//

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Centroid {
  pub value: f64,
  pub count: u32,
}

// A distribution: a duration (which encodes the granularity it was aggregated at) plus centroid
// bins.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct HistogramValue {
  pub duration_ms: u64,
  pub centroids: Vec<Centroid>,
}

impl HistogramValue {
  #[must_use]
  pub fn sample_count(&self) -> u64 {
    self.centroids.iter().map(|c| u64::from(c.count)).sum()
  }
}

//
// Point
//

#[derive(Clone, Debug, PartialEq)]
pub enum PointValue {
  Number(f64),
  Distribution(HistogramValue),
}

// A single reported metric point. Annotation keys are unique and unordered.
#[derive(Clone, Debug, PartialEq)]
pub struct Point {
  pub metric: String,
  pub source: String,
  pub timestamp_ms: u64,
  pub value: PointValue,
  pub annotations: BTreeMap<String, String>,
}

impl Point {
  #[must_use]
  pub fn is_delta(&self) -> bool {
    self
      .metric
      .chars()
      .next()
      .is_some_and(|c| c == DELTA_PREFIX || c == DELTA_PREFIX_ALT)
  }

  // Rewrite the alternate delta marker to the canonical one so accumulator keys converge.
  pub fn normalize_delta(&mut self) {
    if self.metric.starts_with(DELTA_PREFIX_ALT) {
      let rest: String = self.metric.chars().skip(1).collect();
      self.metric = format!("{DELTA_PREFIX}{rest}");
    }
  }

  #[must_use]
  pub fn to_line(&self) -> String {
    match &self.value {
      PointValue::Number(value) => {
        let mut line = format!(
          "\"{}\" {} {} source=\"{}\"",
          escape(&self.metric),
          value,
          self.timestamp_ms / 1000,
          escape(&self.source)
        );
        append_annotations(&mut line, &self.annotations);
        line
      },
      PointValue::Distribution(histogram) => {
        let mut line = granularity_marker(histogram.duration_ms).to_string();
        let _ignored = write!(line, " {}", self.timestamp_ms / 1000);
        for centroid in &histogram.centroids {
          let _ignored = write!(line, " #{} {}", centroid.count, centroid.value);
        }
        let _ignored = write!(
          line,
          " \"{}\" source=\"{}\"",
          escape(&self.metric),
          escape(&self.source)
        );
        append_annotations(&mut line, &self.annotations);
        line
      },
    }
  }
}

const fn granularity_marker(duration_ms: u64) -> &'static str {
  if duration_ms <= 60 * 1000 {
    "!M"
  } else if duration_ms <= 60 * 60 * 1000 {
    "!H"
  } else {
    "!D"
  }
}

fn escape(value: &str) -> String {
  value.replace('"', "\\\"")
}

fn append_annotations(line: &mut String, annotations: &BTreeMap<String, String>) {
  for (key, value) in annotations {
    let _ignored = write!(line, " \"{}\"=\"{}\"", escape(key), escape(value));
  }
}

//
// Span
//

// Span annotations are an ordered list; duplicates are legal and order matters.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Annotation {
  pub key: String,
  pub value: String,
}

impl Annotation {
  #[must_use]
  pub fn new(key: &str, value: &str) -> Self {
    Self {
      key: key.to_string(),
      value: value.to_string(),
    }
  }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Span {
  pub name: String,
  pub source: String,
  pub trace_id: String,
  pub span_id: String,
  pub parents: Vec<String>,
  pub follows_from: Vec<String>,
  pub start_ms: u64,
  pub duration_ms: u64,
  pub annotations: Vec<Annotation>,
}

impl Span {
  // First matching annotation value, if any.
  #[must_use]
  pub fn annotation(&self, key: &str) -> Option<&str> {
    self
      .annotations
      .iter()
      .find(|a| a.key == key)
      .map(|a| a.value.as_str())
  }

  #[must_use]
  pub fn to_line(&self) -> String {
    let mut line = format!(
      "\"{}\" source=\"{}\" traceId={} spanId={}",
      escape(&self.name),
      escape(&self.source),
      self.trace_id,
      self.span_id
    );
    for parent in &self.parents {
      let _ignored = write!(line, " parent={parent}");
    }
    for follows in &self.follows_from {
      let _ignored = write!(line, " followsFrom={follows}");
    }
    for annotation in &self.annotations {
      let _ignored = write!(
        line,
        " \"{}\"=\"{}\"",
        escape(&annotation.key),
        escape(&annotation.value)
      );
    }
    let _ignored = write!(line, " {} {}", self.start_ms, self.duration_ms);
    line
  }
}

//
// SpanLogs
//

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SpanLog {
  pub timestamp_us: u64,
  pub fields: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpanLogs {
  pub trace_id: String,
  pub span_id: String,
  pub logs: Vec<SpanLog>,
}

impl SpanLogs {
  // Span logs ship as one JSON document per span.
  #[must_use]
  pub fn to_line(&self) -> String {
    serde_json::to_string(self).unwrap_or_default()
  }
}

//
// SourceTagOp
//

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum SourceOperationType {
  SourceTag,
  SourceDescription,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum SourceTagAction {
  Add,
  Save,
  Delete,
}

// A source-tag mutation targeting the backend source browser.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SourceTagOp {
  pub op: SourceOperationType,
  pub action: SourceTagAction,
  pub source: String,
  pub annotations: Vec<String>,
}

impl SourceTagOp {
  #[must_use]
  pub fn to_line(&self) -> String {
    serde_json::to_string(self).unwrap_or_default()
  }
}

//
// HostMetricTagsPair
//

// Aggregation key for delta counters. Equality and hashing use host, metric, and the full tag
// set.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct HostMetricTagsPair {
  pub host: String,
  pub metric: String,
  pub tags: BTreeMap<String, String>,
}

impl HostMetricTagsPair {
  #[must_use]
  pub fn of(point: &Point) -> Self {
    Self {
      host: point.source.clone(),
      metric: point.metric.clone(),
      tags: point.annotations.clone(),
    }
  }
}
