// estuary - wavefront-compatible telemetry ingestion proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./validation_test.rs"]
mod validation_test;

use crate::model::{DELTA_PREFIX, DELTA_PREFIX_ALT, Point, PointValue, Span};
use time::Duration;
use time::ext::NumericalDuration;

const MAX_NAME_LENGTH: usize = 1024;
const MAX_ANNOTATION_KEY_LENGTH: usize = 255;
const MAX_ANNOTATION_VALUE_LENGTH: usize = 255;

//
// ValidationError
//

// Validation failures are values, not escapes. Handlers surface them as rejects.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
  #[error("metric name is empty")]
  EmptyMetric,
  #[error("source is empty")]
  EmptySource,
  #[error("illegal character in metric name \"{0}\"")]
  BadMetric(String),
  #[error("illegal character in source \"{0}\"")]
  BadSource(String),
  #[error("metric name too long ({0} characters)")]
  MetricTooLong(usize),
  #[error("source too long ({0} characters)")]
  SourceTooLong(usize),
  #[error("timestamp {timestamp_ms} outside of acceptable range ({reason})")]
  BadTimestamp { timestamp_ms: u64, reason: &'static str },
  #[error("illegal character in annotation key \"{0}\"")]
  BadAnnotationKey(String),
  #[error("annotation key \"{0}\" too long")]
  AnnotationKeyTooLong(String),
  #[error("annotation value for \"{0}\" too long")]
  AnnotationValueTooLong(String),
  #[error("annotation value for \"{0}\" is empty")]
  EmptyAnnotationValue(String),
  #[error("too many annotations ({0})")]
  TooManyAnnotations(usize),
  #[error("delta counter value must be a finite non-zero number")]
  BadDeltaValue,
  #[error("point value is not a finite number")]
  NonFiniteValue,
  #[error("span name is empty")]
  EmptySpanName,
  #[error("span is missing a trace or span id")]
  MissingSpanIds,
}

//
// ValidationConfig
//

#[derive(Clone, Debug)]
pub struct ValidationConfig {
  pub timestamp_past: Duration,
  pub timestamp_future: Duration,
  pub max_annotations: usize,
}

impl Default for ValidationConfig {
  fn default() -> Self {
    Self {
      timestamp_past: 8760.hours(),
      timestamp_future: 24.hours(),
      max_annotations: 64,
    }
  }
}

// Characters legal in metric names, sources, and annotation keys. Delta markers are only legal
// as the leading character of a metric name.
fn charset_ok(value: &str, allow_delta_lead: bool) -> bool {
  for (i, c) in value.chars().enumerate() {
    let legal = c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-';
    if legal {
      continue;
    }
    if i == 0 && allow_delta_lead && (c == DELTA_PREFIX || c == DELTA_PREFIX_ALT) {
      continue;
    }
    return false;
  }
  true
}

fn validate_timestamp(
  timestamp_ms: u64,
  config: &ValidationConfig,
  now_ms: u64,
) -> Result<(), ValidationError> {
  let past_cutoff =
    now_ms.saturating_sub(u64::try_from(config.timestamp_past.whole_milliseconds()).unwrap_or(0));
  let future_cutoff = now_ms
    .saturating_add(u64::try_from(config.timestamp_future.whole_milliseconds()).unwrap_or(0));
  if timestamp_ms < past_cutoff {
    return Err(ValidationError::BadTimestamp {
      timestamp_ms,
      reason: "too far in the past",
    });
  }
  if timestamp_ms > future_cutoff {
    return Err(ValidationError::BadTimestamp {
      timestamp_ms,
      reason: "too far in the future",
    });
  }
  Ok(())
}

fn validate_annotation(key: &str, value: &str) -> Result<(), ValidationError> {
  if key.is_empty() || !charset_ok(key, false) {
    return Err(ValidationError::BadAnnotationKey(key.to_string()));
  }
  if key.len() > MAX_ANNOTATION_KEY_LENGTH {
    return Err(ValidationError::AnnotationKeyTooLong(key.to_string()));
  }
  if value.is_empty() {
    return Err(ValidationError::EmptyAnnotationValue(key.to_string()));
  }
  if value.len() > MAX_ANNOTATION_VALUE_LENGTH {
    return Err(ValidationError::AnnotationValueTooLong(key.to_string()));
  }
  Ok(())
}

// Validate an incoming point. Valid points pass through unchanged, so validation is idempotent.
pub fn validate_point(
  point: &Point,
  config: &ValidationConfig,
  now_ms: u64,
) -> Result<(), ValidationError> {
  if point.metric.is_empty() {
    return Err(ValidationError::EmptyMetric);
  }
  if point.metric.len() > MAX_NAME_LENGTH {
    return Err(ValidationError::MetricTooLong(point.metric.len()));
  }
  if !charset_ok(&point.metric, true) {
    return Err(ValidationError::BadMetric(point.metric.clone()));
  }
  if point.source.is_empty() {
    return Err(ValidationError::EmptySource);
  }
  if point.source.len() > MAX_NAME_LENGTH {
    return Err(ValidationError::SourceTooLong(point.source.len()));
  }
  if !charset_ok(&point.source, false) {
    return Err(ValidationError::BadSource(point.source.clone()));
  }
  validate_timestamp(point.timestamp_ms, config, now_ms)?;
  if point.annotations.len() > config.max_annotations {
    return Err(ValidationError::TooManyAnnotations(point.annotations.len()));
  }
  for (key, value) in &point.annotations {
    validate_annotation(key, value)?;
  }
  match &point.value {
    PointValue::Number(value) => {
      if !value.is_finite() {
        return Err(ValidationError::NonFiniteValue);
      }
      if point.is_delta() && *value == 0.0 {
        return Err(ValidationError::BadDeltaValue);
      }
    },
    PointValue::Distribution(_) => {},
  }
  Ok(())
}

pub fn validate_span(
  span: &Span,
  config: &ValidationConfig,
  now_ms: u64,
) -> Result<(), ValidationError> {
  if span.name.is_empty() {
    return Err(ValidationError::EmptySpanName);
  }
  if span.source.is_empty() {
    return Err(ValidationError::EmptySource);
  }
  if span.source.len() > MAX_NAME_LENGTH {
    return Err(ValidationError::SourceTooLong(span.source.len()));
  }
  if !charset_ok(&span.source, false) {
    return Err(ValidationError::BadSource(span.source.clone()));
  }
  if span.trace_id.is_empty() || span.span_id.is_empty() {
    return Err(ValidationError::MissingSpanIds);
  }
  validate_timestamp(span.start_ms, config, now_ms)?;
  if span.annotations.len() > config.max_annotations {
    return Err(ValidationError::TooManyAnnotations(span.annotations.len()));
  }
  for annotation in &span.annotations {
    validate_annotation(&annotation.key, &annotation.value)?;
  }
  Ok(())
}
