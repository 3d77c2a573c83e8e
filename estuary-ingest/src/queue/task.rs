// estuary - wavefront-compatible telemetry ingestion proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./task_test.rs"]
mod task_test;

use crate::api::{ApiError, BackendApi};
use crate::model::{EntityType, SourceTagOp};
use bytes::Bytes;
use http::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt;

//
// QueueingReason
//

// Why a task ended up in the spool. Attached to the serialized task for observability.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum QueueingReason {
  RateLimit,
  BufferSize,
  ProxyShutdown,
  ServerError,
}

impl fmt::Display for QueueingReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Self::RateLimit => "rateLimit",
      Self::BufferSize => "bufferSize",
      Self::ProxyShutdown => "proxyShutdown",
      Self::ServerError => "serverError",
    })
  }
}

//
// TaskResult
//

// Outcome classification for one submission attempt, per the error taxonomy.
#[derive(Debug, Eq, PartialEq)]
pub enum TaskResult {
  Delivered,
  // HTTP 406: the batch must be reduced and retried.
  Pushback,
  // Transient: spool and retry with backoff.
  Retryable,
  // Permanent client error: drop, count as failed.
  PermanentRejected(StatusCode),
}

#[must_use]
pub fn classify_status(status: StatusCode) -> TaskResult {
  if status.is_success() {
    return TaskResult::Delivered;
  }
  match status.as_u16() {
    406 => TaskResult::Pushback,
    // The full 5xx range is retried, not just the 502-504 gateway statuses.
    407 | 408 | 429 | 500..=599 => TaskResult::Retryable,
    _ => TaskResult::PermanentRejected(status),
  }
}

//
// SubmissionTask
//

// The payload carries a serde tag so new entity types can be added without migrating spool files
// written by older builds.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "kind")]
pub enum TaskPayload {
  Lines {
    entity_type: EntityType,
    lines: Vec<String>,
  },
  SourceTag {
    op: SourceTagOp,
  },
}

// A queueable unit of submission work. Once created the payload is immutable; retries operate on
// this serialized form.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SubmissionTask {
  pub handle: String,
  pub payload: TaskPayload,
  pub first_attempt_ms: u64,
  #[serde(default)]
  pub attempts: u32,
  #[serde(default)]
  pub not_before_ms: u64,
  #[serde(default)]
  pub queue_reason: Option<QueueingReason>,
}

impl SubmissionTask {
  #[must_use]
  pub fn lines(handle: &str, entity_type: EntityType, lines: Vec<String>, now_ms: u64) -> Self {
    Self {
      handle: handle.to_string(),
      payload: TaskPayload::Lines { entity_type, lines },
      first_attempt_ms: now_ms,
      attempts: 0,
      not_before_ms: 0,
      queue_reason: None,
    }
  }

  #[must_use]
  pub fn source_tag(handle: &str, op: SourceTagOp, now_ms: u64) -> Self {
    Self {
      handle: handle.to_string(),
      payload: TaskPayload::SourceTag { op },
      first_attempt_ms: now_ms,
      attempts: 0,
      not_before_ms: 0,
      queue_reason: None,
    }
  }

  #[must_use]
  pub fn entity_type(&self) -> EntityType {
    match &self.payload {
      TaskPayload::Lines { entity_type, .. } => *entity_type,
      TaskPayload::SourceTag { .. } => EntityType::SourceTag,
    }
  }

  // Cost of the task for rate accounting: item count for line batches, one for tag operations.
  #[must_use]
  pub fn weight(&self) -> usize {
    match &self.payload {
      TaskPayload::Lines { lines, .. } => lines.len(),
      TaskPayload::SourceTag { .. } => 1,
    }
  }

  // Split into two halves when pushback demands a smaller batch. Tasks at or below the minimum
  // split size (or single-operation tasks) come back unsplit.
  #[must_use]
  pub fn split(self, min_split_size: usize) -> Vec<Self> {
    match self.payload {
      TaskPayload::Lines { entity_type, lines } if lines.len() >= min_split_size * 2 => {
        let mut first = lines;
        let second = first.split_off(first.len() / 2);
        [first, second]
          .into_iter()
          .map(|half| Self {
            handle: self.handle.clone(),
            payload: TaskPayload::Lines {
              entity_type,
              lines: half,
            },
            first_attempt_ms: self.first_attempt_ms,
            attempts: self.attempts,
            not_before_ms: self.not_before_ms,
            queue_reason: self.queue_reason,
          })
          .collect()
      },
      payload => vec![Self { payload, ..self }],
    }
  }

  // One submission attempt against the backend. Transport failures classify as retryable.
  pub async fn execute(&self, api: &dyn BackendApi) -> TaskResult {
    let result = match &self.payload {
      TaskPayload::Lines { entity_type, lines } => {
        api
          .report(*entity_type, Bytes::from(lines.join("\n")))
          .await
      },
      TaskPayload::SourceTag { op } => api.source_tag(op).await,
    };
    match result {
      Ok(status) => classify_status(status),
      Err(ApiError::Timeout) => TaskResult::Retryable,
      Err(ApiError::Transport(e)) => {
        log::debug!("transport error submitting {}: {e}", self.handle);
        TaskResult::Retryable
      },
    }
  }
}
