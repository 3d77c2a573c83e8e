// estuary - wavefront-compatible telemetry ingestion proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

mod file;
mod processor;
mod task;

pub use file::FileTaskQueue;
pub use processor::QueueProcessor;
pub use task::{QueueingReason, SubmissionTask, TaskPayload, TaskResult, classify_status};

//
// TaskQueue
//

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct QueueStats {
  pub tasks: usize,
  pub bytes: u64,
  // first_attempt_ms of the head task, used to derive the oldest-task age.
  pub oldest_first_attempt_ms: Option<u64>,
}

// The disk spool contract. The head task is always re-attempted first, including across
// restarts.
#[cfg_attr(test, mockall::automock)]
pub trait TaskQueue: Send + Sync {
  fn add(&self, task: &SubmissionTask) -> anyhow::Result<()>;
  fn peek(&self) -> Option<SubmissionTask>;
  fn remove(&self) -> anyhow::Result<()>;
  fn size(&self) -> usize;
  fn stats(&self) -> QueueStats;
  fn clear(&self) -> anyhow::Result<()>;
  // Durability barrier, called on batch boundaries rather than on the hot path.
  fn sync(&self);
}
