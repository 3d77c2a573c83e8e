// estuary - wavefront-compatible telemetry ingestion proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./processor_test.rs"]
mod processor_test;

use super::{QueueingReason, SubmissionTask, TaskQueue, TaskResult};
use crate::api::BackendApi;
use crate::clock::Clock;
use crate::handler::HandlerMetrics;
use crate::model::HandlerKey;
use crate::sender::{EntityProperties, retry_backoff_ms};
use estuary_common::duration::DurationExt;
use estuary_common::shutdown::ComponentShutdown;
use estuary_common::stats::Scope;
use prometheus::IntCounter;
use std::sync::Arc;
use time::ext::NumericalDuration;

struct Stats {
  dead_lettered: IntCounter,
  requeued: IntCounter,
}

//
// QueueProcessor
//

// Drains the disk spool for one handler key back through the submission path. The head task is
// always attempted first; tasks that exhaust their attempts or age out are dead-lettered.
pub struct QueueProcessor {
  key: HandlerKey,
  queue: Arc<dyn TaskQueue>,
  api: Arc<dyn BackendApi>,
  props: Arc<EntityProperties>,
  metrics: Arc<HandlerMetrics>,
  clock: Clock,
  stats: Stats,
}

impl QueueProcessor {
  #[must_use]
  pub fn new(
    key: HandlerKey,
    queue: Arc<dyn TaskQueue>,
    api: Arc<dyn BackendApi>,
    props: Arc<EntityProperties>,
    metrics: Arc<HandlerMetrics>,
    scope: &Scope,
    clock: Clock,
  ) -> Arc<Self> {
    let scope = scope.scope("queue_processor");
    Arc::new(Self {
      key,
      queue,
      api,
      props,
      metrics,
      clock,
      stats: Stats {
        dead_lettered: scope.counter("dead_lettered"),
        requeued: scope.counter("requeued"),
      },
    })
  }

  pub fn start(self: &Arc<Self>, shutdown: ComponentShutdown) {
    let processor = self.clone();
    tokio::spawn(async move { processor.run(shutdown).await });
  }

  async fn run(self: Arc<Self>, mut shutdown: ComponentShutdown) {
    loop {
      let idle = self.process_head().await;
      let wait = if idle { 1.seconds() } else { 10.milliseconds() };
      tokio::select! {
        () = shutdown.cancelled() => break,
        () = wait.sleep() => {},
      }
    }
    drop(shutdown);
  }

  // Attempt the head task once. Returns true when the loop should idle before looking again.
  async fn process_head(&self) -> bool {
    let Some(task) = self.queue.peek() else {
      return true;
    };
    let now_ms = self.clock.now_ms();
    if task.not_before_ms > now_ms {
      return true;
    }

    let weight = task.weight();
    if task.attempts >= self.props.max_task_attempts()
      || now_ms.saturating_sub(task.first_attempt_ms) > self.props.max_queue_age_ms()
    {
      self.stats.dead_lettered.inc_by(weight as u64);
      log::warn!(
        "[{}] dead-lettering task of weight {weight} after {} attempts",
        self.key.handle,
        task.attempts
      );
      let _ignored = self.queue.remove();
      return false;
    }

    if self.props.is_feature_disabled() {
      self.metrics.blocked.inc_by(weight as u64);
      let _ignored = self.queue.remove();
      return false;
    }

    if !self.props.rate_limiter().try_acquire(weight as f64) {
      return true;
    }

    if self.queue.remove().is_err() {
      self.props.rate_limiter().recycle(weight as f64);
      return true;
    }
    self.execute(task).await;
    false
  }

  async fn execute(&self, mut task: SubmissionTask) {
    let weight = task.weight();
    task.attempts += 1;
    self.metrics.sent.inc_by(weight as u64);
    let result = task.execute(self.api.as_ref()).await;
    match result {
      TaskResult::Delivered => {
        self.metrics.delivered.inc_by(weight as u64);
      },
      TaskResult::Pushback => {
        self.props.rate_limiter().recycle(weight as f64);
        let min_split = self.props.min_batch_split_size();
        if self.props.is_split_push_when_rate_limited() && weight >= min_split * 2 {
          for half in task.split(min_split) {
            self.requeue(half, QueueingReason::RateLimit, false);
          }
        } else {
          self.requeue(task, QueueingReason::RateLimit, true);
        }
      },
      TaskResult::Retryable => {
        self.props.rate_limiter().recycle(weight as f64);
        self.requeue(task, QueueingReason::ServerError, true);
      },
      TaskResult::PermanentRejected(status) => {
        self.metrics.failed.inc_by(weight as u64);
        log::warn!(
          "[{}] queued batch of {weight} rejected with {status}, dropping",
          self.key.handle
        );
      },
    }
  }

  fn requeue(&self, mut task: SubmissionTask, reason: QueueingReason, with_backoff: bool) {
    task.queue_reason = Some(reason);
    if with_backoff {
      task.not_before_ms = self.clock.now_ms().saturating_add(retry_backoff_ms(
        self.props.retry_backoff_base_seconds(),
        task.attempts,
      ));
    }
    self.stats.requeued.inc();
    if let Err(e) = self.queue.add(&task) {
      log::error!("WF-500 failed to requeue task for {}: {e}", self.key);
    }
    self.queue.sync();
  }
}
