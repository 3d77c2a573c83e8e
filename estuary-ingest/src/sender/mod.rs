// estuary - wavefront-compatible telemetry ingestion proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./mod_test.rs"]
mod mod_test;

pub mod properties;

pub use properties::{EntityProperties, EntityPropertiesConfig, NO_RATE_LIMIT};

use crate::api::BackendApi;
use crate::clock::Clock;
use crate::handler::HandlerMetrics;
use crate::model::{EntityType, HandlerKey, SourceTagOp};
use crate::queue::{QueueingReason, SubmissionTask, TaskQueue, TaskResult};
use estuary_common::duration::DurationExt;
use estuary_common::stats::Scope;
use estuary_common::warn_every;
use parking_lot::Mutex;
use prometheus::{Histogram, IntCounter};
use std::collections::VecDeque;
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use time::ext::NumericalDuration;

const MAX_RETRY_BACKOFF_SECONDS: f64 = 60.0;

// Exponential backoff for a task's next queue retry: base^attempts seconds, capped, plus up to
// 10% jitter.
#[must_use]
pub fn retry_backoff_ms(base_seconds: f64, attempts: u32) -> u64 {
  let attempts = i32::try_from(attempts).unwrap_or(i32::MAX);
  let backoff_seconds = base_seconds
    .max(1.0)
    .powi(attempts.max(1))
    .min(MAX_RETRY_BACKOFF_SECONDS);
  let mut hasher = RandomState::new().build_hasher();
  attempts.hash(&mut hasher);
  let jitter = (hasher.finish() % 1000) as f64 / 1000.0 * 0.1;
  #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
  {
    (backoff_seconds * (1.0 + jitter) * 1000.0) as u64
  }
}

//
// Item
//

// A single buffered unit of work. Lines for the batched report path, individual operations for
// source tags.
#[derive(Clone, Debug)]
pub enum Item {
  Line(String),
  SourceTag(SourceTagOp),
}

//
// PoolStats
//

#[derive(Clone)]
struct PoolStats {
  submission_time: Histogram,
  dropped_shutdown: IntCounter,
  queued_rate_limit: IntCounter,
  queued_buffer_size: IntCounter,
  queued_proxy_shutdown: IntCounter,
  queued_server_error: IntCounter,
}

impl PoolStats {
  fn new(scope: &Scope) -> Self {
    let queued = |reason: &str| {
      scope.counter_with_labels(
        "queued",
        std::collections::HashMap::from([("reason".to_string(), reason.to_string())]),
      )
    };
    Self {
      submission_time: scope.histogram("submission_time"),
      dropped_shutdown: scope.counter("dropped_shutdown"),
      queued_rate_limit: queued("rateLimit"),
      queued_buffer_size: queued("bufferSize"),
      queued_proxy_shutdown: queued("proxyShutdown"),
      queued_server_error: queued("serverError"),
    }
  }

  const fn queued_counter(&self, reason: QueueingReason) -> &IntCounter {
    match reason {
      QueueingReason::RateLimit => &self.queued_rate_limit,
      QueueingReason::BufferSize => &self.queued_buffer_size,
      QueueingReason::ProxyShutdown => &self.queued_proxy_shutdown,
      QueueingReason::ServerError => &self.queued_server_error,
    }
  }
}

//
// SenderTask
//

// One sender inside a pool. Owns its in-memory buffer and a head queue of split tasks awaiting
// resubmission. Only the task's own flush loop drains either.
pub struct SenderTask {
  key: HandlerKey,
  api: Arc<dyn BackendApi>,
  props: Arc<EntityProperties>,
  metrics: Arc<HandlerMetrics>,
  queue: Arc<dyn TaskQueue>,
  clock: Clock,
  buffer: Mutex<VecDeque<Item>>,
  head_tasks: Mutex<VecDeque<SubmissionTask>>,
  stats: PoolStats,
}

impl SenderTask {
  // Proxy for queue depth, used to bias new work away from the most loaded task.
  fn task_relative_score(&self) -> usize {
    self.buffer.lock().len()
      + self
        .head_tasks
        .lock()
        .iter()
        .map(SubmissionTask::weight)
        .sum::<usize>()
  }

  fn add(&self, item: Item) {
    self.buffer.lock().push_back(item);
  }

  fn spool(&self, mut task: SubmissionTask, reason: QueueingReason, with_backoff: bool) {
    task.queue_reason = Some(reason);
    if with_backoff {
      task.not_before_ms = self.clock.now_ms().saturating_add(retry_backoff_ms(
        self.props.retry_backoff_base_seconds(),
        task.attempts,
      ));
    }
    self.stats.queued_counter(reason).inc_by(task.weight() as u64);
    if let Err(e) = self.queue.add(&task) {
      // WF-500: an internal failure must never escape into the caller.
      log::error!("WF-500 failed to spool task for {}: {e}", self.key);
    }
  }

  async fn execute(&self, mut task: SubmissionTask) {
    let weight = task.weight();
    task.attempts += 1;
    self.metrics.sent.inc_by(weight as u64);
    let timer = self.stats.submission_time.start_timer();
    let result = task.execute(self.api.as_ref()).await;
    drop(timer);

    match result {
      TaskResult::Delivered => {
        self.metrics.delivered.inc_by(weight as u64);
      },
      TaskResult::Pushback => {
        self.props.rate_limiter().recycle(weight as f64);
        let min_split = self.props.min_batch_split_size();
        if self.props.is_split_push_when_rate_limited() && weight >= min_split * 2 {
          log::debug!("pushback on {}, splitting batch of {weight}", self.key);
          let mut head_tasks = self.head_tasks.lock();
          for half in task.split(min_split).into_iter().rev() {
            head_tasks.push_front(half);
          }
        } else {
          self.spool(task, QueueingReason::RateLimit, false);
        }
      },
      TaskResult::Retryable => {
        self.props.rate_limiter().recycle(weight as f64);
        warn_every!(
          15.seconds(),
          "transient submission failure for {}, spooling batch of {}",
          self.key,
          weight
        );
        self.spool(task, QueueingReason::ServerError, true);
      },
      TaskResult::PermanentRejected(status) => {
        self.metrics.failed.inc_by(weight as u64);
        warn_every!(
          15.seconds(),
          "batch of {} for {} rejected with {}, dropping",
          weight,
          self.key,
          status
        );
      },
    }
  }

  // Drop everything buffered without submitting, counting it as blocked. Used while the entity
  // is disabled by the backend.
  fn drop_blocked(&self) {
    let buffered = {
      let mut buffer = self.buffer.lock();
      let count = buffer.len();
      buffer.clear();
      count
    };
    let head_weight = {
      let mut head_tasks = self.head_tasks.lock();
      let weight: usize = head_tasks.iter().map(SubmissionTask::weight).sum();
      head_tasks.clear();
      weight
    };
    let total = buffered + head_weight;
    if total > 0 {
      self.metrics.blocked.inc_by(total as u64);
    }
  }

  fn take_batch(&self) -> Vec<SubmissionTask> {
    let items_per_batch = self.props.items_per_batch().max(1);
    let limiter = self.props.rate_limiter();
    let now_ms = self.clock.now_ms();
    let mut buffer = self.buffer.lock();
    if buffer.is_empty() {
      return vec![];
    }

    match self.key.entity_type {
      EntityType::SourceTag => {
        let mut tasks = vec![];
        while tasks.len() < items_per_batch {
          if !limiter.try_acquire(1.0) {
            break;
          }
          let Some(Item::SourceTag(op)) = buffer.pop_front() else {
            limiter.recycle(1.0);
            break;
          };
          tasks.push(SubmissionTask::source_tag(&self.key.handle, op, now_ms));
        }
        tasks
      },
      entity_type => {
        let planned = buffer.len().min(items_per_batch);
        if !limiter.try_acquire(planned as f64) {
          // Tokens are not available this window; leave the data buffered.
          return vec![];
        }
        let lines = buffer
          .drain(..planned)
          .map(|item| match item {
            Item::Line(line) => line,
            Item::SourceTag(op) => op.to_line(),
          })
          .collect();
        vec![SubmissionTask::lines(
          &self.key.handle,
          entity_type,
          lines,
          now_ms,
        )]
      },
    }
  }

  async fn flush_once(&self) {
    if self.props.is_feature_disabled() {
      self.drop_blocked();
      return;
    }

    // Split halves from earlier pushback retry first, in order.
    loop {
      let task = {
        let mut head_tasks = self.head_tasks.lock();
        let Some(task) = head_tasks.front() else { break };
        if !self.props.rate_limiter().try_acquire(task.weight() as f64) {
          return;
        }
        head_tasks.pop_front().unwrap()
      };
      self.execute(task).await;
    }

    for task in self.take_batch() {
      self.execute(task).await;
    }
  }

  async fn run(self: Arc<Self>, mut shutdown: estuary_common::shutdown::ComponentShutdown) {
    loop {
      let interval = self.props.push_flush_interval();
      tokio::select! {
        () = shutdown.cancelled() => break,
        () = interval.sleep() => self.flush_once().await,
      }
    }
    drop(shutdown);
  }
}

//
// SenderTaskPool
//

// A pool of N sender tasks for one handler key. Items are assigned round-robin, advancing once
// more when the pick is currently the most loaded task.

pub struct SenderTaskPool {
  key: HandlerKey,
  props: Arc<EntityProperties>,
  queue: Arc<dyn TaskQueue>,
  tasks: Vec<Arc<SenderTask>>,
  round_robin: AtomicU64,
  accepting: AtomicBool,
  stats: PoolStats,
  clock: Clock,
}

impl SenderTaskPool {
  #[must_use]
  pub fn new(
    key: HandlerKey,
    num_tasks: usize,
    api: Arc<dyn BackendApi>,
    props: Arc<EntityProperties>,
    metrics: Arc<HandlerMetrics>,
    queue: Arc<dyn TaskQueue>,
    scope: &Scope,
    clock: Clock,
  ) -> Arc<Self> {
    let scope = scope.scope("sender");
    let stats = PoolStats::new(&scope);
    let tasks = (0..num_tasks.max(1))
      .map(|_| {
        Arc::new(SenderTask {
          key: key.clone(),
          api: api.clone(),
          props: props.clone(),
          metrics: metrics.clone(),
          queue: queue.clone(),
          clock: clock.clone(),
          buffer: Mutex::default(),
          head_tasks: Mutex::default(),
          stats: stats.clone(),
        })
      })
      .collect();

    Arc::new(Self {
      key,
      props,
      queue,
      tasks,
      round_robin: AtomicU64::new(0),
      accepting: AtomicBool::new(true),
      stats,
      clock,
    })
  }

  pub fn start(&self, shutdown_handle: &estuary_common::shutdown::ComponentShutdownTriggerHandle) {
    for task in &self.tasks {
      let task = task.clone();
      let shutdown = shutdown_handle.make_shutdown();
      tokio::spawn(async move { task.run(shutdown).await });
    }
  }

  fn pick(&self) -> &Arc<SenderTask> {
    let len = self.tasks.len() as u64;
    let mut next = (self.round_robin.fetch_add(1, Ordering::Relaxed) % len) as usize;
    let mut worst_score = 0;
    let mut worst_task = 0;
    for (i, task) in self.tasks.iter().enumerate() {
      let score = task.task_relative_score();
      if score > worst_score {
        worst_score = score;
        worst_task = i;
      }
    }
    if next == worst_task {
      next = (self.round_robin.fetch_add(1, Ordering::Relaxed) % len) as usize;
    }
    &self.tasks[next]
  }

  pub fn submit(&self, item: Item) {
    if !self.accepting.load(Ordering::Relaxed) {
      self.stats.dropped_shutdown.inc();
      return;
    }
    self.pick().add(item);

    if self.total_buffered() > self.props.memory_buffer_limit() {
      self.drain_buffers_to_queue(QueueingReason::BufferSize);
    }
  }

  pub fn submit_line(&self, line: String) {
    self.submit(Item::Line(line));
  }

  #[must_use]
  pub fn total_buffered(&self) -> usize {
    self.tasks.iter().map(|t| t.task_relative_score()).sum()
  }

  #[must_use]
  pub fn properties(&self) -> &Arc<EntityProperties> {
    &self.props
  }

  // Spool everything currently buffered, across all tasks in the pool.
  pub fn drain_buffers_to_queue(&self, reason: QueueingReason) {
    let items_per_batch = self.props.items_per_batch().max(1);
    let now_ms = self.clock.now_ms();
    for task in &self.tasks {
      let head_tasks: Vec<SubmissionTask> = task.head_tasks.lock().drain(..).collect();
      for head_task in head_tasks {
        task.spool(head_task, reason, false);
      }

      let mut buffer = task.buffer.lock();
      while !buffer.is_empty() {
        let planned = buffer.len().min(items_per_batch);
        match self.key.entity_type {
          EntityType::SourceTag => {
            if let Some(Item::SourceTag(op)) = buffer.pop_front() {
              task.spool(
                SubmissionTask::source_tag(&self.key.handle, op, now_ms),
                reason,
                false,
              );
            }
          },
          entity_type => {
            let lines = buffer
              .drain(..planned)
              .map(|item| match item {
                Item::Line(line) => line,
                Item::SourceTag(op) => op.to_line(),
              })
              .collect();
            task.spool(
              SubmissionTask::lines(&self.key.handle, entity_type, lines, now_ms),
              reason,
              false,
            );
          },
        }
      }
    }
    self.queue.sync();
    log::info!(
      "[{}] drained memory buffers to queue ({reason})",
      self.key.handle
    );
  }

  // Drive one flush pass on every task without waiting on the flush timers.
  #[cfg(test)]
  pub(crate) async fn flush_all(&self) {
    for task in &self.tasks {
      task.flush_once().await;
    }
  }

  // Stop intake and spool any remaining buffered data. Flush loops are stopped separately via
  // their shutdown trigger with a join deadline.
  pub fn shutdown(&self) {
    self.accepting.store(false, Ordering::Relaxed);
    self.drain_buffers_to_queue(QueueingReason::ProxyShutdown);
  }
}
