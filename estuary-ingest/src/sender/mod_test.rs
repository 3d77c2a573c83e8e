// estuary - wavefront-compatible telemetry ingestion proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::retry_backoff_ms;
use crate::api::MockBackendApi;
use crate::model::{EntityType, SourceOperationType, SourceTagAction, SourceTagOp};
use crate::queue::{QueueingReason, TaskQueue};
use crate::sender::Item;
use crate::test::make_pipeline;
use http::StatusCode;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

#[tokio::test(start_paused = true)]
async fn healthy_delivery_updates_counters() {
  let mut api = MockBackendApi::new();
  api
    .expect_report()
    .times(1)
    .returning(|_, _| Ok(StatusCode::ACCEPTED));
  let harness = make_pipeline(EntityType::Point, api, |_| {});

  for i in 0..5 {
    harness.pool.submit_line(format!("line-{i}"));
  }
  harness.pool.flush_all().await;

  assert_eq!(5, harness.metrics.sent.get());
  assert_eq!(5, harness.metrics.delivered.get());
  assert_eq!(0, harness.queue.size());
}

#[tokio::test(start_paused = true)]
async fn pushback_splits_without_loss_or_duplication() {
  let bodies = Arc::new(Mutex::new(vec![]));
  let cloned_bodies = bodies.clone();
  let calls = AtomicU32::new(0);
  let mut api = MockBackendApi::new();
  api.expect_report().times(3).returning(move |_, body| {
    let call = calls.fetch_add(1, Ordering::Relaxed);
    if call == 0 {
      Ok(StatusCode::NOT_ACCEPTABLE)
    } else {
      cloned_bodies
        .lock()
        .push(String::from_utf8(body.to_vec()).unwrap());
      Ok(StatusCode::ACCEPTED)
    }
  });
  let harness = make_pipeline(EntityType::Point, api, |config| {
    config.items_per_batch = 40;
    config.min_batch_split_size = 10;
    config.split_push_when_rate_limited = true;
  });

  for i in 0..40 {
    harness.pool.submit_line(format!("line-{i}"));
  }
  // First flush: one batch of 40 is pushed back and split in two. Second flush: both halves go
  // through.
  harness.pool.flush_all().await;
  harness.pool.flush_all().await;

  let delivered: Vec<String> = bodies
    .lock()
    .iter()
    .flat_map(|body| body.lines().map(str::to_string).collect::<Vec<_>>())
    .collect();
  assert_eq!(
    (0..40).map(|i| format!("line-{i}")).collect::<Vec<_>>(),
    delivered
  );
  // 40 attempted + 20 + 20 after the split; 40 delivered.
  assert_eq!(80, harness.metrics.sent.get());
  assert_eq!(40, harness.metrics.delivered.get());
  assert_eq!(0, harness.queue.size());
}

#[tokio::test(start_paused = true)]
async fn pushback_below_split_threshold_spools() {
  let mut api = MockBackendApi::new();
  api
    .expect_report()
    .times(1)
    .returning(|_, _| Ok(StatusCode::NOT_ACCEPTABLE));
  let harness = make_pipeline(EntityType::Point, api, |config| {
    config.items_per_batch = 10;
    config.min_batch_split_size = 10;
    config.split_push_when_rate_limited = true;
  });

  for i in 0..10 {
    harness.pool.submit_line(format!("line-{i}"));
  }
  harness.pool.flush_all().await;

  assert_eq!(1, harness.queue.size());
  let task = harness.queue.peek().unwrap();
  assert_eq!(Some(QueueingReason::RateLimit), task.queue_reason);
  assert_eq!(10, task.weight());
}

#[tokio::test(start_paused = true)]
async fn transient_error_spools_with_backoff() {
  let mut api = MockBackendApi::new();
  api
    .expect_report()
    .times(1)
    .returning(|_, _| Ok(StatusCode::SERVICE_UNAVAILABLE));
  let harness = make_pipeline(EntityType::Point, api, |_| {});

  harness.pool.submit_line("line-0".to_string());
  harness.pool.flush_all().await;

  assert_eq!(1, harness.queue.size());
  let task = harness.queue.peek().unwrap();
  assert_eq!(Some(QueueingReason::ServerError), task.queue_reason);
  assert_eq!(1, task.attempts);
  assert!(task.not_before_ms > crate::test::TEST_NOW_MS);
  assert_eq!(0, harness.metrics.delivered.get());
}

#[tokio::test(start_paused = true)]
async fn permanent_client_error_drops() {
  let mut api = MockBackendApi::new();
  api
    .expect_report()
    .times(1)
    .returning(|_, _| Ok(StatusCode::UNAUTHORIZED));
  let harness = make_pipeline(EntityType::Point, api, |_| {});

  harness.pool.submit_line("line-0".to_string());
  harness.pool.flush_all().await;

  assert_eq!(0, harness.queue.size());
  assert_eq!(1, harness.metrics.failed.get());
  assert_eq!(0, harness.metrics.delivered.get());
}

#[tokio::test(start_paused = true)]
async fn feature_disabled_blocks_without_http() {
  // No expectations on the mock: any HTTP call would panic the test.
  let api = MockBackendApi::new();
  let harness = make_pipeline(EntityType::Span, api, |_| {});
  harness.props.set_feature_disabled(Some(true));

  for i in 0..100 {
    harness.pool.submit_line(format!("span-{i}"));
  }
  harness.pool.flush_all().await;
  assert_eq!(100, harness.metrics.blocked.get());
  assert_eq!(0, harness.metrics.sent.get());
}

#[tokio::test(start_paused = true)]
async fn feature_reenabled_resumes() {
  let mut api = MockBackendApi::new();
  api
    .expect_report()
    .times(1)
    .returning(|_, _| Ok(StatusCode::ACCEPTED));
  let harness = make_pipeline(EntityType::Span, api, |_| {});

  harness.props.set_feature_disabled(Some(true));
  harness.pool.submit_line("span-0".to_string());
  harness.pool.flush_all().await;
  assert_eq!(1, harness.metrics.blocked.get());

  harness.props.set_feature_disabled(None);
  harness.pool.submit_line("span-1".to_string());
  harness.pool.flush_all().await;
  assert_eq!(1, harness.metrics.delivered.get());
}

#[tokio::test(start_paused = true)]
async fn rate_limited_flush_leaves_items_buffered() {
  // No expectations: nothing should reach the API while the limiter is dry.
  let api = MockBackendApi::new();
  let harness = make_pipeline(EntityType::Point, api, |config| {
    config.rate_limit = 10.0;
    config.rate_limit_max_burst_seconds = 1;
    config.items_per_batch = 20;
  });

  for i in 0..20 {
    harness.pool.submit_line(format!("line-{i}"));
  }
  harness.pool.flush_all().await;
  assert_eq!(20, harness.pool.total_buffered());
  assert_eq!(0, harness.metrics.sent.get());
}

#[tokio::test(start_paused = true)]
async fn buffer_overflow_drains_to_queue() {
  let api = MockBackendApi::new();
  let harness = make_pipeline(EntityType::Point, api, |config| {
    config.items_per_batch = 2;
  });

  // memory_buffer_limit = 32; the 33rd submit trips the drain.
  for i in 0..33 {
    harness.pool.submit_line(format!("line-{i}"));
  }
  assert_eq!(0, harness.pool.total_buffered());
  assert!(harness.queue.size() >= 16);
  let task = harness.queue.peek().unwrap();
  assert_eq!(Some(QueueingReason::BufferSize), task.queue_reason);
}

#[tokio::test(start_paused = true)]
async fn shutdown_drains_with_proxy_shutdown_reason() {
  let api = MockBackendApi::new();
  let harness = make_pipeline(EntityType::Point, api, |_| {});

  for i in 0..5 {
    harness.pool.submit_line(format!("line-{i}"));
  }
  harness.pool.shutdown();
  assert_eq!(1, harness.queue.size());
  assert_eq!(
    Some(QueueingReason::ProxyShutdown),
    harness.queue.peek().unwrap().queue_reason
  );

  // New items after shutdown are dropped, not buffered.
  harness.pool.submit_line("late".to_string());
  assert_eq!(0, harness.pool.total_buffered());
}

#[tokio::test(start_paused = true)]
async fn source_tag_ops_submit_individually() {
  let mut api = MockBackendApi::new();
  api
    .expect_source_tag()
    .times(3)
    .returning(|_| Ok(StatusCode::OK));
  let harness = make_pipeline(EntityType::SourceTag, api, |_| {});

  for i in 0..3 {
    harness.pool.submit(Item::SourceTag(SourceTagOp {
      op: SourceOperationType::SourceTag,
      action: SourceTagAction::Add,
      source: format!("host-{i}"),
      annotations: vec!["env.prod".to_string()],
    }));
  }
  harness.pool.flush_all().await;
  assert_eq!(3, harness.metrics.delivered.get());
}

#[test]
fn backoff_formula() {
  // base^n seconds, capped at 60 s, plus at most 10% jitter.
  let backoff = retry_backoff_ms(2.0, 1);
  assert!((2000..=2200).contains(&backoff), "{backoff}");
  let backoff = retry_backoff_ms(2.0, 3);
  assert!((8000..=8800).contains(&backoff), "{backoff}");
  let backoff = retry_backoff_ms(2.0, 20);
  assert!((60_000..=66_000).contains(&backoff), "{backoff}");
}
