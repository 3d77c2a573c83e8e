// estuary - wavefront-compatible telemetry ingestion proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::{CheckinConfig, CheckinController, CheckinTargets, Step};
use crate::api::{AgentConfiguration, CheckinResponse, MockBackendApi};
use crate::model::EntityType;
use crate::sender::{EntityProperties, EntityPropertiesConfig};
use crate::test::pinned_clock;
use crate::trace::RateSampler;
use estuary_common::stats::Collector;
use http::StatusCode;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use uuid::Uuid;

fn make_controller(
  api: MockBackendApi,
  server: &str,
  targets: CheckinTargets,
) -> (Arc<CheckinController>, Collector) {
  let collector = Collector::default();
  let controller = CheckinController::new(
    Arc::new(api),
    collector.clone(),
    CheckinConfig::new(server, "proxy-1"),
    Uuid::new_v4(),
    targets,
    pinned_clock(),
  );
  (controller, collector)
}

#[tokio::test]
async fn snapshot_survives_server_errors() {
  let delivered = Arc::new(Mutex::new(None));
  let cloned_delivered = delivered.clone();
  let calls = AtomicU32::new(0);
  let mut api = MockBackendApi::new();
  api.expect_checkin().times(11).returning(move |request| {
    let call = calls.fetch_add(1, Ordering::Relaxed);
    if call < 10 {
      Ok(CheckinResponse {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        config: None,
      })
    } else {
      *cloned_delivered.lock() = Some(request.metrics);
      Ok(CheckinResponse {
        status: StatusCode::OK,
        config: Some(AgentConfiguration::default()),
      })
    }
  });
  let (controller, collector) = make_controller(api, "https://host/api", CheckinTargets::default());

  collector.scope("proxy").counter("known").inc_by(7);
  controller.capture_metrics();
  let expected = collector.snapshot_json();

  for _ in 0..10 {
    assert_eq!(Step::Idle, controller.checkin_once().await);
    assert!(!controller.had_successful_checkin());
  }
  assert_eq!(Step::Applied, controller.checkin_once().await);

  // The snapshot captured before the failures is the one eventually delivered, unchanged.
  assert_eq!(Some(expected), *delivered.lock());
  assert!(controller.had_successful_checkin());
}

#[tokio::test]
async fn url_autofix_appends_api_and_retries() {
  let calls = AtomicU32::new(0);
  let mut api = MockBackendApi::new();
  api.expect_checkin().times(2).returning(move |_| {
    if calls.fetch_add(1, Ordering::Relaxed) == 0 {
      Ok(CheckinResponse {
        status: StatusCode::NOT_FOUND,
        config: None,
      })
    } else {
      Ok(CheckinResponse {
        status: StatusCode::OK,
        config: Some(AgentConfiguration::default()),
      })
    }
  });
  api
    .expect_set_base_url()
    .withf(|url| url == "https://host/api/")
    .times(1)
    .returning(|_| ());
  let (controller, _) = make_controller(api, "https://host", CheckinTargets::default());

  controller.perform_initial_checkin().await.unwrap();
  assert!(controller.had_successful_checkin());
}

#[tokio::test]
async fn startup_aborts_when_misconfigured_after_retry() {
  let mut api = MockBackendApi::new();
  api.expect_checkin().times(2).returning(|_| {
    Ok(CheckinResponse {
      status: StatusCode::NOT_FOUND,
      config: None,
    })
  });
  api.expect_set_base_url().times(1).returning(|_| ());
  let (controller, _) = make_controller(api, "https://host", CheckinTargets::default());

  assert!(controller.perform_initial_checkin().await.is_err());
  assert!(!controller.had_successful_checkin());
}

#[tokio::test]
async fn misconfiguration_with_api_suffix_aborts_immediately() {
  let mut api = MockBackendApi::new();
  api.expect_checkin().times(1).returning(|_| {
    Ok(CheckinResponse {
      status: StatusCode::METHOD_NOT_ALLOWED,
      config: None,
    })
  });
  let (controller, _) = make_controller(api, "https://host/api", CheckinTargets::default());

  assert!(controller.perform_initial_checkin().await.is_err());
}

#[tokio::test]
async fn shut_off_flag_stops_the_proxy() {
  let mut api = MockBackendApi::new();
  api.expect_checkin().times(1).returning(|_| {
    Ok(CheckinResponse {
      status: StatusCode::OK,
      config: Some(AgentConfiguration {
        shut_off_agents: true,
        ..AgentConfiguration::default()
      }),
    })
  });
  let (controller, _) = make_controller(api, "https://host/api", CheckinTargets::default());

  controller.capture_metrics();
  assert_eq!(Step::ShutOff, controller.checkin_once().await);
}

#[tokio::test]
async fn dynamic_configuration_applies_to_targets() {
  let mut api = MockBackendApi::new();
  api.expect_checkin().times(1).returning(|_| {
    Ok(CheckinResponse {
      status: StatusCode::OK,
      config: Some(AgentConfiguration {
        collector_rate_limit: Some(500.0),
        points_per_batch: Some(1000),
        trace_disabled: Some(true),
        span_sampling_rate: Some(0.25),
        retry_backoff_base_seconds: Some(4.0),
        ..AgentConfiguration::default()
      }),
    })
  });

  let points = EntityProperties::new(EntityPropertiesConfig::defaults_for(EntityType::Point));
  let spans = EntityProperties::new(EntityPropertiesConfig::defaults_for(EntityType::Span));
  let sampler = Arc::new(RateSampler::new(1.0));
  let targets = CheckinTargets {
    points: Some(points.clone()),
    spans: Some(spans.clone()),
    sampler: Some(sampler.clone()),
    ..CheckinTargets::default()
  };
  let (controller, _) = make_controller(api, "https://host/api", targets);

  controller.capture_metrics();
  assert_eq!(Step::Applied, controller.checkin_once().await);

  assert_eq!(500.0, points.rate_limit());
  assert_eq!(1000, points.items_per_batch());
  assert_eq!(4.0, points.retry_backoff_base_seconds());
  assert!(spans.is_feature_disabled());
  assert_eq!(0.25, sampler.rate());
}

#[tokio::test]
async fn clock_rebases_from_current_time() {
  let mut api = MockBackendApi::new();
  api.expect_checkin().times(1).returning(|_| {
    Ok(CheckinResponse {
      status: StatusCode::OK,
      config: Some(AgentConfiguration {
        current_time: Some(1_700_000_123_000),
        ..AgentConfiguration::default()
      }),
    })
  });
  let collector = Collector::default();
  let clock = crate::clock::Clock::default();
  let controller = CheckinController::new(
    Arc::new(api),
    collector,
    CheckinConfig::new("https://host/api", "proxy-1"),
    Uuid::new_v4(),
    CheckinTargets::default(),
    clock.clone(),
  );
  controller.capture_metrics();
  assert_eq!(Step::Applied, controller.checkin_once().await);
  // The logical clock now tracks the server time.
  let now = clock.now_ms();
  assert!((1_700_000_122_000..1_700_000_133_000).contains(&now), "{now}");
}
