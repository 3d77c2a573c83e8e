// estuary - wavefront-compatible telemetry ingestion proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./checkin_test.rs"]
mod checkin_test;

use crate::api::{AgentConfiguration, BackendApi, CheckinRequest};
use crate::clock::Clock;
use crate::sender::EntityProperties;
use crate::trace::RateSampler;
use anyhow::bail;
use estuary_common::duration::DurationExt;
use estuary_common::shutdown::ComponentShutdown;
use estuary_common::stats::Collector;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use time::Duration;
use time::ext::NumericalDuration;
use uuid::Uuid;

//
// CheckinTargets
//

// The components a check-in response is applied to.
#[derive(Clone, Default)]
pub struct CheckinTargets {
  pub points: Option<Arc<EntityProperties>>,
  pub delta_counters: Option<Arc<EntityProperties>>,
  pub histograms: Option<Arc<EntityProperties>>,
  pub spans: Option<Arc<EntityProperties>>,
  pub span_logs: Option<Arc<EntityProperties>>,
  pub source_tags: Option<Arc<EntityProperties>>,
  pub sampler: Option<Arc<RateSampler>>,
}

//
// CheckinConfig
//

#[derive(Clone, Debug)]
pub struct CheckinConfig {
  pub server: String,
  pub hostname: String,
  pub version: String,
  pub ephemeral: bool,
  pub interval: Duration,
  pub metrics_interval: Duration,
}

impl CheckinConfig {
  #[must_use]
  pub fn new(server: &str, hostname: &str) -> Self {
    Self {
      server: server.to_string(),
      hostname: hostname.to_string(),
      version: env!("CARGO_PKG_VERSION").to_string(),
      ephemeral: true,
      interval: 1.seconds(),
      metrics_interval: 60.seconds(),
    }
  }
}

// Outcome of one check-in attempt.
#[derive(Debug, Eq, PartialEq)]
enum Step {
  // Nothing to send or a transient failure; try again next interval.
  Idle,
  Applied,
  // The endpoint was autofixed; re-attempt immediately.
  RetryNow,
  ShutOff,
  StartupAbort,
}

//
// CheckinController
//

// Registers the proxy with the backend, performs the periodic check-in, transmits proxy metrics,
// and applies returned dynamic configuration to the running components.
pub struct CheckinController {
  api: Arc<dyn BackendApi>,
  collector: Collector,
  config: CheckinConfig,
  proxy_id: Uuid,
  targets: CheckinTargets,
  clock: Clock,
  // The pending metrics document and its capture timestamp. Never held across IO; taken before
  // the HTTP call and restored if the call fails in transit.
  snapshot: Mutex<Option<(serde_json::Value, u64)>>,
  had_successful_checkin: AtomicBool,
  retried_url_autofix: AtomicBool,
}

impl CheckinController {
  #[must_use]
  pub fn new(
    api: Arc<dyn BackendApi>,
    collector: Collector,
    config: CheckinConfig,
    proxy_id: Uuid,
    targets: CheckinTargets,
    clock: Clock,
  ) -> Arc<Self> {
    Arc::new(Self {
      api,
      collector,
      config,
      proxy_id,
      targets,
      clock,
      snapshot: Mutex::new(None),
      had_successful_checkin: AtomicBool::new(false),
      retried_url_autofix: AtomicBool::new(false),
    })
  }

  #[must_use]
  pub fn had_successful_checkin(&self) -> bool {
    self.had_successful_checkin.load(Ordering::Relaxed)
  }

  // Capture the process metrics document for the next check-in.
  pub fn capture_metrics(&self) {
    let snapshot = self.collector.snapshot_json();
    *self.snapshot.lock() = Some((snapshot, self.clock.now_ms()));
  }

  fn checkin_error(&self, message: &str, second_message: Option<&str>) {
    if self.had_successful_checkin() {
      log::error!(
        "{message}{}",
        second_message.map(|m| format!(" {m}")).unwrap_or_default()
      );
      return;
    }
    let frame = "*".repeat(message.len());
    log::error!("{frame}");
    log::error!("{message}");
    if let Some(second_message) = second_message {
      log::error!("{second_message}");
    }
    log::error!("{frame}");
  }

  fn apply(&self, config: &AgentConfiguration) {
    if let Some(current_time) = config.current_time {
      self.clock.rebase(current_time);
    }
    for props in [&self.targets.points, &self.targets.delta_counters] {
      if let Some(props) = props {
        props.set_rate_limit(config.collector_rate_limit);
        props.set_items_per_batch(config.points_per_batch);
      }
    }
    if let Some(props) = &self.targets.histograms {
      props.set_rate_limit(config.histogram_rate_limit);
      props.set_items_per_batch(config.histograms_per_batch);
      props.set_feature_disabled(config.histogram_disabled);
    }
    if let Some(props) = &self.targets.spans {
      props.set_rate_limit(config.span_rate_limit);
      props.set_items_per_batch(config.spans_per_batch);
      props.set_feature_disabled(config.trace_disabled);
    }
    if let Some(props) = &self.targets.span_logs {
      props.set_rate_limit(config.span_logs_rate_limit);
      props.set_items_per_batch(config.span_logs_per_batch);
      props.set_feature_disabled(config.span_logs_disabled);
    }
    for props in [
      &self.targets.points,
      &self.targets.delta_counters,
      &self.targets.histograms,
      &self.targets.spans,
      &self.targets.span_logs,
      &self.targets.source_tags,
    ]
    .into_iter()
    .flatten()
    {
      props.set_retry_backoff_base_seconds(config.retry_backoff_base_seconds);
      props.set_split_push_when_rate_limited(config.split_push_when_rate_limited);
    }
    if let Some(sampler) = &self.targets.sampler {
      sampler.set_rate(config.span_sampling_rate);
    }
  }

  async fn checkin_once(&self) -> Step {
    let Some((metrics, capture_ts)) = self.snapshot.lock().take() else {
      return Step::Idle;
    };
    let request = CheckinRequest {
      proxy_id: self.proxy_id,
      hostname: self.config.hostname.clone(),
      version: self.config.version.clone(),
      current_millis: capture_ts,
      metrics: metrics.clone(),
      ephemeral: self.config.ephemeral,
    };

    let response = match self.api.checkin(request).await {
      Ok(response) => response,
      Err(e) => {
        // Transport failure: keep the metrics document so the next attempt resends it.
        self.restore_snapshot(metrics, capture_ts);
        self.checkin_error(
          &format!("unable to check in with {}: {e}", self.config.server),
          Some("please verify your network/firewall settings!"),
        );
        return Step::Idle;
      },
    };

    let status = response.status;
    if status.is_success() {
      let config = response.config.unwrap_or_default();
      self.apply(&config);
      self.had_successful_checkin.store(true, Ordering::Relaxed);
      if config.shut_off_agents {
        log::warn!("shutting down: backend-side flag indicating proxy has to shut down");
        return Step::ShutOff;
      }
      return Step::Applied;
    }

    if status.is_server_error() {
      // The snapshot survives server errors so no metrics interval is lost.
      self.restore_snapshot(metrics, capture_ts);
      self.checkin_error(
        &format!("HTTP {status} error: unable to check in with {}", self.config.server),
        None,
      );
      return Step::Idle;
    }

    match status.as_u16() {
      401 => self.checkin_error(
        "HTTP 401 Unauthorized: please verify that your server and token settings are correct",
        Some("and that the token has proxy management permission!"),
      ),
      403 => self.checkin_error(
        "HTTP 403 Forbidden: please verify that your token has proxy management permission!",
        None,
      ),
      404 | 405 => {
        let server = self.config.server.trim_end_matches('/');
        if !self.had_successful_checkin()
          && !self.retried_url_autofix.swap(true, Ordering::Relaxed)
          && !server.ends_with("/api")
        {
          let fixed = format!("{server}/api/");
          self.checkin_error(
            &format!(
              "possible server endpoint misconfiguration detected, attempting to use {fixed}"
            ),
            None,
          );
          self.api.set_base_url(fixed);
          return Step::RetryNow;
        }
        let second = if server.ends_with("/api") {
          format!("current setting: {}", self.config.server)
        } else {
          format!(
            "server endpoint URLs normally end with '/api/'. Current setting: {}",
            self.config.server
          )
        };
        self.checkin_error(
          &format!(
            "HTTP {status}: misconfiguration detected, please verify that your server setting \
             is correct"
          ),
          Some(&second),
        );
        if !self.had_successful_checkin() {
          return Step::StartupAbort;
        }
      },
      407 => self.checkin_error(
        "HTTP 407 Proxy Authentication Required: please verify that proxyUser and proxyPassword",
        Some("settings are correct and make sure your HTTP proxy is not rate limiting!"),
      ),
      _ => self.checkin_error(
        &format!("HTTP {status} error: unable to check in with {}", self.config.server),
        None,
      ),
    }
    Step::Idle
  }

  fn restore_snapshot(&self, metrics: serde_json::Value, capture_ts: u64) {
    let mut snapshot = self.snapshot.lock();
    if snapshot.is_none() {
      *snapshot = Some((metrics, capture_ts));
    }
  }

  // The first check-in, performed synchronously at startup. A misconfigured endpoint that is
  // still failing after the /api autofix retry aborts startup.
  pub async fn perform_initial_checkin(&self) -> anyhow::Result<()> {
    self.capture_metrics();
    let mut step = self.checkin_once().await;
    if step == Step::RetryNow {
      self.capture_metrics();
      step = self.checkin_once().await;
    }
    match step {
      Step::StartupAbort => {
        bail!("server endpoint misconfiguration detected, aborting start-up")
      },
      Step::ShutOff => bail!("backend requested shut down during initial check-in"),
      _ => {
        if self.had_successful_checkin() {
          log::info!("initial configuration is available, setting up proxy");
        }
        Ok(())
      },
    }
  }

  // Run the periodic loops: metrics snapshot every metrics_interval, check-in every interval.
  // Returns when the backend orders a shut-off or shutdown is signaled.
  pub async fn run(self: Arc<Self>, mut shutdown: ComponentShutdown) -> RunExit {
    let snapshot_controller = self.clone();
    let mut snapshot_shutdown = shutdown.clone();
    tokio::spawn(async move {
      let mut interval = snapshot_controller.config.metrics_interval.interval();
      loop {
        tokio::select! {
          () = snapshot_shutdown.cancelled() => break,
          _ = interval.tick() => snapshot_controller.capture_metrics(),
        }
      }
      drop(snapshot_shutdown);
    });

    let exit = loop {
      tokio::select! {
        () = shutdown.cancelled() => break RunExit::Cancelled,
        () = self.config.interval.sleep() => {
          if self.checkin_once().await == Step::ShutOff {
            break RunExit::ShutOff;
          }
        },
      }
    };
    drop(shutdown);
    exit
  }
}

// Why the check-in loop returned.
#[derive(Debug, Eq, PartialEq)]
pub enum RunExit {
  ShutOff,
  Cancelled,
}
