// estuary - wavefront-compatible telemetry ingestion proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./lib_test.rs"]
mod lib_test;

pub mod config;

use crate::config::ProxyConfig;
use anyhow::Context;
use estuary_common::duration::DurationExt;
use estuary_common::shutdown::{ComponentShutdownTrigger, ComponentShutdownTriggerHandle};
use estuary_common::stats::{Collector, Scope};
use estuary_ingest::accumulator::{DeltaAccumulator, HistogramAccumulator};
use estuary_ingest::api::{BackendApi, HyperBackendApi};
use estuary_ingest::checkin::{CheckinConfig, CheckinController, CheckinTargets, RunExit};
use estuary_ingest::clock::Clock;
use estuary_ingest::handler::{
  AnyHandler,
  DeltaCounterHandler,
  HandlerCommon,
  HandlerMetrics,
  HandlerRegistry,
  HistogramHandler,
  PointHandler,
  RegistryEntry,
  SourceTagHandler,
  SpanHandler,
  SpanLogsHandler,
};
use estuary_ingest::model::{EntityType, HandlerKey};
use estuary_ingest::preprocessor::Preprocessor;
use estuary_ingest::queue::{FileTaskQueue, QueueProcessor, TaskQueue};
use estuary_ingest::sender::{EntityProperties, EntityPropertiesConfig, SenderTaskPool};
use estuary_ingest::trace::{CompositeSampler, DurationSampler, RateSampler, Sampler, SpanFanIn};
use estuary_ingest::validation::ValidationConfig;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use time::ext::NumericalDuration;
use uuid::Uuid;

pub const EXIT_OK: i32 = 0;
pub const EXIT_SHUT_OFF: i32 = 1;
pub const EXIT_CHECKIN_MISCONFIGURED: i32 = -5;

//
// Proxy
//

// The assembled pipeline: one handler/pool/queue triple per configured handler key, the
// accumulators and trace fan-in feeding them, and the check-in controller steering the dynamic
// properties.
pub struct Proxy {
  pub registry: Arc<HandlerRegistry>,
  pub fan_in: Option<Arc<SpanFanIn>>,
  pub controller: Arc<CheckinController>,
  collector: Collector,
  shutdown_trigger: ComponentShutdownTrigger,
}

struct Wiring {
  config: ProxyConfig,
  collector: Collector,
  scope: Scope,
  api: Arc<dyn BackendApi>,
  clock: Clock,
  preprocessor: Option<Arc<Preprocessor>>,
  properties: HashMap<EntityType, Arc<EntityProperties>>,
  registry: Arc<HandlerRegistry>,
  shutdown_handle: ComponentShutdownTriggerHandle,
}

impl Wiring {
  fn properties_for(&mut self, entity_type: EntityType) -> Arc<EntityProperties> {
    self
      .properties
      .entry(entity_type)
      .or_insert_with(|| {
        let mut config = EntityPropertiesConfig::defaults_for(entity_type);
        let push = &self.config.push;
        if let Some(rate_limit) = push.rate_limit {
          config.rate_limit = rate_limit;
        }
        if let Some(burst) = push.rate_limit_max_burst_seconds {
          config.rate_limit_max_burst_seconds = burst;
        }
        if let Some(interval) = push.push_flush_interval_ms {
          config.push_flush_interval_ms = interval;
        }
        if let Some(items_per_batch) = push.items_per_batch {
          config.items_per_batch = items_per_batch;
        }
        if let Some(min_split) = push.min_batch_split_size {
          config.min_batch_split_size = min_split;
        }
        if let Some(split) = push.split_push_when_rate_limited {
          config.split_push_when_rate_limited = split;
        }
        if let Some(base) = push.retry_backoff_base_seconds {
          config.retry_backoff_base_seconds = base;
        }
        EntityProperties::new(config)
      })
      .clone()
  }

  // Provision the sender pool, disk queue, and queue processor for one handler key.
  fn make_pipeline(
    &mut self,
    key: &HandlerKey,
  ) -> anyhow::Result<(Scope, Arc<HandlerCommon>, Arc<SenderTaskPool>, Arc<dyn TaskQueue>)> {
    let scope = self.collector.scope(&key.to_string());
    let props = self.properties_for(key.entity_type);
    let metrics = HandlerMetrics::new(&scope);
    let queue: Arc<dyn TaskQueue> = Arc::new(
      FileTaskQueue::open(&self.config.spool_dir.join(key.to_string()), &scope)
        .with_context(|| format!("opening spool for {key}"))?,
    );
    let pool = SenderTaskPool::new(
      key.clone(),
      self.config.flush_threads,
      self.api.clone(),
      props.clone(),
      metrics.clone(),
      queue.clone(),
      &scope,
      self.clock.clone(),
    );
    pool.start(&self.shutdown_handle);
    let processor = QueueProcessor::new(
      key.clone(),
      queue.clone(),
      self.api.clone(),
      props,
      metrics.clone(),
      &scope,
      self.clock.clone(),
    );
    processor.start(self.shutdown_handle.make_shutdown());

    let common = HandlerCommon::new(
      key.clone(),
      self.config.blocked_items_per_batch,
      metrics,
      &scope,
    );
    common.start_stats_task(self.shutdown_handle.make_shutdown());
    Ok((scope, common, pool, queue))
  }
}

impl Proxy {
  #[allow(clippy::too_many_lines)]
  pub fn new(config: ProxyConfig) -> anyhow::Result<Self> {
    let collector = Collector::default();
    let scope = collector.scope("proxy");
    let clock = Clock::default();
    let api: Arc<dyn BackendApi> = Arc::new(HyperBackendApi::new(
      config.server.clone(),
      config.token.clone(),
      30.seconds(),
    ));
    Self::new_with_api(config, collector, scope, api, clock)
  }

  // Separated so tests can wire a mock API underneath the full pipeline.
  #[allow(clippy::too_many_lines)]
  pub fn new_with_api(
    config: ProxyConfig,
    collector: Collector,
    scope: Scope,
    api: Arc<dyn BackendApi>,
    clock: Clock,
  ) -> anyhow::Result<Self> {
    let preprocessor = if config.preprocessor.points.is_empty()
      && config.preprocessor.spans.is_empty()
    {
      None
    } else {
      Some(Arc::new(Preprocessor::new(&config.preprocessor, &scope)?))
    };

    let shutdown_trigger = ComponentShutdownTrigger::default();
    let mut wiring = Wiring {
      collector: collector.clone(),
      scope,
      api: api.clone(),
      clock: clock.clone(),
      preprocessor,
      properties: HashMap::new(),
      registry: Arc::new(HandlerRegistry::default()),
      shutdown_handle: shutdown_trigger.make_handle(),
      config,
    };
    let validation = ValidationConfig::default();

    for handle in wiring.config.listeners.points.clone() {
      let key = HandlerKey::new(EntityType::Point, &handle);
      let (_, common, pool, queue) = wiring.make_pipeline(&key)?;
      let handler = PointHandler::new(
        common,
        validation.clone(),
        wiring.preprocessor.clone(),
        pool.clone(),
        clock.clone(),
      );
      wiring.registry.insert(
        key,
        RegistryEntry {
          handler: AnyHandler::Point(handler),
          pool,
          queue,
        },
      );
    }

    for handle in wiring.config.listeners.delta_counters.clone() {
      let key = HandlerKey::new(EntityType::DeltaCounter, &handle);
      let (scope, common, pool, queue) = wiring.make_pipeline(&key)?;
      let accumulator = DeltaAccumulator::new(
        i64::try_from(wiring.config.delta_aggregation_interval_secs)
          .unwrap_or(60)
          .seconds(),
        pool.clone(),
        &scope,
        clock.clone(),
      );
      accumulator.start(wiring.shutdown_handle.make_shutdown());
      let handler = DeltaCounterHandler::new(
        common,
        validation.clone(),
        wiring.preprocessor.clone(),
        accumulator,
        clock.clone(),
      );
      wiring.registry.insert(
        key,
        RegistryEntry {
          handler: AnyHandler::Delta(handler),
          pool,
          queue,
        },
      );
    }

    for listener in wiring.config.listeners.histograms.clone() {
      let key = HandlerKey::new(EntityType::Histogram, &listener.handle);
      let (scope, common, pool, queue) = wiring.make_pipeline(&key)?;
      let accumulator = HistogramAccumulator::new(
        listener.granularity.into(),
        i64::try_from(wiring.config.histogram_flush_interval_secs)
          .unwrap_or(60)
          .seconds(),
        pool.clone(),
        &scope,
        clock.clone(),
      );
      accumulator.start(wiring.shutdown_handle.make_shutdown());
      let handler = HistogramHandler::new(
        common,
        validation.clone(),
        wiring.preprocessor.clone(),
        accumulator,
        &scope,
        clock.clone(),
      );
      wiring.registry.insert(
        key,
        RegistryEntry {
          handler: AnyHandler::Histogram(handler),
          pool,
          queue,
        },
      );
    }

    let mut first_span_handler = None;
    for handle in wiring.config.listeners.spans.clone() {
      let key = HandlerKey::new(EntityType::Span, &handle);
      let (_, common, pool, queue) = wiring.make_pipeline(&key)?;
      let handler = SpanHandler::new(common, validation.clone(), pool.clone(), clock.clone());
      first_span_handler.get_or_insert_with(|| handler.clone());
      wiring.registry.insert(
        key,
        RegistryEntry {
          handler: AnyHandler::Span(handler),
          pool,
          queue,
        },
      );
    }

    let mut first_span_logs_handler = None;
    for handle in wiring.config.listeners.span_logs.clone() {
      let key = HandlerKey::new(EntityType::SpanLogs, &handle);
      let (_, common, pool, queue) = wiring.make_pipeline(&key)?;
      let handler = SpanLogsHandler::new(common, pool.clone());
      first_span_logs_handler.get_or_insert_with(|| handler.clone());
      wiring.registry.insert(
        key,
        RegistryEntry {
          handler: AnyHandler::SpanLogs(handler),
          pool,
          queue,
        },
      );
    }

    for handle in wiring.config.listeners.source_tags.clone() {
      let key = HandlerKey::new(EntityType::SourceTag, &handle);
      let (_, common, pool, queue) = wiring.make_pipeline(&key)?;
      let handler = SourceTagHandler::new(common, pool.clone());
      wiring.registry.insert(
        key,
        RegistryEntry {
          handler: AnyHandler::SourceTag(handler),
          pool,
          queue,
        },
      );
    }

    // The rate sampler stays separately addressable so check-in can retune it; a configured
    // duration threshold composes with it under any-of semantics.
    let rate_sampler = Arc::new(RateSampler::new(wiring.config.sampling.rate));
    let sampler: Arc<dyn Sampler> = match wiring.config.sampling.duration_threshold_ms {
      Some(threshold_ms) => Arc::new(CompositeSampler::new(vec![
        rate_sampler.clone(),
        Arc::new(DurationSampler::new(threshold_ms)),
      ])),
      None => rate_sampler.clone(),
    };
    let fan_in = if let Some(span_handler) = first_span_handler {
      // Heartbeats are plain points; route them through a point pool, provisioning a dedicated
      // one when no point listener is configured.
      let point_pool = match wiring
        .registry
        .get(&HandlerKey::new(
          EntityType::Point,
          wiring
            .config
            .listeners
            .points
            .first()
            .map_or("heartbeat", String::as_str),
        )) {
        Some(entry) => entry.pool.clone(),
        None => {
          let key = HandlerKey::new(EntityType::Point, "heartbeat");
          let (_, common, pool, queue) = wiring.make_pipeline(&key)?;
          let handler = PointHandler::new(
            common,
            validation.clone(),
            None,
            pool.clone(),
            clock.clone(),
          );
          wiring.registry.insert(
            key,
            RegistryEntry {
              handler: AnyHandler::Point(handler),
              pool: pool.clone(),
              queue,
            },
          );
          pool
        },
      };
      let fan_in_scope = wiring.scope.clone();
      let fan_in = SpanFanIn::new(
        wiring.preprocessor.clone(),
        sampler.clone(),
        wiring.config.sampling.always_sample_errors,
        span_handler,
        first_span_logs_handler,
        point_pool,
        &fan_in_scope,
        clock.clone(),
      );
      fan_in.start_heartbeat_task(wiring.shutdown_handle.make_shutdown());
      Some(fan_in)
    } else {
      None
    };

    let targets = CheckinTargets {
      points: wiring.properties.get(&EntityType::Point).cloned(),
      delta_counters: wiring.properties.get(&EntityType::DeltaCounter).cloned(),
      histograms: wiring.properties.get(&EntityType::Histogram).cloned(),
      spans: wiring.properties.get(&EntityType::Span).cloned(),
      span_logs: wiring.properties.get(&EntityType::SpanLogs).cloned(),
      source_tags: wiring.properties.get(&EntityType::SourceTag).cloned(),
      sampler: Some(rate_sampler),
    };
    let controller = CheckinController::new(
      api,
      collector.clone(),
      CheckinConfig {
        ephemeral: wiring.config.ephemeral,
        ..CheckinConfig::new(&wiring.config.server, &wiring.config.hostname)
      },
      Uuid::new_v4(),
      targets,
      clock,
    );

    Ok(Self {
      registry: wiring.registry,
      fan_in,
      controller,
      collector,
      shutdown_trigger,
    })
  }

  #[must_use]
  pub fn collector(&self) -> &Collector {
    &self.collector
  }

  // Drain everything and stop all worker tasks, allowing in-flight submissions a 5 second
  // deadline to complete.
  pub async fn shutdown(self) {
    for pool in self.registry.pools() {
      pool.shutdown();
    }
    let deadline = 5.seconds();
    if deadline
      .timeout(self.shutdown_trigger.shutdown())
      .await
      .is_err()
    {
      log::warn!("shutdown deadline elapsed with tasks still in flight");
    }
  }
}

// Run the proxy until the shutdown future resolves or the backend orders a shut-off. Returns
// the process exit code.
pub async fn run_server(
  config: ProxyConfig,
  config_check_only: bool,
  shutdown_future: impl Future<Output = ()>,
) -> anyhow::Result<i32> {
  let proxy = Proxy::new(config)?;
  if config_check_only {
    log::info!("configuration is valid, exiting");
    return Ok(EXIT_OK);
  }

  if let Err(e) = proxy.controller.perform_initial_checkin().await {
    log::error!("aborting start-up: {e}");
    return Ok(EXIT_CHECKIN_MISCONFIGURED);
  }

  let checkin_shutdown_trigger = ComponentShutdownTrigger::default();
  let checkin = proxy
    .controller
    .clone()
    .run(checkin_shutdown_trigger.make_shutdown());
  tokio::pin!(checkin);

  let exit_code = tokio::select! {
    () = shutdown_future => EXIT_OK,
    exit = &mut checkin => match exit {
      RunExit::ShutOff => EXIT_SHUT_OFF,
      RunExit::Cancelled => EXIT_OK,
    },
  };

  // Check-in stops immediately; the pipeline drains to the spool before exit.
  checkin_shutdown_trigger.shutdown_now();
  proxy.shutdown().await;
  Ok(exit_code)
}
