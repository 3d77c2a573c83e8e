// estuary - wavefront-compatible telemetry ingestion proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./config_test.rs"]
mod config_test;

use anyhow::Context;
use estuary_ingest::accumulator::Granularity;
use estuary_ingest::preprocessor::PreprocessorConfig;
use serde::Deserialize;
use std::path::PathBuf;

fn default_hostname() -> String {
  std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

const fn default_flush_threads() -> usize {
  2
}

const fn default_blocked_items_per_batch() -> u32 {
  10
}

const fn default_aggregation_interval_secs() -> u64 {
  60
}

const fn default_true() -> bool {
  true
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum GranularityConfig {
  Minute,
  Hour,
  Day,
}

impl From<GranularityConfig> for Granularity {
  fn from(granularity: GranularityConfig) -> Self {
    match granularity {
      GranularityConfig::Minute => Self::Minute,
      GranularityConfig::Hour => Self::Hour,
      GranularityConfig::Day => Self::Day,
    }
  }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HistogramListenerConfig {
  pub handle: String,
  pub granularity: GranularityConfig,
}

// Which handles (customarily port numbers) feed which entity pipeline. The wire listeners
// themselves live outside this crate; a handle here provisions the handler, sender pool, and
// spool for it.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenersConfig {
  #[serde(default)]
  pub points: Vec<String>,
  #[serde(default)]
  pub delta_counters: Vec<String>,
  #[serde(default)]
  pub histograms: Vec<HistogramListenerConfig>,
  #[serde(default)]
  pub spans: Vec<String>,
  #[serde(default)]
  pub span_logs: Vec<String>,
  #[serde(default)]
  pub source_tags: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SamplingConfig {
  #[serde(default = "default_sampling_rate")]
  pub rate: f64,
  #[serde(default = "default_true")]
  pub always_sample_errors: bool,
  // When set, spans slower than this are kept regardless of the probabilistic rate.
  #[serde(default)]
  pub duration_threshold_ms: Option<u64>,
}

const fn default_sampling_rate() -> f64 {
  1.0
}

impl Default for SamplingConfig {
  fn default() -> Self {
    Self {
      rate: default_sampling_rate(),
      always_sample_errors: true,
      duration_threshold_ms: None,
    }
  }
}

// Initial sender tunables, applied to every entity type. The backend may override the dynamic
// subset of these at check-in time.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PushConfig {
  #[serde(default)]
  pub rate_limit: Option<f64>,
  #[serde(default)]
  pub rate_limit_max_burst_seconds: Option<u32>,
  #[serde(default)]
  pub push_flush_interval_ms: Option<u64>,
  #[serde(default)]
  pub items_per_batch: Option<u32>,
  #[serde(default)]
  pub min_batch_split_size: Option<u32>,
  #[serde(default)]
  pub split_push_when_rate_limited: Option<bool>,
  #[serde(default)]
  pub retry_backoff_base_seconds: Option<f64>,
}

//
// ProxyConfig
//

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
  pub server: String,
  pub token: String,
  #[serde(default = "default_hostname")]
  pub hostname: String,
  #[serde(default = "default_true")]
  pub ephemeral: bool,
  pub spool_dir: PathBuf,
  #[serde(default = "default_flush_threads")]
  pub flush_threads: usize,
  #[serde(default = "default_blocked_items_per_batch")]
  pub blocked_items_per_batch: u32,
  #[serde(default = "default_aggregation_interval_secs")]
  pub delta_aggregation_interval_secs: u64,
  #[serde(default = "default_aggregation_interval_secs")]
  pub histogram_flush_interval_secs: u64,
  #[serde(default)]
  pub listeners: ListenersConfig,
  #[serde(default)]
  pub sampling: SamplingConfig,
  #[serde(default)]
  pub push: PushConfig,
  #[serde(default)]
  pub preprocessor: PreprocessorConfig,
}

pub fn load_from_file(path: &str) -> anyhow::Result<ProxyConfig> {
  let contents =
    std::fs::read_to_string(path).with_context(|| format!("reading config file {path}"))?;
  serde_yaml::from_str(&contents).with_context(|| format!("parsing config file {path}"))
}
