// estuary - wavefront-compatible telemetry ingestion proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./mod_test.rs"]
mod mod_test;

mod point;
mod span;
pub mod util;

pub use point::PointRule;
pub use span::SpanRule;

use crate::model::{Point, Span};
use anyhow::Context;
use estuary_common::stats::Scope;
use itertools::Itertools;
use prometheus::IntCounter;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Instant;

//
// RuleConfig
//

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LengthLimitAction {
  Truncate,
  TruncateWithEllipsis,
  Drop,
}

// One preprocessor rule as configured. Rules apply in configuration order and are pure
// mutators; rejection stays the handler's job.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RuleConfig {
  AddTag {
    tag: String,
    value: String,
  },
  AddTagIfNotExists {
    tag: String,
    value: String,
  },
  DropTag {
    tag: String,
    #[serde(default)]
    r#match: Option<String>,
  },
  RenameTag {
    tag: String,
    newtag: String,
    #[serde(default)]
    r#match: Option<String>,
  },
  ExtractTag {
    tag: String,
    input: String,
    search: String,
    replace: String,
    #[serde(default)]
    replace_input: Option<String>,
    #[serde(default)]
    r#match: Option<String>,
    #[serde(default)]
    first_match_only: bool,
  },
  LimitLength {
    scope: String,
    max_length: usize,
    action_subtype: LengthLimitAction,
    #[serde(default)]
    r#match: Option<String>,
  },
  ForceLowercase {
    scope: String,
    #[serde(default)]
    r#match: Option<String>,
  },
  ReplaceRegex {
    scope: String,
    search: String,
    replace: String,
    #[serde(default)]
    r#match: Option<String>,
  },
}

impl RuleConfig {
  #[must_use]
  pub const fn action_name(&self) -> &'static str {
    match self {
      Self::AddTag { .. } => "addTag",
      Self::AddTagIfNotExists { .. } => "addTagIfNotExists",
      Self::DropTag { .. } => "dropTag",
      Self::RenameTag { .. } => "renameTag",
      Self::ExtractTag { .. } => "extractTag",
      Self::LimitLength { .. } => "limitLength",
      Self::ForceLowercase { .. } => "forceLowercase",
      Self::ReplaceRegex { .. } => "replaceRegex",
    }
  }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct PreprocessorConfig {
  #[serde(default)]
  pub points: Vec<RuleConfig>,
  #[serde(default)]
  pub spans: Vec<RuleConfig>,
}

//
// RuleMetrics
//

// Each rule owns an applied counter and a cpu-time counter.
pub struct RuleMetrics {
  applied: IntCounter,
  cpu_nanos: IntCounter,
}

impl RuleMetrics {
  #[must_use]
  pub fn new(scope: &Scope, rule_id: &str) -> Self {
    let labels = HashMap::from([("rule".to_string(), rule_id.to_string())]);
    Self {
      applied: scope.counter_with_labels("rule_applied", labels.clone()),
      cpu_nanos: scope.counter_with_labels("rule_cpu_nanos", labels),
    }
  }

  pub fn applied(&self) {
    self.applied.inc();
  }

  pub fn time<R>(&self, f: impl FnOnce() -> R) -> R {
    let start = Instant::now();
    let result = f();
    self
      .cpu_nanos
      .inc_by(u64::try_from(start.elapsed().as_nanos()).unwrap_or(u64::MAX));
    result
  }
}

//
// Preprocessor
//

// An ordered rule chain per entity kind, applied to every item before its handler sees it.
pub struct Preprocessor {
  point_rules: Vec<PointRule>,
  span_rules: Vec<SpanRule>,
}

impl Preprocessor {
  pub fn new(config: &PreprocessorConfig, scope: &Scope) -> anyhow::Result<Self> {
    let scope = scope.scope("preprocessor");
    let point_rules = config
      .points
      .iter()
      .enumerate()
      .map(|(i, rule)| {
        let metrics = RuleMetrics::new(&scope, &format!("points.{i}.{}", rule.action_name()));
        PointRule::compile(rule, metrics)
          .with_context(|| format!("invalid point rule #{i} ({})", rule.action_name()))
      })
      .try_collect()?;
    let span_rules = config
      .spans
      .iter()
      .enumerate()
      .map(|(i, rule)| {
        let metrics = RuleMetrics::new(&scope, &format!("spans.{i}.{}", rule.action_name()));
        SpanRule::compile(rule, metrics)
          .with_context(|| format!("invalid span rule #{i} ({})", rule.action_name()))
      })
      .try_collect()?;
    Ok(Self {
      point_rules,
      span_rules,
    })
  }

  pub fn preprocess_point(&self, point: &mut Point) {
    for rule in &self.point_rules {
      rule.apply(point);
    }
  }

  pub fn preprocess_span(&self, span: &mut Span) {
    for rule in &self.span_rules {
      rule.apply(span);
    }
  }
}
