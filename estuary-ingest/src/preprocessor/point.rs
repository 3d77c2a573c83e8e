// estuary - wavefront-compatible telemetry ingestion proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::util::expand_point_placeholders;
use super::{LengthLimitAction, RuleConfig, RuleMetrics};
use crate::model::Point;
use anyhow::bail;
use regex::Regex;

// Where a point rule reads and writes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PointScope {
  Metric,
  Source,
  Annotation(String),
}

impl PointScope {
  fn parse(scope: &str) -> Self {
    match scope {
      "metricName" => Self::Metric,
      "sourceName" => Self::Source,
      key => Self::Annotation(key.to_string()),
    }
  }

  fn get(&self, point: &Point) -> Option<String> {
    match self {
      Self::Metric => Some(point.metric.clone()),
      Self::Source => Some(point.source.clone()),
      Self::Annotation(key) => point.annotations.get(key).cloned(),
    }
  }

  fn set(&self, point: &mut Point, value: String) {
    match self {
      Self::Metric => point.metric = value,
      Self::Source => point.source = value,
      Self::Annotation(key) => {
        point.annotations.insert(key.clone(), value);
      },
    }
  }
}

fn compile_optional(pattern: Option<&String>) -> anyhow::Result<Option<Regex>> {
  Ok(match pattern {
    Some(pattern) => Some(Regex::new(pattern)?),
    None => None,
  })
}

// Truncate on a char boundary.
fn truncate_to(value: &str, max_chars: usize) -> String {
  value.chars().take(max_chars).collect()
}

enum Kind {
  AddTag {
    tag: String,
    value: String,
  },
  AddTagIfNotExists {
    tag: String,
    value: String,
  },
  DropTag {
    tag: Regex,
    value_match: Option<Regex>,
  },
  RenameTag {
    tag: String,
    newtag: String,
    value_match: Option<Regex>,
  },
  ExtractTag {
    tag: String,
    input: PointScope,
    search: Regex,
    replace: String,
    replace_input: Option<String>,
    match_gate: Option<Regex>,
  },
  LimitLength {
    scope: PointScope,
    max_length: usize,
    action: LengthLimitAction,
    match_gate: Option<Regex>,
  },
  ForceLowercase {
    scope: PointScope,
    match_gate: Option<Regex>,
  },
  ReplaceRegex {
    scope: PointScope,
    search: Regex,
    replace: String,
    match_gate: Option<Regex>,
  },
}

//
// PointRule
//

pub struct PointRule {
  kind: Kind,
  metrics: RuleMetrics,
}

impl PointRule {
  pub fn compile(config: &RuleConfig, metrics: RuleMetrics) -> anyhow::Result<Self> {
    let kind = match config {
      RuleConfig::AddTag { tag, value } => Kind::AddTag {
        tag: tag.clone(),
        value: value.clone(),
      },
      RuleConfig::AddTagIfNotExists { tag, value } => Kind::AddTagIfNotExists {
        tag: tag.clone(),
        value: value.clone(),
      },
      RuleConfig::DropTag { tag, r#match } => Kind::DropTag {
        tag: Regex::new(tag)?,
        value_match: compile_optional(r#match.as_ref())?,
      },
      RuleConfig::RenameTag {
        tag,
        newtag,
        r#match,
      } => Kind::RenameTag {
        tag: tag.clone(),
        newtag: newtag.clone(),
        value_match: compile_optional(r#match.as_ref())?,
      },
      RuleConfig::ExtractTag {
        tag,
        input,
        search,
        replace,
        replace_input,
        r#match,
        ..
      } => Kind::ExtractTag {
        tag: tag.clone(),
        input: PointScope::parse(input),
        search: Regex::new(search)?,
        replace: replace.clone(),
        replace_input: replace_input.clone(),
        match_gate: compile_optional(r#match.as_ref())?,
      },
      RuleConfig::LimitLength {
        scope,
        max_length,
        action_subtype,
        r#match,
      } => {
        let scope = PointScope::parse(scope);
        if *action_subtype == LengthLimitAction::Drop && !matches!(scope, PointScope::Annotation(_))
        {
          bail!("limitLength DROP is only valid for annotations");
        }
        if *action_subtype == LengthLimitAction::TruncateWithEllipsis && *max_length < 3 {
          bail!("limitLength TRUNCATE_WITH_ELLIPSIS requires maxLength >= 3");
        }
        Kind::LimitLength {
          scope,
          max_length: *max_length,
          action: *action_subtype,
          match_gate: compile_optional(r#match.as_ref())?,
        }
      },
      RuleConfig::ForceLowercase { scope, r#match } => Kind::ForceLowercase {
        scope: PointScope::parse(scope),
        match_gate: compile_optional(r#match.as_ref())?,
      },
      RuleConfig::ReplaceRegex {
        scope,
        search,
        replace,
        r#match,
      } => Kind::ReplaceRegex {
        scope: PointScope::parse(scope),
        search: Regex::new(search)?,
        replace: replace.clone(),
        match_gate: compile_optional(r#match.as_ref())?,
      },
    };
    Ok(Self { kind, metrics })
  }

  pub fn apply(&self, point: &mut Point) {
    self.metrics.time(|| self.apply_inner(point));
  }

  fn apply_inner(&self, point: &mut Point) {
    match &self.kind {
      Kind::AddTag { tag, value } => {
        let value = expand_point_placeholders(value, point);
        point.annotations.insert(tag.clone(), value);
        self.metrics.applied();
      },
      Kind::AddTagIfNotExists { tag, value } => {
        if !point.annotations.contains_key(tag) {
          let value = expand_point_placeholders(value, point);
          point.annotations.insert(tag.clone(), value);
          self.metrics.applied();
        }
      },
      Kind::DropTag { tag, value_match } => {
        let before = point.annotations.len();
        point.annotations.retain(|key, value| {
          !(tag.is_match(key) && value_match.as_ref().is_none_or(|m| m.is_match(value)))
        });
        if point.annotations.len() != before {
          self.metrics.applied();
        }
      },
      Kind::RenameTag {
        tag,
        newtag,
        value_match,
      } => {
        let matches = point
          .annotations
          .get(tag)
          .is_some_and(|value| value_match.as_ref().is_none_or(|m| m.is_match(value)));
        if matches {
          if let Some(value) = point.annotations.remove(tag) {
            point.annotations.insert(newtag.clone(), value);
            self.metrics.applied();
          }
        }
      },
      Kind::ExtractTag {
        tag,
        input,
        search,
        replace,
        replace_input,
        match_gate,
      } => {
        let Some(source_value) = input.get(point) else {
          return;
        };
        if match_gate.as_ref().is_some_and(|m| !m.is_match(&source_value)) {
          return;
        }
        if !search.is_match(&source_value) {
          return;
        }
        let replace = expand_point_placeholders(replace, point);
        let extracted = search.replace_all(&source_value, replace.as_str()).to_string();
        if !extracted.is_empty() {
          point.annotations.insert(tag.clone(), extracted);
          self.metrics.applied();
        }
        if let Some(replace_input) = replace_input {
          let replace_input = expand_point_placeholders(replace_input, point);
          let rewritten = search
            .replace_all(&source_value, replace_input.as_str())
            .to_string();
          input.set(point, rewritten);
        }
      },
      Kind::LimitLength {
        scope,
        max_length,
        action,
        match_gate,
      } => {
        let Some(value) = scope.get(point) else { return };
        if match_gate.as_ref().is_some_and(|m| !m.is_match(&value)) {
          return;
        }
        if value.chars().count() <= *max_length {
          return;
        }
        match action {
          LengthLimitAction::Truncate => {
            scope.set(point, truncate_to(&value, *max_length));
          },
          LengthLimitAction::TruncateWithEllipsis => {
            scope.set(point, format!("{}...", truncate_to(&value, max_length - 3)));
          },
          LengthLimitAction::Drop => {
            if let PointScope::Annotation(key) = scope {
              point.annotations.remove(key);
            }
          },
        }
        self.metrics.applied();
      },
      Kind::ForceLowercase { scope, match_gate } => {
        let Some(value) = scope.get(point) else { return };
        if match_gate.as_ref().is_some_and(|m| !m.is_match(&value)) {
          return;
        }
        let lowered = value.to_lowercase();
        if lowered != value {
          scope.set(point, lowered);
          self.metrics.applied();
        }
      },
      Kind::ReplaceRegex {
        scope,
        search,
        replace,
        match_gate,
      } => {
        let Some(value) = scope.get(point) else { return };
        if match_gate.as_ref().is_some_and(|m| !m.is_match(&value)) {
          return;
        }
        let replace = expand_point_placeholders(replace, point);
        let replaced = search.replace_all(&value, replace.as_str()).to_string();
        if replaced != value {
          scope.set(point, replaced);
          self.metrics.applied();
        }
      },
    }
  }
}
