// estuary - wavefront-compatible telemetry ingestion proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::util::expand_span_placeholders;
use super::{LengthLimitAction, RuleConfig, RuleMetrics};
use crate::model::{Annotation, Span};
use anyhow::bail;
use regex::Regex;

// Where a span rule reads and writes. Span annotations are ordered and may repeat, so
// annotation-scoped rules visit every occurrence of the key.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SpanScope {
  SpanName,
  Source,
  Annotation(String),
}

impl SpanScope {
  fn parse(scope: &str) -> Self {
    match scope {
      "spanName" => Self::SpanName,
      "sourceName" => Self::Source,
      key => Self::Annotation(key.to_string()),
    }
  }
}

fn compile_optional(pattern: Option<&String>) -> anyhow::Result<Option<Regex>> {
  Ok(match pattern {
    Some(pattern) => Some(Regex::new(pattern)?),
    None => None,
  })
}

fn truncate_to(value: &str, max_chars: usize) -> String {
  value.chars().take(max_chars).collect()
}

enum Kind {
  AddTag {
    tag: String,
    value: String,
    only_if_absent: bool,
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
    input: SpanScope,
    search: Regex,
    replace: String,
    replace_input: Option<String>,
    match_gate: Option<Regex>,
    first_match_only: bool,
  },
  LimitLength {
    scope: SpanScope,
    max_length: usize,
    action: LengthLimitAction,
    match_gate: Option<Regex>,
  },
  ForceLowercase {
    scope: SpanScope,
    match_gate: Option<Regex>,
  },
  ReplaceRegex {
    scope: SpanScope,
    search: Regex,
    replace: String,
    match_gate: Option<Regex>,
  },
}

//
// SpanRule
//

pub struct SpanRule {
  kind: Kind,
  metrics: RuleMetrics,
}

impl SpanRule {
  pub fn compile(config: &RuleConfig, metrics: RuleMetrics) -> anyhow::Result<Self> {
    let kind = match config {
      RuleConfig::AddTag { tag, value } => Kind::AddTag {
        tag: tag.clone(),
        value: value.clone(),
        only_if_absent: false,
      },
      RuleConfig::AddTagIfNotExists { tag, value } => Kind::AddTag {
        tag: tag.clone(),
        value: value.clone(),
        only_if_absent: true,
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
        first_match_only,
      } => Kind::ExtractTag {
        tag: tag.clone(),
        input: SpanScope::parse(input),
        search: Regex::new(search)?,
        replace: replace.clone(),
        replace_input: replace_input.clone(),
        match_gate: compile_optional(r#match.as_ref())?,
        first_match_only: *first_match_only,
      },
      RuleConfig::LimitLength {
        scope,
        max_length,
        action_subtype,
        r#match,
      } => {
        let scope = SpanScope::parse(scope);
        if *action_subtype == LengthLimitAction::Drop && !matches!(scope, SpanScope::Annotation(_))
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
        scope: SpanScope::parse(scope),
        match_gate: compile_optional(r#match.as_ref())?,
      },
      RuleConfig::ReplaceRegex {
        scope,
        search,
        replace,
        r#match,
      } => Kind::ReplaceRegex {
        scope: SpanScope::parse(scope),
        search: Regex::new(search)?,
        replace: replace.clone(),
        match_gate: compile_optional(r#match.as_ref())?,
      },
    };
    Ok(Self { kind, metrics })
  }

  pub fn apply(&self, span: &mut Span) {
    self.metrics.time(|| self.apply_inner(span));
  }

  // Extract against one input value: on a search hit, append the extracted annotation and
  // optionally return the rewritten input.
  fn extract_one(
    span: &Span,
    search: &Regex,
    match_gate: Option<&Regex>,
    replace: &str,
    replace_input: Option<&str>,
    input_value: &str,
  ) -> Option<(String, Option<String>)> {
    if match_gate.is_some_and(|m| !m.is_match(input_value)) {
      return None;
    }
    if !search.is_match(input_value) {
      return None;
    }
    let replace = expand_span_placeholders(replace, span);
    let extracted = search.replace_all(input_value, replace.as_str()).to_string();
    let rewritten = replace_input.map(|replace_input| {
      let replace_input = expand_span_placeholders(replace_input, span);
      search
        .replace_all(input_value, replace_input.as_str())
        .to_string()
    });
    Some((extracted, rewritten))
  }

  #[allow(clippy::too_many_lines)]
  fn apply_inner(&self, span: &mut Span) {
    match &self.kind {
      Kind::AddTag {
        tag,
        value,
        only_if_absent,
      } => {
        if *only_if_absent && span.annotation(tag).is_some() {
          return;
        }
        let value = expand_span_placeholders(value, span);
        span.annotations.push(Annotation::new(tag, &value));
        self.metrics.applied();
      },
      Kind::DropTag { tag, value_match } => {
        let before = span.annotations.len();
        span.annotations.retain(|a| {
          !(tag.is_match(&a.key) && value_match.as_ref().is_none_or(|m| m.is_match(&a.value)))
        });
        if span.annotations.len() != before {
          self.metrics.applied();
        }
      },
      Kind::RenameTag {
        tag,
        newtag,
        value_match,
      } => {
        let mut renamed = false;
        for annotation in &mut span.annotations {
          if annotation.key == *tag
            && value_match.as_ref().is_none_or(|m| m.is_match(&annotation.value))
          {
            annotation.key.clone_from(newtag);
            renamed = true;
          }
        }
        if renamed {
          self.metrics.applied();
        }
      },
      Kind::ExtractTag {
        tag,
        input,
        search,
        replace,
        replace_input,
        match_gate,
        first_match_only,
      } => match input {
        SpanScope::SpanName | SpanScope::Source => {
          let input_value = if *input == SpanScope::SpanName {
            span.name.clone()
          } else {
            span.source.clone()
          };
          let Some((extracted, rewritten)) = Self::extract_one(
            span,
            search,
            match_gate.as_ref(),
            replace,
            replace_input.as_deref(),
            &input_value,
          ) else {
            return;
          };
          if !extracted.is_empty() {
            span.annotations.push(Annotation::new(tag, &extracted));
            self.metrics.applied();
          }
          if let Some(rewritten) = rewritten {
            if *input == SpanScope::SpanName {
              span.name = rewritten;
            } else {
              span.source = rewritten;
            }
          }
        },
        SpanScope::Annotation(key) => {
          // Annotations are ordered and may repeat; visit each occurrence, stopping after the
          // first successful extract when firstMatchOnly is set.
          for i in 0..span.annotations.len() {
            if span.annotations[i].key != *key {
              continue;
            }
            let input_value = span.annotations[i].value.clone();
            let Some((extracted, rewritten)) = Self::extract_one(
              span,
              search,
              match_gate.as_ref(),
              replace,
              replace_input.as_deref(),
              &input_value,
            ) else {
              continue;
            };
            if !extracted.is_empty() {
              span.annotations.push(Annotation::new(tag, &extracted));
              self.metrics.applied();
            }
            if let Some(rewritten) = rewritten {
              span.annotations[i].value = rewritten;
            }
            if *first_match_only {
              break;
            }
          }
        },
      },
      Kind::LimitLength {
        scope,
        max_length,
        action,
        match_gate,
      } => {
        let limit = |value: &str| -> Option<String> {
          if match_gate.as_ref().is_some_and(|m| !m.is_match(value)) {
            return None;
          }
          if value.chars().count() <= *max_length {
            return None;
          }
          Some(match action {
            LengthLimitAction::TruncateWithEllipsis => {
              format!("{}...", truncate_to(value, max_length - 3))
            },
            _ => truncate_to(value, *max_length),
          })
        };
        match scope {
          SpanScope::SpanName => {
            if let Some(limited) = limit(&span.name) {
              span.name = limited;
              self.metrics.applied();
            }
          },
          SpanScope::Source => {
            if let Some(limited) = limit(&span.source) {
              span.source = limited;
              self.metrics.applied();
            }
          },
          SpanScope::Annotation(key) => {
            if *action == LengthLimitAction::Drop {
              let before = span.annotations.len();
              span.annotations.retain(|a| {
                a.key != *key
                  || match_gate.as_ref().is_some_and(|m| !m.is_match(&a.value))
                  || a.value.chars().count() <= *max_length
              });
              if span.annotations.len() != before {
                self.metrics.applied();
              }
            } else {
              let mut applied = false;
              for annotation in &mut span.annotations {
                if annotation.key == *key {
                  if let Some(limited) = limit(&annotation.value) {
                    annotation.value = limited;
                    applied = true;
                  }
                }
              }
              if applied {
                self.metrics.applied();
              }
            }
          },
        }
      },
      Kind::ForceLowercase { scope, match_gate } => {
        let lower = |value: &str| -> Option<String> {
          if match_gate.as_ref().is_some_and(|m| !m.is_match(value)) {
            return None;
          }
          let lowered = value.to_lowercase();
          (lowered != value).then_some(lowered)
        };
        match scope {
          SpanScope::SpanName => {
            if let Some(lowered) = lower(&span.name) {
              span.name = lowered;
              self.metrics.applied();
            }
          },
          SpanScope::Source => {
            if let Some(lowered) = lower(&span.source) {
              span.source = lowered;
              self.metrics.applied();
            }
          },
          SpanScope::Annotation(key) => {
            let mut applied = false;
            for annotation in &mut span.annotations {
              if annotation.key == *key {
                if let Some(lowered) = lower(&annotation.value) {
                  annotation.value = lowered;
                  applied = true;
                }
              }
            }
            if applied {
              self.metrics.applied();
            }
          },
        }
      },
      Kind::ReplaceRegex {
        scope,
        search,
        replace,
        match_gate,
      } => {
        let replace = expand_span_placeholders(replace, span);
        let replaced = |value: &str| -> Option<String> {
          if match_gate.as_ref().is_some_and(|m| !m.is_match(value)) {
            return None;
          }
          let replaced = search.replace_all(value, replace.as_str()).to_string();
          (replaced != value).then_some(replaced)
        };
        match scope {
          SpanScope::SpanName => {
            if let Some(value) = replaced(&span.name) {
              span.name = value;
              self.metrics.applied();
            }
          },
          SpanScope::Source => {
            if let Some(value) = replaced(&span.source) {
              span.source = value;
              self.metrics.applied();
            }
          },
          SpanScope::Annotation(key) => {
            let mut applied = false;
            let mut updates = vec![];
            for (i, annotation) in span.annotations.iter().enumerate() {
              if annotation.key == *key {
                if let Some(value) = replaced(&annotation.value) {
                  updates.push((i, value));
                }
              }
            }
            for (i, value) in updates {
              span.annotations[i].value = value;
              applied = true;
            }
            if applied {
              self.metrics.applied();
            }
          },
        }
      },
    }
  }
}
