// estuary - wavefront-compatible telemetry ingestion proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./util_test.rs"]
mod util_test;

use crate::model::{Point, Span};

// Expand {{...}} placeholders against an item. Undefined placeholders expand to the empty
// string.
fn expand(template: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
  let mut out = String::with_capacity(template.len());
  let mut rest = template;
  while let Some(start) = rest.find("{{") {
    out.push_str(&rest[..start]);
    let after = &rest[start + 2..];
    let Some(end) = after.find("}}") else {
      out.push_str(&rest[start..]);
      return out;
    };
    if let Some(value) = lookup(&after[..end]) {
      out.push_str(&value);
    }
    rest = &after[end + 2..];
  }
  out.push_str(rest);
  out
}

// Placeholders for points: {{metric}}, {{source}}, {{annotation.X}}.
#[must_use]
pub fn expand_point_placeholders(template: &str, point: &Point) -> String {
  if !template.contains("{{") {
    return template.to_string();
  }
  expand(template, |name| match name {
    "metric" => Some(point.metric.clone()),
    "source" => Some(point.source.clone()),
    _ => name.strip_prefix("annotation.").map(|key| {
      point.annotations.get(key).cloned().unwrap_or_default()
    }),
  })
}

// Placeholders for spans: {{spanName}}, {{source}}, {{annotation.X}} (first match wins).
#[must_use]
pub fn expand_span_placeholders(template: &str, span: &Span) -> String {
  if !template.contains("{{") {
    return template.to_string();
  }
  expand(template, |name| match name {
    "spanName" => Some(span.name.clone()),
    "source" => Some(span.source.clone()),
    _ => name
      .strip_prefix("annotation.")
      .map(|key| span.annotation(key).unwrap_or_default().to_string()),
  })
}
