// estuary - wavefront-compatible telemetry ingestion proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::{Preprocessor, PreprocessorConfig};
use crate::model::Annotation;
use crate::test::{make_point, make_span};
use estuary_common::stats::{Collector, test::Helper};
use pretty_assertions::assert_eq;
use prometheus::labels;

fn make_preprocessor(yaml: &str) -> (Preprocessor, Helper) {
  let collector = Collector::default();
  let config: PreprocessorConfig = serde_yaml::from_str(yaml).unwrap();
  let preprocessor = Preprocessor::new(&config, &collector.scope("points")).unwrap();
  (preprocessor, Helper::new(collector))
}

#[test]
fn add_tag_with_placeholder_expansion() {
  let (preprocessor, _) = make_preprocessor(
    r"
points:
- action: addTag
  tag: k
  value: '{{source}}-{{annotation.a}}'
",
  );
  let mut point = make_point("m", "s", 0, 1.0);
  point.annotations.insert("a".to_string(), "b".to_string());
  preprocessor.preprocess_point(&mut point);
  assert_eq!(Some(&"s-b".to_string()), point.annotations.get("k"));
}

#[test]
fn add_tag_if_not_exists_does_not_overwrite() {
  let (preprocessor, _) = make_preprocessor(
    r"
points:
- action: addTagIfNotExists
  tag: env
  value: dev
",
  );
  let mut point = make_point("m", "s", 0, 1.0);
  point
    .annotations
    .insert("env".to_string(), "prod".to_string());
  preprocessor.preprocess_point(&mut point);
  assert_eq!(Some(&"prod".to_string()), point.annotations.get("env"));
}

#[test]
fn drop_tag_with_value_filter() {
  let (preprocessor, helper) = make_preprocessor(
    r"
points:
- action: dropTag
  tag: env
  match: staging
",
  );
  let mut point = make_point("m", "s", 0, 1.0);
  point
    .annotations
    .insert("env".to_string(), "staging".to_string());
  point.annotations.insert("app".to_string(), "x".to_string());
  preprocessor.preprocess_point(&mut point);

  assert_eq!(None, point.annotations.get("env"));
  assert_eq!(Some(&"x".to_string()), point.annotations.get("app"));
  helper.assert_counter_eq(
    1,
    "points:preprocessor:rule_applied",
    &labels! {"rule" => "points.0.dropTag"},
  );

  // A non-matching value is untouched and the counter does not move.
  let mut point = make_point("m", "s", 0, 1.0);
  point
    .annotations
    .insert("env".to_string(), "prod".to_string());
  preprocessor.preprocess_point(&mut point);
  assert_eq!(Some(&"prod".to_string()), point.annotations.get("env"));
  helper.assert_counter_eq(
    1,
    "points:preprocessor:rule_applied",
    &labels! {"rule" => "points.0.dropTag"},
  );
}

#[test]
fn rename_and_lowercase_and_replace() {
  let (preprocessor, _) = make_preprocessor(
    r"
points:
- action: renameTag
  tag: host
  newtag: source_host
- action: forceLowercase
  scope: metricName
- action: replaceRegex
  scope: sourceName
  search: '\.example\.com$'
  replace: ''
",
  );
  let mut point = make_point("CPU.Usage", "web-1.example.com", 0, 1.0);
  point
    .annotations
    .insert("host".to_string(), "web-1".to_string());
  preprocessor.preprocess_point(&mut point);
  assert_eq!("cpu.usage", point.metric);
  assert_eq!("web-1", point.source);
  assert_eq!(None, point.annotations.get("host"));
  assert_eq!(
    Some(&"web-1".to_string()),
    point.annotations.get("source_host")
  );
}

#[test]
fn extract_tag_from_metric_with_rewrite() {
  let (preprocessor, _) = make_preprocessor(
    r"
points:
- action: extractTag
  tag: dc
  input: metricName
  search: '^([a-z0-9]+)\.(.*)$'
  replace: '$1'
  replaceInput: '$2'
",
  );
  let mut point = make_point("us-west.cpu.usage", "web-1", 0, 1.0);
  preprocessor.preprocess_point(&mut point);
  // "us-west." does not match the charset-limited group; nothing happens.
  assert_eq!("us-west.cpu.usage", point.metric);

  let mut point = make_point("uswest1.cpu.usage", "web-1", 0, 1.0);
  preprocessor.preprocess_point(&mut point);
  assert_eq!(Some(&"uswest1".to_string()), point.annotations.get("dc"));
  assert_eq!("cpu.usage", point.metric);
}

#[test]
fn limit_length_variants() {
  let (preprocessor, _) = make_preprocessor(
    r"
points:
- action: limitLength
  scope: metricName
  maxLength: 8
  actionSubtype: TRUNCATE
- action: limitLength
  scope: note
  maxLength: 4
  actionSubtype: DROP
",
  );
  let mut point = make_point("a.very.long.metric", "web-1", 0, 1.0);
  point
    .annotations
    .insert("note".to_string(), "too long".to_string());
  preprocessor.preprocess_point(&mut point);
  assert_eq!("a.very.l", point.metric);
  assert_eq!(None, point.annotations.get("note"));
}

#[test]
fn drop_on_metric_name_is_invalid() {
  let collector = Collector::default();
  let config: PreprocessorConfig = serde_yaml::from_str(
    r"
points:
- action: limitLength
  scope: metricName
  maxLength: 8
  actionSubtype: DROP
",
  )
  .unwrap();
  assert!(Preprocessor::new(&config, &collector.scope("x")).is_err());
}

#[test]
fn span_extract_first_match_only() {
  let (preprocessor, _) = make_preprocessor(
    r"
spans:
- action: extractTag
  tag: status
  input: http.status
  search: '^(\d)..$'
  replace: '${1}xx'
  firstMatchOnly: true
",
  );
  let mut span = make_span("op", "web-1", 0, 10);
  span.annotations.push(Annotation::new("http.status", "404"));
  span.annotations.push(Annotation::new("http.status", "503"));
  preprocessor.preprocess_span(&mut span);

  let extracted: Vec<&str> = span
    .annotations
    .iter()
    .filter(|a| a.key == "status")
    .map(|a| a.value.as_str())
    .collect();
  assert_eq!(vec!["4xx"], extracted);
}

#[test]
fn span_add_tag_appends_in_order() {
  let (preprocessor, _) = make_preprocessor(
    r"
spans:
- action: addTag
  tag: proxy
  value: estuary
",
  );
  let mut span = make_span("op", "web-1", 0, 10);
  let before = span.annotations.len();
  preprocessor.preprocess_span(&mut span);
  assert_eq!(before + 1, span.annotations.len());
  assert_eq!("proxy", span.annotations.last().unwrap().key);
}

#[test]
fn span_name_rewrite_on_extract() {
  let (preprocessor, _) = make_preprocessor(
    r"
spans:
- action: extractTag
  tag: order
  input: spanName
  search: '^(.*order-)(\d+)$'
  replace: '$2'
  replaceInput: '${1}id'
",
  );
  let mut span = make_span("GET /order-12345", "web-1", 0, 10);
  preprocessor.preprocess_span(&mut span);
  assert_eq!("GET /order-id", span.name);
  assert_eq!(Some("12345"), span.annotation("order"));
}
