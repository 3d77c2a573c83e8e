// estuary - wavefront-compatible telemetry ingestion proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::{EntityProperties, EntityPropertiesConfig};
use crate::model::EntityType;
use pretty_assertions::assert_eq;

#[tokio::test]
async fn defaults_per_entity() {
  assert_eq!(
    40_000,
    EntityPropertiesConfig::defaults_for(EntityType::Point).items_per_batch
  );
  assert_eq!(
    10_000,
    EntityPropertiesConfig::defaults_for(EntityType::Histogram).items_per_batch
  );
  assert_eq!(
    50,
    EntityPropertiesConfig::defaults_for(EntityType::SourceTag).items_per_batch
  );
}

#[tokio::test]
async fn memory_buffer_limit_tracks_batch_size() {
  let props = EntityProperties::new(EntityPropertiesConfig::defaults_for(EntityType::Span));
  assert_eq!(16 * 5000, props.memory_buffer_limit());
  props.set_items_per_batch(Some(10));
  assert_eq!(160, props.memory_buffer_limit());
}

#[tokio::test]
async fn none_restores_original() {
  let mut config = EntityPropertiesConfig::defaults_for(EntityType::Point);
  config.items_per_batch = 1234;
  config.retry_backoff_base_seconds = 3.0;
  let props = EntityProperties::new(config);

  props.set_items_per_batch(Some(10));
  props.set_retry_backoff_base_seconds(Some(5.0));
  assert_eq!(10, props.items_per_batch());
  assert_eq!(5.0, props.retry_backoff_base_seconds());

  props.set_items_per_batch(None);
  props.set_retry_backoff_base_seconds(None);
  assert_eq!(1234, props.items_per_batch());
  assert_eq!(3.0, props.retry_backoff_base_seconds());
}

#[tokio::test]
async fn feature_disabled_round_trip() {
  let props = EntityProperties::new(EntityPropertiesConfig::defaults_for(EntityType::Span));
  assert!(!props.is_feature_disabled());
  props.set_feature_disabled(Some(true));
  assert!(props.is_feature_disabled());
  props.set_feature_disabled(None);
  assert!(!props.is_feature_disabled());
}
