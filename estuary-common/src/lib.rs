// estuary - wavefront-compatible telemetry ingestion proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

pub mod duration;
pub mod log_every;
pub mod shutdown;
pub mod stats;

use std::sync::Once;

static GLOBAL_INIT: Once = Once::new();

// One time process initialization. Sets up logging and the TLS provider. Safe to call multiple
// times (tests call this from multiple entry points).
pub fn global_initialize() {
  GLOBAL_INIT.call_once(|| {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    rustls::crypto::aws_lc_rs::default_provider()
      .install_default()
      .unwrap();
  });
}

// Lossy conversion helpers used where counter math crosses between integer and float domains.
pub trait LossyIntoToFloat {
  fn lossy_to_f64(self) -> f64;
}

impl LossyIntoToFloat for u64 {
  #[allow(clippy::cast_precision_loss)]
  fn lossy_to_f64(self) -> f64 {
    self as f64
  }
}

impl LossyIntoToFloat for usize {
  #[allow(clippy::cast_precision_loss)]
  fn lossy_to_f64(self) -> f64 {
    self as f64
  }
}

pub trait LossyFloatToInt {
  fn lossy_to_u64(self) -> u64;
}

impl LossyFloatToInt for f64 {
  #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
  fn lossy_to_u64(self) -> u64 {
    self as u64
  }
}
