// estuary - wavefront-compatible telemetry ingestion proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

pub mod accumulator;
pub mod api;
pub mod checkin;
pub mod clock;
pub mod handler;
pub mod model;
pub mod preprocessor;
pub mod queue;
pub mod rate_limiter;
pub mod sender;
pub mod trace;
pub mod validation;

#[cfg(test)]
pub mod test;
