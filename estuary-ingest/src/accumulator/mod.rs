// estuary - wavefront-compatible telemetry ingestion proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

mod delta;
mod histogram;

pub use delta::DeltaAccumulator;
pub use histogram::{AgentDigest, Granularity, HistogramAccumulator};
