// estuary - wavefront-compatible telemetry ingestion proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use anyhow::Context;
use clap::Parser;
use estuary_proxy::run_server;
use log::info;
use std::num::NonZeroUsize;
use tikv_jemallocator::Jemalloc;
use tokio::select;
use tokio::signal::unix::{SignalKind, signal};

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(Parser, Debug, Clone)]
struct Options {
  #[arg(short = 'c', long = "config")]
  pub config: String,

  #[arg(long = "config-check-and-exit")]
  pub config_check: bool,

  #[arg(long = "version")]
  pub version: bool,
}

fn main() -> anyhow::Result<()> {
  estuary_common::global_initialize();
  let opts = Options::parse();

  if opts.version {
    println!("estuary-proxy: {}", env!("CARGO_PKG_VERSION"));
    return Ok(());
  }
  info!("estuary-proxy loading: {}", env!("CARGO_PKG_VERSION"));

  let config = estuary_proxy::config::load_from_file(&opts.config)
    .with_context(|| format!("can't load config file from {}", opts.config))?;
  info!("loaded config file {}", opts.config);

  let num_threads = std::thread::available_parallelism().unwrap_or_else(|_| {
    log::warn!("could not determine number of CPUs. Defaulting to 1");
    NonZeroUsize::new(1).unwrap()
  });
  log::info!("running server with {num_threads} workers");
  let runtime = tokio::runtime::Builder::new_multi_thread()
    .worker_threads(num_threads.into())
    .enable_all()
    .build()
    .unwrap();

  let exit_code = runtime.block_on(async {
    run_server(config, opts.config_check, async {
      // Trap ctrl+c and sigterm and perform a clean shutdown.
      let mut sigint = signal(SignalKind::interrupt()).unwrap();
      let mut sigterm = signal(SignalKind::terminate()).unwrap();
      select! {
        _ = sigint.recv() => info!("received sigint"),
        _ = sigterm.recv() => info!("received sigterm"),
      }
    })
    .await
  })?;

  if exit_code != 0 {
    std::process::exit(exit_code);
  }
  Ok(())
}
