// estuary - wavefront-compatible telemetry ingestion proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./shutdown_test.rs"]
mod shutdown_test;

use tokio::sync::{mpsc, watch};

// Status of a component as seen from its shutdown watch.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ComponentStatus {
  Running,
  PendingShutdown,
}

//
// ComponentShutdownTrigger
//

// Owns the shutdown signal for a group of components. Calling shutdown() flips the signal and
// then waits until every ComponentShutdown handed out through this trigger (or its handles) has
// been dropped, which is how components acknowledge completion.
pub struct ComponentShutdownTrigger {
  watch_tx: watch::Sender<bool>,
  completion_tx: mpsc::Sender<()>,
  completion_rx: mpsc::Receiver<()>,
}

impl Default for ComponentShutdownTrigger {
  fn default() -> Self {
    let (watch_tx, _) = watch::channel(false);
    let (completion_tx, completion_rx) = mpsc::channel(1);
    Self {
      watch_tx,
      completion_tx,
      completion_rx,
    }
  }
}

impl ComponentShutdownTrigger {
  #[must_use]
  pub fn make_handle(&self) -> ComponentShutdownTriggerHandle {
    ComponentShutdownTriggerHandle {
      watch_rx: self.watch_tx.subscribe(),
      completion_tx: self.completion_tx.clone(),
    }
  }

  #[must_use]
  pub fn make_shutdown(&self) -> ComponentShutdown {
    ComponentShutdown {
      watch_rx: self.watch_tx.subscribe(),
      _completion_tx: self.completion_tx.clone(),
    }
  }

  // Signal shutdown and wait for all outstanding components to drop their handles.
  pub async fn shutdown(mut self) {
    let _ignored = self.watch_tx.send(true);
    drop(self.completion_tx);
    while self.completion_rx.recv().await.is_some() {}
  }

  // Signal shutdown without waiting for completion.
  pub fn shutdown_now(&self) {
    let _ignored = self.watch_tx.send(true);
  }
}

//
// ComponentShutdownTriggerHandle
//

// A cloneable handle that can mint ComponentShutdown instances after the trigger has been moved
// into whatever owns it.
#[derive(Clone)]
pub struct ComponentShutdownTriggerHandle {
  watch_rx: watch::Receiver<bool>,
  completion_tx: mpsc::Sender<()>,
}

impl ComponentShutdownTriggerHandle {
  #[must_use]
  pub fn make_shutdown(&self) -> ComponentShutdown {
    ComponentShutdown {
      watch_rx: self.watch_rx.clone(),
      _completion_tx: self.completion_tx.clone(),
    }
  }
}

//
// ComponentShutdown
//

// Held by a running component. cancelled() resolves when shutdown is signaled. Dropping the
// instance reports completion to the trigger.
#[derive(Clone)]
pub struct ComponentShutdown {
  watch_rx: watch::Receiver<bool>,
  _completion_tx: mpsc::Sender<()>,
}

impl ComponentShutdown {
  pub async fn cancelled(&mut self) {
    // The sender can only drop after signaling, so either result means we are done.
    let _ignored = self.watch_rx.wait_for(|signaled| *signaled).await;
  }

  #[must_use]
  pub fn component_status(&self) -> ComponentStatus {
    if *self.watch_rx.borrow() {
      ComponentStatus::PendingShutdown
    } else {
      ComponentStatus::Running
    }
  }
}
