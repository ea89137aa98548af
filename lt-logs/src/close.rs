// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./close_test.rs"]
mod close_test;

use std::sync::Arc;
use tokio::sync::watch;

//
// CloseStatus
//

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CloseStatus {
  Open,
  Closing,
}

//
// CloseTriggerHandle
//

/// A non-owning handle to a `CloseTrigger` that can hand out new signals but cannot close.
#[derive(Clone, Debug)]
pub struct CloseTriggerHandle {
  status_tx: Arc<watch::Sender<CloseStatus>>,
}

impl CloseTriggerHandle {
  #[must_use]
  pub fn make_signal(&self) -> CloseSignal {
    CloseSignal {
      status_rx: self.status_tx.subscribe(),
    }
  }

  #[must_use]
  pub fn is_closed(&self) -> bool {
    *self.status_tx.borrow() == CloseStatus::Closing
  }
}

//
// CloseTrigger
//

/// Initiates close for every task holding a `CloseSignal` made from it, and waits for those tasks
/// to finish unwinding. A task is considered done once it drops its signal.
#[derive(Debug)]
pub struct CloseTrigger {
  status_tx: Arc<watch::Sender<CloseStatus>>,
}

impl Default for CloseTrigger {
  fn default() -> Self {
    let (status_tx, _) = watch::channel(CloseStatus::Open);
    Self {
      status_tx: Arc::new(status_tx),
    }
  }
}

impl CloseTrigger {
  #[must_use]
  pub fn make_handle(&self) -> CloseTriggerHandle {
    CloseTriggerHandle {
      status_tx: self.status_tx.clone(),
    }
  }

  #[must_use]
  pub fn make_signal(&self) -> CloseSignal {
    CloseSignal {
      status_rx: self.status_tx.subscribe(),
    }
  }

  /// Marks the trigger as closing without waiting. Signals observe it immediately.
  pub fn start_close(&self) {
    self.status_tx.send_replace(CloseStatus::Closing);
  }

  /// Signals close and waits until every outstanding signal has been dropped.
  pub async fn close(self) {
    self.start_close();
    self.status_tx.closed().await;
  }
}

//
// CloseSignal
//

/// Held by a task for as long as it is running. Observes when the owning trigger starts closing.
#[derive(Clone, Debug)]
pub struct CloseSignal {
  status_rx: watch::Receiver<CloseStatus>,
}

impl CloseSignal {
  /// Returns once close has been requested. Also returns if the trigger was dropped without
  /// closing, since nothing can ever request close at that point.
  pub async fn cancelled(&mut self) {
    if *self.status_rx.borrow_and_update() == CloseStatus::Closing {
      return;
    }
    let _ignored = self.status_rx.changed().await;
  }

  #[must_use]
  pub fn is_closed(&self) -> bool {
    *self.status_rx.borrow() == CloseStatus::Closing
  }
}
