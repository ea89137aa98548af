// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./retry_test.rs"]
mod retry_test;

use lt_time::TimeDurationExt as _;
use tokio::time::Instant;

//
// RetryState
//

/// Tracks recovery from stream interruptions for a single tail.
///
/// A transient error arms a deadline `timeout_budget` from now unless one is already pending. Any
/// sign of life (data or a connect notification) disarms it. If the deadline elapses first the
/// caller reports a timeout and the deadline is re-armed with a fresh budget, so a stream that
/// stays down keeps producing one timeout per budget.
///
/// Unauthorized errors are counted separately and bounded by `max_unauthorized_retries`. The count
/// resets on the same signs of life.
#[derive(Debug)]
pub struct RetryState {
  timeout_budget: time::Duration,
  pending_deadline: Option<Instant>,
  max_unauthorized_retries: u32,
  unauthorized_retries: u32,
}

impl RetryState {
  #[must_use]
  pub const fn new(timeout_budget: time::Duration, max_unauthorized_retries: u32) -> Self {
    Self {
      timeout_budget,
      pending_deadline: None,
      max_unauthorized_retries,
      unauthorized_retries: 0,
    }
  }

  #[must_use]
  pub const fn deadline(&self) -> Option<Instant> {
    self.pending_deadline
  }

  /// Returns true if this error armed a new deadline, false if one was already pending.
  pub fn on_transient_error(&mut self) -> bool {
    if self.pending_deadline.is_some() {
      return false;
    }

    self.pending_deadline = Some(self.timeout_budget.add_tokio_now());
    true
  }

  pub fn on_timeout(&mut self) {
    self.pending_deadline = Some(self.timeout_budget.add_tokio_now());
  }

  pub fn on_data(&mut self) {
    self.reset();
  }

  pub fn on_connected(&mut self) {
    self.reset();
  }

  /// Returns true if another refresh and reconnect may be attempted, consuming one attempt.
  pub fn try_unauthorized_retry(&mut self) -> bool {
    if self.unauthorized_retries >= self.max_unauthorized_retries {
      return false;
    }

    self.unauthorized_retries += 1;
    true
  }

  fn reset(&mut self) {
    self.pending_deadline = None;
    self.unauthorized_retries = 0;
  }
}
