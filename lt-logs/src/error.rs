// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./error_test.rs"]
mod error_test;

//
// ConsumerError
//

/// Errors reported by a `StreamConsumer`.
#[derive(thiserror::Error, Debug)]
pub enum ConsumerError {
  /// The service rejected the credential. Recoverable by refreshing it.
  #[error("unauthorized: {0}")]
  Unauthorized(String),

  /// The stream was interrupted but may come back without intervention.
  #[error("stream interrupted: {0}")]
  Retryable(String),

  /// Anything else. Ends the tail.
  #[error(transparent)]
  Fatal(#[from] anyhow::Error),
}

//
// Error
//

/// Errors surfaced to callers of `LogsRepository`.
#[derive(thiserror::Error, Debug)]
pub enum Error {
  /// The stream was interrupted and did not recover within the configured budget. The tail keeps
  /// going.
  #[error("timed out waiting for connection to {endpoint}")]
  Timeout { endpoint: String },

  /// The service kept rejecting the credential after it was refreshed.
  #[error("still unauthorized after refreshing credentials: {0}")]
  StillUnauthorized(String),

  /// A transport error, passed through as-is.
  #[error(transparent)]
  Consumer(#[from] ConsumerError),

  #[error("failed to close the log stream: {0}")]
  Close(#[source] anyhow::Error),

  #[error("the logs repository has been closed")]
  Closed,
}

impl Error {
  /// Whether the error ends a tail. A timeout is informational, the stream may still recover.
  #[must_use]
  pub const fn is_fatal(&self) -> bool {
    !matches!(self, Self::Timeout { .. })
  }
}

//
// RecentLogsError
//

/// A failed `recent_logs_for()`, carrying whatever records the transport returned before failing,
/// in the order it returned them.
#[derive(thiserror::Error, Debug)]
#[error("{error}")]
pub struct RecentLogsError<R> {
  #[source]
  pub error: Error,
  pub partial: Vec<R>,
}

impl<R> RecentLogsError<R> {
  #[must_use]
  pub const fn new(error: Error, partial: Vec<R>) -> Self {
    Self { error, partial }
  }
}
