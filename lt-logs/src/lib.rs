// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#![deny(
  clippy::expect_used,
  clippy::panic,
  clippy::todo,
  clippy::unimplemented,
  clippy::unreachable,
  clippy::unwrap_used
)]

pub mod close;
pub mod config;
pub mod error;
pub mod repository;
pub mod retry;

pub use config::LogsConfig;
pub use error::{ConsumerError, Error, RecentLogsError};
pub use lt_log_primitives::{LogMessage, Loggable, StreamKind, Timestamped};
pub use repository::LogsRepository;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

#[cfg(test)]
#[ctor::ctor]
fn test_global_init() {
  lt_test_helpers::test_global_init();
}

/// Invoked by a transport each time an underlying connection is established.
pub type OnConnectCallback = Arc<dyn Fn() + Send + Sync>;

//
// TailStream
//

/// The two halves of a live tail. Both are fed asynchronously by the transport until it is closed,
/// at which point the senders are dropped.
pub struct TailStream<R> {
  pub data: UnboundedReceiver<R>,
  pub errors: UnboundedReceiver<ConsumerError>,
}

//
// RecentLogsFailure
//

/// A failed history fetch. The transport may have decoded some records before failing.
#[derive(Debug)]
pub struct RecentLogsFailure<R> {
  pub error: ConsumerError,
  pub partial: Vec<R>,
}

impl<R> RecentLogsFailure<R> {
  #[must_use]
  pub const fn new(error: ConsumerError) -> Self {
    Self {
      error,
      partial: Vec::new(),
    }
  }
}

//
// StreamConsumer
//

/// The transport that reaches the log aggregation service. Implementations must not retry on their
/// own: all retry policy lives in `LogsRepository`. Records the transport cannot decode are
/// dropped by the transport and never surface here.
#[async_trait::async_trait]
pub trait StreamConsumer: Send + Sync + 'static {
  type Record: Loggable;

  /// Opens a live stream for `target` and returns immediately. Data and errors arrive on the
  /// returned channels until the consumer is closed.
  fn tail_without_reconnect(&self, target: &str, access_token: &str) -> TailStream<Self::Record>;

  /// Fetches a bounded, unordered snapshot of recent history for `target`.
  async fn recent_logs(
    &self,
    target: &str,
    access_token: &str,
  ) -> Result<Vec<Self::Record>, RecentLogsFailure<Self::Record>>;

  /// Terminates any open stream, closing the channels handed out by `tail_without_reconnect()`.
  fn close(&self) -> anyhow::Result<()>;

  /// Registers the callback invoked once per successful connection establishment. Replaces any
  /// previously registered callback.
  fn set_on_connect_callback(&self, callback: OnConnectCallback);
}

//
// CredentialSource
//

/// Provides the bearer credential used to talk to the aggregation service, and the ability to
/// refresh it once the service starts rejecting it.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait CredentialSource: Send + Sync {
  /// The current access token. Re-read before every connection attempt and fetch.
  fn access_token(&self) -> String;

  /// The name of the streaming endpoint. Only used to describe connection timeouts.
  fn streaming_endpoint(&self) -> String;

  /// Refreshes the credentials so that the next `access_token()` call returns a valid token.
  async fn refresh_credentials(&self) -> anyhow::Result<()>;
}
