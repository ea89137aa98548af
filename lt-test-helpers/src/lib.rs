// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use lt_log_primitives::{LogMessage, StreamKind};
use tokio::sync::mpsc::UnboundedReceiver;

pub fn test_global_init() {
  lt_log::SwapLogger::initialize();
}

/// A stdout line from `APP/0` with the given text and timestamp (nanoseconds since the epoch).
#[must_use]
pub fn log_message(text: &str, timestamp: i64) -> LogMessage {
  LogMessage::new(
    text.to_string(),
    StreamKind::Stdout,
    timestamp,
    "APP",
    "0",
  )
}

/// The text of each message, lossily decoded.
#[must_use]
pub fn texts(messages: &[LogMessage]) -> Vec<String> {
  messages
    .iter()
    .map(|message| String::from_utf8_lossy(message.text()).into_owned())
    .collect()
}

/// Everything currently queued on `rx`, without waiting.
pub fn drain_available<T>(rx: &mut UnboundedReceiver<T>) -> Vec<T> {
  let mut items = Vec::new();
  while let Ok(item) = rx.try_recv() {
    items.push(item);
  }
  items
}

/// Everything sent on `rx` until every sender has been dropped.
pub async fn recv_until_closed<T>(rx: &mut UnboundedReceiver<T>) -> Vec<T> {
  let mut items = Vec::new();
  while let Some(item) = rx.recv().await {
    items.push(item);
  }
  items
}
