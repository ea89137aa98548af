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


pub mod render;

use bytes::Bytes;
use std::fmt;
use time::UtcOffset;

//
// StreamKind
//

/// The output stream a log line was written to by the application instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamKind {
  Stdout,
  Stderr,
}

impl StreamKind {
  #[must_use]
  pub const fn as_str(self) -> &'static str {
    match self {
      Self::Stdout => "OUT",
      Self::Stderr => "ERR",
    }
  }
}

impl fmt::Display for StreamKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

//
// Timestamped
//

/// The only property the ordering machinery looks at.
pub trait Timestamped {
  /// Nanoseconds since the unix epoch.
  fn timestamp(&self) -> i64;
}

//
// Loggable
//

/// A log entry that knows how to render itself, independent of the transport that produced it.
/// Each transport record type implements this once.
pub trait Loggable: Timestamped + Send + Sync + 'static {
  /// The raw payload, e.g. for echoing staging output verbatim.
  fn to_simple_log(&self) -> String;

  /// The full form: a padded `<timestamp> [<source>/<instance>]` header in the given offset,
  /// followed by the stream kind and the payload.
  fn to_log(&self, offset: UtcOffset) -> String;

  /// The origin tag, e.g. `APP` or `STG`.
  fn source_name(&self) -> &str;
}

//
// LogMessage
//

/// A single log line or event as delivered by the aggregation service. Immutable once built.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LogMessage {
  text: Bytes,
  stream_kind: StreamKind,
  timestamp: i64,
  source_type: String,
  source_instance: String,
}

impl LogMessage {
  #[must_use]
  pub fn new(
    text: impl Into<Bytes>,
    stream_kind: StreamKind,
    timestamp: i64,
    source_type: impl Into<String>,
    source_instance: impl Into<String>,
  ) -> Self {
    Self {
      text: text.into(),
      stream_kind,
      timestamp,
      source_type: source_type.into(),
      source_instance: source_instance.into(),
    }
  }

  #[must_use]
  pub fn text(&self) -> &[u8] {
    &self.text
  }

  #[must_use]
  pub const fn stream_kind(&self) -> StreamKind {
    self.stream_kind
  }

  #[must_use]
  pub fn source_type(&self) -> &str {
    &self.source_type
  }

  #[must_use]
  pub fn source_instance(&self) -> &str {
    &self.source_instance
  }
}

impl Timestamped for LogMessage {
  fn timestamp(&self) -> i64 {
    self.timestamp
  }
}

impl Loggable for LogMessage {
  fn to_simple_log(&self) -> String {
    String::from_utf8_lossy(&self.text).into_owned()
  }

  fn to_log(&self, offset: UtcOffset) -> String {
    let header = render::log_header(
      self.timestamp,
      &self.source_type,
      &self.source_instance,
      offset,
    );
    let content = render::log_content(self.stream_kind, &self.text, &header);

    format!("{header}{content}")
  }

  fn source_name(&self) -> &str {
    &self.source_type
  }
}
