// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::StreamKind;
use lt_time::TimestampNanosExt as _;
use time::UtcOffset;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;

const TIMESTAMP_FORMAT: &[BorrowedFormatItem<'_>] = format_description!(
  "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:2][offset_hour sign:mandatory][offset_minute]"
);

// Headers are padded to the width of the widest one commonly seen so that payloads line up.
const LONGEST_HEADER: &str = "2006-01-02T15:04:05.00-0700  [HEALTH/10] ";

/// Renders `<timestamp> [<source_type>/<source_instance>]`, dropping the `/<instance>` part when
/// the instance is empty, right padded with spaces to a common width.
#[must_use]
pub fn log_header(
  timestamp: i64,
  source_type: &str,
  source_instance: &str,
  offset: UtcOffset,
) -> String {
  let at = timestamp.to_offset_date_time().to_offset(offset);
  let formatted = at
    .format(TIMESTAMP_FORMAT)
    .unwrap_or_else(|_| timestamp.to_string());

  let source = if source_instance.is_empty() {
    source_type.to_string()
  } else {
    format!("{source_type}/{source_instance}")
  };

  let width = LONGEST_HEADER.chars().count();
  format!("{:<width$}", format!("{formatted} [{source}]"))
}

/// Renders `<OUT|ERR> <payload>`. Trailing line breaks are stripped and continuation lines are
/// indented by the width of `header` so they line up under the first line.
#[must_use]
pub fn log_content(stream_kind: StreamKind, text: &[u8], header: &str) -> String {
  let text = String::from_utf8_lossy(text);
  let text = text.trim_end_matches(['\r', '\n']);
  let padding = " ".repeat(header.chars().count());

  let mut lines = text.split('\n');
  let mut content = format!("{stream_kind} {}", lines.next().unwrap_or_default());
  for line in lines {
    content.push('\n');
    content.push_str(&padding);
    content.push_str(line);
  }

  content
}
