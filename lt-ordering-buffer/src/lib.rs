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

#[cfg(test)]
#[path = "./lib_test.rs"]
mod tests;

use lt_log_primitives::Timestamped;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

//
// Entry
//

// Heap entry ordered so that the smallest (timestamp, arrival) pair sits on top of the max-heap.
struct Entry<T> {
  timestamp: i64,
  sequence: u64,
  item: T,
}

impl<T> Entry<T> {
  const fn key(&self) -> (i64, u64) {
    (self.timestamp, self.sequence)
  }
}

impl<T> PartialEq for Entry<T> {
  fn eq(&self, other: &Self) -> bool {
    self.key() == other.key()
  }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl<T> Ord for Entry<T> {
  fn cmp(&self, other: &Self) -> Ordering {
    other.key().cmp(&self.key())
  }
}

//
// TimestampOrderingBuffer
//

/// Collects entries in arrival order and hands them back in ascending timestamp order. Entries
/// with equal timestamps come back in the order they were pushed.
///
/// The buffer is unbounded. If nothing drains it (e.g. the caller never reads the output while the
/// stream keeps delivering) memory grows without limit; capping it would mean silently dropping
/// log lines. `high_water_mark()` reports the largest size observed so growth can be monitored.
///
/// The buffer does no synchronization of its own. Callers sharing it between a producer and a
/// periodic drainer wrap it in a mutex.
pub struct TimestampOrderingBuffer<T: Timestamped> {
  heap: BinaryHeap<Entry<T>>,
  next_sequence: u64,
  high_water_mark: usize,
}

impl<T: Timestamped> Default for TimestampOrderingBuffer<T> {
  fn default() -> Self {
    Self {
      heap: BinaryHeap::new(),
      next_sequence: 0,
      high_water_mark: 0,
    }
  }
}

impl<T: Timestamped> TimestampOrderingBuffer<T> {
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Adds an entry. Never blocks and never fails.
  pub fn push(&mut self, item: T) {
    let timestamp = item.timestamp();
    let sequence = self.next_sequence;
    self.next_sequence += 1;

    self.heap.push(Entry {
      timestamp,
      sequence,
      item,
    });

    if self.heap.len() > self.high_water_mark {
      self.high_water_mark = self.heap.len();
    }

    log::trace!(
      "buffered entry with timestamp {timestamp}, {} pending",
      self.heap.len()
    );
  }

  /// Removes every entry in non-decreasing timestamp order, invoking `visit` for each. The buffer
  /// is empty afterwards.
  pub fn drain_sorted(&mut self, mut visit: impl FnMut(T)) {
    while let Some(entry) = self.heap.pop() {
      visit(entry.item);
    }
  }

  /// Like `drain_sorted()` but collects the entries. Useful when the visit step must not run while
  /// the buffer is locked.
  #[must_use]
  pub fn drain_sorted_vec(&mut self) -> Vec<T> {
    let mut drained = Vec::with_capacity(self.heap.len());
    self.drain_sorted(|item| drained.push(item));
    drained
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.heap.len()
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.heap.is_empty()
  }

  /// The largest number of entries held at once since the buffer was created.
  #[must_use]
  pub const fn high_water_mark(&self) -> usize {
    self.high_water_mark
  }
}
