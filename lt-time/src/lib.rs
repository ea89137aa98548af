// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt


use std::future::{Future, IntoFuture};
use time::OffsetDateTime;
use tokio::time::{Interval, MissedTickBehavior, Timeout, interval_at};

//
// TimestampNanosExt
//

/// Log timestamps travel as signed nanoseconds since the unix epoch. This converts them into a
/// calendar time for rendering.
pub trait TimestampNanosExt {
  fn to_offset_date_time(self) -> OffsetDateTime;
}

impl TimestampNanosExt for i64 {
  fn to_offset_date_time(self) -> OffsetDateTime {
    // Every i64 nanosecond value is within the representable range, the fallback is unreachable
    // in practice.
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(self))
      .unwrap_or(OffsetDateTime::UNIX_EPOCH)
  }
}

//
// TimeDurationExt
//

pub trait TimeDurationExt {
  fn advance(self) -> impl Future<Output = ()>;
  fn sleep(self) -> impl Future<Output = ()>;
  fn interval_at(self) -> Interval;
  fn timeout<F: IntoFuture>(self, f: F) -> Timeout<F::IntoFuture>;
  fn add_tokio_now(self) -> tokio::time::Instant;
}

impl TimeDurationExt for time::Duration {
  fn advance(self) -> impl Future<Output = ()> {
    tokio::time::advance(self.unsigned_abs())
  }

  fn sleep(self) -> impl Future<Output = ()> {
    tokio::time::sleep(self.unsigned_abs())
  }

  // The first tick fires one period from now rather than immediately. Missed ticks are delayed
  // instead of bursting, a periodic drain gains nothing from catching up.
  fn interval_at(self) -> Interval {
    let mut interval = interval_at(self.add_tokio_now(), self.unsigned_abs());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
  }

  fn timeout<F: IntoFuture>(self, f: F) -> Timeout<F::IntoFuture> {
    tokio::time::timeout(self.unsigned_abs(), f)
  }

  fn add_tokio_now(self) -> tokio::time::Instant {
    tokio::time::Instant::now() + self.unsigned_abs()
  }
}
