// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./config_test.rs"]
mod config_test;

use anyhow::bail;
use serde::Deserialize;

const DEFAULT_BUFFER_TIME_MS: u64 = 25;
const DEFAULT_TIMEOUT_BUDGET_MS: u64 = 5_000;
const DEFAULT_MAX_UNAUTHORIZED_RETRIES: u32 = 1;

//
// LogsConfig
//

/// Tunables for `LogsRepository`. Every key is optional in YAML.
///
/// ```yaml
/// buffer_time_ms: 25
/// timeout_budget_ms: 5000
/// max_unauthorized_retries: 1
/// ```
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct LogsConfig {
  /// How often buffered messages are flushed to the caller in timestamp order. Output is only
  /// guaranteed to be ordered within one window, so this should exceed the expected jitter between
  /// out of order deliveries.
  pub buffer_time_ms: u64,

  /// How long a transient stream interruption may last before a timeout is reported.
  pub timeout_budget_ms: u64,

  /// How many credential refresh and retry cycles are attempted before giving up on an
  /// unauthorized stream or fetch.
  pub max_unauthorized_retries: u32,
}

impl Default for LogsConfig {
  fn default() -> Self {
    Self {
      buffer_time_ms: DEFAULT_BUFFER_TIME_MS,
      timeout_budget_ms: DEFAULT_TIMEOUT_BUDGET_MS,
      max_unauthorized_retries: DEFAULT_MAX_UNAUTHORIZED_RETRIES,
    }
  }
}

impl LogsConfig {
  pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
    let config: Self = serde_yaml::from_str(yaml)?;
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> anyhow::Result<()> {
    if self.buffer_time_ms == 0 {
      bail!("buffer_time_ms must be greater than zero");
    }
    if self.timeout_budget_ms == 0 {
      bail!("timeout_budget_ms must be greater than zero");
    }
    Ok(())
  }

  #[must_use]
  pub fn buffer_time(&self) -> time::Duration {
    millis(self.buffer_time_ms)
  }

  #[must_use]
  pub fn timeout_budget(&self) -> time::Duration {
    millis(self.timeout_budget_ms)
  }

  #[must_use]
  pub const fn max_unauthorized_retries(&self) -> u32 {
    self.max_unauthorized_retries
  }
}

fn millis(ms: u64) -> time::Duration {
  time::Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
}
