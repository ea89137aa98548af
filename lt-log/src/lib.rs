// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt


pub mod rate_limit_log;

use anyhow::anyhow;
use parking_lot::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::reload::Handle as ReloadHandle;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

const DEFAULT_FILTER_RULES: &str = "info";

//
// SwapLogger
//

// Routes `log` records into a tracing subscriber whose filter can be atomically swapped at
// runtime, e.g. when a user asks for verbose output in the middle of a tail session.
#[derive(Default)]
pub struct SwapLogger {
  handle: Mutex<Option<ReloadHandle<EnvFilter, Registry>>>,
}

impl SwapLogger {
  const fn new() -> Self {
    Self {
      handle: parking_lot::const_mutex(None),
    }
  }

  fn get() -> &'static Self {
    static LOGGER: SwapLogger = SwapLogger::new();

    &LOGGER
  }

  // Initialize the logger to the default. Only the first call installs the subscriber, later calls
  // are ignored so that tests sharing a process can all call this.
  pub fn initialize() {
    let mut handle = Self::get().handle.lock();
    if handle.is_some() {
      return;
    }

    // ANSI output is opt-in via LT_LOG_ANSI since the output is frequently piped into files.
    let stderr = tracing_subscriber::fmt::layer()
      .with_writer(std::io::stderr)
      .with_ansi(std::env::var("LT_LOG_ANSI").is_ok())
      .with_line_number(true)
      .with_thread_ids(true)
      .compact();

    let filter = EnvFilter::new(
      std::env::var("RUST_LOG")
        .as_deref()
        .unwrap_or(DEFAULT_FILTER_RULES),
    );

    let (filter, reload_handle) = tracing_subscriber::reload::Layer::new(filter);
    *handle = Some(reload_handle);

    // try_init() also installs the log -> tracing bridge. It fails if some other subscriber got
    // installed first, in which case that one wins.
    if let Err(e) = Registry::default().with(filter).with(stderr).try_init() {
      eprintln!("failed to install log subscriber: {e}");
    }
  }

  // Swap in a new logger with the provided RUST_LOG string.
  pub fn swap(new_rust_log: &str) -> anyhow::Result<()> {
    Self::get()
      .handle
      .lock()
      .as_mut()
      .ok_or_else(|| anyhow!("logger has not been initialized"))?
      .reload(EnvFilter::try_new(new_rust_log)?)?;

    // During init the log level is set based on the initial RUST_LOG value. We need to manually
    // update it each time we reload the config as tracing_subscriber does not do this for us.
    log::set_max_level(tracing_log::AsLog::as_log(
      &tracing_subscriber::filter::LevelFilter::current(),
    ));

    Ok(())
  }
}
