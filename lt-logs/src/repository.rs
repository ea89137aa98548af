// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./repository_test.rs"]
mod repository_test;

use crate::close::{CloseSignal, CloseTrigger, CloseTriggerHandle};
use crate::retry::RetryState;
use crate::{
  ConsumerError,
  CredentialSource,
  Error,
  LogsConfig,
  RecentLogsError,
  RecentLogsFailure,
  StreamConsumer,
  TailStream,
};
use lt_log_primitives::Timestamped;
use lt_ordering_buffer::TimestampOrderingBuffer;
use lt_time::TimeDurationExt as _;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use time::ext::NumericalDuration;
use tokio::sync::Notify;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::Instant;

type SharedBuffer<R> = Arc<Mutex<TimestampOrderingBuffer<R>>>;

// Drains the buffer into `out_data` in timestamp order. Returns false once the receiver is gone.
fn flush<R: Timestamped>(
  buffer: &Mutex<TimestampOrderingBuffer<R>>,
  out_data: &UnboundedSender<R>,
) -> bool {
  let drained = buffer.lock().drain_sorted_vec();
  if !drained.is_empty() {
    log::trace!("flushing {} buffered entries", drained.len());
  }

  drained.into_iter().all(|entry| out_data.send(entry).is_ok())
}

async fn wait_for_deadline(deadline: Option<Instant>) {
  match deadline {
    Some(deadline) => tokio::time::sleep_until(deadline).await,
    None => std::future::pending().await,
  }
}

//
// LogsRepository
//

/// Tails and fetches logs through a `StreamConsumer`, hiding credential expiry and transient
/// interruptions from the caller and re-ordering live output by timestamp.
///
/// Live output is sorted within each flush window (`buffer_time`). Entries delayed by more than one
/// window relative to a newer entry can still come out behind it, so global ordering is only as
/// good as the window is large relative to delivery jitter.
///
/// The repository owns a single consumer and buffer. Only one tail is expected to run at a time.
pub struct LogsRepository<C: StreamConsumer> {
  consumer: Arc<C>,
  credentials: Arc<dyn CredentialSource>,
  config: LogsConfig,
  buffer: SharedBuffer<C::Record>,
  close_trigger: Mutex<Option<CloseTrigger>>,
  close_handle: CloseTriggerHandle,
  consumer_closed: AtomicBool,
}

impl<C: StreamConsumer> LogsRepository<C> {
  pub fn new(
    consumer: Arc<C>,
    credentials: Arc<dyn CredentialSource>,
    config: LogsConfig,
  ) -> anyhow::Result<Self> {
    config.validate()?;

    let close_trigger = CloseTrigger::default();
    let close_handle = close_trigger.make_handle();

    Ok(Self {
      consumer,
      credentials,
      config,
      buffer: Arc::new(Mutex::new(TimestampOrderingBuffer::new())),
      close_trigger: Mutex::new(Some(close_trigger)),
      close_handle,
      consumer_closed: AtomicBool::new(false),
    })
  }

  /// Fetches a snapshot of recent history for `target`, sorted by timestamp. Entries with equal
  /// timestamps keep the order the transport returned them in.
  ///
  /// An unauthorized response triggers a credential refresh and another fetch, at most
  /// `max_unauthorized_retries` times.
  pub async fn recent_logs_for(
    &self,
    target: &str,
  ) -> Result<Vec<C::Record>, RecentLogsError<C::Record>> {
    if self.close_handle.is_closed() {
      return Err(RecentLogsError::new(Error::Closed, vec![]));
    }

    let mut refreshes = 0;
    loop {
      let access_token = self.credentials.access_token();
      match self.consumer.recent_logs(target, &access_token).await {
        Ok(mut logs) => {
          log::debug!("fetched {} recent entries for {target}", logs.len());
          logs.sort_by_key(|entry| entry.timestamp());
          return Ok(logs);
        },
        Err(RecentLogsFailure {
          error: ConsumerError::Unauthorized(reason),
          partial,
        }) => {
          if refreshes >= self.config.max_unauthorized_retries() {
            return Err(RecentLogsError::new(
              Error::StillUnauthorized(reason),
              partial,
            ));
          }

          refreshes += 1;
          log::debug!("recent logs unauthorized ({reason}), refreshing credentials");
          self.refresh_credentials().await;
        },
        Err(RecentLogsFailure { error, partial }) => {
          return Err(RecentLogsError::new(error.into(), partial));
        },
      }
    }
  }

  /// Streams logs for `target` until the stream ends, fails fatally, the caller drops the
  /// `out_data` receiver, or the repository is closed.
  ///
  /// Entries are sent to `out_data` in timestamp order once per flush window. Fatal errors and
  /// timeouts are sent to `out_err`. `on_connect` runs on this task every time the transport
  /// (re)establishes its connection. Both channels are closed when this returns, after a final
  /// flush of anything still buffered.
  #[tracing::instrument(level = "debug", skip_all, fields(target = %target))]
  pub async fn tail_logs_for(
    &self,
    target: &str,
    on_connect: impl Fn() + Send + Sync,
    out_data: UnboundedSender<C::Record>,
    out_err: UnboundedSender<Error>,
  ) {
    let mut closed = self.close_handle.make_signal();
    if closed.is_closed() {
      log::debug!("repository closed, not tailing");
      return;
    }

    let connected = Arc::new(Notify::new());
    let notify = connected.clone();
    self
      .consumer
      .set_on_connect_callback(Arc::new(move || notify.notify_one()));

    let flusher_trigger = CloseTrigger::default();
    let flusher = self.spawn_flusher(out_data.clone(), flusher_trigger.make_signal());

    self
      .run_event_loop(
        target,
        &on_connect,
        &out_data,
        &out_err,
        &connected,
        &mut closed,
      )
      .await;

    // The flusher must be fully stopped before the final drain so nothing it already took out of
    // the buffer can be sent after entries drained here.
    flusher_trigger.close().await;
    if let Err(e) = flusher.await {
      log::warn!("log flusher task failed: {e}");
    }
    flush(&self.buffer, &out_data);

    log::debug!(
      "tail ended, buffer high water mark {}",
      self.buffer_high_water_mark()
    );

    // Release the close signal last: `close()` returning implies both channels are closed.
    drop(out_data);
    drop(out_err);
    drop(closed);
  }

  /// Closes the consumer, ends any running tail and waits for it to finish its final flush. Later
  /// calls do nothing.
  ///
  /// The closed status is visible to running tails before the consumer is closed, so a tail that
  /// is between connection attempts never opens a stream that outlives this call.
  pub async fn close(&self) -> Result<(), Error> {
    let trigger = self.close_trigger.lock().take();
    let Some(trigger) = trigger else {
      return Ok(());
    };

    log::debug!("closing logs repository");
    trigger.start_close();
    let result = self.close_consumer_once();
    trigger.close().await;
    result
  }

  /// The largest number of entries that were ever waiting in the ordering buffer.
  #[must_use]
  pub fn buffer_high_water_mark(&self) -> usize {
    self.buffer.lock().high_water_mark()
  }

  async fn run_event_loop(
    &self,
    target: &str,
    on_connect: &(dyn Fn() + Send + Sync),
    out_data: &UnboundedSender<C::Record>,
    out_err: &UnboundedSender<Error>,
    connected: &Notify,
    closed: &mut CloseSignal,
  ) {
    let mut retry = RetryState::new(
      self.config.timeout_budget(),
      self.config.max_unauthorized_retries(),
    );

    'connect: loop {
      if closed.is_closed() {
        log::debug!("repository closed, not reconnecting");
        return;
      }

      log::debug!("connecting to log stream");
      let TailStream {
        mut data,
        mut errors,
      } = self
        .consumer
        .tail_without_reconnect(target, &self.credentials.access_token());
      let mut errors_open = true;

      // close() publishes its status before closing the consumer, so a stream opened after the
      // check above but after the consumer was closed is caught here.
      if closed.is_closed() {
        log::debug!("repository closed while connecting, closing new stream");
        if let Err(e) = self.consumer.close() {
          log::warn!("failed to close the log stream: {e}");
        }
        return;
      }

      loop {
        tokio::select! {
          biased;

          () = closed.cancelled() => {
            log::debug!("repository closed, ending tail");
            self.buffer_pending(&mut data);
            return;
          },
          () = out_data.closed() => {
            log::debug!("log receiver dropped, ending tail");
            self.close_consumer_on_failure();
            return;
          },
          error = errors.recv(), if errors_open => {
            let Some(error) = error else {
              errors_open = false;
              continue;
            };

            match error {
              ConsumerError::Unauthorized(reason) => {
                self.buffer_pending(&mut data);
                if !retry.try_unauthorized_retry() {
                  log::debug!("still unauthorized after refreshing credentials, ending tail");
                  let _ignored = out_err.send(Error::StillUnauthorized(reason));
                  self.close_consumer_on_failure();
                  return;
                }

                log::debug!("log stream unauthorized ({reason}), refreshing credentials");
                self.refresh_credentials().await;
                continue 'connect;
              },
              ConsumerError::Retryable(reason) => {
                lt_log::warn_every!(15.seconds(), "log stream interrupted, retrying: {}", reason);
                if retry.on_transient_error() {
                  log::debug!("reconnecting, waiting up to {}", self.config.timeout_budget());
                }
              },
              fatal @ ConsumerError::Fatal(_) => {
                log::debug!("fatal log stream error: {fatal}");
                let _ignored = out_err.send(fatal.into());
                self.buffer_pending(&mut data);
                self.close_consumer_on_failure();
                return;
              },
            }
          },
          message = data.recv() => {
            let Some(message) = message else {
              log::debug!("log stream ended");
              return;
            };

            retry.on_data();
            self.buffer.lock().push(message);
          },
          () = connected.notified() => {
            log::debug!("connected to log stream");
            retry.on_connected();
            on_connect();
          },
          () = wait_for_deadline(retry.deadline()) => {
            log::debug!("no recovery within {}, reporting timeout", self.config.timeout_budget());
            let _ignored = out_err.send(Error::Timeout {
              endpoint: self.credentials.streaming_endpoint(),
            });
            retry.on_timeout();
          },
        }
      }
    }
  }

  fn spawn_flusher(
    &self,
    out_data: UnboundedSender<C::Record>,
    mut closed: CloseSignal,
  ) -> JoinHandle<()> {
    let buffer = self.buffer.clone();
    let mut ticker = self.config.buffer_time().interval_at();

    tokio::spawn(async move {
      loop {
        tokio::select! {
          () = closed.cancelled() => return,
          _ = ticker.tick() => {},
        }

        if !flush(&buffer, &out_data) {
          log::debug!("log receiver dropped, stopping flusher");
          return;
        }
      }
    })
  }

  // Moves anything the transport already delivered into the buffer so it is part of the next
  // flush.
  fn buffer_pending(&self, data: &mut UnboundedReceiver<C::Record>) {
    let mut buffer = self.buffer.lock();
    while let Ok(message) = data.try_recv() {
      buffer.push(message);
    }
  }

  async fn refresh_credentials(&self) {
    if let Err(e) = self.credentials.refresh_credentials().await {
      log::warn!("failed to refresh credentials: {e}");
    }
  }

  fn close_consumer_on_failure(&self) {
    if let Err(e) = self.close_consumer_once() {
      log::warn!("{e}");
    }
  }

  fn close_consumer_once(&self) -> Result<(), Error> {
    if self.consumer_closed.swap(true, Ordering::SeqCst) {
      return Ok(());
    }

    log::debug!("closing stream consumer");
    self.consumer.close().map_err(Error::Close)
  }
}
