// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::LogsRepository;
use crate::test::FakeStreamConsumer;
use crate::{
  ConsumerError,
  CredentialSource,
  Error,
  LogsConfig,
  MockCredentialSource,
  RecentLogsFailure,
};
use anyhow::anyhow;
use assert_matches::assert_matches;
use lt_log_primitives::LogMessage;
use lt_test_helpers::{drain_available, log_message, recv_until_closed, texts};
use lt_time::TimeDurationExt;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use time::ext::NumericalDuration;
use tokio::sync::Notify;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;
use tokio::time::Instant;

const TARGET: &str = "app-guid";
const ENDPOINT: &str = "wss://doppler.example.com:443";

struct Tail {
  data: UnboundedReceiver<LogMessage>,
  errors: UnboundedReceiver<Error>,
  connects: Arc<AtomicUsize>,
  task: JoinHandle<()>,
}

struct Setup {
  consumer: Arc<FakeStreamConsumer>,
  repository: Arc<LogsRepository<FakeStreamConsumer>>,
  refreshes: Arc<AtomicUsize>,
}

impl Setup {
  fn new() -> Self {
    Self::with_config(LogsConfig::default())
  }

  // Credentials hand out "token-N" where N is the number of refreshes so far.
  fn with_config(config: LogsConfig) -> Self {
    let refreshes = Arc::new(AtomicUsize::new(0));

    let mut credentials = MockCredentialSource::new();
    let token_refreshes = refreshes.clone();
    credentials
      .expect_access_token()
      .returning(move || format!("token-{}", token_refreshes.load(Ordering::SeqCst)));
    credentials
      .expect_streaming_endpoint()
      .returning(|| ENDPOINT.to_string());
    let counted_refreshes = refreshes.clone();
    credentials
      .expect_refresh_credentials()
      .returning(move || {
        counted_refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
      });

    let consumer = Arc::new(FakeStreamConsumer::default());
    let repository = Arc::new(
      LogsRepository::new(consumer.clone(), Arc::new(credentials), config).unwrap(),
    );

    Self {
      consumer,
      repository,
      refreshes,
    }
  }

  fn start_tail(&self) -> Tail {
    let (data_tx, data) = mpsc::unbounded_channel();
    let (errors_tx, errors) = mpsc::unbounded_channel();
    let connects = Arc::new(AtomicUsize::new(0));

    let repository = self.repository.clone();
    let task_connects = connects.clone();
    let task = tokio::spawn(async move {
      repository
        .tail_logs_for(
          TARGET,
          move || {
            task_connects.fetch_add(1, Ordering::SeqCst);
          },
          data_tx,
          errors_tx,
        )
        .await;
    });

    Tail {
      data,
      errors,
      connects,
      task,
    }
  }

  fn refreshes(&self) -> usize {
    self.refreshes.load(Ordering::SeqCst)
  }

  fn tokens_used(&self) -> Vec<String> {
    self
      .consumer
      .tail_calls()
      .into_iter()
      .map(|(target, token)| {
        assert_eq!(target, TARGET);
        token
      })
      .collect()
  }
}

fn assert_elapsed(since: Instant, expected: time::Duration) {
  let elapsed = since.elapsed();
  let expected = expected.unsigned_abs();
  assert!(
    elapsed >= expected && elapsed < expected + std::time::Duration::from_millis(25),
    "expected {expected:?}, got {elapsed:?}"
  );
}

// Credentials whose refresh blocks until the test releases it.
#[derive(Default)]
struct GatedCredentials {
  refresh_started: Notify,
  release_refresh: Notify,
}

#[async_trait::async_trait]
impl CredentialSource for GatedCredentials {
  fn access_token(&self) -> String {
    "token".to_string()
  }

  fn streaming_endpoint(&self) -> String {
    ENDPOINT.to_string()
  }

  async fn refresh_credentials(&self) -> anyhow::Result<()> {
    self.refresh_started.notify_one();
    self.release_refresh.notified().await;
    Ok(())
  }
}

fn unauthorized(reason: &str) -> RecentLogsFailure<LogMessage> {
  RecentLogsFailure::new(ConsumerError::Unauthorized(reason.to_string()))
}

#[tokio::test(start_paused = true)]
async fn flush_orders_within_window() {
  let setup = Setup::new();
  let mut tail = setup.start_tail();
  setup.consumer.wait_for_stream(1).await;

  setup.consumer.send_data(log_message("c", 300));
  setup.consumer.send_data(log_message("b", 200));
  setup.consumer.send_data(log_message("a", 100));

  let mut received = Vec::new();
  for _ in 0 .. 3 {
    received.push(tail.data.recv().await.unwrap());
  }
  assert_eq!(texts(&received), ["a", "b", "c"]);
  assert_eq!(setup.repository.buffer_high_water_mark(), 3);
}

#[tokio::test(start_paused = true)]
async fn flush_runs_every_window() {
  let setup = Setup::new();
  let mut tail = setup.start_tail();
  setup.consumer.wait_for_stream(1).await;

  setup.consumer.send_data(log_message("second", 2));
  10.milliseconds().sleep().await;
  assert!(drain_available(&mut tail.data).is_empty());

  20.milliseconds().sleep().await;
  assert_eq!(texts(&drain_available(&mut tail.data)), ["second"]);

  // A late entry with an older timestamp is not reordered across windows.
  setup.consumer.send_data(log_message("first", 1));
  30.milliseconds().sleep().await;
  assert_eq!(texts(&drain_available(&mut tail.data)), ["first"]);
}

#[tokio::test(start_paused = true)]
async fn graceful_close_flushes_buffer() {
  let setup = Setup::with_config(LogsConfig {
    buffer_time_ms: 3_600_000,
    ..Default::default()
  });
  let mut tail = setup.start_tail();
  setup.consumer.wait_for_stream(1).await;

  setup.consumer.send_data(log_message("hello", 100));
  1.seconds().sleep().await;
  assert!(drain_available(&mut tail.data).is_empty());

  setup.repository.close().await.unwrap();

  // Both channels are closed by the time close() returns.
  assert_eq!(texts(&drain_available(&mut tail.data)), ["hello"]);
  assert!(tail.data.recv().await.is_none());
  assert!(tail.errors.recv().await.is_none());
  tail.task.await.unwrap();
  assert_eq!(setup.consumer.close_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn close_is_idempotent() {
  let setup = Setup::new();
  let tail = setup.start_tail();
  setup.consumer.wait_for_stream(1).await;

  setup.repository.close().await.unwrap();
  setup.repository.close().await.unwrap();

  tail.task.await.unwrap();
  assert_eq!(setup.consumer.close_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn close_reports_consumer_failure() {
  let setup = Setup::new();
  let mut tail = setup.start_tail();
  setup.consumer.wait_for_stream(1).await;
  setup.consumer.fail_close("socket busy");

  let error = setup.repository.close().await.unwrap_err();
  assert_matches!(error, Error::Close(e) if e.to_string() == "socket busy");

  // The tail still unwinds.
  assert!(tail.data.recv().await.is_none());
  tail.task.await.unwrap();
  setup.repository.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn stream_end_flushes_and_closes() {
  let setup = Setup::new();
  let mut tail = setup.start_tail();
  setup.consumer.wait_for_stream(1).await;

  setup.consumer.send_data(log_message("b", 2));
  setup.consumer.send_data(log_message("a", 1));
  setup.consumer.end_stream();

  assert_eq!(texts(&recv_until_closed(&mut tail.data).await), ["a", "b"]);
  assert!(tail.errors.recv().await.is_none());
  tail.task.await.unwrap();

  // Only close() closes the consumer when the stream simply ends.
  assert_eq!(setup.consumer.close_calls(), 0);
  setup.repository.close().await.unwrap();
  assert_eq!(setup.consumer.close_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn timeout_reported_once_per_budget() {
  let setup = Setup::new();
  let mut tail = setup.start_tail();
  setup.consumer.wait_for_stream(1).await;

  let start = Instant::now();
  setup
    .consumer
    .send_error(ConsumerError::Retryable("connection reset".to_string()));
  assert_matches!(
    tail.errors.recv().await,
    Some(Error::Timeout { endpoint }) if endpoint == ENDPOINT
  );
  assert_elapsed(start, 5.seconds());

  // Further interruptions while reconnecting do not move the deadline.
  setup
    .consumer
    .send_error(ConsumerError::Retryable("connection reset".to_string()));
  100.milliseconds().sleep().await;
  assert!(drain_available(&mut tail.errors).is_empty());

  // Still down, so another timeout follows a full budget later. The tail keeps going.
  assert_matches!(tail.errors.recv().await, Some(Error::Timeout { .. }));
  assert_elapsed(start, 10.seconds());
  assert!(!tail.task.is_finished());
}

#[tokio::test(start_paused = true)]
async fn connect_resets_timeout_budget() {
  let setup = Setup::new();
  let mut tail = setup.start_tail();
  setup.consumer.wait_for_stream(1).await;

  setup
    .consumer
    .send_error(ConsumerError::Retryable("connection reset".to_string()));
  assert_matches!(tail.errors.recv().await, Some(Error::Timeout { .. }));

  setup.consumer.connect();
  10.milliseconds().sleep().await;
  assert_eq!(tail.connects.load(Ordering::SeqCst), 1);

  let interrupted = Instant::now();
  setup
    .consumer
    .send_error(ConsumerError::Retryable("connection reset".to_string()));
  assert_matches!(tail.errors.recv().await, Some(Error::Timeout { .. }));
  assert_elapsed(interrupted, 5.seconds());
}

#[tokio::test(start_paused = true)]
async fn data_clears_pending_deadline() {
  let setup = Setup::new();
  let mut tail = setup.start_tail();
  setup.consumer.wait_for_stream(1).await;

  setup
    .consumer
    .send_error(ConsumerError::Retryable("connection reset".to_string()));
  2.seconds().sleep().await;
  setup.consumer.send_data(log_message("alive", 1));
  10.seconds().sleep().await;

  assert!(drain_available(&mut tail.errors).is_empty());
  assert_eq!(texts(&drain_available(&mut tail.data)), ["alive"]);
}

#[tokio::test(start_paused = true)]
async fn on_connect_runs_per_connection() {
  let setup = Setup::new();
  let tail = setup.start_tail();
  setup.consumer.wait_for_stream(1).await;

  setup.consumer.connect();
  10.milliseconds().sleep().await;
  setup.consumer.connect();
  10.milliseconds().sleep().await;

  assert_eq!(tail.connects.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn fatal_error_ends_tail() {
  let setup = Setup::new();
  let mut tail = setup.start_tail();
  setup.consumer.wait_for_stream(1).await;

  setup.consumer.send_data(log_message("last words", 1));
  setup
    .consumer
    .send_error(ConsumerError::Fatal(anyhow!("websocket protocol error")));

  assert_matches!(
    tail.errors.recv().await,
    Some(Error::Consumer(ConsumerError::Fatal(e))) if e.to_string() == "websocket protocol error"
  );
  assert!(tail.errors.recv().await.is_none());
  assert_eq!(
    texts(&recv_until_closed(&mut tail.data).await),
    ["last words"]
  );
  tail.task.await.unwrap();
  assert_eq!(setup.consumer.close_calls(), 1);

  // The consumer is not closed a second time.
  setup.repository.close().await.unwrap();
  assert_eq!(setup.consumer.close_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn unauthorized_refreshes_and_reconnects() {
  let setup = Setup::new();
  let mut tail = setup.start_tail();
  setup.consumer.wait_for_stream(1).await;

  setup
    .consumer
    .send_error(ConsumerError::Unauthorized("token expired".to_string()));
  setup.consumer.wait_for_stream(2).await;

  assert_eq!(setup.refreshes(), 1);
  assert_eq!(setup.tokens_used(), ["token-0", "token-1"]);

  setup.consumer.send_data(log_message("after refresh", 1));
  assert_eq!(
    texts(&[tail.data.recv().await.unwrap()]),
    ["after refresh"]
  );
  assert!(drain_available(&mut tail.errors).is_empty());
}

#[tokio::test(start_paused = true)]
async fn repeated_unauthorized_gives_up() {
  let setup = Setup::new();
  let mut tail = setup.start_tail();
  setup.consumer.wait_for_stream(1).await;

  setup
    .consumer
    .send_error(ConsumerError::Unauthorized("token expired".to_string()));
  setup.consumer.wait_for_stream(2).await;
  setup
    .consumer
    .send_error(ConsumerError::Unauthorized("token revoked".to_string()));

  assert_matches!(
    tail.errors.recv().await,
    Some(Error::StillUnauthorized(reason)) if reason == "token revoked"
  );
  assert!(tail.errors.recv().await.is_none());
  assert!(tail.data.recv().await.is_none());
  tail.task.await.unwrap();

  assert_eq!(setup.refreshes(), 1);
  assert_eq!(setup.tokens_used().len(), 2);
  assert_eq!(setup.consumer.close_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn unauthorized_retries_reset_on_connect() {
  let setup = Setup::new();
  let mut tail = setup.start_tail();
  setup.consumer.wait_for_stream(1).await;

  setup
    .consumer
    .send_error(ConsumerError::Unauthorized("token expired".to_string()));
  setup.consumer.wait_for_stream(2).await;
  setup.consumer.connect();
  10.milliseconds().sleep().await;

  setup
    .consumer
    .send_error(ConsumerError::Unauthorized("token expired".to_string()));
  setup.consumer.wait_for_stream(3).await;

  assert_eq!(setup.refreshes(), 2);
  assert_eq!(setup.tokens_used(), ["token-0", "token-1", "token-2"]);
  assert!(drain_available(&mut tail.errors).is_empty());
}

#[tokio::test(start_paused = true)]
async fn dropped_receiver_ends_tail() {
  let setup = Setup::new();
  let Tail { data, task, .. } = setup.start_tail();
  setup.consumer.wait_for_stream(1).await;

  drop(data);
  task.await.unwrap();

  // Nobody is reading any more, so the transport stream is released right away.
  assert_eq!(setup.consumer.close_calls(), 1);
  setup.repository.close().await.unwrap();
  assert_eq!(setup.consumer.close_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn close_during_refresh_does_not_reconnect() {
  let consumer = Arc::new(FakeStreamConsumer::default());
  let credentials = Arc::new(GatedCredentials::default());
  let repository = Arc::new(
    LogsRepository::new(consumer.clone(), credentials.clone(), LogsConfig::default()).unwrap(),
  );

  let (data_tx, mut data) = mpsc::unbounded_channel();
  let (errors_tx, mut errors) = mpsc::unbounded_channel();
  let tail = tokio::spawn({
    let repository = repository.clone();
    async move {
      repository
        .tail_logs_for(TARGET, || {}, data_tx, errors_tx)
        .await;
    }
  });
  consumer.wait_for_stream(1).await;

  consumer.send_error(ConsumerError::Unauthorized("token expired".to_string()));
  credentials.refresh_started.notified().await;

  let close = tokio::spawn({
    let repository = repository.clone();
    async move { repository.close().await }
  });
  10.milliseconds().sleep().await;
  assert_eq!(consumer.close_calls(), 1);
  assert!(!close.is_finished());

  credentials.release_refresh.notify_one();
  close.await.unwrap().unwrap();
  tail.await.unwrap();

  assert_eq!(consumer.tail_calls().len(), 1);
  assert_eq!(consumer.close_calls(), 1);
  assert!(data.recv().await.is_none());
  assert!(errors.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn tail_after_close() {
  let setup = Setup::new();
  setup.repository.close().await.unwrap();

  let mut tail = setup.start_tail();
  tail.task.await.unwrap();
  assert!(tail.data.recv().await.is_none());
  assert!(tail.errors.recv().await.is_none());
  assert!(setup.consumer.tail_calls().is_empty());
}

#[tokio::test]
async fn recent_logs_sorted() {
  let setup = Setup::new();
  setup.consumer.push_recent_logs(Ok(vec![
    log_message("msg2", 2000),
    log_message("msg1", 1000),
  ]));

  let logs = setup.repository.recent_logs_for(TARGET).await.unwrap();
  assert_eq!(texts(&logs), ["msg1", "msg2"]);
  assert_eq!(
    setup.consumer.recent_logs_calls(),
    [(TARGET.to_string(), "token-0".to_string())]
  );
}

#[tokio::test]
async fn recent_logs_sort_is_stable() {
  let setup = Setup::new();
  setup.consumer.push_recent_logs(Ok(vec![
    log_message("b", 5),
    log_message("a", 5),
    log_message("c", 1),
    log_message("d", 5),
  ]));

  let logs = setup.repository.recent_logs_for(TARGET).await.unwrap();
  assert_eq!(texts(&logs), ["c", "b", "a", "d"]);
}

#[tokio::test]
async fn recent_logs_unauthorized_is_bounded() {
  let setup = Setup::new();
  for _ in 0 .. 3 {
    setup
      .consumer
      .push_recent_logs(Err(unauthorized("token expired")));
  }

  let error = setup.repository.recent_logs_for(TARGET).await.unwrap_err();
  assert_matches!(error.error, Error::StillUnauthorized(_));
  assert!(error.partial.is_empty());
  assert_eq!(setup.consumer.recent_logs_calls().len(), 2);
  assert_eq!(setup.refreshes(), 1);
}

#[tokio::test]
async fn recent_logs_no_unauthorized_retries() {
  let setup = Setup::with_config(LogsConfig {
    max_unauthorized_retries: 0,
    ..Default::default()
  });
  setup
    .consumer
    .push_recent_logs(Err(unauthorized("token expired")));

  let error = setup.repository.recent_logs_for(TARGET).await.unwrap_err();
  assert_matches!(error.error, Error::StillUnauthorized(_));
  assert_eq!(setup.consumer.recent_logs_calls().len(), 1);
  assert_eq!(setup.refreshes(), 0);
}

#[tokio::test]
async fn recent_logs_succeeds_after_refresh() {
  let setup = Setup::new();
  setup
    .consumer
    .push_recent_logs(Err(unauthorized("token expired")));
  setup
    .consumer
    .push_recent_logs(Ok(vec![log_message("fresh", 1)]));

  let logs = setup.repository.recent_logs_for(TARGET).await.unwrap();
  assert_eq!(texts(&logs), ["fresh"]);

  let tokens: Vec<_> = setup
    .consumer
    .recent_logs_calls()
    .into_iter()
    .map(|(_, token)| token)
    .collect();
  assert_eq!(tokens, ["token-0", "token-1"]);
}

#[tokio::test]
async fn recent_logs_error_carries_partial_data() {
  let setup = Setup::new();
  setup.consumer.push_recent_logs(Err(RecentLogsFailure {
    error: ConsumerError::Retryable("connection reset".to_string()),
    partial: vec![log_message("b", 2), log_message("a", 1)],
  }));

  let error = setup.repository.recent_logs_for(TARGET).await.unwrap_err();
  assert_matches!(error.error, Error::Consumer(ConsumerError::Retryable(_)));
  // Partial data is handed back as the transport returned it.
  assert_eq!(texts(&error.partial), ["b", "a"]);
  assert_eq!(setup.refreshes(), 0);
}

#[tokio::test]
async fn recent_logs_after_close() {
  let setup = Setup::new();
  setup.repository.close().await.unwrap();

  let error = setup.repository.recent_logs_for(TARGET).await.unwrap_err();
  assert_matches!(error.error, Error::Closed);
  assert!(setup.consumer.recent_logs_calls().is_empty());
}

#[test]
fn rejects_invalid_config() {
  let consumer = Arc::new(FakeStreamConsumer::default());
  let result = LogsRepository::new(
    consumer,
    Arc::new(MockCredentialSource::new()),
    LogsConfig {
      buffer_time_ms: 0,
      ..Default::default()
    },
  );
  assert!(result.is_err());
}
