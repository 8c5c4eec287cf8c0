//! End-to-end tests for the coordination server.
//!
//! Every test runs a real server on an ephemeral port against an in-memory
//! store, and talks to it through the generated clients or the operator-side
//! helpers. Clients are dropped before `shutdown`, which waits for open
//! streams.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::metadata::MetadataValue;
use tonic::{Code, Request, async_trait};

use osmo::backends::{
    BackendError, BackendResult, EventLogBackend, EventRecord, NewEvent, NodeConditionBackend,
    TaskLogBackend, TaskLogLine,
};
use osmo::lifecycle::{Group, RetryPolicy, Task};
use osmo::messages::{
    AUTH_TOKEN_METADATA, BACKEND_NAME_METADATA, log_path, timestamp_from_datetime,
};
use osmo::proto::config_service_client::ConfigServiceClient;
use osmo::proto::controller_service_client::ControllerServiceClient;
use osmo::proto::listener_service_client::ListenerServiceClient;
use osmo::proto::{self, controller_message, service_message};
use osmo::controller::{ControllerConnection, LogSink, NoToken};
use osmo::retry::BackoffConfig;
use osmo::{
    BackendEvent, CoordinationServer, EventConsumer, EventConsumerConfig, EventSender,
    MemoryBackend, NodeConditionRules, NodeConditionSubscriber, ServerOptions, TaskGroupStatus,
    TaskUpdate, TrackerRegistry, Workflow, WorkflowStatus, WorkflowTracker,
};

const WAIT_LIMIT: Duration = Duration::from_secs(5);

/// Memory store with injectable append latency and failures.
#[derive(Clone)]
struct FlakyStore {
    inner: MemoryBackend,
    append_delay: Duration,
    fail_appends: Arc<AtomicBool>,
    /// Task log appends still to reject before writes succeed again.
    log_failures_left: Arc<AtomicUsize>,
}

impl FlakyStore {
    fn new(append_delay: Duration) -> Self {
        Self {
            inner: MemoryBackend::new(),
            append_delay,
            fail_appends: Arc::new(AtomicBool::new(false)),
            log_failures_left: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl EventLogBackend for FlakyStore {
    async fn append_event(&self, event: NewEvent) -> BackendResult<i64> {
        tokio::time::sleep(self.append_delay).await;
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(BackendError::Message("store unavailable".to_string()));
        }
        self.inner.append_event(event).await
    }

    async fn read_events(
        &self,
        stream_key: &str,
        after: i64,
        limit: usize,
    ) -> BackendResult<Vec<EventRecord>> {
        self.inner.read_events(stream_key, after, limit).await
    }
}

#[async_trait]
impl NodeConditionBackend for FlakyStore {
    async fn get_node_conditions(&self, backend_name: &str) -> BackendResult<NodeConditionRules> {
        self.inner.get_node_conditions(backend_name).await
    }

    async fn push_node_conditions(
        &self,
        backend_name: &str,
        rules: &NodeConditionRules,
    ) -> BackendResult<()> {
        self.inner.push_node_conditions(backend_name, rules).await
    }

    async fn enqueue_node_condition_payload(
        &self,
        backend_name: &str,
        payload: &str,
    ) -> BackendResult<()> {
        self.inner
            .enqueue_node_condition_payload(backend_name, payload)
            .await
    }

    async fn pop_node_condition_update(
        &self,
        backend_name: &str,
        timeout: Duration,
    ) -> BackendResult<Option<String>> {
        self.inner
            .pop_node_condition_update(backend_name, timeout)
            .await
    }
}

#[async_trait]
impl TaskLogBackend for FlakyStore {
    async fn append_task_logs(&self, log_key: &str, lines: &[TaskLogLine]) -> BackendResult<()> {
        let rejected = self
            .log_failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(BackendError::Message("log store unavailable".to_string()));
        }
        self.inner.append_task_logs(log_key, lines).await
    }

    async fn close_task_log(&self, log_key: &str) -> BackendResult<()> {
        self.inner.close_task_log(log_key).await
    }

    async fn read_task_logs(&self, log_key: &str) -> BackendResult<Vec<TaskLogLine>> {
        self.inner.read_task_logs(log_key).await
    }

    async fn task_log_closed(&self, log_key: &str) -> BackendResult<bool> {
        self.inner.task_log_closed(log_key).await
    }
}

fn test_options() -> ServerOptions {
    ServerOptions {
        pop_timeout: Duration::from_millis(200),
        barrier_timeout: Duration::from_secs(5),
        ..ServerOptions::default()
    }
}

fn url(server: &CoordinationServer) -> String {
    format!("http://{}", server.addr())
}

fn with_metadata<T>(message: T, key: &'static str, value: &str) -> Request<T> {
    let mut request = Request::new(message);
    request
        .metadata_mut()
        .insert(key, MetadataValue::try_from(value).expect("ascii metadata"));
    request
}

fn listener_data(uuid: &str, event: &BackendEvent) -> proto::ListenerMessage {
    proto::ListenerMessage {
        uuid: uuid.to_string(),
        r#type: proto::ListenerMessageType::Data as i32,
        timestamp: Some(timestamp_from_datetime(Utc::now())),
        body: event.to_body().expect("body"),
    }
}

fn heartbeat() -> BackendEvent {
    BackendEvent::Heartbeat {
        backend: "cluster-a".to_string(),
    }
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT_LIMIT;
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_ack_is_sent_only_after_event_is_persisted() -> Result<()> {
    let store = FlakyStore::new(Duration::from_millis(150));
    let server = CoordinationServer::start(None, store.clone(), test_options()).await?;

    let (tx, rx) = mpsc::channel(8);
    let mut client = ListenerServiceClient::connect(url(&server)).await?;
    let mut inbound = client
        .workflow_listener_stream(with_metadata(
            ReceiverStream::new(rx),
            BACKEND_NAME_METADATA,
            "cluster-a",
        ))
        .await?
        .into_inner();

    // A stray ack from the backend is ignored rather than persisted.
    tx.send(proto::ListenerMessage {
        uuid: "stray".to_string(),
        r#type: proto::ListenerMessageType::Ack as i32,
        timestamp: None,
        body: String::new(),
    })
    .await?;
    let started = Instant::now();
    tx.send(listener_data("x-1", &heartbeat())).await?;

    let ack = inbound.message().await?.expect("ack for x-1");
    assert_eq!(ack.uuid, "x-1");
    assert_eq!(ack.r#type, proto::ListenerMessageType::Ack as i32);
    assert!(ack.body.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(150));

    let events = store.inner.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].message_uuid, "x-1");
    assert_eq!(events[0].backend_name, "cluster-a");

    drop(tx);
    assert!(inbound.message().await?.is_none());
    drop(inbound);
    drop(client);
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_store_failure_closes_stream_without_ack() -> Result<()> {
    let store = FlakyStore::new(Duration::ZERO);
    store.fail_appends.store(true, Ordering::SeqCst);
    let server = CoordinationServer::start(None, store.clone(), test_options()).await?;

    let (tx, rx) = mpsc::channel(8);
    let mut client = ListenerServiceClient::connect(url(&server)).await?;
    let mut inbound = client
        .workflow_listener_stream(with_metadata(
            ReceiverStream::new(rx),
            BACKEND_NAME_METADATA,
            "cluster-a",
        ))
        .await?
        .into_inner();
    tx.send(listener_data("x-2", &heartbeat())).await?;

    let status = inbound.message().await.expect_err("stream should fail");
    assert_eq!(status.code(), Code::Unavailable);
    assert!(store.inner.events().is_empty());

    drop(tx);
    drop(inbound);
    drop(client);
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_streams_without_backend_name_are_rejected() -> Result<()> {
    let server = CoordinationServer::start(None, MemoryBackend::new(), test_options()).await?;

    let mut listener = ListenerServiceClient::connect(url(&server)).await?;
    let status = listener
        .workflow_listener_stream(Request::new(tokio_stream::iter(Vec::<
            proto::ListenerMessage,
        >::new())))
        .await
        .expect_err("missing backend name");
    assert_eq!(status.code(), Code::InvalidArgument);

    let mut config = ConfigServiceClient::connect(url(&server)).await?;
    let status = config
        .node_condition_stream(with_metadata(
            proto::NodeConditionRequest {},
            BACKEND_NAME_METADATA,
            "  ",
        ))
        .await
        .expect_err("blank backend name");
    assert_eq!(status.code(), Code::InvalidArgument);

    drop(listener);
    drop(config);
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_node_conditions_skip_malformed_and_stay_per_backend() -> Result<()> {
    let backend = MemoryBackend::new();
    let server = CoordinationServer::start(None, backend.clone(), test_options()).await?;

    let initial = NodeConditionRules::new().with_rule("Ready", true);
    backend.push_node_conditions("cluster-a", &initial).await?;

    let subscriber = NodeConditionSubscriber::new("cluster-a");
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(subscriber.clone().run(url(&server), shutdown.clone()));
    eventually("initial rules", || subscriber.current() == initial).await;

    // Another backend sees only its own (empty) rule set.
    let mut other = ConfigServiceClient::connect(url(&server)).await?;
    let mut other_stream = other
        .node_condition_stream(with_metadata(
            proto::NodeConditionRequest {},
            BACKEND_NAME_METADATA,
            "cluster-b",
        ))
        .await?
        .into_inner();
    let first = other_stream.message().await?.expect("initial push");
    assert!(first.rules.is_empty());

    backend
        .enqueue_node_condition_payload("cluster-a", "{not json")
        .await?;
    let replacement = NodeConditionRules::new()
        .with_rule("Ready", true)
        .with_rule("DiskPressure", false);
    backend.push_node_conditions("cluster-a", &replacement).await?;
    eventually("replacement rules", || subscriber.current() == replacement).await;
    assert_eq!(backend.queued_node_condition_updates("cluster-a"), 0);

    let healthy = [
        ("Ready".to_string(), true),
        ("DiskPressure".to_string(), false),
    ]
    .into_iter()
    .collect();
    assert!(subscriber.node_is_eligible(&healthy));

    let quiet = tokio::time::timeout(Duration::from_millis(300), other_stream.message()).await;
    assert!(quiet.is_err(), "cluster-b must not see cluster-a pushes");

    drop(other_stream);
    drop(other);
    shutdown.cancel();
    handle.await?;
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_event_sender_replays_unacked_and_feeds_lifecycle() -> Result<()> {
    let backend = MemoryBackend::new();
    let server = CoordinationServer::start(None, backend.clone(), test_options()).await?;

    let group = Group::new("train", "trainer", vec![Task::new("trainer")])?;
    let workflow = Workflow::new("wf-relay", "relay", vec![group])?;
    let trackers = TrackerRegistry::new();
    trackers.register(WorkflowTracker::new(workflow, RetryPolicy::new(0)));

    let update = |status| {
        BackendEvent::TaskUpdate(TaskUpdate {
            workflow_id: "wf-relay".to_string(),
            task_name: "trainer".to_string(),
            retry_id: 0,
            status,
            exit_code: None,
            message: None,
        })
    };

    // Sent before any connection exists; kept for replay.
    let sender = EventSender::new("cluster-a");
    let first = sender.send(&update(TaskGroupStatus::Running)).await?;
    let second = sender.send(&heartbeat()).await?;
    assert_eq!(sender.pending(), 2);

    let shutdown = CancellationToken::new();
    let relay = tokio::spawn(sender.clone().run(url(&server), shutdown.clone()));
    eventually("replayed events acked", || sender.pending() == 0).await;

    let third = sender.send(&update(TaskGroupStatus::Completed)).await?;
    eventually("live event acked", || sender.pending() == 0).await;

    let uuids: Vec<String> = backend
        .events()
        .into_iter()
        .map(|record| record.message_uuid)
        .collect();
    assert_eq!(uuids, vec![first, second, third]);

    let mut consumer = EventConsumer::new(
        backend.clone(),
        trackers.clone(),
        EventConsumerConfig::default(),
    );
    assert_eq!(consumer.poll_once().await?, 3);
    assert_eq!(trackers.status("wf-relay"), Some(WorkflowStatus::Completed));

    shutdown.cancel();
    relay.await?;
    server.shutdown().await;
    Ok(())
}

type SessionTx = mpsc::Sender<proto::ControllerMessage>;

fn open_message(task: &str) -> proto::ControllerMessage {
    proto::ControllerMessage {
        payload: Some(controller_message::Payload::Open(proto::SessionOpen {
            workflow_id: "wf-barrier".to_string(),
            group_name: "ranks".to_string(),
            task_name: task.to_string(),
            retry_id: 0,
        })),
    }
}

fn barrier_message(name: &str, count: u32) -> proto::ControllerMessage {
    proto::ControllerMessage {
        payload: Some(controller_message::Payload::Barrier(proto::BarrierRequest {
            name: name.to_string(),
            count,
        })),
    }
}

async fn open_session(
    server: &CoordinationServer,
    task: &str,
    token: Option<&str>,
) -> Result<(SessionTx, tonic::Streaming<proto::ServiceMessage>), tonic::Status> {
    let (tx, rx) = mpsc::channel(16);
    tx.send(open_message(task))
        .await
        .map_err(|_| tonic::Status::internal("session channel closed"))?;
    let mut client = ControllerServiceClient::connect(url(server))
        .await
        .map_err(|err| tonic::Status::unavailable(err.to_string()))?;
    let stream = ReceiverStream::new(rx);
    let request = match token {
        Some(token) => with_metadata(stream, AUTH_TOKEN_METADATA, token),
        None => Request::new(stream),
    };
    let inbound = client.session(request).await?.into_inner();
    Ok((tx, inbound))
}

#[tokio::test]
async fn test_barrier_releases_once_every_participant_arrived() -> Result<()> {
    let server = CoordinationServer::start(None, MemoryBackend::new(), test_options()).await?;

    let (first_tx, mut first_rx) = open_session(&server, "rank-0", None).await?;
    let (second_tx, mut second_rx) = open_session(&server, "rank-1", None).await?;

    first_tx.send(barrier_message("sync", 2)).await?;
    let early = tokio::time::timeout(Duration::from_millis(200), first_rx.message()).await;
    assert!(early.is_err(), "barrier must hold until both ranks arrive");
    eventually("barrier registered", || server.barriers().pending() == 1).await;

    second_tx.send(barrier_message("sync", 2)).await?;
    for inbound in [&mut first_rx, &mut second_rx] {
        let reply = inbound.message().await?.expect("barrier reply");
        match reply.payload {
            Some(service_message::Payload::BarrierReleased(released)) => {
                assert_eq!(released.name, "sync");
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }
    assert_eq!(server.barriers().pending(), 0);

    // Mismatched participant counts are reported to the late caller.
    first_tx.send(barrier_message("again", 2)).await?;
    eventually("second barrier registered", || {
        server.barriers().pending() == 1
    })
    .await;
    second_tx.send(barrier_message("again", 3)).await?;
    let reply = second_rx.message().await?.expect("barrier reply");
    match reply.payload {
        Some(service_message::Payload::BarrierFailed(failed)) => {
            assert_eq!(failed.name, "again");
            assert!(!failed.reason.is_empty());
        }
        other => panic!("unexpected reply {other:?}"),
    }

    drop(first_tx);
    drop(second_tx);
    drop(first_rx);
    drop(second_rx);
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_controller_sessions_require_known_token() -> Result<()> {
    let options = ServerOptions {
        controller_tokens: Some(vec!["secret".to_string()]),
        ..test_options()
    };
    let server = CoordinationServer::start(None, MemoryBackend::new(), options).await?;

    let missing = open_session(&server, "rank-0", None)
        .await
        .expect_err("missing token");
    assert_eq!(missing.code(), Code::Unauthenticated);

    let wrong = open_session(&server, "rank-0", Some("guess"))
        .await
        .expect_err("wrong token");
    assert_eq!(wrong.code(), Code::Unauthenticated);

    let (tx, inbound) = open_session(&server, "rank-0", Some("secret")).await?;
    drop(tx);
    drop(inbound);
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_session_persists_logs_and_closes_on_log_done() -> Result<()> {
    let backend = MemoryBackend::new();
    let server = CoordinationServer::start(None, backend.clone(), test_options()).await?;
    let (tx, mut inbound) = open_session(&server, "rank-0", None).await?;

    let line = |io_type: proto::IoType, text: &str| proto::LogMessage {
        source: "rank-0".to_string(),
        time: Some(timestamp_from_datetime(Utc::now())),
        text: text.to_string(),
        io_type: io_type as i32,
    };
    tx.send(proto::ControllerMessage {
        payload: Some(controller_message::Payload::Logs(proto::LogBatch {
            messages: vec![
                line(proto::IoType::Stdout, "epoch 1"),
                line(proto::IoType::Stderr, "warning: slow disk"),
            ],
            sequence: 1,
        })),
    })
    .await?;
    tx.send(proto::ControllerMessage {
        payload: Some(controller_message::Payload::Logs(proto::LogBatch {
            messages: vec![line(proto::IoType::LogDone, "")],
            sequence: 2,
        })),
    })
    .await?;
    drop(tx);
    for expected in [1, 2] {
        let reply = inbound.message().await?.expect("log ack");
        match reply.payload {
            Some(service_message::Payload::LogAck(ack)) => assert_eq!(ack.sequence, expected),
            other => panic!("unexpected reply {other:?}"),
        }
    }
    assert!(inbound.message().await?.is_none());

    let key = log_path("wf-barrier", "rank-0", 0);
    assert!(backend.task_log_closed(&key).await?);
    let lines = backend.read_task_logs(&key).await?;
    let texts: Vec<(&str, &str)> = lines
        .iter()
        .map(|line| (line.io_type.as_str(), line.text.as_str()))
        .collect();
    assert_eq!(
        texts,
        vec![("STDOUT", "epoch 1"), ("STDERR", "warning: slow disk")]
    );

    drop(inbound);
    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_log_batches_survive_session_failure() -> Result<()> {
    let store = FlakyStore::new(Duration::ZERO);
    store.log_failures_left.store(1, Ordering::SeqCst);
    let server = CoordinationServer::start(None, store.clone(), test_options()).await?;

    let connection = Arc::new(
        ControllerConnection::new(
            url(&server),
            AUTH_TOKEN_METADATA,
            Arc::new(NoToken),
            proto::SessionOpen {
                workflow_id: "wf-logs".to_string(),
                group_name: "g".to_string(),
                task_name: "train".to_string(),
                retry_id: 0,
            },
        )
        .with_backoff(BackoffConfig::exponential(10), Duration::from_millis(50)),
    );
    let session = CancellationToken::new();
    let runner = tokio::spawn(Arc::clone(&connection).run(session.clone()));
    eventually("session open", || connection.is_connected()).await;

    // The first batch fails to persist, which ends the session while the
    // rest are still queued behind it.
    for index in 0..5 {
        let batch = vec![proto::LogMessage {
            source: "train".to_string(),
            time: Some(timestamp_from_datetime(Utc::now())),
            text: format!("line-{index}"),
            io_type: proto::IoType::Stdout as i32,
        }];
        let deadline = Instant::now() + WAIT_LIMIT;
        while connection.send_logs(batch.clone()).await.is_err() {
            assert!(Instant::now() < deadline, "session never came back");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    let key = log_path("wf-logs", "train", 0);
    let deadline = Instant::now() + WAIT_LIMIT;
    loop {
        if store.inner.read_task_logs(&key).await?.len() >= 5 && connection.unacked_batches() == 0 {
            break;
        }
        assert!(Instant::now() < deadline, "logs never arrived");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(store.log_failures_left.load(Ordering::SeqCst), 0);
    let texts: Vec<String> = store
        .inner
        .read_task_logs(&key)
        .await?
        .into_iter()
        .map(|line| line.text)
        .collect();
    assert_eq!(
        texts,
        (0..5).map(|index| format!("line-{index}")).collect::<Vec<_>>()
    );

    session.cancel();
    runner.await?;
    server.shutdown().await;
    Ok(())
}
