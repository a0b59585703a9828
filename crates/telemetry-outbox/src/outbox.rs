// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The owner: one task holding the store, queue, event buffer, session and
//! identity, driven by commands from [`OutboxHandle`]s and a fixed-interval
//! tick.
//!
//! Every tick runs, in order:
//! 1. session extension (a `session_duration` request once `session_update`
//!    has elapsed),
//! 2. a flush of up to `max_event_batch` buffered events into one `events`
//!    request,
//! 3. a dispatch of the queue head, if nothing is in flight, the backoff
//!    deadline has passed and test mode is off.
//!
//! At most one delivery (queued request or remote-config read) is outstanding
//! at any time, so requests reach the endpoint in enqueue order. A failed
//! delivery goes back to the head of the queue and arms a `fail_timeout`
//! backoff.

use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::batcher::EventBatcher;
use crate::config::Config;
use crate::constants::REMOTE_CONFIG_KEY;
use crate::errors::{OutboxError, ProducerError, StoreError, TransportError, ValidationError};
use crate::identity::{DeviceIdType, Identity};
use crate::producer::Producer;
use crate::queue::RequestQueue;
use crate::request::{Event, Request, RequestKind, Stamp};
use crate::session::Session;
use crate::store::PersistentStore;
use crate::transport::{Transport, Validation};

#[derive(Debug)]
pub enum OutboxCommand {
    Submit(RequestKind),
    RecordEvent(Event),
    FlushEvents,
    ChangeIdentity {
        device_id: String,
        merge: bool,
    },
    BeginSession(Option<Map<String, Value>>),
    EndSession,
    FetchRemoteConfig {
        keys: Option<Vec<String>>,
        response_tx: oneshot::Sender<Result<Value, String>>,
    },
    Stats(oneshot::Sender<OutboxStats>),
    Flush(oneshot::Sender<Result<(), String>>),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    InFlight,
    Backoff { until: Instant },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxStats {
    pub queue_len: usize,
    pub event_count: usize,
    pub dispatch_state: DispatchState,
    pub session_active: bool,
    pub identity: Identity,
}

#[derive(Clone)]
pub struct OutboxHandle {
    tx: mpsc::UnboundedSender<OutboxCommand>,
}

impl OutboxHandle {
    fn send(&self, command: OutboxCommand) -> Result<(), ProducerError> {
        self.tx
            .send(command)
            .map_err(|e| ProducerError::ChannelClosed(e.to_string()))
    }

    pub fn begin_session(&self, metrics: Option<Map<String, Value>>) -> Result<(), ProducerError> {
        self.send(OutboxCommand::BeginSession(metrics))
    }

    pub fn end_session(&self) -> Result<(), ProducerError> {
        self.send(OutboxCommand::EndSession)
    }

    /// Fetches remote config for `keys` (all keys when `None`). The read waits
    /// for the single delivery slot like any queued request.
    pub async fn fetch_remote_config(&self, keys: Option<Vec<String>>) -> Result<Value, String> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(OutboxCommand::FetchRemoteConfig { keys, response_tx })
            .map_err(|e| format!("Failed to send fetch_remote_config command: {}", e))?;

        response_rx
            .await
            .map_err(|e| format!("Failed to receive fetch_remote_config response: {}", e))?
    }

    pub async fn stats(&self) -> Result<OutboxStats, String> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(OutboxCommand::Stats(response_tx))
            .map_err(|e| format!("Failed to send stats command: {}", e))?;

        response_rx
            .await
            .map_err(|e| format!("Failed to receive stats response: {}", e))
    }

    pub async fn queue_len(&self) -> Result<usize, String> {
        Ok(self.stats().await?.queue_len)
    }

    pub async fn event_count(&self) -> Result<usize, String> {
        Ok(self.stats().await?.event_count)
    }

    pub async fn dispatch_state(&self) -> Result<DispatchState, String> {
        Ok(self.stats().await?.dispatch_state)
    }

    /// Resolves once every store write issued so far has reached disk.
    pub async fn flush(&self) -> Result<(), String> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(OutboxCommand::Flush(response_tx))
            .map_err(|e| format!("Failed to send flush command: {}", e))?;

        response_rx
            .await
            .map_err(|e| format!("Failed to receive flush response: {}", e))?
    }

    pub fn shutdown(&self) -> Result<(), mpsc::error::SendError<OutboxCommand>> {
        self.tx.send(OutboxCommand::Shutdown)
    }
}

impl Producer for OutboxHandle {
    fn submit_request(&self, kind: RequestKind) -> Result<(), ProducerError> {
        kind.validate()?;
        self.send(OutboxCommand::Submit(kind))
    }

    fn record_event(&self, event: Event) -> Result<(), ProducerError> {
        event.validate()?;
        self.send(OutboxCommand::RecordEvent(event))
    }

    fn flush_events_now(&self) -> Result<(), ProducerError> {
        self.send(OutboxCommand::FlushEvents)
    }

    fn change_identity(&self, device_id: &str, merge: bool) -> Result<(), ProducerError> {
        if device_id.is_empty() {
            return Err(ValidationError::EmptyDeviceId.into());
        }
        self.send(OutboxCommand::ChangeIdentity {
            device_id: device_id.to_string(),
            merge,
        })
    }
}

#[derive(Debug)]
struct PendingRead {
    keys: Option<Vec<String>>,
    response_tx: oneshot::Sender<Result<Value, String>>,
}

#[derive(Debug)]
enum Dispatch {
    Queued(Request),
    Read { read: PendingRead, request: Request },
}

#[derive(Debug)]
enum Delivery {
    Queued {
        request: Request,
        result: Result<String, TransportError>,
    },
    Read {
        read: PendingRead,
        result: Result<String, TransportError>,
    },
}

/// Owner state. Synchronous so every transition can be driven directly with
/// an explicit clock.
struct Outbox {
    config: Config,
    store: PersistentStore,
    identity: Identity,
    queue: RequestQueue,
    batcher: EventBatcher,
    session: Session,
    in_flight: bool,
    backoff_until: Option<Instant>,
    pending_reads: VecDeque<PendingRead>,
}

impl Outbox {
    fn new(config: Config, store: PersistentStore) -> Result<Self, OutboxError> {
        config.validate()?;
        let identity = Identity::load_or_generate(
            &store,
            config.device_id.as_deref(),
            config.clear_stored_device_id,
        )?;
        let queue = RequestQueue::load(&store, config.queue_size);
        let batcher = EventBatcher::load(&store);
        let session = Session::new(
            config.session_update,
            config.auto_extend_session,
            config.track_session_time,
        );
        info!(
            "Outbox ready for device {} with {} queued requests and {} buffered events",
            identity.device_id,
            queue.len(),
            batcher.len()
        );
        Ok(Outbox {
            config,
            store,
            identity,
            queue,
            batcher,
            session,
            in_flight: false,
            backoff_until: None,
            pending_reads: VecDeque::new(),
        })
    }

    fn stamp(&self, kind: RequestKind) -> Request {
        let stamp = Stamp::now(
            &self.config.app_key,
            &self.identity,
            &self.config.sdk_name,
            &self.config.sdk_version,
        );
        Request::new(kind, stamp)
    }

    fn submit(&mut self, kind: RequestKind) -> Result<(), ValidationError> {
        let request = self.stamp(kind);
        self.queue.enqueue(request, &self.store)
    }

    fn record_event(&mut self, event: Event) -> Result<(), ValidationError> {
        self.batcher.record(event, &self.store)
    }

    /// Moves up to `max_event_batch` events into one request. Returns false
    /// when nothing was drained.
    fn flush_event_batch(&mut self) -> bool {
        let events = self
            .batcher
            .drain_up_to(self.config.max_event_batch, &self.store);
        if events.is_empty() {
            return false;
        }
        debug!("Flushing {} events", events.len());
        // enqueue already logged the rejection
        let _ = self.submit(RequestKind::Events(events));
        true
    }

    fn flush_all_events(&mut self) {
        while !self.batcher.is_empty() {
            if !self.flush_event_batch() {
                warn!(
                    "Stopped flushing with {} events still buffered",
                    self.batcher.len()
                );
                break;
            }
        }
    }

    fn begin_session(&mut self, metrics: Option<Map<String, Value>>, now: Instant) {
        match self.session.begin(metrics, now) {
            Some(kind) => {
                let _ = self.submit(kind);
            }
            None => debug!("Session already active"),
        }
    }

    fn end_session(&mut self, now: Instant) {
        self.flush_all_events();
        if let Some(kind) = self.session.end(now) {
            let _ = self.submit(kind);
        }
    }

    /// Buffered events are flushed under the old identity first. With `merge`
    /// the server is told to fold the old id into the new one; otherwise the
    /// running session is closed and reopened under the new id.
    fn change_identity(
        &mut self,
        device_id: String,
        merge: bool,
        now: Instant,
    ) -> Result<(), ValidationError> {
        if device_id.is_empty() {
            return Err(ValidationError::EmptyDeviceId);
        }
        if device_id == self.identity.device_id {
            debug!("Device id unchanged, ignoring identity change");
            return Ok(());
        }
        self.flush_all_events();

        let new_identity = Identity {
            device_id,
            id_type: DeviceIdType::DeveloperSupplied,
        };
        if merge {
            let old_device_id = std::mem::replace(&mut self.identity, new_identity).device_id;
            self.persist_identity();
            self.submit(RequestKind::ChangeDeviceId { old_device_id })
        } else {
            let resume = self.session.is_active();
            self.end_session(now);
            self.identity = new_identity;
            self.persist_identity();
            if resume {
                self.begin_session(None, now);
            }
            Ok(())
        }
    }

    fn persist_identity(&self) {
        info!("Device id changed to {}", self.identity.device_id);
        if let Err(e) = self.identity.persist(&self.store) {
            error!("Failed to persist device id: {e}");
        }
    }

    fn tick(&mut self, now: Instant) -> Option<Dispatch> {
        if let Some(kind) = self.session.extend(now) {
            let _ = self.submit(kind);
        }
        self.flush_event_batch();
        self.next_dispatch(now)
    }

    fn next_dispatch(&mut self, now: Instant) -> Option<Dispatch> {
        if self.in_flight || self.config.test_mode {
            return None;
        }
        if let Some(until) = self.backoff_until {
            if now < until {
                return None;
            }
            self.backoff_until = None;
        }

        let dispatch = match self.pending_reads.pop_front() {
            Some(read) => {
                let request = self.stamp(RequestKind::Raw(remote_config_params(
                    read.keys.as_deref(),
                )));
                Dispatch::Read { read, request }
            }
            None => Dispatch::Queued(self.queue.pop_head()?),
        };
        self.in_flight = true;
        Some(dispatch)
    }

    fn complete(&mut self, delivery: Delivery, now: Instant) {
        self.in_flight = false;
        match delivery {
            Delivery::Queued {
                result: Ok(_),
                request,
            } => {
                debug!("Delivered request stamped at {}", request.stamp.time.timestamp);
                self.queue.complete_head(&self.store);
            }
            Delivery::Queued {
                result: Err(e),
                request,
            } => {
                warn!(
                    "Delivery failed, retrying in {:?}: {e}",
                    self.config.fail_timeout
                );
                self.queue.restore_head(request, &self.store);
                self.backoff_until = Some(now + self.config.fail_timeout);
            }
            Delivery::Read { read, result } => {
                let response = result
                    .map_err(|e| e.to_string())
                    .and_then(|body| serde_json::from_str::<Value>(&body).map_err(|e| e.to_string()))
                    .map(|fetched| {
                        self.cache_remote_config(read.keys.as_deref(), &fetched);
                        fetched
                    });
                if let Err(e) = &response {
                    warn!("Remote config fetch failed: {e}");
                }
                if read.response_tx.send(response).is_err() {
                    debug!("Remote config caller went away before the response arrived");
                }
            }
        }
    }

    /// A full fetch replaces the cached config, a partial one updates only
    /// the returned keys.
    fn cache_remote_config(&self, keys: Option<&[String]>, fetched: &Value) {
        let merged = match (keys, fetched) {
            (Some(_), Value::Object(update)) => {
                let mut current = match self.store.get(REMOTE_CONFIG_KEY, Value::Null) {
                    Value::Object(current) => current,
                    _ => Map::new(),
                };
                current.extend(update.clone());
                Value::Object(current)
            }
            _ => fetched.clone(),
        };
        let _ = self.store.set(REMOTE_CONFIG_KEY, merged);
    }

    fn dispatch_state(&self, now: Instant) -> DispatchState {
        if self.in_flight {
            return DispatchState::InFlight;
        }
        match self.backoff_until {
            Some(until) if now < until => DispatchState::Backoff { until },
            _ => DispatchState::Idle,
        }
    }

    fn stats(&self, now: Instant) -> OutboxStats {
        OutboxStats {
            queue_len: self.queue.len(),
            event_count: self.batcher.len(),
            dispatch_state: self.dispatch_state(now),
            session_active: self.session.is_active(),
            identity: self.identity.clone(),
        }
    }
}

fn remote_config_params(keys: Option<&[String]>) -> Map<String, Value> {
    let mut params = Map::new();
    params.insert(
        "method".to_string(),
        Value::String("fetch_remote_config".to_string()),
    );
    if let Some(keys) = keys {
        // sent as a JSON array string, like the other structured params
        let keys = Value::from(keys.to_vec()).to_string();
        params.insert("keys".to_string(), Value::String(keys));
    }
    params
}

pub struct OutboxService {
    outbox: Outbox,
    transport: Arc<dyn Transport>,
    rx: mpsc::UnboundedReceiver<OutboxCommand>,
    deliveries_tx: mpsc::UnboundedSender<Delivery>,
    deliveries_rx: mpsc::UnboundedReceiver<Delivery>,
}

impl OutboxService {
    /// Validates `config`, then loads identity, queue and event buffer from
    /// `store`. The store's writer must be running for changes to become
    /// durable.
    pub fn new(
        config: Config,
        store: PersistentStore,
        transport: Arc<dyn Transport>,
    ) -> Result<(Self, OutboxHandle), OutboxError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (deliveries_tx, deliveries_rx) = mpsc::unbounded_channel();
        let outbox = Outbox::new(config, store)?;

        let service = Self {
            outbox,
            transport,
            rx,
            deliveries_tx,
            deliveries_rx,
        };

        let handle = OutboxHandle { tx };

        Ok((service, handle))
    }

    pub async fn run(mut self) {
        debug!("Outbox service started");

        let period = self.outbox.config.beat_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.rx.recv() => {
                    let Some(command) = command else { break };
                    if self.handle(command).is_break() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Some(dispatch) = self.outbox.tick(Instant::now()) {
                        self.start(dispatch);
                    }
                }
                Some(delivery) = self.deliveries_rx.recv() => {
                    self.outbox.complete(delivery, Instant::now());
                }
            }
        }

        debug!("Outbox service shutting down");
        // an outstanding delivery stays persisted at the head and is retried next run
        self.outbox.flush_all_events();
        if let Err(e) = self.outbox.store.flush().await {
            error!("Failed to drain pending store writes: {e}");
        }
        debug!("Outbox service stopped");
    }

    fn handle(&mut self, command: OutboxCommand) -> ControlFlow<()> {
        match command {
            OutboxCommand::Submit(kind) => {
                let _ = self.outbox.submit(kind);
            }
            OutboxCommand::RecordEvent(event) => {
                if let Err(e) = self.outbox.record_event(event) {
                    error!("Rejecting event: {e}");
                }
            }
            OutboxCommand::FlushEvents => self.outbox.flush_all_events(),
            OutboxCommand::ChangeIdentity { device_id, merge } => {
                if let Err(e) = self.outbox.change_identity(device_id, merge, Instant::now()) {
                    error!("Rejecting identity change: {e}");
                }
            }
            OutboxCommand::BeginSession(metrics) => {
                self.outbox.begin_session(metrics, Instant::now());
            }
            OutboxCommand::EndSession => self.outbox.end_session(Instant::now()),
            OutboxCommand::FetchRemoteConfig { keys, response_tx } => {
                if self.outbox.config.test_mode {
                    let _ = response_tx.send(Err("dispatch is disabled in test mode".to_string()));
                } else {
                    self.outbox
                        .pending_reads
                        .push_back(PendingRead { keys, response_tx });
                }
            }
            OutboxCommand::Stats(response_tx) => {
                if response_tx.send(self.outbox.stats(Instant::now())).is_err() {
                    error!("Failed to send stats response - receiver dropped");
                }
            }
            OutboxCommand::Flush(response_tx) => match self.outbox.store.barrier() {
                Ok(signal) => {
                    tokio::spawn(async move {
                        let result = signal
                            .await
                            .map_err(|_| StoreError::WriterGone.to_string());
                        let _ = response_tx.send(result);
                    });
                }
                Err(e) => {
                    let _ = response_tx.send(Err(e.to_string()));
                }
            },
            OutboxCommand::Shutdown => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    fn start(&self, dispatch: Dispatch) {
        let transport = Arc::clone(&self.transport);
        let deliveries = self.deliveries_tx.clone();
        match dispatch {
            Dispatch::Queued(request) => {
                let path = self.outbox.config.api_path.clone();
                tokio::spawn(async move {
                    let result = transport
                        .deliver(&path, &request.to_params(), Validation::Strict)
                        .await;
                    let _ = deliveries.send(Delivery::Queued { request, result });
                });
            }
            Dispatch::Read { read, request } => {
                let path = self.outbox.config.read_path.clone();
                tokio::spawn(async move {
                    let result = transport
                        .deliver(&path, &request.to_params(), Validation::Broad)
                        .await;
                    let _ = deliveries.send(Delivery::Read { read, result });
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{DEVICE_ID_KEY, DEVICE_ID_TYPE_KEY};
    use crate::errors::ConfigError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> Config {
        Config {
            app_key: "app".to_string(),
            url: "http://localhost".to_string(),
            device_id: Some("device-1".to_string()),
            storage_path: dir.path().to_path_buf(),
            queue_size: 3,
            beat_interval: Duration::from_millis(10),
            ..Config::default()
        }
    }

    fn outbox(config: Config) -> (Outbox, crate::store::StoreWriter) {
        let (store, writer) = PersistentStore::open(&config.storage_path).unwrap();
        (Outbox::new(config, store).unwrap(), writer)
    }

    fn duration(seconds: u64) -> RequestKind {
        RequestKind::SessionDuration { seconds }
    }

    fn queued(dispatch: Option<Dispatch>) -> Request {
        match dispatch {
            Some(Dispatch::Queued(request)) => request,
            other => panic!("expected a queued dispatch, got {other:?}"),
        }
    }

    fn kinds(outbox: &Outbox) -> Vec<RequestKind> {
        outbox.queue.iter().map(|r| r.kind.clone()).collect()
    }

    #[test]
    fn test_overflow_failure_and_retry() {
        let dir = TempDir::new().unwrap();
        let (mut outbox, _writer) = outbox(config(&dir));
        for i in 1..=4 {
            outbox.submit(duration(i)).unwrap();
        }
        assert_eq!(kinds(&outbox), vec![duration(2), duration(3), duration(4)]);

        let start = Instant::now();
        let head = queued(outbox.tick(start));
        assert_eq!(head.kind, duration(2));
        assert_eq!(outbox.dispatch_state(start), DispatchState::InFlight);

        outbox.complete(
            Delivery::Queued {
                request: head,
                result: Err(TransportError::InvalidResponse("strict")),
            },
            start,
        );
        assert_eq!(kinds(&outbox), vec![duration(2), duration(3), duration(4)]);
        assert!(matches!(
            outbox.dispatch_state(start),
            DispatchState::Backoff { .. }
        ));

        // still backing off
        assert!(outbox.tick(start + Duration::from_secs(30)).is_none());

        let retry_at = start + Duration::from_secs(61);
        let head = queued(outbox.tick(retry_at));
        assert_eq!(head.kind, duration(2));
        outbox.complete(
            Delivery::Queued {
                request: head,
                result: Ok(r#"{"result":"Success"}"#.to_string()),
            },
            retry_at,
        );
        assert_eq!(kinds(&outbox), vec![duration(3), duration(4)]);
        assert_eq!(outbox.dispatch_state(retry_at), DispatchState::Idle);
    }

    #[test]
    fn test_single_request_in_flight() {
        let dir = TempDir::new().unwrap();
        let (mut outbox, _writer) = outbox(config(&dir));
        outbox.submit(duration(1)).unwrap();
        outbox.submit(duration(2)).unwrap();

        let now = Instant::now();
        let first = queued(outbox.tick(now));
        assert_eq!(first.kind, duration(1));
        assert!(outbox.tick(now).is_none());

        outbox.complete(
            Delivery::Queued {
                request: first,
                result: Ok(r#"{"result":"Success"}"#.to_string()),
            },
            now,
        );
        assert_eq!(queued(outbox.tick(now)).kind, duration(2));
    }

    #[test]
    fn test_events_drained_over_ticks() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.test_mode = true;
        config.queue_size = 10;
        let (mut outbox, _writer) = outbox(config);
        for i in 0..250 {
            outbox.record_event(Event::new(format!("e{i}"))).unwrap();
        }

        let now = Instant::now();
        assert!(outbox.tick(now).is_none());
        assert_eq!(outbox.batcher.len(), 150);
        outbox.tick(now);
        outbox.tick(now);
        assert!(outbox.batcher.is_empty());

        let sizes: Vec<usize> = kinds(&outbox)
            .into_iter()
            .map(|kind| match kind {
                RequestKind::Events(events) => events.len(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(sizes, vec![100, 100, 50]);
        match &kinds(&outbox)[0] {
            RequestKind::Events(events) => assert_eq!(events[0].key, "e0"),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_test_mode_never_dispatches() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.test_mode = true;
        let (mut outbox, _writer) = outbox(config);
        outbox.submit(duration(1)).unwrap();
        assert!(outbox.tick(Instant::now()).is_none());
        assert_eq!(outbox.queue.len(), 1);
    }

    #[test]
    fn test_session_extension_on_tick() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.test_mode = true;
        config.session_update = Duration::from_secs(60);
        let (mut outbox, _writer) = outbox(config);

        let start = Instant::now();
        outbox.begin_session(None, start);
        outbox.tick(start + Duration::from_secs(61));
        assert_eq!(
            kinds(&outbox),
            vec![
                RequestKind::BeginSession { metrics: None },
                RequestKind::SessionDuration { seconds: 61 }
            ]
        );
    }

    #[test]
    fn test_change_identity_with_merge() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.queue_size = 10;
        let (mut outbox, _writer) = outbox(config);
        outbox.record_event(Event::new("before")).unwrap();

        outbox
            .change_identity("user-42".to_string(), true, Instant::now())
            .unwrap();

        let requests: Vec<&Request> = outbox.queue.iter().collect();
        assert_eq!(requests.len(), 2);
        assert!(matches!(requests[0].kind, RequestKind::Events(_)));
        assert_eq!(requests[0].stamp.device_id, "device-1");
        assert_eq!(
            requests[1].kind,
            RequestKind::ChangeDeviceId {
                old_device_id: "device-1".to_string()
            }
        );
        assert_eq!(requests[1].stamp.device_id, "user-42");
        assert_eq!(requests[1].stamp.device_id_type, DeviceIdType::DeveloperSupplied);
        assert_eq!(outbox.store.get(DEVICE_ID_KEY, Value::Null), json!("user-42"));
        assert_eq!(outbox.store.get(DEVICE_ID_TYPE_KEY, Value::Null), json!(0));
    }

    #[test]
    fn test_change_identity_without_merge_restarts_session() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.queue_size = 10;
        let (mut outbox, _writer) = outbox(config);
        let now = Instant::now();
        outbox.begin_session(None, now);

        outbox.change_identity("user-42".to_string(), false, now).unwrap();

        let stamped: Vec<(&str, &RequestKind)> = outbox
            .queue
            .iter()
            .map(|r| (r.stamp.device_id.as_str(), &r.kind))
            .collect();
        assert_eq!(
            stamped,
            vec![
                ("device-1", &RequestKind::BeginSession { metrics: None }),
                ("device-1", &RequestKind::EndSession { seconds: Some(0) }),
                ("user-42", &RequestKind::BeginSession { metrics: None }),
            ]
        );
        assert!(outbox.session.is_active());
    }

    #[test]
    fn test_change_to_same_identity_is_ignored() {
        let dir = TempDir::new().unwrap();
        let (mut outbox, _writer) = outbox(config(&dir));
        outbox
            .change_identity("device-1".to_string(), true, Instant::now())
            .unwrap();
        assert!(outbox.queue.is_empty());
        assert_eq!(
            outbox.change_identity(String::new(), true, Instant::now()),
            Err(ValidationError::EmptyDeviceId)
        );
    }

    #[tokio::test]
    async fn test_remote_config_read_takes_the_slot() {
        let dir = TempDir::new().unwrap();
        let (mut outbox, _writer) = outbox(config(&dir));
        outbox.submit(duration(1)).unwrap();
        let (response_tx, response_rx) = oneshot::channel();
        outbox.pending_reads.push_back(PendingRead {
            keys: Some(vec!["color".to_string()]),
            response_tx,
        });

        let now = Instant::now();
        let (read, request) = match outbox.tick(now) {
            Some(Dispatch::Read { read, request }) => (read, request),
            other => panic!("expected a read, got {other:?}"),
        };
        let params = request.to_params();
        assert!(params.contains(&("method".to_string(), "fetch_remote_config".to_string())));
        assert!(params.contains(&("keys".to_string(), r#"["color"]"#.to_string())));
        // the queued request waits for the read
        assert!(outbox.tick(now).is_none());

        outbox.complete(
            Delivery::Read {
                read,
                result: Ok(r#"{"color":"blue"}"#.to_string()),
            },
            now,
        );
        assert_eq!(response_rx.await.unwrap().unwrap(), json!({"color": "blue"}));
        assert_eq!(
            outbox.store.get(REMOTE_CONFIG_KEY, Value::Null),
            json!({"color": "blue"})
        );
        assert_eq!(queued(outbox.tick(now)).kind, duration(1));
    }

    #[derive(Default)]
    struct RecordingTransport {
        calls: Mutex<Vec<(String, Vec<(String, String)>)>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn deliver(
            &self,
            path: &str,
            params: &[(String, String)],
            _validation: Validation,
        ) -> Result<String, TransportError> {
            self.calls
                .lock()
                .unwrap()
                .push((path.to_string(), params.to_vec()));
            Ok(r#"{"result":"Success"}"#.to_string())
        }
    }

    #[tokio::test]
    async fn test_service_delivers_in_order_and_shuts_down() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.queue_size = 10;
        let (store, writer) = PersistentStore::open(dir.path()).unwrap();
        tokio::spawn(writer.run());
        let transport = Arc::new(RecordingTransport::default());
        let (service, handle) = OutboxService::new(config, store, transport.clone()).unwrap();
        let service_task = tokio::spawn(service.run());

        handle.submit_request(duration(1)).unwrap();
        handle.submit_request(duration(2)).unwrap();

        for _ in 0..200 {
            if transport.calls.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let durations: Vec<String> = transport
            .calls
            .lock()
            .unwrap()
            .iter()
            .map(|(path, params)| {
                assert_eq!(path, "/i");
                params
                    .iter()
                    .find(|(k, _)| k == "session_duration")
                    .map(|(_, v)| v.clone())
                    .unwrap()
            })
            .collect();
        assert_eq!(durations, vec!["1", "2"]);

        handle.shutdown().expect("Failed to shutdown");
        service_task.await.expect("Service task failed");
        assert!(handle.submit_request(duration(3)).is_err());
    }

    #[tokio::test]
    async fn test_shutdown_flushes_buffered_events() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.test_mode = true;
        config.beat_interval = Duration::from_secs(3600);
        let (store, writer) = PersistentStore::open(dir.path()).unwrap();
        tokio::spawn(writer.run());
        let (service, handle) =
            OutboxService::new(config, store, Arc::new(RecordingTransport::default()))
                .unwrap();
        let service_task = tokio::spawn(service.run());

        handle.record_event(Event::new("a")).unwrap();
        handle.record_event(Event::new("b")).unwrap();
        assert_eq!(handle.event_count().await.unwrap(), 2);
        handle.shutdown().unwrap();
        service_task.await.unwrap();

        let (fresh, _writer) = PersistentStore::open(dir.path()).unwrap();
        let queue = RequestQueue::load(&fresh, 10);
        assert_eq!(queue.len(), 1);
        assert!(EventBatcher::load(&fresh).is_empty());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = TempDir::new().unwrap();
        for (name, config) in [
            (
                "max_event_batch",
                Config {
                    max_event_batch: 0,
                    ..config(&dir)
                },
            ),
            (
                "queue_size",
                Config {
                    queue_size: 0,
                    ..config(&dir)
                },
            ),
        ] {
            let (store, _writer) = PersistentStore::open(dir.path()).unwrap();
            let result =
                OutboxService::new(config, store, Arc::new(RecordingTransport::default()));
            match result {
                Err(OutboxError::Config(ConfigError::Invalid { name: field, .. })) => {
                    assert_eq!(field, name)
                }
                Err(e) => panic!("expected a config error for {name}, got {e}"),
                Ok(_) => panic!("expected a config error for {name}"),
            }
        }
    }

    #[test]
    fn test_flush_all_events_stops_when_nothing_drains() {
        let dir = TempDir::new().unwrap();
        let (mut outbox, _writer) = outbox(config(&dir));
        outbox.record_event(Event::new("a")).unwrap();
        outbox.config.max_event_batch = 0;

        outbox.flush_all_events();
        assert_eq!(outbox.batcher.len(), 1);
        assert!(outbox.queue.is_empty());

        outbox.config.max_event_batch = 100;
        outbox.flush_all_events();
        assert!(outbox.batcher.is_empty());
        assert_eq!(outbox.queue.len(), 1);
    }

    #[tokio::test]
    async fn test_handle_rejects_invalid_input() {
        let dir = TempDir::new().unwrap();
        let (store, _writer) = PersistentStore::open(dir.path()).unwrap();
        let (_service, handle) =
            OutboxService::new(config(&dir), store, Arc::new(RecordingTransport::default()))
                .unwrap();
        assert!(matches!(
            handle.record_event(Event::new("")),
            Err(ProducerError::Validation(ValidationError::EmptyEventKey))
        ));
        assert!(matches!(
            handle.change_identity("", false),
            Err(ProducerError::Validation(ValidationError::EmptyDeviceId))
        ));
    }
}
