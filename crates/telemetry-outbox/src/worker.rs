// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Forwarding of producer calls from worker processes to the owner.
//!
//! Workers hold no queue state. Each call on a [`WorkerClient`] becomes one
//! [`WorkerMessage`] written as a line of JSON to a local TCP connection. The
//! owner's [`WorkerListener`] accepts connections from any number of workers,
//! whether they connect at startup or later, and applies every message
//! through the same [`OutboxHandle`] used by local producers. Messages from
//! different workers are ordered by their arrival at the owner.

use std::io;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::{ProducerError, ValidationError};
use crate::outbox::OutboxHandle;
use crate::producer::Producer;
use crate::request::{Event, RequestKind};

/// One forwarded producer call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkerMessage {
    QueueOp(RequestKind),
    BatchOp(Event),
    IdentityChange {
        #[serde(rename = "newId")]
        new_id: String,
        merge: bool,
    },
    RawRequest(Map<String, Value>),
    FlushEvents {},
}

impl WorkerMessage {
    /// Replays the call on `producer`.
    pub fn apply(self, producer: &impl Producer) -> Result<(), ProducerError> {
        match self {
            WorkerMessage::QueueOp(kind) => producer.submit_request(kind),
            WorkerMessage::BatchOp(event) => producer.record_event(event),
            WorkerMessage::IdentityChange { new_id, merge } => {
                producer.change_identity(&new_id, merge)
            }
            WorkerMessage::RawRequest(params) => producer.submit_request(RequestKind::Raw(params)),
            WorkerMessage::FlushEvents {} => producer.flush_events_now(),
        }
    }
}

/// Owner side of the worker channel.
pub struct WorkerListener {
    listener: TcpListener,
    handle: OutboxHandle,
    cancel_token: CancellationToken,
}

impl WorkerListener {
    pub async fn bind(
        addr: &str,
        handle: OutboxHandle,
        cancel_token: CancellationToken,
    ) -> io::Result<WorkerListener> {
        let listener = TcpListener::bind(addr).await?;
        info!("Listening for workers on {}", listener.local_addr()?);
        Ok(WorkerListener {
            listener,
            handle,
            cancel_token,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts workers until the token is cancelled.
    pub async fn spin(self) {
        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Worker connected from {peer}");
                        tokio::spawn(serve_worker(
                            stream,
                            peer,
                            self.handle.clone(),
                            self.cancel_token.clone(),
                        ));
                    }
                    Err(e) => error!("Failed to accept worker connection: {e}"),
                },
            }
        }
        debug!("Worker listener stopped");
    }
}

async fn serve_worker(
    stream: TcpStream,
    peer: SocketAddr,
    handle: OutboxHandle,
    cancel_token: CancellationToken,
) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let read = tokio::select! {
            _ = cancel_token.cancelled() => break,
            read = reader.read_until(b'\n', &mut buf) => read,
        };
        match read {
            Ok(0) => {
                debug!("Worker {peer} disconnected");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!("Failed to read from worker {peer}: {e}");
                break;
            }
        }
        let line = match std::str::from_utf8(&buf) {
            Ok(line) => line,
            Err(e) => {
                warn!("Dropping undecodable message from worker {peer}: {e}");
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let message = match serde_json::from_str::<WorkerMessage>(line) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping malformed message from worker {peer}: {e}");
                continue;
            }
        };
        match message.apply(&handle) {
            Ok(()) => {}
            Err(ProducerError::Validation(e)) => {
                warn!("Rejected message from worker {peer}: {e}")
            }
            Err(e @ ProducerError::ChannelClosed(_)) => {
                error!("Stopped serving worker {peer}: {e}");
                break;
            }
        }
    }
}

/// Worker side of the channel. Calls are validated locally and sent without
/// waiting for the owner.
#[derive(Clone)]
pub struct WorkerClient {
    tx: mpsc::UnboundedSender<WorkerMessage>,
}

impl WorkerClient {
    pub async fn connect(addr: &str) -> io::Result<WorkerClient> {
        let stream = TcpStream::connect(addr).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(forward(stream, rx));
        Ok(WorkerClient { tx })
    }

    fn send(&self, message: WorkerMessage) -> Result<(), ProducerError> {
        self.tx
            .send(message)
            .map_err(|e| ProducerError::ChannelClosed(e.to_string()))
    }

    /// Forwards pre-built parameters as a raw request.
    pub fn send_raw(&self, params: Map<String, Value>) -> Result<(), ProducerError> {
        if params.is_empty() {
            return Err(ValidationError::EmptyRawRequest.into());
        }
        self.send(WorkerMessage::RawRequest(params))
    }
}

impl Producer for WorkerClient {
    fn submit_request(&self, kind: RequestKind) -> Result<(), ProducerError> {
        kind.validate()?;
        self.send(WorkerMessage::QueueOp(kind))
    }

    fn record_event(&self, event: Event) -> Result<(), ProducerError> {
        event.validate()?;
        self.send(WorkerMessage::BatchOp(event))
    }

    fn flush_events_now(&self) -> Result<(), ProducerError> {
        self.send(WorkerMessage::FlushEvents {})
    }

    fn change_identity(&self, device_id: &str, merge: bool) -> Result<(), ProducerError> {
        if device_id.is_empty() {
            return Err(ValidationError::EmptyDeviceId.into());
        }
        self.send(WorkerMessage::IdentityChange {
            new_id: device_id.to_string(),
            merge,
        })
    }
}

async fn forward(mut stream: TcpStream, mut rx: mpsc::UnboundedReceiver<WorkerMessage>) {
    while let Some(message) = rx.recv().await {
        let mut line = match serde_json::to_vec(&message) {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to serialize worker message: {e}");
                continue;
            }
        };
        line.push(b'\n');
        if let Err(e) = stream.write_all(&line).await {
            error!("Lost connection to the owner: {e}");
            return;
        }
    }
    if let Err(e) = stream.shutdown().await {
        debug!("Failed to close owner connection: {e}");
    }
}
