// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::errors::ProducerError;
use crate::request::{Event, RequestKind};

/// Mutation entry points for code producing telemetry.
///
/// Calls validate their input and hand it to the owner without waiting: an
/// `Ok` means the input was accepted for queueing, not that it was delivered
/// or written to disk. Implemented by [`crate::outbox::OutboxHandle`] inside
/// the owner process and by [`crate::worker::WorkerClient`] elsewhere.
pub trait Producer {
    /// Stamps `kind` with the current identity and appends it to the queue.
    fn submit_request(&self, kind: RequestKind) -> Result<(), ProducerError>;

    /// Buffers `event` until the next batch flush.
    fn record_event(&self, event: Event) -> Result<(), ProducerError>;

    /// Moves every buffered event into the queue now.
    fn flush_events_now(&self) -> Result<(), ProducerError>;

    fn change_identity(&self, device_id: &str, merge: bool) -> Result<(), ProducerError>;
}
