// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded FIFO of pending requests, mirrored to the store under `cly_queue`.
//!
//! When an enqueue pushes the length past `max_size` the oldest request is
//! evicted, so the queue favours recent data while bounding memory and disk.
//!
//! A request handed out by [`RequestQueue::pop_head`] stays in the persisted
//! copy (as its first element) until the delivery is acknowledged with
//! [`RequestQueue::complete_head`] or undone with
//! [`RequestQueue::restore_head`]. A crash mid-delivery therefore leads to a
//! redelivery on restart rather than a lost request.

use std::collections::VecDeque;

use tracing::{error, warn};

use crate::constants::QUEUE_KEY;
use crate::errors::ValidationError;
use crate::request::Request;
use crate::store::PersistentStore;

#[derive(Debug)]
pub struct RequestQueue {
    requests: VecDeque<Request>,
    in_flight: Option<Request>,
    max_size: usize,
}

impl RequestQueue {
    /// Loads the persisted queue. A stored queue longer than `max_size` (for
    /// instance after the limit was lowered) keeps only its newest entries.
    pub fn load(store: &PersistentStore, max_size: usize) -> Self {
        let mut requests: VecDeque<Request> = store.get_as(QUEUE_KEY, VecDeque::new());
        if requests.len() > max_size {
            let excess = requests.len() - max_size;
            warn!("Stored queue holds {} requests, dropping {excess} oldest", requests.len());
            requests.drain(..excess);
        }
        RequestQueue {
            requests,
            in_flight: None,
            max_size,
        }
    }

    /// Appends `request` after validating its identity fields. Rejected
    /// requests leave the queue untouched.
    pub fn enqueue(
        &mut self,
        request: Request,
        store: &PersistentStore,
    ) -> Result<(), ValidationError> {
        if let Err(e) = request.validate() {
            error!("Rejecting request: {e}");
            return Err(e);
        }
        self.requests.push_back(request);
        if self.requests.len() > self.max_size {
            warn!(
                "Request queue exceeded {} entries, dropping the oldest request",
                self.max_size
            );
            self.requests.pop_front();
        }
        self.persist(store);
        Ok(())
    }

    /// Takes the oldest request for delivery. Returns `None` if the queue is
    /// empty or a delivery is already outstanding.
    pub fn pop_head(&mut self) -> Option<Request> {
        if self.in_flight.is_some() {
            return None;
        }
        let head = self.requests.pop_front()?;
        self.in_flight = Some(head.clone());
        Some(head)
    }

    /// Drops the outstanding request after a successful delivery.
    pub fn complete_head(&mut self, store: &PersistentStore) {
        if self.in_flight.take().is_some() {
            self.persist(store);
        }
    }

    /// Puts a request whose delivery failed back in front of everything that
    /// was queued while it was in flight.
    pub fn restore_head(&mut self, request: Request, store: &PersistentStore) {
        self.in_flight = None;
        if self.requests.len() >= self.max_size {
            // the failed request is the oldest entry, so drop-oldest evicts it
            warn!("Request queue is full, dropping the failed request instead of restoring it");
            self.persist(store);
            return;
        }
        self.requests.push_front(request);
        self.persist(store);
    }

    /// Number of requests waiting, not counting one in flight.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn has_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Request> {
        self.requests.iter()
    }

    fn persist(&self, store: &PersistentStore) {
        let snapshot: Vec<&Request> = self.in_flight.iter().chain(self.requests.iter()).collect();
        if let Err(e) = store.set_as(QUEUE_KEY, &snapshot) {
            error!("Failed to serialize request queue: {e}");
        }
    }
}
