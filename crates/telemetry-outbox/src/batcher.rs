// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Buffer of recorded events waiting to be folded into an `events` request.
//!
//! The buffer is mirrored to the store under `cly_event` after every change,
//! so a crash loses at most the events whose write had not landed yet.

use std::collections::VecDeque;

use tracing::{debug, error};

use crate::constants::EVENT_KEY;
use crate::errors::ValidationError;
use crate::request::Event;
use crate::store::PersistentStore;

#[derive(Debug)]
pub struct EventBatcher {
    events: VecDeque<Event>,
}

impl EventBatcher {
    pub fn load(store: &PersistentStore) -> Self {
        let events: VecDeque<Event> = store.get_as(EVENT_KEY, VecDeque::new());
        if !events.is_empty() {
            debug!("Restored {} buffered events", events.len());
        }
        EventBatcher { events }
    }

    pub fn record(&mut self, event: Event, store: &PersistentStore) -> Result<(), ValidationError> {
        event.validate()?;
        self.events.push_back(event);
        self.persist(store);
        Ok(())
    }

    /// Removes and returns the oldest `n` events, or all of them if fewer are
    /// buffered.
    pub fn drain_up_to(&mut self, n: usize, store: &PersistentStore) -> Vec<Event> {
        if self.events.is_empty() {
            return Vec::new();
        }
        let take = n.min(self.events.len());
        let drained: Vec<Event> = self.events.drain(..take).collect();
        self.persist(store);
        drained
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    fn persist(&self, store: &PersistentStore) {
        if let Err(e) = store.set_as(EVENT_KEY, &self.events) {
            error!("Failed to serialize event buffer: {e}");
        }
    }
}
