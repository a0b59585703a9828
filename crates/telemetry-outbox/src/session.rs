// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use tokio::time::Instant;

use crate::request::RequestKind;

/// Session bookkeeping for the owner. Each transition returns the request
/// that reports it, if any.
#[derive(Debug)]
pub struct Session {
    active: bool,
    last_beat: Instant,
    update_interval: Duration,
    auto_extend: bool,
    track_time: bool,
}

impl Session {
    pub fn new(update_interval: Duration, auto_extend: bool, track_time: bool) -> Self {
        Session {
            active: false,
            last_beat: Instant::now(),
            update_interval,
            auto_extend,
            track_time,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn begin(
        &mut self,
        metrics: Option<serde_json::Map<String, serde_json::Value>>,
        now: Instant,
    ) -> Option<RequestKind> {
        if self.active {
            return None;
        }
        self.active = true;
        self.last_beat = now;
        Some(RequestKind::BeginSession { metrics })
    }

    /// Heartbeat: reports the time since the last report once it exceeds the
    /// update interval. Only whole seconds are reported; the remainder is
    /// carried into the next report.
    pub fn extend(&mut self, now: Instant) -> Option<RequestKind> {
        if !(self.active && self.auto_extend && self.track_time) {
            return None;
        }
        let elapsed = now.saturating_duration_since(self.last_beat);
        if elapsed <= self.update_interval {
            return None;
        }
        let seconds = elapsed.as_secs();
        self.last_beat += Duration::from_secs(seconds);
        Some(RequestKind::SessionDuration { seconds })
    }

    pub fn end(&mut self, now: Instant) -> Option<RequestKind> {
        if !self.active {
            return None;
        }
        self.active = false;
        let seconds = self
            .track_time
            .then(|| now.saturating_duration_since(self.last_beat).as_secs());
        Some(RequestKind::EndSession { seconds })
    }
}
