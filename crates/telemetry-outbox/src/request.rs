// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Request and event model.
//!
//! Requests are kept as a tagged union of known kinds all the way through the
//! queue and the store; they only become `key=value` pairs in
//! [`Request::to_params`], right before the transport encodes them.

use chrono::{Datelike, Local, Timelike};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::ValidationError;
use crate::identity::{DeviceIdType, Identity};

/// Wall-clock parts attached to every event and request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeParts {
    /// milliseconds since the unix epoch
    pub timestamp: i64,
    /// local hour of day, 0-23
    pub hour: u32,
    /// local day of week, 0 = Sunday
    pub dow: u32,
}

impl TimeParts {
    pub fn now() -> Self {
        let now = Local::now();
        TimeParts {
            timestamp: now.timestamp_millis(),
            hour: now.hour(),
            dow: now.weekday().num_days_from_sunday(),
        }
    }
}

fn default_count() -> u64 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub key: String,
    #[serde(default = "default_count")]
    pub count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dur: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segmentation: Option<Map<String, Value>>,
    #[serde(flatten)]
    pub time: TimeParts,
}

impl Event {
    pub fn new(key: impl Into<String>) -> Self {
        Event {
            key: key.into(),
            count: default_count(),
            sum: None,
            dur: None,
            segmentation: None,
            time: TimeParts::now(),
        }
    }

    #[must_use]
    pub fn with_count(mut self, count: u64) -> Self {
        self.count = count;
        self
    }

    #[must_use]
    pub fn with_sum(mut self, sum: f64) -> Self {
        self.sum = Some(sum);
        self
    }

    #[must_use]
    pub fn with_dur(mut self, dur: f64) -> Self {
        self.dur = Some(dur);
        self
    }

    #[must_use]
    pub fn with_segmentation(mut self, segmentation: Map<String, Value>) -> Self {
        self.segmentation = Some(segmentation);
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.key.trim().is_empty() {
            return Err(ValidationError::EmptyEventKey);
        }
        Ok(())
    }
}

/// The known request shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum RequestKind {
    BeginSession {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metrics: Option<Map<String, Value>>,
    },
    SessionDuration {
        seconds: u64,
    },
    EndSession {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seconds: Option<u64>,
    },
    Events(Vec<Event>),
    UserDetails(Value),
    Crash(Value),
    Consent(Value),
    ChangeDeviceId {
        old_device_id: String,
    },
    /// Pre-built parameters passed through verbatim.
    Raw(Map<String, Value>),
}

impl RequestKind {
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            RequestKind::Events(events) => events.iter().try_for_each(Event::validate),
            RequestKind::Raw(params) if params.is_empty() => Err(ValidationError::EmptyRawRequest),
            RequestKind::ChangeDeviceId { old_device_id } if old_device_id.is_empty() => {
                Err(ValidationError::EmptyDeviceId)
            }
            _ => Ok(()),
        }
    }

    fn params(&self) -> Vec<(String, String)> {
        match self {
            RequestKind::BeginSession { metrics } => {
                let mut params = vec![("begin_session".to_string(), "1".to_string())];
                if let Some(metrics) = metrics {
                    params.push(("metrics".to_string(), Value::Object(metrics.clone()).to_string()));
                }
                params
            }
            RequestKind::SessionDuration { seconds } => {
                vec![("session_duration".to_string(), seconds.to_string())]
            }
            RequestKind::EndSession { seconds } => {
                let mut params = vec![("end_session".to_string(), "1".to_string())];
                if let Some(seconds) = seconds {
                    params.push(("session_duration".to_string(), seconds.to_string()));
                }
                params
            }
            RequestKind::Events(events) => vec![(
                "events".to_string(),
                serde_json::to_string(events).unwrap_or_else(|_| "[]".to_string()),
            )],
            RequestKind::UserDetails(details) => {
                vec![("user_details".to_string(), details.to_string())]
            }
            RequestKind::Crash(crash) => vec![("crash".to_string(), crash.to_string())],
            RequestKind::Consent(consent) => vec![("consent".to_string(), consent.to_string())],
            RequestKind::ChangeDeviceId { old_device_id } => {
                vec![("old_device_id".to_string(), old_device_id.clone())]
            }
            RequestKind::Raw(params) => params
                .iter()
                .map(|(k, v)| (k.clone(), scalar_to_string(v)))
                .collect(),
        }
    }
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Identity fields attached to a request once, when it is enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stamp {
    pub app_key: String,
    pub device_id: String,
    pub device_id_type: DeviceIdType,
    pub sdk_name: String,
    pub sdk_version: String,
    #[serde(flatten)]
    pub time: TimeParts,
}

impl Stamp {
    pub fn now(app_key: &str, identity: &Identity, sdk_name: &str, sdk_version: &str) -> Self {
        Stamp {
            app_key: app_key.to_string(),
            device_id: identity.device_id.clone(),
            device_id_type: identity.id_type,
            sdk_name: sdk_name.to_string(),
            sdk_version: sdk_version.to_string(),
            time: TimeParts::now(),
        }
    }

    fn params(&self) -> Vec<(String, String)> {
        vec![
            ("app_key".to_string(), self.app_key.clone()),
            ("device_id".to_string(), self.device_id.clone()),
            ("sdk_name".to_string(), self.sdk_name.clone()),
            ("sdk_version".to_string(), self.sdk_version.clone()),
            ("t".to_string(), u8::from(self.device_id_type).to_string()),
            ("timestamp".to_string(), self.time.timestamp.to_string()),
            ("hour".to_string(), self.time.hour.to_string()),
            ("dow".to_string(), self.time.dow.to_string()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub kind: RequestKind,
    pub stamp: Stamp,
}

impl Request {
    pub fn new(kind: RequestKind, stamp: Stamp) -> Self {
        Request { kind, stamp }
    }

    /// Checks the identity fields and the kind-specific shape.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.stamp.app_key.is_empty() {
            return Err(ValidationError::MissingAppKey);
        }
        if self.stamp.device_id.is_empty() {
            return Err(ValidationError::MissingDeviceId);
        }
        self.kind.validate()
    }

    /// Flattens the request into ordered wire parameters. Raw requests may
    /// override stamped fields by using the same key.
    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut params = self.stamp.params();
        for (key, value) in self.kind.params() {
            match params.iter_mut().find(|(existing, _)| *existing == key) {
                Some(slot) => slot.1 = value,
                None => params.push((key, value)),
            }
        }
        params
    }
}
