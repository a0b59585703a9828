// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mock transports for driving the outbox without a network

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use reqwest::StatusCode;
use telemetry_outbox::errors::TransportError;
use telemetry_outbox::transport::{Transport, Validation};

#[derive(Debug, Clone)]
pub struct Call {
    pub path: String,
    pub params: Vec<(String, String)>,
    pub validation: Validation,
}

impl Call {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Records every delivery and answers `500` to the first `failures` of them.
pub struct ScriptedTransport {
    failures: AtomicUsize,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedTransport {
    pub fn new(failures: usize) -> Self {
        ScriptedTransport {
            failures: AtomicUsize::new(failures),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().expect("lock calls").clone()
    }
}

#[async_trait::async_trait]
impl Transport for ScriptedTransport {
    async fn deliver(
        &self,
        path: &str,
        params: &[(String, String)],
        validation: Validation,
    ) -> Result<String, TransportError> {
        self.calls.lock().expect("lock calls").push(Call {
            path: path.to_string(),
            params: params.to_vec(),
            validation,
        });
        let fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(TransportError::Status(StatusCode::INTERNAL_SERVER_ERROR));
        }
        Ok(r#"{"result":"Success"}"#.to_string())
    }
}
