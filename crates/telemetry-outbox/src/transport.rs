// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! One HTTP(S) request/response cycle against the collection endpoint.
//!
//! Parameters are url-encoded as `key=value` pairs. Short payloads go in the
//! query string of a GET; payloads of [`POST_THRESHOLD_BYTES`] or more (or any
//! payload when `force_post` is set) are sent as a form-encoded POST body.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, StatusCode};
use serde_json::Value;
use tracing::{debug, error};

use crate::config::Config;
use crate::constants::POST_THRESHOLD_BYTES;
use crate::errors::TransportError;

/// Response acceptance policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validation {
    /// The body must be a JSON object carrying a `result` field.
    Strict,
    /// The body may be any JSON object or array.
    Broad,
}

impl Validation {
    fn name(self) -> &'static str {
        match self {
            Validation::Strict => "strict",
            Validation::Broad => "broad",
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends `params` to `{base_url}{path}` and returns the raw response body
    /// if the response passes `validation`.
    async fn deliver(
        &self,
        path: &str,
        params: &[(String, String)],
        validation: Validation,
    ) -> Result<String, TransportError>;
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    force_post: bool,
}

impl HttpTransport {
    pub fn new(config: &Config) -> Result<Self, TransportError> {
        let client = build_client(config.https_proxy.as_deref(), config.request_timeout)?;
        Ok(HttpTransport {
            client,
            base_url: config.base_url().to_string(),
            force_post: config.force_post,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn deliver(
        &self,
        path: &str,
        params: &[(String, String)],
        validation: Validation,
    ) -> Result<String, TransportError> {
        let payload = encode_params(params);
        let url = format!("{}{}", self.base_url, path);

        let request = if self.force_post || payload.len() >= POST_THRESHOLD_BYTES {
            debug!("POST {url} ({} bytes)", payload.len());
            self.client
                .post(&url)
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(payload)
        } else {
            debug!("GET {url}");
            self.client.get(format!("{url}?{payload}"))
        };

        let response = request.send().await.map_err(|e| {
            error!("Request to {url} failed: {e}");
            TransportError::Network(e)
        })?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            error!("{status}: request to {url} was not accepted: {body:?}");
            return Err(TransportError::Status(status));
        }
        if !is_valid_response(status, &body, validation) {
            error!(
                "Response from {url} failed {} validation: {body:?}",
                validation.name()
            );
            return Err(TransportError::InvalidResponse(validation.name()));
        }
        Ok(body)
    }
}

/// Builds a reqwest client with optional proxy configuration and timeout.
pub fn build_client(
    proxy_url: Option<&str>,
    timeout: Duration,
) -> Result<reqwest::Client, TransportError> {
    let mut builder = reqwest::Client::builder().use_rustls_tls().timeout(timeout);
    if let Some(proxy) = proxy_url {
        let proxy = reqwest::Proxy::https(proxy).map_err(|e| TransportError::Client(e.to_string()))?;
        builder = builder.proxy(proxy);
    }
    builder
        .build()
        .map_err(|e| TransportError::Client(e.to_string()))
}

/// Url-encodes `params` as `k1=v1&k2=v2`.
pub fn encode_params(params: &[(String, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Returns true if a response with this status and body is a successful
/// delivery under `validation`.
pub fn is_valid_response(status: StatusCode, body: &str, validation: Validation) -> bool {
    if !status.is_success() {
        return false;
    }
    let Ok(parsed) = serde_json::from_str::<Value>(body) else {
        return false;
    };
    match validation {
        Validation::Strict => parsed
            .as_object()
            .is_some_and(|object| object.contains_key("result")),
        Validation::Broad => parsed.is_object() || parsed.is_array(),
    }
}
