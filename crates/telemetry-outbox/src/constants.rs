// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Maximum number of pending requests kept in the queue.
pub const DEFAULT_QUEUE_SIZE: usize = 1000;
/// Maximum number of events folded into one `events` request per tick.
pub const DEFAULT_MAX_EVENT_BATCH: usize = 100;
pub const DEFAULT_BEAT_INTERVAL: Duration = Duration::from_millis(500);
/// Heartbeat period for `session_duration` extension requests.
pub const DEFAULT_SESSION_UPDATE: Duration = Duration::from_secs(60);
/// Backoff window armed after a failed delivery.
pub const DEFAULT_FAIL_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Encoded payloads at or above this length are sent as POST bodies.
pub const POST_THRESHOLD_BYTES: usize = 2000;

pub const DEFAULT_API_PATH: &str = "/i";
pub const DEFAULT_READ_PATH: &str = "/o/sdk";
pub const DEFAULT_STORAGE_PATH: &str = "../data/";
pub const DEFAULT_IPC_ADDR: &str = "127.0.0.1:18126";

pub const SDK_NAME: &str = "telemetry-outbox-rust";
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

// Store keys
pub const QUEUE_KEY: &str = "cly_queue";
pub const EVENT_KEY: &str = "cly_event";
pub const DEVICE_ID_KEY: &str = "cly_id";
pub const DEVICE_ID_TYPE_KEY: &str = "cly_id_type";
pub const REMOTE_CONFIG_KEY: &str = "cly_remote_configs";
