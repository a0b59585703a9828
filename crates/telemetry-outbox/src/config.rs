// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::constants;
use crate::errors::ConfigError;

#[derive(Debug, Clone)]
pub struct Config {
    pub app_key: String,
    /// Base URL of the collection endpoint, e.g. `https://collector.example.com`
    pub url: String,
    /// Ingestion path appended to `url`
    pub api_path: String,
    /// Read path used for remote-config fetches
    pub read_path: String,
    pub sdk_name: String,
    pub sdk_version: String,
    /// Developer supplied device id. When unset an id is loaded or generated.
    pub device_id: Option<String>,
    /// Replace a stored device id with `device_id` at startup. Without it a
    /// stored id, including one changed at runtime, is kept.
    pub clear_stored_device_id: bool,
    pub queue_size: usize,
    pub max_event_batch: usize,
    /// how often the dispatch loop ticks
    pub beat_interval: Duration,
    /// how often an active session is extended
    pub session_update: Duration,
    /// backoff window after a failed delivery
    pub fail_timeout: Duration,
    pub request_timeout: Duration,
    pub force_post: bool,
    /// Suppresses dispatch entirely. Requests still queue and persist.
    pub test_mode: bool,
    pub auto_extend_session: bool,
    pub track_session_time: bool,
    pub storage_path: PathBuf,
    pub https_proxy: Option<String>,
    /// Address the owner listens on for worker processes
    pub ipc_addr: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            app_key: String::new(),
            url: String::new(),
            api_path: constants::DEFAULT_API_PATH.to_string(),
            read_path: constants::DEFAULT_READ_PATH.to_string(),
            sdk_name: constants::SDK_NAME.to_string(),
            sdk_version: constants::SDK_VERSION.to_string(),
            device_id: None,
            clear_stored_device_id: false,
            queue_size: constants::DEFAULT_QUEUE_SIZE,
            max_event_batch: constants::DEFAULT_MAX_EVENT_BATCH,
            beat_interval: constants::DEFAULT_BEAT_INTERVAL,
            session_update: constants::DEFAULT_SESSION_UPDATE,
            fail_timeout: constants::DEFAULT_FAIL_TIMEOUT,
            request_timeout: constants::DEFAULT_REQUEST_TIMEOUT,
            force_post: false,
            test_mode: false,
            auto_extend_session: true,
            track_session_time: true,
            storage_path: PathBuf::from(constants::DEFAULT_STORAGE_PATH),
            https_proxy: None,
            ipc_addr: constants::DEFAULT_IPC_ADDR.to_string(),
        }
    }
}

impl Config {
    /// Builds a config from `OUTBOX_*` environment variables on top of the defaults.
    ///
    /// `OUTBOX_APP_KEY` and `OUTBOX_URL` are mandatory. Durations are read as
    /// milliseconds (`OUTBOX_BEAT_INTERVAL_MS`, ...).
    pub fn from_env() -> Result<Config, ConfigError> {
        let mut config = Config {
            app_key: env::var("OUTBOX_APP_KEY")
                .map_err(|_| ConfigError::Missing("OUTBOX_APP_KEY"))?,
            url: env::var("OUTBOX_URL").map_err(|_| ConfigError::Missing("OUTBOX_URL"))?,
            ..Config::default()
        };

        if let Ok(path) = env::var("OUTBOX_API_PATH") {
            config.api_path = path;
        }
        if let Ok(path) = env::var("OUTBOX_READ_PATH") {
            config.read_path = path;
        }
        if let Ok(path) = env::var("OUTBOX_STORAGE_PATH") {
            config.storage_path = PathBuf::from(path);
        }
        if let Ok(addr) = env::var("OUTBOX_IPC_ADDR") {
            config.ipc_addr = addr;
        }
        config.device_id = env::var("OUTBOX_DEVICE_ID")
            .ok()
            .filter(|id| !id.trim().is_empty());
        config.https_proxy = env::var("OUTBOX_PROXY_HTTPS")
            .or_else(|_| env::var("HTTPS_PROXY"))
            .ok();

        if let Some(size) = parse_var::<usize>("OUTBOX_QUEUE_SIZE")? {
            config.queue_size = size;
        }
        if let Some(size) = parse_var::<usize>("OUTBOX_MAX_EVENT_BATCH")? {
            config.max_event_batch = size;
        }
        if let Some(ms) = parse_var::<u64>("OUTBOX_BEAT_INTERVAL_MS")? {
            config.beat_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>("OUTBOX_SESSION_UPDATE_MS")? {
            config.session_update = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>("OUTBOX_FAIL_TIMEOUT_MS")? {
            config.fail_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>("OUTBOX_REQUEST_TIMEOUT_MS")? {
            config.request_timeout = Duration::from_millis(ms);
        }
        if let Some(flag) = parse_flag("OUTBOX_FORCE_POST") {
            config.force_post = flag;
        }
        if let Some(flag) = parse_flag("OUTBOX_CLEAR_STORED_DEVICE_ID") {
            config.clear_stored_device_id = flag;
        }
        if let Some(flag) = parse_flag("OUTBOX_TEST_MODE") {
            config.test_mode = flag;
        }
        if let Some(flag) = parse_flag("OUTBOX_AUTO_EXTEND_SESSION") {
            config.auto_extend_session = flag;
        }
        if let Some(flag) = parse_flag("OUTBOX_TRACK_SESSION_TIME") {
            config.track_session_time = flag;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.app_key.trim().is_empty() {
            return Err(ConfigError::Invalid {
                name: "app_key",
                reason: "must not be empty".to_string(),
            });
        }
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            return Err(ConfigError::Invalid {
                name: "url",
                reason: format!("expected an http or https url, got '{}'", self.url),
            });
        }
        if self.queue_size == 0 {
            return Err(ConfigError::Invalid {
                name: "queue_size",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.max_event_batch == 0 {
            return Err(ConfigError::Invalid {
                name: "max_event_batch",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.beat_interval.is_zero() {
            return Err(ConfigError::Invalid {
                name: "beat_interval",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Base URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        self.url.trim_end_matches('/')
    }
}

fn parse_var<T: FromStr>(name: &'static str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                name,
                reason: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

fn parse_flag(name: &str) -> Option<bool> {
    env::var(name)
        .ok()
        .map(|val| matches!(val.trim().to_lowercase().as_str(), "true" | "1" | "yes"))
}
