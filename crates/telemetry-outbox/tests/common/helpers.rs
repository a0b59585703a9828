// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helpers for starting an outbox and waiting on its state

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use telemetry_outbox::config::Config;
use telemetry_outbox::outbox::{OutboxHandle, OutboxService, OutboxStats};
use telemetry_outbox::store::PersistentStore;
use telemetry_outbox::transport::Transport;
use tokio::task::JoinHandle;
use tokio::time::sleep;

pub fn test_config(url: &str, dir: &Path) -> Config {
    Config {
        app_key: "app-key".to_string(),
        url: url.to_string(),
        device_id: Some("dev-1".to_string()),
        storage_path: dir.to_path_buf(),
        beat_interval: Duration::from_millis(10),
        fail_timeout: Duration::from_millis(50),
        request_timeout: Duration::from_secs(5),
        ..Config::default()
    }
}

/// Opens the store under `config.storage_path` and spawns its writer and the
/// owner service.
pub fn start_outbox(config: Config, transport: Arc<dyn Transport>) -> (OutboxHandle, JoinHandle<()>) {
    let (store, writer) = PersistentStore::open(&config.storage_path).expect("open store");
    tokio::spawn(writer.run());
    let (service, handle) =
        OutboxService::new(config, store, transport).expect("create outbox service");
    (handle, tokio::spawn(service.run()))
}

/// Polls the owner until `check` accepts its stats, for up to three seconds.
pub async fn wait_for_stats(
    handle: &OutboxHandle,
    check: impl Fn(&OutboxStats) -> bool,
) -> OutboxStats {
    let mut stats = handle.stats().await.expect("stats");
    for _ in 0..300 {
        if check(&stats) {
            return stats;
        }
        sleep(Duration::from_millis(10)).await;
        stats = handle.stats().await.expect("stats");
    }
    panic!("timed out waiting for outbox state, last seen {stats:?}");
}

/// Polls `check` for up to three seconds.
pub async fn wait_until(check: impl Fn() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for condition");
}
