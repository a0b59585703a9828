// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, panic, sync::Arc};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use telemetry_outbox::{
    config::Config,
    logger::Formatter,
    outbox::OutboxService,
    store::PersistentStore,
    transport::HttpTransport,
    worker::WorkerListener,
};
use tokio_util::sync::CancellationToken;

#[tokio::main]
pub async fn main() {
    let log_level = env::var("OUTBOX_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,rustls=off,reqwest=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .event_format(Formatter)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Error creating config on outbox agent startup: {e}");
            return;
        }
    };

    let (store, writer) = match PersistentStore::open(&config.storage_path) {
        Ok(opened) => opened,
        Err(e) => {
            error!(
                "Unable to open storage at {}: {e}",
                config.storage_path.display()
            );
            return;
        }
    };

    // buffered telemetry is forced to disk before a panic takes the process down
    let fatal_flusher = store.fatal_flusher();
    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        if let Err(e) = fatal_flusher.force_flush() {
            error!("Force flush on panic failed: {e}");
        }
        default_hook(info);
    }));

    let writer_task = tokio::spawn(writer.run());

    let transport = match HttpTransport::new(&config) {
        Ok(transport) => Arc::new(transport),
        Err(e) => {
            error!("Unable to build the http transport: {e}");
            return;
        }
    };

    let ipc_addr = config.ipc_addr.clone();
    let (service, handle) = match OutboxService::new(config, store, transport) {
        Ok(created) => created,
        Err(e) => {
            error!("Failed to create outbox service: {e}");
            return;
        }
    };
    let service_task = tokio::spawn(service.run());

    let cancel_token = CancellationToken::new();
    match WorkerListener::bind(&ipc_addr, handle.clone(), cancel_token.clone()).await {
        Ok(listener) => {
            tokio::spawn(listener.spin());
        }
        // the owner keeps working for local producers
        Err(e) => error!("Unable to listen for workers on {ipc_addr}: {e}"),
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {e}");
    }
    info!("Shutting down outbox agent");

    cancel_token.cancel();
    if let Err(e) = handle.shutdown() {
        error!("Failed to send shutdown to outbox service: {e}");
    }
    if let Err(e) = service_task.await {
        error!("Outbox service task failed: {e}");
    }
    drop(handle);
    if let Err(e) = writer_task.await {
        error!("Store writer task failed: {e}");
    }
}
