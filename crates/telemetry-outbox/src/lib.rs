// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Durable outbound pipeline for telemetry clients.
//!
//! Producers hand sessions, events, user details and crashes to an
//! [`outbox::OutboxHandle`] (or, from another process, to a
//! [`worker::WorkerClient`]). A single owner task holds the
//! [`store::PersistentStore`], the [`queue::RequestQueue`] and the
//! [`batcher::EventBatcher`], and drives delivery through a
//! [`transport::Transport`] one request at a time.
//!
//! ```text
//!   workers ──tcp──> WorkerListener ─┐
//!                                    ├─> OutboxHandle ──mpsc──> OutboxService
//!   local producers ─────────────────┘                              │
//!                                              EventBatcher ─> RequestQueue
//!                                                                   │ (head, single-flight)
//!                                                                   v
//!                                                               Transport ──> endpoint
//! ```

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod batcher;
pub mod config;
pub mod constants;
pub mod errors;
pub mod identity;
pub mod logger;
pub mod outbox;
pub mod producer;
pub mod queue;
pub mod request;
pub mod session;
pub mod store;
pub mod transport;
pub mod worker;
