//! relayq: a multi-tenant background job broker with an HTTP control plane.
//!
//! Producers submit jobs to dynamically created named queues; external
//! workers poll, update and complete those jobs over HTTP; observers get
//! real-time notifications through per-job webhooks, signed application
//! webhooks and filtered subscriptions; and a scheduler fires recurring or
//! one-shot HTTP calls from cron patterns.
//!
//! # Architecture
//!
//! - [`store`] — the Redis-compatible backing store seam: atomic queues,
//!   compare-and-set transitions, delayed/repeatable timers, pub/sub
//!   lifecycle events.
//! - [`jobs`] — the job contract: the [`jobs::JobTracker`] service and the
//!   per-queue event pumps feeding the delivery sinks.
//! - [`queue`] — lazy queue registry, authorization and admin operations.
//! - [`webhook`] — per-job (unsigned) and application (HMAC-signed)
//!   webhook dispatchers with retry and self-quarantine.
//! - [`subscription`] — application-scoped event filters with linear-
//!   backoff delivery.
//! - [`scheduler`] — declarative cron/one-shot schedules executing
//!   outbound HTTP calls.
//! - [`metastore`] — durable entities (applications, webhooks,
//!   subscriptions, schedules) behind a CRUD trait.
//! - [`http`], [`middleware`], [`state`] — the axum control plane.
//!
//! Every service is built once at startup with explicit dependencies; the
//! [`testing`] module ships an in-memory backing store so embeddings and
//! tests run without Redis.

#![forbid(unsafe_code)]
// Clear naming is more important than brevity
#![allow(clippy::module_name_repetitions)]

pub mod auth;
pub mod config;
pub mod error;
pub mod http;
pub mod jobs;
pub mod metastore;
pub mod middleware;
pub mod observability;
pub mod queue;
pub mod scheduler;
pub mod shutdown;
pub mod state;
pub mod store;
pub mod subscription;
pub mod testing;
pub mod webhook;

pub use config::Config;
pub use error::{ApiError, ErrorCode};
pub use state::AppState;
