//! Per-command-key latency and fault isolation: call timeouts, a sliding
//! window of success/error/timeout statistics, and a CLOSED/OPEN/HALF-OPEN
//! circuit breaker with fallback routing.
//!
//! # Key concepts
//!
//! - **[`Command`](command::Command)** — the unit of work submitted to an
//!   executor, either an async or a sync body, each with an optional
//!   [`Fallback`](command::Fallback).
//! - **[`Executor`](executor::Executor)** — the per-key serialization point:
//!   decides admission against the breaker, runs the command under a
//!   timeout, and applies the outcome back to the breaker and stats.
//! - **[`KeyRegistry`](registry::KeyRegistry)** — lazily creates and caches
//!   one executor per command key.
//! - **[`MsgConfig`](config::MsgConfig)** — per-key tuning: breaker
//!   thresholds, call timeout, dispatcher selection.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use jailcall::command::{AsyncCommandBody, Command};
//! use jailcall::config::{DefenderConfig, MsgConfig};
//! use jailcall::error::RuntimeError;
//! use jailcall::registry::KeyRegistry;
//! use std::sync::Arc;
//!
//! struct Ping;
//!
//! #[async_trait::async_trait]
//! impl AsyncCommandBody<String> for Ping {
//!     async fn execute(&self) -> Result<String, RuntimeError> {
//!         Ok("pong".to_string())
//!     }
//! }
//!
//! # async fn example() -> Result<(), RuntimeError> {
//! let registry = KeyRegistry::<String>::new(DefenderConfig::default());
//! let executor = registry.get_or_create("payments/ping").await;
//! let reply = executor.submit(Command::Async(Arc::new(Ping))).await?;
//! assert_eq!(reply, "pong");
//! # Ok(())
//! # }
//! ```

pub mod breaker;
pub mod command;
pub mod config;
pub mod error;
pub mod executor;
pub mod registry;
pub mod stats;
pub mod timeout;

/// The identifier a caller uses to route a submission to its executor, e.g.
/// `"payments/charge"`. Distinct keys never share breaker state, stats, or
/// dispatcher configuration.
pub type CommandKey = String;
