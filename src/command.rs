//! Command bodies (§3.1, §6.2): the user-supplied unit of work submitted to
//! an [`crate::executor::Executor`].
//!
//! Realized as the tagged-variant design from the crate's design notes: an
//! `enum Command<T>` over `Async`/`Sync` trait objects, each exposing an
//! optional [`Fallback`]. Object-safety and the `#[async_trait]` shape are
//! grounded in the teacher's `EmbeddingModel`/`GeneratorModel` traits in
//! `src/traits.rs`.

use crate::error::RuntimeError;
use async_trait::async_trait;
use std::sync::Arc;

/// What to do when a command's primary path fails.
pub enum Fallback<T> {
    /// No fallback; surface the primary failure to the caller.
    None,
    /// Complete the caller's reply with this literal value. A Rust value
    /// cannot itself "throw during materialization" the way a lazily
    /// evaluated expression might, so unlike the upstream Scala behavior
    /// there is no secondary failure mode to handle here.
    Static(T),
    /// Re-submit this command through the same key's executor, under the
    /// same admission rules as a fresh submission.
    Cmd(Command<T>),
}

impl<T: Clone> Clone for Fallback<T> {
    fn clone(&self) -> Self {
        match self {
            Self::None => Self::None,
            Self::Static(v) => Self::Static(v.clone()),
            Self::Cmd(c) => Self::Cmd(c.clone()),
        }
    }
}

/// An asynchronous command body: `execute` returns a future directly.
#[async_trait]
pub trait AsyncCommandBody<T>: Send + Sync {
    /// Run the command body. Synchronous panics inside an implementation
    /// are the caller's responsibility to avoid; unexpected errors should
    /// be returned as `Err(RuntimeError::User(..))` rather than panicking,
    /// so the executor can report them as `Error` instead of crashing.
    async fn execute(&self) -> Result<T, RuntimeError>;

    /// Optional fallback. Defaults to none.
    fn fallback(&self) -> Fallback<T> {
        Fallback::None
    }
}

/// A synchronous (blocking) command body, dispatched to a worker so it
/// cannot block the executor's own task.
pub trait SyncCommandBody<T>: Send + Sync {
    /// Run the command body, blocking the calling thread for as long as
    /// needed.
    fn execute(&self) -> Result<T, RuntimeError>;

    /// Optional fallback. Defaults to none.
    fn fallback(&self) -> Fallback<T> {
        Fallback::None
    }
}

/// A unit of work submitted to an executor: either an async or a sync
/// command body, each optionally carrying a fallback.
pub enum Command<T> {
    Async(Arc<dyn AsyncCommandBody<T>>),
    Sync(Arc<dyn SyncCommandBody<T>>),
}

impl<T> Clone for Command<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Async(c) => Self::Async(c.clone()),
            Self::Sync(c) => Self::Sync(c.clone()),
        }
    }
}

impl<T> Command<T> {
    /// `true` for `Sync` command bodies.
    pub fn is_sync(&self) -> bool {
        matches!(self, Self::Sync(_))
    }

    /// The declared fallback, if any.
    pub fn fallback(&self) -> Fallback<T> {
        match self {
            Self::Async(c) => c.fallback(),
            Self::Sync(c) => c.fallback(),
        }
    }
}
