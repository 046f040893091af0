//! Typed configuration for per-key executors.
//!
//! This module owns the *shape* of the `defender { command { <key> { ... } } }`
//! schema described in the crate's design notes, plus a small JSON loader.
//! Parsing the hierarchical text format itself (HOCON-style, with bare
//! `200 millis` duration literals) is left to a downstream bridge — this
//! crate only ever deserializes JSON, the same way the teacher's model
//! catalog is loaded from JSON rather than from a bespoke text grammar.

use crate::error::{Result, RuntimeError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Selects which worker pool a [`crate::command::Command::Sync`] body runs
/// on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DispatcherKind {
    /// Run on the shared Tokio blocking pool. A warning is logged once per
    /// key the first time a sync command runs on this dispatcher, since a
    /// long-running or sleeping command can starve the shared pool.
    #[default]
    Default,
    /// Run on a dedicated OS thread owned by this key's executor. Blocking
    /// or sleeping commands cannot starve any other key or the async
    /// runtime.
    Pinned,
}

/// Breaker tuning for one command key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Number of timeouts observed in a stats snapshot before the breaker
    /// opens. See the off-by-one rationale in the crate-level docs: the
    /// breaker opens when the snapshot's timeout count reaches
    /// `max_failures - 1`, not `max_failures`.
    pub max_failures: u32,
    /// How long the breaker stays OPEN before allowing a HALF-OPEN probe.
    #[serde(with = "duration_millis")]
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            reset_timeout: Duration::from_secs(5),
        }
    }
}

/// Full per-key configuration: breaker tuning, call timeout, and dispatcher
/// selection. Immutable once handed to an [`crate::executor::Executor`] —
/// reconfiguring a live key is out of scope (see crate design notes).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgConfig {
    /// Circuit breaker tuning.
    #[serde(flatten)]
    pub circuit_breaker: BreakerConfig,
    /// Per-call timeout. `Duration::ZERO` disables the timeout wrapper
    /// entirely (the command's future is awaited directly).
    #[serde(with = "duration_millis", default = "default_call_timeout")]
    pub call_timeout: Duration,
    /// Worker pool for `Sync` command bodies.
    #[serde(default)]
    pub dispatcher: DispatcherKind,
}

fn default_call_timeout() -> Duration {
    Duration::from_secs(1)
}

impl Default for MsgConfig {
    fn default() -> Self {
        Self {
            circuit_breaker: BreakerConfig::default(),
            call_timeout: default_call_timeout(),
            dispatcher: DispatcherKind::default(),
        }
    }
}

impl MsgConfig {
    /// Validate invariants: `max_failures` must be at least 1, timeouts
    /// must not be negative (unrepresentable in `Duration`, kept for
    /// symmetry with the teacher's explicit zero-check style).
    pub fn validate(&self) -> Result<()> {
        if self.circuit_breaker.max_failures == 0 {
            return Err(RuntimeError::Config(
                "max_failures must be at least 1".to_string(),
            ));
        }
        if self.circuit_breaker.reset_timeout.is_zero() {
            return Err(RuntimeError::Config(
                "reset_timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Process-wide map of `CommandKey -> MsgConfig`, the typed counterpart of
/// the `defender.command.<key>` config tree. Keys absent from the map fall
/// back to [`MsgConfig::default`], matching the built-in defaults
/// (`max-failures=5, call-timeout=1s, reset-timeout=5s, default dispatcher`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefenderConfig {
    #[serde(default)]
    command: HashMap<String, MsgConfig>,
}

impl DefenderConfig {
    /// Look up the configuration for `key`, falling back to built-in
    /// defaults when the key is unconfigured.
    pub fn for_key(&self, key: &str) -> MsgConfig {
        self.command.get(key).cloned().unwrap_or_default()
    }

    /// Insert or replace the configuration for `key`.
    pub fn set(&mut self, key: impl Into<String>, cfg: MsgConfig) {
        self.command.insert(key.into(), cfg);
    }

    /// Parse a `DefenderConfig` from a JSON string shaped like
    /// `{"command": {"<key>": {...}, ...}}`.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(s)
            .map_err(|e| RuntimeError::Config(format!("Invalid DefenderConfig JSON: {e}")))?;
        for (key, msg_cfg) in &cfg.command {
            msg_cfg
                .validate()
                .map_err(|e| RuntimeError::Config(format!("command '{key}': {e}")))?;
        }
        Ok(cfg)
    }

    /// Read and parse a `DefenderConfig` from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            RuntimeError::Config(format!(
                "Failed to read config file '{}': {e}",
                path.display()
            ))
        })?;
        Self::from_json_str(&contents)
    }
}
