//! # Command Executor
//!
//! Untagged `server-command` frames are executed on this machine. The
//! cloud session only sees the [`CommandExecutor`] trait; [`CommandTable`]
//! is the stock implementation, a name → handler table where
//! `get_metrics`, `getMetrics` and `get-metrics` all resolve to the same
//! entry.
//!
//! Execution is synchronous and runs on tokio's blocking pool. A panicking
//! handler is caught and reported as a failed command.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde_json::{json, Map, Value};
use tracing::{error, info};

/// What a command produced: `(ok, message, result)`.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutcome {
    pub ok: bool,
    pub message: String,
    pub result: Option<Value>,
}

impl CommandOutcome {
    pub fn ok(result: Option<Value>) -> Self {
        Self {
            ok: true,
            message: "ok".to_string(),
            result,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
            result: None,
        }
    }
}

/// Runs one named command. Implementations must not panic across this call.
pub trait CommandExecutor: Send + Sync + 'static {
    fn execute(&self, command_name: &str, payload: &Map<String, Value>) -> CommandOutcome;
}

pub type Handler = Arc<dyn Fn(&Map<String, Value>) -> CommandOutcome + Send + Sync>;

// ─── Command Table ──────────────────────────────────────────────

/// Name-keyed command table.
///
/// Names are matched case-insensitively with `_` and `-` ignored, so one
/// registration covers snake, kebab and camel spellings.
#[derive(Clone, Default)]
pub struct CommandTable {
    handlers: HashMap<String, Handler>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table with the built-in device commands:
    /// `ping`, `get_version`, `get_state`, `set_state`, `get_metrics`.
    pub fn with_builtins(version: &str) -> Self {
        let mut table = Self::new();
        let device = Arc::new(DeviceState::new(version));

        table.register("ping", |_| {
            CommandOutcome::ok(Some(json!({ "pong": true })))
        });

        let d = device.clone();
        table.register("get_version", move |_| {
            CommandOutcome::ok(Some(json!({ "version": d.version })))
        });

        let d = device.clone();
        table.register("get_state", move |_| {
            CommandOutcome::ok(Some(json!({ "state": d.current() })))
        });

        let d = device.clone();
        table.register("set_state", move |payload| {
            let name = ["state", "state_name"]
                .iter()
                .filter_map(|key| payload.get(*key))
                .filter_map(Value::as_str)
                .map(str::trim)
                .find(|s| !s.is_empty());
            match name {
                Some(name) => {
                    d.set(name);
                    CommandOutcome::ok(Some(json!({ "state": name })))
                }
                None => CommandOutcome::fail("Missing 'state' or 'state_name' in payload"),
            }
        });

        let d = device;
        table.register("get_metrics", move |_| {
            CommandOutcome::ok(Some(d.metrics()))
        });

        table
    }

    /// Registers (or replaces) a handler.
    pub fn register<F>(&mut self, name: &str, handler: F) -> &mut Self
    where
        F: Fn(&Map<String, Value>) -> CommandOutcome + Send + Sync + 'static,
    {
        self.handlers.insert(normalize(name), Arc::new(handler));
        self
    }

    /// Makes `alias` run whatever `target` runs. No-op if `target` is unknown.
    pub fn alias(&mut self, alias: &str, target: &str) -> &mut Self {
        if let Some(handler) = self.handlers.get(&normalize(target)).cloned() {
            self.handlers.insert(normalize(alias), handler);
        }
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(&normalize(name))
    }
}

impl CommandExecutor for CommandTable {
    fn execute(&self, command_name: &str, payload: &Map<String, Value>) -> CommandOutcome {
        let Some(handler) = self.handlers.get(&normalize(command_name)) else {
            return CommandOutcome::fail(format!("Unknown command: {}", command_name));
        };
        match catch_unwind(AssertUnwindSafe(|| handler(payload))) {
            Ok(outcome) => {
                info!("command_executed command={} ok={}", command_name, outcome.ok);
                outcome
            }
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".to_string());
                error!("command_panicked command={} reason={}", command_name, reason);
                CommandOutcome::fail(reason)
            }
        }
    }
}

fn normalize(name: &str) -> String {
    name.trim()
        .chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

// ─── Device State ───────────────────────────────────────────────

/// Process-local device bookkeeping used by the built-in commands.
struct DeviceState {
    version: String,
    started: Instant,
    state: Mutex<String>,
    transitions: AtomicU64,
}

impl DeviceState {
    fn new(version: &str) -> Self {
        Self {
            version: version.to_string(),
            started: Instant::now(),
            state: Mutex::new("idle".to_string()),
            transitions: AtomicU64::new(0),
        }
    }

    fn current(&self) -> String {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set(&self, name: &str) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = name.to_string();
        self.transitions.fetch_add(1, Ordering::Relaxed);
    }

    fn metrics(&self) -> Value {
        json!({
            "supported": true,
            "version": self.version,
            "state": self.current(),
            "state_transitions": self.transitions.load(Ordering::Relaxed),
            "uptime_seconds": self.started.elapsed().as_secs(),
        })
    }
}
