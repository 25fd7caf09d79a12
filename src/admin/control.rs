//! Registry of named debug controls and the guards that keep them registered.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::debug;

use crate::admin::{AdminError, Result};

/// A debug command. `args[0]` is the key it was invoked under.
pub trait ControlHandler: Send + Sync {
    /// Runs the command and returns its textual reply.
    fn call(&self, args: &[&str]) -> String;
}

impl<F> ControlHandler for F
where
    F: Fn(&[&str]) -> String + Send + Sync,
{
    fn call(&self, args: &[&str]) -> String {
        self(args)
    }
}

struct Registered {
    help: String,
    handler: Arc<dyn ControlHandler>,
}

/// Key-ordered table of debug controls guarded by one lock.
#[derive(Default)]
pub struct ControlRegistry {
    controls: Mutex<BTreeMap<String, Registered>>,
}

impl ControlRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry, created on first use.
    pub fn global() -> &'static ControlRegistry {
        static GLOBAL: OnceLock<ControlRegistry> = OnceLock::new();
        GLOBAL.get_or_init(ControlRegistry::new)
    }

    /// Registers `handler` under `key`. The control stays registered until the
    /// returned guard is dropped.
    pub fn register(
        &self,
        key: impl Into<String>,
        help: impl Into<String>,
        handler: impl ControlHandler + 'static,
    ) -> Result<Control<'_>> {
        let key = key.into();
        if key.is_empty() {
            return Err(AdminError::EmptyKey);
        }
        let mut controls = self.controls.lock();
        if controls.contains_key(&key) {
            return Err(AdminError::DuplicateKey(key));
        }
        controls.insert(
            key.clone(),
            Registered {
                help: help.into(),
                handler: Arc::new(handler),
            },
        );
        debug!(key = %key, "control.register");
        Ok(Control {
            registry: self,
            key,
        })
    }

    /// Dispatches `args[0]` to its control, or returns [`Self::help`] when `args` is
    /// empty or names no control.
    pub fn exec(&self, args: &[&str]) -> String {
        let handler = match args.first() {
            Some(key) => self
                .controls
                .lock()
                .get(*key)
                .map(|c| Arc::clone(&c.handler)),
            None => None,
        };
        match handler {
            Some(handler) => handler.call(args),
            None => self.help(),
        }
    }

    /// One `key: help` line per control that has help text.
    pub fn help(&self) -> String {
        let controls = self.controls.lock();
        let mut out = String::new();
        for (key, control) in controls.iter() {
            if control.help.is_empty() {
                continue;
            }
            out.push_str(key);
            out.push_str(": ");
            out.push_str(&control.help);
            out.push_str("\r\n");
        }
        out
    }

    /// Returns true if `key` is registered.
    pub fn contains(&self, key: &str) -> bool {
        self.controls.lock().contains_key(key)
    }

    fn unregister(&self, key: &str) {
        let removed = self.controls.lock().remove(key);
        assert!(removed.is_some(), "control {key} vanished while registered");
        debug!(key, "control.unregister");
    }
}

/// Registration guard; unregisters its control on drop.
pub struct Control<'r> {
    registry: &'r ControlRegistry,
    key: String,
}

impl Control<'_> {
    /// Key this control answers to.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for Control<'_> {
    fn drop(&mut self) {
        self.registry.unregister(&self.key);
    }
}
