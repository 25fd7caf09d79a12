#![forbid(unsafe_code)]

//! Runtime introspection for a running engine.
//!
//! Debug controls are named commands registered by components (for example a
//! slice's statistics report) and dispatched by key from a single registry.

mod control;
mod error;

/// Named debug commands and the registry that dispatches them.
pub use control::{Control, ControlHandler, ControlRegistry};

/// Error types for administrative operations.
pub use error::{AdminError, Result};
