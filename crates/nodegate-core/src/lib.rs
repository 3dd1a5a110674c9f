//! nodegate-core: types shared between the admission server and its UI.
//!
//! Provides the error type, worker command-line templates, and the status
//! and node events the server publishes.

pub mod error;
pub mod events;
pub mod template;

pub use error::{GateError, GateResult};
pub use events::{NodeKind, NodeStatus, ServerEvent, StatusCategory, StatusMessage};
pub use template::CommandLine;
