//! Handing accepted connections to external worker processes.

pub mod launcher;
pub mod window;

pub use launcher::HandoffLauncher;
pub use window::{NoWindows, WindowControl};
