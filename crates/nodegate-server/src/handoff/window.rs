//! Best-effort minimisation of a freshly started worker's window.

use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// How many times to look for the worker's main window.
pub const WINDOW_POLL_ATTEMPTS: u32 = 25;
/// Delay between looks.
pub const WINDOW_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Access to the desktop's windows, supplied by the UI layer.
pub trait WindowControl: Send + Sync {
    /// Whether this host has windows at all. When false, polling is skipped.
    fn supported(&self) -> bool;

    /// The main window handle of process `pid`, once it has one.
    fn main_window(&self, pid: u32) -> Option<u64>;

    /// Ask the window manager to minimise `window`.
    fn minimize(&self, window: u64) -> bool;
}

/// Headless hosts: there is never a window to minimise.
pub struct NoWindows;

impl WindowControl for NoWindows {
    fn supported(&self) -> bool {
        false
    }

    fn main_window(&self, _pid: u32) -> Option<u64> {
        None
    }

    fn minimize(&self, _window: u64) -> bool {
        false
    }
}

/// Poll for `pid`'s main window and minimise it when it appears.
///
/// Returns whether a window was minimised. A window that never shows up
/// is not an error.
pub async fn minimize_when_ready(
    control: &dyn WindowControl,
    pid: u32,
    attempts: u32,
    interval: Duration,
) -> bool {
    if !control.supported() {
        return false;
    }
    for _ in 0..attempts {
        if let Some(window) = control.main_window(pid) {
            let minimized = control.minimize(window);
            debug!(pid, window, minimized, "worker window minimize requested");
            return minimized;
        }
        sleep(interval).await;
    }
    debug!(pid, "worker window never appeared");
    false
}
