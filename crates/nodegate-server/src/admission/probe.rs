//! "Press ESC twice" probe for telnet-style callers.
//!
//! A human at a terminal sees the banner and presses ESC twice; a scanner
//! usually starts typing credentials or hangs up. The probe sends the
//! banner, then watches the input for up to [`ProbeSettings::timeout`]:
//!
//! - two ESC bytes anywhere in the input: pass through
//! - a credential-harvesting word (`root`, `admin`): ban
//! - remote close: reject
//! - deadline reached: pass through
//!
//! While the line is quiet a keep-alive byte is written every
//! [`ProbeSettings::poll_interval`].

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::debug;

/// The escape byte the caller must send twice.
pub const ESCAPE: u8 = 0x1b;

/// Sent once when the probe starts.
pub const BANNER: &[u8] = b"\r\nCONNECT\r\n\r\nPress <ESC> twice for the BBS...\r\n";

/// Written whenever a poll interval passes with no input.
pub const KEEPALIVE: u8 = 0x00;

/// Words that only a credential scanner types before pressing ESC.
pub const PROBE_WORDS: &[&str] = &["root", "admin"];

/// Input kept for word matching; older bytes are discarded.
const MAX_CAPTURE: usize = 1024;

/// Timing for [`run_probe`].
#[derive(Debug, Clone, Copy)]
pub struct ProbeSettings {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// How a probe ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Two ESC bytes arrived.
    Escaped,
    /// The deadline passed without a decision.
    TimedOut,
    /// The caller typed a scanner word.
    Banned(String),
    /// The caller hung up.
    Closed,
    /// Reading or writing failed.
    TransportError(String),
}

/// Run the probe on `stream` and report how it ended.
pub async fn run_probe<S>(stream: &mut S, settings: &ProbeSettings) -> ProbeOutcome
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Err(e) = stream.write_all(BANNER).await {
        return ProbeOutcome::TransportError(e.to_string());
    }

    let deadline = Instant::now() + settings.timeout;
    let mut captured: Vec<u8> = Vec::new();
    let mut escapes = 0usize;
    let mut buf = [0u8; 256];

    loop {
        let now = Instant::now();
        if now >= deadline {
            debug!(escapes, "probe timed out");
            return ProbeOutcome::TimedOut;
        }
        let wait = settings.poll_interval.min(deadline - now);

        match tokio::time::timeout(wait, stream.read(&mut buf)).await {
            Err(_) => {
                if let Err(e) = stream.write_all(&[KEEPALIVE]).await {
                    return ProbeOutcome::TransportError(e.to_string());
                }
            }
            Ok(Ok(0)) => return ProbeOutcome::Closed,
            Ok(Ok(n)) => {
                // Bytes are judged in arrival order: text typed before an
                // ESC is checked for scanner words before that ESC counts.
                for (i, segment) in buf[..n].split(|b| *b == ESCAPE).enumerate() {
                    if i > 0 {
                        escapes += 1;
                        if escapes >= 2 {
                            return ProbeOutcome::Escaped;
                        }
                    }
                    if let Some(word) = capture(&mut captured, segment) {
                        return ProbeOutcome::Banned(word.to_string());
                    }
                }
            }
            Ok(Err(e)) => return ProbeOutcome::TransportError(e.to_string()),
        }
    }
}

/// Append `segment` to the capture window and look for a scanner word.
fn capture(captured: &mut Vec<u8>, segment: &[u8]) -> Option<&'static str> {
    if segment.is_empty() {
        return None;
    }
    captured.extend_from_slice(segment);
    if captured.len() > MAX_CAPTURE {
        captured.drain(..captured.len() - MAX_CAPTURE);
    }
    find_probe_word(captured)
}

fn find_probe_word(input: &[u8]) -> Option<&'static str> {
    let text = String::from_utf8_lossy(input).to_ascii_lowercase();
    PROBE_WORDS.iter().copied().find(|word| text.contains(word))
}
