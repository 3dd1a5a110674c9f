//! Allow/deny lists of IP addresses backed by plain text files.
//!
//! Format: one address literal per line, no header. Blank lines and lines
//! starting with `#` are skipped on load. Matching is exact after ASCII
//! lowercasing; there is no CIDR support.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, warn};

/// In-memory allow and deny sets.
///
/// The allow set is fixed after load. The deny set grows through
/// [`ReputationStore::deny`], which rewrites the deny file in full. Writes
/// are serialized by their own lock, so concurrent bans never interleave.
#[derive(Debug)]
pub struct ReputationStore {
    allowed: HashSet<String>,
    denied: Mutex<HashSet<String>>,
    deny_path: Option<PathBuf>,
    writer: Mutex<()>,
}

impl ReputationStore {
    /// Load both lists. A missing or unreadable file yields an empty set.
    pub fn load(allow_path: Option<&Path>, deny_path: Option<&Path>) -> Self {
        let allowed = allow_path.map(read_list).unwrap_or_default();
        let denied = deny_path.map(read_list).unwrap_or_default();
        info!(
            allowed = allowed.len(),
            denied = denied.len(),
            "reputation lists loaded"
        );
        Self {
            allowed,
            denied: Mutex::new(denied),
            deny_path: deny_path.map(Path::to_path_buf),
            writer: Mutex::new(()),
        }
    }

    /// Build a store from literal lists (no file backing for allows).
    pub fn from_lists<A, D>(allowed: A, denied: D, deny_path: Option<PathBuf>) -> Self
    where
        A: IntoIterator,
        A::Item: AsRef<str>,
        D: IntoIterator,
        D::Item: AsRef<str>,
    {
        Self {
            allowed: allowed.into_iter().map(|ip| normalize(ip.as_ref())).collect(),
            denied: Mutex::new(denied.into_iter().map(|ip| normalize(ip.as_ref())).collect()),
            deny_path,
            writer: Mutex::new(()),
        }
    }

    /// An empty store that never touches disk.
    pub fn empty() -> Self {
        Self::from_lists(Vec::<String>::new(), Vec::<String>::new(), None)
    }

    pub fn is_allowed(&self, ip: &str) -> bool {
        self.allowed.contains(&normalize(ip))
    }

    pub fn is_denied(&self, ip: &str) -> bool {
        self.denied
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&normalize(ip))
    }

    /// Add `ip` to the deny set and rewrite the deny file.
    ///
    /// Returns `true` only if the file was written. On failure the ban
    /// still holds in memory for the life of the process.
    ///
    /// The set lock is held only to insert and copy the entries; the file
    /// is written under a separate writer lock so lookups are never stuck
    /// behind disk I/O.
    pub fn deny(&self, ip: &str) -> bool {
        let Some(path) = &self.deny_path else {
            self.insert_denied(ip);
            debug!(ip, "no deny file configured, ban is in-memory only");
            return false;
        };

        // Taken first so snapshots reach the file in insertion order.
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let entries = self.insert_denied(ip);

        match write_list(path, &entries) {
            Ok(()) => {
                info!(ip, path = %path.display(), entries = entries.len(), "deny list updated");
                true
            }
            Err(e) => {
                warn!(ip, path = %path.display(), error = %e, "failed to write deny list");
                false
            }
        }
    }

    /// Insert under the set lock and return a sorted copy of the set.
    fn insert_denied(&self, ip: &str) -> Vec<String> {
        let mut denied = self.denied.lock().unwrap_or_else(PoisonError::into_inner);
        denied.insert(normalize(ip));
        let mut entries: Vec<String> = denied.iter().cloned().collect();
        entries.sort();
        entries
    }

    /// Current deny entries, sorted.
    pub fn denied(&self) -> Vec<String> {
        let denied = self.denied.lock().unwrap_or_else(PoisonError::into_inner);
        let mut list: Vec<String> = denied.iter().cloned().collect();
        list.sort();
        list
    }

    pub fn allowed_count(&self) -> usize {
        self.allowed.len()
    }
}

fn normalize(ip: &str) -> String {
    ip.trim().to_ascii_lowercase()
}

fn read_list(path: &Path) -> HashSet<String> {
    match fs::read_to_string(path) {
        Ok(content) => content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(normalize)
            .collect(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "list file not found, starting empty");
            HashSet::new()
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read list file, starting empty");
            HashSet::new()
        }
    }
}

fn write_list(path: &Path, entries: &[String]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut content = String::new();
    for ip in entries {
        content.push_str(ip);
        content.push('\n');
    }
    fs::write(path, content)
}
