//! Worker command-line templates.
//!
//! A template is a fixed argument string containing `@TOKEN` placeholders
//! that are filled in per launch:
//!
//! | Token | Expands to                                   |
//! |-------|----------------------------------------------|
//! | `@N`  | The node (instance) number.                  |
//! | `@H`  | The native socket handle passed to the worker. |
//! | `@M`  | `-M` on a local launch, nothing otherwise.   |
//!
//! On a local launch there is no socket, so any argument that carries `@H`
//! is replaced wholesale by `-M`.

use crate::error::{GateError, GateResult};

/// Placeholder for the node number.
pub const TOKEN_NODE: &str = "@N";
/// Placeholder for the native socket handle.
pub const TOKEN_HANDLE: &str = "@H";
/// Placeholder for the local-launch marker.
pub const TOKEN_LOCAL: &str = "@M";

/// The flag a worker receives in place of a socket handle on a local launch.
const LOCAL_FLAG: &str = "-M";

/// An executable plus its argument template, bound once at configuration time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    executable: String,
    template: String,
}

impl CommandLine {
    /// Create a command line from an executable path and argument template.
    pub fn new(executable: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            template: template.into(),
        }
    }

    pub fn executable(&self) -> &str {
        &self.executable
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Substitute `@N` and `@H` for a socket handoff.
    pub fn build_args(&self, node: u32, handle: i64) -> String {
        self.template
            .replace(TOKEN_NODE, &node.to_string())
            .replace(TOKEN_HANDLE, &handle.to_string())
            .replace(TOKEN_LOCAL, "")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Substitute tokens for a local launch, which has no socket handle.
    pub fn build_local_args(&self, node: u32) -> String {
        self.template
            .split_whitespace()
            .map(|arg| {
                if arg.contains(TOKEN_HANDLE) {
                    LOCAL_FLAG.to_string()
                } else {
                    arg.replace(TOKEN_NODE, &node.to_string())
                        .replace(TOKEN_LOCAL, LOCAL_FLAG)
                }
            })
            .filter(|arg| !arg.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Executable followed by the socket-handoff arguments.
    pub fn build_full_command_line(&self, node: u32, handle: i64) -> String {
        join_command(&self.executable, &self.build_args(node, handle))
    }

    /// Executable followed by the local-launch arguments.
    pub fn build_full_local_command_line(&self, node: u32) -> String {
        join_command(&self.executable, &self.build_local_args(node))
    }

    /// Split a built argument string into argv entries.
    ///
    /// Quoting is not supported; arguments are separated by whitespace.
    pub fn split_args(args: &str) -> Vec<String> {
        args.split_whitespace().map(str::to_string).collect()
    }

    /// Reject templates that cannot be launched at all.
    pub fn validate(&self) -> GateResult<()> {
        if self.executable.trim().is_empty() {
            return Err(GateError::Template("executable path is empty".into()));
        }
        if let Some(bad) = self
            .template
            .match_indices('@')
            .map(|(i, _)| &self.template[i..])
            .find(|rest| {
                ![TOKEN_NODE, TOKEN_HANDLE, TOKEN_LOCAL]
                    .iter()
                    .any(|t| rest.starts_with(t))
            })
        {
            let token: String = bad.chars().take(2).collect();
            return Err(GateError::Template(format!("unknown token {token}")));
        }
        Ok(())
    }
}

fn join_command(executable: &str, args: &str) -> String {
    if args.is_empty() {
        executable.to_string()
    } else {
        format!("{executable} {args}")
    }
}
