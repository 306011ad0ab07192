//! Startup probe for which allow-listed executables are installed.
//!
//! Informational only: a missing tool stays in the allow-list and a request
//! for it fails with `spawn_failed`.

use std::path::PathBuf;

use desktop_agent_common::{ToolFamily, ToolRegistry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolAvailability {
    pub name: &'static str,
    pub executable: &'static str,
    pub family: ToolFamily,
    pub description: &'static str,
    /// Resolved location on `PATH`, if any.
    pub path: Option<PathBuf>,
}

impl ToolAvailability {
    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.path.is_some()
    }
}

#[must_use]
pub fn probe(registry: &ToolRegistry) -> Vec<ToolAvailability> {
    registry
        .iter()
        .map(|tool| ToolAvailability {
            name: tool.name,
            executable: tool.executable,
            family: tool.family,
            description: tool.description,
            path: which::which(tool.executable).ok(),
        })
        .collect()
}

/// Log one line per tool; missing tools at `warn`.
pub fn log_availability(tools: &[ToolAvailability]) {
    for tool in tools {
        match &tool.path {
            Some(path) => {
                tracing::info!(tool = tool.name, path = %path.display(), "tool available");
            }
            None => tracing::warn!(
                tool = tool.name,
                executable = tool.executable,
                "tool not found on PATH; requests for it will fail",
            ),
        }
    }
}
