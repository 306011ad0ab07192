//! Command allow-list.
//!
//! SECURITY: this table is the only place an executable name can come from.
//! Client input selects an entry by name and supplies the target; it never
//! contributes an executable, a flag, or an extra argv element.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::TimeoutPolicy;
use crate::error::RegistryError;
use crate::target::Target;

/// Timeout class of a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolFamily {
    /// Fast passive reconnaissance.
    Recon,
    /// Active scanning, brute forcing, or attack-surface mapping.
    DeepScan,
}

impl ToolFamily {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Recon => "recon",
            Self::DeepScan => "deep_scan",
        }
    }
}

/// One element of a tool's argument template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgTemplate {
    /// Fixed operator-chosen argument.
    Literal(&'static str),
    /// Replaced by the validated target.
    Target,
    /// Replaced by the validated target followed by a fixed suffix
    /// (ffuf's `<url>/FUZZ`).
    TargetWithSuffix(&'static str),
}

impl ArgTemplate {
    fn is_target_slot(self) -> bool {
        !matches!(self, Self::Literal(_))
    }

    fn render(self, target: &Target) -> String {
        match self {
            Self::Literal(arg) => arg.to_string(),
            Self::Target => target.as_str().to_string(),
            Self::TargetWithSuffix(suffix) => format!("{target}{suffix}"),
        }
    }
}

/// An allow-listed tool and the exact shape of its command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub executable: &'static str,
    pub fixed_args: &'static [ArgTemplate],
    pub description: &'static str,
    pub family: ToolFamily,
}

impl ToolDefinition {
    /// Arguments (without the executable) with the target substituted.
    ///
    /// Always returns exactly `fixed_args.len()` elements.
    #[must_use]
    pub fn argv(&self, target: &Target) -> Vec<String> {
        self.fixed_args.iter().map(|arg| arg.render(target)).collect()
    }

    /// Executable followed by [`Self::argv`], for logs and the `start` event.
    #[must_use]
    pub fn command_line(&self, target: &Target) -> Vec<String> {
        std::iter::once(self.executable.to_string())
            .chain(self.argv(target))
            .collect()
    }

    #[must_use]
    pub fn timeout(&self, policy: &TimeoutPolicy) -> Duration {
        policy.for_family(self.family)
    }

    fn target_slots(&self) -> usize {
        self.fixed_args
            .iter()
            .filter(|arg| arg.is_target_slot())
            .count()
    }
}

const COMMON_WORDLIST: &str = "/usr/share/wordlists/common.txt";

/// Tools shipped with the agent.
pub const BUILTIN_TOOLS: &[ToolDefinition] = &[
    ToolDefinition {
        name: "subfinder",
        executable: "subfinder",
        fixed_args: &[
            ArgTemplate::Literal("-d"),
            ArgTemplate::Target,
            ArgTemplate::Literal("-silent"),
        ],
        description: "Fast passive subdomain discovery tool",
        family: ToolFamily::Recon,
    },
    ToolDefinition {
        name: "nmap",
        executable: "nmap",
        fixed_args: &[
            ArgTemplate::Literal("-sS"),
            ArgTemplate::Literal("-sV"),
            ArgTemplate::Literal("-O"),
            ArgTemplate::Literal("-p"),
            ArgTemplate::Literal(
                "21,22,23,25,53,80,110,143,443,993,995,3306,3389,5432,8080,8443",
            ),
            ArgTemplate::Target,
        ],
        description: "Network discovery and port scanning",
        family: ToolFamily::DeepScan,
    },
    ToolDefinition {
        name: "gobuster",
        executable: "gobuster",
        fixed_args: &[
            ArgTemplate::Literal("dir"),
            ArgTemplate::Literal("-u"),
            ArgTemplate::Target,
            ArgTemplate::Literal("-w"),
            ArgTemplate::Literal(COMMON_WORDLIST),
        ],
        description: "Directory and file brute-forcer",
        family: ToolFamily::DeepScan,
    },
    ToolDefinition {
        name: "ffuf",
        executable: "ffuf",
        fixed_args: &[
            ArgTemplate::Literal("-u"),
            ArgTemplate::TargetWithSuffix("/FUZZ"),
            ArgTemplate::Literal("-w"),
            ArgTemplate::Literal(COMMON_WORDLIST),
        ],
        description: "Fast web fuzzer",
        family: ToolFamily::DeepScan,
    },
    ToolDefinition {
        name: "nuclei",
        executable: "nuclei",
        fixed_args: &[
            ArgTemplate::Literal("-u"),
            ArgTemplate::Target,
            ArgTemplate::Literal("-silent"),
        ],
        description: "Fast vulnerability scanner",
        family: ToolFamily::DeepScan,
    },
    ToolDefinition {
        name: "amass",
        executable: "amass",
        fixed_args: &[ArgTemplate::Literal("enum"), ArgTemplate::Literal("-d"), ArgTemplate::Target],
        description: "In-depth attack surface mapping",
        family: ToolFamily::DeepScan,
    },
];

/// Immutable allow-list, built once at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct ToolRegistry {
    tools: Vec<ToolDefinition>,
}

impl ToolRegistry {
    /// Build a registry, checking every definition has exactly one target
    /// slot, a non-empty executable, and a unique name.
    pub fn new(tools: Vec<ToolDefinition>) -> Result<Self, RegistryError> {
        let mut seen = HashSet::new();
        for tool in &tools {
            if !seen.insert(tool.name) {
                return Err(RegistryError::DuplicateName(tool.name.to_string()));
            }
            if tool.executable.trim().is_empty() {
                return Err(RegistryError::EmptyExecutable(tool.name.to_string()));
            }
            let found = tool.target_slots();
            if found != 1 {
                return Err(RegistryError::TargetSlots {
                    name: tool.name.to_string(),
                    found,
                });
            }
        }
        Ok(Self { tools })
    }

    /// The built-in tool table. Covered by `builtin_table_is_well_formed`.
    #[must_use]
    pub fn builtin() -> Self {
        Self {
            tools: BUILTIN_TOOLS.to_vec(),
        }
    }

    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.iter().find(|tool| tool.name == name)
    }

    /// Tool names in table order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|tool| tool.name.to_string()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolDefinition> {
        self.tools.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
