use crate::task::Role;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A reusable module known to the platform.
///
/// Feature-tree artifacts reference module ids to mark reuse-vs-new-module
/// decisions. Entries are mutated by administrative actions and read by task
/// handlers through a cached view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleEntry {
    /// Stable module identifier.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Capability tags matched against feature requirements.
    pub capabilities: Vec<String>,
    /// Module version string.
    pub version: String,
    /// When the entry was last upserted.
    pub updated_at: DateTime<Utc>,
}

impl ModuleEntry {
    /// Creates an entry stamped now.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        capabilities: Vec<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            capabilities,
            version: version.into(),
            updated_at: Utc::now(),
        }
    }

    /// Whether the module advertises the given capability.
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

/// Skill names a role's handlers are allowed to invoke.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillAllowlist {
    /// The role the allowlist applies to.
    pub role: Role,
    /// Allowed skill names.
    pub skills: Vec<String>,
}
