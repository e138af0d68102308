// version information exchanged in connection hellos

use serde::{Deserialize, Serialize};

/// Revision of the on-the-wire formats (hello, control messages, data frames, sidecar).
///
/// Bumped whenever any of those encodings change; peers with different revisions refuse to talk.
pub const WIRE_REVISION: u32 = 1;

/// Protocol version information
///
/// Sent by the source in its control hello and stamped into every transfer manifest. The wire
/// revision decides compatibility, the semantic version and git information are there for
/// diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProtocolVersion {
    /// Wire format revision, see [`WIRE_REVISION`]
    pub wire: u32,

    /// Semantic version from Cargo.toml (e.g., "0.4.0")
    pub semantic: String,

    /// Git describe output (e.g., "v0.3.1-7-g644da27")
    #[serde(default)]
    pub git_describe: Option<String>,

    /// Full git commit hash
    #[serde(default)]
    pub git_hash: Option<String>,
}

impl ProtocolVersion {
    /// Version of the running binary, git fields are filled in by build.rs when available.
    pub fn current() -> Self {
        Self {
            wire: WIRE_REVISION,
            semantic: env!("CARGO_PKG_VERSION").to_string(),
            git_describe: option_env!("RBCP_GIT_DESCRIBE").map(String::from),
            git_hash: option_env!("RBCP_GIT_HASH").map(String::from),
        }
    }

    /// Two peers can exchange data iff they speak the same wire revision.
    ///
    /// # Examples
    ///
    /// ```
    /// use common::version::ProtocolVersion;
    ///
    /// let v1 = ProtocolVersion {
    ///     wire: 1,
    ///     semantic: "0.4.0".to_string(),
    ///     git_describe: None,
    ///     git_hash: None,
    /// };
    /// let v2 = ProtocolVersion {
    ///     wire: 1,
    ///     semantic: "0.4.2".to_string(),
    ///     git_describe: Some("v0.4.1-7-g644da27".to_string()),
    ///     git_hash: None,
    /// };
    /// assert!(v1.is_compatible_with(&v2));
    /// ```
    pub fn is_compatible_with(&self, other: &Self) -> bool {
        self.wire == other.wire
    }

    /// Human-readable version string
    pub fn display(&self) -> String {
        match self.git_describe {
            Some(ref git_describe) => {
                format!("{} ({}, wire {})", self.semantic, git_describe, self.wire)
            }
            None => format!("{} (wire {})", self.semantic, self.wire),
        }
    }

    /// Serialize to JSON string
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails.
    pub fn to_json(&self) -> anyhow::Result<String> {
        serde_json::to_string(self)
            .map_err(|e| anyhow::anyhow!("failed to serialize version: {:#}", e))
    }

    /// Deserialize from JSON string
    ///
    /// # Errors
    ///
    /// Returns an error if JSON deserialization fails or the format is invalid.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| anyhow::anyhow!("failed to parse version JSON: {:#}", e))
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(wire: u32, semantic: &str) -> ProtocolVersion {
        ProtocolVersion {
            wire,
            semantic: semantic.to_string(),
            git_describe: None,
            git_hash: None,
        }
    }

    #[test]
    fn current_version() {
        let version = ProtocolVersion::current();
        assert!(!version.semantic.is_empty());
        assert_eq!(version.wire, WIRE_REVISION);
    }

    #[test]
    fn compatibility_follows_wire_revision() {
        assert!(version(1, "0.4.0").is_compatible_with(&version(1, "0.5.0")));
        assert!(!version(1, "0.4.0").is_compatible_with(&version(2, "0.4.0")));
    }

    #[test]
    fn display() {
        assert_eq!(version(1, "0.4.0").display(), "0.4.0 (wire 1)");
        let mut v = version(3, "0.4.0");
        v.git_describe = Some("v0.3.1-7-g644da27".to_string());
        assert_eq!(v.display(), "0.4.0 (v0.3.1-7-g644da27, wire 3)");
    }

    #[test]
    fn json_round_trip_and_missing_git_fields() {
        let mut v = version(1, "0.4.0");
        v.git_hash = Some("644da27abc".to_string());
        let parsed = ProtocolVersion::from_json(&v.to_json().unwrap()).unwrap();
        assert_eq!(v, parsed);
        let bare = ProtocolVersion::from_json(r#"{"wire":1,"semantic":"0.4.0"}"#).unwrap();
        assert!(bare.git_describe.is_none());
        assert!(bare.git_hash.is_none());
    }
}
