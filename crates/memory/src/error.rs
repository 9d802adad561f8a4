use std::path::PathBuf;

/// Failures raised by governed memory operations.
///
/// Path violations, allocation exhaustion and parameter misuse are always
/// fatal to the calling operation and are never retried.  Header decode
/// problems are deliberately absent: the codec degrades to empty metadata
/// instead of failing.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// The requested path resolves outside the workspace root (or to the root itself).
    #[error("path escapes workspace boundary: {path}")]
    PathEscape { path: String },

    /// The requested source is not inside ThreadBorn, BridgeThread or Labyrinth.
    #[error("source path not allowed: {path} (sources must live under memory/ThreadBorn, memory/BridgeThread or memory/Labyrinth)")]
    DisallowedSource { path: String },

    /// Every candidate filename already existed.
    #[error("could not allocate a unique file for '{base}' after {attempts} attempt(s)")]
    AllocationExhausted { base: String, attempts: usize },

    /// Vault sealing is turned off by policy.
    #[error(
        "vault sealing is disabled; set `[vault] sealing_enabled = true`, export SANI_VAULT_SEALING=1, or enable the runtime sealing toggle"
    )]
    SealingDisabled,

    /// Append mode was requested without a target, or the target does not exist.
    #[error("vault append needs an existing target file inside memory/Vault: {detail}")]
    MissingTarget { detail: String },

    /// A target path was supplied without `append = true`.
    #[error("target_path is only valid together with append = true; omit target_path to seal a new entry")]
    InvalidAppendCombination,

    /// The append target resolved somewhere other than a file below memory/Vault.
    #[error("append target must be a file inside memory/Vault: {path}")]
    TargetOutsideVault { path: String },

    /// The originating session or trigger could not be established.
    #[error("cannot establish provenance: {detail}")]
    ProvenanceUnresolved { detail: String },

    #[error("i/o failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl MemoryError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// `true` for policy and validation failures whose message is meant for the
    /// agent or end user; `false` for operator-facing I/O failures.
    pub fn is_user_facing(&self) -> bool {
        !matches!(self, Self::Io { .. })
    }
}

pub type Result<T> = std::result::Result<T, MemoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sealing_disabled_names_the_enabling_mechanism() {
        let msg = MemoryError::SealingDisabled.to_string();
        assert!(msg.contains("sealing_enabled"));
        assert!(msg.contains("SANI_VAULT_SEALING"));
    }

    #[test]
    fn io_errors_are_operator_facing() {
        let err = MemoryError::io(
            "/tmp/x",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope"),
        );
        assert!(!err.is_user_facing());
        assert!(err.to_string().contains("nope"));
        assert!(MemoryError::InvalidAppendCombination.is_user_facing());
    }
}
