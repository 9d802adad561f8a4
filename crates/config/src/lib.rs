use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    /// Workspace root; the governed tree lives under `<workspace>/memory/`.
    pub workspace_path: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "Sani".to_string(),
            workspace_path: ".".to_string(),
        }
    }
}

// ── Persona / session modes ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonaConfig {
    /// Master switch for the persona feature.  When `false`, trigger lines
    /// are ignored and no mode transitions happen.
    pub enabled: bool,
    /// Minutes after the last mode change before elevated modes auto-clear.
    /// `0` or a negative value disables expiry entirely.
    pub mode_ttl_minutes: i64,
    /// Number of most recent session messages rendered into a Labyrinth snapshot.
    pub snapshot_message_limit: usize,
    /// Per-message character cap inside a Labyrinth snapshot.
    pub snapshot_message_chars: usize,
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode_ttl_minutes: 720,
            snapshot_message_limit: 10,
            snapshot_message_chars: 280,
        }
    }
}

// ── Vault ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct VaultConfig {
    /// Config-file default for the sealing gate.  A runtime toggle, when
    /// present, takes precedence.  Off unless explicitly enabled.
    pub sealing_enabled: bool,
}

// ── Security ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Persist detected injection attempts under `memory/ThreadBorn/injection-attempts/`.
    pub injection_audit_enabled: bool,
    /// Channels treated as internal agent traffic.  Patterns scoped to
    /// non-agent channels are skipped for these (case-insensitive).
    pub trusted_channels: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            injection_audit_enabled: true,
            trusted_channels: vec!["agent".to_string(), "internal".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// JSON file backing the session mode records.
    pub store_path: String,
    /// Inbound turns kept per session for Labyrinth snapshots; 0 keeps none.
    pub transcript_limit: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            store_path: ".sani/sessions.json".to_string(),
            transcript_limit: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub persona: PersonaConfig,
    pub vault: VaultConfig,
    pub security: SecurityConfig,
    pub session: SessionConfig,
    pub telemetry: TelemetryConfig,
}

/// Parse the usual spellings of an on/off flag.
pub fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        Self::load_with_env(path, |key| env::var(key).ok())
    }

    /// Load `path` (defaults when missing) and apply environment overrides
    /// fetched through `lookup`.  Env values win over the file.
    pub fn load_with_env(
        path: impl AsRef<Path>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Some(value) = lookup("SANI_WORKSPACE") {
            if !value.is_empty() {
                config.agent.workspace_path = value;
            }
        }

        if let Some(value) = lookup("SANI_MODE_TTL_MINUTES") {
            if !value.is_empty() {
                config.persona.mode_ttl_minutes = match value.trim().parse() {
                    Ok(minutes) => minutes,
                    Err(_) => bail!("SANI_MODE_TTL_MINUTES must be an integer, got '{value}'"),
                };
            }
        }

        if let Some(value) = lookup("SANI_VAULT_SEALING") {
            if !value.is_empty() {
                config.vault.sealing_enabled = match parse_flag(&value) {
                    Some(flag) => flag,
                    None => bail!("SANI_VAULT_SEALING must be a boolean flag, got '{value}'"),
                };
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use tempfile::TempDir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    // ── Security-critical defaults ────────────────────────────────────────
    // Changing any of these should be a deliberate, reviewed decision.

    #[test]
    fn security_defaults_keep_vault_sealed() {
        let cfg = AppConfig::default();
        assert!(
            !cfg.vault.sealing_enabled,
            "vault sealing must default to disabled"
        );
        assert!(
            cfg.security.injection_audit_enabled,
            "injection auditing must default to enabled"
        );
    }

    #[test]
    fn persona_defaults() {
        let cfg = AppConfig::default();
        assert!(cfg.persona.enabled);
        assert_eq!(cfg.persona.mode_ttl_minutes, 720);
        assert_eq!(cfg.persona.snapshot_message_limit, 10);
        assert_eq!(cfg.persona.snapshot_message_chars, 280);
        assert_eq!(cfg.agent.workspace_path, ".");
        assert_eq!(cfg.session.store_path, ".sani/sessions.json");
        assert_eq!(cfg.session.transcript_limit, 20);
        assert_eq!(cfg.telemetry.log_level, "info");
    }

    // ── load_from ──────────────────────────────────────────────────────────

    #[test]
    fn load_missing_file_returns_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = AppConfig::load_with_env(dir.path().join("nonexistent.toml"), no_env).unwrap();
        assert_eq!(cfg.agent.name, "Sani");
        assert!(!cfg.vault.sealing_enabled);
    }

    #[test]
    fn load_valid_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.toml");
        fs::write(
            &path,
            r#"
[agent]
workspace_path = "/srv/sani"

[persona]
mode_ttl_minutes = 0
snapshot_message_limit = 3

[vault]
sealing_enabled = true

[security]
trusted_channels = ["agent"]
"#,
        )
        .unwrap();

        let cfg = AppConfig::load_with_env(&path, no_env).unwrap();
        assert_eq!(cfg.agent.workspace_path, "/srv/sani");
        assert_eq!(cfg.persona.mode_ttl_minutes, 0);
        assert_eq!(cfg.persona.snapshot_message_limit, 3);
        // Unspecified fields keep their defaults.
        assert_eq!(cfg.persona.snapshot_message_chars, 280);
        assert!(cfg.persona.enabled);
        assert!(cfg.vault.sealing_enabled);
        assert_eq!(cfg.security.trusted_channels, vec!["agent"]);
    }

    #[test]
    fn load_invalid_toml_returns_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "this is not valid toml {{{{").unwrap();
        assert!(AppConfig::load_with_env(&path, no_env).is_err());
    }

    #[test]
    fn save_and_reload_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a/b/config.toml");

        let mut cfg = AppConfig::default();
        cfg.persona.mode_ttl_minutes = 30;
        cfg.vault.sealing_enabled = true;
        cfg.security.trusted_channels = vec!["subagent".to_string()];
        cfg.save_to(&path).unwrap();

        let loaded = AppConfig::load_with_env(&path, no_env).unwrap();
        assert_eq!(loaded.persona.mode_ttl_minutes, 30);
        assert!(loaded.vault.sealing_enabled);
        assert_eq!(loaded.security.trusted_channels, vec!["subagent"]);
    }

    // ── Env overrides ──────────────────────────────────────────────────────

    #[test]
    fn env_overrides_win_over_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("env.toml");
        fs::write(
            &path,
            r#"
[vault]
sealing_enabled = true

[persona]
mode_ttl_minutes = 5
"#,
        )
        .unwrap();

        let env: HashMap<&str, &str> = HashMap::from([
            ("SANI_VAULT_SEALING", "off"),
            ("SANI_MODE_TTL_MINUTES", "-1"),
            ("SANI_WORKSPACE", "/tmp/ws"),
        ]);
        let cfg =
            AppConfig::load_with_env(&path, |key| env.get(key).map(|v| v.to_string())).unwrap();
        assert!(!cfg.vault.sealing_enabled);
        assert_eq!(cfg.persona.mode_ttl_minutes, -1);
        assert_eq!(cfg.agent.workspace_path, "/tmp/ws");
    }

    #[test]
    fn malformed_env_values_are_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing.toml");
        let bad_flag = AppConfig::load_with_env(&path, |key| {
            (key == "SANI_VAULT_SEALING").then(|| "maybe".to_string())
        });
        assert!(bad_flag.is_err());
        let bad_ttl = AppConfig::load_with_env(&path, |key| {
            (key == "SANI_MODE_TTL_MINUTES").then(|| "soon".to_string())
        });
        assert!(bad_ttl.is_err());
    }

    #[test]
    fn parse_flag_spellings() {
        for on in ["1", "true", "YES", " on "] {
            assert_eq!(parse_flag(on), Some(true), "{on}");
        }
        for off in ["0", "false", "No", "OFF"] {
            assert_eq!(parse_flag(off), Some(false), "{off}");
        }
        assert_eq!(parse_flag("perhaps"), None);
    }
}
