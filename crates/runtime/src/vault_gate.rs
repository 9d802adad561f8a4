use tracing::{debug, info, warn};

use sani_config::VaultConfig;
use sani_memory::{
    GovernedStore, MemoryError, SessionProvenance, ThreadbornNote, VaultOutcome, VaultSealRequest,
};

/// `source_trigger` recorded on denial audit notes.
pub const SEAL_DENIED_TRIGGER: &str = "VAULT_SEAL_DENIED";

/// Resolved sealing switch: runtime toggle, then config file, then off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SealingPolicy {
    config_enabled: bool,
    runtime_override: Option<bool>,
}

impl SealingPolicy {
    pub fn new(config_enabled: bool, runtime_override: Option<bool>) -> Self {
        Self {
            config_enabled,
            runtime_override,
        }
    }

    pub fn from_config(config: &VaultConfig, runtime_override: Option<bool>) -> Self {
        Self::new(config.sealing_enabled, runtime_override)
    }

    pub fn is_sealing_enabled(&self) -> bool {
        self.runtime_override.unwrap_or(self.config_enabled)
    }
}

/// Policy gate in front of every Vault seal or append.
#[derive(Debug, Clone)]
pub struct VaultGate {
    store: GovernedStore,
    policy: SealingPolicy,
}

impl VaultGate {
    pub fn new(store: GovernedStore, policy: SealingPolicy) -> Self {
        Self { store, policy }
    }

    pub fn is_sealing_enabled(&self) -> bool {
        self.policy.is_sealing_enabled()
    }

    /// Seal or append when policy allows; otherwise leave a denial note in
    /// ThreadBorn and fail with [`MemoryError::SealingDisabled`].
    pub async fn seal(&self, request: VaultSealRequest) -> Result<VaultOutcome, MemoryError> {
        if !self.is_sealing_enabled() {
            warn!(
                source = %request.source_path,
                append = request.append,
                session = %request.provenance.session_id,
                "vault seal denied: sealing disabled"
            );
            self.record_denial(&request).await;
            return Err(MemoryError::SealingDisabled);
        }

        let outcome = self.store.seal_to_vault(request).await?;
        if let VaultOutcome::Sealed(entry) = &outcome {
            info!(id = %entry.id, path = %entry.path, "vault entry sealed");
        }
        Ok(outcome)
    }

    /// Best effort: a failure here must never replace the denial error.
    async fn record_denial(&self, request: &VaultSealRequest) {
        let mut body = String::from("A Vault seal request was refused because sealing is disabled.\n\n");
        body.push_str(&format!("- Source: {}\n", request.source_path));
        body.push_str(&format!(
            "- Title: {}\n",
            request.title.as_deref().unwrap_or("(none)")
        ));
        body.push_str(&format!("- Append: {}\n", request.append));
        if let Some(target) = &request.target_path {
            body.push_str(&format!("- Target: {target}\n"));
        }
        if let Some(scope) = &request.scope {
            body.push_str(&format!("- Scope: {scope}\n"));
        }
        body.push_str(&format!("- Session: {}\n", request.provenance.session_id));
        body.push_str(&format!("- Trigger: {}\n", request.provenance.trigger));

        let note = ThreadbornNote {
            title: "Vault seal denied".to_string(),
            body,
            tags: vec![
                "vault".to_string(),
                "denied".to_string(),
                "admin-denied".to_string(),
            ],
            provenance: SessionProvenance::new(
                request.provenance.session_id.clone(),
                SEAL_DENIED_TRIGGER,
            ),
        };
        if let Err(err) = self.store.write_threadborn(note).await {
            debug!(
                target: "sani::diagnostics",
                error = %err,
                "failed to record vault denial"
            );
        }
    }
}
