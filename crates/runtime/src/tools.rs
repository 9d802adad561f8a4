//! Memory tools exposed to the agent runtime.
//!
//! Arguments arrive as JSON and are parsed strictly: unknown fields are an
//! error, so a mistyped `target_path` cannot silently turn an append into a
//! seal.  Every write needs an originating session; calls without one fail
//! with `ProvenanceUnresolved`.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use sani_memory::{
    GovernedStore, LabyrinthSnapshot, MemoryError, PromotionRequest, SessionProvenance,
    ThreadbornNote, VaultHit, VaultOutcome, VaultSealRequest, WrittenEntry,
};

use crate::vault_gate::VaultGate;

pub const THREADBORN_WRITE: &str = "memory_threadborn_write";
pub const BRIDGETHREAD_PROMOTE: &str = "memory_bridgethread_promote";
pub const VAULT_SEAL: &str = "memory_vault_seal";
pub const LABYRINTH_SNAPSHOT: &str = "memory_labyrinth_snapshot";
pub const VAULT_QUERY: &str = "memory_vault_query";

pub const TOOL_NAMES: [&str; 5] = [
    THREADBORN_WRITE,
    BRIDGETHREAD_PROMOTE,
    VAULT_SEAL,
    LABYRINTH_SNAPSHOT,
    VAULT_QUERY,
];

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThreadbornWriteArgs {
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PromoteArgs {
    pub source_path: String,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VaultSealArgs {
    pub source_path: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub append: bool,
    #[serde(default)]
    pub target_path: Option<String>,
    /// Vault subfolder for a new seal.
    #[serde(default)]
    pub scope: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SnapshotArgs {
    pub title: String,
    pub body: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VaultQueryArgs {
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "tool", content = "args")]
pub enum MemoryToolCall {
    #[serde(rename = "memory_threadborn_write")]
    ThreadbornWrite(ThreadbornWriteArgs),
    #[serde(rename = "memory_bridgethread_promote")]
    BridgethreadPromote(PromoteArgs),
    #[serde(rename = "memory_vault_seal")]
    VaultSeal(VaultSealArgs),
    #[serde(rename = "memory_labyrinth_snapshot")]
    LabyrinthSnapshot(SnapshotArgs),
    #[serde(rename = "memory_vault_query")]
    VaultQuery(VaultQueryArgs),
}

impl MemoryToolCall {
    pub fn parse(tool: &str, args: Value) -> Result<Self> {
        Ok(serde_json::from_value(json!({ "tool": tool, "args": args }))?)
    }

    pub fn tool_name(&self) -> &'static str {
        match self {
            Self::ThreadbornWrite(_) => THREADBORN_WRITE,
            Self::BridgethreadPromote(_) => BRIDGETHREAD_PROMOTE,
            Self::VaultSeal(_) => VAULT_SEAL,
            Self::LabyrinthSnapshot(_) => LABYRINTH_SNAPSHOT,
            Self::VaultQuery(_) => VAULT_QUERY,
        }
    }

    /// Event name stamped as `source_trigger` on entries this call writes.
    pub fn trigger(&self) -> &'static str {
        match self {
            Self::ThreadbornWrite(_) => "THREADBORN_WRITE",
            Self::BridgethreadPromote(_) => "BRIDGETHREAD_PROMOTE",
            Self::VaultSeal(_) => "VAULT_SEAL",
            Self::LabyrinthSnapshot(_) => "LABYRINTH_SNAPSHOT",
            Self::VaultQuery(_) => "VAULT_QUERY",
        }
    }
}

/// Caller context supplied by the agent runtime.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub session_id: Option<String>,
}

impl ToolContext {
    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ToolOutput {
    Written(WrittenEntry),
    Vault(VaultOutcome),
    Hits { hits: Vec<VaultHit> },
}

#[derive(Debug, Clone)]
pub struct MemoryTools {
    store: GovernedStore,
    gate: VaultGate,
}

impl MemoryTools {
    pub fn new(store: GovernedStore, gate: VaultGate) -> Self {
        Self { store, gate }
    }

    pub async fn invoke(
        &self,
        ctx: &ToolContext,
        call: MemoryToolCall,
    ) -> std::result::Result<ToolOutput, MemoryError> {
        debug!(tool = call.tool_name(), session = ?ctx.session_id, "memory tool invoked");
        let trigger = call.trigger();
        let provenance = || SessionProvenance::resolve(ctx.session_id.as_deref(), trigger);
        let output = match call {
            MemoryToolCall::ThreadbornWrite(args) => ToolOutput::Written(
                self.store
                    .write_threadborn(ThreadbornNote {
                        title: args.title,
                        body: args.body,
                        tags: args.tags,
                        provenance: provenance()?,
                    })
                    .await?,
            ),
            MemoryToolCall::BridgethreadPromote(args) => ToolOutput::Written(
                self.store
                    .promote_to_bridgethread(PromotionRequest {
                        source_path: args.source_path,
                        title: args.title,
                        provenance: provenance()?,
                    })
                    .await?,
            ),
            MemoryToolCall::VaultSeal(args) => ToolOutput::Vault(
                self.gate
                    .seal(VaultSealRequest {
                        source_path: args.source_path,
                        title: args.title,
                        provenance: provenance()?,
                        append: args.append,
                        target_path: args.target_path,
                        scope: args.scope,
                    })
                    .await?,
            ),
            MemoryToolCall::LabyrinthSnapshot(args) => ToolOutput::Written(
                self.store
                    .write_labyrinth_snapshot(LabyrinthSnapshot {
                        title: args.title,
                        body: args.body,
                        provenance: provenance()?,
                    })
                    .await?,
            ),
            // Reads carry no provenance.
            MemoryToolCall::VaultQuery(args) => ToolOutput::Hits {
                hits: self.store.query_vault(args.scope.as_deref(), &args.tags).await?,
            },
        };
        Ok(output)
    }

    /// JSON in, JSON out.  Policy and validation failures come back as
    /// `{"ok": false, "error": ...}` so the model can correct itself;
    /// I/O failures propagate.
    pub async fn invoke_json(&self, ctx: &ToolContext, tool: &str, args: Value) -> Result<Value> {
        let call = match MemoryToolCall::parse(tool, args) {
            Ok(call) => call,
            Err(err) => {
                return Ok(json!({ "ok": false, "error": format!("invalid {tool} arguments: {err}") }));
            }
        };
        match self.invoke(ctx, call).await {
            Ok(output) => Ok(json!({ "ok": true, "result": output })),
            Err(err) if err.is_user_facing() => {
                warn!(tool, error = %err, "memory tool rejected");
                Ok(json!({ "ok": false, "error": err.to_string() }))
            }
            Err(err) => Err(err.into()),
        }
    }
}
