pub mod injection;
pub mod modes;
pub mod pipeline;
pub mod session;
pub mod tools;
pub mod triggers;
pub mod vault_gate;

pub use injection::{
    InjectionAttempt, InjectionAuditLogger, InjectionDetector, InjectionPattern, PatternMatch,
    PatternScope,
};
pub use modes::{InboundMessage, ModeController, ModeSettings, ModeTransition};
pub use pipeline::{InboundPipeline, InboundReport};
pub use session::{JsonFileSessionStore, ModeFlags, SessionEntry, SessionMessage, SessionStore};
pub use tools::{MemoryToolCall, MemoryTools, ToolContext, ToolOutput};
pub use triggers::{Trigger, TriggerSet, detect_triggers, matches_trigger};
pub use vault_gate::{SealingPolicy, VaultGate};
