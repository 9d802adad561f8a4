use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tracing::debug;

use sani_config::AppConfig;
use sani_memory::GovernedStore;

use crate::injection::{InjectionAttempt, InjectionAuditLogger, InjectionDetector, PatternMatch};
use crate::modes::{InboundMessage, ModeController, ModeSettings, ModeTransition};
use crate::session::{ModeFlags, SessionStore};

/// What happened to one inbound message.
#[derive(Debug, Clone, Serialize)]
pub struct InboundReport {
    pub matches: Vec<PatternMatch>,
    /// Workspace-relative path of the injection audit record, if one was written.
    pub audit_path: Option<String>,
    pub transitions: Vec<ModeTransition>,
    pub flags: ModeFlags,
}

/// Injection screening followed by mode handling for each inbound message.
///
/// Screening never blocks: detected patterns are audited and the message
/// still reaches the mode machine.  Clean messages are then added to the
/// session transcript; flagged ones are kept out of it.
#[derive(Debug)]
pub struct InboundPipeline {
    detector: InjectionDetector,
    audit: InjectionAuditLogger,
    modes: ModeController,
    transcript_limit: usize,
}

impl InboundPipeline {
    pub fn new(detector: InjectionDetector, audit: InjectionAuditLogger, modes: ModeController) -> Self {
        Self {
            detector,
            audit,
            modes,
            transcript_limit: 0,
        }
    }

    /// Keep up to `limit` inbound turns per session; 0 records nothing.
    pub fn with_transcript_limit(mut self, limit: usize) -> Self {
        self.transcript_limit = limit;
        self
    }

    pub fn from_config(config: &AppConfig, memory: GovernedStore, sessions: Arc<dyn SessionStore>) -> Self {
        let detector = InjectionDetector::from_config(config);
        let audit = InjectionAuditLogger::new(memory.clone(), config.security.injection_audit_enabled);
        let modes = ModeController::new(sessions, memory, ModeSettings::from_config(&config.persona));
        Self::new(detector, audit, modes).with_transcript_limit(config.session.transcript_limit)
    }

    pub fn modes(&self) -> &ModeController {
        &self.modes
    }

    pub async fn handle(&self, message: &InboundMessage) -> Result<InboundReport> {
        let channel = message.channel.as_deref();
        let matches = self.detector.detect(&message.text, channel);
        let audit_path = self
            .audit
            .log_attempt(InjectionAttempt {
                session_key: Some(message.session_key.as_str()),
                channel,
                raw_input: &message.text,
                matches: &matches,
            })
            .await;

        let transitions = self.modes.handle_inbound(message).await?;
        if matches.is_empty() && self.transcript_limit > 0 {
            self.modes.record_turn(message, self.transcript_limit).await;
        }
        let flags = self.modes.read_flags(&message.session_key).await?;
        debug!(
            session = %message.session_key,
            matches = matches.len(),
            transitions = transitions.len(),
            "inbound message handled"
        );
        Ok(InboundReport {
            matches,
            audit_path,
            transitions,
            flags,
        })
    }
}
