//! Per-session SANI / Labyrinth mode state machine.
//!
//! Modes flip on trigger lines, clear on an explicit exit, and expire lazily
//! once `now - lastModeUpdateAt` exceeds the configured TTL.  Expiry is only
//! evaluated when a session's flags are read; there is no background sweep.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use sani_config::PersonaConfig;
use sani_memory::schema::{stamp, truncate_str};
use sani_memory::{GovernedStore, LabyrinthSnapshot, SessionProvenance, ThreadbornNote, WrittenEntry};

use crate::session::{ModeFlags, SessionEntry, SessionMessage, SessionStore};
use crate::triggers::{Trigger, TriggerSet, detect_triggers};

/// `source_trigger` on entries written when modes expire.
pub const TTL_EXPIRED_TRIGGER: &str = "MODE_TTL_EXPIRED";
pub const TTL_TAG: &str = "sani:ttl";
pub const EXIT_TAG: &str = "sani:exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeSettings {
    pub enabled: bool,
    /// `None` disables expiry.
    pub ttl: Option<Duration>,
    pub snapshot_message_limit: usize,
    pub snapshot_message_chars: usize,
}

impl Default for ModeSettings {
    fn default() -> Self {
        Self::from_config(&PersonaConfig::default())
    }
}

impl ModeSettings {
    pub fn from_config(config: &PersonaConfig) -> Self {
        Self {
            enabled: config.enabled,
            ttl: (config.mode_ttl_minutes > 0)
                .then_some(config.mode_ttl_minutes)
                .and_then(Duration::try_minutes),
            snapshot_message_limit: config.snapshot_message_limit,
            snapshot_message_chars: config.snapshot_message_chars,
        }
    }

    fn ttl_minutes(&self) -> i64 {
        self.ttl.map(|ttl| ttl.num_minutes()).unwrap_or(0)
    }
}

/// One inbound message as delivered by a channel adapter.
#[derive(Debug, Clone, Default)]
pub struct InboundMessage {
    pub session_key: String,
    pub channel: Option<String>,
    pub sender: Option<String>,
    pub text: String,
    /// Prior turns of the session, oldest first.  When empty, snapshots
    /// fall back to the transcript kept by the session store.
    pub recent_messages: Vec<SessionMessage>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "transition", rename_all = "snake_case")]
pub enum ModeTransition {
    Expired {
        previous: ModeFlags,
        audit: Option<WrittenEntry>,
    },
    SaniActivated,
    LabyrinthActivated {
        snapshot: Option<WrittenEntry>,
    },
    Exited {
        previous: ModeFlags,
        audit: Option<WrittenEntry>,
    },
}

pub struct ModeController {
    sessions: Arc<dyn SessionStore>,
    memory: GovernedStore,
    settings: ModeSettings,
}

impl std::fmt::Debug for ModeController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModeController")
            .field("memory", &self.memory)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl ModeController {
    pub fn new(sessions: Arc<dyn SessionStore>, memory: GovernedStore, settings: ModeSettings) -> Self {
        Self {
            sessions,
            memory,
            settings,
        }
    }

    pub fn settings(&self) -> &ModeSettings {
        &self.settings
    }

    /// Current flags for `session_key`, expiring stale modes first.
    pub async fn read_flags(&self, session_key: &str) -> Result<ModeFlags> {
        Ok(self.read_with_expiry(session_key).await?.0)
    }

    async fn read_with_expiry(
        &self,
        session_key: &str,
    ) -> Result<(ModeFlags, Option<ModeTransition>)> {
        let Some(entry) = self.sessions.load(session_key).await? else {
            return Ok((ModeFlags::default(), None));
        };
        let now = self.memory.now();
        if !self.is_stale(&entry, now) {
            return Ok((entry.flags(), None));
        }

        // Re-check inside the update so a concurrent activation is not clobbered.
        let expired: Arc<Mutex<Option<(ModeFlags, Option<DateTime<Utc>>)>>> =
            Arc::new(Mutex::new(None));
        let slot = Arc::clone(&expired);
        let ttl = self.settings.ttl;
        let updated = self
            .sessions
            .update_entry(
                session_key,
                Box::new(move |entry: &mut SessionEntry| {
                    if !stale_at(entry, ttl, now) {
                        return;
                    }
                    if let Ok(mut slot) = slot.lock() {
                        *slot = Some((entry.flags(), entry.last_mode_update_at));
                    }
                    entry.sani_mode = false;
                    entry.labyrinth_mode = false;
                    entry.last_mode_update_at = Some(now);
                }),
            )
            .await?;

        let cleared = expired.lock().ok().and_then(|mut slot| slot.take());
        let Some((previous, last_update)) = cleared else {
            return Ok((updated.flags(), None));
        };
        info!(
            session = session_key,
            sani_mode = previous.sani_mode,
            labyrinth_mode = previous.labyrinth_mode,
            ttl_minutes = self.settings.ttl_minutes(),
            "session modes expired"
        );
        let audit = self
            .record_expiry(session_key, &updated, previous, last_update, now)
            .await;
        Ok((updated.flags(), Some(ModeTransition::Expired { previous, audit })))
    }

    fn is_stale(&self, entry: &SessionEntry, now: DateTime<Utc>) -> bool {
        stale_at(entry, self.settings.ttl, now)
    }

    async fn record_expiry(
        &self,
        session_key: &str,
        entry: &SessionEntry,
        previous: ModeFlags,
        last_update: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<WrittenEntry> {
        let body = format!(
            "Session modes cleared after inactivity.\n\n\
             - Session key: {session_key}\n\
             - Previous saniMode: {}\n\
             - Previous labyrinthMode: {}\n\
             - Last mode update: {}\n\
             - TTL minutes: {}\n\
             - Expired at: {}\n",
            previous.sani_mode,
            previous.labyrinth_mode,
            last_update.map(stamp).unwrap_or_else(|| "unknown".to_string()),
            self.settings.ttl_minutes(),
            stamp(now),
        );
        let note = ThreadbornNote {
            title: "SANI mode expired".to_string(),
            body,
            tags: vec![TTL_TAG.to_string()],
            provenance: SessionProvenance::new(session_id_of(entry, session_key), TTL_EXPIRED_TRIGGER),
        };
        match self.memory.write_threadborn(note).await {
            Ok(written) => Some(written),
            Err(err) => {
                debug!(
                    target: "sani::diagnostics",
                    session = session_key,
                    error = %err,
                    "failed to record mode expiry"
                );
                None
            }
        }
    }

    /// Apply the trigger lines in `message` to its session.
    ///
    /// An exit line wins over activations in the same message.
    pub async fn handle_inbound(&self, message: &InboundMessage) -> Result<Vec<ModeTransition>> {
        if !self.settings.enabled {
            return Ok(Vec::new());
        }

        let mut transitions = Vec::new();
        let (flags, expired) = self.read_with_expiry(&message.session_key).await?;
        transitions.extend(expired);

        let triggers = detect_triggers(&message.text);
        if triggers.is_empty() {
            return Ok(transitions);
        }

        if triggers.exit_sani_mode {
            transitions.push(self.exit(message, flags).await?);
            return Ok(transitions);
        }

        transitions.extend(self.activate(message, triggers).await?);
        Ok(transitions)
    }

    /// Add the inbound text to the session transcript that later snapshots
    /// read from.  Failures are logged, never raised.
    pub async fn record_turn(&self, message: &InboundMessage, keep: usize) {
        let turn = SessionMessage::new("user", message.text.trim());
        if let Err(err) = self
            .sessions
            .record_message(&message.session_key, turn, keep)
            .await
        {
            warn!(session = %message.session_key, error = %err, "session transcript not updated");
        }
    }

    async fn exit(&self, message: &InboundMessage, previous: ModeFlags) -> Result<ModeTransition> {
        let now = self.memory.now();
        let entry = self
            .sessions
            .update_entry(
                &message.session_key,
                Box::new(move |entry: &mut SessionEntry| {
                    entry.sani_mode = false;
                    entry.labyrinth_mode = false;
                    entry.last_mode_update_at = Some(now);
                }),
            )
            .await?;
        info!(session = %message.session_key, "sani mode exited");

        let body = format!(
            "Session left SANI mode on request.\n\n\
             - Session key: {}\n\
             - Channel: {}\n\
             - Sender: {}\n\
             - Previous saniMode: {}\n\
             - Previous labyrinthMode: {}\n\
             - Exited at: {}\n",
            message.session_key,
            message.channel.as_deref().unwrap_or("unknown"),
            message.sender.as_deref().unwrap_or("unknown"),
            previous.sani_mode,
            previous.labyrinth_mode,
            stamp(now),
        );
        let note = ThreadbornNote {
            title: "SANI mode exit".to_string(),
            body,
            tags: vec![EXIT_TAG.to_string()],
            provenance: SessionProvenance::new(
                session_id_of(&entry, &message.session_key),
                Trigger::ExitSaniMode.event_name(),
            ),
        };
        let audit = match self.memory.write_threadborn(note).await {
            Ok(written) => Some(written),
            Err(err) => {
                warn!(session = %message.session_key, error = %err, "failed to record sani exit");
                None
            }
        };
        Ok(ModeTransition::Exited { previous, audit })
    }

    async fn activate(
        &self,
        message: &InboundMessage,
        triggers: TriggerSet,
    ) -> Result<Vec<ModeTransition>> {
        let now = self.memory.now();
        let entry = self
            .sessions
            .update_entry(
                &message.session_key,
                Box::new(move |entry: &mut SessionEntry| {
                    if triggers.hey_sani {
                        entry.sani_mode = true;
                    }
                    if triggers.who_am_i {
                        entry.labyrinth_mode = true;
                    }
                    entry.last_mode_update_at = Some(now);
                }),
            )
            .await?;

        let mut transitions = Vec::new();
        if triggers.hey_sani {
            info!(session = %message.session_key, "sani mode activated");
            transitions.push(ModeTransition::SaniActivated);
        }
        if triggers.who_am_i {
            info!(session = %message.session_key, "labyrinth mode activated");
            let snapshot = self.snapshot(message, &entry, now).await;
            transitions.push(ModeTransition::LabyrinthActivated { snapshot });
        }
        Ok(transitions)
    }

    async fn snapshot(
        &self,
        message: &InboundMessage,
        entry: &SessionEntry,
        now: DateTime<Utc>,
    ) -> Option<WrittenEntry> {
        let recent = if message.recent_messages.is_empty() {
            self.sessions
                .recent_messages(&message.session_key, self.settings.snapshot_message_limit)
                .await
                .unwrap_or_else(|err| {
                    warn!(session = %message.session_key, error = %err, "session transcript unavailable");
                    Vec::new()
                })
        } else {
            message.recent_messages.clone()
        };
        let snapshot = LabyrinthSnapshot {
            title: "Who am I".to_string(),
            body: render_snapshot(message, &recent, entry.flags(), now, &self.settings),
            provenance: SessionProvenance::new(
                session_id_of(entry, &message.session_key),
                Trigger::WhoAmI.event_name(),
            ),
        };
        match self.memory.write_labyrinth_snapshot(snapshot).await {
            Ok(written) => Some(written),
            Err(err) => {
                warn!(session = %message.session_key, error = %err, "labyrinth snapshot not written");
                None
            }
        }
    }
}

fn stale_at(entry: &SessionEntry, ttl: Option<Duration>, now: DateTime<Utc>) -> bool {
    let Some(ttl) = ttl else {
        return false;
    };
    if !entry.flags().any() {
        return false;
    }
    match entry.last_mode_update_at {
        Some(at) => now - at > ttl,
        // Modes set with no timestamp cannot be aged; treat them as stale.
        None => true,
    }
}

fn session_id_of<'a>(entry: &'a SessionEntry, session_key: &'a str) -> &'a str {
    if entry.session_id.trim().is_empty() {
        session_key
    } else {
        &entry.session_id
    }
}

fn render_snapshot(
    message: &InboundMessage,
    recent: &[SessionMessage],
    flags: ModeFlags,
    now: DateTime<Utc>,
    settings: &ModeSettings,
) -> String {
    let mut body = format!(
        "- Timestamp: {}\n\
         - Channel: {}\n\
         - Sender: {}\n\
         - Session key: {}\n\
         - saniMode: {}\n\
         - labyrinthMode: {}\n\n\
         ## Recent messages\n",
        stamp(now),
        message.channel.as_deref().unwrap_or("unknown"),
        message.sender.as_deref().unwrap_or("unknown"),
        message.session_key,
        flags.sani_mode,
        flags.labyrinth_mode,
    );

    let mut recent: Vec<&SessionMessage> = recent
        .iter()
        .rev()
        .take(settings.snapshot_message_limit)
        .collect();
    recent.reverse();

    if recent.is_empty() {
        body.push_str("(none)\n");
    }
    for msg in recent {
        let text = msg.text.trim().replace('\n', " ");
        let clipped = truncate_str(&text, settings.snapshot_message_chars);
        let ellipsis = if clipped.len() < text.len() { "…" } else { "" };
        body.push_str(&format!("- {}: {clipped}{ellipsis}\n", msg.role));
    }
    body
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use sani_memory::codec;
    use tempfile::TempDir;

    use super::*;
    use crate::session::JsonFileSessionStore;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 8, 15, 2).unwrap()
    }

    struct Harness {
        dir: TempDir,
        sessions: Arc<JsonFileSessionStore>,
        controller: ModeController,
    }

    fn harness(settings: ModeSettings) -> Harness {
        let dir = TempDir::new().unwrap();
        let sessions = Arc::new(JsonFileSessionStore::new(dir.path().join(".sani/sessions.json")));
        let memory = GovernedStore::new(dir.path()).with_clock(Arc::new(fixed_now));
        let controller = ModeController::new(sessions.clone(), memory, settings);
        Harness {
            dir,
            sessions,
            controller,
        }
    }

    fn message(text: &str) -> InboundMessage {
        InboundMessage {
            session_key: "main".to_string(),
            channel: Some("telegram".to_string()),
            sender: Some("ana".to_string()),
            text: text.to_string(),
            recent_messages: Vec::new(),
        }
    }

    fn tier_files(dir: &TempDir, tier: &str) -> Vec<String> {
        let path = dir.path().join("memory").join(tier);
        if !path.exists() {
            return Vec::new();
        }
        let mut files: Vec<String> = std::fs::read_dir(path)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
            .map(|e| std::fs::read_to_string(e.path()).unwrap())
            .collect();
        files.sort();
        files
    }

    #[test]
    fn non_positive_ttl_disables_expiry() {
        let mut cfg = PersonaConfig::default();
        assert_eq!(ModeSettings::from_config(&cfg).ttl, Some(Duration::minutes(720)));
        cfg.mode_ttl_minutes = 0;
        assert_eq!(ModeSettings::from_config(&cfg).ttl, None);
        cfg.mode_ttl_minutes = -5;
        assert_eq!(ModeSettings::from_config(&cfg).ttl, None);
    }

    #[tokio::test]
    async fn ttl_expiry_clears_modes_and_leaves_a_note() {
        let settings = ModeSettings {
            ttl: Some(Duration::minutes(1)),
            ..ModeSettings::default()
        };
        let h = harness(settings);
        h.sessions
            .update_entry(
                "main",
                Box::new(|e: &mut SessionEntry| {
                    e.sani_mode = true;
                    e.labyrinth_mode = true;
                    e.last_mode_update_at = Some(fixed_now() - Duration::minutes(2));
                }),
            )
            .await
            .unwrap();

        let flags = h.controller.read_flags("main").await.unwrap();
        assert_eq!(flags, ModeFlags::default());

        let stored = h.sessions.load("main").await.unwrap().unwrap();
        assert!(!stored.sani_mode && !stored.labyrinth_mode);

        let notes = tier_files(&h.dir, "ThreadBorn");
        assert_eq!(notes.len(), 1);
        let decoded = codec::decode(&notes[0]);
        assert_eq!(decoded.metadata.source_trigger.as_deref(), Some(TTL_EXPIRED_TRIGGER));
        assert!(decoded.body.contains("Tags: sani:ttl"));
        assert!(decoded.body.contains("- Previous saniMode: true"));
        assert!(decoded.body.contains("- Previous labyrinthMode: true"));
        assert!(decoded.body.contains("- TTL minutes: 1"));

        // A second read finds nothing stale and writes nothing.
        h.controller.read_flags("main").await.unwrap();
        assert_eq!(tier_files(&h.dir, "ThreadBorn").len(), 1);
    }

    #[tokio::test]
    async fn fresh_modes_survive_reads() {
        let h = harness(ModeSettings {
            ttl: Some(Duration::minutes(10)),
            ..ModeSettings::default()
        });
        h.sessions
            .update_entry(
                "main",
                Box::new(|e: &mut SessionEntry| {
                    e.sani_mode = true;
                    e.last_mode_update_at = Some(fixed_now() - Duration::minutes(9));
                }),
            )
            .await
            .unwrap();
        let flags = h.controller.read_flags("main").await.unwrap();
        assert!(flags.sani_mode);
        assert!(tier_files(&h.dir, "ThreadBorn").is_empty());
    }

    #[tokio::test]
    async fn disabled_ttl_keeps_modes_forever() {
        let h = harness(ModeSettings {
            ttl: None,
            ..ModeSettings::default()
        });
        h.sessions
            .update_entry(
                "main",
                Box::new(|e: &mut SessionEntry| {
                    e.labyrinth_mode = true;
                    e.last_mode_update_at = Some(fixed_now() - Duration::days(365));
                }),
            )
            .await
            .unwrap();
        assert!(h.controller.read_flags("main").await.unwrap().labyrinth_mode);
    }

    #[tokio::test]
    async fn hey_sani_activates_without_memory_writes() {
        let h = harness(ModeSettings::default());
        let transitions = h.controller.handle_inbound(&message("Hey Sani!")).await.unwrap();
        assert!(matches!(transitions.as_slice(), [ModeTransition::SaniActivated]));

        let stored = h.sessions.load("main").await.unwrap().unwrap();
        assert!(stored.sani_mode);
        assert!(!stored.labyrinth_mode);
        assert_eq!(stored.last_mode_update_at, Some(fixed_now()));
        assert!(!h.dir.path().join("memory").exists());
    }

    #[tokio::test]
    async fn quoted_trigger_changes_nothing() {
        let h = harness(ModeSettings::default());
        let transitions = h.controller.handle_inbound(&message("> hey sani")).await.unwrap();
        assert!(transitions.is_empty());
        assert!(h.sessions.load("main").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn who_am_i_writes_a_snapshot_with_recent_messages() {
        let settings = ModeSettings {
            snapshot_message_limit: 2,
            snapshot_message_chars: 5,
            ..ModeSettings::default()
        };
        let h = harness(settings);
        let mut msg = message("who am i");
        msg.recent_messages = vec![
            SessionMessage::new("user", "oldest message"),
            SessionMessage::new("assistant", "hi"),
            SessionMessage::new("user", "newest message"),
        ];

        let transitions = h.controller.handle_inbound(&msg).await.unwrap();
        let [ModeTransition::LabyrinthActivated { snapshot: Some(snapshot) }] =
            transitions.as_slice()
        else {
            panic!("expected a labyrinth activation with snapshot, got {transitions:?}");
        };
        assert!(snapshot.path.starts_with("memory/Labyrinth/"));
        assert_eq!(snapshot.metadata.source_trigger, "WHO_AM_I");

        let snapshots = tier_files(&h.dir, "Labyrinth");
        assert_eq!(snapshots.len(), 1);
        let body = codec::decode(&snapshots[0]).body;
        assert!(body.contains("- Channel: telegram"));
        assert!(body.contains("- Sender: ana"));
        assert!(body.contains("- Session key: main"));
        assert!(body.contains("- labyrinthMode: true"));
        assert!(!body.contains("oldest"));
        let hi = body.find("- assistant: hi\n").unwrap();
        let newest = body.find("- user: newes…\n").unwrap();
        assert!(hi < newest, "messages render oldest to newest");
    }

    #[tokio::test]
    async fn snapshot_falls_back_to_the_session_transcript() {
        let settings = ModeSettings {
            snapshot_message_limit: 2,
            ..ModeSettings::default()
        };
        let h = harness(settings);
        for text in ["first turn", "second turn", "third turn"] {
            h.sessions
                .record_message("main", SessionMessage::new("user", text), 20)
                .await
                .unwrap();
        }

        h.controller.handle_inbound(&message("who am i")).await.unwrap();
        let snapshots = tier_files(&h.dir, "Labyrinth");
        assert_eq!(snapshots.len(), 1);
        let body = codec::decode(&snapshots[0]).body;
        assert!(!body.contains("(none)"));
        assert!(!body.contains("first turn"));
        let second = body.find("- user: second turn\n").unwrap();
        let third = body.find("- user: third turn\n").unwrap();
        assert!(second < third);
    }

    #[tokio::test]
    async fn exit_wins_and_records_previous_state() {
        let h = harness(ModeSettings::default());
        h.controller.handle_inbound(&message("hey sani")).await.unwrap();

        let transitions = h
            .controller
            .handle_inbound(&message("who am i\nexit sani mode"))
            .await
            .unwrap();
        let [ModeTransition::Exited { previous, audit: Some(_) }] = transitions.as_slice() else {
            panic!("expected a single exit, got {transitions:?}");
        };
        assert!(previous.sani_mode);

        let stored = h.sessions.load("main").await.unwrap().unwrap();
        assert_eq!(stored.flags(), ModeFlags::default());
        assert!(tier_files(&h.dir, "Labyrinth").is_empty());

        let notes = tier_files(&h.dir, "ThreadBorn");
        assert_eq!(notes.len(), 1);
        assert!(notes[0].contains("Tags: sani:exit"));
        assert!(notes[0].contains("source_trigger: \"EXIT_SANI_MODE\""));
    }

    #[tokio::test]
    async fn disabled_persona_ignores_triggers() {
        let h = harness(ModeSettings {
            enabled: false,
            ..ModeSettings::default()
        });
        let transitions = h.controller.handle_inbound(&message("hey sani")).await.unwrap();
        assert!(transitions.is_empty());
        assert!(h.sessions.load("main").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn other_session_fields_are_untouched() {
        let h = harness(ModeSettings::default());
        h.sessions
            .update_entry(
                "main",
                Box::new(|e: &mut SessionEntry| {
                    e.extra.insert("model".to_string(), serde_json::json!("local"));
                }),
            )
            .await
            .unwrap();
        h.controller.handle_inbound(&message("hey sani")).await.unwrap();
        let stored = h.sessions.load("main").await.unwrap().unwrap();
        assert_eq!(stored.extra.get("model"), Some(&serde_json::json!("local")));
    }
}
