use std::sync::Arc;

use anyhow::Result;

use sani_config::AppConfig;
use sani_memory::GovernedStore;
use sani_runtime::{
    InboundMessage, InboundPipeline, InjectionAttempt, InjectionAuditLogger, InjectionDetector,
    JsonFileSessionStore, ModeController, ModeSettings, SessionStore,
};

fn session_store(store: &GovernedStore, config: &AppConfig) -> Arc<dyn SessionStore> {
    Arc::new(JsonFileSessionStore::new(
        store.workspace().join(&config.session.store_path),
    ))
}

pub(crate) async fn run_scan(
    store: &GovernedStore,
    config: &AppConfig,
    text: &str,
    channel: Option<&str>,
    audit: bool,
    session: Option<&str>,
) -> Result<()> {
    let detector = InjectionDetector::from_config(config);
    let matches = detector.detect(text, channel);
    if matches.is_empty() {
        println!("clean: no injection patterns matched");
        return Ok(());
    }
    for m in &matches {
        println!("{:<26} {}", m.id, m.label);
    }

    if audit {
        let logger = InjectionAuditLogger::new(store.clone(), config.security.injection_audit_enabled);
        let attempt = InjectionAttempt {
            session_key: session,
            channel,
            raw_input: text,
            matches: &matches,
        };
        match logger.log_attempt(attempt).await {
            Some(path) => println!("audit record: {path}"),
            None => println!("audit record not written (disabled or failed; see logs)"),
        }
    }
    Ok(())
}

pub(crate) async fn run_modes(store: &GovernedStore, config: &AppConfig, session_key: &str) -> Result<()> {
    let modes = ModeController::new(
        session_store(store, config),
        store.clone(),
        ModeSettings::from_config(&config.persona),
    );
    let flags = modes.read_flags(session_key).await?;
    println!("session: {session_key}");
    println!("saniMode: {}", flags.sani_mode);
    println!("labyrinthMode: {}", flags.labyrinth_mode);
    Ok(())
}

pub(crate) async fn run_inbound(
    store: &GovernedStore,
    config: &AppConfig,
    session_key: String,
    text: String,
    channel: Option<String>,
    sender: Option<String>,
) -> Result<()> {
    let pipeline = InboundPipeline::from_config(config, store.clone(), session_store(store, config));
    let message = InboundMessage {
        session_key,
        channel,
        sender,
        text,
        recent_messages: Vec::new(),
    };
    let report = pipeline.handle(&message).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
