use anyhow::Result;
use serde::Serialize;

use sani_config::AppConfig;
use sani_memory::{
    GovernedStore, LabyrinthSnapshot, PromotionRequest, SessionProvenance, ThreadbornNote,
    VaultOutcome, VaultSealRequest,
};
use sani_runtime::{SealingPolicy, VaultGate};

pub(crate) struct SealArgs {
    pub source: String,
    pub title: Option<String>,
    pub append: bool,
    pub target: Option<String>,
    pub scope: Option<String>,
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub(crate) async fn run_note(
    store: &GovernedStore,
    title: String,
    body: String,
    tags: Vec<String>,
    session: &str,
) -> Result<()> {
    let entry = store
        .write_threadborn(ThreadbornNote {
            title,
            body,
            tags,
            provenance: SessionProvenance::resolve(Some(session), "CLI_NOTE")?,
        })
        .await?;
    print_json(&entry)
}

pub(crate) async fn run_promote(
    store: &GovernedStore,
    source: String,
    title: Option<String>,
    session: &str,
) -> Result<()> {
    let entry = store
        .promote_to_bridgethread(PromotionRequest {
            source_path: source,
            title,
            provenance: SessionProvenance::resolve(Some(session), "CLI_PROMOTE")?,
        })
        .await?;
    print_json(&entry)
}

pub(crate) async fn run_seal(
    store: &GovernedStore,
    config: &AppConfig,
    toggle: Option<bool>,
    args: SealArgs,
    session: &str,
) -> Result<()> {
    let gate = VaultGate::new(store.clone(), SealingPolicy::from_config(&config.vault, toggle));
    let outcome = gate
        .seal(VaultSealRequest {
            source_path: args.source,
            title: args.title,
            provenance: SessionProvenance::resolve(Some(session), "VAULT_SEAL")?,
            append: args.append,
            target_path: args.target,
            scope: args.scope,
        })
        .await?;
    match &outcome {
        VaultOutcome::Sealed(entry) => println!("sealed {}", entry.path),
        VaultOutcome::Appended(appended) => {
            println!("appended {} to {}", appended.source_path, appended.path)
        }
    }
    print_json(&outcome)
}

pub(crate) async fn run_snapshot(
    store: &GovernedStore,
    title: String,
    body: String,
    session: &str,
) -> Result<()> {
    let entry = store
        .write_labyrinth_snapshot(LabyrinthSnapshot {
            title,
            body,
            provenance: SessionProvenance::resolve(Some(session), "CLI_SNAPSHOT")?,
        })
        .await?;
    print_json(&entry)
}

pub(crate) async fn run_query(
    store: &GovernedStore,
    scope: Option<&str>,
    tags: &[String],
) -> Result<()> {
    let hits = store.query_vault(scope, tags).await?;
    if hits.is_empty() {
        println!("no vault entries matched");
        return Ok(());
    }
    for hit in hits {
        println!("{}  {}", hit.path, hit.title);
        for line in &hit.preview {
            println!("    {line}");
        }
    }
    Ok(())
}
