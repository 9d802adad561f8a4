//! Governed memory store: the only component that creates entry files, and
//! (through the Vault append path) the only one that ever mutates one.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::info;
use uuid::Uuid;

use crate::allocator::{ENTRY_EXTENSION, create_unique};
use crate::codec::{self, DecodedEntry};
use crate::error::{MemoryError, Result};
use crate::query::derive_title;
use crate::sandbox;
use crate::schema::{
    EntryMetadata, LinkKind, MemoryType, ProvenanceLink, SessionProvenance, filename_base, stamp,
};

/// Source of "now".  Injectable so collision and expiry behaviour is testable.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

/// A freshly written entry, as reported back to tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrittenEntry {
    pub id: String,
    /// Workspace-relative, forward-slash path.
    pub path: String,
    pub filename: String,
    pub metadata: EntryMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendedEntry {
    pub path: String,
    pub filename: String,
    pub source_path: String,
    pub appended_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum VaultOutcome {
    Sealed(WrittenEntry),
    Appended(AppendedEntry),
}

#[derive(Debug, Clone)]
pub struct ThreadbornNote {
    pub title: String,
    pub body: String,
    pub tags: Vec<String>,
    pub provenance: SessionProvenance,
}

#[derive(Debug, Clone)]
pub struct PromotionRequest {
    pub source_path: String,
    pub title: Option<String>,
    pub provenance: SessionProvenance,
}

#[derive(Debug, Clone)]
pub struct VaultSealRequest {
    pub source_path: String,
    pub title: Option<String>,
    pub provenance: SessionProvenance,
    pub append: bool,
    pub target_path: Option<String>,
    /// Optional Vault subdirectory for new seals (`identity`, `decisions`, …).
    pub scope: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LabyrinthSnapshot {
    pub title: String,
    pub body: String,
    pub provenance: SessionProvenance,
}

struct NewEntry<'a> {
    tier: MemoryType,
    dir: PathBuf,
    title: &'a str,
    /// Explicit filename base; defaults to `<timestamp>-<slug(title)>`.
    base: Option<&'a str>,
    body: String,
    provenance: &'a SessionProvenance,
    link: Option<ProvenanceLink>,
    allow_suffix: bool,
}

/// Append-only open: never truncates, never creates.
async fn append_durably(path: &Path, text: &str) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new().append(true).open(path).await?;
    file.write_all(text.as_bytes()).await?;
    file.flush().await?;
    file.sync_all().await
}

#[derive(Clone)]
pub struct GovernedStore {
    workspace: PathBuf,
    clock: Clock,
}

impl std::fmt::Debug for GovernedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GovernedStore")
            .field("workspace", &self.workspace)
            .finish_non_exhaustive()
    }
}

impl GovernedStore {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Workspace-relative display form of an absolute path.
    pub fn display_path(&self, path: &Path) -> String {
        sandbox::relative_display(&self.workspace, path)
    }

    /// Record into `subdir/<base>.md` below ThreadBorn (audit records use
    /// dated folders with time-named files).  The first record creates the
    /// file with a metadata header; later records for the same base are
    /// appended as separated sections.
    pub async fn write_threadborn_record(
        &self,
        subdir: &str,
        base: &str,
        body: String,
        provenance: &SessionProvenance,
    ) -> Result<WrittenEntry> {
        let relative = format!("{}/{subdir}", MemoryType::ThreadBorn.relative_dir());
        let dir = sandbox::resolve(&self.workspace, &relative)?;
        if !sandbox::is_inside_tier(&self.workspace, &dir, MemoryType::ThreadBorn)? {
            return Err(MemoryError::PathEscape {
                path: subdir.to_string(),
            });
        }
        let created = self
            .write_entry(NewEntry {
                tier: MemoryType::ThreadBorn,
                dir: dir.clone(),
                title: base,
                base: Some(base),
                body: body.clone(),
                provenance,
                link: None,
                allow_suffix: false,
            })
            .await;
        match created {
            Err(MemoryError::AllocationExhausted { .. }) => {
                self.append_threadborn_record(&dir, base, &body, provenance).await
            }
            other => other,
        }
    }

    async fn append_threadborn_record(
        &self,
        dir: &Path,
        base: &str,
        body: &str,
        provenance: &SessionProvenance,
    ) -> Result<WrittenEntry> {
        let filename = format!("{base}.{ENTRY_EXTENSION}");
        let target = dir.join(&filename);
        let metadata = EntryMetadata {
            id: Uuid::new_v4().to_string(),
            created_at: self.now(),
            source_session_id: provenance.session_id.clone(),
            source_trigger: provenance.trigger.clone(),
            memory_type: MemoryType::ThreadBorn,
            sealed: false,
            provenance: None,
        };
        let section = format!(
            "\n## Record {}\n- Record: {}\n- Session: {} ({})\n\n{}\n",
            stamp(metadata.created_at),
            metadata.id,
            metadata.source_session_id,
            metadata.source_trigger,
            body.trim(),
        );
        append_durably(&target, &section)
            .await
            .map_err(|err| MemoryError::io(&target, err))?;

        let path = self.display_path(&target);
        info!(id = %metadata.id, path = %path, "threadborn record appended");
        Ok(WrittenEntry {
            id: metadata.id.clone(),
            path,
            filename,
            metadata,
        })
    }

    async fn write_entry(&self, entry: NewEntry<'_>) -> Result<WrittenEntry> {
        let now = self.now();
        let metadata = EntryMetadata {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            source_session_id: entry.provenance.session_id.clone(),
            source_trigger: entry.provenance.trigger.clone(),
            memory_type: entry.tier,
            sealed: entry.tier == MemoryType::Vault,
            provenance: entry.link,
        };
        let content = codec::render(&metadata, &entry.body);
        let base = match entry.base {
            Some(base) => base.to_string(),
            None => filename_base(now, entry.title),
        };
        let file = create_unique(&entry.dir, &base, &content, entry.allow_suffix).await?;
        let path = self.display_path(&file.path);
        info!(
            tier = %entry.tier,
            id = %metadata.id,
            path = %path,
            session = %metadata.source_session_id,
            trigger = %metadata.source_trigger,
            "memory entry written"
        );
        Ok(WrittenEntry {
            id: metadata.id.clone(),
            path,
            filename: file.filename,
            metadata,
        })
    }

    fn tier_dir(&self, tier: MemoryType) -> Result<PathBuf> {
        sandbox::resolve(&self.workspace, &tier.relative_dir())
    }

    /// Resolve and decode a promotion/seal source.  Vault is never a source.
    async fn read_source(&self, relative: &str) -> Result<(PathBuf, DecodedEntry)> {
        let path = sandbox::resolve_allowed_source(&self.workspace, relative)?;
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|err| MemoryError::io(&path, err))?;
        Ok((path, codec::decode(&content)))
    }

    fn source_title(requested: Option<&str>, source: &DecodedEntry, path: &Path) -> String {
        requested
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .or_else(|| derive_title(&source.body))
            .unwrap_or_else(|| {
                path.file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "entry".to_string())
            })
    }

    /// Write an untrusted working note.
    pub async fn write_threadborn(&self, note: ThreadbornNote) -> Result<WrittenEntry> {
        let mut body = format!("# {}\n\n", note.title.trim());
        let tags: Vec<&str> = note
            .tags
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .collect();
        if !tags.is_empty() {
            body.push_str(&format!("Tags: {}\n\n", tags.join(", ")));
        }
        body.push_str(note.body.trim_end());
        body.push('\n');

        self.write_entry(NewEntry {
            tier: MemoryType::ThreadBorn,
            dir: self.tier_dir(MemoryType::ThreadBorn)?,
            title: &note.title,
            base: None,
            body,
            provenance: &note.provenance,
            link: None,
            allow_suffix: true,
        })
        .await
    }

    /// Promote an existing ThreadBorn/BridgeThread/Labyrinth entry into BridgeThread.
    pub async fn promote_to_bridgethread(&self, request: PromotionRequest) -> Result<WrittenEntry> {
        let (source_path, source) = self.read_source(&request.source_path).await?;
        let link = codec::link_from(LinkKind::PromotedFrom, &source.metadata).ok_or_else(|| {
            MemoryError::ProvenanceUnresolved {
                detail: format!("{} has no id header to promote from", request.source_path),
            }
        })?;
        let title = Self::source_title(request.title.as_deref(), &source, &source_path);
        let body = format!(
            "# {title}\n\n## Promotion\n- Promoted from: {}\n- Promoted at: {}\n\n{}\n",
            self.display_path(&source_path),
            stamp(self.now()),
            source.body.trim(),
        );

        self.write_entry(NewEntry {
            tier: MemoryType::BridgeThread,
            dir: self.tier_dir(MemoryType::BridgeThread)?,
            title: &title,
            base: None,
            body,
            provenance: &request.provenance,
            link: Some(link),
            allow_suffix: true,
        })
        .await
    }

    /// Seal a source into a new Vault entry, or append it to an existing one.
    ///
    /// This does not consult the sealing policy; callers go through the gate.
    pub async fn seal_to_vault(&self, request: VaultSealRequest) -> Result<VaultOutcome> {
        if request.append {
            return self.append_to_vault(request).await.map(VaultOutcome::Appended);
        }
        if request.target_path.is_some() {
            return Err(MemoryError::InvalidAppendCombination);
        }

        let dir = match request.scope.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(scope) => {
                let relative = format!("{}/{scope}", MemoryType::Vault.relative_dir());
                let dir = sandbox::resolve(&self.workspace, &relative)?;
                if !sandbox::is_inside_tier(&self.workspace, &dir, MemoryType::Vault)? {
                    return Err(MemoryError::PathEscape {
                        path: scope.to_string(),
                    });
                }
                dir
            }
            None => self.tier_dir(MemoryType::Vault)?,
        };

        let (source_path, source) = self.read_source(&request.source_path).await?;
        let link = codec::link_from(LinkKind::SealedFrom, &source.metadata).ok_or_else(|| {
            MemoryError::ProvenanceUnresolved {
                detail: format!("{} has no id header to seal from", request.source_path),
            }
        })?;
        let title = Self::source_title(request.title.as_deref(), &source, &source_path);
        let body = format!(
            "# {title}\n\n## Seal\n- Sealed from: {}\n- Sealed at: {}\n\n{}\n",
            self.display_path(&source_path),
            stamp(self.now()),
            source.body.trim(),
        );

        self.write_entry(NewEntry {
            tier: MemoryType::Vault,
            dir,
            title: &title,
            base: None,
            body,
            provenance: &request.provenance,
            link: Some(link),
            allow_suffix: true,
        })
        .await
        .map(VaultOutcome::Sealed)
    }

    async fn append_to_vault(&self, request: VaultSealRequest) -> Result<AppendedEntry> {
        let target_rel = request
            .target_path
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| MemoryError::MissingTarget {
                detail: "target_path is required when append = true".to_string(),
            })?;
        let target = sandbox::resolve(&self.workspace, target_rel)?;
        if !sandbox::is_inside_tier(&self.workspace, &target, MemoryType::Vault)? {
            return Err(MemoryError::TargetOutsideVault {
                path: target_rel.to_string(),
            });
        }
        if !target.is_file() {
            return Err(MemoryError::MissingTarget {
                detail: format!("{target_rel} does not exist"),
            });
        }

        let (source_path, source) = self.read_source(&request.source_path).await?;
        let now = self.now();
        let source_display = self.display_path(&source_path);
        let section = format!(
            "\n## Appended {}\n- Source: {source_display}\n- Session: {} ({})\n\n{}\n",
            stamp(now),
            request.provenance.session_id,
            request.provenance.trigger,
            source.body.trim(),
        );

        append_durably(&target, &section)
            .await
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::NotFound => MemoryError::MissingTarget {
                    detail: format!("{target_rel} does not exist"),
                },
                _ => MemoryError::io(&target, err),
            })?;

        let path = self.display_path(&target);
        info!(path = %path, source = %source_display, "vault entry appended");
        Ok(AppendedEntry {
            filename: target
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            path,
            source_path: source_display,
            appended_at: now,
        })
    }

    /// Write a point-in-time identity snapshot.  A filename clash fails
    /// outright instead of picking a suffixed name.
    pub async fn write_labyrinth_snapshot(&self, snapshot: LabyrinthSnapshot) -> Result<WrittenEntry> {
        let body = format!("# {}\n\n{}\n", snapshot.title.trim(), snapshot.body.trim_end());
        self.write_entry(NewEntry {
            tier: MemoryType::Labyrinth,
            dir: self.tier_dir(MemoryType::Labyrinth)?,
            title: &snapshot.title,
            base: None,
            body,
            provenance: &snapshot.provenance,
            link: None,
            allow_suffix: false,
        })
        .await
    }
}
