use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Root of the governed tree, relative to the workspace.
pub const MEMORY_DIR: &str = "memory";

/// Memory tiers from least to most privileged.
///
/// | Tier           | Purpose                                                   |
/// |----------------|-----------------------------------------------------------|
/// | `ThreadBorn`   | Untrusted working notes; the default write target         |
/// | `BridgeThread` | Notes promoted across sessions, carrying provenance        |
/// | `Vault`        | Sealed identity-level records; append-only, policy-gated  |
/// | `Labyrinth`    | Point-in-time identity snapshots; never suffixed on clash |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryType {
    ThreadBorn,
    BridgeThread,
    Vault,
    Labyrinth,
}

impl MemoryType {
    /// Canonical label, also used as the directory name under `memory/`.
    pub fn label(self) -> &'static str {
        match self {
            Self::ThreadBorn => "ThreadBorn",
            Self::BridgeThread => "BridgeThread",
            Self::Vault => "Vault",
            Self::Labyrinth => "Labyrinth",
        }
    }

    /// Parse a tier from its label (case-insensitive).
    pub fn from_label(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "threadborn" => Some(Self::ThreadBorn),
            "bridgethread" => Some(Self::BridgeThread),
            "vault" => Some(Self::Vault),
            "labyrinth" => Some(Self::Labyrinth),
            _ => None,
        }
    }

    /// Workspace-relative directory holding entries of this tier.
    pub fn relative_dir(self) -> String {
        format!("{MEMORY_DIR}/{}", self.label())
    }

    /// Tiers that may be used as the source of a promotion or seal.
    pub const SOURCE_TIERS: [MemoryType; 3] =
        [Self::ThreadBorn, Self::BridgeThread, Self::Labyrinth];
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Which way a provenance link points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkKind {
    PromotedFrom,
    SealedFrom,
}

impl LinkKind {
    /// Header key prefix (`promoted_from` / `sealed_from`).
    pub fn prefix(self) -> &'static str {
        match self {
            Self::PromotedFrom => "promoted_from",
            Self::SealedFrom => "sealed_from",
        }
    }
}

/// Back-reference to the entry this one was promoted or sealed from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceLink {
    pub kind: LinkKind,
    pub id: String,
    pub source_session_id: String,
    pub source_trigger: String,
    pub memory_type: String,
}

/// The fixed metadata header written at the top of every entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub source_session_id: String,
    pub source_trigger: String,
    pub memory_type: MemoryType,
    pub sealed: bool,
    pub provenance: Option<ProvenanceLink>,
}

/// Who caused a write: the session and the event name that triggered it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionProvenance {
    pub session_id: String,
    pub trigger: String,
}

impl SessionProvenance {
    pub fn new(session_id: impl Into<String>, trigger: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            trigger: trigger.into(),
        }
    }

    /// Build provenance from optional caller context, failing when either
    /// half is missing or blank.
    pub fn resolve(session_id: Option<&str>, trigger: &str) -> crate::Result<Self> {
        let session_id = session_id.map(str::trim).filter(|s| !s.is_empty()).ok_or_else(|| {
            crate::MemoryError::ProvenanceUnresolved {
                detail: "no originating session for this write".to_string(),
            }
        })?;
        let trigger = trigger.trim();
        if trigger.is_empty() {
            return Err(crate::MemoryError::ProvenanceUnresolved {
                detail: "no originating trigger for this write".to_string(),
            });
        }
        Ok(Self::new(session_id, trigger))
    }
}

/// Lowercase, hyphenated, `[a-z0-9._-]` only, at most 60 chars, `entry` when empty.
pub fn slugify(raw: &str) -> String {
    let mut slug = String::with_capacity(raw.len());
    for ch in raw.trim().to_lowercase().chars() {
        if ch.is_whitespace() {
            slug.push('-');
        } else if ch.is_ascii_lowercase() || ch.is_ascii_digit() || matches!(ch, '.' | '_' | '-') {
            slug.push(ch);
        }
    }
    while slug.contains("--") {
        slug = slug.replace("--", "-");
    }
    let slug = slug.trim_matches('-');
    let capped = truncate_str(slug, 60).trim_end_matches('-');
    if capped.is_empty() {
        "entry".to_string()
    } else {
        capped.to_string()
    }
}

/// RFC 3339, UTC, millisecond precision.
pub fn stamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// [`stamp`] with `:` and `.` replaced by `-`.
pub fn timestamp_slug(at: DateTime<Utc>) -> String {
    stamp(at).replace([':', '.'], "-")
}

/// `<timestamp-slug>-<slug(title)>`, the base used for new entry filenames.
pub fn filename_base(at: DateTime<Utc>, title: &str) -> String {
    format!("{}-{}", timestamp_slug(at), slugify(title))
}

/// Truncate `s` to at most `max_chars` Unicode scalar values, returning a sub-slice.
pub fn truncate_str(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}
