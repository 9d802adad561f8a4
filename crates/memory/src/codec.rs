//! Metadata header codec.
//!
//! Every entry file starts with a `---` delimited block of `key: value` lines:
//!
//! ```text
//! ---
//! id: "0b6c…"
//! created_at: "2026-10-19T08:15:02.123Z"
//! source_session_id: "telegram:42"
//! source_trigger: "WHO_AM_I"
//! memory_type: "Labyrinth"
//! sealed: false
//! ---
//!
//! # Title
//! ```
//!
//! Strings are JSON-quoted, booleans are bare.  Decoding never fails: files
//! without a well-formed block come back with empty metadata and the original
//! content as body.

use chrono::{DateTime, Utc};

use crate::schema::{EntryMetadata, LinkKind, MemoryType, ProvenanceLink, stamp};

const DELIMITER: &str = "---";

/// A decoded header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Str(String),
    Bool(bool),
}

impl HeaderValue {
    fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        match raw {
            "true" => return Self::Bool(true),
            "false" => return Self::Bool(false),
            _ => {}
        }
        if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
            if let Ok(s) = serde_json::from_str::<String>(raw) {
                return Self::Str(s);
            }
            return Self::Str(raw[1..raw.len() - 1].to_string());
        }
        Self::Str(raw.to_string())
    }

    fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            Self::Bool(_) => None,
        }
    }
}

/// Header fields recovered from a file.  Every field is optional because
/// historical or foreign files may carry any subset of them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedMetadata {
    pub id: Option<String>,
    pub created_at: Option<String>,
    pub source_session_id: Option<String>,
    pub source_trigger: Option<String>,
    pub memory_type: Option<String>,
    pub sealed: Option<bool>,
    pub promoted_from: Option<PartialLink>,
    pub sealed_from: Option<PartialLink>,
}

/// A provenance link as found on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialLink {
    pub id: Option<String>,
    pub source_session_id: Option<String>,
    pub source_trigger: Option<String>,
    pub memory_type: Option<String>,
}

impl DecodedMetadata {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Parsed `memory_type`, if present and recognised.
    pub fn memory_type(&self) -> Option<MemoryType> {
        self.memory_type.as_deref().and_then(MemoryType::from_label)
    }

    /// Parsed `created_at`, if present and RFC 3339.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    fn assign(&mut self, key: &str, value: HeaderValue) {
        let text = || value.as_str().map(str::to_string);
        match key {
            "id" => self.id = text(),
            "created_at" => self.created_at = text(),
            "source_session_id" => self.source_session_id = text(),
            "source_trigger" => self.source_trigger = text(),
            "memory_type" => self.memory_type = text(),
            "sealed" => {
                if let HeaderValue::Bool(b) = &value {
                    self.sealed = Some(*b);
                }
            }
            _ => {
                for kind in [LinkKind::PromotedFrom, LinkKind::SealedFrom] {
                    let Some(suffix) = key
                        .strip_prefix(kind.prefix())
                        .and_then(|rest| rest.strip_prefix('_'))
                    else {
                        continue;
                    };
                    let slot = match kind {
                        LinkKind::PromotedFrom => &mut self.promoted_from,
                        LinkKind::SealedFrom => &mut self.sealed_from,
                    };
                    let link = slot.get_or_insert_with(PartialLink::default);
                    match suffix {
                        "id" => link.id = text(),
                        "session_id" => link.source_session_id = text(),
                        "trigger" => link.source_trigger = text(),
                        "memory_type" => link.memory_type = text(),
                        _ => {}
                    }
                }
            }
        }
    }
}

/// Result of [`decode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedEntry {
    pub metadata: DecodedMetadata,
    pub body: String,
}

fn quote(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| format!("\"{}\"", value.replace('"', "'")))
}

/// Render the header block for `metadata`, required keys first in a fixed
/// order, then the provenance keys when a link is present.
pub fn encode(metadata: &EntryMetadata) -> String {
    let mut out = String::new();
    out.push_str(DELIMITER);
    out.push('\n');
    let created_at = stamp(metadata.created_at);
    let lines: [(&str, String); 6] = [
        ("id", quote(&metadata.id)),
        ("created_at", quote(&created_at)),
        ("source_session_id", quote(&metadata.source_session_id)),
        ("source_trigger", quote(&metadata.source_trigger)),
        ("memory_type", quote(metadata.memory_type.label())),
        ("sealed", metadata.sealed.to_string()),
    ];
    for (key, value) in lines {
        out.push_str(&format!("{key}: {value}\n"));
    }
    if let Some(link) = &metadata.provenance {
        let prefix = link.kind.prefix();
        out.push_str(&format!("{prefix}_id: {}\n", quote(&link.id)));
        out.push_str(&format!(
            "{prefix}_session_id: {}\n",
            quote(&link.source_session_id)
        ));
        out.push_str(&format!("{prefix}_trigger: {}\n", quote(&link.source_trigger)));
        out.push_str(&format!(
            "{prefix}_memory_type: {}\n",
            quote(&link.memory_type)
        ));
    }
    out.push_str(DELIMITER);
    out.push('\n');
    out
}

/// Header plus a blank separator line plus body.
pub fn render(metadata: &EntryMetadata, body: &str) -> String {
    let mut out = encode(metadata);
    out.push('\n');
    out.push_str(body);
    if !body.ends_with('\n') {
        out.push('\n');
    }
    out
}

/// Split `content` into header metadata and body.  Never fails.
pub fn decode(content: &str) -> DecodedEntry {
    let fallback = || DecodedEntry {
        metadata: DecodedMetadata::default(),
        body: content.to_string(),
    };

    let mut lines = content.split_inclusive('\n');
    match lines.next() {
        Some(first) if first.trim_end_matches(['\r', '\n']) == DELIMITER => {}
        _ => return fallback(),
    }

    let mut metadata = DecodedMetadata::default();
    let mut consumed = content.split_inclusive('\n').next().map_or(0, str::len);
    let mut closed = false;
    for line in lines {
        consumed += line.len();
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed == DELIMITER {
            closed = true;
            break;
        }
        let Some((key, value)) = trimmed.split_once(':') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        metadata.assign(key, HeaderValue::parse(value));
    }

    if !closed {
        return fallback();
    }

    let rest = &content[consumed..];
    let body = rest
        .strip_prefix("\r\n")
        .or_else(|| rest.strip_prefix('\n'))
        .unwrap_or(rest);
    DecodedEntry {
        metadata,
        body: body.to_string(),
    }
}

/// Build a provenance link of `kind` from a decoded source header.
///
/// The source must carry an `id`; other missing fields are recorded as
/// `unknown`.
pub fn link_from(kind: LinkKind, source: &DecodedMetadata) -> Option<ProvenanceLink> {
    let id = source.id.clone().filter(|id| !id.trim().is_empty())?;
    let or_unknown = |v: &Option<String>| v.clone().unwrap_or_else(|| "unknown".to_string());
    Some(ProvenanceLink {
        kind,
        id,
        source_session_id: or_unknown(&source.source_session_id),
        source_trigger: or_unknown(&source.source_trigger),
        memory_type: or_unknown(&source.memory_type),
    })
}
