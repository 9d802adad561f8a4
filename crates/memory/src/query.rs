use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

use crate::codec;
use crate::error::{MemoryError, Result};
use crate::sandbox;
use crate::schema::MemoryType;
use crate::store::GovernedStore;

const PREVIEW_LINES: usize = 4;

/// One Vault file matching a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultHit {
    /// Workspace-relative, forward-slash path.
    pub path: String,
    pub title: String,
    pub preview: Vec<String>,
}

fn heading_text(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    trimmed
        .starts_with('#')
        .then(|| trimmed.trim_start_matches('#').trim())
}

/// Title (first heading, else first non-blank line) and the index of the
/// line it came from.
fn locate_title<'a>(lines: &[&'a str]) -> Option<(usize, &'a str)> {
    lines
        .iter()
        .enumerate()
        .find_map(|(idx, line)| heading_text(line).map(|text| (idx, text)))
        .or_else(|| {
            lines
                .iter()
                .enumerate()
                .find(|(_, line)| !line.trim().is_empty())
                .map(|(idx, line)| (idx, line.trim()))
        })
}

/// Derive a display title from an entry body (header already stripped).
pub fn derive_title(body: &str) -> Option<String> {
    let lines: Vec<&str> = body.lines().collect();
    locate_title(&lines)
        .map(|(_, title)| title.to_string())
        .filter(|title| !title.is_empty())
}

/// Title plus up to four non-blank lines following it.
pub fn title_and_preview(body: &str, fallback_title: &str) -> (String, Vec<String>) {
    let lines: Vec<&str> = body.lines().collect();
    match locate_title(&lines) {
        Some((idx, title)) => {
            let preview = lines[idx + 1..]
                .iter()
                .map(|line| line.trim())
                .filter(|line| !line.is_empty())
                .take(PREVIEW_LINES)
                .map(str::to_string)
                .collect();
            let title = if title.is_empty() { fallback_title } else { title };
            (title.to_string(), preview)
        }
        None => (fallback_title.to_string(), Vec::new()),
    }
}

fn matches_tags(content: &str, tags: &[String]) -> bool {
    let haystack = content.to_lowercase();
    tags.iter()
        .map(|tag| tag.trim().to_lowercase())
        .filter(|tag| !tag.is_empty())
        .all(|tag| haystack.contains(&tag))
}

fn markdown_files(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("md"))
        })
        .map(|entry| entry.into_path())
        .collect()
}

impl GovernedStore {
    /// Read-only search of the Vault.
    ///
    /// `scope` selects a subdirectory (e.g. `identity`); when it does not
    /// exist the whole Vault is searched.  Every tag must appear in the raw
    /// file content (case-insensitive substring).
    pub async fn query_vault(&self, scope: Option<&str>, tags: &[String]) -> Result<Vec<VaultHit>> {
        let vault_dir = sandbox::tier_dir(self.workspace(), MemoryType::Vault)?;
        let search_root = match scope.map(str::trim).filter(|s| !s.is_empty()) {
            Some(scope) => {
                let relative = format!("{}/{scope}", MemoryType::Vault.relative_dir());
                let candidate = sandbox::resolve(self.workspace(), &relative)?;
                if !sandbox::is_inside_tier(self.workspace(), &candidate, MemoryType::Vault)? {
                    return Err(MemoryError::PathEscape {
                        path: scope.to_string(),
                    });
                }
                if candidate.is_dir() {
                    candidate
                } else {
                    debug!(scope, "vault scope missing; searching whole vault");
                    vault_dir.clone()
                }
            }
            None => vault_dir.clone(),
        };

        if !search_root.is_dir() {
            return Ok(Vec::new());
        }

        let mut hits = Vec::new();
        for path in markdown_files(&search_root) {
            let content = tokio::fs::read_to_string(&path)
                .await
                .map_err(|err| MemoryError::io(&path, err))?;
            if !matches_tags(&content, tags) {
                continue;
            }
            let decoded = codec::decode(&content);
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let (title, preview) = title_and_preview(&decoded.body, &stem);
            hits.push(VaultHit {
                path: sandbox::relative_display(self.workspace(), &path),
                title,
                preview,
            });
        }
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_prefers_first_heading() {
        let body = "intro line\n\n# Real Title\n\none\n\ntwo\nthree\nfour\nfive\n";
        let (title, preview) = title_and_preview(body, "stem");
        assert_eq!(title, "Real Title");
        assert_eq!(preview, ["one", "two", "three", "four"]);
    }

    #[test]
    fn title_falls_back_to_first_line_then_stem() {
        let (title, preview) = title_and_preview("\n  plain start\nnext\n", "stem");
        assert_eq!(title, "plain start");
        assert_eq!(preview, ["next"]);
        let (title, preview) = title_and_preview("\n\n", "stem");
        assert_eq!(title, "stem");
        assert!(preview.is_empty());
    }

    #[test]
    fn tag_filter_is_case_insensitive_and_conjunctive() {
        let content = "Tags: Identity, Core-Values\nbody";
        assert!(matches_tags(content, &["identity".to_string()]));
        assert!(matches_tags(content, &["IDENTITY".to_string(), "core-values".to_string()]));
        assert!(!matches_tags(content, &["identity".to_string(), "missing".to_string()]));
        assert!(matches_tags(content, &[]));
        assert!(matches_tags(content, &["  ".to_string()]));
    }

    #[test]
    fn derive_title_handles_empty_heading() {
        assert_eq!(derive_title("# Hello\nbody"), Some("Hello".to_string()));
        assert_eq!(derive_title("#\nbody"), None);
        assert_eq!(derive_title(""), None);
    }
}
