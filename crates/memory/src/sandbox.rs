//! Workspace path sandbox.
//!
//! Every path that reaches the store comes from tool arguments and must be
//! treated as hostile.  Resolution is lexical first (so paths that do not
//! exist yet can still be validated) and then re-checked against the
//! canonical root for whatever part of the path already exists, which closes
//! the symlink route out of the workspace.

use std::path::{Component, Path, PathBuf};

use crate::error::{MemoryError, Result};
use crate::schema::{MEMORY_DIR, MemoryType};

/// Lexically resolve `.` and `..` in a path without touching the filesystem.
fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}

/// Absolute, normalized form of the workspace root.
pub fn workspace_root(root: &Path) -> Result<PathBuf> {
    let absolute = std::path::absolute(root).map_err(|err| MemoryError::io(root, err))?;
    Ok(normalize_path(&absolute))
}

/// Nearest ancestor of `path` (including itself) that exists on disk.
fn nearest_existing(path: &Path) -> Option<&Path> {
    path.ancestors().find(|candidate| candidate.exists())
}

/// Resolve `relative` against `root`; the result must be a strict descendant.
pub fn resolve(root: &Path, relative: &str) -> Result<PathBuf> {
    let escape = || MemoryError::PathEscape {
        path: relative.to_string(),
    };

    let root = workspace_root(root)?;
    if relative.trim().is_empty() || relative.contains('\0') {
        return Err(escape());
    }

    let resolved = normalize_path(&root.join(relative));
    if resolved == root || !resolved.starts_with(&root) {
        return Err(escape());
    }

    // A symlink inside the workspace may still point outside of it.
    if let (Ok(canonical_root), Some(existing)) = (root.canonicalize(), nearest_existing(&resolved))
    {
        if existing.starts_with(&root) {
            let canonical = existing
                .canonicalize()
                .map_err(|err| MemoryError::io(existing, err))?;
            if !canonical.starts_with(&canonical_root) {
                return Err(escape());
            }
        }
    }

    Ok(resolved)
}

/// Absolute directory for a tier under `root`.
pub fn tier_dir(root: &Path, tier: MemoryType) -> Result<PathBuf> {
    Ok(workspace_root(root)?.join(MEMORY_DIR).join(tier.label()))
}

/// `true` when `path` lies strictly below the directory of `tier`.
pub fn is_inside_tier(root: &Path, path: &Path, tier: MemoryType) -> Result<bool> {
    let dir = tier_dir(root, tier)?;
    Ok(path != dir && path.starts_with(&dir))
}

/// Resolve `relative` and additionally require it to sit inside one of the
/// promotable tiers (ThreadBorn, BridgeThread, Labyrinth).  Vault is never an
/// allowed source.
///
/// The tier check is lexical; a source that exists is additionally
/// canonicalized so a link from an allowed tier into the Vault is refused.
pub fn resolve_allowed_source(root: &Path, relative: &str) -> Result<PathBuf> {
    let disallowed = || MemoryError::DisallowedSource {
        path: relative.to_string(),
    };
    let resolved = resolve(root, relative)?;
    for tier in MemoryType::SOURCE_TIERS {
        if is_inside_tier(root, &resolved, tier)? {
            if links_into_vault(root, &resolved)? {
                return Err(disallowed());
            }
            return Ok(resolved);
        }
    }
    Err(disallowed())
}

/// `true` when `path` exists and its canonical form sits at or below the
/// canonical Vault directory.
fn links_into_vault(root: &Path, path: &Path) -> Result<bool> {
    let vault = tier_dir(root, MemoryType::Vault)?;
    let Ok(vault) = vault.canonicalize() else {
        return Ok(false);
    };
    match path.canonicalize() {
        Ok(target) => Ok(target.starts_with(&vault)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(MemoryError::io(path, err)),
    }
}

/// Workspace-relative, forward-slash form of `path` for tool-facing output.
///
/// Paths outside the root collapse to their file name so host layout never leaks.
pub fn relative_display(root: &Path, path: &Path) -> String {
    let rel = workspace_root(root)
        .ok()
        .and_then(|root| path.strip_prefix(&root).ok().map(Path::to_path_buf));
    match rel {
        Some(rel) => rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/"),
        None => path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default(),
    }
}
