use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{MemoryError, Result};

/// Upper bound on candidate names tried when suffixing is allowed
/// (`base.md`, `base-2.md` … `base-5.md`).
pub const MAX_ATTEMPTS: usize = 5;

pub const ENTRY_EXTENSION: &str = "md";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatedFile {
    pub path: PathBuf,
    pub filename: String,
}

fn candidate_name(base: &str, attempt: usize) -> String {
    if attempt == 1 {
        format!("{base}.{ENTRY_EXTENSION}")
    } else {
        format!("{base}-{attempt}.{ENTRY_EXTENSION}")
    }
}

/// Create a brand-new file in `dir` holding `content`.
///
/// Uniqueness rests entirely on the filesystem's create-if-absent open
/// (`O_CREAT | O_EXCL`): an existing file is never opened for writing, so two
/// racing writers can never clobber each other.  The loser sees
/// `AlreadyExists` and moves on to the next suffix, or fails outright when
/// `allow_suffix` is false.
pub async fn create_unique(
    dir: &Path,
    base: &str,
    content: &str,
    allow_suffix: bool,
) -> Result<AllocatedFile> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|err| MemoryError::io(dir, err))?;

    let attempts = if allow_suffix { MAX_ATTEMPTS } else { 1 };
    for attempt in 1..=attempts {
        let filename = candidate_name(base, attempt);
        let path = dir.join(&filename);
        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                debug!(path = %path.display(), attempt, "filename collision");
                continue;
            }
            Err(err) => return Err(MemoryError::io(&path, err)),
        };

        let written: std::io::Result<()> = async {
            file.write_all(content.as_bytes()).await?;
            file.flush().await?;
            file.sync_all().await?;
            Ok(())
        }
        .await;

        if let Err(err) = written {
            // We created this file, so removing the partial write is safe.
            let _ = tokio::fs::remove_file(&path).await;
            return Err(MemoryError::io(&path, err));
        }

        return Ok(AllocatedFile { path, filename });
    }

    Err(MemoryError::AllocationExhausted {
        base: base.to_string(),
        attempts,
    })
}
