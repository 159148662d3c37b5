use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::date::{is_plausible, OriginalTime};
use crate::error::{ArchiveError, ExtractError};
use crate::media::{ArchiveOutcome, CompareTask, CopyTask, MediaRecord};

/// Where a record goes next.
#[derive(Debug)]
pub enum Placement {
    /// Nothing at the destination yet.
    Copy(CopyTask),
    /// Something already occupies the destination.
    Compare(CompareTask),
    /// No usable original time.
    Unresolved { source: PathBuf, cause: ExtractError },
    /// The destination directory could not be created.
    Failed(ArchiveOutcome),
}

/// `root/YYYY/MM/DD/<basename>` for a source taken at `time`.
pub fn destination_for(root: &Path, source: &Path, time: &OriginalTime) -> Option<PathBuf> {
    let name = source.file_name()?;
    Some(
        root.join(time.format("%Y").to_string())
            .join(time.format("%m").to_string())
            .join(time.format("%d").to_string())
            .join(name),
    )
}

/// Create `dir` and its parents. Another worker winning the race is fine.
pub fn ensure_dir(dir: &Path) -> io::Result<()> {
    match fs::create_dir_all(dir) {
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists && dir.is_dir() => Ok(()),
        other => other,
    }
}

/// Decide what happens to `record` under `root`.
///
/// This is the only place that decides whether a destination is free, so two
/// copies never race for the same path without passing through verification
/// (or the executor's own no-clobber check).
pub fn place(root: &Path, record: MediaRecord) -> Result<Placement, ArchiveError> {
    let source = record.source;
    let time = match record.time {
        Ok(time) if is_plausible(&time) => time,
        Ok(_) => {
            return Ok(Placement::Unresolved {
                source,
                cause: ExtractError::NoOriginalTime,
            })
        }
        Err(cause) => return Ok(Placement::Unresolved { source, cause }),
    };

    let Some(destination) = destination_for(root, &source, &time) else {
        return Ok(Placement::Unresolved {
            source,
            cause: ExtractError::NoOriginalTime,
        });
    };

    if let Some(dir) = destination.parent() {
        if let Err(e) = ensure_dir(dir) {
            if !root.is_dir() {
                return Err(ArchiveError::DestinationRoot(root.to_path_buf()));
            }
            let cause = anyhow::Error::new(e).context(format!("cannot create {}", dir.display()));
            return Ok(Placement::Failed(ArchiveOutcome::Failed {
                source,
                destination: Some(destination),
                cause,
            }));
        }
    }

    match destination.try_exists().with_context(|| format!("cannot stat {}", destination.display())) {
        Ok(true) => Ok(Placement::Compare(CompareTask {
            source,
            source_time: time,
            destination,
        })),
        Ok(false) => Ok(Placement::Copy(CopyTask::new(source, destination))),
        Err(cause) => Ok(Placement::Failed(ArchiveOutcome::Failed {
            source,
            destination: Some(destination),
            cause,
        })),
    }
}
