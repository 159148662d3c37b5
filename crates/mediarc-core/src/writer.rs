use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use filetime::FileTime;
use tracing::debug;

use crate::checksum::{files_equal, Checksum};
use crate::media::{ArchiveOutcome, CopyTask};

const TEMP_PREFIX: &str = "_tmp_";

/// `<stem>-<6 hex chars><.ext>` next to `dest`.
pub fn disambiguated(dest: &Path, checksum: &Checksum) -> PathBuf {
    let stem = dest.file_stem().map(|s| s.to_string_lossy()).unwrap_or_default();
    let new_name = match dest.extension() {
        Some(ext) => format!("{}-{}.{}", stem, checksum.short(), ext.to_string_lossy()),
        None => format!("{}-{}", stem, checksum.short()),
    };
    dest.with_file_name(new_name)
}

/// Copy `src` to `dst` without ever exposing a partial file at `dst`.
///
/// The data goes to a temp file in `dst`'s directory, which gets the
/// source's modification time and permissions and is then linked into
/// place. Fails with `AlreadyExists` if `dst` exists, including when it
/// appears while copying. The temp file is removed on every failure.
pub fn copy_atomic(src: &Path, dst: &Path) -> io::Result<()> {
    let meta = fs::metadata(src)?;
    let dir = dst
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "destination has no parent directory"))?;
    if dst.try_exists()? {
        return Err(io::Error::new(io::ErrorKind::AlreadyExists, "destination already exists"));
    }

    let mut tmp = tempfile::Builder::new().prefix(TEMP_PREFIX).tempfile_in(dir)?;
    {
        let mut input = File::open(src)?;
        let mut out = BufWriter::new(tmp.as_file_mut());
        io::copy(&mut input, &mut out)?;
        out.flush()?;
    }
    tmp.as_file().sync_all()?;

    filetime::set_file_mtime(tmp.path(), FileTime::from_last_modification_time(&meta))?;
    fs::set_permissions(tmp.path(), meta.permissions())?;

    tmp.persist_noclobber(dst).map_err(|e| e.error)?;
    Ok(())
}

/// Move `src` to `dst`, refusing to replace an existing `dst`.
///
/// Links and unlinks where possible; across filesystems it falls back to an
/// atomic copy followed by removing the source.
pub fn move_file(src: &Path, dst: &Path) -> io::Result<()> {
    match fs::hard_link(src, dst) {
        Ok(()) => fs::remove_file(src),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(e),
        Err(e) => {
            debug!("hard link {} failed ({}), copying instead", dst.display(), e);
            copy_atomic(src, dst)?;
            fs::remove_file(src)
        }
    }
}

fn source_checksum(source: &Path, cached: &mut Option<Checksum>) -> anyhow::Result<Checksum> {
    if let Some(sum) = cached {
        return Ok(*sum);
    }
    let sum = Checksum::of_file(source).with_context(|| format!("cannot read {}", source.display()))?;
    *cached = Some(sum);
    Ok(sum)
}

/// Performs the transfer of a `CopyTask`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyExecutor {
    pub move_files: bool,
}

impl CopyExecutor {
    pub fn new(move_files: bool) -> Self {
        Self { move_files }
    }

    fn transfer(&self, src: &Path, dst: &Path) -> io::Result<()> {
        if self.move_files {
            move_file(src, dst)
        } else {
            copy_atomic(src, dst)
        }
    }

    pub fn execute(&self, task: CopyTask) -> ArchiveOutcome {
        let source = task.source.clone();
        match self.place(task) {
            Ok(outcome) => outcome,
            Err((destination, cause)) => ArchiveOutcome::Failed {
                source,
                destination: Some(destination),
                cause,
            },
        }
    }

    fn place(&self, task: CopyTask) -> Result<ArchiveOutcome, (PathBuf, anyhow::Error)> {
        let CopyTask {
            source,
            destination,
            conflict,
            mut checksum,
        } = task;

        let mut renamed = false;
        let mut target = destination.clone();

        if conflict {
            let sum = source_checksum(&source, &mut checksum).map_err(|e| (target.clone(), e))?;
            target = disambiguated(&destination, &sum);
            renamed = true;
        }

        loop {
            let occupied = target
                .try_exists()
                .with_context(|| format!("cannot stat {}", target.display()))
                .map_err(|e| (target.clone(), e))?;

            if !occupied {
                match self.transfer(&source, &target) {
                    Ok(()) => {
                        return Ok(ArchiveOutcome::Archived {
                            source,
                            destination: target,
                        })
                    }
                    // Someone else claimed the name meanwhile; look at what is there now.
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                    Err(e) => {
                        let cause = anyhow::Error::new(e).context("transfer failed");
                        return Err((target, cause));
                    }
                }
            }

            let equal = files_equal(&source, &target)
                .with_context(|| format!("cannot compare with {}", target.display()))
                .map_err(|e| (target.clone(), e))?;
            if equal {
                return Ok(ArchiveOutcome::Duplicate {
                    source,
                    destination: target,
                });
            }

            if renamed {
                let cause = anyhow::anyhow!("conflict: {} exists and differs", target.display());
                return Err((target, cause));
            }

            let sum = source_checksum(&source, &mut checksum).map_err(|e| (target.clone(), e))?;
            target = disambiguated(&destination, &sum);
            renamed = true;
        }
    }
}
