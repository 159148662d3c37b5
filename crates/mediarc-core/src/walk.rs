use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::SyncSender;

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::ThrottledProgress;

/// Extensions admitted to the pipeline (lowercase, without the dot).
pub const MEDIA_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "arw", "nef", "avi", "mp4", "mov", "m4v", "m4a"];

/// Hidden files of exactly one allocation block are OS index files.
const INDEX_ARTIFACT_SIZE: u64 = 4096;

/// What the walk saw besides the files it handed on.
#[derive(Debug, Default, Clone)]
pub struct WalkStats {
    pub admitted: u64,
    /// Lowercase extension (empty for none) -> number of files skipped
    pub ignored: BTreeMap<String, u64>,
}

pub fn extension_key(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

pub fn is_media(path: &Path) -> bool {
    MEDIA_EXTENSIONS.contains(&extension_key(path).as_str())
}

fn is_index_artifact(name: &str, size: u64) -> bool {
    name.starts_with('.') && size == INDEX_ARTIFACT_SIZE
}

/// Walk `root` and send every media file to `tasks`.
///
/// Stops early if the receiving side is gone. `discovered` counts admitted
/// files as they are found.
pub fn walk(
    root: &Path,
    tasks: &SyncSender<PathBuf>,
    discovered: &AtomicU64,
    progress: &ThrottledProgress,
) -> WalkStats {
    let mut stats = WalkStats::default();

    for entry in WalkDir::new(root) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("walk error: {}", e);
                continue;
            }
        };
        if entry.file_type().is_dir() {
            continue;
        }

        let size = match entry.metadata() {
            Ok(meta) => meta.len(),
            Err(e) => {
                warn!("walk error: {} {}", e, entry.path().display());
                continue;
            }
        };
        if is_index_artifact(&entry.file_name().to_string_lossy(), size) {
            continue;
        }

        let path = entry.into_path();
        if !is_media(&path) {
            *stats.ignored.entry(extension_key(&path)).or_default() += 1;
            continue;
        }

        stats.admitted += 1;
        let current = discovered.fetch_add(1, Ordering::Relaxed);
        progress.report("scan", current, 0, &path.to_string_lossy());

        if tasks.send(path).is_err() {
            debug!("walk stopped: no consumers left");
            break;
        }
    }

    stats
}
