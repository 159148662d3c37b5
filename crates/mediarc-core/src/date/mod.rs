pub mod atom;
pub mod exif;
pub mod guess;

use std::path::Path;

use chrono::{DateTime, Datelike, FixedOffset};
use tracing::debug;

use crate::error::ExtractError;
use crate::walk::extension_key;

/// A best-effort original creation time, in the zone it was recorded in.
pub type OriginalTime = DateTime<FixedOffset>;

pub const MIN_YEAR: i32 = 1980;
pub const MAX_YEAR: i32 = 2100;

pub fn is_plausible(time: &OriginalTime) -> bool {
    (MIN_YEAR..=MAX_YEAR).contains(&time.year())
}

/// Extract the original creation time of the file at `path`.
///
/// Movies are read from their container header, images from EXIF. Any
/// failure there, a missing time, or an implausible year falls back to
/// guessing from the file name; the first error is reported only if that
/// fails too.
pub fn original_time(path: &Path) -> Result<OriginalTime, ExtractError> {
    let primary = match extension_key(path).as_str() {
        "mov" | "mp4" => atom::movie_creation_time(path),
        "jpg" | "jpeg" | "arw" | "nef" => exif::exif_time(path),
        _ => Ok(None),
    };

    let primary_error = match primary {
        Ok(Some(time)) if is_plausible(&time) => return Ok(time),
        Ok(Some(time)) => {
            debug!("implausible embedded time {} in {}", time, path.display());
            None
        }
        Ok(None) => None,
        Err(e) => {
            debug!("embedded time unavailable for {}: {}", path.display(), e);
            Some(e)
        }
    };

    if let Some(time) = guess::guess_time_from_filename(path) {
        return Ok(time);
    }

    Err(primary_error.unwrap_or(ExtractError::NoOriginalTime))
}
