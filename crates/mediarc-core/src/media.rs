use std::path::PathBuf;

use crate::checksum::Checksum;
use crate::date::OriginalTime;
use crate::error::ExtractError;

/// A source file with the outcome of time extraction.
#[derive(Debug)]
pub struct MediaRecord {
    pub source: PathBuf,
    pub time: Result<OriginalTime, ExtractError>,
}

/// A transfer of `source` to `destination`.
#[derive(Debug, Clone)]
pub struct CopyTask {
    pub source: PathBuf,
    pub destination: PathBuf,
    /// Set when a verifier already judged the file at `destination` to differ,
    /// so the transfer goes straight to the disambiguated name.
    pub conflict: bool,
    /// Source checksum, when one was computed earlier in the pipeline
    pub checksum: Option<Checksum>,
}

impl CopyTask {
    pub fn new(source: PathBuf, destination: PathBuf) -> Self {
        Self {
            source,
            destination,
            conflict: false,
            checksum: None,
        }
    }

    pub fn conflicting(task: CompareTask, checksum: Option<Checksum>) -> Self {
        Self {
            source: task.source,
            destination: task.destination,
            conflict: true,
            checksum,
        }
    }
}

/// A source whose destination is already occupied and must be verified.
#[derive(Debug, Clone)]
pub struct CompareTask {
    pub source: PathBuf,
    pub source_time: OriginalTime,
    pub destination: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompareOutcome {
    pub is_duplicate: bool,
}

/// Terminal result for a file admitted to the pipeline.
#[derive(Debug)]
pub enum ArchiveOutcome {
    Archived {
        source: PathBuf,
        destination: PathBuf,
    },
    Duplicate {
        source: PathBuf,
        destination: PathBuf,
    },
    Failed {
        source: PathBuf,
        destination: Option<PathBuf>,
        cause: anyhow::Error,
    },
}

/// Everything the result aggregator receives.
#[derive(Debug)]
pub enum Event {
    Outcome(ArchiveOutcome),
    /// No usable original time; the file never entered placement.
    Unresolved { source: PathBuf, cause: ExtractError },
}

impl From<ArchiveOutcome> for Event {
    fn from(outcome: ArchiveOutcome) -> Self {
        Event::Outcome(outcome)
    }
}
