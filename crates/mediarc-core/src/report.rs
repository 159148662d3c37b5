use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::media::{ArchiveOutcome, Event};
use crate::ThrottledProgress;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedFile {
    pub source: PathBuf,
    pub destination: Option<PathBuf>,
    pub cause: String,
}

/// Totals and path lists for one archive run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArchiveSummary {
    pub archived: u64,
    pub duplicates: u64,
    pub failed: u64,
    /// Files with no usable original time
    pub unresolved: u64,
    /// Lowercase extension -> files skipped by the walker
    #[serde(default)]
    pub ignored_by_extension: BTreeMap<String, u64>,
    #[serde(default)]
    pub duplicate_paths: Vec<PathBuf>,
    #[serde(default)]
    pub failed_files: Vec<FailedFile>,
    #[serde(default)]
    pub unresolved_paths: Vec<PathBuf>,
    pub elapsed_secs: f64,
}

impl ArchiveSummary {
    pub fn ignored(&self) -> u64 {
        self.ignored_by_extension.values().sum()
    }

    /// Files that reached a terminal state.
    pub fn processed(&self) -> u64 {
        self.archived + self.duplicates + self.failed + self.unresolved
    }

    pub fn write_report<W: Write>(&self, w: &mut W) -> io::Result<()> {
        writeln!(w, "Archived:   {}", self.archived)?;
        writeln!(w, "Duplicates: {}", self.duplicates)?;
        writeln!(w, "Failed:     {}", self.failed)?;
        writeln!(w, "No time:    {}", self.unresolved)?;
        writeln!(w, "Ignored:    {}", self.ignored())?;
        for (ext, count) in &self.ignored_by_extension {
            let ext = if ext.is_empty() { "(none)" } else { ext.as_str() };
            writeln!(w, "  .{ext}: {count}")?;
        }
        writeln!(w, "Elapsed:    {:.2}s", self.elapsed_secs)?;

        if !self.unresolved_paths.is_empty() {
            writeln!(w, "\nFiles with no original time:")?;
            for path in &self.unresolved_paths {
                writeln!(w, "  {}", path.display())?;
            }
        }
        if !self.failed_files.is_empty() {
            writeln!(w, "\nFailed files:")?;
            for f in &self.failed_files {
                match &f.destination {
                    Some(dst) => writeln!(w, "  {} -> {}: {}", f.source.display(), dst.display(), f.cause)?,
                    None => writeln!(w, "  {}: {}", f.source.display(), f.cause)?,
                }
            }
        }
        if !self.duplicate_paths.is_empty() {
            writeln!(w, "\nDuplicates:")?;
            for path in &self.duplicate_paths {
                writeln!(w, "  {}", path.display())?;
            }
        }
        Ok(())
    }
}

/// Folds the event stream into an `ArchiveSummary`, reporting archived and
/// failed files as they arrive.
pub struct Aggregator<'a> {
    summary: ArchiveSummary,
    progress: &'a ThrottledProgress<'a>,
    discovered: &'a AtomicU64,
}

impl<'a> Aggregator<'a> {
    pub fn new(progress: &'a ThrottledProgress<'a>, discovered: &'a AtomicU64) -> Self {
        Self {
            summary: ArchiveSummary::default(),
            progress,
            discovered,
        }
    }

    pub fn record(&mut self, event: Event) {
        let s = &mut self.summary;
        match event {
            Event::Outcome(ArchiveOutcome::Archived { source, destination }) => {
                s.archived += 1;
                let line = format!("{} -> {}", source.display(), destination.display());
                debug!("archived {}", line);
                self.progress.emit("archived", s.processed(), self.discovered.load(Ordering::Relaxed), &line);
            }
            Event::Outcome(ArchiveOutcome::Duplicate { source, destination }) => {
                s.duplicates += 1;
                debug!("duplicate {} == {}", source.display(), destination.display());
                self.progress.report(
                    "duplicate",
                    s.processed(),
                    self.discovered.load(Ordering::Relaxed),
                    &source.display().to_string(),
                );
                s.duplicate_paths.push(source);
            }
            Event::Outcome(ArchiveOutcome::Failed {
                source,
                destination,
                cause,
            }) => {
                s.failed += 1;
                let cause = format!("{cause:#}");
                let target = destination
                    .as_ref()
                    .map(|d| d.display().to_string())
                    .unwrap_or_else(|| "-".to_string());
                warn!("{} failed: {}", source.display(), cause);
                self.progress.emit(
                    "failed",
                    s.processed(),
                    self.discovered.load(Ordering::Relaxed),
                    &format!("[error] {}: {} {}", cause, source.display(), target),
                );
                s.failed_files.push(FailedFile {
                    source,
                    destination,
                    cause,
                });
            }
            Event::Unresolved { source, cause } => {
                s.unresolved += 1;
                debug!("no original time for {}: {}", source.display(), cause);
                self.progress.report(
                    "unresolved",
                    s.processed(),
                    self.discovered.load(Ordering::Relaxed),
                    &source.display().to_string(),
                );
                s.unresolved_paths.push(source);
            }
        }
    }

    pub fn finish(self, ignored_by_extension: BTreeMap<String, u64>, elapsed: Duration) -> ArchiveSummary {
        let mut summary = self.summary;
        summary.ignored_by_extension = ignored_by_extension;
        summary.elapsed_secs = elapsed.as_secs_f64();
        summary.duplicate_paths.sort();
        summary.unresolved_paths.sort();
        summary.failed_files.sort_by(|a, b| a.source.cmp(&b.source));
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExtractError;
    use std::sync::Mutex;

    #[test]
    fn test_aggregator_counts_and_reports() {
        let lines = Mutex::new(Vec::new());
        let callback = |stage: &str, _: u64, _: u64, message: &str| {
            lines.lock().unwrap().push(format!("{stage}: {message}"));
        };
        let tp = ThrottledProgress::new(&callback);
        let discovered = AtomicU64::new(4);
        let mut agg = Aggregator::new(&tp, &discovered);

        agg.record(
            ArchiveOutcome::Archived {
                source: "/s/a.jpg".into(),
                destination: "/d/2020/01/02/a.jpg".into(),
            }
            .into(),
        );
        agg.record(
            ArchiveOutcome::Duplicate {
                source: "/s/b.jpg".into(),
                destination: "/d/2020/01/02/b.jpg".into(),
            }
            .into(),
        );
        agg.record(
            ArchiveOutcome::Failed {
                source: "/s/c.jpg".into(),
                destination: None,
                cause: anyhow::anyhow!("disk full"),
            }
            .into(),
        );
        agg.record(Event::Unresolved {
            source: "/s/d.png".into(),
            cause: ExtractError::NoOriginalTime,
        });

        let mut ignored = BTreeMap::new();
        ignored.insert("txt".to_string(), 2);
        let summary = agg.finish(ignored, Duration::from_millis(1500));

        assert_eq!(summary.processed(), 4);
        assert_eq!(summary.ignored(), 2);
        assert_eq!(summary.duplicate_paths, vec![PathBuf::from("/s/b.jpg")]);
        assert_eq!(summary.failed_files[0].cause, "disk full");

        let lines = lines.into_inner().unwrap();
        assert!(lines.contains(&"archived: /s/a.jpg -> /d/2020/01/02/a.jpg".to_string()));
        assert!(lines.contains(&"failed: [error] disk full: /s/c.jpg -".to_string()));
    }

    #[test]
    fn test_write_report() {
        let summary = ArchiveSummary {
            archived: 1,
            failed: 1,
            failed_files: vec![FailedFile {
                source: "/s/c.jpg".into(),
                destination: Some("/d/c.jpg".into()),
                cause: "conflict".into(),
            }],
            elapsed_secs: 0.5,
            ..Default::default()
        };
        let mut out = Vec::new();
        summary.write_report(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Archived:   1"));
        assert!(text.contains("Failed files:\n  /s/c.jpg -> /d/c.jpg: conflict"));
        assert!(!text.contains("Duplicates:\n"));
    }
}
