pub mod checksum;
pub mod date;
pub mod error;
pub mod media;
pub mod pipeline;
pub mod placement;
pub mod protocol;
pub mod queue;
pub mod report;
pub mod server;
pub mod sums;
pub mod verify;
pub mod walk;
pub mod writer;

use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

pub use error::{ArchiveError, ExtractError, ProtocolError};
pub use report::ArchiveSummary;

fn default_concurrency() -> usize {
    1
}

/// How an occupied destination is checked against its source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum VerifierConfig {
    /// Compare bytes on this machine.
    #[default]
    Local,
    /// Ask a `serve` peer that owns the destination tree to compare checksums.
    Remote { host: String, port: u16 },
}

impl VerifierConfig {
    pub fn remote_addr(&self) -> Option<String> {
        match self {
            VerifierConfig::Local => None,
            VerifierConfig::Remote { host, port } => Some(format!("{host}:{port}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveOptions {
    pub source: PathBuf,
    pub destination: PathBuf,
    /// Workers per pipeline stage
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Rename source files into place instead of copying them
    #[serde(default)]
    pub move_files: bool,
    #[serde(default)]
    pub verifier: VerifierConfig,
}

impl ArchiveOptions {
    pub fn new(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            concurrency: default_concurrency(),
            move_files: false,
            verifier: VerifierConfig::Local,
        }
    }

    pub fn workers(&self) -> usize {
        self.concurrency.max(1)
    }
}

/// Type alias for progress callback: `(stage, current, total, message)`.
/// A `total` of zero means the total is not known yet.
pub type ProgressCallback<'a> = dyn Fn(&str, u64, u64, &str) + Send + Sync + 'a;

/// Throttled progress reporter: emits at most every 200ms or on completion.
pub struct ThrottledProgress<'a> {
    inner: &'a ProgressCallback<'a>,
    last_emit: Mutex<Instant>,
}

impl<'a> ThrottledProgress<'a> {
    pub fn new(inner: &'a ProgressCallback<'a>) -> Self {
        Self {
            inner,
            last_emit: Mutex::new(Instant::now() - Duration::from_secs(1)),
        }
    }

    pub fn report(&self, stage: &str, current: u64, total: u64, message: &str) {
        let is_done = total > 0 && current + 1 >= total;
        if !is_done {
            let mut last = self.last_emit.lock().unwrap_or_else(PoisonError::into_inner);
            if last.elapsed().as_millis() < 200 {
                return;
            }
            *last = Instant::now();
        }
        (self.inner)(stage, current, total, message);
    }

    /// Forward without throttling.
    pub fn emit(&self, stage: &str, current: u64, total: u64, message: &str) {
        (self.inner)(stage, current, total, message);
    }
}

/// Archive every media file under `options.source` into
/// `options.destination/YYYY/MM/DD/`.
pub fn archive(options: &ArchiveOptions, progress_callback: &ProgressCallback<'_>) -> anyhow::Result<ArchiveSummary> {
    pipeline::run(options, progress_callback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_throttled_progress() {
        let calls = Mutex::new(Vec::new());
        let callback = |stage: &str, current: u64, _: u64, _: &str| {
            calls.lock().unwrap().push((stage.to_string(), current));
        };
        let tp = ThrottledProgress::new(&callback);

        tp.report("scan", 0, 0, "first");
        tp.report("scan", 1, 0, "throttled");
        tp.report("scan", 9, 10, "done");
        tp.emit("archived", 2, 0, "always");

        let calls = calls.into_inner().unwrap();
        assert_eq!(
            calls,
            vec![
                ("scan".to_string(), 0),
                ("scan".to_string(), 9),
                ("archived".to_string(), 2)
            ]
        );
    }

    #[test]
    fn test_throttled_progress_survives_poisoned_clock() {
        let calls = Mutex::new(Vec::new());
        let callback = |_: &str, current: u64, _: u64, _: &str| {
            calls.lock().unwrap().push(current);
        };
        let tp = ThrottledProgress::new(&callback);

        let _ = thread::scope(|s| {
            s.spawn(|| {
                let _guard = tp.last_emit.lock().unwrap();
                panic!("poison the clock");
            })
            .join()
        });
        assert!(tp.last_emit.is_poisoned());

        tp.report("scan", 1, 0, "first");
        tp.report("scan", 2, 0, "throttled");
        tp.report("scan", 4, 5, "done");

        assert_eq!(calls.into_inner().unwrap(), vec![1, 4]);
    }

    #[test]
    fn test_options_from_json() {
        let options: ArchiveOptions = serde_json::from_str(
            r#"{"source": "/in", "destination": "/out",
                "verifier": {"mode": "remote", "host": "nas", "port": 3333}}"#,
        )
        .unwrap();
        assert_eq!(options.workers(), 1);
        assert!(!options.move_files);
        assert_eq!(options.verifier.remote_addr().as_deref(), Some("nas:3333"));
    }
}
