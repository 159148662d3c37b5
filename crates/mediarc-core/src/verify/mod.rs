//! Duplicate verification for destinations that are already occupied.
//!
//! Both strategies first require the destination to have the same size and
//! original time as the source. `Local` then compares bytes; `Remote` sends
//! the source checksum to a peer that owns the destination tree.

pub mod local;
pub mod remote;

use std::fs;
use std::path::Path;
use std::sync::mpsc::SyncSender;

use anyhow::Context;
use tracing::debug;

use crate::checksum::Checksum;
use crate::date;
use crate::error::ArchiveError;
use crate::media::{ArchiveOutcome, CompareOutcome, CompareTask, CopyTask, Event};
use crate::VerifierConfig;

pub use local::LocalVerifier;
pub use remote::RemoteVerifier;

/// Whether the destination's size and original time match the source's.
pub fn precheck(task: &CompareTask) -> anyhow::Result<bool> {
    let source_len = fs::metadata(&task.source)
        .with_context(|| format!("cannot stat {}", task.source.display()))?
        .len();
    let destination_len = fs::metadata(&task.destination)
        .with_context(|| format!("cannot stat {}", task.destination.display()))?
        .len();
    if source_len != destination_len {
        return Ok(false);
    }

    match date::original_time(&task.destination) {
        Ok(time) => Ok(time == task.source_time),
        Err(e) => {
            debug!("no original time for {}: {}", task.destination.display(), e);
            Ok(false)
        }
    }
}

/// Routes a finished comparison onwards: duplicates and failures to the
/// aggregator, conflicts back to the copy queue under a disambiguated name.
#[derive(Clone)]
pub struct Completion {
    copies: SyncSender<CopyTask>,
    events: SyncSender<Event>,
}

impl Completion {
    pub fn new(copies: SyncSender<CopyTask>, events: SyncSender<Event>) -> Self {
        Self { copies, events }
    }

    /// Queue a transfer. Returns false if the copy stage is gone.
    pub fn send_copy(&self, task: CopyTask) -> bool {
        self.copies.send(task).is_ok()
    }

    /// Returns false if the aggregator is gone.
    pub fn send_event(&self, event: Event) -> bool {
        self.events.send(event).is_ok()
    }

    /// Route the result of verifying `task`. Returns false if the next
    /// stage is gone.
    pub fn complete(
        &self,
        task: CompareTask,
        result: anyhow::Result<CompareOutcome>,
        checksum: Option<Checksum>,
    ) -> bool {
        match result {
            Ok(CompareOutcome { is_duplicate: true }) => self.send_event(
                ArchiveOutcome::Duplicate {
                    source: task.source,
                    destination: task.destination,
                }
                .into(),
            ),
            Ok(CompareOutcome { is_duplicate: false }) => self.send_copy(CopyTask::conflicting(task, checksum)),
            Err(cause) => self.send_event(
                ArchiveOutcome::Failed {
                    source: task.source,
                    destination: Some(task.destination),
                    cause,
                }
                .into(),
            ),
        }
    }
}

/// The configured verification strategy.
pub enum Verifier {
    Local(LocalVerifier),
    Remote(RemoteVerifier),
}

impl Verifier {
    /// Build the verifier selected by `config`. The remote strategy connects
    /// right away and hands `completion` to its response reader.
    pub fn connect(config: &VerifierConfig, destination_root: &Path, completion: Completion) -> Result<Self, ArchiveError> {
        match config.remote_addr() {
            None => Ok(Verifier::Local(LocalVerifier)),
            Some(addr) => Ok(Verifier::Remote(RemoteVerifier::connect(
                &addr,
                destination_root,
                completion,
            )?)),
        }
    }

    /// Start verifying `task`. The local strategy completes it before
    /// returning; the remote one completes it when the peer answers.
    ///
    /// `Ok(false)` means the next stage is gone and the caller should stop.
    pub fn submit(&self, task: CompareTask, completion: &Completion) -> Result<bool, ArchiveError> {
        match self {
            Verifier::Local(local) => {
                let result = local.verify(&task);
                Ok(completion.complete(task, result, None))
            }
            Verifier::Remote(remote) => remote.submit(task, completion),
        }
    }

    /// Wait until every submitted task has been completed.
    pub fn finish(&self) -> Result<(), ArchiveError> {
        match self {
            Verifier::Local(_) => Ok(()),
            Verifier::Remote(remote) => remote.finish(),
        }
    }
}
