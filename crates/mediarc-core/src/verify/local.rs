use anyhow::Context;

use crate::checksum::files_equal;
use crate::media::{CompareOutcome, CompareTask};
use crate::verify::precheck;

/// Verifies duplicates by reading both files on this machine.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalVerifier;

impl LocalVerifier {
    pub fn verify(&self, task: &CompareTask) -> anyhow::Result<CompareOutcome> {
        if !precheck(task)? {
            return Ok(CompareOutcome { is_duplicate: false });
        }
        let is_duplicate = files_equal(&task.source, &task.destination).with_context(|| {
            format!(
                "cannot compare {} with {}",
                task.source.display(),
                task.destination.display()
            )
        })?;
        Ok(CompareOutcome { is_duplicate })
    }
}
