//! Stage wiring for an archive run.
//!
//! ```text
//! walk -> paths -> extract xN -> records -> resolve -+-> copies -> copy xN ---> events -> aggregate
//!                                                    +-> compares -> verify xN -+  ^
//!                                                        (conflicts re-enter copies)|
//! ```
//!
//! A verifier can turn a comparison into a new copy task, so the copy queue
//! must stay open until every comparison has been answered. Shutdown runs
//! in this order: compare queue closed, verifier workers joined, verifier
//! finished (remote ack received), copy queue closed, copy workers joined.

use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::mpsc::SyncSender;
use std::thread::{self, ScopedJoinHandle};
use std::time::Instant;

use tracing::{debug, info};

use crate::date;
use crate::error::ArchiveError;
use crate::media::{CompareTask, CopyTask, Event, MediaRecord};
use crate::placement::{self, Placement};
use crate::queue::{self, SharedReceiver, QUEUE_CAPACITY};
use crate::report::{Aggregator, ArchiveSummary};
use crate::verify::{Completion, Verifier};
use crate::walk;
use crate::writer::CopyExecutor;
use crate::{ArchiveOptions, ProgressCallback, ThrottledProgress};

pub(crate) fn join<T>(handle: ScopedJoinHandle<'_, T>) -> T {
    match handle.join() {
        Ok(value) => value,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

/// Run one archive pass as configured by `options`.
pub fn run(options: &ArchiveOptions, progress_callback: &ProgressCallback<'_>) -> anyhow::Result<ArchiveSummary> {
    let started = Instant::now();
    if !options.source.is_dir() {
        return Err(ArchiveError::SourceRoot(options.source.clone()).into());
    }
    if let Err(e) = placement::ensure_dir(&options.destination) {
        debug!("cannot create {}: {}", options.destination.display(), e);
        return Err(ArchiveError::DestinationRoot(options.destination.clone()).into());
    }

    let tp = ThrottledProgress::new(progress_callback);
    let discovered = AtomicU64::new(0);
    let workers = options.workers();

    let (path_tx, path_rx) = queue::bounded::<PathBuf>(QUEUE_CAPACITY);
    let (record_tx, record_rx) = queue::bounded::<MediaRecord>(QUEUE_CAPACITY);
    let (copy_tx, copy_rx) = queue::bounded::<CopyTask>(QUEUE_CAPACITY);
    let (event_tx, event_rx) = queue::bounded::<Event>(QUEUE_CAPACITY);

    // Connect before walking so an unreachable peer costs nothing.
    let completion = Completion::new(copy_tx, event_tx.clone());
    let verifier = Verifier::connect(&options.verifier, &options.destination, completion.clone())?;

    info!(
        "archiving {} -> {} ({} worker(s) per stage)",
        options.source.display(),
        options.destination.display(),
        workers
    );

    let mut aggregator = Aggregator::new(&tp, &discovered);
    let (ignored, result) = thread::scope(|s| {
        let (tp, discovered) = (&tp, &discovered);

        let walker = s.spawn(move || walk::walk(&options.source, &path_tx, discovered, tp).ignored);
        let extractor = s.spawn(move || extract_stage(workers, path_rx, record_tx));
        let archiver = s.spawn(move || {
            let stage = ArchiveStage {
                options,
                verifier,
                completion,
                events: event_tx,
            };
            stage.run(record_rx, copy_rx)
        });

        // The event queue closes only after every stage above has finished.
        for event in event_rx.iter() {
            aggregator.record(event);
        }

        let ignored = join(walker);
        join(extractor);
        (ignored, join(archiver))
    });

    result?;
    let summary = aggregator.finish(ignored, started.elapsed());
    info!(
        "done in {:.2}s: {} archived, {} duplicate(s), {} failed, {} without time",
        summary.elapsed_secs, summary.archived, summary.duplicates, summary.failed, summary.unresolved
    );
    Ok(summary)
}

/// Extract original times with `workers` threads. The record queue closes
/// once every worker has returned.
fn extract_stage(workers: usize, paths: SharedReceiver<PathBuf>, records: SyncSender<MediaRecord>) {
    thread::scope(|s| {
        for _ in 0..workers {
            let paths = paths.clone();
            let records = records.clone();
            s.spawn(move || {
                for source in paths.iter() {
                    let time = date::original_time(&source);
                    if records.send(MediaRecord { source, time }).is_err() {
                        break;
                    }
                }
            });
        }
        drop(paths);
    });
    drop(records);
}

/// Placement, verification and transfer.
struct ArchiveStage<'a> {
    options: &'a ArchiveOptions,
    verifier: Verifier,
    /// Handle on the copy and event queues; the copy queue closes when the
    /// last clone is dropped.
    completion: Completion,
    events: SyncSender<Event>,
}

impl ArchiveStage<'_> {
    fn run(self, records: SharedReceiver<MediaRecord>, copies: SharedReceiver<CopyTask>) -> Result<(), ArchiveError> {
        let ArchiveStage {
            options,
            verifier,
            completion,
            events,
        } = self;
        let workers = options.workers();
        let executor = CopyExecutor::new(options.move_files);
        let (compare_tx, compare_rx) = queue::bounded::<CompareTask>(QUEUE_CAPACITY);

        thread::scope(|s| {
            let copiers: Vec<_> = (0..workers)
                .map(|_| {
                    let copies = copies.clone();
                    let events = events.clone();
                    s.spawn(move || {
                        for task in copies.iter() {
                            if events.send(executor.execute(task).into()).is_err() {
                                break;
                            }
                        }
                    })
                })
                .collect();
            drop(copies);
            drop(events);

            let verifier = &verifier;
            let verifiers: Vec<_> = (0..workers)
                .map(|_| {
                    let compares = compare_rx.clone();
                    let completion = completion.clone();
                    s.spawn(move || -> Result<(), ArchiveError> {
                        for task in compares.iter() {
                            if !verifier.submit(task, &completion)? {
                                break;
                            }
                        }
                        Ok(())
                    })
                })
                .collect();
            drop(compare_rx);

            let mut first_error = resolve(&options.destination, records, &compare_tx, &completion).err();

            drop(compare_tx);
            for handle in verifiers {
                if let Err(e) = join(handle) {
                    first_error.get_or_insert(e);
                }
            }
            if let Err(e) = verifier.finish() {
                first_error.get_or_insert(e);
            }
            // Every comparison is answered: nothing else can create a copy task.
            drop(completion);
            for handle in copiers {
                join(handle);
            }

            first_error.map_or(Ok(()), Err)
        })
    }
}

/// Route each record to the copy or compare queue. Stops when a downstream
/// queue is gone or the destination root becomes unusable.
fn resolve(
    root: &std::path::Path,
    records: SharedReceiver<MediaRecord>,
    compares: &SyncSender<CompareTask>,
    completion: &Completion,
) -> Result<(), ArchiveError> {
    for record in records.iter() {
        let sent = match placement::place(root, record)? {
            Placement::Copy(task) => completion.send_copy(task),
            Placement::Compare(task) => compares.send(task).is_ok(),
            Placement::Unresolved { source, cause } => completion.send_event(Event::Unresolved { source, cause }),
            Placement::Failed(outcome) => completion.send_event(outcome.into()),
        };
        if !sent {
            debug!("resolver stopping: downstream closed");
            break;
        }
    }
    Ok(())
}
