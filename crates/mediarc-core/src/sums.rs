//! Checksum listing: a client sends root-relative paths, the peer hashes
//! the files it holds under its own root and answers `path\tchecksum`.

use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, BufWriter, LineWriter, Lines, Write};
use std::net::{Shutdown, TcpStream};
use std::path::{Component, Path};
use std::sync::mpsc::SyncSender;
use std::thread;

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::checksum::Checksum;
use crate::error::{ArchiveError, ProtocolError};
use crate::pipeline::join;
use crate::protocol::{is_wire_safe, SumLine, SumRequest};
use crate::queue::{self, QUEUE_CAPACITY};
use crate::server::resolve;

/// Hashing workers per connection.
pub const SUM_WORKERS: usize = 4;

/// A checksum reported by the peer, `None` if it has no readable file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSum {
    pub path: String,
    pub checksum: Option<String>,
}

/// Serve one listing client until it disconnects. Each batch ends with `.`,
/// sent only after every answer of that batch.
pub fn handle_connection(stream: TcpStream, root: &Path) -> Result<(), ProtocolError> {
    let mut lines = BufReader::new(stream.try_clone()?).lines();
    let mut out = LineWriter::new(stream);

    while let Some(answered) = answer_batch(&mut lines, &mut out, root)? {
        SumLine::End.write_to(&mut out)?;
        info!("listing done, {} checksum(s) sent", answered);
    }
    Ok(())
}

/// Hash one batch on `SUM_WORKERS` threads. `None` once the client hung up
/// without closing the batch.
fn answer_batch<B: BufRead, W: Write + Send>(
    lines: &mut Lines<B>,
    out: &mut W,
    root: &Path,
) -> Result<Option<u64>, ProtocolError> {
    let (job_tx, job_rx) = queue::bounded::<String>(QUEUE_CAPACITY);
    let (sum_tx, sum_rx) = queue::bounded::<SumLine>(QUEUE_CAPACITY);

    let (ended, answered) = thread::scope(|s| {
        for _ in 0..SUM_WORKERS {
            let job_rx = job_rx.clone();
            let sum_tx = sum_tx.clone();
            s.spawn(move || {
                for path in job_rx.iter() {
                    let checksum = checksum_under(root, &path);
                    if sum_tx.send(SumLine::Sum { path, checksum }).is_err() {
                        break;
                    }
                }
            });
        }
        drop(job_rx);
        drop(sum_tx);

        let writer = s.spawn(move || -> io::Result<u64> {
            let mut answered = 0;
            for line in sum_rx.iter() {
                line.write_to(&mut *out)?;
                answered += 1;
            }
            Ok(answered)
        });

        let ended = read_paths(lines, &job_tx);
        drop(job_tx);
        (ended, join(writer))
    });

    let answered = answered?;
    Ok(ended?.then_some(answered))
}

/// Queue requested paths until `.`; `false` on end of stream or when the
/// workers are gone.
fn read_paths<B: BufRead>(lines: &mut Lines<B>, jobs: &SyncSender<String>) -> Result<bool, ProtocolError> {
    for line in lines {
        match SumRequest::parse(&line?) {
            None => continue,
            Some(SumRequest::End) => return Ok(true),
            Some(SumRequest::Path(path)) => {
                if jobs.send(path).is_err() {
                    return Ok(false);
                }
            }
        }
    }
    Ok(false)
}

fn checksum_under(root: &Path, relative: &str) -> Option<String> {
    let Some(local) = resolve(root, relative) else {
        warn!("rejecting path outside root: {:?}", relative);
        return None;
    };
    match Checksum::of_file(&local) {
        Ok(sum) => {
            debug!("{} {}", relative, sum);
            Some(sum.to_hex())
        }
        Err(e) => {
            warn!("cannot read {}: {}", local.display(), e);
            None
        }
    }
}

/// Every regular file under `root` as a `/`-separated relative path.
/// Paths that cannot travel on the wire are skipped with a warning.
pub fn relative_files(root: &Path) -> io::Result<Vec<String>> {
    let mut paths = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let parts: Option<Vec<&str>> = relative
            .components()
            .map(|c| match c {
                Component::Normal(part) => part.to_str(),
                _ => None,
            })
            .collect();
        match parts.map(|p| p.join("/")) {
            Some(path) if is_wire_safe(&path) => paths.push(path),
            _ => warn!("skipping {}: cannot be sent to the peer", entry.path().display()),
        }
    }
    Ok(paths)
}

/// Ask the listing peer at `addr` for the checksum of each of `paths`.
///
/// Answers are returned in the order they arrive. Every path gets exactly
/// one answer or the call fails.
pub fn fetch(addr: &str, paths: &[String]) -> Result<Vec<RemoteSum>, ArchiveError> {
    let stream = TcpStream::connect(addr).map_err(|source| ArchiveError::Connect {
        addr: addr.to_string(),
        source,
    })?;
    let write_half = stream.try_clone().map_err(ProtocolError::from)?;

    let mut outstanding: HashMap<&str, usize> = HashMap::new();
    for path in paths {
        *outstanding.entry(path.as_str()).or_default() += 1;
    }

    let (sent, received) = thread::scope(|s| {
        let sender = s.spawn(move || -> io::Result<()> {
            let mut out = BufWriter::new(write_half);
            for path in paths {
                SumRequest::Path(path.clone()).write_to(&mut out)?;
            }
            SumRequest::End.write_to(&mut out)?;
            out.flush()
        });

        let received = read_sums(&stream, &mut outstanding, paths.len());
        if received.is_err() {
            // Unblock the sender if the peer stopped reading.
            let _ = stream.shutdown(Shutdown::Both);
        }
        (join(sender), received)
    });

    let sums = received?;
    sent.map_err(ProtocolError::from)?;
    Ok(sums)
}

fn read_sums(
    stream: &TcpStream,
    outstanding: &mut HashMap<&str, usize>,
    expected: usize,
) -> Result<Vec<RemoteSum>, ProtocolError> {
    let mut sums = Vec::with_capacity(expected);
    for line in BufReader::new(stream).lines() {
        match SumLine::parse(&line?)? {
            None => continue,
            Some(SumLine::End) => {
                let left = expected - sums.len();
                if left > 0 {
                    return Err(ProtocolError::Unanswered(left));
                }
                return Ok(sums);
            }
            Some(SumLine::Sum { path, checksum }) => {
                match outstanding.get_mut(path.as_str()) {
                    Some(n) if *n > 0 => *n -= 1,
                    _ => return Err(ProtocolError::UnexpectedResponse(path)),
                }
                sums.push(RemoteSum { path, checksum });
            }
        }
    }
    Err(ProtocolError::Disconnected)
}
