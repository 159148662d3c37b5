use std::collections::{HashMap, VecDeque};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::net::{Shutdown, TcpStream};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};

use anyhow::Context;
use tracing::{debug, warn};

use crate::checksum::Checksum;
use crate::error::{ArchiveError, ProtocolError};
use crate::media::{CompareOutcome, CompareTask};
use crate::protocol::{is_wire_safe, Request, Response};
use crate::verify::{precheck, Completion};

/// Requests sent but not yet answered, keyed by destination-relative path.
///
/// Answers carry only the path, so two requests for the same path are
/// matched to answers in the order they were sent.
#[derive(Default)]
struct PendingTable {
    inner: RwLock<HashMap<String, VecDeque<(CompareTask, Checksum)>>>,
}

impl PendingTable {
    fn insert(&self, path: String, task: CompareTask, checksum: Checksum) {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        map.entry(path).or_default().push_back((task, checksum));
    }

    fn take(&self, path: &str) -> Option<(CompareTask, Checksum)> {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let queue = map.get_mut(path)?;
        let entry = queue.pop_front();
        if queue.is_empty() {
            map.remove(path);
        }
        entry
    }

    fn contains(&self, path: &str) -> bool {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        map.contains_key(path)
    }

    fn in_flight(&self) -> usize {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        map.values().map(VecDeque::len).sum()
    }
}

/// A session with a `serve` peer that owns the destination tree.
///
/// Any worker may submit; one reader thread delivers answers through the
/// `Completion` given at connect time.
pub struct RemoteVerifier {
    root: PathBuf,
    stream: TcpStream,
    writer: Mutex<BufWriter<TcpStream>>,
    pending: Arc<PendingTable>,
    done_sent: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<Result<(), ProtocolError>>>>,
}

impl RemoteVerifier {
    pub fn connect(addr: &str, destination_root: &Path, completion: Completion) -> Result<Self, ArchiveError> {
        let connect_err = |source: io::Error| ArchiveError::Connect {
            addr: addr.to_string(),
            source,
        };
        let stream = TcpStream::connect(addr).map_err(connect_err)?;
        stream.set_nodelay(true).map_err(connect_err)?;
        let read_half = stream.try_clone().map_err(connect_err)?;
        let write_half = stream.try_clone().map_err(connect_err)?;
        debug!("connected to verification peer {}", addr);

        let pending = Arc::new(PendingTable::default());
        let done_sent = Arc::new(AtomicBool::new(false));
        let reader = {
            let pending = Arc::clone(&pending);
            let done_sent = Arc::clone(&done_sent);
            thread::spawn(move || {
                let shutdown = read_half.try_clone();
                let result = read_responses(read_half, &pending, &done_sent, &completion);
                if let Err(e) = &result {
                    warn!("verification session ended: {}", e);
                    // Unblock submitters still writing to a dead session.
                    if let Ok(stream) = shutdown {
                        let _ = stream.shutdown(Shutdown::Both);
                    }
                }
                result
            })
        };

        Ok(Self {
            root: destination_root.to_path_buf(),
            stream,
            writer: Mutex::new(BufWriter::new(write_half)),
            pending,
            done_sent,
            reader: Mutex::new(Some(reader)),
        })
    }

    /// `/root/2020/01/02/a.jpg` -> `2020/01/02/a.jpg`
    fn wire_path(&self, destination: &Path) -> anyhow::Result<String> {
        let relative = destination
            .strip_prefix(&self.root)
            .with_context(|| format!("{} is outside the destination root", destination.display()))?;
        let mut parts = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => parts.push(
                    part.to_str()
                        .with_context(|| format!("non UTF-8 path: {}", destination.display()))?,
                ),
                _ => anyhow::bail!("unexpected path component in {}", destination.display()),
            }
        }
        let path = parts.join("/");
        if !is_wire_safe(&path) {
            anyhow::bail!("path cannot be sent to the peer: {:?}", path);
        }
        Ok(path)
    }

    /// Local checks plus everything needed for a request, or `None` if the
    /// files already differ.
    fn prepare(&self, task: &CompareTask) -> anyhow::Result<Option<(String, Checksum)>> {
        if !precheck(task)? {
            return Ok(None);
        }
        let path = self.wire_path(&task.destination)?;
        let checksum =
            Checksum::of_file(&task.source).with_context(|| format!("cannot read {}", task.source.display()))?;
        Ok(Some((path, checksum)))
    }

    pub fn submit(&self, task: CompareTask, completion: &Completion) -> Result<bool, ArchiveError> {
        let (path, checksum) = match self.prepare(&task) {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(completion.complete(task, Ok(CompareOutcome { is_duplicate: false }), None)),
            Err(cause) => return Ok(completion.complete(task, Err(cause), None)),
        };

        let request = Request::Verify {
            path: path.clone(),
            checksum: checksum.to_hex(),
        };

        // Registration and the write happen under one lock so answers for a
        // repeated path line up with the order the requests hit the wire.
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if self.pending.contains(&path) {
            debug!("{} already in flight", path);
        }
        self.pending.insert(path, task, checksum);
        request
            .write_to(&mut *writer)
            .and_then(|()| writer.flush())
            .map_err(ProtocolError::from)?;
        Ok(true)
    }

    /// Send `done`, then wait for the reader to see the acknowledgement.
    /// Every submitted task has been completed once this returns `Ok`.
    pub fn finish(&self) -> Result<(), ArchiveError> {
        let sent = {
            let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
            self.done_sent.store(true, Ordering::SeqCst);
            Request::Done.write_to(&mut *writer).and_then(|()| writer.flush())
        };

        let handle = self.reader.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            match handle.join() {
                Ok(result) => result?,
                Err(panic) => std::panic::resume_unwind(panic),
            }
        }
        sent.map_err(ProtocolError::from)?;

        let left = self.pending.in_flight();
        if left > 0 {
            return Err(ProtocolError::Unanswered(left).into());
        }
        Ok(())
    }
}

impl Drop for RemoteVerifier {
    fn drop(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

fn read_responses(
    stream: TcpStream,
    pending: &PendingTable,
    done_sent: &AtomicBool,
    completion: &Completion,
) -> Result<(), ProtocolError> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Err(ProtocolError::Disconnected);
        }
        match Response::parse(&line)? {
            None => continue,
            Some(Response::Done) => {
                if !done_sent.load(Ordering::SeqCst) {
                    return Err(ProtocolError::EarlyAck);
                }
                let left = pending.in_flight();
                if left > 0 {
                    return Err(ProtocolError::Unanswered(left));
                }
                return Ok(());
            }
            Some(Response::Verdict { path, matched }) => {
                let Some((task, checksum)) = pending.take(&path) else {
                    return Err(ProtocolError::UnexpectedResponse(path));
                };
                let outcome = CompareOutcome { is_duplicate: matched };
                if !completion.complete(task, Ok(outcome), Some(checksum)) {
                    debug!("dropping answer for {}: pipeline is shutting down", path);
                }
            }
        }
    }
}
