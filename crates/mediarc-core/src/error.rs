use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Why no original time could be extracted from a file.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The movie header lives in a compressed `cmov` atom.
    #[error("unsupported: compressed movie header")]
    CompressedHeader,

    #[error("malformed container: {0}")]
    MalformedContainer(String),

    #[error("EXIF error: {0}")]
    Exif(#[from] exif::Error),

    #[error("original time not found")]
    NoOriginalTime,
}

/// Violations of the line protocol spoken with the verification peer.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("line has fewer than two fields: {0:?}")]
    MissingField(String),

    #[error("unknown status in response: {0:?}")]
    UnknownStatus(String),

    #[error("response for a path with no request in flight: {0}")]
    UnexpectedResponse(String),

    #[error("peer acknowledged the batch before it was complete")]
    EarlyAck,

    #[error("peer closed the connection before acknowledging the batch")]
    Disconnected,

    #[error("peer acknowledged the batch with {0} request(s) unanswered")]
    Unanswered(usize),

    #[error("connection error: {0}")]
    Io(#[from] io::Error),
}

/// Conditions that abort a whole archive run.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("source root is not a directory: {0}")]
    SourceRoot(PathBuf),

    #[error("destination root is unusable: {0}")]
    DestinationRoot(PathBuf),

    #[error("cannot connect to verification peer {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("remote verification failed: {0}")]
    Protocol(#[from] ProtocolError),
}
