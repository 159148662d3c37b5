//! Line protocol between the archiver and a verification peer.
//!
//! ```text
//! request:  <destination-relative-path>\t<hex-checksum>\n
//! response: <destination-relative-path>\t<ok|miss>\n
//! both:     done\tdone\n   (end of batch / its acknowledgement)
//! ```
//!
//! Blank lines are ignored. Any other line with fewer than two
//! tab-separated fields is a protocol error.
//!
//! A checksum listing peer (`serve --sums`) speaks a simpler dialect:
//!
//! ```text
//! request:  <root-relative-path>\n
//! response: <root-relative-path>\t<hex-checksum|miss>\n
//! both:     .\n   (end of batch / its acknowledgement)
//! ```
//!
//! Listing answers come back in completion order, not request order.

use std::fmt;
use std::io::{self, Write};

use crate::error::ProtocolError;

pub const DONE: &str = "done";
pub const OK: &str = "ok";
pub const MISS: &str = "miss";
pub const END: &str = ".";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Verify { path: String, checksum: String },
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Verdict { path: String, matched: bool },
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SumRequest {
    Path(String),
    End,
}

/// One answer of a checksum listing; `checksum` is `None` when the peer
/// has no readable file at `path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SumLine {
    Sum { path: String, checksum: Option<String> },
    End,
}

/// Split a line into its first two fields; `None` for a blank line.
fn fields(line: &str) -> Result<Option<(&str, &str)>, ProtocolError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Ok(None);
    }
    let mut parts = line.split('\t');
    match (parts.next(), parts.next()) {
        (Some(first), Some(second)) => Ok(Some((first, second.trim()))),
        _ => Err(ProtocolError::MissingField(line.to_string())),
    }
}

/// A path can travel on the wire only if it has no field or line separators.
pub fn is_wire_safe(path: &str) -> bool {
    !path.is_empty() && !path.contains(['\t', '\n', '\r'])
}

impl Request {
    pub fn parse(line: &str) -> Result<Option<Self>, ProtocolError> {
        Ok(fields(line)?.map(|(path, checksum)| {
            if path == DONE && checksum == DONE {
                Request::Done
            } else {
                Request::Verify {
                    path: path.to_string(),
                    checksum: checksum.to_string(),
                }
            }
        }))
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        writeln!(w, "{self}")
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::Verify { path, checksum } => write!(f, "{path}\t{checksum}"),
            Request::Done => write!(f, "{DONE}\t{DONE}"),
        }
    }
}

impl Response {
    pub fn parse(line: &str) -> Result<Option<Self>, ProtocolError> {
        let Some((path, status)) = fields(line)? else {
            return Ok(None);
        };
        let response = match status {
            DONE if path == DONE => Response::Done,
            OK => Response::Verdict {
                path: path.to_string(),
                matched: true,
            },
            MISS => Response::Verdict {
                path: path.to_string(),
                matched: false,
            },
            _ => return Err(ProtocolError::UnknownStatus(line.trim_end().to_string())),
        };
        Ok(Some(response))
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        writeln!(w, "{self}")
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Verdict { path, matched } => {
                write!(f, "{path}\t{}", if *matched { OK } else { MISS })
            }
            Response::Done => write!(f, "{DONE}\t{DONE}"),
        }
    }
}

impl SumRequest {
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        match line.trim() {
            "" => None,
            END => Some(SumRequest::End),
            _ => Some(SumRequest::Path(line.to_string())),
        }
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        writeln!(w, "{self}")
    }
}

impl fmt::Display for SumRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SumRequest::Path(path) => f.write_str(path),
            SumRequest::End => f.write_str(END),
        }
    }
}

impl SumLine {
    pub fn parse(line: &str) -> Result<Option<Self>, ProtocolError> {
        if line.trim() == END {
            return Ok(Some(SumLine::End));
        }
        Ok(fields(line)?.map(|(path, sum)| SumLine::Sum {
            path: path.to_string(),
            checksum: (sum != MISS).then(|| sum.to_string()),
        }))
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        writeln!(w, "{self}")
    }
}

impl fmt::Display for SumLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SumLine::Sum { path, checksum } => write!(f, "{path}\t{}", checksum.as_deref().unwrap_or(MISS)),
            SumLine::End => f.write_str(END),
        }
    }
}
