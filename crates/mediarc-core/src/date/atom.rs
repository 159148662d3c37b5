//! Creation time from the movie header of QuickTime / MP4 containers.
//!
//! A container is a sequence of atoms: a 4-byte big-endian size (header
//! included), a 4-byte ASCII tag and the payload. Only the headers of
//! top-level atoms are read until `moov` is found; its first child must be
//! the `mvhd` movie header.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use chrono::{DateTime, Local};

use crate::date::OriginalTime;
use crate::error::ExtractError;

/// Seconds between the container epoch (1904-01-01 UTC) and the Unix epoch.
pub const EPOCH_ADJUSTER: i64 = 2_082_844_800;

const HEADER_SIZE: u64 = 8;

struct AtomHeader {
    /// Total atom size, header included. Zero means "extends to end of file".
    size: u64,
    kind: [u8; 4],
    header_len: u64,
}

fn read_header<R: Read>(reader: &mut R) -> io::Result<AtomHeader> {
    let mut buf = [0u8; HEADER_SIZE as usize];
    reader.read_exact(&mut buf)?;
    let mut size = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as u64;
    let kind = [buf[4], buf[5], buf[6], buf[7]];
    let mut header_len = HEADER_SIZE;

    // 64-bit extended size follows the tag
    if size == 1 {
        let mut ext = [0u8; 8];
        reader.read_exact(&mut ext)?;
        size = u64::from_be_bytes(ext);
        header_len += 8;
    }

    Ok(AtomHeader {
        size,
        kind,
        header_len,
    })
}

fn tag_name(kind: &[u8; 4]) -> String {
    String::from_utf8_lossy(kind).into_owned()
}

/// Read the `mvhd` creation time, in seconds since the Unix epoch.
///
/// Returns `Ok(None)` when the stored timestamp is at or before the Unix
/// epoch, which cameras write when the clock was never set.
pub fn movie_creation_timestamp<R: Read + Seek>(reader: &mut R) -> Result<Option<i64>, ExtractError> {
    loop {
        let header = read_header(reader)?;
        if &header.kind == b"moov" {
            break;
        }
        if header.size == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "no 'moov' atom before end of file").into());
        }
        if header.size < header.header_len {
            return Err(ExtractError::MalformedContainer(format!(
                "atom '{}' has invalid size {}",
                tag_name(&header.kind),
                header.size
            )));
        }
        let skip = i64::try_from(header.size - header.header_len).map_err(|_| {
            ExtractError::MalformedContainer(format!("atom '{}' is too large", tag_name(&header.kind)))
        })?;
        reader.seek(SeekFrom::Current(skip))?;
    }

    let header = read_header(reader)?;
    match &header.kind {
        b"cmov" => return Err(ExtractError::CompressedHeader),
        b"mvhd" => {}
        other => {
            return Err(ExtractError::MalformedContainer(format!(
                "expected 'mvhd' header, found '{}'",
                tag_name(other)
            )))
        }
    }

    let mut version_flags = [0u8; 4];
    reader.read_exact(&mut version_flags)?;

    let raw = if version_flags[0] == 1 {
        let mut qword = [0u8; 8];
        reader.read_exact(&mut qword)?;
        i64::try_from(u64::from_be_bytes(qword))
            .map_err(|_| ExtractError::MalformedContainer("creation time out of range".into()))?
    } else {
        let mut dword = [0u8; 4];
        reader.read_exact(&mut dword)?;
        u32::from_be_bytes(dword) as i64
    };

    let timestamp = raw - EPOCH_ADJUSTER;
    Ok((timestamp > 0).then_some(timestamp))
}

/// Creation time of the movie at `path`, in the local time zone.
pub fn movie_creation_time(path: &Path) -> Result<Option<OriginalTime>, ExtractError> {
    let mut reader = BufReader::new(File::open(path)?);
    let Some(timestamp) = movie_creation_timestamp(&mut reader)? else {
        return Ok(None);
    };
    Ok(DateTime::from_timestamp(timestamp, 0).map(|utc| utc.with_timezone(&Local).fixed_offset()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Cursor;

    pub(crate) fn atom(kind: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut out = ((payload.len() + 8) as u32).to_be_bytes().to_vec();
        out.extend_from_slice(kind);
        out.extend_from_slice(payload);
        out
    }

    pub(crate) fn mvhd(raw_creation: u32) -> Vec<u8> {
        let mut payload = vec![0, 0, 0, 0]; // version 0, flags
        payload.extend_from_slice(&raw_creation.to_be_bytes());
        payload.extend_from_slice(&raw_creation.to_be_bytes()); // modification time
        payload.extend_from_slice(&[0u8; 88]);
        atom(b"mvhd", &payload)
    }

    /// ftyp + free + moov(mvhd) with the given raw creation time.
    pub(crate) fn movie(raw_creation: u32) -> Vec<u8> {
        let mut data = atom(b"ftyp", b"qt  \0\0\0\0qt  ");
        data.extend(atom(b"free", &[0u8; 32]));
        data.extend(atom(b"moov", &mvhd(raw_creation)));
        data
    }

    #[test]
    fn test_mvhd_timestamp() {
        // 2020-01-02 03:04:05 UTC
        let unix = 1_577_934_245i64;
        let data = movie((unix + EPOCH_ADJUSTER) as u32);
        let ts = movie_creation_timestamp(&mut Cursor::new(data)).unwrap();
        assert_eq!(ts, Some(unix));
    }

    #[test]
    fn test_skips_large_atoms_without_reading_them() {
        let unix = 1_500_000_000i64;
        let mut data = atom(b"ftyp", b"isom");
        data.extend(atom(b"mdat", &vec![0xAA; 100_000]));
        data.extend(atom(b"moov", &mvhd((unix + EPOCH_ADJUSTER) as u32)));
        let ts = movie_creation_timestamp(&mut Cursor::new(data)).unwrap();
        assert_eq!(ts, Some(unix));
    }

    #[test]
    fn test_extended_size_atom() {
        let unix = 1_400_000_000i64;
        let payload = vec![0u8; 20];
        let mut data = 1u32.to_be_bytes().to_vec();
        data.extend_from_slice(b"mdat");
        data.extend_from_slice(&((payload.len() + 16) as u64).to_be_bytes());
        data.extend(payload);
        data.extend(atom(b"moov", &mvhd((unix + EPOCH_ADJUSTER) as u32)));
        let ts = movie_creation_timestamp(&mut Cursor::new(data)).unwrap();
        assert_eq!(ts, Some(unix));
    }

    #[test]
    fn test_version_one_header() {
        let unix = 1_600_000_000i64;
        let mut payload = vec![1, 0, 0, 0];
        payload.extend_from_slice(&((unix + EPOCH_ADJUSTER) as u64).to_be_bytes());
        payload.extend_from_slice(&[0u8; 100]);
        let data = atom(b"moov", &atom(b"mvhd", &payload));
        let ts = movie_creation_timestamp(&mut Cursor::new(data)).unwrap();
        assert_eq!(ts, Some(unix));
    }

    #[test]
    fn test_compressed_header() {
        let mut data = atom(b"ftyp", b"qt  ");
        data.extend(atom(b"moov", &atom(b"cmov", &[0u8; 16])));
        let err = movie_creation_timestamp(&mut Cursor::new(data)).unwrap_err();
        assert!(matches!(err, ExtractError::CompressedHeader));
    }

    #[test]
    fn test_missing_mvhd() {
        let data = atom(b"moov", &atom(b"trak", &[0u8; 16]));
        let err = movie_creation_timestamp(&mut Cursor::new(data)).unwrap_err();
        assert!(matches!(err, ExtractError::MalformedContainer(_)));
    }

    #[test]
    fn test_eof_before_moov() {
        let mut data = atom(b"ftyp", b"qt  ");
        data.extend(atom(b"mdat", &[0u8; 64]));
        let err = movie_creation_timestamp(&mut Cursor::new(data)).unwrap_err();
        match err {
            ExtractError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_invalid_atom_size() {
        let mut data = 4u32.to_be_bytes().to_vec();
        data.extend_from_slice(b"junk");
        let err = movie_creation_timestamp(&mut Cursor::new(data)).unwrap_err();
        assert!(matches!(err, ExtractError::MalformedContainer(_)));
    }

    #[test]
    fn test_unset_clock_is_not_a_time() {
        // Raw value before 1970 after epoch adjustment
        let data = movie(1000);
        assert_eq!(movie_creation_timestamp(&mut Cursor::new(data)).unwrap(), None);
        let data = movie(EPOCH_ADJUSTER as u32);
        assert_eq!(movie_creation_timestamp(&mut Cursor::new(data)).unwrap(), None);
    }
}
