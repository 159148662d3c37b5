use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use chrono::{FixedOffset, Local, NaiveDateTime, TimeZone};
use exif::{Field, In, Reader, Tag, Value};

use crate::date::OriginalTime;
use crate::error::ExtractError;

/// Date tags in priority order, each with the tag holding its UTC offset.
const DATE_TAGS: [(Tag, Tag); 3] = [
    (Tag::DateTimeOriginal, Tag::OffsetTimeOriginal),
    (Tag::DateTimeDigitized, Tag::OffsetTimeDigitized),
    (Tag::DateTime, Tag::OffsetTime),
];

/// Extract the capture time from EXIF data embedded in an image file.
/// EXIF datetimes without an offset tag are local time as-is.
pub fn exif_time(path: &Path) -> Result<Option<OriginalTime>, ExtractError> {
    let file = File::open(path)?;
    let exif = Reader::new().read_from_container(&mut BufReader::new(file))?;

    for (tag, offset_tag) in DATE_TAGS {
        let Some(naive) = exif
            .get_field(tag, In::PRIMARY)
            .and_then(ascii_value)
            .and_then(|s| parse_exif_datetime(&s))
        else {
            continue;
        };

        let offset = exif
            .get_field(offset_tag, In::PRIMARY)
            .and_then(ascii_value)
            .and_then(|s| parse_offset(&s));

        let time = match offset {
            Some(offset) => offset.from_local_datetime(&naive).single(),
            None => Local.from_local_datetime(&naive).earliest().map(|t| t.fixed_offset()),
        };
        if time.is_some() {
            return Ok(time);
        }
    }

    Ok(None)
}

fn ascii_value(field: &Field) -> Option<String> {
    match &field.value {
        Value::Ascii(parts) => parts
            .first()
            .map(|bytes| String::from_utf8_lossy(bytes).trim_end_matches('\0').trim().to_string()),
        _ => None,
    }
}

fn parse_exif_datetime(s: &str) -> Option<NaiveDateTime> {
    let cleaned = s
        .replace('-', ":")
        .replace('/', ":")
        .replace('\\', ":")
        .replace('.', ":");

    if let Ok(dt) = NaiveDateTime::parse_from_str(&cleaned, "%Y:%m:%d %H:%M:%S") {
        return Some(dt);
    }

    if let Ok(d) = chrono::NaiveDate::parse_from_str(cleaned.split(' ').next()?, "%Y:%m:%d") {
        return d.and_hms_opt(0, 0, 0);
    }

    None
}

/// Parse an EXIF offset such as `+09:00` or `-05:30`.
fn parse_offset(s: &str) -> Option<FixedOffset> {
    let (sign, rest) = match s.as_bytes().first()? {
        b'+' => (1, &s[1..]),
        b'-' => (-1, &s[1..]),
        _ => return None,
    };
    let (hours, minutes) = rest.split_once(':')?;
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    if !(0..24).contains(&hours) || !(0..60).contains(&minutes) {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}
