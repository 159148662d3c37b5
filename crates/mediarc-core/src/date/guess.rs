use chrono::{DateTime, FixedOffset, Local, NaiveDate, NaiveDateTime, TimeZone};
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

use crate::date::{is_plausible, OriginalTime};

/// Most file names that embed a date were written by phones set to UTC+8.
const NAME_OFFSET_SECS: i32 = 8 * 3600;
const MAX_DIGITS: usize = 14;
/// Shortest digit run that can hold a millisecond timestamp after 1980.
const MIN_TIMESTAMP_DIGITS: usize = 12;

static DIGIT_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[0-9]+").unwrap());

fn name_offset() -> FixedOffset {
    FixedOffset::east_opt(NAME_OFFSET_SECS).unwrap()
}

/// Guess the original time from digits embedded in the file's base name.
///
/// Tries, in order: `YYYYMMDDHHMMSS`, `YYYYMMDD` (both at UTC+8), then a
/// millisecond Unix timestamp taken from the first run of digits.
pub fn guess_time_from_filename(path: &Path) -> Option<OriginalTime> {
    let name = path.file_name()?.to_string_lossy();

    let digits: String = name.chars().filter(char::is_ascii_digit).take(MAX_DIGITS).collect();
    if digits.len() < 8 {
        return None;
    }

    let tz = name_offset();

    if digits.len() == MAX_DIGITS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(&digits, "%Y%m%d%H%M%S") {
            if let Some(t) = tz.from_local_datetime(&dt).single().filter(is_plausible) {
                return Some(t);
            }
        }
    }

    if let Ok(d) = NaiveDate::parse_from_str(&digits[..8], "%Y%m%d") {
        if let Some(t) = d
            .and_hms_opt(0, 0, 0)
            .and_then(|dt| tz.from_local_datetime(&dt).single())
            .filter(is_plausible)
        {
            return Some(t);
        }
    }

    let run = DIGIT_RUN.find(&name)?.as_str();
    let run = &run[..run.len().min(MAX_DIGITS)];
    if run.len() < MIN_TIMESTAMP_DIGITS {
        return None;
    }
    let millis: i64 = run.parse().ok()?;
    let utc = DateTime::from_timestamp(millis / 1000, (millis % 1000 * 1_000_000) as u32)?;
    Some(utc.with_timezone(&Local).fixed_offset()).filter(is_plausible)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guess(name: &str) -> Option<OriginalTime> {
        guess_time_from_filename(Path::new(name))
    }

    #[test]
    fn test_guess_full_timestamp() {
        let t = guess("2020-01-02 103000.jpg").unwrap();
        assert_eq!(t.to_rfc3339(), "2020-01-02T10:30:00+08:00");

        let t = guess("/some/dir/IMG_20190509_154733.jpg").unwrap();
        assert_eq!(t.to_rfc3339(), "2019-05-09T15:47:33+08:00");
    }

    #[test]
    fn test_guess_date_only() {
        let t = guess("VID_20160130.mp4").unwrap();
        assert_eq!(t.to_rfc3339(), "2016-01-30T00:00:00+08:00");

        // Fourteen digits whose time part is invalid still yield the date
        let t = guess("20160130_996699.png").unwrap();
        assert_eq!(t.to_rfc3339(), "2016-01-30T00:00:00+08:00");
    }

    #[test]
    fn test_guess_millisecond_timestamp() {
        // 2020-01-02T03:04:05.678Z
        let t = guess("mmexport1577934245678.jpg").unwrap();
        assert_eq!(t.timestamp(), 1_577_934_245);
        assert_eq!(t.timestamp_subsec_millis(), 678);
    }

    #[test]
    fn test_guess_rejects() {
        assert!(guess("random_photo.jpg").is_none());
        assert!(guess("IMG_1234.jpg").is_none());
        // Parses as a date but outside the plausible range
        assert!(guess("18991231.jpg").is_none());
        // Millisecond timestamp in 1973
        assert!(guess("100000000000.jpg").is_none());
    }
}
