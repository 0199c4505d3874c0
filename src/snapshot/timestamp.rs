//! Snapshot timestamp encoding.
//!
//! Snapshot directories carry their creation time as a fixed-width suffix of
//! the form `YYYY-MM-DDTHH:MM:SS±HH:MM`. The offset is the local timezone at
//! creation time; decoding folds it away so that every snapshot compares on a
//! single UTC timeline regardless of where (or in which DST period) it was made.

use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone, Utc};

/// Length of an encoded timestamp, e.g. `2024-03-01T13:45:00+01:00`.
pub const ENCODED_LEN: usize = 25;

/// Decode an encoded timestamp into UTC.
///
/// Returns `None` when `text` is not exactly one encoded timestamp or when
/// the fields do not form a real calendar time. Callers treat `None` as
/// "not a snapshot", not as an error.
pub fn decode(text: &str) -> Option<DateTime<Utc>> {
    let bytes = text.as_bytes();
    if bytes.len() != ENCODED_LEN || !is_well_formed(bytes) {
        return None;
    }

    let year = number(&bytes[0..4])? as i32;
    let month = number(&bytes[5..7])?;
    let day = number(&bytes[8..10])?;
    let hour = number(&bytes[11..13])?;
    let minute = number(&bytes[14..16])?;
    let second = number(&bytes[17..19])?;
    let tz_hours = number(&bytes[20..22])?;
    let tz_minutes = number(&bytes[23..25])?;

    if tz_minutes >= 60 {
        return None;
    }
    let magnitude = (tz_hours * 3600 + tz_minutes * 60) as i32;
    let offset_secs = if bytes[19] == b'-' { -magnitude } else { magnitude };
    let offset = FixedOffset::east_opt(offset_secs)?;

    let local = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, second)?;
    let stamped = offset.from_local_datetime(&local).single()?;
    Some(stamped.with_timezone(&Utc))
}

/// Encode `timestamp` as seen from `offset`.
///
/// Sub-second precision is dropped. The sign is carried on the hour field and
/// applies to the whole offset, so `-00:30` survives a round trip.
pub fn encode(timestamp: DateTime<Utc>, offset: FixedOffset) -> String {
    let local = timestamp.with_timezone(&offset);
    let total = offset.local_minus_utc();
    let sign = if total < 0 { '-' } else { '+' };
    let magnitude = total.unsigned_abs();

    format!(
        "{}{}{:02}:{:02}",
        local.format("%Y-%m-%dT%H:%M:%S"),
        sign,
        magnitude / 3600,
        (magnitude % 3600) / 60
    )
}

fn is_well_formed(bytes: &[u8]) -> bool {
    bytes.iter().enumerate().all(|(i, &b)| match i {
        4 | 7 => b == b'-',
        10 => b == b'T',
        13 | 16 | 22 => b == b':',
        19 => b == b'+' || b == b'-',
        _ => b.is_ascii_digit(),
    })
}

fn number(digits: &[u8]) -> Option<u32> {
    std::str::from_utf8(digits).ok()?.parse().ok()
}
