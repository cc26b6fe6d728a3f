use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone};
use chrono_tz::Tz;

/// All scheduling math in the keeper happens in one fixed zone. The zone is
/// configurable at startup; nothing in this module falls back to the host's
/// local zone.
pub const DEFAULT_ZONE: Tz = chrono_tz::Asia::Seoul;

/// Parse a spreadsheet date cell.
///
/// Accepts the two shapes that appear in the sheet: `YYYY. MM. DD` (with or
/// without a trailing dot) and `YYYY-MM-DD`. Anything else is `None`; an
/// unparseable date must never collapse to a silent default.
pub fn parse_sheet_date(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim().trim_end_matches('.');
    if s.is_empty() {
        return None;
    }

    if s.contains('-') {
        return NaiveDate::parse_from_str(s, "%Y-%m-%d").ok();
    }

    // "YYYY. MM. DD" with flexible spacing around the dots.
    let mut parts = s.split('.').map(str::trim);
    let year: i32 = parts.next()?.parse().ok()?;
    let month: u32 = parts.next()?.parse().ok()?;
    let day: u32 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Parse a spreadsheet time-of-day cell: `H:MM` or `HH:MM`, 24-hour.
pub fn parse_sheet_time(raw: &str) -> Option<NaiveTime> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    let (h, m) = s.split_once(':')?;
    let hour: u32 = h.trim().parse().ok()?;
    let minute: u32 = m.trim().parse().ok()?;
    NaiveTime::from_hms_opt(hour, minute, 0)
}

/// Combine a date and a time-of-day into an instant in `zone`.
///
/// DST gaps/folds resolve to the earliest valid instant; a date+time that
/// does not exist in the zone at all yields `None`.
pub fn combine(date: NaiveDate, time: NaiveTime, zone: Tz) -> Option<DateTime<Tz>> {
    zone.from_local_datetime(&date.and_time(time)).earliest()
}

/// Short human stamp used in result cells: `MM/DD HH:MM`.
pub fn short_stamp(t: &DateTime<Tz>) -> String {
    t.format("%m/%d %H:%M").to_string()
}

/// Long stamp used for lock expiries and payment-retry instants:
/// `YYYY-MM-DD HH:MM:SS`.
pub fn long_stamp(t: &DateTime<Tz>) -> String {
    t.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Parse a long stamp back into an instant in `zone`.
pub fn parse_long_stamp(raw: &str, zone: Tz) -> Option<DateTime<Tz>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    let naive = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").ok()?;
    zone.from_local_datetime(&naive).earliest()
}

/// Canonical date form written back to the sheet.
pub fn format_sheet_date(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}
