//! Maintenance window parsing and scheduling.
//!
//! Window entries have the form `"[DAYSPEC] HH:MM-HH:MM"` where `DAYSPEC`
//! is omitted or `*` for every day, a comma- and/or space-separated list,
//! or a range like `Mon-Fri` (wrap-around allowed). Day names are
//! case-insensitive three-letter or full weekday names. Each entry
//! expands to one or more half-open `[start, end)` minute-of-week
//! segments; equal start and end mean a full-day window, and an end
//! before the start crosses midnight and is split across two days.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Timelike, Utc};

use crate::adapters::AdapterError;

const MINUTES_PER_DAY: u32 = 24 * 60;
const MINUTES_PER_WEEK: u32 = 7 * MINUTES_PER_DAY;

/// One half-open `[start, end)` window in minutes of the week, Sunday
/// 00:00 being minute zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSegment {
    /// First minute inside the window.
    pub start: u32,
    /// First minute outside the window.
    pub end: u32,
}

/// Expands a list of window entries into segments.
///
/// Blank entries are skipped.
///
/// # Errors
///
/// Returns [`AdapterError::InvalidPolicy`] for an entry that does not
/// parse.
pub fn parse_windows(entries: &[String]) -> Result<Vec<WindowSegment>, AdapterError> {
    let mut segments = Vec::new();
    for entry in entries {
        let trimmed = entry.trim();
        if trimmed.is_empty() {
            continue;
        }
        segments.extend(parse_window(trimmed)?);
    }
    Ok(segments)
}

/// Whether `now` falls inside any segment.
///
/// No segments at all means maintenance is always allowed.
#[must_use]
pub fn allows(segments: &[WindowSegment], now: DateTime<Utc>) -> bool {
    if segments.is_empty() {
        return true;
    }
    let minute = minute_of_week(now);
    segments
        .iter()
        .any(|seg| minute >= seg.start && minute < seg.end)
}

/// The next segment start strictly after `now`, minute-truncated.
///
/// Returns `None` when there are no segments or every segment start
/// coincides with the current minute.
#[must_use]
pub fn next_window(segments: &[WindowSegment], now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if segments.is_empty() {
        return None;
    }
    let base = truncate_to_minute(now);
    let minute = minute_of_week(base);
    let mut best: Option<u32> = None;
    for seg in segments {
        let delta = if seg.start > minute {
            seg.start - minute
        } else {
            MINUTES_PER_WEEK - minute + seg.start
        };
        if delta == 0 {
            continue;
        }
        if best.is_none_or(|current| delta < current) {
            best = Some(delta);
        }
    }
    best.map(|delta| base + ChronoDuration::minutes(i64::from(delta)))
}

fn parse_window(entry: &str) -> Result<Vec<WindowSegment>, AdapterError> {
    let parts: Vec<&str> = entry.split_whitespace().collect();
    let Some((time_part, day_parts)) = parts.split_last() else {
        return Err(invalid(entry, "empty entry"));
    };
    let (start, end) = parse_time_range(time_part).map_err(|detail| invalid(entry, &detail))?;
    let days = if day_parts.is_empty() {
        Vec::new()
    } else {
        parse_days(&day_parts.join(" ")).map_err(|detail| invalid(entry, &detail))?
    };
    Ok(build_segments(&days, start, end))
}

fn invalid(entry: &str, detail: &str) -> AdapterError {
    AdapterError::InvalidPolicy {
        detail: format!("maintenance window {entry:?}: {detail}"),
    }
}

fn parse_time_range(value: &str) -> Result<(u32, u32), String> {
    let pieces: Vec<&str> = value.split('-').collect();
    if pieces.len() != 2 {
        return Err(format!("invalid time range {value:?}"));
    }
    Ok((parse_clock(pieces[0])?, parse_clock(pieces[1])?))
}

fn parse_clock(value: &str) -> Result<u32, String> {
    let parts: Vec<&str> = value.split(':').collect();
    if parts.len() != 2 {
        return Err(format!("invalid time value {value:?}"));
    }
    let hour: u32 = parts[0]
        .parse()
        .ok()
        .filter(|h| *h <= 23)
        .ok_or_else(|| format!("invalid hour {:?}", parts[0]))?;
    let minute: u32 = parts[1]
        .parse()
        .ok()
        .filter(|m| *m <= 59)
        .ok_or_else(|| format!("invalid minute {:?}", parts[1]))?;
    Ok(hour * 60 + minute)
}

/// Parses a day expression into weekday indices (Sunday = 0).
///
/// Returns an empty list for `*`, meaning every day.
fn parse_days(value: &str) -> Result<Vec<u32>, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed == "*" {
        return Ok(Vec::new());
    }
    let normalized = trimmed.replace(' ', ",");

    let mut days = Vec::new();
    let mut push = |day: u32| {
        if !days.contains(&day) {
            days.push(day);
        }
    };
    for token in normalized.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        if let Some((from, to)) = token.split_once('-') {
            let start = parse_weekday(from)?;
            let end = parse_weekday(to)?;
            for offset in 0..7 {
                let day = (start + offset) % 7;
                push(day);
                if day == end {
                    break;
                }
            }
        } else {
            push(parse_weekday(token)?);
        }
    }
    Ok(days)
}

fn parse_weekday(token: &str) -> Result<u32, String> {
    match token.to_lowercase().as_str() {
        "sun" | "sunday" => Ok(0),
        "mon" | "monday" => Ok(1),
        "tue" | "tues" | "tuesday" => Ok(2),
        "wed" | "weds" | "wednesday" => Ok(3),
        "thu" | "thur" | "thurs" | "thursday" => Ok(4),
        "fri" | "friday" => Ok(5),
        "sat" | "saturday" => Ok(6),
        _ => Err(format!("invalid weekday {token:?}")),
    }
}

fn build_segments(days: &[u32], start: u32, end: u32) -> Vec<WindowSegment> {
    let all_days: Vec<u32>;
    let days = if days.is_empty() {
        all_days = (0..7).collect();
        &all_days
    } else {
        days
    };

    let mut segments = Vec::new();
    for &day in days {
        let base = day * MINUTES_PER_DAY;
        if start == end {
            segments.push(WindowSegment {
                start: base,
                end: base + MINUTES_PER_DAY,
            });
            continue;
        }
        if end > start {
            segments.push(WindowSegment {
                start: base + start,
                end: base + end,
            });
            continue;
        }
        // Crosses midnight: close out the day, spill into the next.
        segments.push(WindowSegment {
            start: base + start,
            end: base + MINUTES_PER_DAY,
        });
        let next_day = (day + 1) % 7;
        segments.push(WindowSegment {
            start: next_day * MINUTES_PER_DAY,
            end: next_day * MINUTES_PER_DAY + end,
        });
    }
    segments
}

fn minute_of_week(t: DateTime<Utc>) -> u32 {
    let t = truncate_to_minute(t);
    t.weekday().num_days_from_sunday() * MINUTES_PER_DAY + t.hour() * 60 + t.minute()
}

fn truncate_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    let seconds = i64::from(t.second());
    let nanos = i64::from(t.nanosecond());
    t - ChronoDuration::seconds(seconds) - ChronoDuration::nanoseconds(nanos)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn windows(entries: &[&str]) -> Vec<WindowSegment> {
        let owned: Vec<String> = entries.iter().map(|s| (*s).to_string()).collect();
        parse_windows(&owned).unwrap()
    }

    #[test]
    fn weekday_range_admits_inside_and_rejects_outside() {
        let segments = windows(&["Mon-Fri 02:00-03:00"]);
        assert_eq!(segments.len(), 5);

        // 2024-01-01 is a Monday.
        assert!(allows(&segments, utc(2024, 1, 1, 2, 30)));
        assert!(!allows(&segments, utc(2024, 1, 1, 4, 0)));
        // Saturday is outside the range.
        assert!(!allows(&segments, utc(2024, 1, 6, 2, 30)));
    }

    #[test]
    fn midnight_crossing_splits_across_days() {
        let segments = windows(&["Sun 23:00-01:00"]);
        assert_eq!(segments.len(), 2);

        // 2024-01-07 is a Sunday.
        assert!(allows(&segments, utc(2024, 1, 7, 23, 30)));
        assert!(allows(&segments, utc(2024, 1, 8, 0, 30)));
        assert!(!allows(&segments, utc(2024, 1, 8, 2, 0)));
    }

    #[test]
    fn equal_start_and_end_is_a_full_day() {
        let segments = windows(&["Sat 00:00-00:00"]);
        assert_eq!(segments.len(), 1);
        assert!(allows(&segments, utc(2024, 1, 6, 0, 0)));
        assert!(allows(&segments, utc(2024, 1, 6, 23, 59)));
        assert!(!allows(&segments, utc(2024, 1, 7, 0, 0)));
    }

    #[test]
    fn missing_dayspec_means_every_day() {
        let segments = windows(&["02:00-03:00"]);
        assert_eq!(segments.len(), 7);
        assert!(allows(&segments, utc(2024, 1, 3, 2, 15)));
    }

    #[test]
    fn star_dayspec_means_every_day() {
        assert_eq!(windows(&["* 02:00-03:00"]).len(), 7);
    }

    #[test]
    fn comma_and_space_lists_parse() {
        let commas = windows(&["Mon,Wed,Fri 01:00-02:00"]);
        let spaces = windows(&["Mon Wed Fri 01:00-02:00"]);
        assert_eq!(commas, spaces);
        assert_eq!(commas.len(), 3);
    }

    #[test]
    fn wrapping_day_range_parses() {
        // Fri-Mon covers Fri, Sat, Sun, Mon.
        let segments = windows(&["Fri-Mon 01:00-02:00"]);
        assert_eq!(segments.len(), 4);
    }

    #[test]
    fn full_day_names_and_case_are_accepted() {
        let segments = windows(&["TUESDAY 01:00-02:00"]);
        assert!(allows(&segments, utc(2024, 1, 2, 1, 30)));
    }

    #[test]
    fn empty_entries_are_skipped() {
        assert!(windows(&["", "  "]).is_empty());
    }

    #[test]
    fn no_segments_always_allows() {
        assert!(allows(&[], utc(2024, 1, 1, 12, 0)));
    }

    #[test]
    fn invalid_entries_are_rejected() {
        for bad in [
            "Mon",
            "Mon 02:00",
            "Mon 2-3",
            "Mon 25:00-26:00",
            "Mon 02:61-03:00",
            "Funday 02:00-03:00",
        ] {
            let owned = vec![bad.to_string()];
            assert!(parse_windows(&owned).is_err(), "entry {bad:?} should fail");
        }
    }

    #[test]
    fn next_window_same_day() {
        let segments = windows(&["02:00-03:00"]);
        let next = next_window(&segments, utc(2024, 1, 1, 1, 0)).unwrap();
        assert_eq!(next, utc(2024, 1, 1, 2, 0));
    }

    #[test]
    fn next_window_rolls_to_next_day() {
        let segments = windows(&["02:00-03:00"]);
        let next = next_window(&segments, utc(2024, 1, 1, 4, 0)).unwrap();
        assert_eq!(next, utc(2024, 1, 2, 2, 0));
    }

    #[test]
    fn next_window_rolls_a_full_week() {
        let segments = windows(&["Mon 02:00-03:00"]);
        let next = next_window(&segments, utc(2024, 1, 1, 4, 0)).unwrap();
        assert_eq!(next, utc(2024, 1, 8, 2, 0));
    }

    #[test]
    fn next_window_empty_is_none() {
        assert!(next_window(&[], utc(2024, 1, 1, 4, 0)).is_none());
    }

    #[test]
    fn next_window_ignores_seconds() {
        let segments = windows(&["02:00-03:00"]);
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 1, 59, 42).unwrap();
        assert_eq!(next_window(&segments, now).unwrap(), utc(2024, 1, 1, 2, 0));
    }
}
