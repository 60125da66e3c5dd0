//! LIST response parser.
//!
//! Supports two formats:
//! 1. **Unix-style** (`ls -l`): `-rwxr-xr-x 1 owner group 1234 Jan  1 12:00 file.txt`
//! 2. **Windows/IIS-style**: `01-01-26  12:00AM       1234 file.txt`
//!
//! Lines matching neither (e.g. `total 12`) are skipped.

use crate::ftp::types::{FtpEntry, FtpEntryKind};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeZone, Utc};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref UNIX_RE: Regex = Regex::new(
        r"(?x)
        ^([dlcbps-][rwxsStT-]{9})[+@.]?\s+  # permissions
        (\d+)\s+                             # link count
        (\S+)\s+                             # owner
        (?:(\S+)\s+)?                        # group
        (\d+)\s+                             # size
        (\w{3}\s+\d{1,2}\s+(?:\d{1,2}:\d{2}|\d{4}))\s+  # date
        (.+)$                                # filename (possibly with -> target)
        ",
    )
    .unwrap();
    static ref WINDOWS_RE: Regex = Regex::new(
        r"(?x)
        ^(\d{2}-\d{2}-\d{2,4})\s+          # date
        (\d{1,2}:\d{2}\s?(?:AM|PM)?)\s+    # time
        (<DIR>|\d+)\s+                      # size or <DIR>
        (.+)$                               # filename
        ",
    )
    .unwrap();
}

/// Parse a full LIST response body.
pub fn parse_listing(raw: &str) -> Vec<FtpEntry> {
    parse_listing_at(raw, Utc::now())
}

/// Like [`parse_listing`], with `now` used to infer the year of recent
/// Unix entries (`Jan  1 12:00`).
pub fn parse_listing_at(raw: &str, now: DateTime<Utc>) -> Vec<FtpEntry> {
    raw.lines()
        .map(str::trim_end)
        .filter(|l| !l.is_empty())
        .filter_map(|line| {
            let entry = parse_unix(line, now).or_else(|| parse_windows(line));
            if entry.is_none() {
                log::trace!("Skipping unrecognised LIST line: {}", line);
            }
            entry
        })
        .filter(|e| e.name != "." && e.name != "..")
        .collect()
}

// ─── Unix-style parser ───────────────────────────────────────────────

fn parse_unix(line: &str, now: DateTime<Utc>) -> Option<FtpEntry> {
    let caps = UNIX_RE.captures(line)?;

    let perms = caps.get(1)?.as_str();
    let size = caps.get(5)?.as_str().parse::<u64>().unwrap_or(0);
    let date_str = caps.get(6)?.as_str();
    let name_raw = caps.get(7)?.as_str();

    let kind = match perms.as_bytes().first() {
        Some(b'd') => FtpEntryKind::Directory,
        Some(b'l') => FtpEntryKind::Symlink,
        Some(b'-') => FtpEntryKind::File,
        _ => FtpEntryKind::Unknown,
    };

    let (name, link_target) = match (kind, name_raw.find(" -> ")) {
        (FtpEntryKind::Symlink, Some(pos)) => (
            name_raw[..pos].to_string(),
            Some(name_raw[pos + 4..].to_string()),
        ),
        _ => (name_raw.to_string(), None),
    };

    Some(FtpEntry {
        name,
        kind,
        size,
        modified: parse_unix_date(date_str, now),
        permissions: Some(perms.to_string()),
        link_target,
    })
}

/// "Jan  1 12:00" (within the last year) or "Jan  1  2025".
fn parse_unix_date(s: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let normalised = s.split_whitespace().collect::<Vec<_>>().join(" ");

    if normalised.contains(':') {
        let this_year = NaiveDateTime::parse_from_str(
            &format!("{} {}", now.year(), normalised),
            "%Y %b %d %H:%M",
        )
        .ok()?;
        let dt = Utc.from_utc_datetime(&this_year);
        if dt > now + chrono::Duration::days(1) {
            let last_year = this_year.with_year(now.year() - 1)?;
            return Some(Utc.from_utc_datetime(&last_year));
        }
        return Some(dt);
    }

    let date = NaiveDate::parse_from_str(&normalised, "%b %d %Y").ok()?;
    Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?))
}

// ─── Windows-style parser ────────────────────────────────────────────

fn parse_windows(line: &str) -> Option<FtpEntry> {
    let caps = WINDOWS_RE.captures(line)?;

    let date_str = caps.get(1)?.as_str();
    let time_str = caps.get(2)?.as_str();
    let size_or_dir = caps.get(3)?.as_str();
    let name = caps.get(4)?.as_str().to_string();

    let (kind, size) = if size_or_dir == "<DIR>" {
        (FtpEntryKind::Directory, 0)
    } else {
        (FtpEntryKind::File, size_or_dir.parse::<u64>().unwrap_or(0))
    };

    Some(FtpEntry {
        name,
        kind,
        size,
        modified: parse_windows_date(date_str, time_str),
        permissions: None,
        link_target: None,
    })
}

fn parse_windows_date(date: &str, time: &str) -> Option<DateTime<Utc>> {
    let combined = format!("{} {}", date, time.replace(' ', ""));
    ["%m-%d-%y %I:%M%p", "%m-%d-%Y %I:%M%p", "%m-%d-%y %H:%M", "%m-%d-%Y %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(&combined, fmt).ok())
        .map(|dt| Utc.from_utc_datetime(&dt))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_unix_file() {
        let line = "-rw-r--r--   1 user group  1234 Jan  1 12:00 readme.txt";
        let entries = parse_listing_at(line, at(2026, 6, 1));
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "readme.txt");
        assert_eq!(entries[0].kind, FtpEntryKind::File);
        assert_eq!(entries[0].size, 1234);
        assert_eq!(entries[0].permissions.as_deref(), Some("-rw-r--r--"));
    }

    #[test]
    fn test_unix_dir_and_total_line() {
        let raw = "total 8\r\ndrwxr-xr-x   2 root root  4096 Mar  1 09:30 public_html\r\n";
        let entries = parse_listing(raw);
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_dir());
        assert_eq!(entries[0].name, "public_html");
    }

    #[test]
    fn test_unix_symlink() {
        let line = "lrwxrwxrwx   1 root root    22 Jan  5 08:00 www -> /var/www/site";
        let entries = parse_listing(line);
        assert_eq!(entries[0].kind, FtpEntryKind::Symlink);
        assert_eq!(entries[0].name, "www");
        assert_eq!(entries[0].link_target.as_deref(), Some("/var/www/site"));
    }

    #[test]
    fn test_name_with_spaces() {
        let line = "-rw-r--r--   1 user group  10 Feb 14  2024 old backup.zip";
        let entries = parse_listing(line);
        assert_eq!(entries[0].name, "old backup.zip");
        assert_eq!(entries[0].modified, Some(Utc.with_ymd_and_hms(2024, 2, 14, 0, 0, 0).unwrap()));
    }

    #[test]
    fn test_future_date_rolls_back_a_year() {
        let line = "-rw-r--r--   1 user group  5 Dec 30 23:00 notes.txt";
        let entries = parse_listing_at(line, at(2026, 1, 10));
        assert_eq!(
            entries[0].modified,
            Some(Utc.with_ymd_and_hms(2025, 12, 30, 23, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_filters_dots() {
        let raw = "drwxr-xr-x 2 u g 4096 Jan 1 2025 .\n\
                   drwxr-xr-x 2 u g 4096 Jan 1 2025 ..\n\
                   -rw-r--r-- 1 u g 10 Jan 1 2025 real.txt";
        let entries = parse_listing(raw);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "real.txt");
    }

    #[test]
    fn test_windows_entries() {
        let raw = "01-01-26  12:00AM      <DIR>          My Documents\n\
                   03-15-25  02:30PM               2048 index.htm";
        let entries = parse_listing(raw);
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_dir());
        assert_eq!(entries[0].name, "My Documents");
        assert_eq!(entries[1].size, 2048);
        assert_eq!(
            entries[1].modified,
            Some(Utc.with_ymd_and_hms(2025, 3, 15, 14, 30, 0).unwrap())
        );
    }
}
