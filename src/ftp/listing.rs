//! `ls -l` style directory listings produced by the listener for LIST.

use chrono::{DateTime, Duration, Utc};
use std::fs::Metadata;

/// Entries older than this show the year instead of the time of day.
const RECENT_DAYS: i64 = 182;

fn modified_utc(metadata: &Metadata) -> DateTime<Utc> {
    metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}

pub fn format_date(when: DateTime<Utc>, now: DateTime<Utc>) -> String {
    if now.signed_duration_since(when) > Duration::days(RECENT_DAYS) || when > now {
        when.format("%b %d  %Y").to_string()
    } else {
        when.format("%b %d %H:%M").to_string()
    }
}

pub fn format_list_line(name: &str, metadata: &Metadata) -> String {
    let (kind, perms) = if metadata.is_dir() {
        ('d', "rwxr-xr-x")
    } else {
        ('-', "rw-r--r--")
    };
    let size = if metadata.is_dir() { 0 } else { metadata.len() };
    format!(
        "{}{} 1 ftp ftp {:>12} {} {}",
        kind,
        perms,
        size,
        format_date(modified_utc(metadata), Utc::now()),
        name
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_date_recent_and_old() {
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();
        let recent = Utc.with_ymd_and_hms(2024, 6, 1, 9, 5, 0).unwrap();
        let old = Utc.with_ymd_and_hms(2022, 3, 7, 9, 5, 0).unwrap();
        assert_eq!(format_date(recent, now), "Jun 01 09:05");
        assert_eq!(format_date(old, now), "Mar 07  2022");
    }

    #[test]
    fn test_lines_parse_as_client_listing() {
        let tmp = tempfile::tempdir().unwrap();
        let p = tmp.path().join("a b.txt");
        std::fs::write(&p, b"0123456789").unwrap();
        let line = format_list_line("a b.txt", &std::fs::metadata(&p).unwrap());
        let entry = crate::client::ListEntry::parse(&line).unwrap();
        assert_eq!(entry.filename, "a b.txt");
        assert_eq!(entry.size, 10);

        let dir_line = format_list_line("sub", &std::fs::metadata(tmp.path()).unwrap());
        assert!(dir_line.starts_with("drwxr-xr-x"));
    }
}
