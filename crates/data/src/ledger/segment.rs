//! Segment naming, discovery and crash repair.

use chrono::{DateTime, Utc};
use keel_domain::IntentRecord;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const SEGMENT_EXT: &str = "log";
const ROTATION_TS_FORMAT: &str = "%Y%m%dT%H%M%S%9f";
const ROTATION_TS_LEN: usize = 24;

/// A ledger segment on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub path: PathBuf,
    /// Rotation timestamp suffix; `None` for the active segment.
    pub rotated_at: Option<String>,
}

impl Segment {
    pub fn is_active(&self) -> bool {
        self.rotated_at.is_none()
    }
}

/// Path of the segment currently accepting writes.
pub fn active_path(dir: &Path, stem: &str) -> PathBuf {
    dir.join(format!("{stem}.{SEGMENT_EXT}"))
}

/// Path for a segment rotated at `at`. Never returns an existing path.
pub fn rotated_path(dir: &Path, stem: &str, at: DateTime<Utc>) -> PathBuf {
    let mut at = at;
    loop {
        let ts = at.format(ROTATION_TS_FORMAT).to_string();
        let path = dir.join(format!("{stem}.{ts}.{SEGMENT_EXT}"));
        if !path.exists() {
            return path;
        }
        at += chrono::Duration::nanoseconds(1);
    }
}

/// Lists segments oldest first, the active segment last.
pub fn list_segments(dir: &Path, stem: &str) -> io::Result<Vec<Segment>> {
    let mut rotated = Vec::new();
    let mut active = None;
    let prefix = format!("{stem}.");
    let suffix = format!(".{SEGMENT_EXT}");

    if !dir.exists() {
        return Ok(Vec::new());
    }

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let Some(middle) = name
            .strip_prefix(&prefix)
            .and_then(|rest| rest.strip_suffix(&suffix))
            .map(str::to_string)
            .or_else(|| (name == format!("{stem}{suffix}")).then(String::new))
        else {
            continue;
        };

        if middle.is_empty() {
            active = Some(Segment {
                path: entry.path(),
                rotated_at: None,
            });
        } else if is_rotation_stamp(&middle) {
            rotated.push(Segment {
                path: entry.path(),
                rotated_at: Some(middle),
            });
        } else {
            debug!(file = %name, "Ignoring unrelated file in ledger directory");
        }
    }

    rotated.sort_by(|a, b| a.rotated_at.cmp(&b.rotated_at));
    rotated.extend(active);
    Ok(rotated)
}

fn is_rotation_stamp(value: &str) -> bool {
    value.len() == ROTATION_TS_LEN
        && value
            .char_indices()
            .all(|(i, c)| if i == 8 { c == 'T' } else { c.is_ascii_digit() })
}

/// Opens (creating if needed) a segment for appending.
pub fn open_for_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Makes renames and file creations in `dir` durable.
pub fn sync_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}

/// Result of scanning a segment at startup.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScanOutcome {
    /// Highest sequence number found.
    pub last_seq: Option<u64>,
    /// Length of the segment after repair.
    pub len: u64,
    /// Bytes removed from a torn tail.
    pub truncated: u64,
}

/// Scans a segment for its last sequence number.
///
/// A final line without a newline is a write interrupted by a crash. When
/// `repair` is set it is cut off so that later appends start on a clean line.
pub fn scan_segment(path: &Path, repair: bool) -> io::Result<ScanOutcome> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(ScanOutcome::default()),
        Err(e) => return Err(e),
    };
    let total = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut line = Vec::new();
    let mut good_end = 0u64;
    let mut last_seq = None;

    loop {
        line.clear();
        let read = reader.read_until(b'\n', &mut line)?;
        if read == 0 {
            break;
        }
        if line.last() != Some(&b'\n') {
            break;
        }
        good_end += read as u64;
        if let Ok(record) = serde_json::from_slice::<IntentRecord>(&line) {
            last_seq = Some(record.seq);
        }
    }

    let truncated = total - good_end;
    if truncated > 0 && repair {
        warn!(
            path = %path.display(),
            bytes = truncated,
            "Truncating torn tail left by an interrupted write"
        );
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(good_end)?;
        file.sync_all()?;
    }

    Ok(ScanOutcome {
        last_seq,
        len: if repair { good_end } else { total },
        truncated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_list_segments_orders_rotated_then_active() {
        let dir = tempfile::tempdir().unwrap();
        let stem = "intents";
        File::create(active_path(dir.path(), stem)).unwrap();
        File::create(dir.path().join("intents.20260102T000000000000000.log")).unwrap();
        File::create(dir.path().join("intents.20260101T000000000000000.log")).unwrap();
        File::create(dir.path().join("intents.notes.log")).unwrap();
        File::create(dir.path().join("other.log")).unwrap();

        let segments = list_segments(dir.path(), stem).unwrap();
        assert_eq!(segments.len(), 3);
        assert_eq!(
            segments[0].rotated_at.as_deref(),
            Some("20260101T000000000000000")
        );
        assert_eq!(
            segments[1].rotated_at.as_deref(),
            Some("20260102T000000000000000")
        );
        assert!(segments[2].is_active());
    }

    #[test]
    fn test_rotated_path_is_unique() {
        let dir = tempfile::tempdir().unwrap();
        let at = Utc::now();
        let first = rotated_path(dir.path(), "intents", at);
        File::create(&first).unwrap();
        let second = rotated_path(dir.path(), "intents", at);
        assert_ne!(first, second);
    }

    #[test]
    fn test_scan_repairs_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = active_path(dir.path(), "intents");
        let mut file = File::create(&path).unwrap();
        writeln!(
            file,
            r#"{{"seq":1,"ts":"2026-01-05T10:00:00Z","kind":"MARKET_DATA","symbol":"BTCUSDT","price":"1"}}"#
        )
        .unwrap();
        write!(file, r#"{{"seq":2,"ts":"2026-01-05T10:"#).unwrap();
        drop(file);

        let outcome = scan_segment(&path, true).unwrap();
        assert_eq!(outcome.last_seq, Some(1));
        assert!(outcome.truncated > 0);
        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.ends_with('\n'));
        assert_eq!(contents.lines().count(), 1);
    }
}
