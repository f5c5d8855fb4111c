//! Lazy replay across ledger segments.

use super::LedgerError;
use super::segment::{self, Segment};
use keel_domain::IntentRecord;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Attempts at opening a consistent set of segments before giving up.
const OPEN_ATTEMPTS: usize = 8;

/// Counters for lines that were not yielded.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayStats {
    pub yielded: usize,
    pub malformed: usize,
    pub truncated: usize,
    pub out_of_order: usize,
}

struct OpenSegment {
    path: PathBuf,
    reader: BufReader<File>,
    line_no: usize,
}

/// Iterator over every record in sequence order.
///
/// Segment files are opened when the replay is created, and the directory is
/// listed again afterwards; if a rotation happened in between the files are
/// reopened. A rotation after that point renames a file already held open,
/// so nothing written before the replay started can be missed. Malformed
/// lines and a torn final line are skipped and logged.
pub struct Replay {
    pending: VecDeque<OpenSegment>,
    current: Option<OpenSegment>,
    from_seq: Option<u64>,
    last_seq: Option<u64>,
    line: Vec<u8>,
    stats: ReplayStats,
}

impl Replay {
    pub(crate) fn open(segments: &[Segment], from_seq: Option<u64>) -> Result<Self, LedgerError> {
        let mut pending = VecDeque::with_capacity(segments.len());
        for seg in segments {
            match File::open(&seg.path) {
                Ok(file) => pending.push_back(OpenSegment {
                    path: seg.path.clone(),
                    reader: BufReader::new(file),
                    line_no: 0,
                }),
                // Rotated between listing and opening; the second listing catches it.
                Err(e) if e.kind() == io::ErrorKind::NotFound && seg.is_active() => {
                    debug!(path = %seg.path.display(), "Active segment vanished before replay");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Self {
            pending,
            current: None,
            from_seq,
            last_seq: None,
            line: Vec::new(),
            stats: ReplayStats::default(),
        })
    }

    /// Opens the segments returned by `list`, retrying while rotations keep
    /// changing the set of rotated segments under it.
    pub(crate) fn open_consistent<F>(mut list: F, from_seq: Option<u64>) -> Result<Self, LedgerError>
    where
        F: FnMut() -> io::Result<Vec<Segment>>,
    {
        let mut segments = list()?;
        for attempt in 1..=OPEN_ATTEMPTS {
            let replay = Self::open(&segments, from_seq)?;
            let relisted = list()?;
            if rotated(&relisted).eq(rotated(&segments)) {
                return Ok(replay);
            }
            debug!(attempt, "Ledger rotated while replay was opening, reopening");
            segments = relisted;
        }
        Err(LedgerError::Io(io::Error::other(format!(
            "ledger kept rotating during {OPEN_ATTEMPTS} replay attempts"
        ))))
    }

    pub fn stats(&self) -> ReplayStats {
        self.stats
    }

    /// Highest sequence number yielded so far.
    pub fn last_seq(&self) -> Option<u64> {
        self.last_seq
    }
}

impl Iterator for Replay {
    type Item = Result<IntentRecord, LedgerError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current.is_none() {
                self.current = Some(self.pending.pop_front()?);
            }
            let Some(seg) = self.current.as_mut() else {
                continue;
            };

            self.line.clear();
            let read = match seg.reader.read_until(b'\n', &mut self.line) {
                Ok(read) => read,
                Err(e) => {
                    warn!(path = %seg.path.display(), error = %e, "Ledger segment read failed");
                    self.current = None;
                    return Some(Err(e.into()));
                }
            };
            if read == 0 {
                self.current = None;
                continue;
            }
            seg.line_no += 1;

            if self.line.last() != Some(&b'\n') {
                self.stats.truncated += 1;
                warn!(
                    path = %seg.path.display(),
                    line = seg.line_no,
                    bytes = read,
                    "Skipping truncated ledger line"
                );
                continue;
            }
            if self.line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            let record: IntentRecord = match serde_json::from_slice(&self.line) {
                Ok(record) => record,
                Err(e) => {
                    self.stats.malformed += 1;
                    warn!(
                        path = %seg.path.display(),
                        line = seg.line_no,
                        error = %e,
                        "Skipping malformed ledger line"
                    );
                    continue;
                }
            };

            if let Some(last) = self.last_seq {
                if record.seq <= last {
                    self.stats.out_of_order += 1;
                    warn!(
                        path = %seg.path.display(),
                        seq = record.seq,
                        last_seq = last,
                        "Skipping duplicate or out-of-order ledger record"
                    );
                    continue;
                }
            }
            self.last_seq = Some(record.seq);

            if self.from_seq.is_some_and(|from| record.seq < from) {
                continue;
            }
            self.stats.yielded += 1;
            return Some(Ok(record));
        }
    }
}

fn rotated(segments: &[Segment]) -> impl Iterator<Item = &Path> {
    segments
        .iter()
        .filter(|seg| !seg.is_active())
        .map(|seg| seg.path.as_path())
}

/// Read-only access to a ledger directory.
#[derive(Debug, Clone)]
pub struct LedgerReader {
    dir: PathBuf,
    stem: String,
}

impl LedgerReader {
    pub fn open(dir: impl AsRef<Path>, stem: impl Into<String>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            stem: stem.into(),
        }
    }

    /// Segments oldest first, the active segment last.
    pub fn segments(&self) -> Result<Vec<Segment>, LedgerError> {
        Ok(segment::list_segments(&self.dir, &self.stem)?)
    }

    /// Replays every record.
    pub fn replay(&self) -> Result<Replay, LedgerError> {
        Replay::open_consistent(|| segment::list_segments(&self.dir, &self.stem), None)
    }

    /// Replays records with a sequence number of at least `seq`.
    pub fn replay_from(&self, seq: u64) -> Result<Replay, LedgerError> {
        Replay::open_consistent(|| segment::list_segments(&self.dir, &self.stem), Some(seq))
    }
}
