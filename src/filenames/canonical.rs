//! The renamed layout: `<project>/<pool>/<run>_<lane>_<library>_<read>.fastq.gz`.

use lazy_static::lazy_static;
use regex::Regex;
use std::fmt;
use std::path::PathBuf;

lazy_static! {
    static ref POST_RENAME_REGEX: Regex =
        Regex::new(r"^[0-9]{6}_[^_]+_[0-9]+_[^_]+_(.)_[^_]+(_[12]|_UMI|)\.fastq\.gz$").unwrap();
}

pub const UNASSIGNED: &str = "unassigned";

/// Read label in a renamed file: `1`, `2`, or `UMI` for a UMI read that
/// bcl2fastq emitted as read 2.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReadLabel {
    Read(u32),
    Umi,
}

impl fmt::Display for ReadLabel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ReadLabel::Read(n) => write!(f, "{}", n),
            ReadLabel::Umi => f.write_str("UMI"),
        }
    }
}

/// Where a FASTQ file belongs once renamed.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FastqIdentity {
    pub project: String,
    pub pool: String,
    pub library: String,
    pub lane: u32,
    pub read: ReadLabel,
}

impl FastqIdentity {
    /// Reads that matched no sample. These live at the top of the output
    /// directory with no project or pool.
    pub fn unassigned(lane: u32, read: ReadLabel) -> FastqIdentity {
        FastqIdentity {
            project: String::new(),
            pool: String::new(),
            library: UNASSIGNED.to_string(),
            lane,
            read,
        }
    }

    pub fn is_unassigned(&self) -> bool {
        self.library == UNASSIGNED
    }

    pub fn file_name(&self, run_id: &str) -> String {
        format!(
            "{}_{}_{}_{}.fastq.gz",
            run_id, self.lane, self.library, self.read
        )
    }

    /// Path relative to the run's output directory.
    pub fn relative_path(&self, run_id: &str) -> PathBuf {
        let name = self.file_name(run_id);
        if self.is_unassigned() {
            PathBuf::from(name)
        } else {
            [self.project.as_str(), self.pool.as_str(), name.as_str()]
                .iter()
                .collect()
        }
    }
}

/// The lane of a renamed FASTQ file, if `filename` is one.
pub fn post_rename_lane(filename: &str) -> Option<u32> {
    POST_RENAME_REGEX
        .captures(filename)
        .and_then(|c| c[1].parse().ok())
}
