// Copyright (c) 2018 10x Genomics, Inc. All rights reserved.

//! Typed access to the state files kept in a run's `pipeline/` directory.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::{IoContext, PipelineError, Result};
use crate::utils::{create_exclusive, remove_if_present};

pub const PIPELINE_DIR: &str = "pipeline";

lazy_static! {
    static ref LANE_FILE_REGEX: Regex = Regex::new(r"^lane([0-9])\.(started|done|redo)$").unwrap();
}

/// One state file under `pipeline/`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TouchFile {
    Read1Started,
    Read1Done,
    LaneStarted(u32),
    LaneDone(u32),
    LaneRedo(u32),
    QcStarted,
    QcDone,
    Failed,
    Aborted,
    DriverLock,
    Override,
}

impl TouchFile {
    pub fn file_name(&self) -> String {
        match self {
            TouchFile::Read1Started => "read1.started".into(),
            TouchFile::Read1Done => "read1.done".into(),
            TouchFile::LaneStarted(n) => format!("lane{}.started", n),
            TouchFile::LaneDone(n) => format!("lane{}.done", n),
            TouchFile::LaneRedo(n) => format!("lane{}.redo", n),
            TouchFile::QcStarted => "qc.started".into(),
            TouchFile::QcDone => "qc.done".into(),
            TouchFile::Failed => "failed".into(),
            TouchFile::Aborted => "aborted".into(),
            TouchFile::DriverLock => "driver.lock".into(),
            TouchFile::Override => "SampleSheet.csv.OVERRIDE".into(),
        }
    }
}

impl fmt::Display for TouchFile {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.file_name())
    }
}

/// Everything the status classifier needs from `pipeline/`, read in
/// one directory listing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TouchSnapshot {
    pub pipeline_exists: bool,
    pub started_lanes: BTreeSet<u32>,
    pub done_lanes: BTreeSet<u32>,
    pub redo_lanes: BTreeSet<u32>,
    pub read1_started: bool,
    pub read1_done: bool,
    pub qc_started: bool,
    pub qc_done: bool,
    pub failed: bool,
    pub aborted: bool,
}

/// The `pipeline/` directory of one run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineDir {
    path: PathBuf,
}

impl PipelineDir {
    pub fn for_run(run_dir: impl AsRef<Path>) -> PipelineDir {
        PipelineDir {
            path: run_dir.as_ref().join(PIPELINE_DIR),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_dir()
    }

    /// Create the directory. Returns `false` if it was already there,
    /// which a caller racing another driver can use to back off.
    pub fn create(&self) -> Result<bool> {
        match fs::create_dir(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(PipelineError::io(&self.path, e)),
        }
    }

    pub fn file(&self, tf: TouchFile) -> PathBuf {
        self.path.join(tf.file_name())
    }

    pub fn has(&self, tf: TouchFile) -> bool {
        self.file(tf).exists()
    }

    /// Create the touchfile if absent. Returns whether it was created.
    pub fn touch(&self, tf: TouchFile) -> Result<bool> {
        match create_exclusive(self.file(tf)) {
            Ok(_) => Ok(true),
            Err(PipelineError::Collision(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Create the touchfile, failing with `Collision` if it exists.
    pub fn touch_exclusive(&self, tf: TouchFile) -> Result<()> {
        create_exclusive(self.file(tf)).map(|_| ())
    }

    /// Remove the touchfile. Returns whether it existed.
    pub fn remove(&self, tf: TouchFile) -> Result<bool> {
        remove_if_present(self.file(tf))
    }

    pub fn snapshot(&self) -> Result<TouchSnapshot> {
        let mut snap = TouchSnapshot::default();
        let entries = match fs::read_dir(&self.path) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(snap),
            Err(e) => return Err(PipelineError::io(&self.path, e)),
        };
        snap.pipeline_exists = true;

        for entry in entries {
            let entry = entry.at(&self.path)?;
            let name = entry.file_name();
            let name = match name.to_str() {
                Some(n) => n,
                None => continue,
            };

            if let Some(cap) = LANE_FILE_REGEX.captures(name) {
                // single digit, so the parse cannot fail
                let lane: u32 = cap[1].parse().unwrap_or(0);
                match &cap[2] {
                    "started" => snap.started_lanes.insert(lane),
                    "done" => snap.done_lanes.insert(lane),
                    _ => snap.redo_lanes.insert(lane),
                };
                continue;
            }

            match name {
                "read1.started" => snap.read1_started = true,
                "read1.done" => snap.read1_done = true,
                "qc.started" => snap.qc_started = true,
                "qc.done" => snap.qc_done = true,
                "failed" => snap.failed = true,
                "aborted" => snap.aborted = true,
                _ => (),
            }
        }
        Ok(snap)
    }

    /// Take the per-run driver lock. Returns `None` if another live
    /// driver holds it. A lock older than `stale_after` whose recorded
    /// pid is no longer running is broken and retaken.
    pub fn try_lock(&self, stale_after: Duration) -> Result<Option<DriverLock>> {
        let path = self.file(TouchFile::DriverLock);
        for _ in 0..2 {
            match create_exclusive(&path) {
                Ok(mut f) => {
                    writeln!(f, "{}", std::process::id()).at(&path)?;
                    return Ok(Some(DriverLock { path }));
                }
                Err(PipelineError::Collision(_)) => {
                    if !lock_is_stale(&path, stale_after)? {
                        return Ok(None);
                    }
                    warn!("breaking stale lock {}", path.display());
                    remove_if_present(&path)?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }
}

fn lock_is_stale(path: &Path, stale_after: Duration) -> Result<bool> {
    let meta = match fs::metadata(path) {
        Ok(m) => m,
        // released while we looked at it
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(PipelineError::io(path, e)),
    };
    let age = meta
        .modified()
        .ok()
        .and_then(|m| SystemTime::now().duration_since(m).ok())
        .unwrap_or_default();
    if age <= stale_after {
        return Ok(false);
    }

    let pid = fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse::<i32>().ok());
    Ok(!pid.map_or(false, pid_alive))
}

/// Signal 0 probes for existence without delivering anything.
fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Held while a driver acts on a run; the lock file is removed on drop.
#[derive(Debug)]
pub struct DriverLock {
    path: PathBuf,
}

impl DriverLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DriverLock {
    fn drop(&mut self) {
        if let Err(e) = remove_if_present(&self.path) {
            warn!("could not release {}: {}", self.path.display(), e);
        }
    }
}
