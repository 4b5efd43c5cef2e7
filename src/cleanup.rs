// Copyright (c) 2018 10x Genomics, Inc. All rights reserved.

//! Removal of a lane's FASTQ output ahead of re-demultiplexing.
//!
//! Both the bcl2fastq output under `demultiplexing/` and the renamed
//! files in the project directories are removed, along with checksum and
//! count files derived from them and the lane's QC reports. Every
//! deletion is recorded in `cleanup.log`, and the affected projects are
//! appended to `projects_pending.txt`.

use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::{IoContext, PipelineError, Result};
use crate::filenames::bcl2fastq::demux_area_lane;
use crate::filenames::canonical::post_rename_lane;
use crate::utils::{prune_empty_dirs, ActionLog};

lazy_static! {
    static ref PROJECT_DIR_REGEX: Regex = Regex::new(r"^(?:[0-9]+|ControlLane)$").unwrap();
    static ref LANE_DIR_REGEX: Regex = Regex::new(r"^lane[0-9]+$").unwrap();
}

pub const CLEANUP_LOG: &str = "cleanup.log";
pub const PROJECTS_PENDING: &str = "projects_pending.txt";

/// Directories holding per-file derivatives of the renamed FASTQ.
const ANCILLARY_DIRS: [&str; 2] = ["md5sums", "counts"];

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub deleted: Vec<PathBuf>,
    pub ancillary_deleted: Vec<PathBuf>,
    pub removed_dirs: Vec<PathBuf>,
    pub projects: BTreeSet<String>,
}

/// Lanes must be a non-empty subset of 1..=8.
pub fn validate_lanes(lanes: &BTreeSet<u32>) -> Result<()> {
    if lanes.is_empty() {
        return Err(PipelineError::config("no lanes specified to clean"));
    }
    if let Some(bad) = lanes.iter().find(|&&l| !(1..=8).contains(&l)) {
        return Err(PipelineError::config(format!("{} is not a valid lane", bad)));
    }
    Ok(())
}

fn is_project_dir(name: &str) -> bool {
    PROJECT_DIR_REGEX.is_match(name)
}

fn file_name(p: &Path) -> &str {
    p.file_name().and_then(|n| n.to_str()).unwrap_or("")
}

/// All regular files under `dir`, without following symlinks.
fn walk_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir).at(dir)? {
        let entry = entry.at(dir)?;
        let ft = entry.file_type().at(entry.path())?;
        if ft.is_dir() {
            walk_files(&entry.path(), out)?;
        } else if ft.is_file() {
            out.push(entry.path());
        }
    }
    Ok(())
}

/// The immediate subdirectories of `dir` accepted by `keep`.
fn subdirs(dir: &Path, keep: impl Fn(&str) -> bool) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(PipelineError::io(dir, e)),
    };
    let mut res = Vec::new();
    for entry in entries {
        let entry = entry.at(dir)?;
        if entry.file_type().at(entry.path())?.is_dir() && keep(file_name(&entry.path())) {
            res.push(entry.path());
        }
    }
    res.sort();
    Ok(res)
}

/// First component of `path` below `base` that names a project.
fn project_of(base: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(base).ok()?;
    let parent = rel.parent()?;
    parent
        .components()
        .filter_map(|c| c.as_os_str().to_str())
        .find(|c| is_project_dir(c))
        .map(String::from)
}

struct Cleaner<'a> {
    out_dir: &'a Path,
    lanes: &'a BTreeSet<u32>,
    log: ActionLog,
    report: CleanupReport,
}

impl<'a> Cleaner<'a> {
    fn delete(&mut self, path: &Path) -> Result<()> {
        fs::remove_file(path).at(path)?;
        self.log.line(format_args!("rm '{}'", path.display()))?;
        self.report.deleted.push(path.to_path_buf());
        Ok(())
    }

    fn prune(&mut self, dir: &Path) -> Result<()> {
        for d in prune_empty_dirs(dir)? {
            self.log.line(format_args!("rmdir '{}'", d.display()))?;
            self.report.removed_dirs.push(d);
        }
        Ok(())
    }

    /// bcl2fastq output under `demultiplexing/lane*/`.
    fn clean_demultiplexing(&mut self) -> Result<()> {
        let demux = self.out_dir.join("demultiplexing");
        let mut touched_dirs = BTreeSet::new();

        for lane_dir in subdirs(&demux, |n| LANE_DIR_REGEX.is_match(n))? {
            let mut files = Vec::new();
            walk_files(&lane_dir, &mut files)?;
            files.sort();

            for f in files {
                let lane = match demux_area_lane(file_name(&f)) {
                    Some(l) if self.lanes.contains(&l) => l,
                    _ => continue,
                };
                debug!("lane {} file {}", lane, f.display());
                if let Some(p) = project_of(&lane_dir, &f) {
                    touched_dirs.insert(lane_dir.join(&p));
                    self.report.projects.insert(p);
                }
                self.delete(&f)?;
            }
        }

        for d in touched_dirs {
            self.prune(&d)?;
        }
        Ok(())
    }

    /// Renamed FASTQ in the output root and its project directories.
    fn clean_renamed(&mut self) -> Result<()> {
        let mut files = Vec::new();
        for entry in fs::read_dir(self.out_dir).at(self.out_dir)? {
            let entry = entry.at(self.out_dir)?;
            let ft = entry.file_type().at(entry.path())?;
            if ft.is_file() {
                files.push(entry.path());
            } else if ft.is_dir() && is_project_dir(file_name(&entry.path())) {
                walk_files(&entry.path(), &mut files)?;
            }
        }
        files.sort();

        let mut projects = BTreeSet::new();
        for f in files {
            match post_rename_lane(file_name(&f)) {
                Some(l) if self.lanes.contains(&l) => (),
                _ => continue,
            }
            if let Some(p) = project_of(self.out_dir, &f) {
                projects.insert(p);
            }
            self.delete(&f)?;
            self.delete_ancillary(&f)?;
        }

        for p in &projects {
            self.prune(&self.out_dir.join(p))?;
        }
        self.report.projects.extend(projects);
        Ok(())
    }

    /// `md5sums/<rel>.*` and `counts/<rel>.*` for a deleted renamed file.
    fn delete_ancillary(&mut self, fastq: &Path) -> Result<()> {
        let rel = match fastq.strip_prefix(self.out_dir) {
            Ok(r) => r,
            Err(_) => return Ok(()),
        };
        let name = file_name(rel);
        let stem = name.strip_suffix(".fastq.gz").unwrap_or(name);
        let rel_stem = rel.with_file_name(stem);

        for od in ANCILLARY_DIRS.iter() {
            let base = self.out_dir.join(od).join(&rel_stem);
            let pattern = format!("{}.*", glob::Pattern::escape(&base.to_string_lossy()));
            let matches = glob::glob(&pattern)
                .map_err(|e| PipelineError::config(format!("bad pattern {}: {}", pattern, e)))?;
            for m in matches.flatten() {
                if m.is_file() {
                    fs::remove_file(&m).at(&m)?;
                    self.log.line(format_args!("rm '{}'", m.display()))?;
                    self.report.ancillary_deleted.push(m);
                }
            }
        }
        Ok(())
    }

    /// Per-lane QC output would be stale after a redo.
    fn clean_qc(&mut self) -> Result<()> {
        let qc = self.out_dir.join("QC");
        for lane in self.lanes {
            let lane_qc = qc.join(format!("lane{}", lane));
            if lane_qc.is_dir() {
                fs::remove_dir_all(&lane_qc).at(&lane_qc)?;
                self.log.line(format_args!("rm -r '{}'", lane_qc.display()))?;
            }

            let pattern = format!(
                "{}/multiqc_report_lane{}*",
                glob::Pattern::escape(&qc.to_string_lossy()),
                lane
            );
            let matches = glob::glob(&pattern)
                .map_err(|e| PipelineError::config(format!("bad pattern {}: {}", pattern, e)))?;
            for m in matches.flatten() {
                if m.is_dir() {
                    fs::remove_dir_all(&m).at(&m)?;
                } else {
                    fs::remove_file(&m).at(&m)?;
                }
                self.log.line(format_args!("rm -r '{}'", m.display()))?;
            }
        }
        Ok(())
    }

    fn record_pending(&mut self) -> Result<()> {
        let path = self.out_dir.join(PROJECTS_PENDING);
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .at(&path)?;
        for p in &self.report.projects {
            writeln!(f, "{}", p).at(&path)?;
        }
        self.log.line(format_args!(
            "{} projects added to {}",
            self.report.projects.len(),
            PROJECTS_PENDING
        ))
    }
}

/// Remove all FASTQ for `lanes` from `out_dir`. Running it twice with
/// the same lanes deletes nothing the second time.
pub fn cleanup_lanes(out_dir: &Path, lanes: &BTreeSet<u32>) -> Result<CleanupReport> {
    validate_lanes(lanes)?;
    if !out_dir.is_dir() {
        return Err(PipelineError::io(
            out_dir,
            io::Error::new(io::ErrorKind::NotFound, "output directory does not exist"),
        ));
    }

    let log = ActionLog::open(out_dir.join(CLEANUP_LOG))?;
    let mut c = Cleaner {
        out_dir,
        lanes,
        log,
        report: CleanupReport::default(),
    };
    let lane_list: Vec<String> = lanes.iter().map(|l| l.to_string()).collect();
    c.log.line(format_args!(
        "cleaning lanes {} in {}",
        lane_list.join(","),
        out_dir.display()
    ))?;

    c.clean_demultiplexing()?;
    c.clean_renamed()?;
    c.clean_qc()?;
    c.record_pending()?;

    c.log.line(format_args!(
        "deleted {} fastq files, {} ancillary files and {} directories",
        c.report.deleted.len(),
        c.report.ancillary_deleted.len(),
        c.report.removed_dirs.len()
    ))?;
    Ok(c.report)
}
