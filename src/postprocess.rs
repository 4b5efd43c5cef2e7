// Copyright (c) 2018 10x Genomics, Inc. All rights reserved.

//! Move bcl2fastq output into the project layout.
//!
//! Sample files under `demultiplexing/lane<N>/<project>/` become
//! `<project>/<pool>/<run>_<lane>_<library>_<read>.fastq.gz` and
//! undetermined reads become `<run>_<lane>_unassigned_<read>.fastq.gz`,
//! both relative to the run's output directory. When a sample has three
//! reads the middle one is the UMI: read 2 is labelled `UMI` and read 3
//! becomes read 2.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use itertools::Itertools;

use crate::cleanup::PROJECTS_PENDING;
use crate::error::{IoContext, PipelineError, Result};
use crate::filenames::bcl2fastq::{DemuxFastq, DemuxLaneDir};
use crate::filenames::canonical::{FastqIdentity, ReadLabel};
use crate::filenames::FindFastqs;
use crate::report::{read_sample_summary, SAMPLE_SUMMARY};
use crate::sample_sheet::{split_pool_library, validate_project_name};
use crate::touchfiles::PIPELINE_DIR;
use crate::utils::{create_exclusive, prune_empty_dirs, read_lines_if_present, remove_if_present, write_synced, ActionLog};

pub const RENAMES_LOG: &str = "renames.log";
pub const PROJECTS_READY: &str = "projects_ready.txt";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PostProcessReport {
    /// `(from, to)` for every file moved.
    pub renamed: Vec<(PathBuf, PathBuf)>,
    /// Projects with at least one file moved.
    pub projects: BTreeSet<String>,
    /// Final contents of `projects_ready.txt`.
    pub ready: Vec<String>,
}

/// A file and where it is going.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Move {
    from: PathBuf,
    to: FastqIdentity,
}

/// Files are grouped by sample and lane; `read` is the bcl2fastq read
/// number.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct ReadKey {
    project: String,
    pool_library: String,
    lane: u32,
}

/// Relabel reads for every sample. If any sample has a read 3, each
/// sample with reads 2 and 3 has them relabelled as `UMI` and `2`. A read
/// 3 with no read 2 cannot be placed.
fn remap_reads(reads: &BTreeMap<ReadKey, BTreeSet<u32>>) -> Result<BTreeMap<(ReadKey, u32), ReadLabel>> {
    let umi_run = reads.values().any(|r| r.contains(&3));
    let mut res = BTreeMap::new();

    for (key, nums) in reads {
        let has_umi = umi_run && nums.contains(&3);
        if has_umi && !nums.contains(&2) {
            return Err(PipelineError::StateInconsistent(format!(
                "read 3 without read 2 for {} lane {}",
                key.pool_library, key.lane
            )));
        }
        for &n in nums {
            let label = match (has_umi, n) {
                (true, 2) => ReadLabel::Umi,
                (true, 3) => ReadLabel::Read(2),
                _ => ReadLabel::Read(n),
            };
            res.insert((key.clone(), n), label);
        }
    }
    Ok(res)
}

fn plan_moves(found: Vec<DemuxFastq>) -> Result<Vec<Move>> {
    let mut reads: BTreeMap<ReadKey, BTreeSet<u32>> = BTreeMap::new();
    let mut keyed = Vec::with_capacity(found.len());

    for f in found {
        let (key, read) = match &f {
            DemuxFastq::Sample {
                project,
                pool_library,
                file,
            } => (
                ReadKey {
                    project: project.clone(),
                    pool_library: pool_library.clone(),
                    lane: file.lane,
                },
                file.read,
            ),
            DemuxFastq::Undetermined(u) => (
                ReadKey {
                    project: String::new(),
                    pool_library: String::new(),
                    lane: u.lane,
                },
                u.read,
            ),
        };
        reads.entry(key.clone()).or_default().insert(read);
        keyed.push((key, read, f));
    }

    let labels = remap_reads(&reads)?;

    let mut moves = Vec::with_capacity(keyed.len());
    for (key, read, f) in keyed {
        let label = labels[&(key.clone(), read)];
        let to = match &f {
            DemuxFastq::Sample { project, .. } => {
                let (pool, library) = split_pool_library(&key.pool_library);
                FastqIdentity {
                    project: project.clone(),
                    pool: pool.to_string(),
                    library: library.to_string(),
                    lane: key.lane,
                    read: label,
                }
            }
            DemuxFastq::Undetermined(_) => FastqIdentity::unassigned(key.lane, label),
        };
        moves.push(Move {
            from: f.path().to_path_buf(),
            to,
        });
    }
    Ok(moves)
}

/// Projects found on disk must be valid names and, when the run has a
/// sample summary, must be ones it lists.
fn check_projects(out_dir: &Path, moves: &[Move]) -> Result<()> {
    let found: BTreeSet<&str> = moves
        .iter()
        .filter(|m| !m.to.is_unassigned())
        .map(|m| m.to.project.as_str())
        .collect();
    for p in &found {
        validate_project_name(p)?;
    }

    let summary_path = out_dir
        .join("seqdata")
        .join(PIPELINE_DIR)
        .join(SAMPLE_SUMMARY);
    if let Some(summary) = read_sample_summary(&summary_path)? {
        let allowed = summary.projects();
        let unknown: Vec<&str> = found.difference(&allowed).copied().collect();
        if !unknown.is_empty() {
            return Err(PipelineError::config(format!(
                "projects {} are not listed in {}",
                unknown.join(","),
                summary_path.display()
            )));
        }
    }
    Ok(())
}

/// Run id from the output directory name when not given.
fn default_run_id(out_dir: &Path) -> Result<String> {
    out_dir
        .file_name()
        .and_then(|n| n.to_str())
        .map(String::from)
        .ok_or_else(|| PipelineError::config(format!("cannot infer run id from {}", out_dir.display())))
}

/// Rename everything in `out_dir/demultiplexing` into place.
///
/// A destination that already exists aborts the whole operation; files
/// moved before the clash stay moved. Projects whose demultiplexing
/// directories are not empty afterwards are left out of
/// `projects_ready.txt` and kept in `projects_pending.txt`, and an error
/// is returned once both files are written.
pub fn postprocess(out_dir: &Path, run_id: Option<&str>) -> Result<PostProcessReport> {
    let run_id = match run_id {
        Some(r) => r.to_string(),
        None => default_run_id(out_dir)?,
    };
    let mut log = ActionLog::open(out_dir.join(RENAMES_LOG))?;
    log.line(format_args!("renaming files in {}", out_dir.display()))?;

    let lane_dirs = DemuxLaneDir::list(out_dir.join("demultiplexing"))?;
    let mut found = Vec::new();
    for ld in &lane_dirs {
        found.extend(ld.find_fastqs()?);
    }

    let moves = plan_moves(found)?;
    check_projects(out_dir, &moves)?;

    let mut report = PostProcessReport::default();
    for m in moves {
        let dest = out_dir.join(m.to.relative_path(&run_id));
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).at(parent)?;
        }
        // claim the name first so nothing is ever renamed over
        create_exclusive(&dest)?;
        fs::rename(&m.from, &dest).at(&m.from)?;
        log.line(format_args!("mv '{}' '{}'", m.from.display(), dest.display()))?;

        if !m.to.is_unassigned() {
            report.projects.insert(m.to.project.clone());
        }
        report.renamed.push((m.from, dest));
    }

    let mut not_ready = BTreeSet::new();
    for ld in &lane_dirs {
        for (project, dir) in ld.project_dirs()? {
            for d in prune_empty_dirs(&dir)? {
                log.line(format_args!("rmdir '{}'", d.display()))?;
            }
            if dir.exists() {
                warn!("{} is not empty after renaming", dir.display());
                not_ready.insert(project);
            }
        }
    }

    let previous = read_lines_if_present(out_dir.join(PROJECTS_READY))?;
    report.ready = previous
        .into_iter()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .chain(report.projects.iter().cloned())
        .filter(|p| !not_ready.contains(p) && out_dir.join(p).is_dir())
        .sorted()
        .dedup()
        .collect();

    let mut ready_text = report.ready.join("\n");
    if !ready_text.is_empty() {
        ready_text.push('\n');
    }
    write_synced(out_dir.join(PROJECTS_READY), ready_text.as_bytes())?;

    let pending = out_dir.join(PROJECTS_PENDING);
    if not_ready.is_empty() {
        remove_if_present(&pending)?;
    } else {
        let text: String = not_ready.iter().map(|p| format!("{}\n", p)).collect();
        write_synced(&pending, text.as_bytes())?;
    }
    log.line(format_args!(
        "renamed {} files; {} projects ready",
        report.renamed.len(),
        report.ready.len()
    ))?;

    if !not_ready.is_empty() {
        return Err(PipelineError::StateInconsistent(format!(
            "files left behind in demultiplexing for projects {}",
            not_ready.iter().join(",")
        )));
    }
    Ok(report)
}
