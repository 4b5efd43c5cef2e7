// Copyright (c) 2018 10x Genomics, Inc. All rights reserved.

//! Versioned sample sheets in a run directory.
//!
//! `SampleSheet.csv` in a run directory is kept as a symlink to the
//! active version, `SampleSheet.csv.<n>`. The sheet the sequencer wrote
//! becomes version 0; each replacement fetched from the share gets the
//! next number. `pipeline/SampleSheet.csv.OVERRIDE` beats everything.

use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::{IoContext, PipelineError, Result};
use crate::touchfiles::{PipelineDir, TouchFile, PIPELINE_DIR};
use crate::utils::{create_exclusive, file_digest, remove_if_present, sibling_tmp};

pub const ACTIVE_SHEET: &str = "SampleSheet.csv";

lazy_static! {
    static ref VERSION_REGEX: Regex = Regex::new(r"^SampleSheet\.csv\.([0-9]+)$").unwrap();
}

/// Flowcell token used to pair sample sheets with runs: the last `_` and
/// `-` separated part of a name, uppercased, without a leading `A`/`B`
/// stage letter. `foo_BHCVH2BBXX.csv`, the run
/// `160726_K00166_0120_BHCVH2BBXX` and the flowcell `HCVH2BBXX` all give
/// `HCVH2BBXX`.
pub fn flowcell_token(name: &str) -> String {
    let stem = name.strip_suffix(".csv").unwrap_or(name).to_uppercase();
    let tail = stem.rsplit('_').next().unwrap_or(&stem);
    let tail = tail.rsplit('-').next().unwrap_or(tail);
    tail.strip_prefix(|c: char| c == 'A' || c == 'B')
        .filter(|t| !t.is_empty())
        .unwrap_or(tail)
        .to_string()
}

fn version_path(run_dir: &Path, n: u32) -> PathBuf {
    run_dir.join(format!("{}.{}", ACTIVE_SHEET, n))
}

/// Numbered versions present, in order.
pub fn versions(run_dir: &Path) -> Result<Vec<(u32, PathBuf)>> {
    let mut res = Vec::new();
    for entry in fs::read_dir(run_dir).at(run_dir)? {
        let path = entry.at(run_dir)?.path();
        let n = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| VERSION_REGEX.captures(n))
            .and_then(|c| c[1].parse().ok());
        if let Some(n) = n {
            res.push((n, path));
        }
    }
    res.sort();
    Ok(res)
}

/// The file `SampleSheet.csv` currently resolves to.
pub fn active_sheet(run_dir: &Path) -> Option<PathBuf> {
    let link = run_dir.join(ACTIVE_SHEET);
    match fs::read_link(&link) {
        Ok(target) => Some(run_dir.join(target)),
        Err(_) if link.is_file() => Some(link),
        Err(_) => None,
    }
}

/// Swap `SampleSheet.csv` to point at `target` (relative to the run
/// directory) in a single rename.
fn point_link(run_dir: &Path, target: &Path) -> Result<()> {
    let link = run_dir.join(ACTIVE_SHEET);
    let tmp = sibling_tmp(&link);
    remove_if_present(&tmp)?;
    symlink(target, &tmp).at(&tmp)?;
    fs::rename(&tmp, &link).at(&link)
}

fn same_content(a: &Path, b: &Path) -> Result<bool> {
    Ok(file_digest(a)? == file_digest(b)?)
}

/// Make sure `SampleSheet.csv` is a symlink to a numbered version.
///
/// A regular file is moved to `SampleSheet.csv.0`, or linked to an
/// existing version with the same content. A regular file that matches no
/// version when `.0` is already taken is an error and is left in place.
/// With no sheet at all an empty `.0` is created.
pub fn preserve_original(run_dir: &Path) -> Result<()> {
    let link = run_dir.join(ACTIVE_SHEET);
    let meta = match fs::symlink_metadata(&link) {
        Ok(m) => Some(m),
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => return Err(PipelineError::io(&link, e)),
    };
    let first = version_path(run_dir, 0);
    let first_name = PathBuf::from(format!("{}.0", ACTIVE_SHEET));

    match meta {
        Some(m) if m.file_type().is_symlink() => Ok(()),
        Some(_) => {
            if !first.exists() {
                fs::rename(&link, &first).at(&first)?;
                symlink(&first_name, &link).at(&link)?;
                info!("{} renamed as {}", ACTIVE_SHEET, first_name.display());
                return Ok(());
            }
            for (_, v) in versions(run_dir)? {
                if same_content(&link, &v)? {
                    let name = v.file_name().map(PathBuf::from).unwrap_or_default();
                    point_link(run_dir, &name)?;
                    info!("{} relinked to identical {}", ACTIVE_SHEET, name.display());
                    return Ok(());
                }
            }
            Err(PipelineError::StateInconsistent(format!(
                "{} is a regular file matching no saved version",
                link.display()
            )))
        }
        None => {
            if !first.exists() {
                create_exclusive(&first)?;
                info!("{} created as empty file", first_name.display());
            }
            symlink(&first_name, &link).at(&link)?;
            Ok(())
        }
    }
}

/// Copy `src` in as the next numbered version and make it active.
pub fn install_sample_sheet(run_dir: &Path, src: &Path) -> Result<PathBuf> {
    let next = versions(run_dir)?.last().map_or(0, |(n, _)| n + 1);
    let dest = version_path(run_dir, next);
    create_exclusive(&dest)?;
    fs::copy(src, &dest).at(src)?;
    point_link(run_dir, Path::new(&format!("{}.{}", ACTIVE_SHEET, next)))?;
    info!(
        "{} is now linked to {} from {}",
        ACTIVE_SHEET,
        dest.display(),
        src.display()
    );
    Ok(dest)
}

fn mtime(path: &Path) -> Result<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).at(path)
}

/// Sheets in `share` whose names carry `flowcell`'s token, oldest first.
pub fn candidates(share: &Path, flowcell: &str) -> Result<Vec<PathBuf>> {
    let token = flowcell_token(flowcell);
    let pattern = format!("{}/*_*.csv", glob::Pattern::escape(&share.to_string_lossy()));
    let paths = glob::glob(&pattern)
        .map_err(|e| PipelineError::config(format!("bad pattern {}: {}", pattern, e)))?;

    let mut res = Vec::new();
    for p in paths.flatten() {
        let name = p.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if p.is_file() && flowcell_token(name) == token {
            res.push((mtime(&p)?, p));
        }
    }
    res.sort();
    Ok(res.into_iter().map(|(_, p)| p).collect())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The active sheet was already the best available.
    Unchanged,
    /// A new version was installed.
    Installed(PathBuf),
    /// The manual override is active.
    Override,
}

/// Bring the run's active sheet up to date: the override if present,
/// else the newest matching sheet in `share` if it differs from the
/// active one.
pub fn fetch(run_dir: &Path, share: Option<&Path>, flowcell: &str) -> Result<FetchOutcome> {
    preserve_original(run_dir)?;

    let pipeline = PipelineDir::for_run(run_dir);
    if pipeline.has(TouchFile::Override) {
        let target = Path::new(PIPELINE_DIR).join(TouchFile::Override.file_name());
        if fs::read_link(run_dir.join(ACTIVE_SHEET)).ok().as_deref() != Some(target.as_path()) {
            point_link(run_dir, &target)?;
        }
        info!("giving priority to {}", pipeline.file(TouchFile::Override).display());
        return Ok(FetchOutcome::Override);
    }

    let share = match share {
        Some(s) => s,
        None => return Ok(FetchOutcome::Unchanged),
    };
    let newest = match candidates(share, flowcell)?.pop() {
        Some(p) => p,
        None => {
            info!("no candidate replacement sample sheet for {} in {}", flowcell, share.display());
            return Ok(FetchOutcome::Unchanged);
        }
    };

    if let Some(active) = active_sheet(run_dir) {
        if same_content(&active, &newest)? {
            return Ok(FetchOutcome::Unchanged);
        }
    }
    install_sample_sheet(run_dir, &newest).map(FetchOutcome::Installed)
}
