// Copyright (c) 2018 10x Genomics, Inc. All rights reserved.

//! Request redos of lanes whose sample sheet has been revised.
//!
//! Revised sheets are deposited on a share as `<anything>_<FLOWCELL>.csv`.
//! For each recent one, the matching run is found and compared against
//! its active sheet; lanes whose rows changed get a `lane<N>.redo`
//! touchfile and the revised sheet becomes the active one. Nothing is
//! demultiplexed here. The driver notices the redo on its next tick.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::config::PipelineConfig;
use crate::driver::discover_runs;
use crate::error::{ErrorCollector, IoContext, PipelineError, Result};
use crate::run_info::RunInfo;
use crate::sample_sheet::SampleSheet;
use crate::samplesheet_fetch::{active_sheet, flowcell_token, install_sample_sheet, preserve_original};
use crate::status::{PipelineStatus, RunStatus};
use crate::touchfiles::{PipelineDir, TouchFile};
use crate::utils::{file_digest, ActionLog};

pub const AUTOREDO_LOG: &str = "autoredo.log";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RedoDecision {
    Skip(String),
    Planted {
        run: PathBuf,
        lanes: BTreeSet<u32>,
        installed: PathBuf,
    },
}

fn mtime(path: &Path) -> Result<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).at(path)
}

/// `*.csv` anywhere under `root` modified within `window` of `now`,
/// oldest first.
pub fn recent_sheets(root: &Path, window: Duration, now: SystemTime) -> Result<Vec<PathBuf>> {
    let cutoff = now.checked_sub(window).unwrap_or(SystemTime::UNIX_EPOCH);
    let pattern = format!("{}/**/*.csv", glob::Pattern::escape(&root.to_string_lossy()));
    let paths = glob::glob(&pattern)
        .map_err(|e| PipelineError::config(format!("bad pattern {}: {}", pattern, e)))?;

    let mut res = Vec::new();
    for p in paths.flatten() {
        if !p.is_file() {
            continue;
        }
        let t = mtime(&p)?;
        if t >= cutoff {
            res.push((t, p));
        }
    }
    res.sort();
    Ok(res.into_iter().map(|(_, p)| p).collect())
}

/// Runs under `seqdata` whose flowcell token is `token`. The token is
/// taken from `RunInfo.xml` when readable, and from the directory name
/// otherwise.
pub fn runs_for_token(seqdata: &Path, config: &PipelineConfig, token: &str) -> Result<Vec<PathBuf>> {
    let mut res = Vec::new();
    for run in discover_runs(seqdata, config)? {
        let name = run.file_name().and_then(|n| n.to_str()).unwrap_or("");
        let run_token = match RunInfo::from_run_dir(&run) {
            Ok(info) => flowcell_token(&info.flowcell),
            Err(_) => flowcell_token(name),
        };
        if run_token == token {
            res.push(run);
        }
    }
    Ok(res)
}

fn same_file(a: &Path, b: &Path) -> Result<bool> {
    if let (Ok(ra), Ok(rb)) = (fs::canonicalize(a), fs::canonicalize(b)) {
        if ra == rb {
            return Ok(true);
        }
    }
    Ok(file_digest(a)? == file_digest(b)?)
}

/// Decide what to do with one candidate sheet, and do it.
pub fn consider(candidate: &Path, seqdata: &Path, config: &PipelineConfig) -> Result<RedoDecision> {
    let name = candidate
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");
    let token = flowcell_token(name);

    let runs = runs_for_token(seqdata, config, &token)?;
    let run = match runs.as_slice() {
        [run] => run.clone(),
        [] => return Ok(RedoDecision::Skip(format!("no run for flowcell {}", token))),
        _ => {
            return Ok(RedoDecision::Skip(format!(
                "{} runs match flowcell {}",
                runs.len(),
                token
            )))
        }
    };

    let status = RunStatus::load(&run)?;
    let state = status.pipeline_status();
    match state {
        PipelineStatus::Complete | PipelineStatus::PartiallyComplete | PipelineStatus::Failed => (),
        other => {
            return Ok(RedoDecision::Skip(format!(
                "{} is {}",
                status.run_info.run_id, other
            )))
        }
    }

    let active = active_sheet(&run);
    if let Some(active) = &active {
        if same_file(active, candidate)? {
            return Ok(RedoDecision::Skip("sheet is already active".to_string()));
        }
        if mtime(active)? > mtime(candidate)? {
            return Ok(RedoDecision::Skip("active sheet is newer".to_string()));
        }
    }

    let pipeline = PipelineDir::for_run(&run);
    if pipeline.has(TouchFile::Override) {
        return Ok(RedoDecision::Skip(format!("{} is present", TouchFile::Override)));
    }

    let lane_count = status.run_info.lane_count;
    let new_sheet = SampleSheet::from_path(candidate)?;
    // a plain SampleSheet.csv becomes version 0 before anything replaces it
    preserve_original(&run)?;
    let lanes: BTreeSet<u32> = match (&active, state) {
        (_, PipelineStatus::Failed) | (None, _) => (1..=lane_count).collect(),
        (Some(active), _) => SampleSheet::from_path(active)?.changed_lanes(&new_sheet, lane_count),
    };

    let mut log = ActionLog::open(pipeline.path().join(AUTOREDO_LOG))?;
    log.line(format_args!(
        "{} is {}; new sample sheet {}",
        status.run_info.run_id,
        state,
        candidate.display()
    ))?;
    for &lane in &lanes {
        pipeline.touch(TouchFile::LaneRedo(lane))?;
        log.line(format_args!("created {}", TouchFile::LaneRedo(lane)))?;
    }
    let installed = install_sample_sheet(&run, candidate)?;
    log.line(format_args!("installed {}", installed.display()))?;

    Ok(RedoDecision::Planted {
        run,
        lanes,
        installed,
    })
}

#[derive(Debug, Default)]
pub struct AutoRedoReport {
    pub decisions: Vec<(PathBuf, RedoDecision)>,
    pub errors: ErrorCollector,
}

/// Consider every recent sheet. A failure on one sheet is recorded and
/// the rest are still looked at.
pub fn scan(config: &PipelineConfig, now: SystemTime) -> Result<AutoRedoReport> {
    let seqdata = config.seqdata()?;
    let root = config.samplesheets_root()?;

    let mut report = AutoRedoReport::default();
    for sheet in recent_sheets(root, config.redo_window(), now)? {
        match consider(&sheet, seqdata, config) {
            Ok(d) => {
                if let RedoDecision::Skip(why) = &d {
                    info!("skip {}: {}", sheet.display(), why);
                }
                report.decisions.push((sheet, d));
            }
            Err(e) => report.errors.push(sheet.display(), e),
        }
    }
    Ok(report)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::run_info::test::HISEQ4000_RUNINFO;
    use crate::sample_sheet::test::HISEQ_SHEET;
    use pretty_assertions::assert_eq;
    use std::fs::File;

    const RUN: &str = "160726_K00166_0120_BHCVH2BBXX";

    fn age(p: &Path, secs: u64) {
        let t = SystemTime::now() - Duration::from_secs(secs);
        File::options().write(true).open(p).unwrap().set_modified(t).unwrap();
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        seqdata: PathBuf,
        sheets: PathBuf,
        run: PathBuf,
        config: PipelineConfig,
    }

    /// A finished HiSeq run with the usual sheet active, and an empty
    /// sheet share.
    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let seqdata = tmp.path().join("seqdata");
        let sheets = tmp.path().join("sheets");
        let run = seqdata.join(RUN);
        fs::create_dir_all(run.join("pipeline")).unwrap();
        fs::create_dir_all(sheets.join("2016/7")).unwrap();
        fs::write(run.join("RunInfo.xml"), HISEQ4000_RUNINFO).unwrap();
        fs::write(run.join("RTAComplete.txt"), "").unwrap();
        for lane in 1..=8 {
            fs::write(run.join(format!("pipeline/lane{}.done", lane)), "").unwrap();
        }
        fs::write(run.join("pipeline/qc.done"), "").unwrap();
        fs::write(run.join("SampleSheet.csv.0"), HISEQ_SHEET).unwrap();
        age(&run.join("SampleSheet.csv.0"), 3600);
        std::os::unix::fs::symlink("SampleSheet.csv.0", run.join("SampleSheet.csv")).unwrap();

        let config = PipelineConfig {
            seqdata: Some(seqdata.clone()),
            samplesheets_root: Some(sheets.clone()),
            ..PipelineConfig::default()
        };
        Fixture {
            _tmp: tmp,
            seqdata,
            sheets,
            run,
            config,
        }
    }

    fn revised() -> String {
        HISEQ_SHEET.replace("CGCTCATTNN", "GGGGCCCC")
    }

    #[test]
    fn test_redo_changed_lane() -> Result<()> {
        let f = fixture();
        let sheet = f.sheets.join("2016/7/revised_BHCVH2BBXX.csv");
        fs::write(&sheet, revised()).unwrap();

        let d = consider(&sheet, &f.seqdata, &f.config)?;
        assert_eq!(
            d,
            RedoDecision::Planted {
                run: f.run.clone(),
                lanes: vec![2].into_iter().collect(),
                installed: f.run.join("SampleSheet.csv.1"),
            }
        );
        assert!(f.run.join("pipeline/lane2.redo").exists());
        assert!(!f.run.join("pipeline/lane1.redo").exists());
        assert_eq!(
            fs::read_link(f.run.join("SampleSheet.csv")).unwrap(),
            PathBuf::from("SampleSheet.csv.1")
        );
        assert!(f.run.join("pipeline").join(AUTOREDO_LOG).exists());
        assert_eq!(RunStatus::load(&f.run)?.pipeline_status(), PipelineStatus::Redo);

        // now active, so a second look does nothing
        let again = consider(&sheet, &f.seqdata, &f.config)?;
        assert!(matches!(again, RedoDecision::Skip(_)));
        Ok(())
    }

    #[test]
    fn test_plain_sheet_is_kept() -> Result<()> {
        let f = fixture();
        let link = f.run.join("SampleSheet.csv");
        fs::remove_file(&link).unwrap();
        fs::rename(f.run.join("SampleSheet.csv.0"), &link).unwrap();
        let sheet = f.sheets.join("2016/7/revised_BHCVH2BBXX.csv");
        fs::write(&sheet, revised()).unwrap();

        match consider(&sheet, &f.seqdata, &f.config)? {
            RedoDecision::Planted { lanes, installed, .. } => {
                assert_eq!(lanes, vec![2].into_iter().collect());
                assert_eq!(installed, f.run.join("SampleSheet.csv.1"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(fs::read_to_string(f.run.join("SampleSheet.csv.0")).unwrap(), HISEQ_SHEET);
        assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("SampleSheet.csv.1"));
        assert_eq!(fs::read_to_string(&link).unwrap(), revised());
        Ok(())
    }

    #[test]
    fn test_failed_run_redoes_everything() -> Result<()> {
        let f = fixture();
        fs::write(f.run.join("pipeline/failed"), "").unwrap();
        let sheet = f.sheets.join("2016/7/revised_HCVH2BBXX.csv");
        fs::write(&sheet, revised()).unwrap();

        match consider(&sheet, &f.seqdata, &f.config)? {
            RedoDecision::Planted { lanes, .. } => assert_eq!(lanes.len(), 8),
            other => panic!("unexpected {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_skips() -> Result<()> {
        let f = fixture();

        // identical content
        let same = f.sheets.join("2016/7/same_BHCVH2BBXX.csv");
        fs::write(&same, HISEQ_SHEET).unwrap();
        assert!(matches!(consider(&same, &f.seqdata, &f.config)?, RedoDecision::Skip(_)));

        // older than the active sheet
        let old = f.sheets.join("2016/7/old_BHCVH2BBXX.csv");
        fs::write(&old, revised()).unwrap();
        age(&old, 7200);
        assert!(matches!(consider(&old, &f.seqdata, &f.config)?, RedoDecision::Skip(_)));

        // manual override
        let newer = f.sheets.join("2016/7/new_BHCVH2BBXX.csv");
        fs::write(&newer, revised()).unwrap();
        fs::write(f.run.join("pipeline/SampleSheet.csv.OVERRIDE"), HISEQ_SHEET).unwrap();
        assert!(matches!(consider(&newer, &f.seqdata, &f.config)?, RedoDecision::Skip(_)));
        fs::remove_file(f.run.join("pipeline/SampleSheet.csv.OVERRIDE")).unwrap();

        // run still in progress
        fs::remove_file(f.run.join("pipeline/qc.done")).unwrap();
        fs::write(f.run.join("pipeline/qc.started"), "").unwrap();
        assert!(matches!(consider(&newer, &f.seqdata, &f.config)?, RedoDecision::Skip(_)));

        assert!(!f.run.join("pipeline/lane2.redo").exists());
        assert!(!f.run.join("SampleSheet.csv.1").exists());
        Ok(())
    }

    #[test]
    fn test_scan_window() -> Result<()> {
        let f = fixture();
        let stale = f.sheets.join("2016/7/stale_BHCVH2BBXX.csv");
        fs::write(&stale, revised()).unwrap();
        age(&stale, 48 * 3600);
        let unmatched = f.sheets.join("2016/7/bar_YXXXX.csv");
        fs::write(&unmatched, HISEQ_SHEET).unwrap();

        let report = scan(&f.config, SystemTime::now())?;
        assert!(report.errors.is_empty());
        assert_eq!(report.decisions.len(), 1);
        assert_eq!(report.decisions[0].0, unmatched);
        assert!(matches!(report.decisions[0].1, RedoDecision::Skip(_)));
        Ok(())
    }
}
