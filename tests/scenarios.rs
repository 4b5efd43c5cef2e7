// Copyright (c) 2018 10x Genomics, Inc. All rights reserved.

//! Whole-run scenarios driven through the public API, with a shell
//! script standing in for bcl2fastq.

mod common;

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use illuminatus::autoredo::{self, RedoDecision};
use illuminatus::cleanup::cleanup_lanes;
use illuminatus::demux::{lane_dir, DemuxRequest, DemuxRunner, MISMATCH1_LOG, OPTS_FILE};
use illuminatus::driver::{Action, Collaborators, CommandCollaborators, Driver, Run};
use illuminatus::postprocess::postprocess;
use illuminatus::{PipelineStatus, RunStatus};
use pretty_assertions::assert_eq;

use common::*;

/// Records every call; demultiplexing is either only recorded or run to
/// completion in-process.
struct Inline {
    calls: Vec<String>,
    runner: Option<DemuxRunner>,
}

impl Inline {
    fn recording() -> Inline {
        Inline {
            calls: Vec::new(),
            runner: None,
        }
    }

    fn running(program: &Path) -> Inline {
        Inline {
            calls: Vec::new(),
            runner: Some(DemuxRunner::new(program.to_string_lossy(), 2)),
        }
    }
}

impl Collaborators for Inline {
    fn fetch_samplesheet(&mut self, _run: &Run) -> anyhow::Result<()> {
        self.calls.push("fetch".into());
        Ok(())
    }
    fn open_ticket(&mut self, _run: &Run) -> anyhow::Result<()> {
        self.calls.push("ticket".into());
        Ok(())
    }
    fn launch_read1_qc(&mut self, _run: &Run) -> anyhow::Result<()> {
        self.calls.push("read1qc".into());
        Ok(())
    }
    fn launch_demultiplex(&mut self, run: &Run, lane: u32, sample_sheet: &Path) -> anyhow::Result<()> {
        self.calls.push(format!("demux {}", lane));
        if let Some(runner) = &self.runner {
            runner.run(&DemuxRequest {
                run_dir: run.path.clone(),
                out_dir: run.output_path.clone(),
                lane,
                sample_sheet: sample_sheet.to_path_buf(),
            })?;
        }
        Ok(())
    }
    fn launch_qc(&mut self, _run: &Run) -> anyhow::Result<()> {
        self.calls.push("qc".into());
        Ok(())
    }
    fn upload_report(&mut self, _run: &Run, status: PipelineStatus) -> anyhow::Result<()> {
        self.calls.push(format!("report {}", status));
        Ok(())
    }
}

fn tick<C: Collaborators>(sb: &Sandbox, collab: C) -> (Vec<(PipelineStatus, Action)>, C) {
    let mut driver = Driver::new(&sb.config, collab);
    let report = driver.tick().unwrap();
    assert!(report.errors.is_empty(), "{:?}", report.errors.errors());
    let runs = report.runs.iter().map(|r| (r.status, r.action.clone())).collect();
    (runs, driver.into_collaborators())
}

fn status_of(run: &Path) -> PipelineStatus {
    RunStatus::load(run).unwrap().pipeline_status()
}

/// Renamed output only: no logs, no scratch areas.
fn final_layout(out: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    tree(out, |rel| {
        rel.starts_with("demultiplexing")
            || rel.extension().map_or(false, |e| e == "log")
    })
}

#[test]
fn new_miseq_run() {
    let sb = Sandbox::new();
    let run = sb.add_run(MISEQ_RUN, MISEQ_RUNINFO, None);
    fs::write(sb.sheets().join("160603_000000000-AKGDE.csv"), MISEQ_SHEET).unwrap();

    let collab = CommandCollaborators::new(&sb.config).unwrap();
    let (runs, _) = tick(&sb, collab);
    assert_eq!(runs, vec![(PipelineStatus::New, Action::Setup)]);

    assert!(run.join("pipeline").is_dir());
    let start_times = fs::read_to_string(run.join("pipeline/start_times")).unwrap();
    assert_eq!(start_times.lines().count(), 1);
    assert_eq!(
        fs::read_link(run.join("SampleSheet.csv")).unwrap(),
        Path::new("SampleSheet.csv.1")
    );
    assert!(run.join("pipeline/run_info.yml").exists());

    let report = RunStatus::load(&run).unwrap().report();
    assert!(report.contains("RunID: 160603_M01270_0196_000000000-AKGDE\n"));
    assert!(report.contains("Flowcell: AKGDE\n"));
    assert!(report.contains("PipelineStatus: reads_unfinished\n"));
    assert!(report.contains("MachineStatus: waiting_for_data\n"));

    // nothing changed outside, so the next tick leaves the disk alone
    let before = mtimes(sb.tmp.path());
    let collab = CommandCollaborators::new(&sb.config).unwrap();
    let (runs, _) = tick(&sb, collab);
    assert_eq!(runs, vec![(PipelineStatus::ReadsUnfinished, Action::Wait)]);
    assert_eq!(mtimes(sb.tmp.path()), before);
}

#[test]
fn hiseq_sequencing_completes() {
    let sb = Sandbox::new();
    let run = sb.add_run(HISEQ_RUN, HISEQ_RUNINFO, Some(ANY_LANE_SHEET));
    tick(&sb, Inline::recording());
    touch(&run.join("pipeline/read1.done"));
    touch(&run.join("RTAComplete.txt"));

    let (runs, collab) = tick(&sb, Inline::recording());
    assert_eq!(
        runs,
        vec![(PipelineStatus::ReadsFinished, Action::Demultiplex((1..=8).collect()))]
    );
    let launched: Vec<String> = (1..=8).map(|l| format!("demux {}", l)).collect();
    assert_eq!(collab.calls, launched);
    for lane in 1..=8 {
        assert!(run.join(format!("pipeline/lane{}.started", lane)).exists());
    }
    assert_eq!(status_of(&run), PipelineStatus::InDemultiplexing);

    // lanes already started are not launched again
    let (runs, collab) = tick(&sb, Inline::recording());
    assert_eq!(runs, vec![(PipelineStatus::InDemultiplexing, Action::Wait)]);
    assert!(collab.calls.is_empty());
}

#[test]
fn barcode_collision_retry() {
    let sb = Sandbox::new();
    let run = sb.add_run(MISEQ_RUN, MISEQ_RUNINFO, Some(MISEQ_SHEET));
    touch(&run.join("pipeline/lane1.started"));
    let body = format!(
        "case \"$*\" in *'--barcode-mismatches 0'*) ;; *) echo 'Barcode collision for barcodes: XXX' >&2 ; exit 1 ;; esac\n{}",
        WRITE_FASTQ
    );
    let program = mock_bcl2fastq(sb.tmp.path(), &body);
    let out = sb.fastqdata().join(MISEQ_RUN);

    let outcome = DemuxRunner::new(program.to_string_lossy(), 2)
        .run(&DemuxRequest {
            run_dir: run.clone(),
            out_dir: out.clone(),
            lane: 1,
            sample_sheet: run.join("SampleSheet.csv"),
        })
        .unwrap();
    assert_eq!(outcome.attempts, 2);

    let lane = lane_dir(&out, 1);
    let opts = fs::read_to_string(lane.join(OPTS_FILE)).unwrap();
    assert!(opts.lines().any(|l| l == "--barcode-mismatches 0"));
    let first = fs::read_to_string(lane.join(MISMATCH1_LOG)).unwrap();
    assert!(first.contains("Barcode collision for barcodes: XXX"));
    assert!(run.join("pipeline/lane1.done").exists());
    assert!(!run.join("pipeline/lane1.started").exists());
}

#[test]
fn umi_read_remap() {
    let sb = Sandbox::new();
    let run = sb.add_run(MISEQ_RUN, MISEQ_RUNINFO, Some(MISEQ_SHEET));
    touch(&run.join("pipeline/lane1.started"));
    let body = format!(
        "{}\necho 'index read' > \"$d/10510GC0017L01_S1_L001_R3_001.fastq.gz\"\n",
        WRITE_FASTQ
    );
    let program = mock_bcl2fastq(sb.tmp.path(), &body);
    let umi_run = "160811_D00261_0355_BC9DA7ANXX.umi";
    let out = sb.fastqdata().join(umi_run);

    DemuxRunner::new(program.to_string_lossy(), 2)
        .run(&DemuxRequest {
            run_dir: run.clone(),
            out_dir: out.clone(),
            lane: 1,
            sample_sheet: run.join("SampleSheet.csv"),
        })
        .unwrap();
    postprocess(&out, None).unwrap();

    let dest = out.join("10510/10510GCpool05");
    let name = |r: &str| dest.join(format!("{}_1_10510GC0017L01_{}.fastq.gz", umi_run, r));
    assert_eq!(fs::read_to_string(name("1")).unwrap(), "library lane 1 read 1\n");
    assert_eq!(fs::read_to_string(name("2")).unwrap(), "index read\n");
    assert_eq!(fs::read_to_string(name("UMI")).unwrap(), "library lane 1 read 2\n");
}

/// Drive a HiSeq run from sequencing complete to `complete`, with
/// demultiplexing run in-process.
fn complete_hiseq_run(sb: &Sandbox) -> PathBuf {
    let run = sb.add_run(HISEQ_RUN, HISEQ_RUNINFO, Some(ANY_LANE_SHEET));
    let program = mock_bcl2fastq(sb.tmp.path(), WRITE_FASTQ);
    tick(sb, Inline::recording());
    touch(&run.join("pipeline/read1.done"));
    touch(&run.join("RTAComplete.txt"));

    let (runs, _) = tick(sb, Inline::running(&program));
    assert_eq!(runs[0].1, Action::Demultiplex((1..=8).collect()));
    assert_eq!(status_of(&run), PipelineStatus::Demultiplexed);

    let (runs, collab) = tick(sb, Inline::recording());
    assert_eq!(runs, vec![(PipelineStatus::Demultiplexed, Action::Qc)]);
    assert_eq!(collab.calls, vec!["qc"]);
    assert_eq!(status_of(&run), PipelineStatus::InQc);

    touch(&run.join("pipeline/qc.done"));
    assert_eq!(status_of(&run), PipelineStatus::Complete);
    run
}

#[test]
fn redo_one_lane_after_completion() {
    let sb = Sandbox::new();
    let run = complete_hiseq_run(&sb);
    let out = sb.fastqdata().join(HISEQ_RUN);
    let lane_file = |lane: u32| {
        out.join(format!(
            "10510/10510GCpool05/{}_{}_10510GC0017L01_1.fastq.gz",
            HISEQ_RUN, lane
        ))
    };
    assert!(lane_file(1).exists());
    let finished = final_layout(&out);

    touch(&run.join("pipeline/lane1.redo"));
    assert_eq!(status_of(&run), PipelineStatus::Redo);

    let (runs, collab) = tick(&sb, Inline::recording());
    assert_eq!(runs, vec![(PipelineStatus::Redo, Action::Redo(vec![1]))]);
    assert_eq!(collab.calls, vec!["demux 1"]);
    assert!(!lane_file(1).exists());
    assert!(lane_file(2).exists());
    assert_eq!(
        fs::read_to_string(out.join("projects_pending.txt")).unwrap(),
        "10510\n"
    );
    let pipeline = run.join("pipeline");
    assert!(!pipeline.join("lane1.done").exists());
    assert!(!pipeline.join("lane1.redo").exists());
    assert!(!pipeline.join("qc.done").exists());
    assert!(pipeline.join("lane1.started").exists());
    assert!(pipeline.join("lane2.done").exists());
    assert_eq!(status_of(&run), PipelineStatus::InDemultiplexing);
    assert_eq!(fs::read_to_string(pipeline.join("start_times")).unwrap().lines().count(), 2);

    // let the relaunched lane finish and the run comes back the same
    let program = sb.tmp.path().join("bcl2fastq");
    DemuxRunner::new(program.to_string_lossy(), 2)
        .run(&DemuxRequest {
            run_dir: run.clone(),
            out_dir: out.clone(),
            lane: 1,
            sample_sheet: lane_dir(&out, 1).join("SampleSheet.filtered.csv"),
        })
        .unwrap();
    let (runs, _) = tick(&sb, Inline::recording());
    assert_eq!(runs, vec![(PipelineStatus::Demultiplexed, Action::Qc)]);
    assert_eq!(final_layout(&out), finished);
}

#[test]
fn demux_postproc_cleanup_round_trip() {
    let sb = Sandbox::new();
    let run = sb.add_run(MISEQ_RUN, MISEQ_RUNINFO, Some(MISEQ_SHEET));
    let program = mock_bcl2fastq(sb.tmp.path(), WRITE_FASTQ);
    let runner = DemuxRunner::new(program.to_string_lossy(), 2);
    let out = sb.fastqdata().join(MISEQ_RUN);
    let req = DemuxRequest {
        run_dir: run.clone(),
        out_dir: out.clone(),
        lane: 1,
        sample_sheet: run.join("SampleSheet.csv"),
    };
    fs::create_dir_all(run.join("pipeline")).unwrap();

    runner.run(&req).unwrap();
    postprocess(&out, None).unwrap();
    let once = final_layout(&out);
    assert!(once.contains_key(Path::new(&format!("{}_1_unassigned_1.fastq.gz", MISEQ_RUN))));

    let lanes: BTreeSet<u32> = [1].into_iter().collect();
    let cleaned = cleanup_lanes(&out, &lanes).unwrap();
    assert_eq!(cleaned.deleted.len(), 4);

    runner.run(&req).unwrap();
    postprocess(&out, None).unwrap();
    assert_eq!(final_layout(&out), once);

    // and cleanup is idempotent
    cleanup_lanes(&out, &lanes).unwrap();
    let again = cleanup_lanes(&out, &lanes).unwrap();
    assert!(again.deleted.is_empty());
}

#[test]
fn autoredo_sheet_for_missing_run() {
    let sb = Sandbox::new();
    complete_hiseq_run(&sb);
    fs::write(sb.sheets().join("bar_YXXXX.csv"), ANY_LANE_SHEET).unwrap();

    let before = mtimes(sb.tmp.path());
    let report = autoredo::scan(&sb.config, SystemTime::now()).unwrap();
    assert!(report.errors.is_empty());
    assert_eq!(report.decisions.len(), 1);
    match &report.decisions[0].1 {
        RedoDecision::Skip(why) => assert!(why.contains("YXXXX"), "{}", why),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(mtimes(sb.tmp.path()), before);
}
