// Copyright (c) 2018 10x Genomics, Inc. All rights reserved.

//! One tick of the main loop: find runs, classify each one, and take at
//! most one action per run.

use std::cell::OnceCell;
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{bail, Context};

use crate::base_mask::base_mask_for_lane;
use crate::cleanup::cleanup_lanes;
use crate::config::PipelineConfig;
use crate::demux;
use crate::error::{ErrorCollector, IoContext, PipelineError, Result};
use crate::postprocess::postprocess;
use crate::report::{record_start_time, summarize};
use crate::run_info::RunInfo;
use crate::sample_sheet::{validate_project_name, SampleSheet};
use crate::samplesheet_fetch::{self, active_sheet, ACTIVE_SHEET};
use crate::status::{PipelineStatus, RunStatus};
use crate::touchfiles::{PipelineDir, TouchFile};
use crate::utils::{write_if_changed, ActionLog};

pub const DRIVER_LOG: &str = "driver.log";
pub const FILTERED_SHEET: &str = "SampleSheet.filtered.csv";

/// Directories under `seqdata` whose names look like run IDs, sorted.
pub fn discover_runs(seqdata: &Path, config: &PipelineConfig) -> Result<Vec<PathBuf>> {
    let mut runs = Vec::new();
    for entry in fs::read_dir(seqdata).at(seqdata)? {
        let entry = entry.at(seqdata)?;
        let path = entry.path();
        let name = entry.file_name();
        let name = match name.to_str() {
            Some(n) => n,
            None => continue,
        };
        if path.is_dir() && config.is_run_name(name) {
            runs.push(path);
        }
    }
    runs.sort();
    Ok(runs)
}

/// A run directory paired with its output location. `RunInfo.xml` is
/// parsed on first use.
#[derive(Debug)]
pub struct Run {
    pub id: String,
    pub path: PathBuf,
    pub output_path: PathBuf,
    info: OnceCell<RunInfo>,
}

impl Run {
    pub fn new(path: impl Into<PathBuf>, fastqdata: &Path) -> Run {
        let path = path.into();
        let id = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Run {
            output_path: fastqdata.join(&id),
            id,
            path,
            info: OnceCell::new(),
        }
    }

    pub fn info(&self) -> Result<&RunInfo> {
        if let Some(info) = self.info.get() {
            return Ok(info);
        }
        let info = RunInfo::from_run_dir(&self.path)?;
        Ok(self.info.get_or_init(|| info))
    }

    pub fn pipeline(&self) -> PipelineDir {
        PipelineDir::for_run(&self.path)
    }
}

/// The outside world as seen by the driver. Launches return as soon as
/// the job is started; completion is signalled through touchfiles.
pub trait Collaborators {
    fn fetch_samplesheet(&mut self, run: &Run) -> anyhow::Result<()>;
    fn open_ticket(&mut self, run: &Run) -> anyhow::Result<()>;
    fn launch_read1_qc(&mut self, run: &Run) -> anyhow::Result<()>;
    fn launch_demultiplex(&mut self, run: &Run, lane: u32, sample_sheet: &Path) -> anyhow::Result<()>;
    fn launch_qc(&mut self, run: &Run) -> anyhow::Result<()>;
    fn upload_report(&mut self, run: &Run, status: PipelineStatus) -> anyhow::Result<()>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    /// Created `pipeline/` and the output directory.
    Setup,
    /// Nothing to do until something external changes.
    Wait,
    Read1Qc,
    Demultiplex(Vec<u32>),
    Qc,
    Redo(Vec<u32>),
    Report,
    /// Another driver is working on the run.
    Locked,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: PipelineStatus,
    pub action: Action,
}

#[derive(Debug, Default)]
pub struct TickReport {
    pub runs: Vec<RunOutcome>,
    pub errors: ErrorCollector,
}

pub struct Driver<'a, C: Collaborators> {
    config: &'a PipelineConfig,
    collab: C,
}

impl<'a, C: Collaborators> Driver<'a, C> {
    pub fn new(config: &'a PipelineConfig, collab: C) -> Driver<'a, C> {
        Driver { config, collab }
    }

    pub fn collaborators(&self) -> &C {
        &self.collab
    }

    pub fn into_collaborators(self) -> C {
        self.collab
    }

    /// Visit every run once. A failure on one run is recorded in the
    /// report and does not stop the others.
    pub fn tick(&mut self) -> Result<TickReport> {
        let config = self.config;
        let seqdata = config.seqdata()?;
        let fastqdata = config.fastqdata()?;
        let mut report = TickReport::default();

        for path in discover_runs(seqdata, config)? {
            if !path.join("RunInfo.xml").exists() {
                debug!("{} has no RunInfo.xml yet", path.display());
                continue;
            }
            let run = Run::new(path, fastqdata);
            match self.process_run(&run, &mut report.errors) {
                Ok(outcome) => report.runs.push(outcome),
                Err(e) => report.errors.push(&run.id, format!("{:#}", e)),
            }
        }
        Ok(report)
    }

    pub fn process_run(&mut self, run: &Run, errors: &mut ErrorCollector) -> anyhow::Result<RunOutcome> {
        let info = run.info().with_context(|| format!("reading run info for {}", run.id))?;
        let status = RunStatus::load_with_info(&run.path, info.clone())?;
        let state = status.pipeline_status();
        debug!("{}: {} ({})", run.id, state, status.machine_status());

        let outcome = |action| RunOutcome {
            run_id: run.id.clone(),
            status: state,
            action,
        };

        let pipeline = run.pipeline();
        if state == PipelineStatus::New {
            if !pipeline.create()? {
                return Ok(outcome(Action::Locked));
            }
            let _lock = match pipeline.try_lock(self.config.lock_stale_after)? {
                Some(l) => l,
                None => return Ok(outcome(Action::Locked)),
            };
            self.setup(run, &pipeline, errors)?;
            return Ok(outcome(Action::Setup));
        }

        if state.is_terminal() {
            self.collab.upload_report(run, state)?;
            return Ok(outcome(Action::Report));
        }
        if !mutates(state) {
            return Ok(outcome(Action::Wait));
        }

        let _lock = match pipeline.try_lock(self.config.lock_stale_after)? {
            Some(l) => l,
            None => {
                info!("{} is locked by another driver", run.id);
                return Ok(outcome(Action::Locked));
            }
        };
        // the state may have moved on while we waited for the lock
        let status = RunStatus::load_with_info(&run.path, info.clone())?;
        if status.pipeline_status() != state {
            return Ok(outcome(Action::Locked));
        }

        let mut log = ActionLog::open(pipeline.path().join(DRIVER_LOG))?;
        let action = match state {
            PipelineStatus::Read1Finished => {
                log.line(format!("{}: starting read1 QC", run.id))?;
                pipeline.touch(TouchFile::Read1Started)?;
                self.collab.launch_read1_qc(run)?;
                Action::Read1Qc
            }
            PipelineStatus::ReadsFinished | PipelineStatus::InRead1QcReadsFinished => {
                let lanes: BTreeSet<u32> = (1..=info.lane_count)
                    .filter(|l| !status.touch.started_lanes.contains(l))
                    .filter(|l| !status.touch.done_lanes.contains(l))
                    .collect();
                let prepared = self.prepare_lanes(run, info, &lanes)?;
                log.line(format!("{}: demultiplexing lanes {}", run.id, join_lanes(&lanes)))?;
                self.launch_lanes(run, &pipeline, prepared)?;
                Action::Demultiplex(lanes.into_iter().collect())
            }
            PipelineStatus::Demultiplexed => {
                let renamed = postprocess(&run.output_path, Some(&run.id))?;
                log.line(format!(
                    "{}: renamed {} file(s); starting QC",
                    run.id,
                    renamed.renamed.len()
                ))?;
                pipeline.touch(TouchFile::QcStarted)?;
                self.collab.launch_qc(run)?;
                Action::Qc
            }
            PipelineStatus::Redo => {
                // lanes in flight when the run stopped lose their started
                // marker below, so they are relaunched with the redo lanes
                let lanes: BTreeSet<u32> = (1..=info.lane_count)
                    .filter(|l| !status.touch.done_lanes.contains(l))
                    .chain(status.touch.redo_lanes.iter().copied())
                    .collect();
                self.redo(run, info, &status, &pipeline, &mut log, &lanes)?;
                Action::Redo(lanes.into_iter().collect())
            }
            other => bail!("no action for {} in state {}", run.id, other),
        };
        Ok(outcome(action))
    }

    fn setup(&mut self, run: &Run, pipeline: &PipelineDir, errors: &mut ErrorCollector) -> Result<()> {
        let mut log = ActionLog::open(pipeline.path().join(DRIVER_LOG))?;
        log.line(format!("{}: new run", run.id))?;

        fs::create_dir_all(&run.output_path).at(&run.output_path)?;
        ensure_link(&pipeline.path().join("output"), &run.output_path)?;
        ensure_link(&run.output_path.join("seqdata"), &run.path)?;

        if let Err(e) = self.collab.fetch_samplesheet(run) {
            errors.push(format!("{}: sample sheet fetch", run.id), format!("{:#}", e));
        }
        let stamp = record_start_time(pipeline)?;
        log.line(format!("{}: started {}", run.id, stamp))?;

        if let Err(e) = self.collab.open_ticket(run) {
            errors.push(format!("{}: ticket", run.id), format!("{:#}", e));
        }
        if let Err(e) = self.collab.upload_report(run, PipelineStatus::New) {
            errors.push(format!("{}: report", run.id), format!("{:#}", e));
        }
        Ok(())
    }

    /// Build the per-lane sheets. Every lane is checked before anything
    /// is written so a bad sheet leaves no touchfiles behind.
    fn prepare_lanes(&self, run: &Run, info: &RunInfo, lanes: &BTreeSet<u32>) -> Result<Vec<(u32, String)>> {
        let sheet_path = run.path.join(ACTIVE_SHEET);
        if !sheet_path.exists() {
            return Err(PipelineError::StateInconsistent(format!(
                "{} has no {}",
                run.id, ACTIVE_SHEET
            )));
        }
        let sheet = SampleSheet::from_path(&sheet_path)?;
        let options = sheet.bcl2fastq_options();

        let mut prepared = Vec::new();
        for &lane in lanes {
            for entry in sheet.entries_for_lane(lane) {
                validate_project_name(&entry.project)?;
            }
            base_mask_for_lane(info, &sheet, lane)?;
            let description = format!("{} lane {}", run.id, lane);
            prepared.push((lane, sheet.lane_fragment(lane, &description, &options)?));
        }
        Ok(prepared)
    }

    fn launch_lanes(&mut self, run: &Run, pipeline: &PipelineDir, prepared: Vec<(u32, String)>) -> anyhow::Result<()> {
        for (lane, fragment) in prepared {
            let dir = demux::lane_dir(&run.output_path, lane);
            fs::create_dir_all(&dir).at(&dir)?;
            let sheet = dir.join(FILTERED_SHEET);
            write_if_changed(&sheet, fragment.as_bytes())?;

            pipeline.touch_exclusive(TouchFile::LaneStarted(lane))?;
            if let Err(e) = self.collab.launch_demultiplex(run, lane, &sheet) {
                // nothing is running, so the lane must not look started
                pipeline.remove(TouchFile::LaneStarted(lane))?;
                return Err(e.context(format!("launching demultiplexing of lane {}", lane)));
            }
        }
        Ok(())
    }

    fn redo(
        &mut self,
        run: &Run,
        info: &RunInfo,
        status: &RunStatus,
        pipeline: &PipelineDir,
        log: &mut ActionLog,
        lanes: &BTreeSet<u32>,
    ) -> anyhow::Result<()> {
        let prepared = self.prepare_lanes(run, info, lanes)?;

        let stamp = record_start_time(pipeline)?;
        log.line(format!("{}: redo of lanes {} at {}", run.id, join_lanes(lanes), stamp))?;
        if let Some(sheet) = active_sheet(&run.path) {
            log.line(format!("{}: active sample sheet {}", run.id, sheet.display()))?;
        }

        if run.output_path.is_dir() {
            let cleaned = cleanup_lanes(&run.output_path, lanes)?;
            log.line(format!(
                "{}: cleanup removed {} file(s) for projects {:?}",
                run.id,
                cleaned.deleted.len(),
                cleaned.projects
            ))?;
        }

        for tf in [TouchFile::Failed, TouchFile::QcStarted, TouchFile::QcDone] {
            pipeline.remove(tf)?;
        }
        for &lane in &status.touch.started_lanes {
            pipeline.remove(TouchFile::LaneStarted(lane))?;
        }
        for &lane in lanes {
            pipeline.remove(TouchFile::LaneDone(lane))?;
            pipeline.remove(TouchFile::LaneRedo(lane))?;
        }

        self.launch_lanes(run, pipeline, prepared)
    }
}

/// States whose action changes the run's touchfiles.
fn mutates(state: PipelineStatus) -> bool {
    matches!(
        state,
        PipelineStatus::Read1Finished
            | PipelineStatus::ReadsFinished
            | PipelineStatus::InRead1QcReadsFinished
            | PipelineStatus::Demultiplexed
            | PipelineStatus::Redo
    )
}

fn join_lanes(lanes: &BTreeSet<u32>) -> String {
    itertools::join(lanes, ",")
}

fn ensure_link(link: &Path, target: &Path) -> Result<()> {
    if link.symlink_metadata().is_ok() {
        return Ok(());
    }
    symlink(target, link).at(link)
}

/// Collaborators backed by this executable and the configured hook
/// commands. Jobs are started detached and never waited on.
pub struct CommandCollaborators<'a> {
    config: &'a PipelineConfig,
    exe: PathBuf,
}

impl<'a> CommandCollaborators<'a> {
    pub fn new(config: &'a PipelineConfig) -> anyhow::Result<CommandCollaborators<'a>> {
        let exe = std::env::current_exe().context("locating own executable")?;
        Ok(CommandCollaborators { config, exe })
    }

    fn hook(&self, run: &Run, cmd: &str) -> Command {
        let mut c = Command::new("sh");
        c.arg("-c")
            .arg(cmd)
            .env("RUN_ID", &run.id)
            .env("RUN_PATH", &run.path)
            .env("OUTPUT_PATH", &run.output_path)
            .stdin(Stdio::null());
        c
    }

    fn job_log(&self, run: &Run, name: &str) -> anyhow::Result<(File, File)> {
        let path = run.pipeline().path().join(name);
        let f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        let g = f.try_clone()?;
        Ok((f, g))
    }

    /// Start a background hook, or mark the step done at once if no
    /// command is configured for it.
    fn launch_hook(&self, run: &Run, cmd: Option<&str>, log_name: &str, done: TouchFile) -> anyhow::Result<()> {
        match cmd {
            Some(cmd) => {
                let (out, err) = self.job_log(run, log_name)?;
                self.hook(run, cmd)
                    .stdout(out)
                    .stderr(err)
                    .spawn()
                    .with_context(|| format!("starting {:?}", cmd))?;
                info!("{}: started {:?}", run.id, cmd);
            }
            None => {
                info!("{}: no command configured, marking {} directly", run.id, done);
                run.pipeline().touch(done)?;
            }
        }
        Ok(())
    }

    /// Run a short hook to completion.
    fn run_hook(&self, run: &Run, cmd: &str, status: Option<PipelineStatus>) -> anyhow::Result<()> {
        let mut c = self.hook(run, cmd);
        if let Some(s) = status {
            c.env("PIPELINE_STATUS", s.as_str());
        }
        let st = c.status().with_context(|| format!("running {:?}", cmd))?;
        if !st.success() {
            bail!(PipelineError::ExternalTool {
                tool: cmd.to_string(),
                code: st.code(),
                message: format!("hook failed for {}", run.id),
            });
        }
        Ok(())
    }
}

impl<'a> Collaborators for CommandCollaborators<'a> {
    fn fetch_samplesheet(&mut self, run: &Run) -> anyhow::Result<()> {
        let info = run.info()?;
        let outcome = samplesheet_fetch::fetch(
            &run.path,
            self.config.samplesheets_root.as_deref(),
            &info.flowcell,
        )?;
        debug!("{}: sample sheet fetch {:?}", run.id, outcome);
        Ok(())
    }

    fn open_ticket(&mut self, run: &Run) -> anyhow::Result<()> {
        match self.config.hooks.ticket.as_deref() {
            Some(cmd) => self.run_hook(run, cmd, None),
            None => Ok(()),
        }
    }

    fn launch_read1_qc(&mut self, run: &Run) -> anyhow::Result<()> {
        self.launch_hook(run, self.config.hooks.read1_qc.as_deref(), "read1_qc.log", TouchFile::Read1Done)
    }

    fn launch_demultiplex(&mut self, run: &Run, lane: u32, sample_sheet: &Path) -> anyhow::Result<()> {
        let (out, err) = self.job_log(run, &format!("demux_lane{}.log", lane))?;
        Command::new(&self.exe)
            .arg("demux")
            .arg(&run.path)
            .arg(&run.output_path)
            .arg(lane.to_string())
            .arg(sample_sheet)
            .stdin(Stdio::null())
            .stdout(out)
            .stderr(err)
            .spawn()
            .with_context(|| format!("starting demultiplexing of {} lane {}", run.id, lane))?;
        Ok(())
    }

    fn launch_qc(&mut self, run: &Run) -> anyhow::Result<()> {
        self.launch_hook(run, self.config.hooks.qc.as_deref(), "qc.log", TouchFile::QcDone)
    }

    /// Refresh the summaries, and hand them to the report hook only when
    /// they changed.
    fn upload_report(&mut self, run: &Run, status: PipelineStatus) -> anyhow::Result<()> {
        let written = summarize(&run.path, self.config)?;
        if written.is_empty() {
            return Ok(());
        }
        match self.config.hooks.report.as_deref() {
            Some(cmd) => self.run_hook(run, cmd, Some(status)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::run_info::test::{HISEQ4000_RUNINFO, MISEQ_RUNINFO};
    use crate::status::cycle_dir;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    const MISEQ_RUN: &str = "160603_M01270_0196_000000000-AKGDE";
    const HISEQ_RUN: &str = "160726_K00166_0120_BHCVH2BBXX";

    const ALL_LANES_SHEET: &str = "[Header]
Description,test

[Data]
Sample_ID,Sample_Name,index,Sample_Project
10510GCpool05__10510GC0017L01,10510GC0017L01,ACGTACGT,10510
";

    #[derive(Default)]
    struct Recorder {
        calls: Vec<String>,
        fail_demux: bool,
    }

    impl Collaborators for Recorder {
        fn fetch_samplesheet(&mut self, run: &Run) -> anyhow::Result<()> {
            self.calls.push(format!("fetch {}", run.id));
            Ok(())
        }
        fn open_ticket(&mut self, run: &Run) -> anyhow::Result<()> {
            self.calls.push(format!("ticket {}", run.id));
            anyhow::bail!("ticket system down")
        }
        fn launch_read1_qc(&mut self, run: &Run) -> anyhow::Result<()> {
            self.calls.push(format!("read1qc {}", run.id));
            Ok(())
        }
        fn launch_demultiplex(&mut self, run: &Run, lane: u32, sample_sheet: &Path) -> anyhow::Result<()> {
            assert!(sample_sheet.exists());
            self.calls.push(format!("demux {} {}", run.id, lane));
            if self.fail_demux {
                anyhow::bail!("no slots");
            }
            Ok(())
        }
        fn launch_qc(&mut self, run: &Run) -> anyhow::Result<()> {
            self.calls.push(format!("qc {}", run.id));
            Ok(())
        }
        fn upload_report(&mut self, run: &Run, status: PipelineStatus) -> anyhow::Result<()> {
            self.calls.push(format!("report {} {}", run.id, status));
            Ok(())
        }
    }

    struct Sandbox {
        _tmp: TempDir,
        config: PipelineConfig,
    }

    impl Sandbox {
        fn new() -> Sandbox {
            let tmp = TempDir::new().unwrap();
            let seqdata = tmp.path().join("seqdata");
            let fastqdata = tmp.path().join("fastqdata");
            fs::create_dir_all(&seqdata).unwrap();
            fs::create_dir_all(&fastqdata).unwrap();
            let config = PipelineConfig {
                seqdata: Some(seqdata),
                fastqdata: Some(fastqdata),
                ..PipelineConfig::default()
            };
            Sandbox { _tmp: tmp, config }
        }

        fn add_run(&self, name: &str, runinfo: &str) -> PathBuf {
            let run = self.config.seqdata.as_ref().unwrap().join(name);
            fs::create_dir_all(&run).unwrap();
            fs::write(run.join("RunInfo.xml"), runinfo).unwrap();
            fs::write(run.join("SampleSheet.csv"), ALL_LANES_SHEET).unwrap();
            run
        }

        fn tick(&self, rec: Recorder) -> (TickReport, Recorder) {
            let mut driver = Driver::new(&self.config, rec);
            let report = driver.tick().unwrap();
            (report, driver.into_collaborators())
        }
    }

    #[test]
    fn test_discover_runs() {
        let sb = Sandbox::new();
        sb.add_run(HISEQ_RUN, HISEQ4000_RUNINFO);
        sb.add_run(MISEQ_RUN, MISEQ_RUNINFO);
        let seqdata = sb.config.seqdata.clone().unwrap();
        fs::create_dir(seqdata.join("not_a_run")).unwrap();
        fs::create_dir(seqdata.join("1_2_3_4.bak")).unwrap();

        let runs = discover_runs(&seqdata, &sb.config).unwrap();
        let names: Vec<String> = runs
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![MISEQ_RUN, HISEQ_RUN]);
    }

    #[test]
    fn test_new_run_setup() {
        let sb = Sandbox::new();
        let run = sb.add_run(MISEQ_RUN, MISEQ_RUNINFO);

        let (report, rec) = sb.tick(Recorder::default());
        assert_eq!(report.runs[0].status, PipelineStatus::New);
        assert_eq!(report.runs[0].action, Action::Setup);
        // ticket failure is collected, the rest still happens
        assert_eq!(report.errors.len(), 1);
        assert_eq!(
            rec.calls,
            vec![
                format!("fetch {}", MISEQ_RUN),
                format!("ticket {}", MISEQ_RUN),
                format!("report {} new", MISEQ_RUN),
            ]
        );

        let pipeline = run.join("pipeline");
        assert!(pipeline.join("start_times").exists());
        assert!(!pipeline.join("driver.lock").exists());
        let out = sb.config.fastqdata.as_ref().unwrap().join(MISEQ_RUN);
        assert_eq!(fs::read_link(pipeline.join("output")).unwrap(), out);
        assert_eq!(fs::read_link(out.join("seqdata")).unwrap(), run);

        let status = RunStatus::load(&run).unwrap();
        assert_eq!(status.pipeline_status(), PipelineStatus::ReadsUnfinished);
    }

    #[test]
    fn test_read1_then_lanes() {
        let sb = Sandbox::new();
        let run = sb.add_run(HISEQ_RUN, HISEQ4000_RUNINFO);
        sb.tick(Recorder::default());

        fs::create_dir_all(cycle_dir(&run, 152)).unwrap();
        fs::write(cycle_dir(&run, 152).join("s_1_1101.bcl.gz"), "").unwrap();
        let (report, rec) = sb.tick(Recorder::default());
        assert_eq!(report.runs[0].action, Action::Read1Qc);
        assert_eq!(rec.calls, vec![format!("read1qc {}", HISEQ_RUN)]);
        assert!(run.join("pipeline/read1.started").exists());

        fs::write(run.join("RTAComplete.txt"), "").unwrap();
        let (report, rec) = sb.tick(Recorder::default());
        assert_eq!(report.runs[0].status, PipelineStatus::InRead1QcReadsFinished);
        assert_eq!(report.runs[0].action, Action::Demultiplex((1..=8).collect()));
        assert_eq!(rec.calls.len(), 8);
        for lane in 1..=8 {
            assert!(run.join(format!("pipeline/lane{}.started", lane)).exists());
            let frag = sb
                .config
                .fastqdata
                .as_ref()
                .unwrap()
                .join(HISEQ_RUN)
                .join(format!("demultiplexing/lane{}/{}", lane, FILTERED_SHEET));
            assert!(fs::read_to_string(frag).unwrap().contains("[Data]"));
        }

        let status = RunStatus::load(&run).unwrap();
        assert_eq!(status.pipeline_status(), PipelineStatus::InDemultiplexing);
    }

    #[test]
    fn test_second_tick_is_quiet() {
        let sb = Sandbox::new();
        let run = sb.add_run(MISEQ_RUN, MISEQ_RUNINFO);
        sb.tick(Recorder::default());
        let before = fs::read_to_string(run.join("pipeline/driver.log")).unwrap();

        let (report, rec) = sb.tick(Recorder::default());
        assert_eq!(report.runs[0].action, Action::Wait);
        assert!(rec.calls.is_empty());
        assert_eq!(fs::read_to_string(run.join("pipeline/driver.log")).unwrap(), before);
    }

    #[test]
    fn test_bad_sheet_touches_nothing() {
        let sb = Sandbox::new();
        let run = sb.add_run(MISEQ_RUN, MISEQ_RUNINFO);
        sb.tick(Recorder::default());
        fs::write(run.join("RTAComplete.txt"), "").unwrap();
        fs::write(run.join("pipeline/read1.done"), "").unwrap();
        fs::write(
            run.join("SampleSheet.csv"),
            "[Data]\nSample_ID,Sample_Name,index,Sample_Project\nx,x,ACGT,bad.project\n",
        )
        .unwrap();

        let (report, rec) = sb.tick(Recorder::default());
        assert_eq!(report.errors.len(), 1);
        assert!(rec.calls.is_empty());
        assert!(!run.join("pipeline/lane1.started").exists());
        assert!(!run.join("pipeline/driver.lock").exists());
    }

    #[test]
    fn test_failed_launch_clears_started() {
        let sb = Sandbox::new();
        let run = sb.add_run(MISEQ_RUN, MISEQ_RUNINFO);
        sb.tick(Recorder::default());
        fs::write(run.join("RTAComplete.txt"), "").unwrap();
        fs::write(run.join("pipeline/read1.done"), "").unwrap();

        let rec = Recorder {
            fail_demux: true,
            ..Recorder::default()
        };
        let (report, _) = sb.tick(rec);
        assert_eq!(report.errors.len(), 1);
        assert!(!run.join("pipeline/lane1.started").exists());
    }

    #[test]
    fn test_locked_run_is_skipped() {
        let sb = Sandbox::new();
        let run = sb.add_run(MISEQ_RUN, MISEQ_RUNINFO);
        sb.tick(Recorder::default());
        fs::write(run.join("RTAComplete.txt"), "").unwrap();
        fs::write(run.join("pipeline/read1.done"), "").unwrap();
        fs::write(run.join("pipeline/driver.lock"), format!("{}\n", std::process::id())).unwrap();

        let (report, rec) = sb.tick(Recorder::default());
        assert_eq!(report.runs[0].action, Action::Locked);
        assert!(rec.calls.is_empty());
        assert!(!run.join("pipeline/lane1.started").exists());
    }

    #[test]
    fn test_redo_relaunches_interrupted_lanes() {
        let sb = Sandbox::new();
        let run = sb.add_run(HISEQ_RUN, HISEQ4000_RUNINFO);
        sb.tick(Recorder::default());
        fs::write(run.join("RTAComplete.txt"), "").unwrap();
        let pipeline = run.join("pipeline");
        fs::write(pipeline.join("read1.done"), "").unwrap();
        for lane in 1..=7 {
            fs::write(pipeline.join(format!("lane{}.done", lane)), "").unwrap();
        }
        fs::write(pipeline.join("lane8.started"), "").unwrap();
        fs::write(pipeline.join("failed"), "").unwrap();
        fs::write(pipeline.join("lane2.redo"), "").unwrap();
        assert_eq!(RunStatus::load(&run).unwrap().pipeline_status(), PipelineStatus::Redo);

        let (report, rec) = sb.tick(Recorder::default());
        assert_eq!(report.runs[0].action, Action::Redo(vec![2, 8]));
        assert_eq!(
            rec.calls,
            vec![format!("demux {} 2", HISEQ_RUN), format!("demux {} 8", HISEQ_RUN)]
        );
        assert!(!pipeline.join("failed").exists());
        assert!(!pipeline.join("lane2.done").exists());
        assert!(pipeline.join("lane2.started").exists());
        assert!(pipeline.join("lane8.started").exists());
        assert!(pipeline.join("lane7.done").exists());

        // the run only counts as demultiplexed once both lanes finish
        fs::remove_file(pipeline.join("lane2.started")).unwrap();
        fs::write(pipeline.join("lane2.done"), "").unwrap();
        assert_eq!(
            RunStatus::load(&run).unwrap().pipeline_status(),
            PipelineStatus::InDemultiplexing
        );
    }

    #[test]
    fn test_terminal_runs_report() {
        let sb = Sandbox::new();
        let run = sb.add_run(MISEQ_RUN, MISEQ_RUNINFO);
        sb.tick(Recorder::default());
        fs::write(run.join("RTAComplete.txt"), "").unwrap();
        fs::write(run.join("pipeline/aborted"), "").unwrap();

        let (report, rec) = sb.tick(Recorder::default());
        assert_eq!(report.runs[0].action, Action::Report);
        assert_eq!(rec.calls, vec![format!("report {} aborted", MISEQ_RUN)]);
    }

    #[test]
    fn test_unset_locations() {
        let config = PipelineConfig::default();
        let mut driver = Driver::new(&config, Recorder::default());
        assert!(driver.tick().is_err());
    }
}
