// Copyright (c) 2018 10x Genomics, Inc. All rights reserved.

//! The run-status state machine.
//!
//! A run's `PipelineStatus` is derived purely from its touchfiles, the
//! presence of `RTAComplete.txt` and which read-completion basecall
//! directories exist. Nothing is cached between calls: every driver
//! tick re-derives the state from disk.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Serialize, Serializer};

use crate::error::Result;
use crate::run_info::RunInfo;
use crate::touchfiles::{PipelineDir, TouchSnapshot};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PipelineStatus {
    New,
    ReadsUnfinished,
    ReadsFinished,
    Read1Finished,
    InRead1Qc,
    InRead1QcReadsFinished,
    InDemultiplexing,
    Demultiplexed,
    InQc,
    PartiallyComplete,
    Complete,
    Redo,
    Failed,
    Aborted,
}

impl PipelineStatus {
    pub const ALL: [PipelineStatus; 14] = [
        PipelineStatus::New,
        PipelineStatus::ReadsUnfinished,
        PipelineStatus::ReadsFinished,
        PipelineStatus::Read1Finished,
        PipelineStatus::InRead1Qc,
        PipelineStatus::InRead1QcReadsFinished,
        PipelineStatus::InDemultiplexing,
        PipelineStatus::Demultiplexed,
        PipelineStatus::InQc,
        PipelineStatus::PartiallyComplete,
        PipelineStatus::Complete,
        PipelineStatus::Redo,
        PipelineStatus::Failed,
        PipelineStatus::Aborted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::New => "new",
            PipelineStatus::ReadsUnfinished => "reads_unfinished",
            PipelineStatus::ReadsFinished => "reads_finished",
            PipelineStatus::Read1Finished => "read1_finished",
            PipelineStatus::InRead1Qc => "in_read1_qc",
            PipelineStatus::InRead1QcReadsFinished => "in_read1_qc_reads_finished",
            PipelineStatus::InDemultiplexing => "in_demultiplexing",
            PipelineStatus::Demultiplexed => "demultiplexed",
            PipelineStatus::InQc => "in_qc",
            PipelineStatus::PartiallyComplete => "partially_complete",
            PipelineStatus::Complete => "complete",
            PipelineStatus::Redo => "redo",
            PipelineStatus::Failed => "failed",
            PipelineStatus::Aborted => "aborted",
        }
    }

    /// States from which the pipeline makes no further progress on its
    /// own.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineStatus::PartiallyComplete
                | PipelineStatus::Complete
                | PipelineStatus::Failed
                | PipelineStatus::Aborted
        )
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for PipelineStatus {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

/// What the sequencer itself has produced so far.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MachineStatus {
    WaitingForData,
    ReadComplete(u32),
    Complete,
}

impl fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MachineStatus::WaitingForData => f.write_str("waiting_for_data"),
            MachineStatus::ReadComplete(n) => write!(f, "read{}_complete", n),
            MachineStatus::Complete => f.write_str("complete"),
        }
    }
}

impl Serialize for MachineStatus {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

/// The classifier's inputs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatusInputs {
    pub new_run: bool,
    pub rta_complete: bool,
    pub lane_count: usize,
    pub started_count: usize,
    pub done_count: usize,
    pub redo_count: usize,
    pub read1_started: bool,
    pub read1_done: bool,
    pub qc_started: bool,
    pub qc_done: bool,
    pub aborted: bool,
    pub failed: bool,
    pub any_lane_started: bool,
    /// Whether the completion marker for the first data read exists.
    pub read1_cycle_present: bool,
}

impl StatusInputs {
    pub fn from_snapshot(
        snap: &TouchSnapshot,
        lane_count: u32,
        rta_complete: bool,
        read1_cycle_present: bool,
    ) -> StatusInputs {
        StatusInputs {
            new_run: !snap.pipeline_exists,
            rta_complete,
            lane_count: lane_count as usize,
            started_count: snap.started_lanes.len(),
            done_count: snap.done_lanes.len(),
            redo_count: snap.redo_lanes.len(),
            // a finished step counts as having been started
            read1_started: snap.read1_started || snap.read1_done,
            read1_done: snap.read1_done,
            qc_started: snap.qc_started || snap.qc_done,
            qc_done: snap.qc_done,
            aborted: snap.aborted,
            failed: snap.failed,
            any_lane_started: !snap.started_lanes.is_empty(),
            read1_cycle_present,
        }
    }
}

/// Classify a run. Rules are tried in order and the first match wins.
pub fn classify(tf: &StatusInputs) -> PipelineStatus {
    use PipelineStatus::*;

    let was_ended = tf.qc_done || tf.aborted || tf.failed;
    let was_demultiplexed = tf.done_count > 0 && tf.started_count == 0;
    let was_finished = tf.done_count == tf.lane_count;

    if tf.new_run {
        return New;
    }

    if tf.rta_complete
        && tf.redo_count > 0
        && (was_ended || (tf.read1_done && was_demultiplexed && !tf.qc_started))
    {
        return Redo;
    }

    if tf.aborted {
        return Aborted;
    }

    if tf.failed {
        return if tf.read1_started && !tf.read1_done {
            InRead1Qc
        } else {
            Failed
        };
    }

    if was_ended {
        return if was_finished { Complete } else { PartiallyComplete };
    }

    if tf.qc_started && !tf.qc_done {
        return InQc;
    }

    if tf.read1_cycle_present || tf.rta_complete {
        if !tf.read1_started {
            return Read1Finished;
        } else if !tf.read1_done && tf.rta_complete {
            return if was_finished {
                InRead1Qc
            } else if tf.any_lane_started {
                InDemultiplexing
            } else {
                InRead1QcReadsFinished
            };
        } else if !tf.read1_done {
            return InRead1Qc;
        }
    }

    if was_demultiplexed {
        return Demultiplexed;
    }

    if tf.any_lane_started {
        return InDemultiplexing;
    }

    if tf.rta_complete {
        ReadsFinished
    } else {
        ReadsUnfinished
    }
}

/// `reads_complete[i]` says whether read `i + 1` has finished.
pub fn machine_status(rta_complete: bool, reads_complete: &[bool]) -> MachineStatus {
    if rta_complete {
        return MachineStatus::Complete;
    }
    reads_complete
        .iter()
        .rposition(|&done| done)
        .map_or(MachineStatus::WaitingForData, |i| {
            MachineStatus::ReadComplete(i as u32 + 1)
        })
}

/// Directory whose presence shows that `cycle` has been basecalled.
pub fn cycle_dir(run_dir: &Path, cycle: u32) -> PathBuf {
    run_dir
        .join("Data/Intensities/BaseCalls/L001")
        .join(format!("C{}.1", cycle))
}

fn cycle_present(run_dir: &Path, cycle: u32) -> bool {
    // only a non-empty directory counts; the instrument creates them early
    std::fs::read_dir(cycle_dir(run_dir, cycle))
        .map(|mut d| d.next().is_some())
        .unwrap_or(false)
}

/// A run as seen from disk at one instant.
#[derive(Clone, Debug)]
pub struct RunStatus {
    pub run_dir: PathBuf,
    pub run_info: RunInfo,
    pub touch: TouchSnapshot,
    pub rta_complete: bool,
    /// Indexed by read number - 1.
    pub reads_complete: Vec<bool>,
}

impl RunStatus {
    pub fn load(run_dir: impl AsRef<Path>) -> Result<RunStatus> {
        let run_info = RunInfo::from_run_dir(run_dir.as_ref())?;
        RunStatus::load_with_info(run_dir, run_info)
    }

    pub fn load_with_info(run_dir: impl AsRef<Path>, run_info: RunInfo) -> Result<RunStatus> {
        let run_dir = run_dir.as_ref().to_path_buf();
        let touch = PipelineDir::for_run(&run_dir).snapshot()?;
        let rta_complete = run_dir.join("RTAComplete.txt").exists();

        let reads_complete = run_info
            .reads
            .iter()
            .map(|r| {
                run_info
                    .trigger_cycle(r.number)
                    .map_or(false, |c| cycle_present(&run_dir, c))
            })
            .collect();

        Ok(RunStatus {
            run_dir,
            run_info,
            touch,
            rta_complete,
            reads_complete,
        })
    }

    pub fn inputs(&self) -> StatusInputs {
        let read1 = self.run_info.read1_number() as usize;
        let read1_cycle_present = self
            .reads_complete
            .get(read1.saturating_sub(1))
            .copied()
            .unwrap_or(false);
        StatusInputs::from_snapshot(
            &self.touch,
            self.run_info.lane_count,
            self.rta_complete,
            read1_cycle_present,
        )
    }

    pub fn pipeline_status(&self) -> PipelineStatus {
        classify(&self.inputs())
    }

    pub fn machine_status(&self) -> MachineStatus {
        machine_status(self.rta_complete, &self.reads_complete)
    }

    /// The key/value lines printed by the `status` command.
    pub fn report(&self) -> String {
        format!(
            "RunID: {}\nLaneCount: {}\nInstrument: {}\nFlowcell: {}\nPipelineStatus: {}\nMachineStatus: {}\n",
            self.run_info.run_id,
            self.run_info.lane_count,
            self.run_info.instrument_label(),
            self.run_info.flowcell_short(),
            self.pipeline_status(),
            self.machine_status(),
        )
    }
}

/// Report for a directory whose `RunInfo.xml` cannot be read.
pub fn unknown_report(run_dir: &Path) -> String {
    let name = run_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!(
        "RunID: {}\nLaneCount: 0\nInstrument: unknown\nFlowcell: unknown\nPipelineStatus: unknown\nMachineStatus: unknown\n",
        name
    )
}
