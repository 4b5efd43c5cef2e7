// Copyright (c) 2018 10x Genomics, Inc. All rights reserved.

//! YAML summaries of a run, consumed by the QC report generator.
//!
//! `sample_summary.yml` describes what the sample sheet asks for, lane by
//! lane. `run_info.yml` describes the run itself and where the pipeline
//! has got to. Both are rewritten only when their content changes, so a
//! quiet driver tick leaves them untouched.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::Serialize;

use crate::base_mask::base_mask_for_lane;
use crate::config::PipelineConfig;
use crate::error::{IoContext, PipelineError, Result};
use crate::run_info::RunInfo;
use crate::sample_sheet::SampleSheet;
use crate::status::{MachineStatus, PipelineStatus, RunStatus};
use crate::touchfiles::{PipelineDir, PIPELINE_DIR};
use crate::utils::{read_lines_if_present, write_if_changed};

pub const SAMPLE_SUMMARY: &str = "sample_summary.yml";
pub const RUN_INFO_YAML: &str = "run_info.yml";
pub const START_TIMES: &str = "start_times";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ProjectInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct LaneSummary {
    #[serde(rename = "LaneNumber")]
    pub lane: u32,
    #[serde(rename = "Projects")]
    pub projects: Vec<String>,
    #[serde(rename = "Pools")]
    pub pools: Vec<String>,
    #[serde(rename = "Libraries")]
    pub library_count: usize,
    #[serde(rename = "IndexLengths", default, skip_serializing_if = "Option::is_none")]
    pub index_lengths: Option<Vec<usize>>,
    #[serde(rename = "BaseMask", default, skip_serializing_if = "Option::is_none")]
    pub base_mask: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct SampleSummary {
    #[serde(rename = "ProjectInfo", default)]
    pub project_info: BTreeMap<String, ProjectInfo>,
    #[serde(rename = "Lanes", default)]
    pub lanes: Vec<LaneSummary>,
}

impl SampleSummary {
    /// Projects the sample sheet declared.
    pub fn projects(&self) -> BTreeSet<&str> {
        self.project_info.keys().map(String::as_str).collect()
    }
}

/// Resolve project numbers to full names. A name from `name_list` is used
/// when exactly one entry starts with the project number; otherwise the
/// project is reported as `<number>_UNKNOWN` with no link.
pub fn resolve_project_names<'a>(
    projects: impl IntoIterator<Item = &'a str>,
    name_list: &[String],
    page_url: Option<&str>,
) -> BTreeMap<String, ProjectInfo> {
    projects
        .into_iter()
        .map(|p| {
            let matches: Vec<&String> = name_list.iter().filter(|n| n.starts_with(p)).collect();
            let info = match matches.as_slice() {
                [name] => ProjectInfo {
                    name: name.to_string(),
                    url: page_url.map(|u| format!("{}{}", u, name)),
                },
                _ => ProjectInfo {
                    name: format!("{}_UNKNOWN", p),
                    url: None,
                },
            };
            (p.to_string(), info)
        })
        .collect()
}

/// Summarise the sheet lane by lane. A lane whose index lengths or base
/// mask cannot be worked out is still listed, without those fields.
pub fn sample_summary(run_info: &RunInfo, sheet: &SampleSheet, config: &PipelineConfig) -> SampleSummary {
    let projects = sheet.projects();
    let project_info = resolve_project_names(
        projects.iter().map(String::as_str),
        &config.project_name_list,
        config.project_page_url.as_deref(),
    );

    let lanes = (1..=run_info.lane_count)
        .map(|lane| {
            let entries: Vec<_> = sheet.entries_for_lane(lane).collect();
            let projects: BTreeSet<String> = entries.iter().map(|e| e.project.clone()).collect();
            let pools: BTreeSet<String> = entries.iter().map(|e| e.pool().to_string()).collect();
            LaneSummary {
                lane,
                projects: projects.into_iter().collect(),
                pools: pools.into_iter().collect(),
                library_count: entries.len(),
                index_lengths: sheet.index_lengths(lane).ok(),
                base_mask: base_mask_for_lane(run_info, sheet, lane).ok(),
            }
        })
        .collect();

    SampleSummary { project_info, lanes }
}

pub fn read_sample_summary(path: impl AsRef<Path>) -> Result<Option<SampleSummary>> {
    let path = path.as_ref();
    let text = match fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(PipelineError::io(path, e)),
    };
    serde_yaml::from_str(&text)
        .map(Some)
        .map_err(|e| PipelineError::config(format!("malformed {}: {}", path.display(), e)))
}

/// Serialize `value` to `path`, leaving the file alone if it already
/// holds the same YAML.
pub fn write_yaml_if_changed<T: Serialize>(path: impl AsRef<Path>, value: &T) -> Result<bool> {
    let text = serde_yaml::to_string(value)
        .map_err(|e| PipelineError::config(format!("cannot serialize summary: {}", e)))?;
    write_if_changed(path, text.as_bytes())
}

/// What bcl2fastq recorded for one lane.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct LaneDemux {
    #[serde(rename = "Lane")]
    pub lane: u32,
    #[serde(rename = "Version", skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(rename = "Options")]
    pub options: Vec<String>,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct RunReport {
    #[serde(rename = "RunID")]
    pub run_id: String,
    #[serde(rename = "LaneCount")]
    pub lane_count: u32,
    #[serde(rename = "Instrument")]
    pub instrument: String,
    #[serde(rename = "Flowcell")]
    pub flowcell: String,
    #[serde(rename = "Cycles")]
    pub cycles: String,
    #[serde(rename = "PipelineStatus")]
    pub pipeline_status: PipelineStatus,
    #[serde(rename = "MachineStatus")]
    pub machine_status: MachineStatus,
    #[serde(rename = "ExperimentName", skip_serializing_if = "Option::is_none")]
    pub experiment_name: Option<String>,
    #[serde(rename = "StartTime", skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(rename = "Chemistry", skip_serializing_if = "Option::is_none")]
    pub chemistry: Option<String>,
    #[serde(rename = "PipelineStart", skip_serializing_if = "Option::is_none")]
    pub pipeline_start: Option<String>,
    #[serde(rename = "Demultiplexing", skip_serializing_if = "Vec::is_empty")]
    pub demultiplexing: Vec<LaneDemux>,
}

impl RunReport {
    /// `output_dir` is the run's FASTQ output, if it has one yet.
    pub fn gather(status: &RunStatus, output_dir: Option<&Path>) -> Result<RunReport> {
        let ri = &status.run_info;
        let start_times =
            read_lines_if_present(status.run_dir.join(PIPELINE_DIR).join(START_TIMES))?;

        let mut demultiplexing = Vec::new();
        if let Some(out) = output_dir {
            for lane in 1..=ri.lane_count {
                let dir = out.join("demultiplexing").join(format!("lane{}", lane));
                let options = read_lines_if_present(dir.join("bcl2fastq.opts"))?;
                let version = read_lines_if_present(dir.join("bcl2fastq.version"))?
                    .into_iter()
                    .find(|l| !l.trim().is_empty());
                if version.is_some() || !options.is_empty() {
                    demultiplexing.push(LaneDemux {
                        lane,
                        version,
                        options,
                    });
                }
            }
        }

        Ok(RunReport {
            run_id: ri.run_id.clone(),
            lane_count: ri.lane_count,
            instrument: ri.instrument_label(),
            flowcell: ri.flowcell_short().to_string(),
            cycles: ri.cycles_summary(),
            pipeline_status: status.pipeline_status(),
            machine_status: status.machine_status(),
            experiment_name: ri.experiment_name.clone(),
            start_time: ri.run_start_time.clone(),
            chemistry: ri.chemistry.clone(),
            pipeline_start: start_times.into_iter().next(),
            demultiplexing,
        })
    }
}

/// Append `<version>@<ctime>` to `pipeline/start_times`.
pub fn record_start_time(pipeline: &PipelineDir) -> Result<String> {
    let stamp = format!(
        "{}@{}",
        env!("CARGO_PKG_VERSION"),
        Local::now().format("%a %b %e %H:%M:%S %Y")
    );
    let path = pipeline.path().join(START_TIMES);
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .at(&path)?;
    writeln!(f, "{}", stamp).at(&path)?;
    Ok(stamp)
}

/// Write both summaries into the run's `pipeline/` directory. The sample
/// summary needs an active sample sheet; without one only `run_info.yml`
/// is written.
pub fn summarize(run_dir: &Path, config: &PipelineConfig) -> Result<Vec<PathBuf>> {
    let status = RunStatus::load(run_dir)?;
    let pipeline = PipelineDir::for_run(run_dir);
    if !pipeline.exists() {
        return Err(PipelineError::StateInconsistent(format!(
            "{} has no {} directory",
            run_dir.display(),
            PIPELINE_DIR
        )));
    }

    let mut written = Vec::new();
    let sheet_path = run_dir.join("SampleSheet.csv");
    if sheet_path.exists() {
        let sheet = SampleSheet::from_path(&sheet_path)?;
        let summary = sample_summary(&status.run_info, &sheet, config);
        let path = pipeline.path().join(SAMPLE_SUMMARY);
        if write_yaml_if_changed(&path, &summary)? {
            written.push(path);
        }
    } else {
        warn!("{} has no SampleSheet.csv", run_dir.display());
    }

    let output = pipeline.path().join("output");
    let output = if output.is_dir() { Some(output) } else { None };
    let report = RunReport::gather(&status, output.as_deref())?;
    let path = pipeline.path().join(RUN_INFO_YAML);
    if write_yaml_if_changed(&path, &report)? {
        written.push(path);
    }
    Ok(written)
}
