// Copyright (c) 2018 10x Genomics, Inc. All rights reserved.

//! Run bcl2fastq on one lane.
//!
//! Output goes to `<out>/demultiplexing/lane<N>/`. Alongside the FASTQ
//! the lane directory gets `bcl2fastq.version`, `bcl2fastq.log` and, on
//! success only, `bcl2fastq.opts` listing the options that produced it.
//! A run that fails on a barcode collision is retried once with
//! `--barcode-mismatches 0`.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

use crate::base_mask::base_mask_for_lane;
use crate::config::PipelineConfig;
use crate::error::{IoContext, PipelineError, Result};
use crate::run_info::RunInfo;
use crate::sample_sheet::{parse_option_lines, SampleSheet};
use crate::touchfiles::{PipelineDir, TouchFile};
use crate::utils::{remove_if_present, write_synced};

pub const VERSION_FILE: &str = "bcl2fastq.version";
pub const OPTS_FILE: &str = "bcl2fastq.opts";
pub const LOG_FILE: &str = "bcl2fastq.log";
pub const MISMATCH1_LOG: &str = "bcl2fastq_mismatch1.log";

const MISMATCHES: &str = "--barcode-mismatches";
const COLLISION_MARKER: &str = "Barcode collision";

/// Where bcl2fastq output for `lane` lives under a run's output dir.
pub fn lane_dir(out_dir: &Path, lane: u32) -> PathBuf {
    out_dir.join("demultiplexing").join(format!("lane{}", lane))
}

/// Ordered bcl2fastq options. Setting an option that is already present
/// replaces its value in place; new options go on the end.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BclOptions(Vec<(String, String)>);

impl BclOptions {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, key: &str, value: &str) {
        match self.0.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value.to_string(),
            None => self.0.push((key.to_string(), value.to_string())),
        }
    }

    /// Apply one source of overrides. `--barcode-mismatches-lane<N>`
    /// sets the mismatch count for this lane only; per-lane settings for
    /// other lanes are dropped.
    pub fn apply(&mut self, overrides: &[(String, String)], lane: u32) {
        let lane_key = format!("{}-lane{}", MISMATCHES, lane);
        let mut lane_value = None;
        for (k, v) in overrides {
            if *k == lane_key {
                lane_value = Some(v.as_str());
            } else if !k.starts_with(&format!("{}-", MISMATCHES)) {
                self.set(k, v);
            }
        }
        if let Some(v) = lane_value {
            self.set(MISMATCHES, v);
        }
    }

    /// Command-line arguments. `--tiles` takes its value after `=`.
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for (k, v) in &self.0 {
            if k == "--tiles" {
                args.push(format!("{}={}", k, v));
            } else {
                args.push(k.clone());
                if !v.is_empty() {
                    args.push(v.clone());
                }
            }
        }
        args
    }

    /// One option per line, sorted, values quoted for the shell.
    pub fn opts_lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .0
            .iter()
            .map(|(k, v)| {
                if k == "--tiles" {
                    format!("{}={}", k, v)
                } else if v.is_empty() {
                    k.clone()
                } else {
                    format!("{} {}", k, shell_quote(v))
                }
            })
            .collect();
        lines.sort();
        lines
    }
}

fn shell_quote(v: &str) -> String {
    let plain = v
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "_-./=".contains(c));
    if plain {
        v.to_string()
    } else {
        format!("'{}'", v.replace('\'', r"'\''"))
    }
}

/// `[bcl2fastq]` section of an ini file. A missing file gives nothing.
pub fn read_ini_section(path: &Path, section: &str) -> Result<Vec<(String, String)>> {
    let text = match fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(PipelineError::io(path, e)),
    };
    let header = format!("[{}]", section);
    let lines = text
        .lines()
        .skip_while(|l| l.trim() != header)
        .skip(1)
        .take_while(|l| !l.trim_start().starts_with('['));
    Ok(parse_option_lines(lines))
}

/// Options for one lane. Defaults come first, then the sheet's own
/// `[bcl2fastq]` section, then `pipeline_settings.ini` and
/// `pipeline_settings-lane<N>.ini` from the run directory.
pub fn lane_options(run_dir: &Path, run_info: &RunInfo, sheet: &SampleSheet, lane: u32) -> Result<BclOptions> {
    let mut opts = BclOptions::default();
    opts.set("--fastq-compression-level", "6");
    // a [Settings] section carries its own masking rules
    if !sheet.has_settings() {
        let mask = base_mask_for_lane(run_info, sheet, lane)?;
        opts.set("--use-bases-mask", &format!("{}:{}", lane, mask));
    }
    opts.set("--tiles", &format!("s_[{}]", lane));
    opts.set(MISMATCHES, "1");

    opts.apply(&sheet.bcl2fastq_options(), lane);
    for ini in [
        run_dir.join("pipeline_settings.ini"),
        run_dir.join(format!("pipeline_settings-lane{}.ini", lane)),
    ] {
        opts.apply(&read_ini_section(&ini, "bcl2fastq")?, lane);
    }
    Ok(opts)
}

#[derive(Clone, Debug)]
pub struct DemuxRequest {
    pub run_dir: PathBuf,
    pub out_dir: PathBuf,
    pub lane: u32,
    pub sample_sheet: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DemuxOutcome {
    pub lane_dir: PathBuf,
    pub version: String,
    pub options: BclOptions,
    pub attempts: u32,
}

#[derive(Clone, Debug)]
pub struct DemuxRunner {
    pub program: String,
    pub threads: usize,
}

impl DemuxRunner {
    pub fn new(program: impl Into<String>, threads: usize) -> DemuxRunner {
        DemuxRunner {
            program: program.into(),
            threads,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> DemuxRunner {
        DemuxRunner::new(config.bcl2fastq.clone(), config.processing_threads)
    }

    fn tool_error(&self, code: Option<i32>, message: impl Into<String>) -> PipelineError {
        PipelineError::ExternalTool {
            tool: self.program.clone(),
            code,
            message: message.into(),
        }
    }

    fn spawn_error(&self, e: std::io::Error) -> PipelineError {
        self.tool_error(None, format!("cannot run: {}", e))
    }

    /// Ask the program for its version and record the answer in the lane
    /// directory. bcl2fastq prints it on stderr, so both streams are kept.
    pub fn probe_version(&self, lane_dir: &Path) -> Result<String> {
        let output = Command::new(&self.program)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .map_err(|e| self.spawn_error(e))?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        if !output.status.success() {
            return Err(self.tool_error(output.status.code(), "version probe failed"));
        }
        fs::write(lane_dir.join(VERSION_FILE), &text).at(lane_dir.join(VERSION_FILE))?;
        Ok(text.trim().to_string())
    }

    fn invoke(&self, req: &DemuxRequest, lane_dir: &Path, opts: &BclOptions) -> Result<ExitStatus> {
        let log_path = lane_dir.join(LOG_FILE);
        let log = File::create(&log_path).at(&log_path)?;
        let log_err = log.try_clone().at(&log_path)?;

        let mut cmd = Command::new(&self.program);
        cmd.arg("-R")
            .arg(&req.run_dir)
            .arg("-o")
            .arg(lane_dir)
            .arg("--sample-sheet")
            .arg(&req.sample_sheet)
            .arg("-p")
            .arg(self.threads.to_string())
            .args(opts.args())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));

        info!("lane {}: {} {}", req.lane, self.program, opts.args().join(" "));
        cmd.status().map_err(|e| self.spawn_error(e))
    }

    /// Demultiplex one lane, then mark it done in the run's `pipeline/`
    /// directory. On failure `lane<N>.started` is left in place.
    pub fn run(&self, req: &DemuxRequest) -> Result<DemuxOutcome> {
        let lane_dir = lane_dir(&req.out_dir, req.lane);
        fs::create_dir_all(&lane_dir).at(&lane_dir)?;
        let version = self.probe_version(&lane_dir)?;

        let run_info = RunInfo::from_run_dir(&req.run_dir)?;
        let sheet = SampleSheet::from_path(&req.sample_sheet)?;
        let mut opts = lane_options(&req.run_dir, &run_info, &sheet, req.lane)?;

        remove_if_present(lane_dir.join(OPTS_FILE))?;
        remove_if_present(lane_dir.join(MISMATCH1_LOG))?;

        let mut attempts = 1;
        let mut status = self.invoke(req, &lane_dir, &opts)?;

        if !status.success() {
            let log_path = lane_dir.join(LOG_FILE);
            let log_text = fs::read_to_string(&log_path).at(&log_path)?;
            let collided = log_text.contains(COLLISION_MARKER);

            if collided && opts.get(MISMATCHES) != Some("0") {
                warn!(
                    "lane {}: barcode collision, retrying with {} 0",
                    req.lane, MISMATCHES
                );
                let archived = lane_dir.join(MISMATCH1_LOG);
                fs::rename(&log_path, &archived).at(&archived)?;
                opts.set(MISMATCHES, "0");
                attempts += 1;
                status = self.invoke(req, &lane_dir, &opts)?;
            }
        }

        if !status.success() {
            let message = format!(
                "demultiplexing lane {} failed after {} attempt(s); see {}",
                req.lane,
                attempts,
                lane_dir.join(LOG_FILE).display()
            );
            error!("{}", message);
            return Err(self.tool_error(status.code(), message));
        }

        let mut text = opts.opts_lines().join("\n");
        text.push('\n');
        write_synced(lane_dir.join(OPTS_FILE), text.as_bytes())?;

        let pipeline = PipelineDir::for_run(&req.run_dir);
        pipeline.touch(TouchFile::LaneDone(req.lane))?;
        pipeline.remove(TouchFile::LaneStarted(req.lane))?;
        info!("lane {} demultiplexed", req.lane);

        Ok(DemuxOutcome {
            lane_dir,
            version,
            options: opts,
            attempts,
        })
    }
}
