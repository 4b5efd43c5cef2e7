// Copyright (c) 2018 10x Genomics, Inc. All rights reserved.

//! Pipeline configuration, read once from the environment at startup and
//! passed down to every action.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::{IoContext, PipelineError, Result};

pub const DEFAULT_RUN_NAME_REGEX: &str = ".*_.*_.*_[^.]*";
pub const DEFAULT_REDO_HOURS: f64 = 24.0;
/// Longer look-back windows than this (about ten years) are refused.
pub const MAX_REDO_HOURS: f64 = 87_600.0;
pub const DEFAULT_PROCESSING_THREADS: usize = 10;
pub const DEFAULT_LOCK_STALE_SECONDS: u64 = 6 * 60 * 60;

lazy_static! {
    static ref DEFAULT_RUN_NAME: Regex = anchored(DEFAULT_RUN_NAME_REGEX).unwrap();
}

/// External commands the driver launches for the collaborators it does
/// not implement itself. Each is run through `sh -c` with `RUN_ID`,
/// `RUN_PATH` and `OUTPUT_PATH` in its environment.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HookCommands {
    pub read1_qc: Option<String>,
    pub qc: Option<String>,
    pub report: Option<String>,
    pub ticket: Option<String>,
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub seqdata: Option<PathBuf>,
    pub fastqdata: Option<PathBuf>,
    pub run_name_regex: Regex,
    pub redo_hours: f64,
    pub project_page_url: Option<String>,
    pub project_name_list: Vec<String>,
    /// Directory holding externally deposited sample sheets.
    pub samplesheets_root: Option<PathBuf>,
    pub rt_settings: Option<String>,
    pub rt_system: Option<String>,
    pub report_link: Option<String>,
    pub bcl2fastq: String,
    pub processing_threads: usize,
    pub lock_stale_after: Duration,
    pub hooks: HookCommands,
    pub verbose: bool,
    pub debug: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            seqdata: None,
            fastqdata: None,
            run_name_regex: DEFAULT_RUN_NAME.clone(),
            redo_hours: DEFAULT_REDO_HOURS,
            project_page_url: None,
            project_name_list: Vec::new(),
            samplesheets_root: None,
            rt_settings: None,
            rt_system: None,
            report_link: None,
            bcl2fastq: "bcl2fastq".to_string(),
            processing_threads: DEFAULT_PROCESSING_THREADS,
            lock_stale_after: Duration::from_secs(DEFAULT_LOCK_STALE_SECONDS),
            hooks: HookCommands::default(),
            verbose: false,
            debug: false,
        }
    }
}

fn anchored(pattern: &str) -> std::result::Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{})$", pattern))
}

fn truthy(v: &str) -> bool {
    !matches!(v.trim(), "" | "0" | "false" | "no")
}

impl PipelineConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<PipelineConfig> {
        PipelineConfig::from_vars(|k| std::env::var(k).ok())
    }

    /// Build a configuration from an arbitrary variable lookup.
    pub fn from_vars<F>(get: F) -> Result<PipelineConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |k: &str| get(k).filter(|v| !v.is_empty());
        let mut cfg = PipelineConfig::default();

        cfg.seqdata = get("SEQDATA_LOCATION").map(PathBuf::from);
        cfg.fastqdata = get("FASTQ_LOCATION").map(PathBuf::from);

        if let Some(pattern) = get("RUN_NAME_REGEX") {
            cfg.run_name_regex = anchored(&pattern).map_err(|e| {
                PipelineError::config(format!("RUN_NAME_REGEX {:?}: {}", pattern, e))
            })?;
        }

        if let Some(hours) = get("REDO_HOURS_TO_LOOK_BACK") {
            let h: f64 = hours.trim().parse().map_err(|_| {
                PipelineError::config(format!("REDO_HOURS_TO_LOOK_BACK={:?} is not a number", hours))
            })?;
            if !(0.0..=MAX_REDO_HOURS).contains(&h) {
                return Err(PipelineError::config(format!(
                    "REDO_HOURS_TO_LOOK_BACK={:?} is outside 0..={}",
                    hours, MAX_REDO_HOURS
                )));
            }
            cfg.redo_hours = h;
        }

        cfg.project_page_url = get("PROJECT_PAGE_URL");
        cfg.project_name_list = get("PROJECT_NAME_LIST")
            .map(|l| {
                l.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        cfg.rt_settings = get("RT_SETTINGS");
        cfg.rt_system = get("RT_SYSTEM");
        cfg.report_link = get("REPORT_LINK");

        if let Some(conf) = get("GENOLOGICSRC") {
            cfg.samplesheets_root = samplesheets_root_from_conf(Path::new(&conf))?;
        }

        if let Some(b) = get("BCL2FASTQ") {
            cfg.bcl2fastq = b;
        }
        if let Some(t) = get("PROCESSING_THREADS") {
            cfg.processing_threads = t.trim().parse().map_err(|_| {
                PipelineError::config(format!("PROCESSING_THREADS={:?} is not a number", t))
            })?;
        }
        if let Some(s) = get("LOCK_STALE_SECONDS") {
            let secs: u64 = s.trim().parse().map_err(|_| {
                PipelineError::config(format!("LOCK_STALE_SECONDS={:?} is not a number", s))
            })?;
            cfg.lock_stale_after = Duration::from_secs(secs);
        }

        cfg.hooks = HookCommands {
            read1_qc: get("READ1QC_COMMAND"),
            qc: get("QC_COMMAND"),
            report: get("REPORT_COMMAND"),
            ticket: get("RT_COMMAND"),
        };

        cfg.verbose = get("VERBOSE").map_or(false, |v| truthy(&v));
        cfg.debug = get("DEBUG").map_or(false, |v| truthy(&v));

        Ok(cfg)
    }

    pub fn seqdata(&self) -> Result<&Path> {
        self.seqdata
            .as_deref()
            .ok_or_else(|| PipelineError::config("SEQDATA_LOCATION is not set"))
    }

    pub fn fastqdata(&self) -> Result<&Path> {
        self.fastqdata
            .as_deref()
            .ok_or_else(|| PipelineError::config("FASTQ_LOCATION is not set"))
    }

    pub fn samplesheets_root(&self) -> Result<&Path> {
        self.samplesheets_root.as_deref().ok_or_else(|| {
            PipelineError::config("no sample sheet location; set GENOLOGICSRC with SAMPLESHEETS_ROOT or FS_ROOT")
        })
    }

    pub fn redo_window(&self) -> Duration {
        Duration::try_from_secs_f64((self.redo_hours * 3600.0).max(0.0)).unwrap_or(Duration::MAX)
    }

    /// Whether a directory name is one the driver should consider a run.
    pub fn is_run_name(&self, name: &str) -> bool {
        self.run_name_regex.is_match(name)
    }
}

/// Pull the sample sheet share out of a genologics-style `KEY=VALUE`
/// file. `SAMPLESHEETS_ROOT` wins; otherwise `FS_ROOT` is used with the
/// conventional subdirectory appended.
pub fn samplesheets_root_from_conf(conf: &Path) -> Result<Option<PathBuf>> {
    let text = fs::read_to_string(conf).at(conf)?;

    let mut ss_root = None;
    let mut fs_root = None;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('[') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            let v = v.trim();
            match k.trim() {
                "SAMPLESHEETS_ROOT" => ss_root = Some(PathBuf::from(v)),
                "FS_ROOT" => fs_root = Some(PathBuf::from(v)),
                _ => (),
            }
        }
    }

    Ok(ss_root.or_else(|| fs_root.map(|r| r.join("samplesheets_bcl2fastq_format"))))
}
