// Copyright (c) 2018 10x Genomics, Inc. All rights reserved.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::SystemTime;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use serde_derive::Serialize;

use illuminatus::autoredo;
use illuminatus::cleanup::cleanup_lanes;
use illuminatus::demux::{DemuxRequest, DemuxRunner};
use illuminatus::driver::{CommandCollaborators, Driver};
use illuminatus::fq_count::{count_fastq, FastqCounts};
use illuminatus::postprocess::postprocess;
use illuminatus::report::summarize;
use illuminatus::run_info::RunInfo;
use illuminatus::samplesheet_fetch;
use illuminatus::status::{unknown_report, RunStatus};
use illuminatus::{init_logging, PipelineConfig};

/// Illumina run processing: demultiplexing, renaming and bookkeeping.
#[derive(Debug, Parser)]
#[command(version)]
struct Cli {
    /// Log at debug level.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Run one tick of the main loop over SEQDATA_LOCATION.
    Driver,
    /// Print the state of a run.
    Status { run_dir: PathBuf },
    /// Demultiplex one lane with bcl2fastq.
    Demux {
        run_dir: PathBuf,
        out_dir: PathBuf,
        lane: u32,
        sample_sheet: PathBuf,
    },
    /// Rename demultiplexed FASTQ into the project layout.
    Postproc {
        out_dir: PathBuf,
        /// Defaults to the name of the output directory.
        #[arg(long)]
        run_id: Option<String>,
    },
    /// Delete the output of the given lanes.
    Cleanup {
        out_dir: PathBuf,
        #[arg(required = true)]
        lanes: Vec<u32>,
    },
    /// Plant redo markers for runs whose sample sheet was replaced.
    Autoredo,
    /// Install the newest sample sheet for a run.
    SamplesheetFetch { run_dir: PathBuf },
    /// Write the run and sample summaries into pipeline/.
    Summarize { run_dir: PathBuf },
    /// Count reads and bases in FASTQ files.
    FqCount {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

#[derive(Serialize)]
struct NamedCounts<'a> {
    filename: String,
    #[serde(flatten)]
    counts: &'a FastqCounts,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = PipelineConfig::from_env();
    match &config {
        Ok(c) => init_logging(cli.verbose || c.verbose, c.debug),
        Err(_) => init_logging(cli.verbose, false),
    }

    match run(cli.cmd, config) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn need(config: &illuminatus::Result<PipelineConfig>) -> Result<&PipelineConfig> {
    config
        .as_ref()
        .map_err(|e| anyhow::anyhow!("reading configuration: {}", e))
}

fn run(cmd: Cmd, config: illuminatus::Result<PipelineConfig>) -> Result<ExitCode> {
    match cmd {
        Cmd::Driver => {
            let config = need(&config)?;
            let collab = CommandCollaborators::new(config)?;
            let mut driver = Driver::new(config, collab);
            let report = driver.tick()?;
            for r in &report.runs {
                info!("{}: {} -> {:?}", r.run_id, r.status, r.action);
            }
            report.errors.into_result("driver tick")?;
        }
        Cmd::Status { run_dir } => match RunStatus::load(&run_dir) {
            Ok(status) => print!("{}", status.report()),
            Err(e) => {
                print!("{}", unknown_report(&run_dir));
                warn!("{}", e);
                return Ok(ExitCode::FAILURE);
            }
        },
        Cmd::Demux {
            run_dir,
            out_dir,
            lane,
            sample_sheet,
        } => {
            let runner = DemuxRunner::from_config(need(&config)?);
            let outcome = runner.run(&DemuxRequest {
                run_dir,
                out_dir,
                lane,
                sample_sheet,
            })?;
            info!(
                "lane {} done with {} after {} attempt(s)",
                lane, outcome.version, outcome.attempts
            );
        }
        Cmd::Postproc { out_dir, run_id } => {
            let report = postprocess(&out_dir, run_id.as_deref())?;
            info!(
                "renamed {} file(s); ready: {}",
                report.renamed.len(),
                report.ready.join(" ")
            );
        }
        Cmd::Cleanup { out_dir, lanes } => {
            let lanes: BTreeSet<u32> = lanes.into_iter().collect();
            let report = cleanup_lanes(&out_dir, &lanes)?;
            info!(
                "deleted {} file(s) for projects {:?}",
                report.deleted.len(),
                report.projects
            );
        }
        Cmd::Autoredo => {
            let report = autoredo::scan(need(&config)?, SystemTime::now())?;
            info!("considered {} sample sheet(s)", report.decisions.len());
            report.errors.into_result("auto-redo")?;
        }
        Cmd::SamplesheetFetch { run_dir } => {
            let config = need(&config)?;
            let info = RunInfo::from_run_dir(&run_dir)?;
            let outcome = samplesheet_fetch::fetch(
                &run_dir,
                config.samplesheets_root.as_deref(),
                &info.flowcell,
            )?;
            info!("{}: {:?}", run_dir.display(), outcome);
        }
        Cmd::Summarize { run_dir } => {
            for path in summarize(&run_dir, need(&config)?)? {
                info!("wrote {}", path.display());
            }
        }
        Cmd::FqCount { files } => {
            for f in files {
                let counts = count_fastq(&f)?;
                let named = NamedCounts {
                    filename: f
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    counts: &counts,
                };
                let yaml = serde_yaml::to_string(&named)
                    .with_context(|| format!("formatting counts for {}", f.display()))?;
                print!("---\n{}", yaml);
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}
