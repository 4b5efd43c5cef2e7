// Copyright (c) 2018 10x Genomics, Inc. All rights reserved.

//! Drive Illumina runs from basecalls to per-project FASTQ.
//!
//! Run state lives entirely on disk as touchfiles in each run's
//! `pipeline/` directory. Every command re-derives the state it needs
//! from there, so any step can be re-run after a crash.

#[macro_use]
extern crate serde_derive;

#[macro_use]
extern crate log;

pub mod error;
pub mod config;
pub mod utils;

pub mod run_info;
pub mod sample_sheet;
pub mod base_mask;
pub mod filenames;

pub mod touchfiles;
pub mod status;

pub mod demux;
pub mod postprocess;
pub mod cleanup;
pub mod samplesheet_fetch;
pub mod autoredo;
pub mod report;
pub mod fq_count;

pub mod driver;

use std::io::Write;

use chrono::Local;
use log::LevelFilter;

pub use crate::config::PipelineConfig;
pub use crate::error::{ErrorKind, PipelineError, Result};
pub use crate::status::{MachineStatus, PipelineStatus, RunStatus};

/// Set up the process logger. `RUST_LOG`, when set, takes precedence
/// over the levels implied by `verbose` and `debug`.
pub fn init_logging(verbose: bool, debug: bool) {
    let level = if debug {
        LevelFilter::Trace
    } else if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let mut builder = env_logger::Builder::new();
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] - {}",
                Local::now().format("%Y-%m-%dT%H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .filter(None, level);
    if let Ok(spec) = std::env::var("RUST_LOG") {
        builder.parse_filters(&spec);
    }
    // a second call (e.g. from tests) keeps the first logger
    let _ = builder.try_init();
}
