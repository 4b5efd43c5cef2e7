// Copyright (c) 2018 10x Genomics, Inc. All rights reserved.

//! Deserializes `RunInfo.xml` (and, when present, `runParameters.xml`)
//! into a `RunInfo` record describing the reads, lanes and tiles of a run.

use std::fmt;
use std::fs;
use std::path::Path;

use std::time::SystemTime;

use chrono::{DateTime, Local};
use serde::{de, Deserialize};
use serde_xml_rs::from_reader;

use crate::error::{IoContext, PipelineError, Result};

#[derive(Debug, Deserialize)]
struct RunInfoXml {
    #[serde(rename = "Run")]
    run: RunXml,
}

#[derive(Debug, Deserialize)]
struct RunXml {
    #[serde(rename = "Id", default)]
    id: String,
    #[serde(rename = "Flowcell", default)]
    flowcell: String,
    #[serde(rename = "Instrument", default)]
    instrument: String,
    #[serde(rename = "Date", default)]
    date: String,
    #[serde(rename = "Reads")]
    reads: ReadsXml,
    #[serde(rename = "FlowcellLayout")]
    flowcell_layout: FlowcellLayoutXml,
}

#[derive(Debug, Deserialize)]
struct ReadsXml {
    #[serde(rename = "Read", default)]
    read: Vec<ReadXml>,
}

#[derive(Debug, Deserialize)]
struct ReadXml {
    #[serde(rename = "Number")]
    number: u32,
    #[serde(rename = "NumCycles")]
    num_cycles: u32,
    #[serde(rename = "IsIndexedRead", deserialize_with = "bool_from_string")]
    is_indexed_read: bool,
}

/// The few `runParameters.xml` fields we report. HiSeq nests them under
/// `Setup`, NovaSeq under `RfidsInfo`, MiSeq and NextSeq keep them at the
/// top level.
#[derive(Debug, Default, Deserialize)]
struct RunParametersXml {
    #[serde(rename = "ExperimentName", default)]
    experiment_name: Option<String>,
    #[serde(rename = "FlowCellMode", default)]
    flowcell_mode: Option<String>,
    #[serde(rename = "SbsConsumableVersion", default)]
    sbs_version: Option<String>,
    #[serde(rename = "Setup", default)]
    setup: Option<Box<RunParametersXml>>,
    #[serde(rename = "RfidsInfo", default)]
    rfids: Option<Box<RunParametersXml>>,
}

impl RunParametersXml {
    /// First non-empty value of `field`, looking at the top level first.
    fn find(&self, field: fn(&RunParametersXml) -> &Option<String>) -> Option<String> {
        let nested = [self.setup.as_deref(), self.rfids.as_deref()];
        std::iter::once(Some(self))
            .chain(nested)
            .flatten()
            .filter_map(|p| field(p).as_deref())
            .map(str::trim)
            .find(|v| !v.is_empty())
            .map(str::to_string)
    }
}

fn bool_from_string<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: de::Deserializer<'de>,
{
    match String::deserialize(deserializer)?.as_ref() {
        "Y" | "y" => Ok(true),
        "N" | "n" => Ok(false),
        other => Err(de::Error::invalid_value(
            de::Unexpected::Str(other),
            &"Y or N",
        )),
    }
}

#[derive(Debug, Deserialize)]
struct FlowcellLayoutXml {
    #[serde(rename = "LaneCount")]
    lane_count: u32,
    #[serde(rename = "TileSet", default)]
    tile_set: Option<TileSetXml>,
}

#[derive(Debug, Deserialize)]
struct TileSetXml {
    #[serde(rename = "Tiles", default)]
    tiles: Option<TilesXml>,
}

#[derive(Debug, Deserialize)]
struct TilesXml {
    #[serde(rename = "Tile", default)]
    tile: Vec<String>,
}

/// Sequencer model, inferred from the first letter of the instrument id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Instrument {
    MiSeq,
    HiSeq2500,
    HiSeqX,
    HiSeq4000,
    NovaSeq,
    NextSeq,
    Unknown,
}

impl Instrument {
    pub fn from_code(code: &str) -> Instrument {
        match code.chars().next() {
            Some('M') => Instrument::MiSeq,
            Some('D') => Instrument::HiSeq2500,
            Some('E') => Instrument::HiSeqX,
            Some('K') => Instrument::HiSeq4000,
            Some('A') => Instrument::NovaSeq,
            Some('N') => Instrument::NextSeq,
            _ => Instrument::Unknown,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Instrument::MiSeq => "miseq",
            Instrument::HiSeq2500 => "hiseq2500",
            Instrument::HiSeqX => "hiseqX",
            Instrument::HiSeq4000 => "hiseq4000",
            Instrument::NovaSeq => "novaseq",
            Instrument::NextSeq => "nextseq",
            Instrument::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One read segment of the run, in sequencing order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadInfo {
    pub number: u32,
    pub cycles: u32,
    pub is_index: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunInfo {
    pub run_id: String,
    pub instrument_code: String,
    pub instrument: Instrument,
    /// Flowcell id as written in the XML (e.g. `000000000-AKGDE`).
    pub flowcell: String,
    pub run_date: String,
    pub lane_count: u32,
    pub reads: Vec<ReadInfo>,
    /// `"<lane>_<tile>"` entries; empty for runs that do not list tiles.
    pub tiles: Vec<String>,
    pub experiment_name: Option<String>,
    pub run_start_time: Option<String>,
    pub chemistry: Option<String>,
}

impl RunInfo {
    /// Load `RunInfo.xml` from a run directory, plus `runParameters.xml`
    /// or `RunParameters.xml` if either exists.
    pub fn from_run_dir(run_dir: impl AsRef<Path>) -> Result<RunInfo> {
        let run_dir = run_dir.as_ref();
        let xml_path = run_dir.join("RunInfo.xml");
        let xml = fs::read_to_string(&xml_path).at(&xml_path)?;
        let mut info = RunInfo::from_xml(&xml).map_err(|e| match e {
            PipelineError::Config(m) => {
                PipelineError::Config(format!("{}: {}", xml_path.display(), m))
            }
            other => other,
        })?;

        for name in &["runParameters.xml", "RunParameters.xml"] {
            let p = run_dir.join(name);
            if p.is_file() {
                let params = fs::read_to_string(&p).at(&p)?;
                if let Err(e) = info.apply_run_parameters(&params) {
                    warn!("{}: {}", p.display(), e);
                }
                info.run_start_time = Some(run_start_time(&p)?);
                break;
            }
        }
        Ok(info)
    }

    /// Parse the text of a `RunInfo.xml` file.
    pub fn from_xml(xml: &str) -> Result<RunInfo> {
        let raw: RunInfoXml = from_reader(xml.as_bytes())
            .map_err(|e| PipelineError::config(format!("malformed RunInfo: {}", e)))?;
        let run = raw.run;

        let mut reads: Vec<ReadInfo> = run
            .reads
            .read
            .into_iter()
            .map(|r| ReadInfo {
                number: r.number,
                cycles: r.num_cycles,
                is_index: r.is_indexed_read,
            })
            .collect();
        reads.sort_by_key(|r| r.number);

        let tiles = run
            .flowcell_layout
            .tile_set
            .and_then(|ts| ts.tiles)
            .map(|t| t.tile)
            .unwrap_or_default();

        let info = RunInfo {
            run_id: run.id,
            instrument: Instrument::from_code(&run.instrument),
            instrument_code: run.instrument,
            flowcell: run.flowcell,
            run_date: run.date,
            lane_count: run.flowcell_layout.lane_count,
            reads,
            tiles,
            experiment_name: None,
            run_start_time: None,
            chemistry: None,
        };
        info.validate()?;
        Ok(info)
    }

    fn validate(&self) -> Result<()> {
        if self.reads.is_empty() {
            return Err(PipelineError::config("RunInfo lists no reads"));
        }
        if self.lane_count < 1 {
            return Err(PipelineError::config("RunInfo LaneCount must be at least 1"));
        }
        for t in &self.tiles {
            let lane = t
                .split('_')
                .next()
                .and_then(|l| l.parse::<u32>().ok())
                .ok_or_else(|| PipelineError::config(format!("unparseable tile {:?}", t)))?;
            if lane < 1 || lane > self.lane_count {
                return Err(PipelineError::config(format!(
                    "tile {} is outside lanes 1..{}",
                    t, self.lane_count
                )));
            }
        }
        Ok(())
    }

    /// Pick the optional descriptive fields out of `runParameters.xml`.
    pub fn apply_run_parameters(&mut self, xml: &str) -> Result<()> {
        let params: RunParametersXml = from_reader(xml.as_bytes())
            .map_err(|e| PipelineError::config(format!("malformed runParameters: {}", e)))?;
        self.experiment_name = params.find(|p| &p.experiment_name);
        self.chemistry = params
            .find(|p| &p.flowcell_mode)
            .or_else(|| params.find(|p| &p.sbs_version));
        Ok(())
    }

    /// Number of the first non-index read.
    pub fn read1_number(&self) -> u32 {
        self.reads
            .iter()
            .find(|r| !r.is_index)
            .map_or(1, |r| r.number)
    }

    /// The cycle whose basecall directory appears once read `number` is
    /// complete: the first cycle after the read's last.
    pub fn trigger_cycle(&self, number: u32) -> Option<u32> {
        if !self.reads.iter().any(|r| r.number == number) {
            return None;
        }
        let done: u32 = self
            .reads
            .iter()
            .filter(|r| r.number <= number)
            .map(|r| r.cycles)
            .sum();
        Some(done + 1)
    }

    /// e.g. `151 [8] [8] 151`, index reads in brackets.
    pub fn cycles_summary(&self) -> String {
        self.reads
            .iter()
            .map(|r| {
                if r.is_index {
                    format!("[{}]", r.cycles)
                } else {
                    r.cycles.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// e.g. `hiseq4000_K00166`.
    pub fn instrument_label(&self) -> String {
        format!("{}_{}", self.instrument, self.instrument_code)
    }

    /// The flowcell id with any MiSeq-style `000000000-` prefix removed.
    pub fn flowcell_short(&self) -> &str {
        match self.flowcell.rfind('-') {
            Some(i) => &self.flowcell[i + 1..],
            None => &self.flowcell,
        }
    }
}

/// When the run started: the oldest modification time of the run
/// parameters file and anything in the `Recipe` directory beside it.
pub fn run_start_time(params: &Path) -> Result<String> {
    let mut oldest: SystemTime = fs::metadata(params).and_then(|m| m.modified()).at(params)?;
    if let Some(dir) = params.parent() {
        let pattern = format!("{}/Recipe/*", glob::Pattern::escape(&dir.to_string_lossy()));
        let paths = glob::glob(&pattern)
            .map_err(|e| PipelineError::config(format!("bad recipe pattern: {}", e)))?;
        for p in paths.flatten() {
            let t = fs::metadata(&p).and_then(|m| m.modified()).at(&p)?;
            oldest = oldest.min(t);
        }
    }
    let local: DateTime<Local> = oldest.into();
    Ok(local.format("%a %b %e %H:%M:%S %Y").to_string())
}
