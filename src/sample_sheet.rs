// Copyright (c) 2018 10x Genomics, Inc. All rights reserved.

//! Reader for Illumina `SampleSheet.csv` files.
//!
//! A sheet is a CSV file split into `[Section]` blocks. `[Header]` is a
//! list of key/value rows, `[Data]` is a table whose first row names the
//! columns, and `[Settings]`/`[bcl2fastq]` carry demultiplexer options.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use std::str::FromStr;

use crate::error::{IoContext, PipelineError, Result};

/// Directory names in the output root that may not be used as projects.
pub const RESERVED_NAMES: [&str; 7] = [
    "counts",
    "demultiplexing",
    "md5sums",
    "multiqc_reports",
    "QC",
    "seqdata",
    "slurm_output",
];

/// Pool name used for samples whose id has no `pool__library` split.
pub const NO_POOL: &str = "NoPool";

/// Reject project names that would clash with the output layout.
pub fn validate_project_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(PipelineError::config("empty project name"));
    }
    if name.contains('.') || name.contains('/') {
        return Err(PipelineError::config(format!(
            "invalid project name {:?}",
            name
        )));
    }
    if RESERVED_NAMES.contains(&name) {
        return Err(PipelineError::config(format!(
            "project name {:?} is reserved",
            name
        )));
    }
    Ok(())
}

/// Split a combined `pool__library` sample id.
pub fn split_pool_library(sample_id: &str) -> (&str, &str) {
    match sample_id.split_once("__") {
        Some((pool, lib)) => (pool, lib),
        None => (NO_POOL, sample_id),
    }
}

/// One row of the `[Data]` table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SampleSheetEntry {
    /// `None` for sheets without a lane column; the row applies to every lane.
    pub lane: Option<u32>,
    pub sample_id: String,
    pub sample_name: String,
    pub project: String,
    pub index1: String,
    pub index2: String,
    /// Columns not interpreted above, keyed by lower-cased column name.
    pub extras: BTreeMap<String, String>,
}

impl SampleSheetEntry {
    pub fn applies_to(&self, lane: u32) -> bool {
        self.lane.map_or(true, |l| l == lane)
    }

    pub fn pool(&self) -> &str {
        split_pool_library(&self.sample_id).0
    }

    pub fn library(&self) -> &str {
        split_pool_library(&self.sample_id).1
    }

    /// Index lengths with trailing `N` padding removed.
    pub fn index_lengths(&self) -> [usize; 2] {
        [
            self.index1.trim_end_matches('N').len(),
            self.index2.trim_end_matches('N').len(),
        ]
    }
}

/// What identifies a row for the purposes of deciding whether a lane's
/// content changed between two sheets.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct LaneRow {
    pub sample_id: String,
    pub project: String,
    pub index1: String,
    pub index2: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SampleSheet {
    /// `[Header]` key/value pairs in file order.
    pub header: Vec<(String, String)>,
    pub header_map: HashMap<String, String>,
    pub entries: Vec<SampleSheetEntry>,
    /// Lower-cased column name to position in the `[Data]` table.
    pub column_indices: HashMap<String, usize>,
    /// Raw lines of the `[Settings]` section, if the sheet has one.
    pub settings: Option<Vec<String>>,
    /// Raw lines of the `[bcl2fastq]` section.
    pub bcl2fastq: Vec<String>,
    data_columns: Vec<String>,
    data_rows: Vec<Vec<String>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Section {
    Preamble,
    Header,
    Reads,
    Settings,
    Bcl2Fastq,
    Data,
    Other,
}

impl Section {
    fn from_name(name: &str) -> Section {
        match name.to_ascii_lowercase().as_str() {
            "header" => Section::Header,
            "reads" => Section::Reads,
            "settings" => Section::Settings,
            "bcl2fastq" => Section::Bcl2Fastq,
            "data" => Section::Data,
            _ => Section::Other,
        }
    }
}

fn section_name(row: &csv::StringRecord) -> Option<&str> {
    let first = row.get(0)?.trim();
    if first.starts_with('[') {
        let end = first.find(']')?;
        Some(&first[1..end])
    } else {
        None
    }
}

fn trimmed_cells(row: &csv::StringRecord) -> Vec<String> {
    let mut cells: Vec<String> = row.iter().map(|c| c.trim().to_string()).collect();
    while cells.last().map_or(false, |c| c.is_empty()) {
        cells.pop();
    }
    cells
}

fn is_sample_id_column(name: &str) -> bool {
    name == "sample_id" || name == "sampleid"
}

impl FromStr for SampleSheet {
    type Err = PipelineError;

    fn from_str(text: &str) -> Result<SampleSheet> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(text.as_bytes());

        let mut sheet = SampleSheet::default();
        let mut section = Section::Preamble;

        for row in rdr.records() {
            let row = row.map_err(|e| PipelineError::config(format!("malformed sample sheet: {}", e)))?;

            if let Some(name) = section_name(&row) {
                section = Section::from_name(name);
                if section == Section::Settings && sheet.settings.is_none() {
                    sheet.settings = Some(Vec::new());
                }
                continue;
            }

            let cells = trimmed_cells(&row);
            if cells.is_empty() {
                continue;
            }

            // Older sheets omit the [Data] marker; the column row is then
            // recognised by its Sample_ID cell.
            let is_column_row = sheet.data_columns.is_empty()
                && cells.iter().any(|c| is_sample_id_column(&c.to_lowercase()));
            if is_column_row && (section == Section::Data || section == Section::Preamble) {
                section = Section::Data;
                sheet.data_columns = row.iter().map(|c| c.trim().to_string()).collect();
                for (i, c) in sheet.data_columns.iter().enumerate() {
                    let mut name = c.to_lowercase();
                    if name == "sampleid" {
                        name = "sample_id".to_string();
                    }
                    sheet.column_indices.entry(name).or_insert(i);
                }
                continue;
            }

            match section {
                Section::Header => {
                    let key = cells[0].clone();
                    let value = cells.get(1).cloned().unwrap_or_default();
                    sheet.header_map.insert(key.clone(), value.clone());
                    sheet.header.push((key, value));
                }
                Section::Settings => {
                    if let Some(s) = sheet.settings.as_mut() {
                        s.push(cells.join(","));
                    }
                }
                Section::Bcl2Fastq => sheet.bcl2fastq.push(cells.join(",")),
                Section::Data => {
                    if sheet.data_columns.is_empty() {
                        return Err(PipelineError::config(
                            "sample sheet [Data] section has no Sample_ID column",
                        ));
                    }
                    sheet.data_rows.push(row.iter().map(|c| c.trim().to_string()).collect());
                }
                Section::Preamble | Section::Reads | Section::Other => (),
            }
        }

        if !sheet.column_indices.contains_key("sample_id") {
            return Err(PipelineError::config("sample sheet has no Sample_ID column"));
        }

        let entries = sheet
            .data_rows
            .iter()
            .map(|row| sheet.entry_from_row(row))
            .collect::<Result<Vec<_>>>()?;
        sheet.entries = entries;

        for e in &sheet.entries {
            if !e.project.is_empty() {
                validate_project_name(&e.project)?;
            }
        }

        Ok(sheet)
    }
}

impl SampleSheet {
    pub fn from_path(path: impl AsRef<Path>) -> Result<SampleSheet> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).at(path)?;
        text.parse().map_err(|e| match e {
            PipelineError::Config(m) => PipelineError::Config(format!("{}: {}", path.display(), m)),
            other => other,
        })
    }

    fn cell<'a>(&self, row: &'a [String], column: &str) -> &'a str {
        self.column_indices
            .get(column)
            .and_then(|&i| row.get(i))
            .map_or("", String::as_str)
    }

    fn entry_from_row(&self, row: &[String]) -> Result<SampleSheetEntry> {
        let lane = match self.cell(row, "lane") {
            "" => None,
            l => Some(l.parse::<u32>().map_err(|_| {
                PipelineError::config(format!("bad lane value {:?} in sample sheet", l))
            })?),
        };

        let raw_index = self.cell(row, "index");
        let mut index1 = raw_index.to_string();
        let mut index2 = self.cell(row, "index2").to_string();
        // dual indexes are sometimes written as a single "AAAA-CCCC" cell
        if let Some((a, b)) = raw_index.split_once('-') {
            index1 = a.to_string();
            if index2.is_empty() {
                index2 = b.to_string();
            }
        }

        let known = ["lane", "sample_id", "sample_name", "sample_project", "index", "index2"];
        let extras = self
            .column_indices
            .iter()
            .filter(|(name, _)| !known.contains(&name.as_str()) && !name.is_empty())
            .filter_map(|(name, &i)| row.get(i).map(|v| (name.clone(), v.clone())))
            .collect();

        Ok(SampleSheetEntry {
            lane,
            sample_id: self.cell(row, "sample_id").to_string(),
            sample_name: self.cell(row, "sample_name").to_string(),
            project: self.cell(row, "sample_project").to_string(),
            index1,
            index2,
            extras,
        })
    }

    pub fn has_settings(&self) -> bool {
        self.settings.is_some()
    }

    pub fn entries_for_lane(&self, lane: u32) -> impl Iterator<Item = &SampleSheetEntry> {
        self.entries.iter().filter(move |e| e.applies_to(lane))
    }

    /// Index lengths for `lane`, one per indexed read. All rows of a lane
    /// must agree.
    pub fn index_lengths(&self, lane: u32) -> Result<Vec<usize>> {
        let mut found: Option<[usize; 2]> = None;
        for e in self.entries_for_lane(lane) {
            let l = e.index_lengths();
            match found {
                None => found = Some(l),
                Some(prev) if prev != l => {
                    return Err(PipelineError::config(format!(
                        "lane {} has ambiguous index lengths {:?} and {:?}",
                        lane, prev, l
                    )))
                }
                Some(_) => (),
            }
        }
        found
            .map(|l| l.to_vec())
            .ok_or_else(|| PipelineError::config(format!("lane {} is not in the sample sheet", lane)))
    }

    pub fn projects(&self) -> BTreeSet<String> {
        self.entries
            .iter()
            .filter(|e| !e.project.is_empty())
            .map(|e| e.project.clone())
            .collect()
    }

    /// The rows of a lane as compared by the auto-redo scanner.
    pub fn lane_rows(&self, lane: u32) -> BTreeSet<LaneRow> {
        self.entries_for_lane(lane)
            .map(|e| LaneRow {
                sample_id: e.sample_id.clone(),
                project: e.project.clone(),
                index1: e.index1.clone(),
                index2: e.index2.clone(),
            })
            .collect()
    }

    /// Lanes in `1..=lane_count` whose rows differ between two sheets.
    pub fn changed_lanes(&self, other: &SampleSheet, lane_count: u32) -> BTreeSet<u32> {
        (1..=lane_count)
            .filter(|&l| self.lane_rows(l) != other.lane_rows(l))
            .collect()
    }

    /// `[bcl2fastq]` settings as `(option, value)` pairs. Lines may be
    /// written `--opt = v`, `--opt: v` or `--opt v`.
    pub fn bcl2fastq_options(&self) -> Vec<(String, String)> {
        parse_option_lines(self.bcl2fastq.iter().map(String::as_str))
    }

    /// A single-lane sheet for the demultiplexer: the original header
    /// with a replaced description, any `[Settings]`, the given
    /// `[bcl2fastq]` options, and only the data rows for `lane`.
    pub fn lane_fragment(
        &self,
        lane: u32,
        description: &str,
        options: &[(String, String)],
    ) -> Result<String> {
        let mut out = String::from("[Header]\n");
        for (k, v) in &self.header {
            if k != "Description" {
                out.push_str(&csv_line(&[k.as_str(), v.as_str()])?);
            }
        }
        out.push_str(&csv_line(&["Description", description])?);

        if let Some(settings) = &self.settings {
            out.push_str("\n[Settings]\n");
            for l in settings {
                out.push_str(l);
                out.push('\n');
            }
        }

        out.push_str("\n[bcl2fastq]\n");
        for (k, v) in options {
            out.push_str(&format!("{} = {}\n", k, v));
        }

        out.push_str("\n[Data]\n");
        let cols: Vec<&str> = self.data_columns.iter().map(String::as_str).collect();
        out.push_str(&csv_line(&cols)?);
        for (row, entry) in self.data_rows.iter().zip(&self.entries) {
            if entry.applies_to(lane) {
                let cells: Vec<&str> = row.iter().map(String::as_str).collect();
                out.push_str(&csv_line(&cells)?);
            }
        }
        Ok(out)
    }
}

fn csv_line(cells: &[&str]) -> Result<String> {
    let mut wtr = csv::WriterBuilder::new()
        .flexible(true)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    wtr.write_record(cells)
        .map_err(|e| PipelineError::config(format!("writing sample sheet: {}", e)))?;
    let bytes = wtr
        .into_inner()
        .map_err(|e| PipelineError::config(format!("writing sample sheet: {}", e)))?;
    String::from_utf8(bytes).map_err(|e| PipelineError::config(e.to_string()))
}

/// Parse ini-style option lines into `(option, value)` pairs, skipping
/// blanks and comments.
pub fn parse_option_lines<'a>(lines: impl Iterator<Item = &'a str>) -> Vec<(String, String)> {
    lines
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#') && !l.starts_with(';'))
        .map(|l| {
            let end = l
                .find(|c: char| c == '=' || c == ':' || c.is_whitespace())
                .unwrap_or(l.len());
            let rest = l[end..].trim_start();
            let value = rest
                .strip_prefix(|c: char| c == '=' || c == ':')
                .unwrap_or(rest)
                .trim();
            (l[..end].to_string(), value.to_string())
        })
        .collect()
}
