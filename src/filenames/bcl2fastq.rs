use super::FindFastqs;
use crate::error::{IoContext, PipelineError, Result};
use lazy_static::lazy_static;
use regex::Regex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

lazy_static! {
    static ref BCL2FASTQ_REGEX: Regex =
        Regex::new(r"(?i)^(.*)_(S[0-9]+)_L00([0-9])_R([0-9])_[0-9]+\.fastq\.gz$").unwrap();
    static ref UNDETERMINED_REGEX: Regex =
        Regex::new(r"^[Uu]ndetermined_.*_L00([0-9])_R([0-9])_[0-9]+\.fastq\.gz$").unwrap();
    static ref DEMUX_AREA_REGEX: Regex =
        Regex::new(r"_L00(\d)_.._\d\d\d\.fastq\.gz$").unwrap();
    static ref LANE_DIR_REGEX: Regex = Regex::new(r"^lane([0-9]+)$").unwrap();
}

/// A parsed representation of an FASTQ file produced by
/// Illumina's bcl2fastq tool.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct IlmnFastqFile {
    pub sample: String,
    pub s: usize,
    pub lane: u32,
    pub read: u32,
    pub path: PathBuf,
}

/// Parse the ILMN fastq filename to get the read number, lane, and S
/// field. We expect a filename of the form
/// <path>/<prefix>_S1_L001_R1_001.fastq.gz
impl IlmnFastqFile {
    /// Attempt to parse `path` as an Illumina bcl2fastq-produced
    /// FASTQ file.
    pub fn new(path: impl AsRef<Path>) -> Option<IlmnFastqFile> {
        let filename = path.as_ref().file_name()?.to_str()?;
        let cap = BCL2FASTQ_REGEX.captures(filename)?;

        Some(IlmnFastqFile {
            sample: cap[1].to_string(),
            s: cap[2][1..].parse().ok()?,
            lane: cap[3].parse().ok()?,
            read: cap[4].parse().ok()?,
            path: path.as_ref().into(),
        })
    }
}

/// `Undetermined_S0_L00N_RN_001.fastq.gz`: reads that matched no index.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct UndeterminedFastqFile {
    pub lane: u32,
    pub read: u32,
    pub path: PathBuf,
}

impl UndeterminedFastqFile {
    pub fn new(path: impl AsRef<Path>) -> Option<UndeterminedFastqFile> {
        let filename = path.as_ref().file_name()?.to_str()?;
        let cap = UNDETERMINED_REGEX.captures(filename)?;
        Some(UndeterminedFastqFile {
            lane: cap[1].parse().ok()?,
            read: cap[2].parse().ok()?,
            path: path.as_ref().into(),
        })
    }
}

/// The lane digit of a file in the demultiplexing area, if the name is
/// one the cleanup should consider.
pub fn demux_area_lane(filename: &str) -> Option<u32> {
    DEMUX_AREA_REGEX
        .captures(filename)
        .and_then(|c| c[1].parse().ok())
}

/// A bcl2fastq output file together with where it was found.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DemuxFastq {
    /// `<project>/<pool>__<library>/<file>`, or `<project>/<file>` for
    /// unindexed samples, where the sample name stands in for the
    /// combined id.
    Sample {
        project: String,
        pool_library: String,
        file: IlmnFastqFile,
    },
    Undetermined(UndeterminedFastqFile),
}

impl DemuxFastq {
    pub fn path(&self) -> &Path {
        match self {
            DemuxFastq::Sample { file, .. } => &file.path,
            DemuxFastq::Undetermined(u) => &u.path,
        }
    }
}

/// One `demultiplexing/lane<N>` directory.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct DemuxLaneDir {
    pub lane: u32,
    pub path: PathBuf,
}

impl DemuxLaneDir {
    /// All `lane<N>` directories directly under `demux_root`, in lane
    /// order. A missing root yields nothing.
    pub fn list(demux_root: impl AsRef<Path>) -> Result<Vec<DemuxLaneDir>> {
        let demux_root = demux_root.as_ref();
        let entries = match fs::read_dir(demux_root) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PipelineError::io(demux_root, e)),
        };

        let mut res = Vec::new();
        for entry in entries {
            let path = entry.at(demux_root)?.path();
            let lane = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| LANE_DIR_REGEX.captures(n))
                .and_then(|c| c[1].parse().ok());
            if let Some(lane) = lane {
                if path.is_dir() {
                    res.push(DemuxLaneDir { lane, path });
                }
            }
        }
        res.sort();
        Ok(res)
    }

    /// Project directories in this lane, sorted by name.
    pub fn project_dirs(&self) -> Result<Vec<(String, PathBuf)>> {
        let mut res = Vec::new();
        for entry in fs::read_dir(&self.path).at(&self.path)? {
            let path = entry.at(&self.path)?.path();
            if path.is_dir() {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    res.push((name.to_string(), path.clone()));
                }
            }
        }
        res.sort();
        Ok(res)
    }
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir).at(dir)? {
        paths.push(entry.at(dir)?.path());
    }
    paths.sort();
    Ok(paths)
}

fn is_fastq_gz(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map_or(false, |n| n.to_ascii_lowercase().ends_with(".fastq.gz"))
}

fn skip_unrecognised(path: &Path) {
    if is_fastq_gz(path) {
        warn!("skipping unrecognised FASTQ file {}", path.display());
    }
}

/// Find all the bcl2fastq FASTQ files in one lane directory: undetermined
/// reads at the top, sample reads one or two directories down. Files
/// whose names do not parse are skipped with a warning.
impl FindFastqs for DemuxLaneDir {
    type Fastq = DemuxFastq;

    fn find_fastqs(&self) -> Result<Vec<DemuxFastq>> {
        let mut res = Vec::new();

        for path in sorted_entries(&self.path)? {
            if path.is_file() {
                match UndeterminedFastqFile::new(&path) {
                    Some(u) => res.push(DemuxFastq::Undetermined(u)),
                    None => skip_unrecognised(&path),
                }
            }
        }

        for (project, project_dir) in self.project_dirs()? {
            for path in sorted_entries(&project_dir)? {
                if path.is_dir() {
                    let pool_library = match path.file_name().and_then(|n| n.to_str()) {
                        Some(n) => n.to_string(),
                        None => continue,
                    };
                    for f in sorted_entries(&path)? {
                        match IlmnFastqFile::new(&f) {
                            Some(file) if f.is_file() => res.push(DemuxFastq::Sample {
                                project: project.clone(),
                                pool_library: pool_library.clone(),
                                file,
                            }),
                            _ => skip_unrecognised(&f),
                        }
                    }
                } else {
                    match IlmnFastqFile::new(&path) {
                        Some(file) => res.push(DemuxFastq::Sample {
                            project: project.clone(),
                            pool_library: file.sample.clone(),
                            file,
                        }),
                        None => skip_unrecognised(&path),
                    }
                }
            }
        }

        Ok(res)
    }
}
