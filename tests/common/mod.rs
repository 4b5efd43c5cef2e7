// Copyright (c) 2018 10x Genomics, Inc. All rights reserved.

//! Fixtures shared by the integration tests: run folders, sample sheets
//! and a stand-in bcl2fastq.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use illuminatus::PipelineConfig;
use tempfile::TempDir;

pub const MISEQ_RUN: &str = "160603_M01270_0196_000000000-AKGDE";
pub const HISEQ_RUN: &str = "160726_K00166_0120_BHCVH2BBXX";

pub const MISEQ_RUNINFO: &str = r#"<?xml version="1.0"?>
<RunInfo xmlns:xsd="http://www.w3.org/2001/XMLSchema" Version="2">
  <Run Id="160603_M01270_0196_000000000-AKGDE" Number="196">
    <Flowcell>000000000-AKGDE</Flowcell>
    <Instrument>M01270</Instrument>
    <Date>160603</Date>
    <Reads>
      <Read NumCycles="101" Number="1" IsIndexedRead="N" />
      <Read NumCycles="8" Number="2" IsIndexedRead="Y" />
      <Read NumCycles="8" Number="3" IsIndexedRead="Y" />
      <Read NumCycles="101" Number="4" IsIndexedRead="N" />
    </Reads>
    <FlowcellLayout LaneCount="1" SurfaceCount="2" SwathCount="1" TileCount="14" />
  </Run>
</RunInfo>
"#;

pub const HISEQ_RUNINFO: &str = r#"<?xml version="1.0"?>
<RunInfo xmlns:xsd="http://www.w3.org/2001/XMLSchema" Version="2">
  <Run Id="160726_K00166_0120_BHCVH2BBXX" Number="120">
    <Flowcell>HCVH2BBXX</Flowcell>
    <Instrument>K00166</Instrument>
    <Date>160726</Date>
    <Reads>
      <Read Number="1" NumCycles="151" IsIndexedRead="N" />
      <Read Number="2" NumCycles="8" IsIndexedRead="Y" />
      <Read Number="3" NumCycles="151" IsIndexedRead="N" />
    </Reads>
    <FlowcellLayout LaneCount="8" SurfaceCount="2" SwathCount="2" TileCount="28" />
  </Run>
</RunInfo>
"#;

pub const MISEQ_SHEET: &str = "[Header]
Description,integration

[Data]
Lane,Sample_ID,Sample_Name,index,index2,Sample_Project
1,10510GCpool05__10510GC0017L01,10510GC0017L01,ACGTACGT,TTGGCCAA,10510
";

/// No lane column, so every lane of a HiSeq run gets the same sample.
pub const ANY_LANE_SHEET: &str = "[Header]
Description,integration

[Data]
Sample_ID,Sample_Name,index,Sample_Project
10510GCpool05__10510GC0017L01,10510GC0017L01,ACGTACGT,10510
";

/// seqdata, fastqdata and a sample sheet share inside one temp dir.
pub struct Sandbox {
    pub tmp: TempDir,
    pub config: PipelineConfig,
}

impl Sandbox {
    pub fn new() -> Sandbox {
        let tmp = TempDir::new().unwrap();
        let seqdata = tmp.path().join("seqdata");
        let fastqdata = tmp.path().join("fastqdata");
        let sheets = tmp.path().join("samplesheets");
        for d in [&seqdata, &fastqdata, &sheets] {
            fs::create_dir_all(d).unwrap();
        }
        let config = PipelineConfig {
            seqdata: Some(seqdata),
            fastqdata: Some(fastqdata),
            samplesheets_root: Some(sheets),
            ..PipelineConfig::default()
        };
        Sandbox { tmp, config }
    }

    pub fn seqdata(&self) -> &Path {
        self.config.seqdata.as_deref().unwrap()
    }

    pub fn fastqdata(&self) -> &Path {
        self.config.fastqdata.as_deref().unwrap()
    }

    pub fn sheets(&self) -> &Path {
        self.config.samplesheets_root.as_deref().unwrap()
    }

    /// A run folder with `RunInfo.xml` and, if given, a plain
    /// `SampleSheet.csv`.
    pub fn add_run(&self, name: &str, runinfo: &str, sheet: Option<&str>) -> PathBuf {
        let run = self.seqdata().join(name);
        fs::create_dir_all(&run).unwrap();
        fs::write(run.join("RunInfo.xml"), runinfo).unwrap();
        if let Some(s) = sheet {
            fs::write(run.join("SampleSheet.csv"), s).unwrap();
        }
        run
    }
}

pub fn touch(p: &Path) {
    if let Some(d) = p.parent() {
        fs::create_dir_all(d).unwrap();
    }
    fs::write(p, "").unwrap();
}

/// A fake bcl2fastq. `--version` answers like the real thing; any other
/// call finds its `-o` directory in `$out` and then runs `body`.
pub fn mock_bcl2fastq(dir: &Path, body: &str) -> PathBuf {
    let program = dir.join("bcl2fastq");
    let script = format!(
        "#!/bin/sh
if [ \"$1\" = --version ] ; then echo 'bcl2fastq v2.20.0.422' >&2 ; exit 0 ; fi
echo \"$*\" >> '{}'
out=''
while [ $# -gt 0 ] ; do
  if [ \"$1\" = -o ] ; then out=\"$2\" ; fi
  shift
done
{}
",
        dir.join("bcl2fastq.calls").display(),
        body
    );
    fs::write(&program, script).unwrap();
    fs::set_permissions(&program, fs::Permissions::from_mode(0o755)).unwrap();
    program
}

/// Writes reads 1 and 2 of the one library plus undetermined reads for
/// the lane named by the output directory, laid out the way bcl2fastq
/// does.
pub const WRITE_FASTQ: &str = "
lane=${out##*lane}
d=\"$out/10510/10510GCpool05__10510GC0017L01\"
mkdir -p \"$d\"
for r in 1 2 ; do
  echo \"library lane $lane read $r\" > \"$d/10510GC0017L01_S1_L00${lane}_R${r}_001.fastq.gz\"
  echo \"undetermined lane $lane read $r\" > \"$out/Undetermined_S0_L00${lane}_R${r}_001.fastq.gz\"
done
";

/// Every file under `root` with its contents, keyed by relative path.
/// Paths for which `skip` is true are left out.
pub fn tree(root: &Path, skip: impl Fn(&Path) -> bool) -> BTreeMap<PathBuf, Vec<u8>> {
    let mut res = BTreeMap::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir).unwrap() {
            let path = entry.unwrap().path();
            let rel = path.strip_prefix(root).unwrap().to_path_buf();
            if skip(&rel) {
                continue;
            }
            let meta = fs::symlink_metadata(&path).unwrap();
            if meta.is_dir() {
                stack.push(path);
            } else if meta.file_type().is_symlink() {
                let target = fs::read_link(&path).unwrap();
                res.insert(rel, target.to_string_lossy().into_owned().into_bytes());
            } else {
                res.insert(rel, fs::read(&path).unwrap());
            }
        }
    }
    res
}

/// Relative path and modification time of everything under `root`,
/// directories included.
pub fn mtimes(root: &Path) -> BTreeMap<PathBuf, SystemTime> {
    let mut res = BTreeMap::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir).unwrap() {
            let path = entry.unwrap().path();
            let meta = fs::symlink_metadata(&path).unwrap();
            res.insert(
                path.strip_prefix(root).unwrap().to_path_buf(),
                meta.modified().unwrap(),
            );
            if meta.is_dir() {
                stack.push(path);
            }
        }
    }
    res
}
