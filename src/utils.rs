// Copyright (c) 2018 10x Genomics, Inc. All rights reserved.

//! Utility methods.

use std::boxed::Box;
use std::fmt::Display;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use flate2::read::MultiGzDecoder;
use sha2::{Digest, Sha256};

use crate::error::{IoContext, PipelineError, Result};

const GZ_BUF_SIZE: usize = 1 << 22;

/// Open a (possibly gzipped) file into a BufReader.
pub fn open_with_gz<P: AsRef<Path>>(p: P) -> Result<Box<dyn BufRead>> {
    let r = File::open(p.as_ref()).at(p.as_ref())?;

    let is_gz = p.as_ref().extension().map_or(false, |ext| ext == "gz");

    if is_gz {
        let gz = MultiGzDecoder::new(r);
        let buf_reader = BufReader::with_capacity(GZ_BUF_SIZE, gz);
        Ok(Box::new(buf_reader))
    } else {
        let buf_reader = BufReader::with_capacity(32 * 1024, r);
        Ok(Box::new(buf_reader))
    }
}

/// Create `path` only if it does not already exist. Returns a
/// `Collision` error if something is already there.
pub fn create_exclusive(path: impl AsRef<Path>) -> Result<File> {
    let path = path.as_ref();
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(f) => Ok(f),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            Err(PipelineError::Collision(path.to_path_buf()))
        }
        Err(e) => Err(PipelineError::io(path, e)),
    }
}

/// Remove a file, treating "already gone" as success. Returns whether
/// anything was removed.
pub fn remove_if_present(path: impl AsRef<Path>) -> Result<bool> {
    match fs::remove_file(path.as_ref()) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(PipelineError::io(path, e)),
    }
}

/// Write `contents` to `path` and fsync before returning.
pub fn write_synced(path: impl AsRef<Path>, contents: &[u8]) -> Result<()> {
    let path = path.as_ref();
    let mut f = File::create(path).at(path)?;
    f.write_all(contents).at(path)?;
    f.sync_all().at(path)
}

/// Write `contents` to `path` unless the file already holds exactly that.
/// Returns whether the file was (re)written.
pub fn write_if_changed(path: impl AsRef<Path>, contents: &[u8]) -> Result<bool> {
    let path = path.as_ref();
    match fs::read(path) {
        Ok(existing) if existing == contents => return Ok(false),
        Ok(_) => (),
        Err(e) if e.kind() == io::ErrorKind::NotFound => (),
        Err(e) => return Err(PipelineError::io(path, e)),
    }
    let tmp = sibling_tmp(path);
    fs::write(&tmp, contents).at(&tmp)?;
    fs::rename(&tmp, path).at(path)?;
    Ok(true)
}

/// Lines of a plain-text list file, or empty if it does not exist.
pub fn read_lines_if_present(path: impl AsRef<Path>) -> Result<Vec<String>> {
    match fs::read_to_string(path.as_ref()) {
        Ok(s) => Ok(s
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(PipelineError::io(path, e)),
    }
}

/// SHA-256 of a file's contents.
pub fn file_digest(path: impl AsRef<Path>) -> Result<Vec<u8>> {
    let path = path.as_ref();
    let mut f = File::open(path).at(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = f.read(&mut buf).at(path)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_vec())
}

/// Name of a temporary file next to `path`, used for write-then-rename.
pub fn sibling_tmp(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.tmp.{}", name, std::process::id()))
}

/// Remove every empty directory under `root`, bottom-up, then `root`
/// itself if it ended up empty. Non-empty directories are left alone.
/// Returns the directories removed.
pub fn prune_empty_dirs(root: &Path) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    prune_into(root, &mut removed)?;
    Ok(removed)
}

fn prune_into(dir: &Path, removed: &mut Vec<PathBuf>) -> Result<bool> {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(PipelineError::io(dir, e)),
    };

    let mut empty = true;
    for entry in entries {
        let entry = entry.at(dir)?;
        let ft = entry.file_type().at(entry.path())?;
        if ft.is_dir() {
            if !prune_into(&entry.path(), removed)? {
                empty = false;
            }
        } else {
            empty = false;
        }
    }

    if empty {
        match fs::remove_dir(dir) {
            Ok(()) => {
                removed.push(dir.to_path_buf());
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(true),
            // raced with something writing into it
            Err(_) => Ok(false),
        }
    } else {
        Ok(false)
    }
}

/// An append-only, timestamped record of the filesystem changes made by
/// one action (`cleanup.log`, `renames.log` and friends). Every line is
/// also forwarded to the process logger.
pub struct ActionLog {
    path: PathBuf,
    file: File,
}

impl ActionLog {
    pub fn open(path: impl AsRef<Path>) -> Result<ActionLog> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .at(&path)?;
        Ok(ActionLog { path, file })
    }

    pub fn line(&mut self, msg: impl Display) -> Result<()> {
        info!("{}", msg);
        writeln!(
            self.file,
            "[{}] {}",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            msg
        )
        .at(&self.path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
