// Copyright (c) 2018 10x Genomics, Inc. All rights reserved.

//! Error values shared by every pipeline action.

use std::fmt::Display;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Coarse classification used by callers to decide whether an error
/// is fatal to the current action or simply retried on the next tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Io,
    ExternalTool,
    Collision,
    StateInconsistent,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{tool} failed (exit: {code:?}): {message}")]
    ExternalTool {
        tool: String,
        code: Option<i32>,
        message: String,
    },
    #[error("refusing to overwrite existing file {}", .0.display())]
    Collision(PathBuf),
    #[error("inconsistent state: {0}")]
    StateInconsistent(String),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Config(_) => ErrorKind::Config,
            PipelineError::Io { .. } => ErrorKind::Io,
            PipelineError::ExternalTool { .. } => ErrorKind::ExternalTool,
            PipelineError::Collision(_) => ErrorKind::Collision,
            PipelineError::StateInconsistent(_) => ErrorKind::StateInconsistent,
        }
    }

    pub fn config(msg: impl Display) -> PipelineError {
        PipelineError::Config(msg.to_string())
    }

    pub fn io(path: impl AsRef<Path>, source: io::Error) -> PipelineError {
        PipelineError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

/// Attach the offending path to a bare `io::Error`.
pub trait IoContext<T> {
    fn at(self, path: impl AsRef<Path>) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn at(self, path: impl AsRef<Path>) -> Result<T> {
        self.map_err(|e| PipelineError::io(path, e))
    }
}

/// Accumulates non-fatal errors for the duration of one action, so a
/// failure on one run or file does not hide the others.
#[derive(Debug, Default)]
pub struct ErrorCollector {
    errors: Vec<String>,
}

impl ErrorCollector {
    pub fn new() -> ErrorCollector {
        ErrorCollector::default()
    }

    pub fn push(&mut self, context: impl Display, err: impl Display) {
        let msg = format!("{}: {}", context, err);
        error!("{}", msg);
        self.errors.push(msg);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Collapse into a single error if anything was collected.
    pub fn into_result(self, what: &str) -> anyhow::Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(anyhow::anyhow!(
                "{} error(s) during {}:\n  {}",
                self.errors.len(),
                what,
                self.errors.join("\n  ")
            ))
        }
    }
}
