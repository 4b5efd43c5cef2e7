//! Utilities for finding FASTQ files on disk, before and after they are
//! renamed into the project layout.

pub mod bcl2fastq;
pub mod canonical;

use crate::error::Result;

pub use bcl2fastq::{DemuxFastq, DemuxLaneDir, IlmnFastqFile, UndeterminedFastqFile};
pub use canonical::{FastqIdentity, ReadLabel};

/// A method to find a set of FASTQ files based on
/// some location held by `self`, and the naming
/// conventions encoded in the implementing type
pub trait FindFastqs {
    type Fastq;
    fn find_fastqs(&self) -> Result<Vec<Self::Fastq>>;
}
