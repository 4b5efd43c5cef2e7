// Copyright (c) 2018 10x Genomics, Inc. All rights reserved.

//! Read and base counts for a single FASTQ file.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use fastq::Record;
use lazy_static::lazy_static;
use regex::bytes::Regex;

use crate::error::{IoContext, Result};
use crate::utils;

/// Summary of one FASTQ file, printed as YAML by `fq-count`.
#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct FastqCounts {
    pub total_reads: u64,
    pub min_read_len: usize,
    pub max_read_len: usize,
    pub total_bases: u64,
    pub n_bases: u64,
    pub non_n_bases: u64,
    pub index_seq: String,
}

lazy_static! {
    static ref NOT_A_BARCODE: Regex = Regex::new(r"[N0-9]").unwrap();
}

/// Tally of the index sequences found at the end of read headers.
#[derive(Default)]
struct BarcodeTally {
    counts: HashMap<Vec<u8>, u64>,
}

impl BarcodeTally {
    fn observe(&mut self, head: &[u8]) {
        let candidate = match head.rsplit(|&b| b == b':').next() {
            Some(c) => c,
            None => return,
        };
        if candidate.len() < 3 || NOT_A_BARCODE.is_match(candidate) {
            return;
        }
        *self.counts.entry(candidate.to_vec()).or_insert(0) += 1;
    }

    /// `none` with no candidates, the sole candidate if there is one, and
    /// otherwise the most common one only if it is at least twice as
    /// frequent as the runner-up.
    fn call(&self) -> String {
        let mut ranked: Vec<(&Vec<u8>, &u64)> = self.counts.iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        match ranked.as_slice() {
            [] => "none".to_string(),
            [(only, _)] => String::from_utf8_lossy(only).into_owned(),
            [(first, n1), (_, n2), ..] if **n1 >= **n2 * 2 => {
                String::from_utf8_lossy(first).into_owned()
            }
            _ => "unknown".to_string(),
        }
    }
}

/// Count reads and bases in a (possibly gzipped) FASTQ. An empty file
/// yields all-zero counts without being decompressed.
pub fn count_fastq(path: impl AsRef<Path>) -> Result<FastqCounts> {
    let path = path.as_ref();
    let size = fs::metadata(path).at(path)?.len();
    if size == 0 {
        return Ok(FastqCounts {
            index_seq: "none".to_string(),
            ..FastqCounts::default()
        });
    }

    let rdr = utils::open_with_gz(path)?;
    let parser = fastq::Parser::new(rdr);
    let mut iter = parser.ref_iter();

    let mut counts = FastqCounts::default();
    let mut tally = BarcodeTally::default();

    loop {
        iter.advance().at(path)?;
        let record = match iter.get() {
            Some(r) => r,
            None => break,
        };

        let seq = record.seq();
        let len = seq.len();
        if counts.total_reads == 0 || len < counts.min_read_len {
            counts.min_read_len = len;
        }
        counts.max_read_len = counts.max_read_len.max(len);
        counts.total_reads += 1;
        counts.total_bases += len as u64;
        counts.n_bases += seq.iter().filter(|&&b| b == b'N').count() as u64;
        tally.observe(record.head());
    }

    counts.non_n_bases = counts.total_bases - counts.n_bases;
    counts.index_seq = tally.call();
    debug!(
        "{}: {} reads, {} bases",
        path.display(),
        counts.total_reads,
        counts.total_bases
    );
    Ok(counts)
}
