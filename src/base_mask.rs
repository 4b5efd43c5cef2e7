//! `--use-bases-mask` computation.

use crate::error::Result;
use crate::run_info::{ReadInfo, RunInfo};
use crate::sample_sheet::SampleSheet;

/// Build the base mask for one lane from the run's reads and the index
/// lengths the sample sheet uses for that lane (one entry per indexed
/// read; missing entries count as zero).
///
/// Data reads always drop their final cycle. Index reads are trimmed to
/// the sample sheet's index length and skipped when unused. The one
/// exception is a run of nothing but index reads, whose last read is kept
/// whole so the mask still reads something.
pub fn base_mask(reads: &[ReadInfo], index_lengths: &[usize]) -> String {
    let only_index = reads.iter().all(|r| r.is_index);
    let mut index_read = 0;
    let mut parts = Vec::with_capacity(reads.len());

    for (i, read) in reads.iter().enumerate() {
        let cycles = read.cycles as usize;
        if !read.is_index {
            parts.push(format!("Y{}n", cycles.saturating_sub(1)));
            continue;
        }

        let idx = index_lengths.get(index_read).copied().unwrap_or(0);
        index_read += 1;
        let has_following = i + 1 < reads.len();

        let part = if idx == 0 {
            if only_index && !has_following {
                format!("I{}", cycles)
            } else {
                "n*".to_string()
            }
        } else if idx == cycles {
            format!("I{}", idx)
        } else if idx < cycles {
            format!("I{}n*", idx)
        } else {
            format!("I{}", cycles)
        };
        parts.push(part);
    }

    parts.join(",")
}

/// Base mask for `lane`, failing if the sheet's index lengths for that
/// lane are missing or disagree.
pub fn base_mask_for_lane(run_info: &RunInfo, sheet: &SampleSheet, lane: u32) -> Result<String> {
    let lengths = sheet.index_lengths(lane)?;
    Ok(base_mask(&run_info.reads, &lengths))
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn reads(spec: &[(u32, bool)]) -> Vec<ReadInfo> {
        spec.iter()
            .enumerate()
            .map(|(i, &(cycles, is_index))| ReadInfo {
                number: i as u32 + 1,
                cycles,
                is_index,
            })
            .collect()
    }

    #[test]
    fn test_dual_index() {
        let r = reads(&[(101, false), (8, true), (8, true), (101, false)]);
        assert_eq!(base_mask(&r, &[8, 8]), "Y100n,I8,I8,Y100n");
        assert_eq!(base_mask(&r, &[6, 6]), "Y100n,I6n*,I6n*,Y100n");
        assert_eq!(base_mask(&r, &[8, 0]), "Y100n,I8,n*,Y100n");
        assert_eq!(base_mask(&r, &[10, 10]), "Y100n,I8,I8,Y100n");
        assert_eq!(base_mask(&r, &[8]), "Y100n,I8,n*,Y100n");
    }

    #[test]
    fn test_single_index() {
        let r = reads(&[(151, false), (8, true), (151, false)]);
        assert_eq!(base_mask(&r, &[8, 0]), "Y150n,I8,Y150n");
        assert_eq!(base_mask(&r, &[0, 0]), "Y150n,n*,Y150n");
    }

    #[test]
    fn test_trailing_index() {
        let r = reads(&[(51, false), (8, true)]);
        assert_eq!(base_mask(&r, &[0, 0]), "Y50n,n*");
        assert_eq!(base_mask(&r, &[6, 0]), "Y50n,I6n*");

        // only index reads: the last one is kept whole
        let r = reads(&[(8, true), (8, true)]);
        assert_eq!(base_mask(&r, &[0, 0]), "n*,I8");
        assert_eq!(base_mask(&r, &[6, 0]), "I6n*,I8");
    }

    #[test]
    fn test_for_lane() -> Result<()> {
        let info = RunInfo::from_xml(crate::run_info::test::HISEQ4000_RUNINFO)?;
        let sheet: SampleSheet = crate::sample_sheet::test::HISEQ_SHEET.parse()?;
        assert_eq!(base_mask_for_lane(&info, &sheet, 1)?, "Y150n,I8,Y150n");
        assert_eq!(base_mask_for_lane(&info, &sheet, 3)?, "Y150n,n*,Y150n");
        assert!(base_mask_for_lane(&info, &sheet, 5).is_err());
        Ok(())
    }

    proptest! {
        #[test]
        fn prop_mask_is_pure_and_shaped(
            spec in proptest::collection::vec((1u32..400, any::<bool>()), 1..6),
            lengths in proptest::collection::vec(0usize..20, 0..3),
        ) {
            let r = reads(&spec);
            let a = base_mask(&r, &lengths);
            let b = base_mask(&r, &lengths);
            prop_assert_eq!(&a, &b);

            let parts: Vec<&str> = a.split(',').collect();
            prop_assert_eq!(parts.len(), r.len());
            for (p, read) in parts.iter().zip(&r) {
                if read.is_index {
                    prop_assert!(p.starts_with('I') || *p == "n*");
                } else {
                    prop_assert_eq!(p.to_string(), format!("Y{}n", read.cycles - 1));
                }
            }
        }
    }
}
