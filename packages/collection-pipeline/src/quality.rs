//! Batch quality classification.
//!
//! The band is a monitoring signal, not a storage gate: an `Invalid` batch
//! still persists its individually valid records.

use chrono::Utc;

use crate::types::{QualityAssessment, QualityBand};

/// Classify a job's batch from its attempted/valid/error counts.
///
/// Thresholds are evaluated in order, first match wins; the band is
/// monotonic in completeness and in inverse error ratio.
pub fn assess(total: u64, valid: u64, errors: u64) -> QualityAssessment {
    let band = band_for(total, valid, errors);
    QualityAssessment {
        total,
        valid,
        errors,
        band,
        assessed_at: Utc::now(),
    }
}

fn band_for(total: u64, valid: u64, errors: u64) -> QualityBand {
    if total == 0 {
        return QualityBand::Invalid;
    }

    let completeness = valid as f64 / total as f64;
    let error_ratio = errors as f64 / total as f64;

    if completeness >= 0.9 && error_ratio <= 0.1 {
        QualityBand::High
    } else if completeness >= 0.7 && error_ratio <= 0.2 {
        QualityBand::Medium
    } else if completeness >= 0.5 && error_ratio <= 0.3 {
        QualityBand::Low
    } else {
        QualityBand::Invalid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn empty_batch_is_invalid() {
        assert_eq!(assess(0, 0, 0).band, QualityBand::Invalid);
        assert_eq!(assess(0, 10, 3).band, QualityBand::Invalid);
    }

    #[test]
    fn band_scenarios() {
        // completeness 0.95, error ratio 0.03
        assert_eq!(assess(100, 95, 3).band, QualityBand::High);
        // completeness 0.72, error ratio 0.15
        assert_eq!(assess(100, 72, 15).band, QualityBand::Medium);
        // completeness 0.55, error ratio 0.28
        assert_eq!(assess(100, 55, 28).band, QualityBand::Low);
        // completeness below every threshold
        assert_eq!(assess(100, 20, 40).band, QualityBand::Invalid);
    }

    #[test]
    fn boundaries_are_inclusive() {
        assert_eq!(assess(100, 90, 10).band, QualityBand::High);
        assert_eq!(assess(100, 70, 20).band, QualityBand::Medium);
        assert_eq!(assess(100, 50, 30).band, QualityBand::Low);
        assert_eq!(assess(100, 49, 30).band, QualityBand::Invalid);
        assert_eq!(assess(100, 50, 31).band, QualityBand::Invalid);
    }

    proptest! {
        // For fixed total, more valid records never lower the band.
        #[test]
        fn band_monotonic_in_valid(total in 1u64..500, valid in 0u64..500, errors in 0u64..500) {
            let valid = valid.min(total);
            let errors = errors.min(total);
            if valid < total {
                let before = band_for(total, valid, errors);
                let after = band_for(total, valid + 1, errors);
                prop_assert!(after.rank() >= before.rank());
            }
        }

        // For fixed total, more errors never raise the band.
        #[test]
        fn band_antitonic_in_errors(total in 1u64..500, valid in 0u64..500, errors in 0u64..500) {
            let valid = valid.min(total);
            let errors = errors.min(total);
            let before = band_for(total, valid, errors);
            let after = band_for(total, valid, errors + 1);
            prop_assert!(after.rank() <= before.rank());
        }
    }
}
