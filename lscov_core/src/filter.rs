use crate::hash::hash_index;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FilterError {
    /// Every bit of the filter is set; the cardinality estimator diverges.
    #[error("bloom filter saturated: all {bits} bits set, cardinality estimate diverges")]
    Saturated { bits: u64 },
    /// A derived bit position fell outside the filter. Indicates a corrupted
    /// handshake contract, never a recoverable condition.
    #[error("hash index {index} outside filter range of {bits} bits")]
    IndexOutOfRange { index: u64, bits: u64 },
    #[error("filter size must be a nonzero multiple of 8 bytes, got {0}")]
    InvalidSize(usize),
    #[error("number of hash functions must be nonzero")]
    NoHashes,
}

/// Set-only bloom filter over logic-state fingerprints, with a closed-form
/// estimate of how many distinct fingerprints were inserted.
///
/// The bit array is a vector of atomic words: the measurement loop inserts
/// while the tally task counts population, and the semaphore protocol is the
/// only synchronization in the daemon. A tally that overlaps inserts simply
/// lands between the previous and next true cardinality.
///
/// Bits only ever transition 0 -> 1; the filter lives for the whole session.
pub struct LogicStateFilter {
    words: Vec<AtomicU64>,
    size_bits: u64,
    num_hashes: u32,
    /// `k * ln(1 - 1/M)`, fixed for the session.
    ln_divisor: f64,
}

impl LogicStateFilter {
    pub fn new(size_bytes: usize, num_hashes: u32) -> Result<Self, FilterError> {
        if size_bytes == 0 || size_bytes % 8 != 0 {
            return Err(FilterError::InvalidSize(size_bytes));
        }
        if num_hashes == 0 {
            return Err(FilterError::NoHashes);
        }

        let size_bits = (size_bytes as u64) * 8;
        let words = (0..size_bytes / 8).map(|_| AtomicU64::new(0)).collect();
        let ln_divisor = f64::from(num_hashes) * (1.0 - 1.0 / size_bits as f64).ln();

        Ok(Self {
            words,
            size_bits,
            num_hashes,
            ln_divisor,
        })
    }

    pub fn size_bits(&self) -> u64 {
        self.size_bits
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    /// Inserts one fingerprint by setting its k derived bits. Re-inserting a
    /// fingerprint is a no-op on the population count.
    pub fn insert(&self, state: &[u8]) -> Result<(), FilterError> {
        for seed in 0..self.num_hashes {
            let index = hash_index(state, seed, self.size_bits);
            self.set_bit(index)?;
        }
        Ok(())
    }

    fn set_bit(&self, index: u64) -> Result<(), FilterError> {
        let word = (index / 64) as usize;
        let bit = index % 64;
        let Some(slot) = self.words.get(word) else {
            return Err(FilterError::IndexOutOfRange {
                index,
                bits: self.size_bits,
            });
        };
        slot.fetch_or(1u64 << bit, Ordering::Relaxed);
        Ok(())
    }

    /// Number of set bits, by a word-parallel sweep over the whole array.
    ///
    /// This is O(M) and the dominant tally cost; callers keep it off the
    /// insertion path.
    pub fn population_count(&self) -> u64 {
        self.words
            .iter()
            .map(|w| u64::from(w.load(Ordering::Relaxed).count_ones()))
            .sum()
    }

    /// Maximum-likelihood estimate of the distinct fingerprints inserted,
    /// given `ones` set bits:
    ///
    /// `n = ln(1 - ones/M) / (k * ln(1 - 1/M))`
    pub fn estimate_cardinality(&self, ones: u64) -> Result<u64, FilterError> {
        if ones >= self.size_bits {
            return Err(FilterError::Saturated {
                bits: self.size_bits,
            });
        }
        let dividend = (1.0 - ones as f64 / self.size_bits as f64).ln();
        Ok((dividend / self.ln_divisor) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha8Rng;
    use rand_core::{RngCore, SeedableRng};

    #[test]
    fn rejects_invalid_parameters() {
        assert!(matches!(
            LogicStateFilter::new(0, 4),
            Err(FilterError::InvalidSize(0))
        ));
        assert!(matches!(
            LogicStateFilter::new(12, 4),
            Err(FilterError::InvalidSize(12))
        ));
        assert!(matches!(
            LogicStateFilter::new(64, 0),
            Err(FilterError::NoHashes)
        ));
    }

    #[test]
    fn empty_filter_estimates_zero() {
        let filter = LogicStateFilter::new(1 << 10, 4).unwrap();
        assert_eq!(filter.population_count(), 0);
        assert_eq!(filter.estimate_cardinality(0).unwrap(), 0);
    }

    #[test]
    fn insert_is_idempotent() {
        let filter = LogicStateFilter::new(1 << 10, 4).unwrap();
        let state: Vec<u8> = (0..64u8).collect();

        filter.insert(&state).unwrap();
        let after_first = filter.population_count();
        assert!(after_first > 0, "insert must set at least one bit");

        filter.insert(&state).unwrap();
        assert_eq!(
            filter.population_count(),
            after_first,
            "re-inserting the same fingerprint must not change the population"
        );
    }

    #[test]
    fn estimate_tracks_distinct_inserts_within_tolerance() {
        // M = 2^20 bits, k = 4, n = 1000: load is low enough that the
        // estimator should land within +-10% of the truth.
        let filter = LogicStateFilter::new((1 << 20) / 8, 4).unwrap();
        let mut rng = ChaCha8Rng::from_seed([7u8; 32]);

        let mut state = [0u8; 64];
        for _ in 0..1000 {
            rng.fill_bytes(&mut state);
            filter.insert(&state).unwrap();
        }

        let ones = filter.population_count();
        let estimate = filter.estimate_cardinality(ones).unwrap();
        assert!(
            (900..=1100).contains(&estimate),
            "estimate {estimate} outside +-10% of 1000 (ones: {ones})"
        );
    }

    #[test]
    fn saturated_filter_is_reported_not_propagated_as_infinity() {
        let filter = LogicStateFilter::new(8, 2).unwrap();
        match filter.estimate_cardinality(filter.size_bits()) {
            Err(FilterError::Saturated { bits }) => assert_eq!(bits, 64),
            other => panic!("expected Saturated, got {other:?}"),
        }
        // One bit shy of saturation must still produce a finite estimate.
        assert!(filter.estimate_cardinality(63).is_ok());
    }

    #[test]
    fn estimate_is_monotonic_in_set_bits() {
        let filter = LogicStateFilter::new(1 << 10, 4).unwrap();
        let mut last = 0;
        for ones in [0u64, 10, 100, 1000, 4000] {
            let estimate = filter.estimate_cardinality(ones).unwrap();
            assert!(
                estimate >= last,
                "estimate must not decrease as bits fill in ({ones} ones)"
            );
            last = estimate;
        }
    }
}
