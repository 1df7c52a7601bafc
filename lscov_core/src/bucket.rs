/// Reduces an exact per-edge visit count to its magnitude bucket.
///
/// Zero stays zero; any nonzero count maps to the largest power of two at or
/// below it, so every nonzero bucket value has exactly one bit set. Counts
/// beyond a coarse order of magnitude carry noise, not signal, and one-hot
/// buckets can later be combined bitwise without overflow concerns.
#[inline(always)]
pub fn bucketize(count: u8) -> u8 {
    match count {
        0 => 0,
        1 => 1,
        2..=3 => 2,
        4..=7 => 4,
        8..=15 => 8,
        16..=31 => 16,
        32..=63 => 32,
        64..=127 => 64,
        128..=255 => 128,
    }
}

/// Turns a raw hit-count buffer into a logic state by bucketing every byte.
///
/// Holds a 65536-entry table that buckets two adjacent bytes per lookup, and
/// skips 8-byte spans that are entirely zero. Hit-count buffers are sparse in
/// practice, so most of the work is the zero-span test. The output is
/// byte-for-byte identical to applying [`bucketize`] individually.
pub struct Bucketizer {
    pair_table: Vec<u16>,
}

impl Bucketizer {
    pub fn new() -> Self {
        let mut pair_table = vec![0u16; 1 << 16];
        for hi in 0..=255u8 {
            for lo in 0..=255u8 {
                let idx = u16::from_le_bytes([lo, hi]);
                pair_table[idx as usize] = u16::from_le_bytes([bucketize(lo), bucketize(hi)]);
            }
        }
        Self { pair_table }
    }

    /// Bucketizes `hit_counts` into `state`. Both slices must have the same
    /// length.
    pub fn classify(&self, hit_counts: &[u8], state: &mut [u8]) {
        assert_eq!(
            hit_counts.len(),
            state.len(),
            "hit-count buffer and logic state must have the same length"
        );

        let mut src = hit_counts.chunks_exact(8);
        let mut dst = state.chunks_exact_mut(8);
        for (s, d) in (&mut src).zip(&mut dst) {
            let word = u64::from_ne_bytes(s.try_into().unwrap());
            if word == 0 {
                d.fill(0);
                continue;
            }
            for (sp, dp) in s.chunks_exact(2).zip(d.chunks_exact_mut(2)) {
                let pair = u16::from_le_bytes([sp[0], sp[1]]);
                dp.copy_from_slice(&self.pair_table[pair as usize].to_le_bytes());
            }
        }

        // Tail shorter than a word, bucketed byte by byte.
        for (s, d) in src.remainder().iter().zip(dst.into_remainder()) {
            *d = bucketize(*s);
        }
    }
}

impl Default for Bucketizer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucketize_zero_is_zero() {
        assert_eq!(bucketize(0), 0);
    }

    #[test]
    fn bucketize_is_one_hot_and_bounded() {
        for x in 1..=255u8 {
            let bucket = bucketize(x);
            assert_eq!(
                bucket.count_ones(),
                1,
                "bucket for {x} must have exactly one bit set, got {bucket:#010b}"
            );
            assert!(bucket <= x, "bucket {bucket} must not exceed count {x}");
            assert!(
                (x as u16) < (bucket as u16) * 2,
                "count {x} must fall below twice its bucket {bucket}"
            );
        }
    }

    #[test]
    fn classify_matches_bytewise_definition() {
        let bucketizer = Bucketizer::new();
        let mut hits = vec![0u8; 256];
        for (i, byte) in hits.iter_mut().enumerate() {
            // Mix of zero spans, small counts, and saturated counts.
            *byte = match i % 16 {
                0..=7 => 0,
                8 => 1,
                9 => 3,
                10 => 17,
                11 => 255,
                _ => (i % 256) as u8,
            };
        }

        let mut state = vec![0xAAu8; hits.len()];
        bucketizer.classify(&hits, &mut state);

        let expected: Vec<u8> = hits.iter().map(|&b| bucketize(b)).collect();
        assert_eq!(state, expected);
    }

    #[test]
    fn classify_overwrites_stale_state_on_zero_spans() {
        let bucketizer = Bucketizer::new();
        let hits = vec![0u8; 64];
        let mut state = vec![0xFFu8; 64];
        bucketizer.classify(&hits, &mut state);
        assert!(
            state.iter().all(|&b| b == 0),
            "all-zero hit counts must clear previous state contents"
        );
    }

    #[test]
    fn classify_handles_length_not_divisible_by_word() {
        let bucketizer = Bucketizer::new();
        let hits: Vec<u8> = (0..13u8).collect();
        let mut state = vec![0u8; 13];
        bucketizer.classify(&hits, &mut state);
        let expected: Vec<u8> = hits.iter().map(|&b| bucketize(b)).collect();
        assert_eq!(state, expected);
    }

    #[test]
    #[should_panic(expected = "same length")]
    fn classify_rejects_mismatched_lengths() {
        let bucketizer = Bucketizer::new();
        let hits = vec![0u8; 16];
        let mut state = vec![0u8; 8];
        bucketizer.classify(&hits, &mut state);
    }
}
