//! Page diff segmentation for update records.

use crate::error::{AriesError, Result};

/// Longest run of identical bytes absorbed into a differing segment.
pub const MAX_ABSORBED_GAP: usize = 4;

/// Computes the `(offset, length)` windows covering every byte that
/// differs between `old` and `new`.
///
/// The scan is greedy and single pass: identical runs are skipped, and a
/// differing window keeps growing across identical gaps of at most
/// [`MAX_ABSORBED_GAP`] bytes. A longer gap, or the end of the data,
/// closes the window. Windows never end on an identical byte.
///
/// # Errors
///
/// Returns [`AriesError::InvalidArgument`] if the slices differ in length.
pub fn compute_segments(old: &[u8], new: &[u8]) -> Result<Vec<(usize, usize)>> {
    if old.len() != new.len() {
        return Err(AriesError::InvalidArgument(format!(
            "Page images differ in length ({} vs {})",
            old.len(),
            new.len()
        )));
    }

    let len = old.len();
    let mut segments = Vec::new();
    let mut i = 0;

    while i < len {
        if old[i] == new[i] {
            i += 1;
            continue;
        }

        let start = i;
        let mut end = i + 1; // exclusive end of the last differing byte
        i += 1;

        while i < len {
            if old[i] != new[i] {
                i += 1;
                end = i;
                continue;
            }

            let gap_start = i;
            while i < len && old[i] == new[i] && i - gap_start <= MAX_ABSORBED_GAP {
                i += 1;
            }
            if i >= len || i - gap_start > MAX_ABSORBED_GAP {
                break;
            }
        }

        segments.push((start, end - start));
    }

    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn apply_segments(target: &mut [u8], new: &[u8], segments: &[(usize, usize)]) {
        for &(offset, len) in segments {
            target[offset..offset + len].copy_from_slice(&new[offset..offset + len]);
        }
    }

    #[test]
    fn test_identical_is_empty() {
        let data = [7u8; 64];
        assert!(compute_segments(&data, &data).unwrap().is_empty());
    }

    #[test]
    fn test_single_byte() {
        let old = [0u8; 32];
        let mut new = old;
        new[10] = 0xFF;
        assert_eq!(compute_segments(&old, &new).unwrap(), vec![(10, 1)]);
    }

    #[test]
    fn test_small_gap_absorbed() {
        let old = [0u8; 32];
        let mut new = old;
        new[2] = 1;
        new[7] = 1; // gap of 4 identical bytes (3..7)
        assert_eq!(compute_segments(&old, &new).unwrap(), vec![(2, 6)]);
    }

    #[test]
    fn test_large_gap_splits() {
        let old = [0u8; 32];
        let mut new = old;
        new[2] = 1;
        new[8] = 1; // gap of 5 identical bytes (3..8)
        assert_eq!(compute_segments(&old, &new).unwrap(), vec![(2, 1), (8, 1)]);
    }

    #[test]
    fn test_gap_at_page_end() {
        let old = [0u8; 8];
        let mut new = old;
        new[5] = 1;
        assert_eq!(compute_segments(&old, &new).unwrap(), vec![(5, 1)]);
    }

    #[test]
    fn test_whole_page() {
        let old = [0u8; 16];
        let new = [1u8; 16];
        assert_eq!(compute_segments(&old, &new).unwrap(), vec![(0, 16)]);
    }

    #[test]
    fn test_length_mismatch() {
        assert!(matches!(
            compute_segments(&[0; 4], &[0; 5]),
            Err(AriesError::InvalidArgument(_))
        ));
    }

    fn image_pair() -> impl Strategy<Value = (Vec<u8>, Vec<u8>)> {
        prop::collection::vec(any::<u8>(), 1..512).prop_flat_map(|old| {
            let len = old.len();
            (
                Just(old),
                prop::collection::vec(prop::option::weighted(0.2, any::<u8>()), len),
            )
                .prop_map(|(old, edits)| {
                    let new = old
                        .iter()
                        .zip(edits)
                        .map(|(&o, e)| e.unwrap_or(o))
                        .collect();
                    (old, new)
                })
        })
    }

    proptest! {
        #[test]
        fn prop_segments_reconstruct_new((old, new) in image_pair()) {
            let segments = compute_segments(&old, &new).unwrap();
            let mut rebuilt = old.clone();
            apply_segments(&mut rebuilt, &new, &segments);
            prop_assert_eq!(rebuilt, new);
        }

        #[test]
        fn prop_segments_deterministic((old, new) in image_pair()) {
            prop_assert_eq!(
                compute_segments(&old, &new).unwrap(),
                compute_segments(&old, &new).unwrap()
            );
        }

        #[test]
        fn prop_segments_ordered_and_tight((old, new) in image_pair()) {
            let segments = compute_segments(&old, &new).unwrap();
            let mut prev_end = 0;
            for (i, &(offset, len)) in segments.iter().enumerate() {
                prop_assert!(len > 0);
                prop_assert!(i == 0 || offset > prev_end + MAX_ABSORBED_GAP);
                prop_assert_ne!(old[offset], new[offset]);
                prop_assert_ne!(old[offset + len - 1], new[offset + len - 1]);
                prev_end = offset + len;
            }
        }
    }
}
