//! Half-open interval math over the 32-bit sequence axis.

use std::cmp::Ordering;

/// Merge overlapping or adjacent half-open intervals.
///
/// Returns a start-sorted list of disjoint, non-adjacent intervals covering
/// the same byte positions. Applying it to its own output is a no-op.
pub fn merge_intervals(mut ranges: Vec<(u32, u32)>) -> Vec<(u32, u32)> {
    ranges.retain(|&(start, end)| start < end);
    ranges.sort_unstable();
    let mut merged: Vec<(u32, u32)> = Vec::with_capacity(ranges.len());
    for (start, end) in ranges {
        match merged.last_mut() {
            Some(&mut (_, ref mut last_end)) if start <= *last_end => {
                if end > *last_end {
                    *last_end = end;
                }
            }
            _ => merged.push((start, end)),
        }
    }
    merged
}

/// All intervals of a merged, start-sorted list that intersect
/// `[seg_start, seg_end)`.
///
/// Requires the invariants produced by [`merge_intervals`]; both bounds are
/// located by binary search, so a lookup is logarithmic in the number of
/// ranges plus the size of the returned slice.
pub fn overlapping(ranges: &[(u32, u32)], seg_start: u32, seg_end: u32) -> &[(u32, u32)] {
    if seg_start >= seg_end {
        return &[];
    }
    // First range ending after seg_start.
    let lo = match ranges.binary_search_by(|&(_, end)| {
        if end <= seg_start {
            Ordering::Less
        } else {
            Ordering::Greater
        }
    }) {
        Ok(i) | Err(i) => i,
    };
    // First range starting at or past seg_end.
    let hi = match ranges.binary_search_by(|&(start, _)| {
        if start < seg_end {
            Ordering::Less
        } else {
            Ordering::Greater
        }
    }) {
        Ok(i) | Err(i) => i,
    };
    if lo >= hi {
        &[]
    } else {
        &ranges[lo..hi]
    }
}

/// Intersection of a single interval with `[seg_start, seg_end)`, if any.
pub fn clamp(range: (u32, u32), seg_start: u32, seg_end: u32) -> Option<(u32, u32)> {
    let start = range.0.max(seg_start);
    let end = range.1.min(seg_end);
    if start < end {
        Some((start, end))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn merge_coalesces_overlap_and_adjacency() {
        let merged = merge_intervals(vec![(10, 20), (15, 25), (25, 30), (40, 50)]);
        assert_eq!(merged, vec![(10, 30), (40, 50)]);
    }

    #[test]
    fn merge_drops_degenerate_ranges() {
        let merged = merge_intervals(vec![(10, 10), (20, 15), (5, 6)]);
        assert_eq!(merged, vec![(5, 6)]);
    }

    #[test]
    fn merge_is_idempotent() {
        let once = merge_intervals(vec![(0, 5), (3, 9), (9, 12), (100, 120)]);
        let twice = merge_intervals(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn overlap_hits_exact_boundaries() {
        let ranges = vec![(10, 20), (30, 40), (50, 60)];
        // Touching at the end is not an overlap: [20, 30) misses [10, 20).
        assert_eq!(overlapping(&ranges, 20, 30), &[] as &[(u32, u32)]);
        assert_eq!(overlapping(&ranges, 19, 30), &[(10, 20)]);
        assert_eq!(overlapping(&ranges, 20, 31), &[(30, 40)]);
        assert_eq!(overlapping(&ranges, 15, 55), &[(10, 20), (30, 40), (50, 60)]);
    }

    #[test]
    fn overlap_of_empty_segment_is_empty() {
        let ranges = vec![(10, 20)];
        assert_eq!(overlapping(&ranges, 15, 15), &[] as &[(u32, u32)]);
    }

    #[test]
    fn clamp_trims_to_segment() {
        assert_eq!(clamp((10, 20), 15, 30), Some((15, 20)));
        assert_eq!(clamp((10, 20), 0, 12), Some((10, 12)));
        assert_eq!(clamp((10, 20), 20, 30), None);
    }
}
