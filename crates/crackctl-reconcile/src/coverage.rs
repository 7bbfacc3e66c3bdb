//! Keyspace interval arithmetic over chunk ranges.

use crackctl_core::types::KeyRange;

/// Sorted, disjoint union of `ranges`. Touching ranges are merged.
pub fn union(ranges: impl IntoIterator<Item = KeyRange>) -> Vec<KeyRange> {
    let mut sorted: Vec<KeyRange> = ranges.into_iter().filter(|r| !r.is_empty()).collect();
    sorted.sort();

    let mut out: Vec<KeyRange> = Vec::with_capacity(sorted.len());
    for r in sorted {
        match out.last_mut() {
            Some(last) if r.start <= last.end => last.end = last.end.max(r.end),
            _ => out.push(r),
        }
    }
    out
}

/// Parts of `full` not covered by `covered` (which must come from [`union`]).
pub fn uncovered(full: KeyRange, covered: &[KeyRange]) -> Vec<KeyRange> {
    let mut gaps = Vec::new();
    let mut cursor = full.start;
    for r in covered {
        if r.end <= cursor {
            continue;
        }
        if r.start >= full.end {
            break;
        }
        if r.start > cursor {
            gaps.push(KeyRange::new(cursor, r.start.min(full.end)));
        }
        cursor = cursor.max(r.end);
        if cursor >= full.end {
            break;
        }
    }
    if cursor < full.end {
        gaps.push(KeyRange::new(cursor, full.end));
    }
    gaps
}

pub fn covers(full: KeyRange, covered: &[KeyRange]) -> bool {
    uncovered(full, covered).is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(start: u64, end: u64) -> KeyRange {
        KeyRange::new(start, end)
    }

    #[test]
    fn union_merges_overlapping_and_touching() {
        let merged = union([r(50, 100), r(0, 10), r(10, 20), r(90, 120), r(5, 5)]);
        assert_eq!(merged, vec![r(0, 20), r(50, 120)]);
    }

    #[test]
    fn uncovered_reports_every_gap() {
        let covered = union([r(10, 20), r(30, 40)]);
        assert_eq!(
            uncovered(r(0, 50), &covered),
            vec![r(0, 10), r(20, 30), r(40, 50)]
        );
        assert!(covers(r(12, 18), &covered));
        assert!(!covers(r(15, 35), &covered));
    }

    #[test]
    fn empty_full_range_is_covered() {
        assert!(covers(r(7, 7), &[]));
        assert_eq!(uncovered(r(0, 3), &[]), vec![r(0, 3)]);
    }
}
