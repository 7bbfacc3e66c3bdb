use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::BatchSeq;

/// Priority the orchestration server writes onto a job when it finishes.
pub const COMPLETE_SENTINEL: u32 = 0;

pub const DEFAULT_PRIORITY_CEILING: u32 = 10_000;
pub const DEFAULT_PRIORITY_FLOOR: u32 = 1;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PriorityPolicyError {
    #[error("priority floor {floor} must be above the complete sentinel {sentinel}")]
    FloorAtOrBelowSentinel { floor: u32, sentinel: u32 },
    #[error("priority ceiling {ceiling} must be above the floor {floor}")]
    CeilingAtOrBelowFloor { ceiling: u32, floor: u32 },
}

/// `priority = max(floor, ceiling - seq)`.
///
/// Older batches get higher priority. The floor sits strictly above the
/// sentinel so pending work can never look finished to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityPolicy {
    ceiling: u32,
    floor: u32,
    sentinel: u32,
}

impl Default for PriorityPolicy {
    fn default() -> Self {
        Self {
            ceiling: DEFAULT_PRIORITY_CEILING,
            floor: DEFAULT_PRIORITY_FLOOR,
            sentinel: COMPLETE_SENTINEL,
        }
    }
}

impl PriorityPolicy {
    pub fn new(ceiling: u32, floor: u32, sentinel: u32) -> Result<Self, PriorityPolicyError> {
        if floor <= sentinel {
            return Err(PriorityPolicyError::FloorAtOrBelowSentinel { floor, sentinel });
        }
        if ceiling <= floor {
            return Err(PriorityPolicyError::CeilingAtOrBelowFloor { ceiling, floor });
        }
        Ok(Self {
            ceiling,
            floor,
            sentinel,
        })
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    pub fn floor(&self) -> u32 {
        self.floor
    }

    pub fn sentinel(&self) -> u32 {
        self.sentinel
    }

    pub fn for_batch(&self, seq: BatchSeq) -> u32 {
        self.ceiling.saturating_sub(seq.0).max(self.floor)
    }

    /// Last sequence number that still gets a priority strictly above the floor.
    pub fn last_ordered_seq(&self) -> BatchSeq {
        BatchSeq(self.ceiling - self.floor - 1)
    }

    pub fn is_sentinel(&self, priority: u32) -> bool {
        priority == self.sentinel
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_batches_get_strictly_lower_priority() {
        let policy = PriorityPolicy::default();
        let p43 = policy.for_batch(BatchSeq(43));
        let p44 = policy.for_batch(BatchSeq(44));
        assert!(p44 < p43, "p44={p44} p43={p43}");
        assert_eq!(p43, 9_957);
    }

    #[test]
    fn priority_clamps_at_floor_and_never_hits_sentinel() {
        let policy = PriorityPolicy::new(100, 5, 0).unwrap();
        for seq in 0..500 {
            let p = policy.for_batch(BatchSeq(seq));
            assert!(p >= 5);
            assert!(!policy.is_sentinel(p));
        }
        assert_eq!(policy.for_batch(BatchSeq(u32::MAX)), 5);
    }

    #[test]
    fn ordering_is_strict_until_the_floor() {
        let policy = PriorityPolicy::new(50, 10, 0).unwrap();
        let last = policy.last_ordered_seq();
        for seq in 0..last.0 {
            assert!(policy.for_batch(BatchSeq(seq + 1)) < policy.for_batch(BatchSeq(seq)));
        }
        assert!(policy.for_batch(last) > policy.floor());
    }

    #[test]
    fn rejects_floor_on_sentinel() {
        let err = PriorityPolicy::new(100, 0, 0).unwrap_err();
        assert_eq!(
            err,
            PriorityPolicyError::FloorAtOrBelowSentinel {
                floor: 0,
                sentinel: 0
            }
        );
        assert!(PriorityPolicy::new(10, 10, 0).is_err());
    }
}
