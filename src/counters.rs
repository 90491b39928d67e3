//! Counter bundles and the delta/merge arithmetic used by the
//! accounting protocol.
//!
//! The host hands us cumulative counters that never go backwards for
//! the lifetime of the object. The engine only ever stores the
//! increments it attributed to a given (object, caller) pair.

use serde::Serialize;
use tracing::{event, Level};

/// Per-procedure counters. Times are in microseconds.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct FunctionCounters {
    pub calls: u64,
    pub total_time: u64,
    pub self_time: u64,
}

/// Counters maintained on the relation itself.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct ScanCounters {
    pub scans: u64,
    pub tuples_returned: u64,
    pub tuples_fetched: u64,
    pub blocks_fetched: u64,
    pub blocks_hit: u64,
}

/// Counters kept in the host's per-transaction bundle.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct MutationCounters {
    pub tuples_inserted: u64,
    pub tuples_updated: u64,
    pub tuples_deleted: u64,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct RelationCounters {
    pub scan: ScanCounters,
    pub mutation: MutationCounters,
}

/// Accumulated totals of a usage record.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum UsageCounters {
    Procedure(FunctionCounters),
    Relation(RelationCounters),
}

/// What the host reports for an object at a given moment.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RawCounterSnapshot {
    Procedure(FunctionCounters),
    Relation {
        scan: ScanCounters,
        mutation: Option<MutationCounters>,
    },
}

/// Increment between two readings of a cumulative counter.
///
/// A reading below the baseline means the host restarted the counter,
/// in which case everything in the current reading is new.
fn counter_delta(name: &str, current: u64, baseline: u64) -> u64 {
    if current >= baseline {
        current - baseline
    } else {
        event!(
            Level::WARN,
            "Counter {} went backwards ({} -> {}), treating it as restarted.",
            name,
            baseline,
            current
        );
        current
    }
}

impl FunctionCounters {
    pub fn delta_since(&self, baseline: &FunctionCounters) -> FunctionCounters {
        FunctionCounters {
            calls: counter_delta("calls", self.calls, baseline.calls),
            total_time: counter_delta("total_time", self.total_time, baseline.total_time),
            self_time: counter_delta("self_time", self.self_time, baseline.self_time),
        }
    }

    pub fn merge(&mut self, delta: &FunctionCounters) {
        self.calls += delta.calls;
        self.total_time += delta.total_time;
        self.self_time += delta.self_time;
    }

    pub fn is_zero(&self) -> bool {
        *self == FunctionCounters::default()
    }
}

impl ScanCounters {
    pub fn delta_since(&self, baseline: &ScanCounters) -> ScanCounters {
        ScanCounters {
            scans: counter_delta("scans", self.scans, baseline.scans),
            tuples_returned: counter_delta(
                "tuples_returned",
                self.tuples_returned,
                baseline.tuples_returned,
            ),
            tuples_fetched: counter_delta(
                "tuples_fetched",
                self.tuples_fetched,
                baseline.tuples_fetched,
            ),
            blocks_fetched: counter_delta(
                "blocks_fetched",
                self.blocks_fetched,
                baseline.blocks_fetched,
            ),
            blocks_hit: counter_delta("blocks_hit", self.blocks_hit, baseline.blocks_hit),
        }
    }

    pub fn merge(&mut self, delta: &ScanCounters) {
        self.scans += delta.scans;
        self.tuples_returned += delta.tuples_returned;
        self.tuples_fetched += delta.tuples_fetched;
        self.blocks_fetched += delta.blocks_fetched;
        self.blocks_hit += delta.blocks_hit;
    }
}

impl MutationCounters {
    pub fn delta_since(&self, baseline: &MutationCounters) -> MutationCounters {
        MutationCounters {
            tuples_inserted: counter_delta(
                "tuples_inserted",
                self.tuples_inserted,
                baseline.tuples_inserted,
            ),
            tuples_updated: counter_delta(
                "tuples_updated",
                self.tuples_updated,
                baseline.tuples_updated,
            ),
            tuples_deleted: counter_delta(
                "tuples_deleted",
                self.tuples_deleted,
                baseline.tuples_deleted,
            ),
        }
    }

    pub fn merge(&mut self, delta: &MutationCounters) {
        self.tuples_inserted += delta.tuples_inserted;
        self.tuples_updated += delta.tuples_updated;
        self.tuples_deleted += delta.tuples_deleted;
    }
}

impl RelationCounters {
    pub fn merge(&mut self, delta: &RelationCounters) {
        self.scan.merge(&delta.scan);
        self.mutation.merge(&delta.mutation);
    }

    pub fn is_zero(&self) -> bool {
        *self == RelationCounters::default()
    }
}

impl UsageCounters {
    /// Zeroed counters of the same kind.
    pub fn zeroed(&self) -> UsageCounters {
        match self {
            UsageCounters::Procedure(_) => UsageCounters::Procedure(FunctionCounters::default()),
            UsageCounters::Relation(_) => UsageCounters::Relation(RelationCounters::default()),
        }
    }

    pub fn is_zero(&self) -> bool {
        match self {
            UsageCounters::Procedure(c) => c.is_zero(),
            UsageCounters::Relation(c) => c.is_zero(),
        }
    }
}

/// Last observed host counters of one relation. The scan and mutation
/// streams are tracked independently since the mutation bundle comes
/// and goes with the host's transactions. A bundle seen after a reading
/// without one belongs to a new transaction and counts from zero.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RelationObservation {
    pub scan: ScanCounters,
    pub mutation: Option<MutationCounters>,
}

impl RelationObservation {
    /// Computes the increment since `self` and moves the observation
    /// forward to the new reading.
    pub fn advance(
        &mut self,
        scan: &ScanCounters,
        mutation: Option<&MutationCounters>,
    ) -> RelationCounters {
        let scan_delta = scan.delta_since(&self.scan);
        self.scan = *scan;

        let mutation_delta = match (mutation, self.mutation.as_ref()) {
            (Some(current), Some(previous)) => current.delta_since(previous),
            // A fresh bundle started counting from zero.
            (Some(current), None) => *current,
            (None, _) => MutationCounters::default(),
        };
        self.mutation = mutation.copied();

        RelationCounters {
            scan: scan_delta,
            mutation: mutation_delta,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        FunctionCounters, MutationCounters, RelationCounters, RelationObservation, ScanCounters,
        UsageCounters,
    };

    #[test]
    fn test_function_delta_and_merge() {
        let baseline = FunctionCounters {
            calls: 10,
            total_time: 1_000,
            self_time: 400,
        };
        let current = FunctionCounters {
            calls: 13,
            total_time: 1_750,
            self_time: 500,
        };
        let delta = current.delta_since(&baseline);
        assert_eq!(
            delta,
            FunctionCounters {
                calls: 3,
                total_time: 750,
                self_time: 100,
            }
        );

        let mut totals = FunctionCounters::default();
        totals.merge(&delta);
        totals.merge(&delta);
        assert_eq!(totals.calls, 6);
        assert_eq!(totals.total_time, 1_500);
    }

    #[test]
    fn test_restarted_counter() {
        let baseline = MutationCounters {
            tuples_inserted: 50,
            tuples_updated: 0,
            tuples_deleted: 0,
        };
        let current = MutationCounters {
            tuples_inserted: 4,
            tuples_updated: 1,
            tuples_deleted: 0,
        };
        let delta = current.delta_since(&baseline);
        assert_eq!(delta.tuples_inserted, 4);
        assert_eq!(delta.tuples_updated, 1);
    }

    #[test]
    fn test_observation_streams_are_independent() {
        let mut observation = RelationObservation::default();
        let scan = ScanCounters {
            scans: 2,
            tuples_returned: 20,
            ..Default::default()
        };

        // No transaction bundle yet: only scans move.
        let delta = observation.advance(&scan, None);
        assert_eq!(delta.scan.scans, 2);
        assert_eq!(delta.mutation, MutationCounters::default());
        assert_eq!(observation.mutation, None);

        let mutation = MutationCounters {
            tuples_inserted: 3,
            ..Default::default()
        };
        let delta = observation.advance(&scan, Some(&mutation));
        assert_eq!(delta.scan, ScanCounters::default());
        assert_eq!(delta.mutation.tuples_inserted, 3);

        let mutation = MutationCounters {
            tuples_inserted: 5,
            tuples_deleted: 1,
            ..Default::default()
        };
        let delta = observation.advance(&scan, Some(&mutation));
        assert_eq!(delta.mutation.tuples_inserted, 2);
        assert_eq!(delta.mutation.tuples_deleted, 1);
    }

    #[test]
    fn test_bundle_after_transaction_end_counts_from_zero() {
        let mut observation = RelationObservation::default();
        let scan = ScanCounters::default();
        let first = MutationCounters {
            tuples_inserted: 3,
            ..Default::default()
        };
        assert_eq!(
            observation.advance(&scan, Some(&first)).mutation.tuples_inserted,
            3
        );

        // The transaction ended and took its bundle along.
        let delta = observation.advance(&scan, None);
        assert_eq!(delta.mutation, MutationCounters::default());
        assert_eq!(observation.mutation, None);

        let second = MutationCounters {
            tuples_inserted: 5,
            ..Default::default()
        };
        assert_eq!(
            observation.advance(&scan, Some(&second)).mutation.tuples_inserted,
            5
        );
    }

    #[test]
    fn test_zeroed_keeps_kind() {
        let mut relation = RelationCounters::default();
        relation.scan.scans = 7;
        let counters = UsageCounters::Relation(relation);
        assert!(!counters.is_zero());
        let zeroed = counters.zeroed();
        assert!(zeroed.is_zero());
        assert!(matches!(zeroed, UsageCounters::Relation(_)));
    }
}
