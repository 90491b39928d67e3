//! Interfaces the engine needs from its host.
//!
//! The host owns the catalog and the live cumulative counters. Both are
//! read-only from the engine's point of view, and the catalog may only
//! be consulted while an activation is being processed.

use crate::counters::{FunctionCounters, RawCounterSnapshot};
use crate::error::UsageError;
use crate::registry::{ObjectKind, Oid};
#[cfg(test)]
use std::cell::RefCell;
#[cfg(test)]
use std::collections::HashMap;
#[cfg(test)]
use std::rc::Rc;

/// Kind specific catalog details.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ObjectDetail {
    Procedure { arg_count: u16 },
    Relation { relkind: char },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ObjectMetadata {
    pub schema_name: String,
    pub object_name: String,
    pub detail: ObjectDetail,
}

/// The host's view of an open relation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RelationHandle {
    pub relid: Oid,
    /// False when the host keeps no statistics for this relation.
    pub has_stats: bool,
}

impl RelationHandle {
    pub fn new(relid: Oid) -> Self {
        RelationHandle {
            relid,
            has_stats: true,
        }
    }
}

/// Name lookups. Fails with `UsageError::MetadataNotFound` for unknown ids.
pub trait Catalog {
    fn resolve_object_metadata(
        &self,
        object_id: Oid,
        kind: &ObjectKind,
    ) -> Result<ObjectMetadata, UsageError>;
}

/// Caller agnostic running totals maintained by the host.
pub trait CounterSource {
    fn function_counters(&self, object_id: Oid) -> FunctionCounters;

    /// Must return the `Relation` variant of the snapshot.
    fn relation_counters(&self, relation: &RelationHandle) -> RawCounterSnapshot;
}

impl<T: Catalog + ?Sized> Catalog for &T {
    fn resolve_object_metadata(
        &self,
        object_id: Oid,
        kind: &ObjectKind,
    ) -> Result<ObjectMetadata, UsageError> {
        (**self).resolve_object_metadata(object_id, kind)
    }
}

impl<T: CounterSource + ?Sized> CounterSource for &T {
    fn function_counters(&self, object_id: Oid) -> FunctionCounters {
        (**self).function_counters(object_id)
    }

    fn relation_counters(&self, relation: &RelationHandle) -> RawCounterSnapshot {
        (**self).relation_counters(relation)
    }
}

#[cfg(test)]
#[derive(Default)]
struct MockHostState {
    metadata: HashMap<Oid, ObjectMetadata>,
    functions: HashMap<Oid, FunctionCounters>,
    relations: HashMap<Oid, RawCounterSnapshot>,
    lookups: usize,
}

/// Test host with a shared, mutable catalog and counter set.
#[cfg(test)]
#[derive(Clone, Default)]
pub(crate) struct MockHost {
    state: Rc<RefCell<MockHostState>>,
}

#[cfg(test)]
impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_function(&self, object_id: Oid, schema: &str, name: &str, arg_count: u16) {
        self.state.borrow_mut().metadata.insert(
            object_id,
            ObjectMetadata {
                schema_name: schema.to_string(),
                object_name: name.to_string(),
                detail: ObjectDetail::Procedure { arg_count },
            },
        );
    }

    pub fn add_relation(&self, object_id: Oid, schema: &str, name: &str, relkind: char) {
        self.state.borrow_mut().metadata.insert(
            object_id,
            ObjectMetadata {
                schema_name: schema.to_string(),
                object_name: name.to_string(),
                detail: ObjectDetail::Relation { relkind },
            },
        );
    }

    pub fn set_function(&self, object_id: Oid, counters: FunctionCounters) {
        self.state
            .borrow_mut()
            .functions
            .insert(object_id, counters);
    }

    pub fn set_calls(&self, object_id: Oid, calls: u64) {
        self.set_function(
            object_id,
            FunctionCounters {
                calls,
                ..Default::default()
            },
        );
    }

    pub fn set_relation(&self, relid: Oid, snapshot: RawCounterSnapshot) {
        self.state.borrow_mut().relations.insert(relid, snapshot);
    }

    pub fn lookups(&self) -> usize {
        self.state.borrow().lookups
    }
}

#[cfg(test)]
impl Catalog for MockHost {
    fn resolve_object_metadata(
        &self,
        object_id: Oid,
        kind: &ObjectKind,
    ) -> Result<ObjectMetadata, UsageError> {
        let mut state = self.state.borrow_mut();
        state.lookups += 1;
        state
            .metadata
            .get(&object_id)
            .cloned()
            .ok_or(UsageError::MetadataNotFound {
                object_id,
                kind: *kind,
            })
    }
}

#[cfg(test)]
impl CounterSource for MockHost {
    fn function_counters(&self, object_id: Oid) -> FunctionCounters {
        self.state
            .borrow()
            .functions
            .get(&object_id)
            .copied()
            .unwrap_or_default()
    }

    fn relation_counters(&self, relation: &RelationHandle) -> RawCounterSnapshot {
        self.state
            .borrow()
            .relations
            .get(&relation.relid)
            .copied()
            .unwrap_or(RawCounterSnapshot::Relation {
                scan: Default::default(),
                mutation: None,
            })
    }
}
