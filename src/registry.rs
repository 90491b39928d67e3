//! This module contains the structure that accumulates usage data
//! per (object, caller) pair for the lifetime of the engine.
//!
//! Records are created lazily on the first activation of a key and are
//! never removed. Resetting or a clearing report only zeroes them.
//!

use crate::counters::{FunctionCounters, RelationCounters, UsageCounters};
use crate::error::UsageError;
use crate::host::{Catalog, ObjectDetail};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use tracing::{event, Level};

/// Host object identifier.
pub type Oid = u32;

/// Caller id of objects touched outside of any procedure.
pub const INVALID_OID: Oid = 0;

/// Ids below this belong to the host's own system objects.
pub const FIRST_NORMAL_OBJECT_ID: Oid = 16384;

/// Storage subtype of a relation. Accounting treats them all alike.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
pub enum RelationKind {
    Table,
    Index,
    Sequence,
    Toast,
    View,
    MaterializedView,
    CompositeType,
    ForeignTable,
    PartitionedTable,
    PartitionedIndex,
}

impl RelationKind {
    pub fn code(&self) -> char {
        match self {
            RelationKind::Table => 'r',
            RelationKind::Index => 'i',
            RelationKind::Sequence => 'S',
            RelationKind::Toast => 't',
            RelationKind::View => 'v',
            RelationKind::MaterializedView => 'm',
            RelationKind::CompositeType => 'c',
            RelationKind::ForeignTable => 'f',
            RelationKind::PartitionedTable => 'p',
            RelationKind::PartitionedIndex => 'I',
        }
    }

    pub fn from_code(code: char) -> Option<RelationKind> {
        match code {
            'r' => Some(RelationKind::Table),
            'i' => Some(RelationKind::Index),
            'S' => Some(RelationKind::Sequence),
            't' => Some(RelationKind::Toast),
            'v' => Some(RelationKind::View),
            'm' => Some(RelationKind::MaterializedView),
            'c' => Some(RelationKind::CompositeType),
            'f' => Some(RelationKind::ForeignTable),
            'p' => Some(RelationKind::PartitionedTable),
            'I' => Some(RelationKind::PartitionedIndex),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
pub enum ObjectKind {
    Procedure,
    Relation(RelationKind),
}

impl ObjectKind {
    /// Value of the `object_type` column: "F" for procedures, the
    /// relkind code for relations.
    pub fn type_code(&self) -> String {
        match self {
            ObjectKind::Procedure => "F".to_string(),
            ObjectKind::Relation(kind) => kind.code().to_string(),
        }
    }

    pub fn is_procedure(&self) -> bool {
        matches!(self, ObjectKind::Procedure)
    }

    fn zero_counters(&self) -> UsageCounters {
        match self {
            ObjectKind::Procedure => UsageCounters::Procedure(FunctionCounters::default()),
            ObjectKind::Relation(_) => UsageCounters::Relation(RelationCounters::default()),
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ObjectKind::Procedure => write!(f, "function"),
            ObjectKind::Relation(_) => write!(f, "relation"),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct ObjectKey {
    pub object_id: Oid,
    pub caller_id: Oid,
}

impl ObjectKey {
    pub fn new(object_id: Oid, caller_id: Oid) -> Self {
        ObjectKey {
            object_id,
            caller_id,
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "object {} called from {}", self.object_id, self.caller_id)
    }
}

/// Accumulated usage of one object under one caller.
#[derive(Clone, Debug)]
pub struct UsageRecord {
    pub key: ObjectKey,
    pub kind: ObjectKind,
    pub schema_name: Option<String>,
    pub object_name: Option<String>,
    /// Only known for procedures.
    pub arg_count: Option<u16>,
    pub counters: UsageCounters,
    /// Host counters captured at activation. Scratch state, never reported.
    pub baseline: FunctionCounters,
    pub has_baseline: bool,
    /// Usage accrued up to a non-final exit, merged at the final one.
    pub pending: Option<FunctionCounters>,
}

impl UsageRecord {
    fn new(key: ObjectKey, kind: ObjectKind) -> Self {
        UsageRecord {
            key,
            kind,
            schema_name: None,
            object_name: None,
            arg_count: None,
            counters: kind.zero_counters(),
            baseline: FunctionCounters::default(),
            has_baseline: false,
            pending: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_zero()
    }

    /// Zeroes the accumulated totals. Names and kind are kept.
    pub fn clear(&mut self) {
        self.counters = self.counters.zeroed();
    }

    /// `schema.name` for log lines, with placeholders for unresolved parts.
    pub fn display_name(&self) -> String {
        format!(
            "{}.{}",
            self.schema_name.as_deref().unwrap_or("?"),
            self.object_name.as_deref().unwrap_or("?")
        )
    }
}

/// Checks the catalog's answer against the kind the host claimed and
/// returns the authoritative kind.
fn classify(object_id: Oid, requested: ObjectKind, detail: &ObjectDetail) -> Result<ObjectKind, UsageError> {
    match (requested, detail) {
        (ObjectKind::Procedure, ObjectDetail::Procedure { .. }) => Ok(ObjectKind::Procedure),
        (ObjectKind::Relation(kind), ObjectDetail::Relation { relkind }) => {
            match RelationKind::from_code(*relkind) {
                Some(resolved) if resolved == kind => Ok(ObjectKind::Relation(resolved)),
                Some(resolved) => Err(UsageError::UnknownKind {
                    object_id,
                    detail: format!(
                        "activated as relkind '{}' but catalog says '{}'",
                        kind.code(),
                        resolved.code()
                    ),
                }),
                None => Err(UsageError::UnknownKind {
                    object_id,
                    detail: format!("unknown relkind '{}'", relkind),
                }),
            }
        }
        (requested, _) => Err(UsageError::UnknownKind {
            object_id,
            detail: format!("activated as {} but catalog disagrees", requested),
        }),
    }
}

#[derive(Default)]
pub struct Registry {
    records: HashMap<ObjectKey, UsageRecord>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
        }
    }

    /// Returns the record for `key`, creating it on first sight.
    ///
    /// Creation resolves the object's names through the catalog exactly
    /// once. If resolution fails nothing is inserted, so a later
    /// activation of the same key tries again from scratch.
    pub fn get_or_create(
        &mut self,
        key: ObjectKey,
        kind: ObjectKind,
        catalog: &dyn Catalog,
    ) -> Result<&mut UsageRecord, UsageError> {
        if !self.records.contains_key(&key) {
            let metadata = catalog.resolve_object_metadata(key.object_id, &kind)?;
            let kind = classify(key.object_id, kind, &metadata.detail)?;

            let mut record = UsageRecord::new(key, kind);
            record.schema_name = Some(metadata.schema_name);
            record.object_name = Some(metadata.object_name);
            if let ObjectDetail::Procedure { arg_count } = metadata.detail {
                record.arg_count = Some(arg_count);
            }
            event!(
                Level::DEBUG,
                "New usage record {} oid={} caller={}",
                record.display_name(),
                key.object_id,
                key.caller_id
            );
            self.records.insert(key, record);
        }

        let record = self
            .records
            .get_mut(&key)
            .ok_or(UsageError::RegistryRecordMissing { key })?;
        if record.kind.is_procedure() != kind.is_procedure() {
            return Err(UsageError::UnknownKind {
                object_id: key.object_id,
                detail: format!("already tracked as a {}", record.kind),
            });
        }
        Ok(record)
    }

    pub fn find(&mut self, key: &ObjectKey) -> Option<&mut UsageRecord> {
        self.records.get_mut(key)
    }

    pub fn get(&self, key: &ObjectKey) -> Option<&UsageRecord> {
        self.records.get(key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut UsageRecord> {
        self.records.values_mut()
    }

    /// Keys in (object, caller) order, for stable output.
    pub fn sorted_keys(&self) -> Vec<ObjectKey> {
        let mut keys: Vec<ObjectKey> = self.records.keys().copied().collect();
        keys.sort();
        keys
    }
}
