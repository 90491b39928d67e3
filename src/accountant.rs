use crate::config::UsageConfig;
use crate::context::CallStack;
use crate::counters::{FunctionCounters, RawCounterSnapshot, RelationObservation, UsageCounters};
use crate::error::UsageError;
use crate::hooks::{HookError, StatHooks};
use crate::host::{Catalog, CounterSource, RelationHandle};
use crate::producer::{ClientError, KafkaConfig, KafkaProducer, Producer};
use crate::registry::{ObjectKey, ObjectKind, Oid, Registry, UsageRecord, FIRST_NORMAL_OBJECT_ID};
use crate::report::{self, UsageRow, UsageRows};
use chrono::{DateTime, Local};
use std::collections::HashMap;
use tracing::{event, Level};

/// Attribution state of one relation.
///
/// Relations are not diffed against a per-open baseline. Every open and
/// close observes the host counters and charges whatever moved since
/// the previous observation to the innermost open (object, caller) key.
struct RelationCursor {
    handle: RelationHandle,
    /// Unset until the first open with statistics.
    last_seen: Option<RelationObservation>,
    /// `None` marks an open of the relation without statistics.
    open: Vec<Option<ObjectKey>>,
    /// Key closed without finalizing; owns the next increment.
    lingering: Option<ObjectKey>,
}

impl RelationCursor {
    fn settle(
        &mut self,
        registry: &mut Registry,
        reading: RelationObservation,
    ) -> Result<(), UsageError> {
        let delta = match self.last_seen.as_mut() {
            Some(previous) => previous.advance(&reading.scan, reading.mutation.as_ref()),
            None => {
                // First reading: everything up to now predates us.
                self.last_seen = Some(reading);
                return Ok(());
            }
        };
        let innermost = self.open.iter().rev().find_map(|key| *key);
        let key = match self.lingering.take().or(innermost) {
            Some(key) => key,
            None => {
                if !delta.is_zero() {
                    event!(
                        Level::DEBUG,
                        "Dropping usage of relation {} accrued while it was not open.",
                        self.handle.relid
                    );
                }
                return Ok(());
            }
        };

        let record = registry
            .find(&key)
            .ok_or(UsageError::RegistryRecordMissing { key })?;
        match &mut record.counters {
            UsageCounters::Relation(totals) => {
                totals.merge(&delta);
                Ok(())
            }
            UsageCounters::Procedure(_) => Err(UsageError::RegistryRecordMissing { key }),
        }
    }
}

/// Everything created on the first activation.
#[derive(Default)]
struct EngineState {
    registry: Registry,
    stack: CallStack,
    relations: HashMap<Oid, RelationCursor>,
}

fn relation_reading(
    object_id: Oid,
    snapshot: RawCounterSnapshot,
) -> Result<RelationObservation, UsageError> {
    match snapshot {
        RawCounterSnapshot::Relation { scan, mutation } => Ok(RelationObservation { scan, mutation }),
        RawCounterSnapshot::Procedure(_) => Err(UsageError::UnknownKind {
            object_id,
            detail: "procedure counters supplied for a relation".to_string(),
        }),
    }
}

/// This is the entry point for the library. The host wires its
/// activation, deactivation and report notifications to it and reads
/// the results back through `query` or the report sink.
///
/// Each instance accounts for exactly one session. Hosts running
/// several workers need one `UsageAccountant` per worker; the
/// instances share nothing.
///
/// Usage is attributed to (object, caller) pairs. The caller of an
/// object is the procedure that was executing when the object was
/// activated, or `INVALID_OID` at top level.
pub struct UsageAccountant<'a> {
    config: UsageConfig,
    catalog: Box<dyn Catalog + 'a>,
    counter_source: Box<dyn CounterSource + 'a>,
    producer: Box<dyn Producer + 'a>,
    state: Option<EngineState>,
    halted: bool,
    last_report: Option<DateTime<Local>>,
}

impl<'a> UsageAccountant<'a> {
    /// Instantiates a UsageAccountant that ships its reports to Kafka.
    pub fn new(
        catalog: Box<dyn Catalog + 'a>,
        counter_source: Box<dyn CounterSource + 'a>,
        producer_config: KafkaConfig,
        config: UsageConfig,
    ) -> Result<UsageAccountant<'a>, ClientError> {
        Ok(UsageAccountant::new_with_producer(
            catalog,
            counter_source,
            Box::new(KafkaProducer::new(producer_config)?),
            config,
        ))
    }

    /// Leaves the responsibility to provide a report sink to the client.
    pub fn new_with_producer(
        catalog: Box<dyn Catalog + 'a>,
        counter_source: Box<dyn CounterSource + 'a>,
        producer: Box<dyn Producer + 'a>,
        config: UsageConfig,
    ) -> UsageAccountant<'a> {
        UsageAccountant {
            config,
            catalog,
            counter_source,
            producer,
            state: None,
            halted: false,
            last_report: None,
        }
    }

    pub fn config(&self) -> &UsageConfig {
        &self.config
    }

    /// True once an invariant violation stopped the accounting.
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Number of procedures currently executing.
    pub fn stack_depth(&self) -> usize {
        self.state
            .as_ref()
            .map(|state| state.stack.depth())
            .unwrap_or(0)
    }

    pub fn record(&self, key: &ObjectKey) -> Option<&UsageRecord> {
        self.state.as_ref().and_then(|state| state.registry.get(key))
    }

    /// Number of (object, caller) pairs seen so far, empty or not.
    pub fn record_count(&self) -> usize {
        self.state
            .as_ref()
            .map(|state| state.registry.len())
            .unwrap_or(0)
    }

    /// Called right before an object starts executing or being scanned.
    ///
    /// Procedures come without a relation handle, relations with their
    /// own. Catalog errors are returned to the host and leave no trace.
    pub fn on_activate(
        &mut self,
        object_id: Oid,
        kind: ObjectKind,
        relation: Option<&RelationHandle>,
    ) -> Result<(), UsageError> {
        if self.halted {
            event!(Level::DEBUG, "Accounting halted, ignoring activation of {}.", object_id);
            return Ok(());
        }

        let res = match (kind, relation) {
            (ObjectKind::Procedure, None) => {
                if !self.config.track_procedures {
                    return Ok(());
                }
                self.activate_procedure(object_id)
            }
            (ObjectKind::Relation(_), Some(handle)) => {
                if handle.relid != object_id {
                    Err(UsageError::UnknownKind {
                        object_id,
                        detail: format!("relation handle belongs to {}", handle.relid),
                    })
                } else if !self.tracks_relation(object_id) {
                    Ok(())
                } else if !handle.has_stats {
                    self.open_without_stats(handle);
                    Ok(())
                } else {
                    self.activate_relation(kind, handle)
                }
            }
            (ObjectKind::Procedure, Some(handle)) => Err(UsageError::UnknownKind {
                object_id,
                detail: format!("procedure activated with handle of relation {}", handle.relid),
            }),
            (ObjectKind::Relation(_), None) => Err(UsageError::UnknownKind {
                object_id,
                detail: "relation activated without a relation handle".to_string(),
            }),
        };
        self.check(res)
    }

    /// Called after an object finished executing or being scanned, with
    /// the host's cumulative counters for it.
    ///
    /// `finalize == false` marks a non-terminal exit: the activation
    /// context is unwound but nothing is merged yet.
    pub fn on_deactivate(
        &mut self,
        object_id: Oid,
        finalize: bool,
        counters: RawCounterSnapshot,
    ) -> Result<(), UsageError> {
        if self.halted {
            event!(Level::DEBUG, "Accounting halted, ignoring deactivation of {}.", object_id);
            return Ok(());
        }

        let res = match counters {
            RawCounterSnapshot::Procedure(current) => {
                if !self.config.track_procedures {
                    return Ok(());
                }
                self.deactivate_procedure(object_id, finalize, current)
            }
            RawCounterSnapshot::Relation { scan, mutation } => self.deactivate_relation(
                object_id,
                finalize,
                RelationObservation { scan, mutation },
            ),
        };
        self.check(res)
    }

    /// Forgets all activations in flight. The host calls this when it
    /// unwinds after an error, as the matching deactivations never come.
    /// Accumulated totals are kept.
    pub fn on_abort(&mut self) {
        let state = match self.state.as_mut() {
            Some(state) => state,
            None => return,
        };
        if !state.stack.is_empty() {
            event!(
                Level::DEBUG,
                "Discarding {} activations in flight.",
                state.stack.depth()
            );
        }
        state.stack.clear();
        for record in state.registry.iter_mut() {
            record.has_baseline = false;
            record.pending = None;
        }
        for cursor in state.relations.values_mut() {
            cursor.open.clear();
            cursor.lingering = None;
        }
    }

    fn tracks_relation(&self, relid: Oid) -> bool {
        self.config.track_relations
            && (self.config.track_system_objects || relid >= FIRST_NORMAL_OBJECT_ID)
    }

    /// Invariant violations stop all further accounting.
    fn check<T>(&mut self, res: Result<T, UsageError>) -> Result<T, UsageError> {
        if let Err(err) = &res {
            if err.is_invariant_violation() {
                event!(Level::ERROR, "Usage accounting halted: {}", err);
                self.halted = true;
            }
        }
        res
    }

    fn activate_procedure(&mut self, object_id: Oid) -> Result<(), UsageError> {
        let state = self.state.get_or_insert_with(EngineState::default);
        let key = ObjectKey::new(object_id, state.stack.active());
        let record = state
            .registry
            .get_or_create(key, ObjectKind::Procedure, self.catalog.as_ref())?;

        if record.has_baseline {
            // Same object under the same caller: the outer
            // activation loses its baseline.
            event!(
                Level::WARN,
                "Recursive activation of {} from {} overwrites its baseline.",
                object_id,
                key.caller_id
            );
        }
        record.baseline = self.counter_source.function_counters(object_id);
        record.has_baseline = true;

        state.stack.push(object_id);
        Ok(())
    }

    fn deactivate_procedure(
        &mut self,
        object_id: Oid,
        finalize: bool,
        current: FunctionCounters,
    ) -> Result<(), UsageError> {
        let state = self
            .state
            .as_mut()
            .ok_or(UsageError::StackUnderflow { object_id })?;
        let caller_id = state.stack.pop_matching(object_id)?;
        let key = ObjectKey::new(object_id, caller_id);
        let record = state
            .registry
            .find(&key)
            .ok_or(UsageError::RegistryRecordMissing { key })?;

        if !record.has_baseline {
            event!(
                Level::WARN,
                "Baseline of {} from {} was consumed by a recursive activation.",
                object_id,
                caller_id
            );
        }
        let mut delta = current.delta_since(&record.baseline);
        record.has_baseline = false;

        if !finalize {
            // Parked until the final exit; the next activation takes a
            // fresh baseline.
            record
                .pending
                .get_or_insert_with(FunctionCounters::default)
                .merge(&delta);
            return Ok(());
        }

        if let Some(pending) = record.pending.take() {
            delta.merge(&pending);
        }
        match &mut record.counters {
            UsageCounters::Procedure(totals) => totals.merge(&delta),
            UsageCounters::Relation(_) => return Err(UsageError::RegistryRecordMissing { key }),
        }
        Ok(())
    }

    fn activate_relation(
        &mut self,
        kind: ObjectKind,
        handle: &RelationHandle,
    ) -> Result<(), UsageError> {
        let reading = relation_reading(
            handle.relid,
            self.counter_source.relation_counters(handle),
        )?;
        let state = self.state.get_or_insert_with(EngineState::default);
        let key = ObjectKey::new(handle.relid, state.stack.active());
        state
            .registry
            .get_or_create(key, kind, self.catalog.as_ref())?;

        match state.relations.get_mut(&handle.relid) {
            Some(cursor) => {
                cursor.settle(&mut state.registry, reading)?;
                cursor.handle = *handle;
                cursor.open.push(Some(key));
            }
            None => {
                // First sight: everything up to now predates us.
                state.relations.insert(
                    handle.relid,
                    RelationCursor {
                        handle: *handle,
                        last_seen: Some(reading),
                        open: vec![Some(key)],
                        lingering: None,
                    },
                );
            }
        }
        Ok(())
    }

    /// The host keeps no statistics for this open. Only its place in the
    /// open stack is kept so the matching close is recognized.
    fn open_without_stats(&mut self, handle: &RelationHandle) {
        let state = self.state.get_or_insert_with(EngineState::default);
        state
            .relations
            .entry(handle.relid)
            .or_insert_with(|| RelationCursor {
                handle: *handle,
                last_seen: None,
                open: Vec::new(),
                lingering: None,
            })
            .open
            .push(None);
    }

    fn deactivate_relation(
        &mut self,
        object_id: Oid,
        finalize: bool,
        reading: RelationObservation,
    ) -> Result<(), UsageError> {
        if !self.tracks_relation(object_id) {
            return Ok(());
        }
        let state = match self.state.as_mut() {
            Some(state) => state,
            None => return Ok(()),
        };
        let cursor = match state.relations.get_mut(&object_id) {
            Some(cursor) => cursor,
            None => {
                event!(
                    Level::DEBUG,
                    "Relation {} closed without ever being tracked.",
                    object_id
                );
                return Ok(());
            }
        };
        match cursor.open.last() {
            None => return Err(UsageError::StackUnderflow { object_id }),
            Some(None) => {
                // Its counters are meaningless, leave last_seen alone.
                cursor.open.pop();
                return Ok(());
            }
            Some(Some(_)) => {}
        }

        if finalize {
            cursor.settle(&mut state.registry, reading)?;
            cursor.open.pop();
        } else {
            cursor.lingering = cursor.open.pop().flatten();
        }
        Ok(())
    }

    /// Returns true if a periodic report is due.
    ///
    /// The first report is always due; after that at least the
    /// configured report interval has to pass between two reports.
    pub fn should_report(&self, current_time: DateTime<Local>) -> bool {
        match self.last_report {
            None => true,
            Some(last) => current_time - last >= self.config.report_interval(),
        }
    }

    /// Periodic report entry point for the host. Skips the report when
    /// the previous one is too recent.
    pub fn on_report(&mut self, current_time: DateTime<Local>) -> Result<usize, ClientError> {
        if !self.should_report(current_time) {
            return Ok(0);
        }
        self.report_at(current_time)
    }

    /// Reports now, regardless of the report interval.
    pub fn report(&mut self) -> Result<usize, ClientError> {
        self.report_at(Local::now())
    }

    /// Emits every non-empty record to the log and the report sink and
    /// returns how many were emitted. With `clear_on_report` the records
    /// are zeroed once all of them have been sent, so successive reports
    /// never carry the same usage twice.
    ///
    /// A failed send leaves every record and the report time untouched;
    /// the next `on_report` retries the whole report.
    ///
    /// Only cached names are used: reports may run outside of any
    /// transaction where the catalog cannot be consulted.
    fn report_at(&mut self, current_time: DateTime<Local>) -> Result<usize, ClientError> {
        let state = match self.state.as_mut() {
            Some(state) => state,
            None => {
                self.last_report = Some(current_time);
                return Ok(0);
            }
        };

        let mut sent = Vec::new();
        for key in state.registry.sorted_keys() {
            let record = match state.registry.get(&key) {
                Some(record) if !record.is_empty() => record,
                _ => continue,
            };
            event!(Level::INFO, "{}", report::log_line(record));

            let message = report::report_message(record, current_time);
            self.producer.send(
                self.config.report_topic.as_str(),
                message.to_string().as_bytes(),
            )?;
            sent.push(key);
        }

        if self.config.clear_on_report {
            for key in &sent {
                if let Some(record) = state.registry.find(key) {
                    record.clear();
                }
            }
        }
        self.last_report = Some(current_time);
        Ok(sent.len())
    }

    /// Snapshot of every non-empty record, ordered by (object, caller).
    /// Nothing is modified.
    pub fn query_usage(&self) -> Vec<UsageRow> {
        let state = match self.state.as_ref() {
            Some(state) => state,
            None => return Vec::new(),
        };
        state
            .registry
            .sorted_keys()
            .iter()
            .filter_map(|key| state.registry.get(key))
            .filter(|record| !record.is_empty())
            .map(UsageRow::from)
            .collect()
    }

    /// One-shot sequence over the rows of `query_usage`.
    pub fn query(&self) -> UsageRows {
        UsageRows::new(self.query_usage())
    }

    /// Zeroes all records. Names are kept, and activations in flight are
    /// re-baselined on the current host counters so usage from before
    /// the reset cannot reappear when they finish.
    pub fn reset(&mut self) {
        let state = match self.state.as_mut() {
            Some(state) => state,
            None => return,
        };
        for record in state.registry.iter_mut() {
            record.clear();
            if record.pending.is_some() {
                record.pending = Some(FunctionCounters::default());
            }
            if record.has_baseline {
                record.baseline = self
                    .counter_source
                    .function_counters(record.key.object_id);
            }
        }
        for cursor in state.relations.values_mut() {
            cursor.lingering = None;
            if cursor.last_seen.is_none() {
                continue;
            }
            match relation_reading(
                cursor.handle.relid,
                self.counter_source.relation_counters(&cursor.handle),
            ) {
                Ok(reading) => cursor.last_seen = Some(reading),
                Err(err) => event!(
                    Level::WARN,
                    "Cannot re-baseline relation {}: {}",
                    cursor.handle.relid,
                    err
                ),
            }
        }
        event!(
            Level::DEBUG,
            "Usage of {} records reset.",
            state.registry.len()
        );
    }

    pub fn reset_usage(&mut self) {
        self.reset()
    }
}

impl<'a> StatHooks for UsageAccountant<'a> {
    fn on_activate(
        &mut self,
        object_id: Oid,
        kind: ObjectKind,
        relation: Option<&RelationHandle>,
    ) -> Result<(), HookError> {
        Ok(UsageAccountant::on_activate(self, object_id, kind, relation)?)
    }

    fn on_deactivate(
        &mut self,
        object_id: Oid,
        finalize: bool,
        counters: RawCounterSnapshot,
    ) -> Result<(), HookError> {
        Ok(UsageAccountant::on_deactivate(
            self, object_id, finalize, counters,
        )?)
    }

    fn on_report(&mut self, now: DateTime<Local>) -> Result<(), HookError> {
        UsageAccountant::on_report(self, now)?;
        Ok(())
    }
}
