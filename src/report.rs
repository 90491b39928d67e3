//! Caller visible views of usage records: rows for the usage query and
//! the payloads and log lines emitted by reports.

use crate::counters::UsageCounters;
use crate::registry::{ObjectKind, Oid, UsageRecord};
use chrono::{DateTime, Local};
use serde::Serialize;
use serde_json::{json, Value};

/// One row of the usage view. Counters that do not apply to the kind
/// of object are zero.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct UsageRow {
    pub object_id: Oid,
    pub caller_id: Oid,
    pub kind: ObjectKind,
    pub object_type: String,
    pub schema_name: Option<String>,
    pub object_name: Option<String>,
    /// Calls for procedures, scans for relations.
    pub calls_or_scans: u64,
    pub total_time: u64,
    pub self_time: u64,
    pub tuples_returned: u64,
    pub tuples_fetched: u64,
    pub tuples_inserted: u64,
    pub tuples_updated: u64,
    pub tuples_deleted: u64,
    pub blocks_fetched: u64,
    pub blocks_hit: u64,
}

impl From<&UsageRecord> for UsageRow {
    fn from(record: &UsageRecord) -> Self {
        let mut row = UsageRow {
            object_id: record.key.object_id,
            caller_id: record.key.caller_id,
            kind: record.kind,
            object_type: record.kind.type_code(),
            schema_name: record.schema_name.clone(),
            object_name: record.object_name.clone(),
            calls_or_scans: 0,
            total_time: 0,
            self_time: 0,
            tuples_returned: 0,
            tuples_fetched: 0,
            tuples_inserted: 0,
            tuples_updated: 0,
            tuples_deleted: 0,
            blocks_fetched: 0,
            blocks_hit: 0,
        };
        match &record.counters {
            UsageCounters::Procedure(c) => {
                row.calls_or_scans = c.calls;
                row.total_time = c.total_time;
                row.self_time = c.self_time;
            }
            UsageCounters::Relation(c) => {
                row.calls_or_scans = c.scan.scans;
                row.tuples_returned = c.scan.tuples_returned;
                row.tuples_fetched = c.scan.tuples_fetched;
                row.blocks_fetched = c.scan.blocks_fetched;
                row.blocks_hit = c.scan.blocks_hit;
                row.tuples_inserted = c.mutation.tuples_inserted;
                row.tuples_updated = c.mutation.tuples_updated;
                row.tuples_deleted = c.mutation.tuples_deleted;
            }
        }
        row
    }
}

/// Result of a usage query: a finite, one-shot sequence over a snapshot
/// taken when the query ran.
#[derive(Debug)]
pub struct UsageRows {
    rows: std::vec::IntoIter<UsageRow>,
}

impl UsageRows {
    pub(crate) fn new(rows: Vec<UsageRow>) -> Self {
        UsageRows {
            rows: rows.into_iter(),
        }
    }
}

impl Iterator for UsageRows {
    type Item = UsageRow;

    fn next(&mut self) -> Option<UsageRow> {
        self.rows.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.rows.size_hint()
    }
}

impl ExactSizeIterator for UsageRows {}

/// Human readable line for the process log.
pub fn log_line(record: &UsageRecord) -> String {
    match &record.counters {
        UsageCounters::Procedure(c) => format!(
            "function call: {}({}) oid={} parent={} calls={} total_time={} self_time={}",
            record.display_name(),
            record.arg_count.unwrap_or(0),
            record.key.object_id,
            record.key.caller_id,
            c.calls,
            c.total_time,
            c.self_time
        ),
        UsageCounters::Relation(c) => format!(
            "table access: {} oid={} function={} scans={} returned={} fetched={} inserted={} updated={} deleted={}",
            record.display_name(),
            record.key.object_id,
            record.key.caller_id,
            c.scan.scans,
            c.scan.tuples_returned,
            c.scan.tuples_fetched,
            c.mutation.tuples_inserted,
            c.mutation.tuples_updated,
            c.mutation.tuples_deleted
        ),
    }
}

/// JSON document shipped to the report sink.
pub fn report_message(record: &UsageRecord, timestamp: DateTime<Local>) -> Value {
    let counters = match &record.counters {
        UsageCounters::Procedure(c) => json!({
            "calls": c.calls,
            "total_time": c.total_time,
            "self_time": c.self_time,
        }),
        UsageCounters::Relation(c) => json!({
            "scans": c.scan.scans,
            "tuples_returned": c.scan.tuples_returned,
            "tuples_fetched": c.scan.tuples_fetched,
            "tuples_inserted": c.mutation.tuples_inserted,
            "tuples_updated": c.mutation.tuples_updated,
            "tuples_deleted": c.mutation.tuples_deleted,
            "blocks_fetched": c.scan.blocks_fetched,
            "blocks_hit": c.scan.blocks_hit,
        }),
    };
    json!({
        "timestamp": timestamp.timestamp(),
        "object_id": record.key.object_id,
        "caller_id": record.key.caller_id,
        "object_type": record.kind.type_code(),
        "schema_name": record.schema_name,
        "object_name": record.object_name,
        "counters": counters,
    })
}

#[cfg(test)]
mod tests {
    use super::{log_line, report_message, UsageRow, UsageRows};
    use crate::counters::{FunctionCounters, RelationCounters, UsageCounters};
    use crate::host::MockHost;
    use crate::registry::{ObjectKey, ObjectKind, Registry, RelationKind};
    use chrono::{Local, TimeZone};

    #[test]
    fn test_procedure_row() {
        let host = MockHost::new();
        host.add_function(16400, "public", "ff1", 2);
        let mut registry = Registry::new();
        let record = registry
            .get_or_create(ObjectKey::new(16400, 0), ObjectKind::Procedure, &host)
            .unwrap();
        record.counters = UsageCounters::Procedure(FunctionCounters {
            calls: 5,
            total_time: 120,
            self_time: 80,
        });

        let row = UsageRow::from(&*record);
        assert_eq!(row.object_type, "F");
        assert_eq!(row.calls_or_scans, 5);
        assert_eq!(row.total_time, 120);
        assert_eq!(row.self_time, 80);
        assert_eq!(row.tuples_returned, 0);
        assert_eq!(
            log_line(record),
            "function call: public.ff1(2) oid=16400 parent=0 calls=5 total_time=120 self_time=80"
        );
    }

    #[test]
    fn test_relation_message() {
        let host = MockHost::new();
        host.add_relation(16410, "app", "accounts", 'r');
        let mut registry = Registry::new();
        let record = registry
            .get_or_create(
                ObjectKey::new(16410, 16400),
                ObjectKind::Relation(RelationKind::Table),
                &host,
            )
            .unwrap();
        let mut counters = RelationCounters::default();
        counters.scan.scans = 3;
        counters.mutation.tuples_inserted = 9;
        record.counters = UsageCounters::Relation(counters);

        let row = UsageRow::from(&*record);
        assert_eq!(row.object_type, "r");
        assert_eq!(row.calls_or_scans, 3);
        assert_eq!(row.tuples_inserted, 9);
        assert_eq!(row.total_time, 0);

        let timestamp = Local.with_ymd_and_hms(2023, 10, 8, 22, 15, 25).unwrap();
        let message = report_message(record, timestamp);
        assert_eq!(message["timestamp"], timestamp.timestamp());
        assert_eq!(message["object_id"], 16410);
        assert_eq!(message["caller_id"], 16400);
        assert_eq!(message["object_type"], "r");
        assert_eq!(message["schema_name"], "app");
        assert_eq!(message["counters"]["scans"], 3);
        assert_eq!(message["counters"]["tuples_inserted"], 9);
    }

    #[test]
    fn test_rows_are_one_shot() {
        let mut rows = UsageRows::new(Vec::new());
        assert_eq!(rows.len(), 0);
        assert!(rows.next().is_none());
    }
}
