extern crate stat_usage_accountant;

use clap::Parser;
use stat_usage_accountant::{
    Catalog, CounterSource, FunctionCounters, KafkaConfig, LogProducer, ObjectDetail, ObjectKind,
    ObjectMetadata, Oid, RawCounterSnapshot, RelationHandle, RelationKind, ScanCounters,
    UsageAccountant, UsageConfig, UsageError,
};
use std::cell::RefCell;
use std::collections::HashMap;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Kafka broker server in the host:port form. Reports are logged
    /// when omitted.
    #[arg(short, long)]
    bootstrap_server: Option<String>,

    /// Zero the usage records after each report
    #[arg(long)]
    clear_on_report: bool,
}

const OUTER: Oid = 16400;
const INNER: Oid = 16401;
const ACCOUNTS: Oid = 16410;

/// A tiny in-process host: two functions and one table.
#[derive(Default)]
struct DemoHost {
    functions: RefCell<HashMap<Oid, FunctionCounters>>,
    scans: RefCell<u64>,
}

impl DemoHost {
    fn call(&self, object_id: Oid) -> RawCounterSnapshot {
        let mut functions = self.functions.borrow_mut();
        let counters = functions.entry(object_id).or_default();
        counters.calls += 1;
        counters.total_time += 25;
        counters.self_time += 10;
        RawCounterSnapshot::Procedure(*counters)
    }

    fn scan(&self) -> RawCounterSnapshot {
        *self.scans.borrow_mut() += 1;
        self.relation_counters(&RelationHandle::new(ACCOUNTS))
    }
}

impl Catalog for DemoHost {
    fn resolve_object_metadata(
        &self,
        object_id: Oid,
        kind: &ObjectKind,
    ) -> Result<ObjectMetadata, UsageError> {
        let (name, detail) = match object_id {
            OUTER => ("outer", ObjectDetail::Procedure { arg_count: 0 }),
            INNER => ("inner", ObjectDetail::Procedure { arg_count: 1 }),
            ACCOUNTS => ("accounts", ObjectDetail::Relation { relkind: 'r' }),
            _ => {
                return Err(UsageError::MetadataNotFound {
                    object_id,
                    kind: *kind,
                })
            }
        };
        Ok(ObjectMetadata {
            schema_name: "public".to_string(),
            object_name: name.to_string(),
            detail,
        })
    }
}

impl CounterSource for DemoHost {
    fn function_counters(&self, object_id: Oid) -> FunctionCounters {
        self.functions
            .borrow()
            .get(&object_id)
            .copied()
            .unwrap_or_default()
    }

    fn relation_counters(&self, _relation: &RelationHandle) -> RawCounterSnapshot {
        let scans = *self.scans.borrow();
        RawCounterSnapshot::Relation {
            scan: ScanCounters {
                scans,
                tuples_returned: scans * 3,
                ..Default::default()
            },
            mutation: None,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt::init();

    let host = DemoHost::default();
    let config = UsageConfig {
        clear_on_report: args.clear_on_report,
        ..Default::default()
    };
    let mut accountant = match args.bootstrap_server {
        Some(server) => UsageAccountant::new(
            Box::new(&host),
            Box::new(&host),
            KafkaConfig::new_producer_config(server.as_str(), None),
            config,
        )?,
        None => UsageAccountant::new_with_producer(
            Box::new(&host),
            Box::new(&host),
            Box::new(LogProducer),
            config,
        ),
    };

    let table = ObjectKind::Relation(RelationKind::Table);
    let handle = RelationHandle::new(ACCOUNTS);

    // outer() calls inner() twice, inner() scans the table each time.
    accountant.on_activate(OUTER, ObjectKind::Procedure, None)?;
    for _ in 0..2 {
        accountant.on_activate(INNER, ObjectKind::Procedure, None)?;
        accountant.on_activate(ACCOUNTS, table, Some(&handle))?;
        let scanned = host.scan();
        accountant.on_deactivate(ACCOUNTS, true, scanned)?;
        accountant.on_deactivate(INNER, true, host.call(INNER))?;
    }
    accountant.on_deactivate(OUTER, true, host.call(OUTER))?;

    // A top level statement reading the same table.
    accountant.on_activate(ACCOUNTS, table, Some(&handle))?;
    let scanned = host.scan();
    accountant.on_deactivate(ACCOUNTS, true, scanned)?;

    for row in accountant.query() {
        println!("{}", serde_json::to_string(&row)?);
    }
    accountant.report()?;
    Ok(())
}
