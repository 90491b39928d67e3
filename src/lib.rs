pub mod accountant;
pub mod config;
pub mod context;
pub mod counters;
pub mod error;
pub mod hooks;
pub mod host;
pub mod producer;
pub mod registry;
pub mod report;

pub use accountant::UsageAccountant;
pub use config::UsageConfig;
pub use counters::{FunctionCounters, MutationCounters, RawCounterSnapshot, ScanCounters};
pub use error::UsageError;
pub use hooks::{HookChain, StatHooks};
pub use host::{Catalog, CounterSource, ObjectDetail, ObjectMetadata, RelationHandle};
pub use producer::{KafkaConfig, KafkaProducer, LogProducer, Producer};
pub use registry::{ObjectKey, ObjectKind, Oid, RelationKind, INVALID_OID};
pub use report::UsageRow;
