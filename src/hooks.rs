//! Ordered observers of the host's statistics notifications.
//!
//! Several instrumentation layers can watch the same host. Each one is
//! registered once at startup and receives every notification in
//! registration order.

use crate::counters::RawCounterSnapshot;
use crate::error::UsageError;
use crate::host::RelationHandle;
use crate::producer::ClientError;
use crate::registry::{ObjectKind, Oid};
use chrono::{DateTime, Local};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HookError {
    #[error(transparent)]
    Usage(#[from] UsageError),

    #[error("usage report failed")]
    Report(#[from] ClientError),
}

/// Receiver of activation, deactivation and report notifications.
/// Every method defaults to doing nothing.
pub trait StatHooks {
    fn on_activate(
        &mut self,
        _object_id: Oid,
        _kind: ObjectKind,
        _relation: Option<&RelationHandle>,
    ) -> Result<(), HookError> {
        Ok(())
    }

    fn on_deactivate(
        &mut self,
        _object_id: Oid,
        _finalize: bool,
        _counters: RawCounterSnapshot,
    ) -> Result<(), HookError> {
        Ok(())
    }

    fn on_report(&mut self, _now: DateTime<Local>) -> Result<(), HookError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct HookChain<'a> {
    hooks: Vec<Box<dyn StatHooks + 'a>>,
}

impl<'a> HookChain<'a> {
    pub fn new() -> Self {
        HookChain { hooks: Vec::new() }
    }

    /// Appends a hook. It runs after every hook registered before it.
    pub fn register(&mut self, hook: Box<dyn StatHooks + 'a>) {
        self.hooks.push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

/// The chain itself is a hook. Dispatch stops at the first failure.
impl<'a> StatHooks for HookChain<'a> {
    fn on_activate(
        &mut self,
        object_id: Oid,
        kind: ObjectKind,
        relation: Option<&RelationHandle>,
    ) -> Result<(), HookError> {
        for hook in self.hooks.iter_mut() {
            hook.on_activate(object_id, kind, relation)?;
        }
        Ok(())
    }

    fn on_deactivate(
        &mut self,
        object_id: Oid,
        finalize: bool,
        counters: RawCounterSnapshot,
    ) -> Result<(), HookError> {
        for hook in self.hooks.iter_mut() {
            hook.on_deactivate(object_id, finalize, counters)?;
        }
        Ok(())
    }

    fn on_report(&mut self, now: DateTime<Local>) -> Result<(), HookError> {
        for hook in self.hooks.iter_mut() {
            hook.on_report(now)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{HookChain, HookError, StatHooks};
    use crate::counters::{FunctionCounters, RawCounterSnapshot};
    use crate::error::UsageError;
    use crate::host::RelationHandle;
    use crate::registry::{ObjectKind, Oid};
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Recorder {
        name: &'static str,
        log: Rc<RefCell<Vec<String>>>,
        fail_activation: bool,
    }

    impl StatHooks for Recorder {
        fn on_activate(
            &mut self,
            object_id: Oid,
            _kind: ObjectKind,
            _relation: Option<&RelationHandle>,
        ) -> Result<(), HookError> {
            self.log
                .borrow_mut()
                .push(format!("{} activate {}", self.name, object_id));
            if self.fail_activation {
                return Err(UsageError::MetadataNotFound {
                    object_id,
                    kind: ObjectKind::Procedure,
                }
                .into());
            }
            Ok(())
        }
    }

    fn recorder(name: &'static str, log: &Rc<RefCell<Vec<String>>>, fail: bool) -> Box<Recorder> {
        Box::new(Recorder {
            name,
            log: Rc::clone(log),
            fail_activation: fail,
        })
    }

    #[test]
    fn test_registration_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut chain = HookChain::new();
        chain.register(recorder("first", &log, false));
        chain.register(recorder("second", &log, false));
        assert_eq!(chain.len(), 2);

        chain
            .on_activate(16400, ObjectKind::Procedure, None)
            .unwrap();
        assert_eq!(
            *log.borrow(),
            vec!["first activate 16400", "second activate 16400"]
        );

        // Hooks that don't override a notification ignore it.
        let res = chain.on_deactivate(
            16400,
            true,
            RawCounterSnapshot::Procedure(FunctionCounters::default()),
        );
        assert!(res.is_ok());
        assert_eq!(log.borrow().len(), 2);
    }

    #[test]
    fn test_failure_stops_dispatch() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut chain = HookChain::new();
        chain.register(recorder("first", &log, true));
        chain.register(recorder("second", &log, false));

        let res = chain.on_activate(16400, ObjectKind::Procedure, None);
        assert!(matches!(
            res,
            Err(HookError::Usage(UsageError::MetadataNotFound { .. }))
        ));
        assert_eq!(*log.borrow(), vec!["first activate 16400"]);
    }
}
