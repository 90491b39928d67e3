//! Reconstructs "who called whom" from the order of the host's
//! activation and deactivation notifications.

use crate::error::UsageError;
use crate::registry::{Oid, INVALID_OID};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CallContextFrame {
    pub object_id: Oid,
    pub caller_id: Oid,
}

#[derive(Debug, Default)]
pub struct CallStack {
    frames: Vec<CallContextFrame>,
}

impl CallStack {
    pub fn new() -> Self {
        Self { frames: Vec::new() }
    }

    /// The object currently executing, `INVALID_OID` at top level.
    pub fn active(&self) -> Oid {
        self.frames
            .last()
            .map(|frame| frame.object_id)
            .unwrap_or(INVALID_OID)
    }

    /// Caller of the currently executing object.
    pub fn caller(&self) -> Oid {
        self.frames
            .last()
            .map(|frame| frame.caller_id)
            .unwrap_or(INVALID_OID)
    }

    pub fn push(&mut self, object_id: Oid) {
        let caller_id = self.active();
        self.frames.push(CallContextFrame {
            object_id,
            caller_id,
        });
    }

    /// Removes the top frame and returns the caller it recorded, which
    /// is active again afterwards.
    pub fn pop(&mut self) -> Result<Oid, UsageError> {
        self.frames
            .pop()
            .map(|frame| frame.caller_id)
            .ok_or(UsageError::StackUnderflow {
                object_id: INVALID_OID,
            })
    }

    /// Like `pop`, but only if `object_id` is the active object. The
    /// stack is left untouched on failure.
    pub fn pop_matching(&mut self, object_id: Oid) -> Result<Oid, UsageError> {
        match self.frames.last() {
            None => Err(UsageError::StackUnderflow { object_id }),
            Some(frame) if frame.object_id != object_id => Err(UsageError::ContextMismatch {
                expected: frame.object_id,
                found: object_id,
            }),
            Some(_) => self.pop(),
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::CallStack;
    use crate::error::UsageError;
    use crate::registry::INVALID_OID;

    #[test]
    fn test_nested_push_pop() {
        let mut stack = CallStack::new();
        assert_eq!(stack.active(), INVALID_OID);

        stack.push(42);
        stack.push(43);
        stack.push(44);
        assert_eq!(stack.depth(), 3);
        assert_eq!(stack.active(), 44);
        assert_eq!(stack.caller(), 43);

        assert_eq!(stack.pop().unwrap(), 43);
        assert_eq!(stack.active(), 43);
        assert_eq!(stack.pop_matching(43).unwrap(), 42);
        assert_eq!(stack.pop_matching(42).unwrap(), INVALID_OID);
        assert!(stack.is_empty());
    }

    #[test]
    fn test_sequential_calls_share_caller() {
        let mut stack = CallStack::new();
        stack.push(42);
        for callee in [43, 44, 43] {
            stack.push(callee);
            assert_eq!(stack.caller(), 42);
            assert_eq!(stack.pop_matching(callee).unwrap(), 42);
        }
        assert_eq!(stack.pop().unwrap(), INVALID_OID);
        assert!(stack.is_empty());
    }

    #[test]
    fn test_underflow() {
        let mut stack = CallStack::new();
        assert!(matches!(stack.pop(), Err(UsageError::StackUnderflow { .. })));
        assert_eq!(
            stack.pop_matching(7),
            Err(UsageError::StackUnderflow { object_id: 7 })
        );
    }

    #[test]
    fn test_mismatch_keeps_stack() {
        let mut stack = CallStack::new();
        stack.push(42);
        stack.push(43);
        assert_eq!(
            stack.pop_matching(42),
            Err(UsageError::ContextMismatch {
                expected: 43,
                found: 42
            })
        );
        assert_eq!(stack.depth(), 2);
        assert_eq!(stack.active(), 43);
    }
}
