//! Errors raised by the accounting engine.
//!
//! Invariant violations (`StackUnderflow`, `ContextMismatch`,
//! `RegistryRecordMissing`) halt the engine. The remaining variants are
//! rejected at the boundary and leave the engine usable.

use crate::registry::{ObjectKey, ObjectKind, Oid};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UsageError {
    /// The catalog does not know the object being activated.
    #[error("{kind} \"{object_id}\" does not exist")]
    MetadataNotFound { object_id: Oid, kind: ObjectKind },

    /// A deactivation without a matching activation.
    #[error("deactivation of {object_id} without a matching activation")]
    StackUnderflow { object_id: Oid },

    /// The deactivated object is not the most recently activated one.
    #[error("deactivation of {found} while {expected} is active")]
    ContextMismatch { expected: Oid, found: Oid },

    /// The activation could not be classified.
    #[error("cannot classify object {object_id}: {detail}")]
    UnknownKind { object_id: Oid, detail: String },

    /// The record created at activation is gone at deactivation.
    #[error("no usage record for {key}")]
    RegistryRecordMissing { key: ObjectKey },
}

impl UsageError {
    /// True for errors that leave the engine's bookkeeping unreliable.
    pub fn is_invariant_violation(&self) -> bool {
        match self {
            UsageError::StackUnderflow { .. }
            | UsageError::ContextMismatch { .. }
            | UsageError::RegistryRecordMissing { .. } => true,
            UsageError::MetadataNotFound { .. } | UsageError::UnknownKind { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::UsageError;
    use crate::registry::{ObjectKey, ObjectKind};

    #[test]
    fn test_invariant_classification() {
        assert!(UsageError::StackUnderflow { object_id: 1 }.is_invariant_violation());
        assert!(UsageError::RegistryRecordMissing {
            key: ObjectKey::new(1, 0)
        }
        .is_invariant_violation());
        assert!(!UsageError::MetadataNotFound {
            object_id: 1,
            kind: ObjectKind::Procedure
        }
        .is_invariant_violation());
    }

    #[test]
    fn test_messages() {
        let err = UsageError::MetadataNotFound {
            object_id: 16400,
            kind: ObjectKind::Procedure,
        };
        assert_eq!(err.to_string(), "function \"16400\" does not exist");

        let err = UsageError::ContextMismatch {
            expected: 42,
            found: 43,
        };
        assert_eq!(err.to_string(), "deactivation of 43 while 42 is active");
    }
}
