use thiserror::Error;

use alpha_graph::{CompileError, LibraryError, ValidationError};

use crate::ops::{MutationOp, Tier};

/// A rejected mutation. Carries which operator and tier produced the
/// rejection so the tier selector can learn from it.
#[derive(Debug, Error)]
pub enum MutationError {
    #[error("{op} at {tier} rejected: {source}")]
    Invalid {
        tier: Tier,
        op: MutationOp,
        #[source]
        source: ValidationError,
    },

    #[error("{op} at {tier} rejected by factor library: {source}")]
    Library {
        tier: Tier,
        op: MutationOp,
        #[source]
        source: LibraryError,
    },

    #[error("{op} at {tier} violates the configuration schema: {reason}")]
    Schema {
        tier: Tier,
        op: MutationOp,
        reason: String,
    },

    #[error("{op} at {tier} is not applicable: {reason}")]
    NotApplicable {
        tier: Tier,
        op: MutationOp,
        reason: String,
    },

    #[error("{op} rejected by security validation: {source}")]
    Security {
        op: MutationOp,
        #[source]
        source: CompileError,
    },
}

impl MutationError {
    pub fn tier(&self) -> Tier {
        match self {
            MutationError::Invalid { tier, .. }
            | MutationError::Library { tier, .. }
            | MutationError::Schema { tier, .. }
            | MutationError::NotApplicable { tier, .. } => *tier,
            MutationError::Security { .. } => Tier::Tier3,
        }
    }

    pub fn op(&self) -> MutationOp {
        match self {
            MutationError::Invalid { op, .. }
            | MutationError::Library { op, .. }
            | MutationError::Schema { op, .. }
            | MutationError::NotApplicable { op, .. }
            | MutationError::Security { op, .. } => *op,
        }
    }

    /// The violated invariant, when the rejection came from validation.
    pub fn validation(&self) -> Option<&ValidationError> {
        match self {
            MutationError::Invalid { source, .. } => Some(source),
            _ => None,
        }
    }
}
