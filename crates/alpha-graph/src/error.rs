use thiserror::Error;

use crate::factor::FactorId;

/// Structural invariant violations. Always recoverable: the candidate
/// strategy is rejected, the run continues.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("dependency cycle involving factor {0}")]
    CycleDetected(FactorId),

    #[error("factor {factor} input '{input}' is satisfied by neither an ancestor nor the base dataset")]
    MissingDependency { factor: FactorId, input: String },

    #[error("factor {factor} outputs are never consumed and are not final outputs")]
    OrphanedFactor { factor: FactorId },

    #[error("strategy produces no signal or position output")]
    NoSignalProducer,

    #[error("replacement outputs lack '{missing}' required by dependent {dependent}")]
    OutputIncompatible { dependent: FactorId, missing: String },
}
