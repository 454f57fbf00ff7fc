pub mod error;
pub mod mutator;
pub mod ops;
pub mod selector;
pub mod tier1;
pub mod tier2;
pub mod tier3;

pub use error::MutationError;
pub use mutator::Mutator;
pub use ops::{InsertionPoint, MutationOp, MutationRecord, NoiseModel, Tier};
pub use selector::{AdaptiveLearnerState, MarketContext, TierSelector, TierThresholds};
pub use tier1::{FactorEntry, StrategyConfigSpec};
pub use tier3::CodeEdit;
