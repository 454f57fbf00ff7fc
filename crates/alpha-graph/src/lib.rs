pub mod error;
pub mod execute;
pub mod factor;
pub mod library;
pub mod logic;
pub mod strategy;

pub use error::ValidationError;
pub use execute::{ChannelFrame, ExecutionResult};
pub use factor::{is_signal_channel, Factor, FactorCategory, FactorId, ParamRange, ParamValue};
pub use library::{
    base_channel_set, BuiltinLibrary, FactorLibrary, FactorSpec, LibraryError, ParamSpec,
    BASE_CHANNELS,
};
pub use logic::{
    compile_source, BinOp, CmpOp, CombineMode, CompileError, CompiledLogic, LogicArena, LogicRef,
    SignalExpr,
};
pub use strategy::{
    mint_strategy_id, FactorSnapshot, Fitness, Strategy, StrategySnapshot, WORST_OBJECTIVE,
};
