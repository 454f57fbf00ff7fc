pub mod config;
pub mod events;
pub mod logging;
pub mod storage;

pub use config::Settings;
pub use events::{EventLog, RunEvent};
pub use storage::{CheckpointRow, RunLedger};
