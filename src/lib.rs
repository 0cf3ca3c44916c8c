pub mod admission;
pub mod config;
pub mod error;
pub mod events;
pub mod ingest;
pub mod llm;
pub mod metrics;
pub mod monitor;
pub mod orchestrator;
pub mod patcher;
pub mod pipeline;
pub mod proposal;
/// Guardian sessions and the append-only JSONL session journal.
pub mod session;
pub mod supervisor;

pub use config::GuardianConfig;
pub use monitor::{ErrorEvent, ErrorMonitor};
pub use orchestrator::Guardian;
