//! Task list and the loop that drives it

pub mod orchestrator;
pub mod store;

pub use orchestrator::QueueOrchestrator;
pub use store::TaskQueue;
