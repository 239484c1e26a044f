//! Leader-elected availability and latency prober for hosted chat-completion
//! APIs.
//!
//! [`orchestrator::Orchestrator`] wires everything together; readers use
//! [`orchestrator::SnapshotService`].

pub mod config;
pub mod database;
pub mod monitoring;
pub mod orchestrator;
pub mod pool;

pub use config::Config;
pub use orchestrator::Orchestrator;
