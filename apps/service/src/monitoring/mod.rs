/// Monitoring engine module - probes model endpoints
///
/// This module is responsible for:
/// - Challenging each target with a fresh arithmetic prompt
/// - Streaming the reply through the vendor's protocol
/// - Classifying latency and correctness into a status
/// - Scheduling due targets under the leader lease
pub mod challenge;
pub mod executor;
pub mod probe;
pub mod scheduler;
pub mod types;
pub mod validation;

#[cfg(test)]
pub(crate) mod fake;

pub use executor::MonitoringExecutor;
pub use scheduler::MonitoringScheduler;
pub use types::{CheckOutcome, CheckStatus, OfficialState, OfficialStatus, Vendor};
