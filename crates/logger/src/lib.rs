//! Shared tracing setup for the modelwatch binaries.

mod subscriber;

pub use subscriber::{init, init_tracing, init_with_level};
