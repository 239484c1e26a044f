use std::env::var;

use tracing::{level_filters::LevelFilter, warn};
use tracing_subscriber::{Layer, filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Directives that keep chatty transport crates out of the default output.
const QUIET_DIRECTIVES: [&str; 3] = ["hyper_util=warn", "libsql=warn", "reqwest=warn"];

pub fn init() {
    init_with_level(LevelFilter::INFO);
}

/// Alias kept for the server binary.
pub fn init_tracing() {
    init();
}

/// Initialize the global subscriber.
///
/// `RUST_LOG` wins over `level`; `RUST_LOG_FORMAT=json` switches to one JSON
/// object per line. Calling this twice is harmless, the second call is ignored.
pub fn init_with_level(level: LevelFilter) {
    let mut env_filter =
        EnvFilter::builder().with_default_directive(level.into()).from_env_lossy();
    if var("RUST_LOG").is_err() {
        for directive in QUIET_DIRECTIVES {
            if let Ok(directive) = directive.parse() {
                env_filter = env_filter.add_directive(directive);
            }
        }
    }

    let log_format = var("RUST_LOG_FORMAT").unwrap_or_default();

    let log_layer = match log_format.as_str() {
        "json" => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(false)
            .with_filter(env_filter)
            .boxed(),
        _ => tracing_subscriber::fmt::layer().compact().with_target(true).with_filter(env_filter).boxed(),
    };

    if tracing_subscriber::registry().with(log_layer).try_init().is_err() {
        warn!("Tracing subscriber already installed, keeping the existing one");
    }
}
