//! Tracing subscriber setup.
//!
//! Logs go to stderr so stdout carries only command output (answers,
//! stats, ingest summaries). `RUST_LOG` overrides the level chosen here.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info";
const DEBUG_FILTER: &str = "info,docmind=debug,docmind_core=debug";

pub fn init(debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug)));

    // A second init (tests, embedding in another app) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn default_directive(debug: bool) -> &'static str {
    if debug {
        DEBUG_FILTER
    } else {
        DEFAULT_FILTER
    }
}
