use std::env;

use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "CHAT_SMOKE_LOG";
const DEFAULT_FILTER: &str = "info,chat_smoke=debug,chat_session=debug";

/// Install the fmt subscriber. `RUST_LOG` wins over `CHAT_SMOKE_LOG`; with
/// neither set (or both unparseable) the session crates log at debug.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_env_filter(resolve_filter(env::var(LOG_ENV).ok()))
        .try_init();
}

fn resolve_filter(smoke_directives: Option<String>) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .ok()
        .or_else(|| {
            smoke_directives
                .filter(|directives| !directives.trim().is_empty())
                .and_then(|directives| EnvFilter::try_new(directives).ok())
        })
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}
