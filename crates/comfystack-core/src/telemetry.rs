//! Log setup for `comfystack`.
//!
//! Progress lines (stage started, command run, file fetched) go to stderr;
//! stdout is reserved for the plan, report and status output. The filter
//! comes from `COMFYSTACK_LOG`, then `RUST_LOG`, then the level picked by
//! `--verbose`. The HTTP stack is held at `warn` unless a directive names it.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable with filter directives for this tool only.
pub const LOG_ENV: &str = "COMFYSTACK_LOG";

const QUIET_CRATES: [&str; 4] = ["hyper", "hyper_util", "reqwest", "rustls"];

/// Filter directives used when no environment override is set.
pub fn default_directives(level: Level) -> String {
    std::iter::once(level.as_str().to_lowercase())
        .chain(QUIET_CRATES.iter().map(|c| format!("{c}=warn")))
        .collect::<Vec<_>>()
        .join(",")
}

fn env_filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)))
}

/// Install the global subscriber. `json` switches to newline-delimited JSON,
/// matching `--json` on the report. Only the first call takes effect.
pub fn init_tracing(json: bool, level: Level) {
    let layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        tracing_subscriber::registry()
            .with(env_filter(level))
            .with(layer.json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter(level))
            .with(layer)
            .try_init()
            .ok();
    }
}
