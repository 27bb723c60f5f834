//! Log output for the proxy binary
//!
//! Everything is written to stderr so stdout stays free for subcommand
//! output. Filtering follows `RUST_LOG` when it is set and falls back to
//! `editor_proxy=info` otherwise. `LOG_FORMAT=json` selects one JSON object
//! per line.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const FALLBACK_FILTER: &str = "editor_proxy=info";

/// Filter from an optional `RUST_LOG` value. An unset or unparseable value
/// gives the fallback filter.
fn filter_from(spec: Option<&str>) -> EnvFilter {
    match spec.map(str::trim).filter(|s| !s.is_empty()) {
        Some(spec) => EnvFilter::try_new(spec).unwrap_or_else(|e| {
            eprintln!("ignoring invalid RUST_LOG '{}': {}", spec, e);
            EnvFilter::new(FALLBACK_FILTER)
        }),
        None => EnvFilter::new(FALLBACK_FILTER),
    }
}

/// Install the global subscriber; `main` calls this before anything logs
pub fn init_tracing() -> anyhow::Result<()> {
    let spec = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = filter_from(spec.as_deref());
    let stderr_fmt = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let subscriber = tracing_subscriber::registry().with(filter);
    if wants_json(std::env::var("LOG_FORMAT").ok().as_deref()) {
        subscriber.with(stderr_fmt.json()).try_init()?;
    } else {
        subscriber.with(stderr_fmt.with_ansi(false)).try_init()?;
    }
    Ok(())
}

fn wants_json(format: Option<&str>) -> bool {
    format.is_some_and(|f| f.eq_ignore_ascii_case("json"))
}
