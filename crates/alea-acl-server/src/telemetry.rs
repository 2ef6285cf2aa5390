//! Logging setup for the ACL server.
//!
//! `RUST_LOG` controls the filter. Without it the server logs at `info`, and
//! the ACL crates at `debug`.

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "info,alea_acl=debug,alea_acl_server=debug";

/// Install the global subscriber; `json` switches to one JSON object per line
pub fn init(json: bool) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let text_layer = (!json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(true)
            .with_line_number(true)
    });
    let json_layer = json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(text_layer)
        .with(json_layer)
        .try_init()?;

    tracing::info!(json, "Telemetry initialized");
    Ok(())
}
