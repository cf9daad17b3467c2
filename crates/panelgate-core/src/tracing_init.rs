//! Shared tracing/logging initialization.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{Error, Result};

/// Build the filter directive used when `RUST_LOG` is unset: the configured
/// level applied to every `panelgate` crate, everything else at `warn`.
pub fn default_directive(log_level: &str) -> String {
    format!("warn,panelgate_core={log_level},panelgate_server={log_level}")
}

/// Initialise the global tracing subscriber.
///
/// `RUST_LOG` wins over `log_level` when set. With `log_json` every event is
/// emitted as one JSON object per line for log aggregation.
pub fn init_tracing(log_level: &str, log_json: bool) -> Result<()> {
    let directive =
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_directive(log_level));
    let env_filter = EnvFilter::try_new(&directive)
        .map_err(|e| Error::Config(format!("Invalid log filter '{directive}': {e}")))?;

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer.json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .init();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_directive_scopes_panelgate_crates() {
        let d = default_directive("debug");
        assert!(d.starts_with("warn,"));
        assert!(d.contains("panelgate_server=debug"));
        assert!(d.contains("panelgate_core=debug"));
    }

    #[test]
    fn default_directive_parses() {
        assert!(EnvFilter::try_new(default_directive("info")).is_ok());
    }
}
