use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::errors::{OrchestratorError, OrchestratorResult};

pub const DEFAULT_LOG_FILTER: &str = "rig_it_orchestrator=info";

/// Installs the global subscriber. `RUST_LOG` overrides the default filter.
/// A second call fails instead of replacing the first subscriber.
pub fn init(json: bool) -> OrchestratorResult<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let fmt_layer = if json {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true)
            .boxed()
    } else {
        fmt::layer().with_target(true).with_thread_ids(true).boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| OrchestratorError::Config(format!("tracing already initialised: {e}")))
}
