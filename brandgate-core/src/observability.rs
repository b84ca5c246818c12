//! Log setup for processes embedding the governance layer.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::error::{Error, ErrorDetails};

#[derive(Clone, Copy, Debug, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Everything at `warn` and above, plus our own informational lines. The
/// fail-open and degraded-mode warnings this crate emits must be visible by
/// default or operators will not notice a store outage.
const DEFAULT_LOG_DIRECTIVES: &str = "warn,brandgate_core=info";

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the built-in directives when set. Call
/// once at process start; a second call returns an error from the registry.
pub fn setup_logs(log_format: LogFormat) -> Result<(), Error> {
    let env_var_name = "RUST_LOG";
    let filter = if std::env::var(env_var_name).is_ok() {
        EnvFilter::builder()
            .with_env_var(env_var_name)
            .from_env()
            .map_err(|e| {
                Error::new(ErrorDetails::Observability {
                    message: format!("Invalid `{env_var_name}` environment variable: {e}"),
                })
            })?
    } else {
        EnvFilter::builder()
            .parse(DEFAULT_LOG_DIRECTIVES)
            .map_err(|e| {
                Error::new(ErrorDetails::InternalError {
                    message: format!(
                        "Failed to parse internal log directives - this should never happen: {e}"
                    ),
                })
            })?
    };

    let log_layer = match log_format {
        LogFormat::Pretty => {
            Box::new(tracing_subscriber::fmt::layer()) as Box<dyn Layer<_> + Send + Sync>
        }
        LogFormat::Json => Box::new(tracing_subscriber::fmt::layer().json()),
    };

    tracing_subscriber::registry()
        .with(log_layer.with_filter(filter))
        .try_init()
        .map_err(|e| {
            Error::new(ErrorDetails::Observability {
                message: format!("Failed to install tracing subscriber: {e}"),
            })
        })
}
