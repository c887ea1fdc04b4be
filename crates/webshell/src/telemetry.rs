use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub const DEFAULT_DIRECTIVE: &str = "webshell=info,app=info,tower_http=warn";

/// Installs the global subscriber. Logs go to stderr so stdout stays free
/// for shell output. `RUST_LOG` overrides `default_directive`.
pub fn init_tracing(default_directive: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let result = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true),
        )
        .try_init();
    if let Err(err) = result {
        tracing::debug!(error = %err, "tracing already initialised");
    }
}
