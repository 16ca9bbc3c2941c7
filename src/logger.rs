use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize process-wide logging. `debug` raises the crate's own target to
/// `debug` level; it never affects dependency targets.
pub fn init(debug: bool) {
    let default_filter = if debug {
        "info,tunnel_core=debug"
    } else {
        "info,tunnel_core=info"
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_line_number(true))
        .init();

    tracing::info!("logging initialized (debug={debug})");
}
