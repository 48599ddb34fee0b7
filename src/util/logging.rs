use tracing_subscriber::{EnvFilter, fmt};

/// Initializes tracing from `RUST_LOG` (default `info`).
///
/// With `json` set, events are written as one JSON object per line, which is
/// what log shippers expect for the `audit` target.
pub fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_writer(std::io::stderr);

    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}
