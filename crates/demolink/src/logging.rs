//! Tracing setup for binaries embedding demolink.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Install a stderr subscriber.
///
/// `RUST_LOG` wins when set; otherwise `DEMOLINK_LOG` (debug|info|warn|error)
/// picks the level for this crate. `LOG_FORMAT=json` switches to JSON lines.
/// Calling this twice is harmless.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = level_from(std::env::var("DEMOLINK_LOG").ok().as_deref());
        EnvFilter::new(format!("demolink={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn level_from(value: Option<&str>) -> &'static str {
    match value {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}
