#![deny(unused_crate_dependencies)]

//! Logging bootstrap for the exporter.
//!
//! The format of the logs in `stdout` can be `text` or `json` and is set
//! by the `LOG_FORMAT` env variable; the root threshold comes from
//! `LOG_LEVEL` (overridable per target via `RUST_LOG`).
//!
//! When a `SENTRY_URL` is provided, errors are additionally forwarded to
//! sentry; see <https://docs.sentry.io/platforms/rust/>.

use std::{borrow::Cow, str::FromStr};

use sentry::{types::Dsn, ClientInitGuard};
use std::backtrace::Backtrace;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use tracing::{debug, error, info, trace, warn};

fn get_sentry_url() -> Option<Dsn> {
    if let Ok(sentry_url) = std::env::var("SENTRY_URL") {
        if let Ok(sentry_url) = Dsn::from_str(sentry_url.as_str()) {
            return Some(sentry_url);
        }
    }
    None
}

fn env_filter() -> EnvFilter {
    // RUST_LOG wins when set; LOG_LEVEL provides the root threshold
    // otherwise.
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string());
        EnvFilter::new(level.to_lowercase())
    })
}

/// Initialize logging with tracing and set up the log format.
///
/// If a sentry URL is provided via an environment variable, this
/// function will also initialize sentry. Returns a sentry client guard
/// that must be held for the lifetime of the process.
#[must_use]
pub fn init() -> Option<ClientInitGuard> {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    match log_format.as_str() {
        "text" | "plain" => {
            tracing_subscriber::registry()
                .with(fmt::Layer::default())
                .with(env_filter())
                .init();
        }
        "json" => {
            let timer = tracing_subscriber::fmt::time::UtcTime::rfc_3339();
            // must be set before sentry hook for sentry to function
            install_pretty_panic_hook();

            tracing_subscriber::registry()
                .with(
                    fmt::Layer::default()
                        .with_file(true)
                        .with_line_number(true)
                        .with_timer(timer)
                        .json(),
                )
                .with(env_filter())
                .init();
        }
        _ => panic!("LOG_FORMAT has an unexpected value {}", log_format),
    };

    get_sentry_url().map(|sentry_url| {
        let options = sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: std::env::var("SENTRY_ENVIRONMENT").ok().map(Cow::from),
            attach_stacktrace: true,
            ..Default::default()
        };

        sentry::init((sentry_url, options))
    })
}

/// Format panics like tracing::error
fn install_pretty_panic_hook() {
    // This hook does not use the previous one set because it leads to 2 logs:
    // the first is the default panic log and the second is from this code. To avoid this situation,
    // hook must be installed first
    std::panic::set_hook(Box::new(move |panic_info| {
        let backtrace = Backtrace::capture();
        let timestamp = chrono::Utc::now();
        let panic_message = if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.as_str()
        } else if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s
        } else {
            "Panic occurred without additional info"
        };

        let panic_location = panic_info
            .location()
            .map(|val| val.to_string())
            .unwrap_or_else(|| "Unknown location".to_owned());

        let backtrace_str = format!("{}", backtrace);
        let timestamp_str = format!("{}", timestamp.format("%Y-%m-%dT%H:%M:%S%.fZ"));

        println!(
            "{}",
            serde_json::json!({
                "timestamp": timestamp_str,
                "level": "CRITICAL",
                "fields": {
                    "message": panic_message,
                    "location": panic_location,
                    "backtrace": backtrace_str,
                }
            })
        );
    }));
}
