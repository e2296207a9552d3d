//! Logging setup and helpers for reporting errors as tracing events.
use std::iter::successors;

use tracing::Subscriber;
use tracing_subscriber::{EnvFilter, Layer, fmt::format::FmtSpan, layer::SubscriberExt};

/// Iterate over the `Display` representations of the sources of the given error
/// by recursively calling `std::error::Error::source()`.
pub fn iter_sources<T: std::error::Error>(
    error: &T,
) -> impl std::iter::Iterator<Item = String> + use<'_, T> {
    successors(error.source(), |&error| error.source()).map(ToString::to_string)
}

/// Join the sources of an error into a single line.
pub fn join_sources<T: std::error::Error>(error: &T) -> String {
    iter_sources(error).collect::<Vec<_>>().join(SEP)
}

pub const ERROR: tracing::Level = tracing::Level::ERROR;
pub const WARN: tracing::Level = tracing::Level::WARN;

/// Separator used by `log_error` between error sources.
pub const SEP: &str = " | ";

/// Emit an event for an error, with its `Display` and `Debug` forms and its
/// chain of sources as fields. Defaults to `ERROR`; a level may be given first.
///
/// ```no_run
/// use eyeglass_provision::utils::o11y::{log_error, WARN};
/// use std::io::{Error, ErrorKind};
///
/// let error = Error::new(ErrorKind::Other, "borked");
/// log_error!(error, "connection attempt {} failed", 3);
/// log_error!(WARN, error, "oh no");
/// ```
#[macro_export]
macro_rules! log_error {
    // NOTE: keep the level arms after the plain ones
    ($error:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {
        tracing::event!(
            $crate::utils::o11y::ERROR,
            error = %$error,
            source = %$crate::utils::o11y::join_sources(&$error),
            debug = ?$error,
            $fmt $(, $arg)*
        )
    };

    ($lvl:expr, $error:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {
        tracing::event!(
            $lvl,
            error = %$error,
            source = %$crate::utils::o11y::join_sources(&$error),
            debug = ?$error,
            $fmt $(, $arg)*
        )
    };

    ($error:expr) => {
        tracing::event!(
            $crate::utils::o11y::ERROR,
            error = %$error,
            source = %$crate::utils::o11y::join_sources(&$error),
            debug = ?$error
        )
    };
}

pub use log_error;

/// Closure form of `log_error`, for `inspect_err` and friends.
#[macro_export]
macro_rules! as_error {
    ($lvl:expr, $msg:literal) => {
        |error| $crate::utils::o11y::log_error!($lvl, error, $msg)
    };

    ($msg:literal) => {
        |error| $crate::utils::o11y::log_error!(error, $msg)
    };
}

pub use as_error;

#[derive(Debug, thiserror::Error)]
pub enum BuildSubscriberError {
    #[error("failed to parse filtering directive")]
    Parse(#[from] tracing_subscriber::filter::ParseError),
}

fn parse_span_events(value: &str) -> Option<FmtSpan> {
    value
        .split(',')
        .filter_map(|part| match part.trim().to_lowercase().as_str() {
            "new" => Some(FmtSpan::NEW),
            "enter" => Some(FmtSpan::ENTER),
            "exit" => Some(FmtSpan::EXIT),
            "close" => Some(FmtSpan::CLOSE),
            "none" => Some(FmtSpan::NONE),
            "active" => Some(FmtSpan::ACTIVE),
            "full" => Some(FmtSpan::FULL),
            _ => None,
        })
        .reduce(|lhs, rhs| lhs | rhs)
}

/// Build the subscriber used by the `provision` binary.
///
/// Filtering follows `RUST_LOG` (default `info`); span lifecycle events are
/// enabled through `RUST_LOG_SPAN_EVENTS`, e.g. `new,close`.
pub fn build_subscriber() -> Result<impl Subscriber, BuildSubscriberError> {
    let mut fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_file(true)
        .with_line_number(true);

    if let Some(kind) = std::env::var("RUST_LOG_SPAN_EVENTS")
        .ok()
        .and_then(|value| parse_span_events(&value))
    {
        fmt_layer = fmt_layer.with_span_events(kind);
    }

    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    Ok(tracing_subscriber::registry().with(fmt_layer.with_filter(env_filter)))
}
