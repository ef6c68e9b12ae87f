//! Log line formatting and subscriber installation.
//!
//! Every line is prefixed with `HARVEST` so agent output is easy to pick out of
//! a shared log stream:
//!
//! ```text
//! HARVEST | INFO | agent started adaptors=3
//! HARVEST | WARN | watchdog{timeout=900s}: restarting stalled adaptor id=adaptor_tail
//! ```

use std::fmt;
use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

use crate::config::log_level::LogLevel;
use crate::errors::AgentError;

/// `HARVEST | LEVEL | spans: message fields`
#[derive(Debug, Clone, Copy)]
pub struct Formatter;

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        write!(&mut writer, "HARVEST | {} | ", metadata.level())?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;

                // Populated by the fmt layer on span creation.
                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Installs the global subscriber. `RUST_LOG`-style directives in `HARVEST_LOG`
/// take precedence over the configured level.
///
/// # Errors
///
/// Fails when the filter does not parse or a global subscriber is already set.
pub fn init(level: LogLevel) -> Result<(), AgentError> {
    let directive =
        std::env::var("HARVEST_LOG").unwrap_or_else(|_| level.as_filter_directive().to_string());
    let env_filter = EnvFilter::try_new(&directive)
        .map_err(|e| AgentError::Logger(format!("invalid log filter '{directive}': {e}")))?;

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(env_filter)
        .event_format(Formatter)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| AgentError::Logger(e.to_string()))
}
