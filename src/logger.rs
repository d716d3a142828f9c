//! Diagnostics formatting for the agent's own logs.
//!
//! The agent reports on itself through `tracing`, which is a sink
//! separate from Loki: a delivery failure logged here can never loop back
//! into the buffer it failed to drain. Every line carries a fixed prefix
//! so agent-internal output is easy to filter out of the host
//! application's logs:
//!
//! ```text
//! loki_shipper | WARN | push failed, backing off error=... consecutive_failures=3
//! ```

use std::fmt;

use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::{self, FormatEvent, FormatFields};
use tracing_subscriber::fmt::{FmtContext, FormattedFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

/// Prefix identifying agent-internal log lines.
const PREFIX: &str = "loki_shipper";

/// Log formatter producing `loki_shipper | LEVEL | spans: message fields`.
#[derive(Clone, Copy, Debug)]
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
        write!(&mut writer, "{PREFIX} | {} | ", event.metadata().level())?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;
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

/// Installs a global subscriber using [`Formatter`] and the given filter
/// directive (e.g. `"info"` or `"loki_shipper=debug"`). Returns quietly
/// if a subscriber is already installed, so embedding applications that
/// configure their own keep it.
pub fn init(directive: &str) {
    let filter = EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .event_format(Formatter)
        .with_env_filter(filter)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::debug!("global subscriber already set, keeping it");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init("debug");
        init("info");
    }

    #[test]
    fn formatter_is_copyable() {
        let formatter = Formatter;
        let copy = formatter;
        let _ = (formatter, copy);
    }
}
