//! Broker logging - stderr plus a rolling `engine.log` beside the executable

use anyhow::Result;
use std::path::Path;
use tracing::{Event, Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

fn iso_timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// ISO-8601 timestamps with millisecond precision (stderr layer).
struct IsoTime;

impl FormatTime for IsoTime {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", iso_timestamp())
    }
}

/// `engine.log` line format: ISO-8601 timestamp plus a level tag from the
/// file's closed vocabulary {DEBUG, WARNING, CRITICAL, FATAL}.
///
/// Tracing levels map onto it: TRACE, DEBUG, and INFO all land in DEBUG,
/// WARN becomes WARNING, ERROR becomes CRITICAL. FATAL is reserved for the
/// host process reporting an abort; nothing in the broker emits it.
struct EngineLogFormat;

impl EngineLogFormat {
    fn tag(level: &Level) -> &'static str {
        match *level {
            Level::ERROR => "CRITICAL",
            Level::WARN => "WARNING",
            _ => "DEBUG",
        }
    }
}

impl<S, N> FormatEvent<S, N> for EngineLogFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        write!(
            writer,
            "{} {} {}: ",
            iso_timestamp(),
            Self::tag(event.metadata().level()),
            event.metadata().target()
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Initialize logging for the broker: human-readable stderr output plus an
/// `engine.log` file in `log_dir`. Keep the returned guard alive for the
/// process lifetime or buffered log lines are lost.
pub fn init(log_dir: &Path) -> Result<WorkerGuard> {
    let file_appender = tracing_appender::rolling::never(log_dir, "engine.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_timer(IsoTime)
                .with_writer(std::io::stderr),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .event_format(EngineLogFormat)
                .with_writer(file_writer),
        )
        .init();

    Ok(guard)
}
