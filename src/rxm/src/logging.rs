use std::fmt;

use ansi_term::Colour;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::{self, FormatEvent, FormatFields};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;

use crate::config::Config;

/// Environment variable overriding the configured log filter.
pub const LOG_ENV: &str = "RXM_LOG";

struct FmtLevel<'a> {
    level: &'a Level,
    ansi: bool,
}

const TRACE_STR: &str = "TRACE";
const DEBUG_STR: &str = "DEBUG";
const INFO_STR: &str = " INFO";
const WARN_STR: &str = " WARN";
const ERROR_STR: &str = "ERROR";

impl<'a> fmt::Display for FmtLevel<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (s, colour) = match *self.level {
            Level::TRACE => (TRACE_STR, Colour::Purple),
            Level::DEBUG => (DEBUG_STR, Colour::Blue),
            Level::INFO => (INFO_STR, Colour::Green),
            Level::WARN => (WARN_STR, Colour::Yellow),
            Level::ERROR => (ERROR_STR, Colour::Red),
        };
        if self.ansi {
            write!(f, "{}", colour.paint(s))
        } else {
            f.pad(s)
        }
    }
}

/// Writes `[time LEVEL file:line] message`, or the event target in place of
/// the location when the callsite has none.
struct RxmFormatter {
    ansi: bool,
}

impl<S, N> FormatEvent<S, N> for RxmFormatter
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
        let meta = event.metadata();
        let level = FmtLevel {
            level: meta.level(),
            ansi: self.ansi && writer.has_ansi_escapes(),
        };
        let now = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.6f");
        match (meta.file(), meta.line()) {
            (Some(file), Some(line)) => write!(writer, "[{} {} {}:{}] ", now, level, file, line)?,
            _ => write!(writer, "[{} {} {}] ", now, level, meta.target())?,
        }
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Installs the global subscriber. `RXM_LOG` takes precedence over
/// `config.log_level`. Fails if a global subscriber is already set.
pub fn init_log(config: &Config, ansi: bool) -> anyhow::Result<()> {
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::builder()
        .with_default_directive(config.log_level.parse()?)
        .with_env_var(LOG_ENV)
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .event_format(RxmFormatter { ansi })
                .with_filter(filter),
        )
        .try_init()?;
    tracing::info!(env = LOG_ENV, "logging initialized");
    Ok(())
}
