//! Logger construction.
//!
//! The subscriber is returned as a [`Dispatch`] value instead of being
//! installed globally; the binary attaches it to its root future and tests
//! attach their own.

use std::fmt;
use std::path::Path;

use chrono::Local;
use tracing::{Dispatch, Event, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{FmtContext, FormatEvent, FormatFields, FormattedFields, format},
    layer::SubscriberExt,
    registry::LookupSpan,
};

use crate::config::LogLevel;
use crate::error::{Error, Result};

/// Log line layout: `timestamp (source: line) LEVEL message`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineFormat;

impl<S, N> FormatEvent<S, N> for LineFormat
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
        let source = meta
            .file()
            .map(|f| f.rsplit(['/', '\\']).next().unwrap_or(f))
            .unwrap_or_else(|| meta.target());

        write!(
            writer,
            "{} ({}: {}) {} ",
            Local::now().format("%Y-%m-%d %H:%M:%S,%3f"),
            source,
            meta.line().unwrap_or(0),
            meta.level()
        )?;

        // Span context, e.g. "vm{name=vm-a}: "
        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;
                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>()
                    && !fields.is_empty()
                {
                    write!(writer, "{{{fields}}}")?;
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Build the file + stdout logger.
///
/// The returned guard flushes the file writer when dropped and must be kept
/// alive for as long as the dispatch is in use.
pub fn init(log_path: &Path, level: LogLevel) -> Result<(Dispatch, WorkerGuard)> {
    let (subscriber, guard) = file_subscriber(log_path, level)?;
    let dispatch = Dispatch::new(
        subscriber.with(tracing_subscriber::fmt::layer().with_target(false)), // stdout
    );
    Ok((dispatch, guard))
}

/// Subscriber writing only to the log file.
fn file_subscriber(
    log_path: &Path,
    level: LogLevel,
) -> Result<(impl Subscriber + for<'a> LookupSpan<'a> + Send + Sync + use<>, WorkerGuard)> {
    let file_name = log_path
        .file_name()
        .ok_or_else(|| Error::Config(format!("loggpath: {} is not a file", log_path.display())))?;
    let log_dir = match log_path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(log_dir)?;

    // Never rotates; the file is opened in append mode
    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Base filter suppresses noisy libraries, RUST_LOG layers on top (can override if explicit)
    let base = "hyper=warn,reqwest=warn,rustls=warn,h2=warn";
    let level = level.to_string().to_ascii_lowercase();
    let filter = match std::env::var("RUST_LOG") {
        Ok(env) => EnvFilter::new(format!("{base},{level},{env}")),
        Err(_) => EnvFilter::new(format!("{base},{level}")),
    };

    let subscriber = tracing_subscriber::registry().with(filter).with(
        tracing_subscriber::fmt::layer()
            .event_format(LineFormat)
            .with_ansi(false)
            .with_writer(non_blocking),
    );
    Ok((subscriber, guard))
}
