//! Logging utilities for caprel
//!
//! This module sets up the tracing subscriber used across the toolkit.

use std::fs::OpenOptions;
use std::sync::Arc;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

/// Custom event formatter for caprel logs
pub struct CaprelFormatter;

impl<S, N> FormatEvent<S, N> for CaprelFormatter
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
        let now = chrono::Local::now();
        write!(writer, "[{} ", now.format("%Y-%m-%d %H:%M:%S%.3f"))?;

        let level: Level = *event.metadata().level();
        match level {
            Level::TRACE => write!(writer, "TRACE")?,
            Level::DEBUG => write!(writer, "DEBUG")?,
            Level::INFO => write!(writer, "INFO ")?,
            Level::WARN => write!(writer, "WARN ")?,
            Level::ERROR => write!(writer, "ERROR")?,
        }
        write!(writer, "] ")?;

        if let Some(module_path) = event.metadata().module_path() {
            write!(writer, "[{}] ", module_path)?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Initialize the logging system.
///
/// Logs go to stdout, and additionally to `log_file` when one is
/// configured and can be opened.
pub fn init_logging(log_level: Level, log_file: Option<&str>) {
    let file = log_file.and_then(|path: &str| {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(file),
            Err(e) => {
                eprintln!("Failed to open log file {}: {}", path, e);
                None
            }
        }
    });

    match file {
        Some(file) => {
            let subscriber = tracing_subscriber::fmt()
                .with_max_level(log_level)
                .event_format(CaprelFormatter)
                .with_writer(std::io::stdout.and(Arc::new(file)))
                .finish();
            let _ = tracing::subscriber::set_global_default(subscriber);
        }
        None => {
            let subscriber = tracing_subscriber::fmt()
                .with_max_level(log_level)
                .event_format(CaprelFormatter)
                .finish();
            let _ = tracing::subscriber::set_global_default(subscriber);
        }
    }
}
