//! Log formatter for applications embedding the client.
//!
//! Lines look like
//! `[2024-05-01 12:00:00.000] [amqp-session        ] [ℹ INFO   ] channel open channel=1`.

use std::fmt;
use std::io::IsTerminal;

use anyhow::Result;
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

const COLOR_RESET: &str = "\x1b[0m";
const COLOR_CYAN: &str = "\x1b[36m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_BRIGHT_YELLOW: &str = "\x1b[93m";
const COLOR_BRIGHT_RED: &str = "\x1b[91m";
const COLOR_BRIGHT_GRAY: &str = "\x1b[90m";

const SOURCE_WIDTH: usize = 20;
const LOG_LEVEL_WIDTH: usize = 7;

/// Formatter printing timestamp, source crate, level, message and fields
pub struct AmqpLogFormatter {
    color_enabled: bool,
}

impl AmqpLogFormatter {
    /// Formatter with colors when stdout is a terminal
    pub fn new() -> Self {
        Self {
            color_enabled: is_terminal(),
        }
    }

    /// Formatter without ANSI colors
    pub fn plain() -> Self {
        Self {
            color_enabled: false,
        }
    }

    /// `amqp_session::pool` becomes `amqp-session`
    fn format_source(&self, target: &str) -> String {
        let name = target.split("::").next().unwrap_or(target).replace('_', "-");
        if name.chars().count() > SOURCE_WIDTH {
            let cut: String = name.chars().take(SOURCE_WIDTH - 1).collect();
            format!("{cut}…")
        } else {
            format!("{:<width$}", name, width = SOURCE_WIDTH)
        }
    }

    fn format_log_level(&self, level: &tracing::Level) -> String {
        let level_str = match *level {
            tracing::Level::ERROR => "✗ ERROR",
            tracing::Level::WARN => "⚠ WARN",
            tracing::Level::INFO => "ℹ INFO",
            tracing::Level::DEBUG => "◦ DEBUG",
            tracing::Level::TRACE => "◦ TRACE",
        };
        format!("{:<width$}", level_str, width = LOG_LEVEL_WIDTH + 2)
    }

    fn color_for_level(&self, level: &tracing::Level) -> &'static str {
        if !self.color_enabled {
            return "";
        }
        match *level {
            tracing::Level::ERROR => COLOR_BRIGHT_RED,
            tracing::Level::WARN => COLOR_BRIGHT_YELLOW,
            tracing::Level::INFO => COLOR_GREEN,
            tracing::Level::DEBUG | tracing::Level::TRACE => COLOR_BRIGHT_GRAY,
        }
    }
}

impl Default for AmqpLogFormatter {
    fn default() -> Self {
        Self::new()
    }
}

impl<S, N> FormatEvent<S, N> for AmqpLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let metadata = event.metadata();
        let level = metadata.level();

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let color = self.color_for_level(level);
        let reset = if self.color_enabled { COLOR_RESET } else { "" };
        let cyan = if self.color_enabled { COLOR_CYAN } else { "" };

        write!(
            writer,
            "{}[{}] [{}] [{}{}{}] ",
            cyan,
            timestamp,
            self.format_source(metadata.target()),
            color,
            self.format_log_level(level),
            reset
        )?;
        write!(writer, "{}", visitor.message)?;
        for (name, value) in &visitor.fields {
            write!(writer, " {name}={value}")?;
        }
        writeln!(writer, "{reset}")
    }
}

/// Collects the message and the remaining fields of an event
#[derive(Default)]
struct FieldVisitor {
    message: String,
    fields: Vec<(&'static str, String)>,
}

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        let rendered = format!("{value:?}");
        if field.name() == "message" {
            self.message = rendered;
        } else {
            self.fields.push((field.name(), rendered));
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push((field.name(), value.to_string()));
        }
    }
}

fn is_terminal() -> bool {
    if std::env::var("TERM").unwrap_or_default() == "dumb" {
        return false;
    }
    std::io::stdout().is_terminal()
}

/// Install a global subscriber using [`AmqpLogFormatter`] at `level` for the
/// client crates and `info` for everything else.
pub fn init(level: &str) -> Result<()> {
    let env_filter = EnvFilter::new("info")
        .add_directive(format!("amqp_wire={level}").parse()?)
        .add_directive(format!("amqp_session={level}").parse()?)
        .add_directive(format!("amqp_client={level}").parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .event_format(AmqpLogFormatter::new())
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install log subscriber: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn capture(f: impl FnOnce()) -> String {
        let out = Capture::default();
        let sink = out.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || sink.clone())
            .event_format(AmqpLogFormatter::plain())
            .finish();
        tracing::subscriber::with_default(subscriber, f);
        let bytes = out.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_line_layout() {
        let line = capture(|| tracing::warn!(channel = 3, reply_code = 406, "channel closed by server"));
        assert!(line.starts_with('['), "{line}");
        assert!(line.contains("[amqp-client         ]"), "{line}");
        assert!(line.contains("⚠ WARN"), "{line}");
        assert!(line.ends_with("channel closed by server channel=3 reply_code=406\n"), "{line}");
        assert!(!line.contains('\x1b'));
    }

    #[test]
    fn test_long_source_truncated() {
        let formatter = AmqpLogFormatter::plain();
        let source = formatter.format_source("a_very_long_embedding_application::module");
        assert_eq!(source.chars().count(), SOURCE_WIDTH);
        assert!(source.ends_with('…'));
    }

    #[test]
    fn test_init_rejects_bad_level() {
        assert!(init("not a level").is_err());
    }
}
