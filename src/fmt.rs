//! Compact formatting helpers for log output.

use std::fmt;

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

use crate::actor::current_id;

/// Wrapper that displays large round numbers compactly.
///
/// Exact multiples of powers of 1000 are shortened:
/// - `1_000` → `1K`
/// - `20_000_000` → `20M`
/// - `3_000_000_000` → `3B`
///
/// Non-round numbers pass through unchanged: `12345` → `12345`.
pub struct FmtN(pub u64);

impl fmt::Display for FmtN {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = self.0;
        const SUFFIXES: &[(u64, &str)] = &[
            (1_000_000_000_000, "T"),
            (1_000_000_000, "B"),
            (1_000_000, "M"),
            (1_000, "K"),
        ];
        for &(divisor, suffix) in SUFFIXES {
            if v >= divisor && v % divisor == 0 {
                return write!(f, "{}{}", v / divisor, suffix);
            }
        }
        write!(f, "{v}")
    }
}

/// Byte count in binary units, exact multiples only: `8388608` → `8MiB`,
/// `4097` → `4097B`.
pub struct FmtBytes(pub u64);

impl fmt::Display for FmtBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = self.0;
        const UNITS: &[(u64, &str)] = &[(1 << 30, "GiB"), (1 << 20, "MiB"), (1 << 10, "KiB")];
        for &(divisor, unit) in UNITS {
            if v >= divisor && v % divisor == 0 {
                return write!(f, "{}{}", v / divisor, unit);
            }
        }
        write!(f, "{v}B")
    }
}

fn level_color(level: Level) -> &'static str {
    match level {
        Level::ERROR => "\x1b[31m",
        Level::WARN => "\x1b[33m",
        Level::INFO => "\x1b[32m",
        Level::DEBUG => "\x1b[34m",
        Level::TRACE => "\x1b[35m",
    }
}

/// Event formatter that tags every line with the OS thread and the logical
/// thread it runs, instead of a wall-clock timestamp.
///
/// ```text
/// [scx-ctx-worker-2 A17]  INFO round done size=1K mode=parallel
/// ```
pub struct CtxFormat;

impl<S, N> FormatEvent<S, N> for CtxFormat
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
        let thread = std::thread::current();
        write!(
            writer,
            "[{} {}] ",
            thread.name().unwrap_or("<unnamed>"),
            current_id()
        )?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            write!(writer, "{}{level:>5}\x1b[0m ", level_color(level))?;
        } else {
            write!(writer, "{level:>5} ")?;
        }

        let mut line = LineBuilder::default();
        event.record(&mut line);
        writeln!(writer, "{}{}", line.message, line.fields)
    }
}

/// Renders the message and appends every other field as ` key=value`.
/// Unsigned integers go through [`FmtN`].
#[derive(Default)]
struct LineBuilder {
    message: String,
    fields: String,
}

impl LineBuilder {
    fn push(&mut self, field: &Field, value: fmt::Arguments<'_>) {
        use std::fmt::Write as _;
        if field.name() == "message" {
            let _ = self.message.write_fmt(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }
}

impl Visit for LineBuilder {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.push(field, format_args!("{value:?}"));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.push(field, format_args!("{value}"));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.push(field, format_args!("{}", FmtN(value)));
    }
}

/// Install a global subscriber reading `RUST_LOG`, formatted with
/// [`CtxFormat`]. Later calls are ignored.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .event_format(CtxFormat)
        .try_init();
}
