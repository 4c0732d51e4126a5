//! Tracing subscriber setup.
//!
//! Logs always go to stderr. When lines are delivered on stdout the
//! process usually runs under Telegraf's `execd` input, which classifies
//! stderr lines by an `E!`/`W!`/`I!`/`D!` prefix, so that format is used
//! instead of the default one.

use std::fmt;

use tracing::{Event, Level, Subscriber};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;

/// `RUST_LOG` wins over `directive`.
pub fn init(directive: &str, telegraf_prefix: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if telegraf_prefix {
        builder.with_ansi(false).event_format(TelegrafFormat).init();
    } else {
        builder.init();
    }
}

/// `I! [loxinflux] message key=value`
pub struct TelegrafFormat;

fn prefix(level: Level) -> &'static str {
    if level == Level::ERROR {
        "E!"
    } else if level == Level::WARN {
        "W!"
    } else if level == Level::INFO {
        "I!"
    } else if level == Level::DEBUG {
        "D!"
    } else {
        "T!"
    }
}

impl<S, N> FormatEvent<S, N> for TelegrafFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(writer, "{} [loxinflux] ", prefix(*event.metadata().level()))?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io;
    use std::sync::{Arc, Mutex};

    use tracing_subscriber::fmt::MakeWriter;

    use super::*;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'w> MakeWriter<'w> for Captured {
        type Writer = Self;

        fn make_writer(&'w self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn prefixes_follow_level() {
        assert_eq!(prefix(Level::ERROR), "E!");
        assert_eq!(prefix(Level::WARN), "W!");
        assert_eq!(prefix(Level::INFO), "I!");
        assert_eq!(prefix(Level::DEBUG), "D!");
        assert_eq!(prefix(Level::TRACE), "T!");
    }

    #[test]
    fn telegraf_format_writes_prefixed_lines() {
        let captured = Captured::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(captured.clone())
            .with_max_level(Level::DEBUG)
            .with_ansi(false)
            .event_format(TelegrafFormat)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(attempt = 2, "Miniserver session reconnecting");
            tracing::debug!("polling devices");
        });

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(
            lines,
            vec![
                "W! [loxinflux] Miniserver session reconnecting attempt=2",
                "D! [loxinflux] polling devices",
            ]
        );
    }
}
