use std::{
    fmt::{self, Write as _},
    str::FromStr as _,
};

use chrono::Utc;
use chrono_tz::Tz;
use tracing::{
    field::{Field, Visit},
    Event, Subscriber,
};
use tracing_subscriber::{
    fmt::{format::Writer, FmtContext, FormatEvent, FormatFields, Layer, MakeWriter},
    layer,
    registry::LookupSpan,
    Layer as _,
};

use super::LoggingConfiguration;

/// Builds the layer writing events to `writer` in the configured format.
pub fn build_formatting_layer<S, W>(config: &LoggingConfiguration, writer: W) -> Box<dyn layer::Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    if config.log_format_json {
        return Layer::new()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_target(true)
            .with_writer(writer)
            .boxed();
    }

    Layer::new()
        .event_format(LineFormat::new(local_timezone()))
        .with_writer(writer)
        .boxed()
}

fn local_timezone() -> Tz {
    iana_time_zone::get_timezone()
        .ok()
        .and_then(|name| Tz::from_str(&name).ok())
        .unwrap_or(Tz::UTC)
}

/// Renders one line per event:
///
/// `2026-01-31 09:30:00 CET | SLUICE | INFO | sluice_core::orchestrator{task} | service="web" attempt=2 | Update started.`
///
/// Span names are listed from the root. The fields and message sections are left out when empty.
struct LineFormat {
    timezone: Tz,
}

impl LineFormat {
    fn new(timezone: Tz) -> Self {
        Self { timezone }
    }
}

impl<S, N> FormatEvent<S, N> for LineFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(&self, ctx: &FmtContext<'_, S, N>, mut writer: Writer<'_>, event: &Event<'_>) -> fmt::Result {
        let metadata = event.metadata();
        let now = Utc::now().with_timezone(&self.timezone);

        write!(
            writer,
            "{} | SLUICE | {} | {}",
            now.format("%Y-%m-%d %H:%M:%S %Z"),
            metadata.level(),
            metadata.target()
        )?;

        if let Some(scope) = ctx.event_scope() {
            let names: Vec<_> = scope.from_root().map(|span| span.name()).collect();
            if !names.is_empty() {
                write!(writer, "{{{}}}", names.join(":"))?;
            }
        }

        let mut fields = EventFields::default();
        event.record(&mut fields);

        if !fields.pairs.is_empty() {
            write!(writer, " | {}", fields.pairs)?;
        }
        if !fields.message.is_empty() {
            write!(writer, " | {}", fields.message)?;
        }

        writeln!(writer)
    }
}

/// Collects an event's message separately from its other fields.
#[derive(Default)]
struct EventFields {
    message: String,
    pairs: String,
}

impl EventFields {
    fn push_pair(&mut self, field: &Field, value: fmt::Arguments<'_>) {
        if !self.pairs.is_empty() {
            self.pairs.push(' ');
        }
        // Writing into a `String` cannot fail.
        let _ = write!(self.pairs, "{}={}", field.name(), value);
    }
}

impl Visit for EventFields {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            self.push_pair(field, format_args!("{:?}", value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            self.push_pair(field, format_args!("{:?}", value));
        }
    }
}
