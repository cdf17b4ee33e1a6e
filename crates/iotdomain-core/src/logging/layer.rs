//! tracing Layer writing JSONL, and subscriber setup

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use super::entry::LogEntry;
use super::writer::PublisherLogWriter;

/// Writes every event to the publisher's JSONL file
pub struct JsonlLayer {
    writer: Arc<PublisherLogWriter>,
}

impl JsonlLayer {
    pub fn new(logs_dir: impl AsRef<std::path::Path>, publisher: impl Into<String>) -> std::io::Result<Self> {
        Ok(Self {
            writer: Arc::new(PublisherLogWriter::new(logs_dir, publisher)?),
        })
    }

    pub fn log_path(&self) -> &std::path::Path {
        self.writer.path()
    }
}

impl<S> Layer<S> for JsonlLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let (msg, fields) = EventFields::of(event).into_parts();

        let mut entry = LogEntry::new(
            metadata.level().as_str().to_lowercase(),
            self.writer.publisher(),
            metadata.target(),
            msg,
        );
        if let Some(fields) = fields {
            entry = entry.with_fields(fields);
        }
        if let Some(scope) = ctx.event_scope(event) {
            let spans: Vec<&str> = scope.from_root().map(|span| span.name()).collect();
            if !spans.is_empty() {
                entry = entry.with_span(spans.join(" > "));
            }
        }

        // a failing log write must never take the publisher down
        let _ = self.writer.write(&entry);
    }
}

/// Field values of one event, keyed by field name
#[derive(Default)]
struct EventFields(Map<String, Value>);

impl EventFields {
    fn of(event: &Event<'_>) -> Self {
        let mut fields = Self::default();
        event.record(&mut fields);
        fields
    }

    /// Split off the `message` field; the rest is `None` when empty
    fn into_parts(mut self) -> (String, Option<Value>) {
        let msg = match self.0.remove("message") {
            Some(Value::String(msg)) => msg,
            Some(other) => other.to_string(),
            None => String::new(),
        };
        let rest = (!self.0.is_empty()).then_some(Value::Object(self.0));
        (msg, rest)
    }

    fn put(&mut self, field: &Field, value: Value) {
        self.0.insert(field.name().to_owned(), value);
    }
}

macro_rules! record_as_json {
    ($($method:ident: $ty:ty),* $(,)?) => {
        $(
            fn $method(&mut self, field: &Field, value: $ty) {
                self.put(field, Value::from(value));
            }
        )*
    };
}

impl Visit for EventFields {
    record_as_json!(record_i64: i64, record_u64: u64, record_f64: f64, record_bool: bool, record_str: &str);

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.put(field, Value::String(format!("{:?}", value)));
    }

    /// Errors are flattened with their sources: `outer: inner: root`
    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        let mut chain = value.to_string();
        let mut source = value.source();
        while let Some(cause) = source {
            chain.push_str(": ");
            chain.push_str(&cause.to_string());
            source = cause.source();
        }
        self.put(field, Value::String(chain));
    }
}

/// Builds the global subscriber: env filter, console output and an optional
/// JSONL file.
pub struct LoggingBuilder {
    filter: String,
    console: bool,
    jsonl: Option<(PathBuf, String)>,
}

impl LoggingBuilder {
    /// `filter` is used when `RUST_LOG` is not set
    pub fn new(filter: impl Into<String>) -> Self {
        Self {
            filter: filter.into(),
            console: true,
            jsonl: None,
        }
    }

    pub fn no_console(mut self) -> Self {
        self.console = false;
        self
    }

    /// Also write `<logs_dir>/<date>_<publisher>.jsonl`
    pub fn with_jsonl(mut self, logs_dir: impl Into<PathBuf>, publisher: impl Into<String>) -> Self {
        self.jsonl = Some((logs_dir.into(), publisher.into()));
        self
    }

    /// Install as the global default subscriber.
    ///
    /// Fails if the log file cannot be opened or a global subscriber is
    /// already set.
    pub fn init(self) -> std::io::Result<()> {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.filter));
        let jsonl = match &self.jsonl {
            Some((dir, publisher)) => Some(JsonlLayer::new(dir, publisher.as_str())?),
            None => None,
        };
        let console = self
            .console
            .then(|| {
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr)
            });

        tracing_subscriber::registry()
            .with(filter)
            .with(console)
            .with(jsonl)
            .try_init()
            .map_err(std::io::Error::other)
    }
}
