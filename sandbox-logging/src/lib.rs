//! Tracing setup shared by the sandbox binaries.
//!
//! Configured through `SANDBOX_LOG_*` environment variables. `RUST_LOG`, when
//! set, takes precedence over `SANDBOX_LOG_LEVEL`. `SANDBOX_LOG_TAGS` keeps
//! only events emitted inside spans carrying matching fields, e.g.
//! `sandbox_id:sbx-42,operation_id:*`.

use std::{
    collections::HashMap,
    env,
    io::{self, Write},
    path::{Path, PathBuf},
};
use tracing::{field::Visit, span, subscriber::Interest, Metadata, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::MakeWriter,
    layer::{Context, Layer},
    prelude::*,
    registry, EnvFilter,
};

// --- Custom "Tee" Writer ---
struct Tee<A, B> {
    a: A,
    b: B,
}

impl<A, B> Write for Tee<A, B>
where
    A: Write,
    B: Write,
{
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let res_a = self.a.write(buf);
        let res_b = self.b.write(buf);
        res_a.or(res_b)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.a.flush()?;
        self.b.flush()
    }
}

#[derive(Clone)]
struct MakeTee<A, B> {
    make_a: A,
    make_b: B,
}

impl<'a, A, B, W1, W2> MakeWriter<'a> for MakeTee<A, B>
where
    A: MakeWriter<'a, Writer = W1>,
    B: MakeWriter<'a, Writer = W2>,
    W1: Write + 'a,
    W2: Write + 'a,
{
    type Writer = Tee<W1, W2>;
    fn make_writer(&'a self) -> Self::Writer {
        Tee {
            a: self.make_a.make_writer(),
            b: self.make_b.make_writer(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Console,
    File,
    Both,
    Off,
}

impl LogOutput {
    fn parse(value: &str) -> Self {
        match value {
            "file" => Self::File,
            "both" => Self::Both,
            "off" | "none" => Self::Off,
            _ => Self::Console,
        }
    }

    fn console(self) -> bool {
        matches!(self, Self::Console | Self::Both)
    }

    fn file(self) -> bool {
        matches!(self, Self::File | Self::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Human,
    Json,
}

/// A `key:value` span field filter. A value of `*` only requires the key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    fn matches(&self, fields: &HashMap<String, String>) -> bool {
        fields
            .get(&self.key)
            .is_some_and(|value| self.value == "*" || value.contains(&self.value))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: String,
    pub output: LogOutput,
    pub format: LogFormat,
    pub file_path: PathBuf,
    pub tags: Vec<Tag>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output: LogOutput::Console,
            format: LogFormat::Human,
            file_path: PathBuf::from("/tmp/sandbox-worker.log"),
            tags: Vec::new(),
        }
    }
}

impl LogSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build settings from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        Self {
            level: lookup("SANDBOX_LOG_LEVEL").unwrap_or(defaults.level),
            output: lookup("SANDBOX_LOG_OUTPUT")
                .map(|v| LogOutput::parse(&v))
                .unwrap_or(defaults.output),
            format: match lookup("SANDBOX_LOG_FORMAT").as_deref() {
                Some("json") => LogFormat::Json,
                _ => LogFormat::Human,
            },
            file_path: lookup("SANDBOX_LOG_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.file_path),
            tags: lookup("SANDBOX_LOG_TAGS")
                .map(|v| parse_tags(&v))
                .unwrap_or_default(),
        }
    }
}

pub fn parse_tags(raw: &str) -> Vec<Tag> {
    raw.split(',')
        .filter_map(|s| {
            let (key, value) = s.split_once(':')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some(Tag {
                key: key.to_string(),
                value: value.trim().to_string(),
            })
        })
        .collect()
}

// --- Tag-Based Filtering Logic ---
struct TagFilterLayer {
    filters: Vec<Tag>,
}

impl<S> Layer<S> for TagFilterLayer
where
    S: Subscriber + for<'lookup> tracing_subscriber::registry::LookupSpan<'lookup>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut fields = HashMap::new();
        attrs.record(&mut FieldVisitor(&mut fields));
        span.extensions_mut().insert(fields);
    }

    fn register_callsite(&self, _meta: &'static Metadata<'static>) -> Interest {
        // The verdict depends on the current span, so it cannot be cached.
        if self.filters.is_empty() {
            Interest::always()
        } else {
            Interest::sometimes()
        }
    }

    fn enabled(&self, meta: &Metadata<'_>, ctx: Context<'_, S>) -> bool {
        if self.filters.is_empty() || meta.is_span() {
            return true;
        }

        // With tags set, events outside any span are dropped.
        let Some(scope) = ctx.current_span().id().and_then(|id| ctx.span_scope(id)) else {
            return false;
        };

        let mut all_fields = HashMap::new();
        for span_ref in scope {
            if let Some(fields) = span_ref.extensions().get::<HashMap<String, String>>() {
                for (k, v) in fields {
                    all_fields.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }
        }

        self.filters.iter().all(|filter| filter.matches(&all_fields))
    }
}

struct FieldVisitor<'a>(&'a mut HashMap<String, String>);

impl Visit for FieldVisitor<'_> {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.0
            .insert(field.name().to_string(), format!("{value:?}"));
    }
}

fn env_filter(level: &str) -> EnvFilter {
    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    for noisy in ["sqlx=warn", "tokio=warn"] {
        if let Ok(directive) = noisy.parse() {
            filter = filter.add_directive(directive);
        }
    }
    filter
}

/// Initializes the global tracing subscriber. Keep the returned guard alive
/// for as long as file logging should keep flushing.
pub fn init_subscriber(settings: &LogSettings) -> Option<WorkerGuard> {
    let is_json = settings.format == LogFormat::Json;
    let subscriber = registry()
        .with(env_filter(&settings.level))
        .with(TagFilterLayer {
            filters: settings.tags.clone(),
        });

    let log_path = Path::new(&settings.file_path);
    let log_dir = log_path.parent().unwrap_or_else(|| Path::new("/tmp"));
    let log_filename = log_path
        .file_name()
        .unwrap_or("sandbox-worker.log".as_ref());

    let mut guard: Option<WorkerGuard> = None;

    match (settings.output.console(), settings.output.file()) {
        (true, true) => {
            let file_appender = tracing_appender::rolling::daily(log_dir, log_filename);
            let (non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);
            guard = Some(file_guard);

            let tee_writer = MakeTee {
                make_a: std::io::stdout,
                make_b: non_blocking,
            };

            let fmt_layer = tracing_subscriber::fmt::layer().with_writer(tee_writer);
            if is_json {
                subscriber.with(fmt_layer.json()).init();
            } else {
                subscriber.with(fmt_layer).init();
            }
        }
        (true, false) => {
            let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stdout);
            if is_json {
                subscriber.with(fmt_layer.json()).init();
            } else {
                subscriber.with(fmt_layer).init();
            }
        }
        (false, true) => {
            let file_appender = tracing_appender::rolling::daily(log_dir, log_filename);
            let (non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);
            guard = Some(file_guard);

            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking);
            if is_json {
                subscriber.with(fmt_layer.json()).init();
            } else {
                subscriber.with(fmt_layer).init();
            }
        }
        (false, false) => subscriber.init(),
    }

    guard
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_without_variables() {
        let settings = LogSettings::from_lookup(lookup(&[]));

        assert_eq!(settings, LogSettings::default());
        assert_eq!(settings.output, LogOutput::Console);
    }

    #[test]
    fn reads_sandbox_variables() {
        let settings = LogSettings::from_lookup(lookup(&[
            ("SANDBOX_LOG_LEVEL", "debug"),
            ("SANDBOX_LOG_OUTPUT", "both"),
            ("SANDBOX_LOG_FORMAT", "json"),
            ("SANDBOX_LOG_FILE", "/var/log/sandbox/worker.log"),
            ("SANDBOX_LOG_TAGS", "sandbox_id:sbx-1, operation_id:*"),
        ]));

        assert_eq!(settings.level, "debug");
        assert_eq!(settings.output, LogOutput::Both);
        assert_eq!(settings.format, LogFormat::Json);
        assert_eq!(settings.file_path, PathBuf::from("/var/log/sandbox/worker.log"));
        assert_eq!(settings.tags.len(), 2);
        assert_eq!(settings.tags[1].key, "operation_id");
        assert_eq!(settings.tags[1].value, "*");
    }

    #[test]
    fn malformed_tags_are_skipped() {
        let tags = parse_tags("sandbox_id,:x,kind:create");

        assert_eq!(
            tags,
            vec![Tag {
                key: "kind".to_string(),
                value: "create".to_string()
            }]
        );
    }

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn tag_filter_keeps_only_matching_spans() {
        let capture = Capture::default();
        let writer = capture.clone();
        let subscriber = registry()
            .with(TagFilterLayer {
                filters: parse_tags("sandbox_id:sbx-1"),
            })
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(move || writer.clone()),
            );

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("outside any span");
            tracing::info_span!("attempt", sandbox_id = "sbx-2").in_scope(|| {
                tracing::info!("other sandbox");
            });
            tracing::info_span!("attempt", sandbox_id = "sbx-1").in_scope(|| {
                tracing::info!("wanted sandbox");
            });
        });

        let output = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("wanted sandbox"));
        assert!(!output.contains("other sandbox"));
        assert!(!output.contains("outside any span"));
    }
}
