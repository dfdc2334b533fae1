//! Logging and tracing setup for Kestrel.
//!
//! `log` records emitted by the dispatch crates are bridged into `tracing`;
//! hooks receive structured copies of every record and, when enabled, span
//! timing events (`kernel.dispatch`, `winograd.stage`, ...).

use once_cell::sync::OnceCell;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Instant;
use tracing::subscriber::DefaultGuard;
use tracing::Subscriber;
use tracing_log::LogTracer;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

pub const LOG_ENV: &str = "KESTREL_LOG";

#[derive(Debug, Clone, Serialize)]
pub struct DispatchLogRecord {
    pub ts: String,
    pub level: String,
    pub target: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<JsonValue>,
}

/// Chrome-trace style event. Spans are reported once, on close, as complete
/// (`"X"`) events carrying their duration; log events are instants (`"i"`).
#[derive(Debug, Clone, Serialize)]
pub struct SpanEvent {
    pub name: String,
    pub cat: String,
    pub ph: String,
    pub ts: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dur: Option<i64>,
    pub pid: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<JsonValue>,
}

type LogHook = Arc<dyn Fn(&DispatchLogRecord) + Send + Sync>;
type SpanHook = Arc<dyn Fn(&[SpanEvent]) + Send + Sync>;

static LOG_HOOK: OnceCell<LogHook> = OnceCell::new();
static SPAN_HOOK: OnceCell<SpanHook> = OnceCell::new();

pub struct LoggingGuard {
    _guard: Option<DefaultGuard>,
}

#[derive(Clone, Debug, Default)]
pub struct LoggingOptions {
    /// Emit span timing events to the span hook.
    pub enable_spans: bool,
    /// Also print formatted records to stderr.
    pub stderr: bool,
    pub pid: i64,
}

pub fn set_log_hook<F>(hook: F)
where
    F: Fn(&DispatchLogRecord) + Send + Sync + 'static,
{
    let _ = LOG_HOOK.set(Arc::new(hook));
}

pub fn set_span_hook<F>(hook: F)
where
    F: Fn(&[SpanEvent]) + Send + Sync + 'static,
{
    let _ = SPAN_HOOK.set(Arc::new(hook));
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_from_env(LOG_ENV))
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the Kestrel subscriber. If a global subscriber already exists the
/// returned guard scopes this one to the current thread.
pub fn init_logging(opts: LoggingOptions) -> LoggingGuard {
    let _ = LogTracer::init();

    let build_subscriber = || {
        let span_layer = opts.enable_spans.then_some(SpanTimingLayer { pid: opts.pid });
        let stderr_layer = opts.stderr.then(|| {
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
        });
        tracing_subscriber::registry()
            .with(env_filter())
            .with(LogBridgeLayer)
            .with(span_layer)
            .with(stderr_layer)
    };

    let guard = match tracing::subscriber::set_global_default(build_subscriber()) {
        Ok(()) => None,
        Err(_) => Some(tracing::subscriber::set_default(build_subscriber())),
    };

    LoggingGuard { _guard: guard }
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

fn now_timestamp_micros() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

struct LogBridgeLayer;

impl<S> Layer<S> for LogBridgeLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: tracing_subscriber::layer::Context<'_, S>) {
        let Some(hook) = LOG_HOOK.get() else {
            return;
        };
        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);
        let meta = event.metadata();
        let record = DispatchLogRecord {
            ts: now_rfc3339(),
            level: meta.level().to_string(),
            target: visitor
                .log_target
                .take()
                .unwrap_or_else(|| meta.target().to_string()),
            message: visitor
                .message
                .take()
                .unwrap_or_else(|| meta.name().to_string()),
            span: ctx.lookup_current().map(|span| span.name().to_string()),
            fields: visitor.into_fields(),
        };
        hook(&record);
    }
}

struct SpanStart(Instant, i64);

struct SpanFields(JsonValue);

#[derive(Clone)]
struct SpanTimingLayer {
    pid: i64,
}

impl<S> Layer<S> for SpanTimingLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(
        &self,
        attrs: &tracing::span::Attributes<'_>,
        id: &tracing::span::Id,
        ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        if let Some(span) = ctx.span(id) {
            let mut visitor = JsonVisitor::default();
            attrs.record(&mut visitor);
            let mut ext = span.extensions_mut();
            ext.insert(SpanStart(Instant::now(), now_timestamp_micros()));
            if let Some(fields) = visitor.into_fields() {
                ext.insert(SpanFields(fields));
            }
        }
    }

    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let Some(hook) = SPAN_HOOK.get() else {
            return;
        };
        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);
        let meta = event.metadata();
        let ev = SpanEvent {
            name: visitor
                .message
                .take()
                .unwrap_or_else(|| meta.name().to_string()),
            cat: meta.target().to_string(),
            ph: "i".to_string(),
            ts: now_timestamp_micros(),
            dur: None,
            pid: self.pid,
            args: visitor.into_fields(),
        };
        hook(&[ev]);
    }

    fn on_close(&self, id: tracing::span::Id, ctx: tracing_subscriber::layer::Context<'_, S>) {
        let Some(hook) = SPAN_HOOK.get() else {
            return;
        };
        let Some(span) = ctx.span(&id) else {
            return;
        };
        let ext = span.extensions();
        let Some(SpanStart(started, ts)) = ext.get::<SpanStart>() else {
            return;
        };
        let meta = span.metadata();
        let ev = SpanEvent {
            name: meta.name().to_string(),
            cat: meta.target().to_string(),
            ph: "X".to_string(),
            ts: *ts,
            dur: Some(started.elapsed().as_micros() as i64),
            pid: self.pid,
            args: ext.get::<SpanFields>().map(|f| f.0.clone()),
        };
        hook(&[ev]);
    }
}

#[derive(Default)]
struct JsonVisitor {
    message: Option<String>,
    log_target: Option<String>,
    fields: serde_json::Map<String, JsonValue>,
}

impl JsonVisitor {
    fn put(&mut self, name: &str, value: JsonValue) {
        match name {
            "message" => {
                self.message = Some(match value {
                    JsonValue::String(s) => s,
                    other => other.to_string(),
                })
            }
            "log.target" => self.log_target = value.as_str().map(str::to_string),
            // Bridged `log` records carry their source location as fields.
            "log.module_path" | "log.file" | "log.line" => {}
            _ => {
                self.fields.insert(name.to_string(), value);
            }
        }
    }

    fn into_fields(self) -> Option<JsonValue> {
        (!self.fields.is_empty()).then_some(JsonValue::Object(self.fields))
    }
}

impl tracing::field::Visit for JsonVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.put(field.name(), JsonValue::String(format!("{value:?}")));
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.put(field.name(), JsonValue::String(value.to_string()));
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.put(field.name(), JsonValue::from(value));
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.put(field.name(), JsonValue::from(value));
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.put(field.name(), JsonValue::Bool(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::sync::Mutex;

    static RECORDS: Mutex<Vec<DispatchLogRecord>> = Mutex::new(Vec::new());
    static EVENTS: Mutex<Vec<SpanEvent>> = Mutex::new(Vec::new());

    fn install() -> LoggingGuard {
        set_log_hook(|rec: &DispatchLogRecord| RECORDS.lock().unwrap().push(rec.clone()));
        set_span_hook(|events: &[SpanEvent]| EVENTS.lock().unwrap().extend_from_slice(events));
        init_logging(LoggingOptions {
            enable_spans: true,
            stderr: false,
            pid: 7,
        })
    }

    #[test]
    #[serial]
    fn log_hook_receives_tracing_records() {
        let _guard = install();
        tracing::info!(kernel = "matmul", "kernel built");
        let items = RECORDS.lock().unwrap();
        let rec = items
            .iter()
            .find(|r| r.message.contains("kernel built"))
            .expect("record");
        assert_eq!(rec.level, "INFO");
        let fields = rec.fields.as_ref().expect("fields");
        assert_eq!(fields["kernel"], "matmul");
    }

    #[test]
    #[serial]
    fn log_macros_are_bridged() {
        let _guard = install();
        log::warn!(target: "kestrel::scratch", "scratch pool full");
        let items = RECORDS.lock().unwrap();
        let rec = items
            .iter()
            .find(|r| r.message.contains("scratch pool full"))
            .expect("bridged record");
        assert_eq!(rec.level, "WARN");
        assert_eq!(rec.target, "kestrel::scratch");
    }

    #[test]
    #[serial]
    fn closed_spans_report_duration() {
        let _guard = install();
        {
            let span = tracing::info_span!("kernel.dispatch", kernel = "slice");
            let _enter = span.enter();
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        let events = EVENTS.lock().unwrap();
        let ev = events
            .iter()
            .find(|e| e.name == "kernel.dispatch" && e.ph == "X")
            .expect("span event");
        assert!(ev.dur.unwrap_or_default() >= 1_000);
        assert_eq!(ev.pid, 7);
        assert_eq!(ev.args.as_ref().expect("args")["kernel"], "slice");
    }
}
