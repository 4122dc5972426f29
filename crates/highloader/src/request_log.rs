//! Per-request JSON log files. Events emitted inside a `request` span whose
//! `log_id` has a registered file are appended to that file as one JSON
//! object per line.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

pub const REQUEST_SPAN: &str = "request";

#[derive(Clone, Default)]
pub struct RequestLogs {
    files: Arc<Mutex<HashMap<String, File>>>,
}

impl RequestLogs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send events tagged with `log_id` to `path`, appending.
    pub fn open(&self, log_id: &str, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        if let Ok(mut files) = self.files.lock() {
            files.insert(log_id.to_string(), file);
        }
        Ok(())
    }

    pub fn layer(&self) -> RequestLogLayer {
        RequestLogLayer { logs: self.clone() }
    }

    fn write_line(&self, log_id: &str, line: &str) {
        let Ok(mut files) = self.files.lock() else {
            return;
        };
        if let Some(file) = files.get_mut(log_id) {
            // Losing a log line must not disturb the run.
            let _ = writeln!(file, "{line}");
        }
    }
}

struct LogId(String);

pub struct RequestLogLayer {
    logs: RequestLogs,
}

impl<S> Layer<S> for RequestLogLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        if attrs.metadata().name() != REQUEST_SPAN {
            return;
        }
        let mut fields = JsonFields::default();
        attrs.record(&mut fields);
        if let Some(Value::String(log_id)) = fields.0.remove("log_id") {
            if let Some(span) = ctx.span(id) {
                span.extensions_mut().insert(LogId(log_id));
            }
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let Some(scope) = ctx.event_scope(event) else {
            return;
        };
        let Some(log_id) = scope
            .into_iter()
            .find_map(|span| {
                let extensions = span.extensions();
                extensions.get::<LogId>().map(|id| id.0.clone())
            })
        else {
            return;
        };

        let meta = event.metadata();
        let mut fields = JsonFields::default();
        event.record(&mut fields);

        let mut line = Map::new();
        line.insert(
            "timestamp".to_string(),
            Value::String(chrono::Utc::now().to_rfc3339()),
        );
        line.insert("level".to_string(), Value::String(meta.level().to_string()));
        line.insert("target".to_string(), Value::String(meta.target().to_string()));
        line.insert("log_id".to_string(), Value::String(log_id.clone()));
        line.extend(fields.0);

        self.logs.write_line(&log_id, &Value::Object(line).to_string());
    }
}

#[derive(Default)]
struct JsonFields(Map<String, Value>);

impl Visit for JsonFields {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.0
            .insert(field.name().to_string(), Value::String(value.to_string()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.0.insert(field.name().to_string(), Value::Bool(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.0
            .insert(field.name().to_string(), Value::String(format!("{value:?}")));
    }
}
