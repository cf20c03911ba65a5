//! Tracing capture for asserting on emitted diagnostics.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

/// One recorded event: level, message, structured fields, and the span
/// scope it was emitted under (outermost first, `name{fields}` form).
#[derive(Debug, Clone)]
pub struct CapturedEvent {
    pub level: Level,
    pub message: String,
    pub fields: Vec<(String, String)>,
    pub scope: Vec<String>,
}

impl CapturedEvent {
    /// True when the message or any field value contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.message.contains(needle)
            || self
                .fields
                .iter()
                .any(|(_name, value)| value.contains(needle))
    }

    /// True when any span in scope renders to something containing `needle`.
    pub fn in_scope(&self, needle: &str) -> bool {
        self.scope.iter().any(|span| span.contains(needle))
    }
}

/// Handle over the recorded events.
#[derive(Clone)]
pub struct CapturedEvents {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl CapturedEvents {
    pub fn snapshot(&self) -> Vec<CapturedEvent> {
        self.events.lock().clone()
    }

    /// Number of events at `level` containing `needle`.
    pub fn count(&self, level: Level, needle: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| event.level == level && event.contains(needle))
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

/// Layer recording every event it sees.
pub struct CaptureLayer {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl CaptureLayer {
    pub fn new() -> (CaptureLayer, CapturedEvents) {
        let events = Arc::new(Mutex::new(Vec::new()));
        (
            CaptureLayer {
                events: events.clone(),
            },
            CapturedEvents { events },
        )
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    fields: Vec<(String, String)>,
}

impl FieldVisitor {
    fn record(&mut self, field: &Field, value: String) {
        if field.name() == "message" {
            self.message = value;
        } else {
            self.fields.push((field.name().to_string(), value));
        }
    }

    fn render(&self) -> String {
        self.fields
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.record(field, format!("{value:?}"));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.record(field, value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.record(field, value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.record(field, value.to_string());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.record(field, value.to_string());
    }
}

/// Rendered fields of a live span, stashed in its extensions.
struct SpanFields(String);

impl<S> Layer<S> for CaptureLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(SpanFields(visitor.render()));
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let mut scope = Vec::new();
        if let Some(spans) = ctx.event_scope(event) {
            for span in spans.from_root() {
                let fields = span
                    .extensions()
                    .get::<SpanFields>()
                    .map(|fields| fields.0.clone())
                    .unwrap_or_default();
                scope.push(format!("{}{{{}}}", span.name(), fields));
            }
        }

        self.events.lock().push(CapturedEvent {
            level: *event.metadata().level(),
            message: visitor.message,
            fields: visitor.fields,
            scope,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::prelude::*;

    #[test]
    fn test_capture_records_message_fields_and_scope() {
        let (layer, events) = CaptureLayer::new();
        let subscriber = tracing_subscriber::registry().with(layer);
        let _guard = tracing::subscriber::set_default(subscriber);

        let span = tracing::info_span!("connection", ConnectionId = 7u64);
        let _entered = span.enter();
        tracing::info!(bytes = 4, "received");

        let snapshot = events.snapshot();
        assert_eq!(snapshot.len(), 1);
        let event = &snapshot[0];
        assert_eq!(event.level, Level::INFO);
        assert_eq!(event.message, "received");
        assert!(event.contains("4"));
        assert!(event.in_scope("ConnectionId=7"));
    }

    #[test]
    fn test_count_filters_by_level_and_content() {
        let (layer, events) = CaptureLayer::new();
        let subscriber = tracing_subscriber::registry().with(layer);
        let _guard = tracing::subscriber::set_default(subscriber);

        tracing::error!("boom once");
        tracing::error!("boom twice");
        tracing::info!("boom info");

        assert_eq!(events.count(Level::ERROR, "boom"), 2);
        assert_eq!(events.count(Level::INFO, "boom"), 1);
        events.clear();
        assert!(events.snapshot().is_empty());
    }
}
