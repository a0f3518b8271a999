//! Client-side dispatcher: validates inbound envelopes and routes them to a
//! controller's handler by `type`.
//!
//! Each controller declares an explicit route table (`type` -> handler fn). The
//! handler name derived from the type (`status-update` -> `handleStatusUpdate`)
//! is kept alongside each route so a missing route can name what is expected.
//! The reserved `"error"` type never reaches the table; it goes to the
//! diagnostics sink.

use crate::envelope::{Envelope, EnvelopeError, ERROR_TYPE};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Transport label stamped on diagnostics records.
pub const DIAGNOSTICS_TRANSPORT: &str = "actioncable";

const HANDLER_PREFIX: &str = "handle";

/// Derive the handler name for a discriminator: split on `-` / `_`, capitalise each
/// segment, concatenate, prefix with `handle`.
pub fn handler_name(typ: &str) -> String {
    let mut name = String::from(HANDLER_PREFIX);
    for segment in typ.split(|c: char| c == '-' || c == '_').filter(|s| !s.is_empty()) {
        let mut chars = segment.chars();
        if let Some(first) = chars.next() {
            name.extend(first.to_uppercase());
            name.push_str(chars.as_str());
        }
    }
    name
}

/// Handler invoked with the controller and the routed envelope.
pub type Handler<C> = fn(&mut C, &Envelope);

struct Route<C> {
    name: String,
    handler: Handler<C>,
}

/// Explicit `type` -> handler table for one controller type.
pub struct RouteTable<C> {
    routes: HashMap<String, Route<C>>,
}

impl<C> Default for RouteTable<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> RouteTable<C> {
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }

    /// Register `handler` for `typ`. Re-registering a type replaces the previous handler.
    pub fn on(mut self, typ: &str, handler: Handler<C>) -> Self {
        self.routes.insert(
            typ.to_string(),
            Route {
                name: handler_name(typ),
                handler,
            },
        );
        self
    }

    fn lookup(&self, typ: &str) -> Option<&Route<C>> {
        self.routes.get(typ)
    }

    pub fn contains(&self, typ: &str) -> bool {
        self.routes.contains_key(typ)
    }

    /// Registered discriminators (unordered).
    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }
}

/// A receiving controller: a name for diagnostics, its route table, and lifecycle hooks
/// the subscription calls on connect, disconnect and rejection.
pub trait Controller {
    fn name(&self) -> &str;

    fn routes() -> RouteTable<Self>
    where
        Self: Sized;

    fn connected(&mut self) {}

    fn disconnected(&mut self) {}

    fn rejected(&mut self) {}
}

/// Zero-argument, idempotent hook that re-enables controls left disabled by an
/// in-flight action. Called after every connect and before every dispatch.
pub trait RecoveryHook: Send + Sync {
    fn recover(&self);
}

impl<F> RecoveryHook for F
where
    F: Fn() + Send + Sync,
{
    fn recover(&self) {
        self()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("diagnostics write failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("diagnostics record could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("diagnostics sink lock poisoned")]
    Poisoned,
}

/// External error-reporting collaborator for error envelopes.
pub trait DiagnosticsSink: Send + Sync {
    fn report(&self, record: &Value) -> Result<(), SinkError>;
}

/// Writes records to the log at error level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl DiagnosticsSink for LogSink {
    fn report(&self, record: &Value) -> Result<(), SinkError> {
        log::error!("cable error report: {}", record);
        Ok(())
    }
}

/// Appends one JSON record per line to a file.
pub struct JsonlSink {
    file: Mutex<std::fs::File>,
}

impl JsonlSink {
    /// Open (or create) the file in append mode, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, SinkError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl DiagnosticsSink for JsonlSink {
    fn report(&self, record: &Value) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = self.file.lock().map_err(|_| SinkError::Poisoned)?;
        file.write_all(&line)?;
        Ok(())
    }
}

/// What happened to one inbound value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Routed to the named handler.
    Routed { handler: String },
    /// Well-formed, but the controller has no route; `expected` is the handler name it should define.
    Unroutable { typ: String, expected: String },
    /// Reserved error type, forwarded to diagnostics.
    ErrorReported,
    /// Rejected before routing.
    Malformed(EnvelopeError),
}

impl fmt::Display for DispatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchOutcome::Routed { handler } => write!(f, "routed to {}", handler),
            DispatchOutcome::Unroutable { typ, expected } => {
                write!(f, "no handler for \"{}\" (expected {})", typ, expected)
            }
            DispatchOutcome::ErrorReported => write!(f, "error report forwarded to diagnostics"),
            DispatchOutcome::Malformed(e) => write!(f, "rejected: {}", e),
        }
    }
}

/// Routes inbound values for controller type `C`.
pub struct Dispatcher<C> {
    routes: RouteTable<C>,
    recovery: Option<Arc<dyn RecoveryHook>>,
    sink: Option<Arc<dyn DiagnosticsSink>>,
}

impl<C: Controller> Default for Dispatcher<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Controller> Dispatcher<C> {
    /// Dispatcher over `C::routes()`, with no recovery hook and no sink (errors go to the log).
    pub fn new() -> Self {
        Self::with_routes(C::routes())
    }

    pub fn with_routes(routes: RouteTable<C>) -> Self {
        Self {
            routes,
            recovery: None,
            sink: None,
        }
    }

    pub fn with_recovery(mut self, hook: Arc<dyn RecoveryHook>) -> Self {
        self.recovery = Some(hook);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn DiagnosticsSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Run the recovery hook, if any.
    pub fn recover(&self) {
        if let Some(hook) = &self.recovery {
            hook.recover();
        }
    }

    /// Validate and route one inbound value. Never panics; the outcome is informational.
    pub fn dispatch(&self, controller: &mut C, raw: &Value) -> DispatchOutcome {
        self.recover();

        let envelope = match Envelope::from_value(raw) {
            Ok(env) => env,
            Err(e) => {
                log::warn!("{}: dropping malformed envelope: {}", controller.name(), e);
                return DispatchOutcome::Malformed(e);
            }
        };

        if envelope.typ() == ERROR_TYPE {
            self.report_error(controller.name(), &envelope);
            return DispatchOutcome::ErrorReported;
        }

        match self.routes.lookup(envelope.typ()) {
            Some(route) => {
                (route.handler)(controller, &envelope);
                DispatchOutcome::Routed {
                    handler: route.name.clone(),
                }
            }
            None => {
                let expected = handler_name(envelope.typ());
                log::error!(
                    "{}: no handler for message type \"{}\"; define {} and register it in routes()",
                    controller.name(),
                    envelope.typ(),
                    expected
                );
                DispatchOutcome::Unroutable {
                    typ: envelope.typ().to_string(),
                    expected,
                }
            }
        }
    }

    fn report_error(&self, controller_name: &str, envelope: &Envelope) {
        let record = diagnostics_record(controller_name, envelope);
        match &self.sink {
            Some(sink) => {
                if let Err(e) = sink.report(&record) {
                    log::error!("diagnostics sink failed ({}); report: {}", e, record);
                }
            }
            None => log::error!("cable error report: {}", record),
        }
    }
}

/// `{ ...envelope, controllerName, type: "actioncable" }`.
pub fn diagnostics_record(controller_name: &str, envelope: &Envelope) -> Value {
    let mut record: Map<String, Value> = match envelope.to_value() {
        Value::Object(obj) => obj,
        _ => Map::new(),
    };
    record.insert(
        "controllerName".to_string(),
        Value::String(controller_name.to_string()),
    );
    record.insert(
        "type".to_string(),
        Value::String(DIAGNOSTICS_TRANSPORT.to_string()),
    );
    Value::Object(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        log: Arc<Mutex<Vec<String>>>,
        seen: Vec<Value>,
    }

    impl Recorder {
        fn record(&mut self, handler: &str, env: &Envelope) {
            self.log.lock().unwrap().push(handler.to_string());
            self.seen.push(env.to_value());
        }
    }

    fn handle_new_message(c: &mut Recorder, env: &Envelope) {
        c.record("handleNewMessage", env);
    }

    fn handle_status_update(c: &mut Recorder, env: &Envelope) {
        c.record("handleStatusUpdate", env);
    }

    fn handle_error(c: &mut Recorder, env: &Envelope) {
        c.record("handleError", env);
    }

    impl Controller for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn routes() -> RouteTable<Self> {
            RouteTable::new()
                .on("new-message", handle_new_message)
                .on("status-update", handle_status_update)
                .on("error", handle_error)
        }
    }

    struct CaptureSink(Mutex<Vec<Value>>);

    impl DiagnosticsSink for CaptureSink {
        fn report(&self, record: &Value) -> Result<(), SinkError> {
            self.0.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    struct BrokenSink;

    impl DiagnosticsSink for BrokenSink {
        fn report(&self, _record: &Value) -> Result<(), SinkError> {
            Err(SinkError::Poisoned)
        }
    }

    #[test]
    fn handler_name_capitalises_segments() {
        assert_eq!(handler_name("status-update"), "handleStatusUpdate");
        assert_eq!(handler_name("new_message"), "handleNewMessage");
        assert_eq!(handler_name("alert"), "handleAlert");
        assert_eq!(handler_name("chat--message_"), "handleChatMessage");
        assert_eq!(handler_name("already-camelCase"), "handleAlreadyCamelCase");
    }

    #[test]
    fn values_without_string_type_invoke_nothing() {
        let dispatcher = Dispatcher::<Recorder>::new();
        let mut c = Recorder::default();
        let samples = [
            json!(null),
            json!(42),
            json!("new-message"),
            json!(["new-message"]),
            json!({}),
            json!({"kind": "new-message"}),
            json!({"type": 1}),
            json!({"type": ["new-message"]}),
            json!({"type": {"name": "new-message"}}),
            json!({"type": ""}),
        ];
        for raw in &samples {
            let outcome = dispatcher.dispatch(&mut c, raw);
            assert!(matches!(outcome, DispatchOutcome::Malformed(_)), "{raw}: {outcome:?}");
        }
        assert!(c.log.lock().unwrap().is_empty());
    }

    #[test]
    fn new_message_routes_to_exactly_one_handler() {
        let dispatcher = Dispatcher::<Recorder>::new();
        let mut c = Recorder::default();
        let outcome = dispatcher.dispatch(&mut c, &json!({"type": "new-message", "body": "hi"}));
        assert_eq!(
            outcome,
            DispatchOutcome::Routed {
                handler: "handleNewMessage".into()
            }
        );
        assert_eq!(*c.log.lock().unwrap(), vec!["handleNewMessage".to_string()]);
        assert_eq!(c.seen, vec![json!({"type": "new-message", "body": "hi"})]);
    }

    #[test]
    fn error_type_bypasses_route_table() {
        let sink = Arc::new(CaptureSink(Mutex::new(Vec::new())));
        let dispatcher = Dispatcher::<Recorder>::new().with_sink(sink.clone());
        let mut c = Recorder::default();
        let raw = json!({"type": "error", "message": "boom", "channel": "ChatChannel", "action": "speak"});
        assert_eq!(dispatcher.dispatch(&mut c, &raw), DispatchOutcome::ErrorReported);
        assert!(c.log.lock().unwrap().is_empty());

        let records = sink.0.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0],
            json!({
                "type": "actioncable",
                "message": "boom",
                "channel": "ChatChannel",
                "action": "speak",
                "controllerName": "recorder"
            })
        );
    }

    #[test]
    fn error_report_survives_missing_or_failing_sink() {
        let mut c = Recorder::default();
        let raw = json!({"type": "error", "message": "boom"});
        let plain = Dispatcher::<Recorder>::new();
        assert_eq!(plain.dispatch(&mut c, &raw), DispatchOutcome::ErrorReported);
        let broken = Dispatcher::<Recorder>::new().with_sink(Arc::new(BrokenSink));
        assert_eq!(broken.dispatch(&mut c, &raw), DispatchOutcome::ErrorReported);
        assert!(c.log.lock().unwrap().is_empty());
    }

    #[test]
    fn unroutable_type_names_expected_handler() {
        let dispatcher = Dispatcher::<Recorder>::new();
        let mut c = Recorder::default();
        let outcome = dispatcher.dispatch(&mut c, &json!({"type": "user_joined"}));
        assert_eq!(
            outcome,
            DispatchOutcome::Unroutable {
                typ: "user_joined".into(),
                expected: "handleUserJoined".into()
            }
        );
        assert!(c.log.lock().unwrap().is_empty());
    }

    #[test]
    fn recovery_runs_before_handler() {
        let mut c = Recorder::default();
        let order = c.log.clone();
        let hook = move || order.lock().unwrap().push("recover".to_string());
        let dispatcher = Dispatcher::<Recorder>::new().with_recovery(Arc::new(hook));

        let raw = json!({"type": "status-update", "status": "done"});
        dispatcher.dispatch(&mut c, &raw);

        assert_eq!(
            *c.log.lock().unwrap(),
            vec!["recover".to_string(), "handleStatusUpdate".to_string()]
        );
        assert_eq!(c.seen, vec![raw]);
    }

    #[test]
    fn recovery_runs_for_every_outcome() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let dispatcher = Dispatcher::<Recorder>::new().with_recovery(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let mut c = Recorder::default();
        dispatcher.dispatch(&mut c, &json!("junk"));
        dispatcher.dispatch(&mut c, &json!({"type": "error"}));
        dispatcher.dispatch(&mut c, &json!({"type": "nobody-home"}));
        dispatcher.dispatch(&mut c, &json!({"type": "new-message"}));
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn jsonl_sink_appends_lines() {
        let dir = std::env::temp_dir().join(format!("parlor-sink-test-{}", uuid::Uuid::new_v4()));
        let path = dir.join("diag").join("errors.jsonl");
        let sink = JsonlSink::open(&path).unwrap();
        sink.report(&json!({"type": "actioncable", "n": 1})).unwrap();
        sink.report(&json!({"type": "actioncable", "n": 2})).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1], r#"{"type":"actioncable","n":2}"#);
        let _ = std::fs::remove_dir_all(dir);
    }
}
