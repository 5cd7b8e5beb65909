use crate::error::{PipelineError, PipelineResult};
use futures::future::{FutureExt, Shared};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Immutable, append-only key/value carrier passed between stages
///
/// Extending the carrier never mutates it: `with_value` returns a new carrier
/// that shares the existing entries, and lookups see the newest binding first.
///
/// # Example
/// ```
/// use stagepipe::pipeline::ContextValues;
///
/// let base = ContextValues::new().with_string("tool", "search");
/// let next = base.with_string("tool", "fetch");
///
/// assert_eq!(base.get_string("tool").unwrap(), "search");
/// assert_eq!(next.get_string("tool").unwrap(), "fetch");
/// ```
#[derive(Debug, Clone, Default)]
pub struct ContextValues {
    head: Option<Arc<Entry>>,
    len: usize,
}

#[derive(Debug)]
struct Entry {
    key: String,
    value: Value,
    parent: Option<Arc<Entry>>,
}

impl ContextValues {
    /// Create an empty carrier
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a new carrier with `key` bound to `value`
    pub fn with_value(&self, key: impl Into<String>, value: Value) -> Self {
        Self {
            head: Some(Arc::new(Entry {
                key: key.into(),
                value,
                parent: self.head.clone(),
            })),
            len: self.len + 1,
        }
    }

    /// Return a new carrier with a string binding
    pub fn with_string(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.with_value(key, Value::String(value.into()))
    }

    /// Return a new carrier with a boolean binding
    pub fn with_bool(&self, key: impl Into<String>, value: bool) -> Self {
        self.with_value(key, Value::Bool(value))
    }

    /// Return a new carrier with a numeric binding
    ///
    /// Non-finite numbers cannot be represented and are stored as null.
    pub fn with_number(&self, key: impl Into<String>, value: f64) -> Self {
        let value = serde_json::Number::from_f64(value)
            .map(Value::Number)
            .unwrap_or(Value::Null);
        self.with_value(key, value)
    }

    /// Get the newest value bound to `key`
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries().find(|e| e.key == key).map(|e| &e.value)
    }

    /// Get a value or return an error if not found
    pub fn get_required(&self, key: &str) -> PipelineResult<&Value> {
        self.get(key)
            .ok_or_else(|| PipelineError::MissingKey(key.to_string()))
    }

    /// Get a string value
    pub fn get_string(&self, key: &str) -> PipelineResult<String> {
        match self.get_required(key)? {
            Value::String(s) => Ok(s.clone()),
            _ => Err(PipelineError::Carrier(format!(
                "Context key '{}' is not a string",
                key
            ))),
        }
    }

    /// Get a boolean value
    pub fn get_bool(&self, key: &str) -> PipelineResult<bool> {
        match self.get_required(key)? {
            Value::Bool(b) => Ok(*b),
            _ => Err(PipelineError::Carrier(format!(
                "Context key '{}' is not a boolean",
                key
            ))),
        }
    }

    /// Get a number value
    pub fn get_number(&self, key: &str) -> PipelineResult<f64> {
        match self.get_required(key)? {
            Value::Number(n) => n.as_f64().ok_or_else(|| {
                PipelineError::Carrier(format!("Context key '{}' is not a valid number", key))
            }),
            _ => Err(PipelineError::Carrier(format!(
                "Context key '{}' is not a number",
                key
            ))),
        }
    }

    /// Check if a key is bound
    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Distinct keys, newest binding first
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = Vec::new();
        for entry in self.entries() {
            if !keys.contains(&entry.key.as_str()) {
                keys.push(&entry.key);
            }
        }
        keys
    }

    /// Number of bindings, shadowed ones included
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn entries(&self) -> impl Iterator<Item = &Entry> {
        std::iter::successors(self.head.as_deref(), |&e| e.parent.as_deref())
    }
}

/// Caller-supplied context for a pipeline run
///
/// Bundles the cancellation signal, an optional deadline, and the initial
/// carrier handed to the first stage.
#[derive(Debug, Clone, Default)]
pub struct Context {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    values: ContextValues,
}

impl Context {
    /// Create a context that is never cancelled unless its token is
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context driven by an existing cancellation token
    pub fn with_token(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..Self::default()
        }
    }

    /// Return a copy that expires after `timeout`
    ///
    /// An earlier existing deadline is kept.
    pub fn with_timeout(&self, timeout: std::time::Duration) -> Self {
        let deadline = Instant::now() + timeout;
        Self {
            deadline: Some(self.deadline.map_or(deadline, |d| d.min(deadline))),
            ..self.clone()
        }
    }

    /// Return a copy whose carrier has `key` bound to `value`
    pub fn with_value(&self, key: impl Into<String>, value: Value) -> Self {
        Self {
            values: self.values.with_value(key, value),
            ..self.clone()
        }
    }

    pub fn values(&self) -> &ContextValues {
        &self.values
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Signal cancellation to every run using this context
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Future resolving to the carrier handed down from upstream
pub(crate) type CarrierFuture = Shared<oneshot::Receiver<ContextValues>>;

/// Create a carrier future that is already resolved
pub(crate) fn ready_carrier(values: ContextValues) -> CarrierFuture {
    let (tx, rx) = oneshot::channel();
    // The receiver is alive, so the send cannot fail
    let _ = tx.send(values);
    rx.shared()
}

/// Per-stage view of the run passed to [`Stage::serve`](super::Stage::serve)
pub struct StageContext {
    index: usize,
    stage_name: String,
    cancel: CancellationToken,
    upstream: CarrierFuture,
    values: Option<ContextValues>,
    downstream: Option<oneshot::Sender<ContextValues>>,
}

impl StageContext {
    pub(crate) fn new(
        index: usize,
        stage_name: impl Into<String>,
        cancel: CancellationToken,
        upstream: CarrierFuture,
        downstream: Option<oneshot::Sender<ContextValues>>,
    ) -> Self {
        Self {
            index,
            stage_name: stage_name.into(),
            cancel,
            upstream,
            values: None,
            downstream,
        }
    }

    /// Zero-based position of this stage in the pipeline
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn stage_name(&self) -> &str {
        &self.stage_name
    }

    /// Run-scoped cancellation token
    ///
    /// Cancelled when the caller cancels, the deadline passes, or another
    /// stage fails.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait until the run is torn down
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Carrier handed down from upstream
    ///
    /// Resolves once every extending stage upstream has forwarded (or
    /// finished). An upstream stage may forward only after its last byte is
    /// read, so keep reading input while waiting here (for example with
    /// `tokio::try_join!`) or drain the input first. Awaiting this before
    /// reading anything can deadlock the run.
    pub async fn values(&mut self) -> PipelineResult<ContextValues> {
        if let Some(values) = &self.values {
            return Ok(values.clone());
        }
        let values = tokio::select! {
            received = self.upstream.clone() => received.map_err(|_| {
                PipelineError::Carrier("upstream stage dropped the carrier".to_string())
            })?,
            _ = self.cancel.cancelled() => return Err(PipelineError::Cancelled),
        };
        self.values = Some(values.clone());
        Ok(values)
    }

    /// Hand `values` to the next stage
    ///
    /// Only stages whose `extends_carrier()` returns true may forward, and
    /// only once.
    pub fn forward(&mut self, values: ContextValues) -> PipelineResult<()> {
        let tx = self.downstream.take().ok_or_else(|| {
            PipelineError::Carrier(format!(
                "stage '{}' cannot forward the carrier (not extending or already forwarded)",
                self.stage_name
            ))
        })?;
        // Downstream may already be gone during teardown
        let _ = tx.send(values);
        Ok(())
    }

    /// Forward the upstream carrier unchanged if the stage did not forward
    pub(crate) async fn finish(mut self) {
        if self.downstream.is_none() {
            return;
        }
        if let Ok(values) = self.values().await {
            let _ = self.forward(values);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_values_creation() {
        let values = ContextValues::new();
        assert!(values.is_empty());
        assert!(values.keys().is_empty());
    }

    #[test]
    fn test_string_operations() {
        let values = ContextValues::new().with_string("key1", "value1");

        assert!(values.has("key1"));
        assert_eq!(values.get_string("key1").unwrap(), "value1");
    }

    #[test]
    fn test_bool_and_number_operations() {
        let values = ContextValues::new()
            .with_bool("cached", true)
            .with_number("score", 0.75);

        assert!(values.get_bool("cached").unwrap());
        assert_eq!(values.get_number("score").unwrap(), 0.75);
    }

    #[test]
    fn test_non_finite_number_is_null() {
        let values = ContextValues::new().with_number("nan", f64::NAN);
        assert_eq!(values.get("nan"), Some(&Value::Null));
        assert!(values.get_number("nan").is_err());
    }

    #[test]
    fn test_extending_does_not_mutate_original() {
        let base = ContextValues::new().with_string("tool", "search");
        let extended = base.with_string("tool", "fetch").with_bool("selected", true);

        assert_eq!(base.len(), 1);
        assert!(!base.has("selected"));
        assert_eq!(base.get_string("tool").unwrap(), "search");

        assert_eq!(extended.len(), 3);
        assert_eq!(extended.get_string("tool").unwrap(), "fetch");
        assert_eq!(extended.keys(), vec!["selected", "tool"]);
    }

    #[test]
    fn test_missing_key() {
        let values = ContextValues::new();
        let result = values.get_string("missing");

        assert!(matches!(result, Err(PipelineError::MissingKey(_))));
    }

    #[test]
    fn test_wrong_type() {
        let values = ContextValues::new().with_string("key1", "value1");

        let result = values.get_bool("key1");
        assert!(matches!(result, Err(PipelineError::Carrier(_))));
    }

    #[test]
    fn test_context_with_value_and_cancel() {
        let ctx = Context::new().with_value("request_id", Value::from("r-1"));
        let child = ctx.with_value("tool", Value::from("search"));

        assert!(!ctx.values().has("tool"));
        assert_eq!(child.values().get_string("request_id").unwrap(), "r-1");

        // Copies share the same cancellation signal
        child.cancel();
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_with_timeout_keeps_earliest_deadline() {
        let ctx = Context::new().with_timeout(std::time::Duration::from_millis(10));
        let later = ctx.with_timeout(std::time::Duration::from_secs(10));
        assert_eq!(ctx.deadline(), later.deadline());
    }

    #[tokio::test]
    async fn test_stage_context_forward_once() {
        let (tx, rx) = oneshot::channel();
        let mut ctx = StageContext::new(
            0,
            "annotate",
            CancellationToken::new(),
            ready_carrier(ContextValues::new().with_string("a", "1")),
            Some(tx),
        );

        let upstream = ctx.values().await.unwrap();
        ctx.forward(upstream.with_string("b", "2")).unwrap();
        assert!(ctx.forward(ContextValues::new()).is_err());

        let forwarded = rx.await.unwrap();
        assert_eq!(forwarded.get_string("a").unwrap(), "1");
        assert_eq!(forwarded.get_string("b").unwrap(), "2");
    }

    #[tokio::test]
    async fn test_stage_context_finish_passes_upstream_through() {
        let (tx, rx) = oneshot::channel();
        let ctx = StageContext::new(
            1,
            "silent",
            CancellationToken::new(),
            ready_carrier(ContextValues::new().with_string("a", "1")),
            Some(tx),
        );

        ctx.finish().await;
        assert_eq!(rx.await.unwrap().get_string("a").unwrap(), "1");
    }

    #[tokio::test]
    async fn test_values_fail_when_cancelled() {
        let (_tx, rx) = oneshot::channel::<ContextValues>();
        let cancel = CancellationToken::new();
        let mut ctx = StageContext::new(0, "waiting", cancel.clone(), rx.shared(), None);

        cancel.cancel();
        assert!(matches!(ctx.values().await, Err(PipelineError::Cancelled)));
    }
}
