//! Mock node handlers and fixtures shared by flowgraph tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::StreamExt;
use serde_json::Value;

use flowgraph_core::error::{NodeError, NodeResult};
use flowgraph_core::traits::{HandlerOutput, NodeHandler};
use flowgraph_core::types::{NodeContext, Outputs, StreamDelta};

/// Build an `Outputs` map from a JSON object literal.
pub fn outputs(value: Value) -> Outputs {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {}", other),
    }
}

/// Ordered log of `(node_id, attempt)` handler invocations.
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<(String, u32)>>>);

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, ctx: &NodeContext) {
        self.0.lock().unwrap().push((ctx.node_id.clone(), ctx.attempt));
    }

    /// Node ids in invocation order.
    pub fn nodes(&self) -> Vec<String> {
        self.0.lock().unwrap().iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn count(&self, node_id: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|(id, _)| id == node_id).count()
    }
}

type SyncFn = dyn Fn(&NodeContext) -> NodeResult<HandlerOutput> + Send + Sync;

/// Handler backed by a synchronous closure.
pub struct FnHandler {
    node_type: String,
    f: Box<SyncFn>,
    log: CallLog,
}

impl FnHandler {
    pub fn new(
        node_type: &str,
        f: impl Fn(&NodeContext) -> NodeResult<Outputs> + Send + Sync + 'static,
    ) -> Self {
        Self::with_output(node_type, move |ctx| f(ctx).map(HandlerOutput::outputs))
    }

    /// Closure returning a full `HandlerOutput` (e.g. with a branch handle).
    pub fn with_output(
        node_type: &str,
        f: impl Fn(&NodeContext) -> NodeResult<HandlerOutput> + Send + Sync + 'static,
    ) -> Self {
        Self {
            node_type: node_type.to_string(),
            f: Box::new(f),
            log: CallLog::new(),
        }
    }

    /// Record invocations into `log`.
    pub fn logged(mut self, log: &CallLog) -> Self {
        self.log = log.clone();
        self
    }
}

impl NodeHandler for FnHandler {
    fn node_type(&self) -> &str {
        &self.node_type
    }

    fn execute(&self, ctx: NodeContext) -> BoxFuture<'_, NodeResult<HandlerOutput>> {
        self.log.push(&ctx);
        let result = (self.f)(&ctx);
        Box::pin(async move { result })
    }
}

/// Returns pre-scripted results in order; the last one repeats.
pub struct ScriptedHandler {
    node_type: String,
    script: Mutex<VecDeque<NodeResult<Outputs>>>,
    last: Mutex<Option<NodeResult<Outputs>>>,
    calls: Arc<AtomicU32>,
}

impl ScriptedHandler {
    pub fn new(node_type: &str, script: Vec<NodeResult<Outputs>>) -> Self {
        Self {
            node_type: node_type.to_string(),
            script: Mutex::new(script.into()),
            last: Mutex::new(None),
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Fail `failures` times with a handler error, then succeed with `outputs`.
    pub fn flaky(node_type: &str, failures: usize, outputs: Outputs) -> Self {
        let mut script: Vec<NodeResult<Outputs>> = (0..failures)
            .map(|i| Err(NodeError::handler(format!("transient failure {}", i + 1))))
            .collect();
        script.push(Ok(outputs));
        Self::new(node_type, script)
    }

    /// Shared counter of invocations.
    pub fn calls(&self) -> Arc<AtomicU32> {
        self.calls.clone()
    }
}

impl NodeHandler for ScriptedHandler {
    fn node_type(&self) -> &str {
        &self.node_type
    }

    fn execute(&self, _ctx: NodeContext) -> BoxFuture<'_, NodeResult<HandlerOutput>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        let result = match next {
            Some(result) => {
                *self.last.lock().unwrap() = Some(result.clone());
                result
            }
            None => self
                .last
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| Err(NodeError::handler("script exhausted"))),
        };
        Box::pin(async move { result.map(HandlerOutput::outputs) })
    }
}

/// Sleeps before echoing its inputs. Tracks how many invocations overlap.
pub struct SlowHandler {
    node_type: String,
    delay: Duration,
    honor_cancel: bool,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    cancelled: Arc<AtomicUsize>,
    log: CallLog,
}

impl SlowHandler {
    pub fn new(node_type: &str, delay: Duration) -> Self {
        Self {
            node_type: node_type.to_string(),
            delay,
            honor_cancel: false,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            cancelled: Arc::new(AtomicUsize::new(0)),
            log: CallLog::new(),
        }
    }

    /// Return early with a cancelled error when the context token fires.
    pub fn honoring_cancel(mut self) -> Self {
        self.honor_cancel = true;
        self
    }

    pub fn logged(mut self, log: &CallLog) -> Self {
        self.log = log.clone();
        self
    }

    /// Highest number of simultaneous invocations observed.
    pub fn peak(&self) -> Arc<AtomicUsize> {
        self.peak.clone()
    }

    /// Number of invocations that observed cancellation.
    pub fn cancelled(&self) -> Arc<AtomicUsize> {
        self.cancelled.clone()
    }
}

impl NodeHandler for SlowHandler {
    fn node_type(&self) -> &str {
        &self.node_type
    }

    fn execute(&self, ctx: NodeContext) -> BoxFuture<'_, NodeResult<HandlerOutput>> {
        self.log.push(&ctx);
        Box::pin(async move {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let interrupted = tokio::select! {
                _ = tokio::time::sleep(self.delay) => false,
                _ = ctx.cancel.cancelled(), if self.honor_cancel => true,
            };
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if interrupted || ctx.cancel.is_cancelled() {
                self.cancelled.fetch_add(1, Ordering::SeqCst);
            }
            if interrupted {
                return Err(NodeError::cancelled("interrupted"));
            }
            Ok(HandlerOutput::outputs(ctx.inputs))
        })
    }
}

/// Streams `chunks` with a short pause between them, then completes with
/// `{"text": <chunks joined>}`.
pub struct StreamingHandler {
    node_type: String,
    chunks: Vec<String>,
    interval: Duration,
    finish: bool,
}

impl StreamingHandler {
    pub fn new(node_type: &str, chunks: &[&str]) -> Self {
        Self {
            node_type: node_type.to_string(),
            chunks: chunks.iter().map(|s| s.to_string()).collect(),
            interval: Duration::from_millis(5),
            finish: true,
        }
    }

    /// End the stream without a terminal result.
    pub fn truncated(mut self) -> Self {
        self.finish = false;
        self
    }
}

impl NodeHandler for StreamingHandler {
    fn node_type(&self) -> &str {
        &self.node_type
    }

    fn execute(&self, _ctx: NodeContext) -> BoxFuture<'_, NodeResult<HandlerOutput>> {
        let chunks = self.chunks.clone();
        let interval = self.interval;
        let finish = self.finish;
        Box::pin(async move {
            let text = chunks.concat();
            let deltas = futures::stream::iter(chunks)
                .then(move |chunk| async move {
                    tokio::time::sleep(interval).await;
                    Ok::<_, NodeError>(StreamDelta::Chunk(Value::String(chunk)))
                })
                .chain(futures::stream::iter(finish.then(|| {
                    let mut outputs = Outputs::new();
                    outputs.insert("text".into(), Value::String(text));
                    Ok::<_, NodeError>(StreamDelta::Done {
                        outputs,
                        branch: None,
                    })
                })));
            Ok(HandlerOutput::Stream(Box::pin(deltas)))
        })
    }
}

/// Panics on every invocation.
pub struct PanicHandler(pub &'static str);

impl NodeHandler for PanicHandler {
    fn node_type(&self) -> &str {
        self.0
    }

    fn execute(&self, _ctx: NodeContext) -> BoxFuture<'_, NodeResult<HandlerOutput>> {
        Box::pin(explode())
    }
}

async fn explode() -> NodeResult<HandlerOutput> {
    panic!("handler exploded")
}
