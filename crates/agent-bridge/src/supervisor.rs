//! Agent worker supervisor - owns the subprocess lifecycle and the
//! caller-facing API.
//!
//! Flow:
//! 1. `run`/`ping` lazily spawn the worker via `ensure_worker`
//! 2. A pending entry is registered, then the request line is written
//! 3. A reader task decodes stdout frames and routes them by request id
//! 4. On worker exit: clear the handle, fail every pending request
//!
//! Many requests may be in flight over the single pipe pair. Send order is
//! preserved (writes are serialized on the stdin mutex); response order is
//! not. Correctness rests entirely on id correlation.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

use crate::codec::JsonLinesCodec;
use crate::protocol::{AgentRequest, AgentResponse, EventKind, ProgressEvent, ProgressKind, RequestId};
use crate::registry::{PendingEntry, PendingRequests};
use crate::spawn::{PythonSpawner, WorkerSpawner};

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("failed to spawn agent worker: {0}")]
    Spawn(String),

    #[error("failed to write request to agent worker: {0}")]
    Write(#[source] std::io::Error),

    #[error("agent worker exited")]
    WorkerExited { exit_code: Option<i32> },

    #[error("request id {0} is already pending")]
    DuplicateRequest(RequestId),

    #[error("request abandoned during supervisor teardown")]
    Abandoned,
}

pub struct AgentConfig {
    spawner: Arc<dyn WorkerSpawner>,
}

impl AgentConfig {
    /// Configuration for the default Python engine worker.
    pub fn new(python: impl Into<std::path::PathBuf>, script: impl Into<std::path::PathBuf>) -> Self {
        Self {
            spawner: Arc::new(PythonSpawner::new(python, script)),
        }
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }
}

/// Per-request options for [`AgentSupervisor::run`].
#[derive(Default)]
pub struct RunOptions {
    /// Ask the worker to emit `partial` events before the final result.
    pub stream: bool,
    /// Sink for progress events. `Partial` events arrive in emission order;
    /// a `Final` event is delivered just before the returned future resolves.
    pub progress: Option<mpsc::UnboundedSender<ProgressEvent>>,
    /// Externally-supplied correlation id. Generated when absent.
    pub request_id: Option<RequestId>,
}

type RequestWriter = Arc<Mutex<FramedWrite<ChildStdin, JsonLinesCodec<AgentRequest>>>>;

struct WorkerHandle {
    generation: u64,
    stdin: RequestWriter,
    child: Child,
}

#[derive(Default)]
struct WorkerSlot {
    generation: u64,
    handle: Option<WorkerHandle>,
}

/// Supervisor for the agent worker subprocess.
///
/// Owns zero-or-one live child at a time plus the pending-request table.
/// All state is instance-owned; independent supervisors never share
/// anything.
pub struct AgentSupervisor {
    spawner: Arc<dyn WorkerSpawner>,
    registry: Arc<PendingRequests>,
    worker: Arc<Mutex<WorkerSlot>>,
}

impl AgentSupervisor {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            spawner: config.spawner,
            registry: Arc::new(PendingRequests::new()),
            worker: Arc::new(Mutex::new(WorkerSlot::default())),
        }
    }

    /// Spawn the worker if it is not already running.
    ///
    /// Idempotent under concurrency: the slot mutex is held across the
    /// spawn, so a second caller waits and then observes the live handle
    /// instead of spawning a duplicate.
    async fn ensure_worker(&self) -> Result<RequestWriter, AgentError> {
        let mut slot = self.worker.lock().await;
        if let Some(handle) = slot.handle.as_ref() {
            return Ok(Arc::clone(&handle.stdin));
        }

        let mut child = self
            .spawner
            .spawn()
            .map_err(|e| AgentError::Spawn(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::Spawn("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Spawn("stdout not captured".to_string()))?;

        slot.generation += 1;
        let generation = slot.generation;
        tracing::info!(target: "agent::worker", generation, "Spawned agent worker");

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr));
        }

        let registry = Arc::clone(&self.registry);
        let worker = Arc::clone(&self.worker);
        tokio::spawn(async move {
            read_worker_output(stdout, registry, worker, generation).await;
        });

        let writer: RequestWriter = Arc::new(Mutex::new(FramedWrite::new(stdin, JsonLinesCodec::new())));
        slot.handle = Some(WorkerHandle {
            generation,
            stdin: Arc::clone(&writer),
            child,
        });

        Ok(writer)
    }

    /// Submit a payload to the worker and await the final result.
    ///
    /// Resolves to the final `data` object with the request id merged in.
    /// Rejects if the request line cannot be written (the entry is removed
    /// synchronously, no response can race it) or if the worker exits
    /// before replying.
    pub async fn run(&self, payload: Value, options: RunOptions) -> Result<Value, AgentError> {
        let id = options.request_id.unwrap_or_else(RequestId::fresh);
        let request = AgentRequest::Run {
            id: id.clone(),
            payload,
            stream: options.stream,
        };
        self.send_request(request, options.progress).await
    }

    /// Liveness check. Resolves to `{"pong": true}`.
    pub async fn ping(&self) -> Result<Value, AgentError> {
        let request = AgentRequest::Ping {
            id: RequestId::fresh(),
        };
        self.send_request(request, None).await
    }

    async fn send_request(
        &self,
        request: AgentRequest,
        progress: Option<mpsc::UnboundedSender<ProgressEvent>>,
    ) -> Result<Value, AgentError> {
        let writer = self.ensure_worker().await?;

        let id = request.id().clone();
        let (resolve, resolution) = oneshot::channel();
        // Registered before the write: a response arriving immediately
        // after the line hits the pipe always finds its entry.
        self.registry.register(&id, PendingEntry { resolve, progress })?;
        tracing::debug!(target: "agent::worker", %id, "Registered request");

        if let Err(e) = writer.lock().await.send(request).await {
            tracing::error!(target: "agent::worker", %id, error = %e, "Failed to write request");
            self.registry.remove(&id);
            return Err(AgentError::Write(e));
        }

        resolution.await.map_err(|_| AgentError::Abandoned)?
    }

    /// Forcibly terminate the worker and drop every pending entry without
    /// dispatching individual rejections. Callers still awaiting observe
    /// [`AgentError::Abandoned`].
    pub async fn destroy(&self) {
        let handle = self.worker.lock().await.handle.take();
        if let Some(mut handle) = handle {
            tracing::info!(target: "agent::worker", generation = handle.generation, "Destroying agent worker");
            if let Err(e) = handle.child.kill().await {
                tracing::warn!(target: "agent::worker", error = %e, "Failed to kill agent worker");
            }
        }
        self.registry.clear();
    }

    /// Number of requests currently awaiting a terminal response.
    pub fn pending_requests(&self) -> usize {
        self.registry.len()
    }

    /// Whether a live worker handle exists right now.
    pub async fn is_running(&self) -> bool {
        self.worker.lock().await.handle.is_some()
    }
}

/// Read protocol frames from worker stdout until the stream closes, then
/// tear down: reap the child for its exit code, clear the handle, and fail
/// everything still pending.
async fn read_worker_output(
    stdout: ChildStdout,
    registry: Arc<PendingRequests>,
    worker: Arc<Mutex<WorkerSlot>>,
    generation: u64,
) {
    let mut frames = FramedRead::new(stdout, JsonLinesCodec::<AgentResponse>::new());
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(response) => dispatch(&registry, response),
            Err(e) => {
                tracing::error!(target: "agent::worker", error = %e, "Worker output read error");
                break;
            }
        }
    }

    // The sweep belongs to this worker only. After destroy() + respawn the
    // slot may hold a newer handle; leave it alone.
    let handle = {
        let mut slot = worker.lock().await;
        match slot.handle.take() {
            Some(h) if h.generation == generation => Some(h),
            Some(h) => {
                slot.handle = Some(h);
                None
            }
            None => None,
        }
    };

    let Some(mut handle) = handle else {
        tracing::debug!(target: "agent::worker", generation, "Worker already torn down");
        return;
    };

    let exit_code = handle.child.wait().await.ok().and_then(|s| s.code());
    tracing::warn!(
        target: "agent::worker",
        generation,
        ?exit_code,
        pending = registry.len(),
        "Agent worker exited, failing pending requests"
    );
    registry.fail_all(|| AgentError::WorkerExited { exit_code });
}

/// Route one inbound response to its pending entry.
fn dispatch(registry: &PendingRequests, response: AgentResponse) {
    let AgentResponse { id, event, data } = response;

    let Some(id) = id else {
        tracing::warn!(target: "agent::worker", "Discarding response without id");
        return;
    };
    if !registry.contains(&id) {
        // Normal after a worker restart: a late response for an entry that
        // was already swept.
        tracing::warn!(target: "agent::worker", %id, "No pending request for response");
        return;
    }

    match event {
        Some(EventKind::Partial) => {
            registry.send_progress(
                &id,
                ProgressEvent {
                    kind: ProgressKind::Partial,
                    data: data.unwrap_or(Value::Null),
                },
            );
        }
        Some(EventKind::Final) => {
            if let Some(entry) = registry.remove(&id) {
                let data = data.unwrap_or(Value::Null);
                if let Some(progress) = &entry.progress {
                    // Streaming consumers see the terminal marker before
                    // the awaiting caller resolves.
                    let _ = progress.send(ProgressEvent {
                        kind: ProgressKind::Final,
                        data: data.clone(),
                    });
                }
                let _ = entry.resolve.send(Ok(merge_result(&id, data)));
            }
        }
        Some(EventKind::Pong) => {
            if let Some(entry) = registry.remove(&id) {
                let _ = entry.resolve.send(Ok(json!({"pong": true})));
            }
        }
        Some(EventKind::Unknown) | None => {
            // Deliberately leaves the entry pending; see the module docs on
            // protocol evolution.
            tracing::warn!(target: "agent::worker", %id, "Unrecognized event kind, leaving request pending");
        }
    }
}

/// `{id, ...data}`: the final result object with the request id merged in.
/// A non-object `data` contributes nothing beyond the id.
fn merge_result(id: &RequestId, data: Value) -> Value {
    let mut merged = serde_json::Map::new();
    merged.insert("id".to_string(), Value::String(id.as_str().to_string()));
    if let Value::Object(fields) = data {
        merged.extend(fields);
    }
    Value::Object(merged)
}

/// Forward worker stderr to the log, line by line. Diagnostics only; never
/// parsed as protocol.
async fn forward_stderr(stderr: ChildStderr) {
    let mut lines = FramedRead::new(stderr, LinesCodec::new());
    while let Some(line) = lines.next().await {
        match line {
            Ok(line) => {
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    tracing::info!(target: "agent::stderr", "{}", trimmed);
                }
            }
            Err(e) => {
                tracing::debug!(target: "agent::stderr", error = %e, "stderr stream error");
                break;
            }
        }
    }
}
