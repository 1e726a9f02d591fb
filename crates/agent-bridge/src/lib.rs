//! agent-bridge: host-side driver for the agent worker subprocess.
//!
//! A long-running host process talks to a separate computation engine over
//! a line-delimited JSON protocol on stdin/stdout. This crate supplies the
//! supervisor that spawns the worker, multiplexes concurrent requests over
//! the single pipe pair, correlates responses by id, streams intermediate
//! results to callers, and fails everything in flight when the worker dies.

pub mod codec;
pub mod protocol;
pub mod spawn;

mod registry;
mod supervisor;

pub use registry::PendingRequests;
pub use spawn::{PythonSpawner, SpawnError, WorkerSpawner};
pub use supervisor::{AgentConfig, AgentError, AgentSupervisor, RunOptions};

pub use protocol::{AgentRequest, AgentResponse, EventKind, ProgressEvent, ProgressKind, RequestId};
