//! In-flight request table.
//!
//! One entry per pending request id, inserted strictly before the request
//! line is written and removed exactly once on terminal resolution: a
//! `final`/`pong` response, a failed write, or bulk invalidation when the
//! worker exits. Lock-free concurrent access via DashMap; the dispatcher
//! task and request senders never contend on a single lock.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::protocol::{ProgressEvent, RequestId};
use crate::supervisor::AgentError;

pub(crate) struct PendingEntry {
    /// Terminal resolution channel back to the awaiting caller.
    pub resolve: oneshot::Sender<Result<Value, AgentError>>,
    /// Progress sink for streaming requests.
    pub progress: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

/// Table of pending requests keyed by correlation id.
#[derive(Default)]
pub struct PendingRequests {
    entries: DashMap<String, PendingEntry>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending entry. Rejects an id that is already in flight.
    pub(crate) fn register(&self, id: &RequestId, entry: PendingEntry) -> Result<(), AgentError> {
        match self.entries.entry(id.as_str().to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(())
            }
            Entry::Occupied(_) => Err(AgentError::DuplicateRequest(id.clone())),
        }
    }

    /// Remove and return the entry for a terminal resolution.
    pub(crate) fn remove(&self, id: &RequestId) -> Option<PendingEntry> {
        self.entries.remove(id.as_str()).map(|(_, entry)| entry)
    }

    /// Deliver a progress event to the entry's sink, if it has one.
    ///
    /// Returns false when no entry exists for the id. The entry itself is
    /// never removed here: progress is not terminal.
    pub(crate) fn send_progress(&self, id: &RequestId, event: ProgressEvent) -> bool {
        match self.entries.get(id.as_str()) {
            Some(entry) => {
                if let Some(progress) = &entry.progress {
                    let _ = progress.send(event);
                }
                true
            }
            None => false,
        }
    }

    /// Reject every pending entry and empty the table.
    pub(crate) fn fail_all(&self, mut error: impl FnMut() -> AgentError) {
        let ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, entry)) = self.entries.remove(&id) {
                let _ = entry.resolve.send(Err(error()));
            }
        }
    }

    /// Drop every pending entry without dispatching rejections.
    pub(crate) fn clear(&self) {
        self.entries.clear();
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.entries.contains_key(id.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ProgressKind;
    use serde_json::json;

    fn entry() -> (PendingEntry, oneshot::Receiver<Result<Value, AgentError>>) {
        let (tx, rx) = oneshot::channel();
        (
            PendingEntry {
                resolve: tx,
                progress: None,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn register_and_remove_once() {
        let registry = PendingRequests::new();
        let id = RequestId::from("r1");
        let (e, _rx) = entry();

        registry.register(&id, e).unwrap();
        assert!(registry.contains(&id));

        assert!(registry.remove(&id).is_some());
        assert!(registry.remove(&id).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let registry = PendingRequests::new();
        let id = RequestId::from("r1");
        let (first, _rx1) = entry();
        let (second, _rx2) = entry();

        registry.register(&id, first).unwrap();
        let err = registry.register(&id, second).unwrap_err();
        assert!(matches!(err, AgentError::DuplicateRequest(_)));

        // the original entry is untouched
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn progress_is_not_terminal() {
        let registry = PendingRequests::new();
        let id = RequestId::from("r1");
        let (resolve, _rx) = oneshot::channel();
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();

        registry
            .register(
                &id,
                PendingEntry {
                    resolve,
                    progress: Some(progress_tx),
                },
            )
            .unwrap();

        let delivered = registry.send_progress(
            &id,
            ProgressEvent {
                kind: ProgressKind::Partial,
                data: json!({"text": "h"}),
            },
        );
        assert!(delivered);
        assert!(registry.contains(&id));

        let event = progress_rx.recv().await.unwrap();
        assert_eq!(event.kind, ProgressKind::Partial);
    }

    #[tokio::test]
    async fn progress_without_sink_is_a_noop() {
        let registry = PendingRequests::new();
        let id = RequestId::from("r1");
        let (e, _rx) = entry();
        registry.register(&id, e).unwrap();

        assert!(registry.send_progress(
            &id,
            ProgressEvent {
                kind: ProgressKind::Partial,
                data: Value::Null,
            }
        ));
        assert!(registry.contains(&id));
    }

    #[tokio::test]
    async fn progress_for_unknown_id_reports_missing() {
        let registry = PendingRequests::new();
        assert!(!registry.send_progress(
            &RequestId::from("ghost"),
            ProgressEvent {
                kind: ProgressKind::Partial,
                data: Value::Null,
            }
        ));
    }

    #[tokio::test]
    async fn fail_all_rejects_every_entry() {
        let registry = PendingRequests::new();
        let (e1, rx1) = entry();
        let (e2, rx2) = entry();
        registry.register(&RequestId::from("r1"), e1).unwrap();
        registry.register(&RequestId::from("r2"), e2).unwrap();

        registry.fail_all(|| AgentError::WorkerExited { exit_code: Some(1) });

        assert!(registry.is_empty());
        for rx in [rx1, rx2] {
            match rx.await.unwrap() {
                Err(AgentError::WorkerExited { exit_code }) => assert_eq!(exit_code, Some(1)),
                other => panic!("expected WorkerExited, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn clear_drops_entries_silently() {
        let registry = PendingRequests::new();
        let (e, rx) = entry();
        registry.register(&RequestId::from("r1"), e).unwrap();

        registry.clear();
        assert!(registry.is_empty());

        // sender was dropped, not resolved
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn removing_one_entry_leaves_others_pending() {
        let registry = PendingRequests::new();
        let (e1, _rx1) = entry();
        let (e2, _rx2) = entry();
        registry.register(&RequestId::from("r1"), e1).unwrap();
        registry.register(&RequestId::from("r2"), e2).unwrap();

        registry.remove(&RequestId::from("r1"));

        assert!(!registry.contains(&RequestId::from("r1")));
        assert!(registry.contains(&RequestId::from("r2")));
    }
}
