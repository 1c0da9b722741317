//! Execution registry - the broker's table of in-flight operations

use crate::protocol::OperationKind;
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::oneshot;
use uuid::Uuid;

/// A live execution accepted by the dispatcher.
///
/// Holds only the owning client's id, never the connection itself, so a
/// disconnect cannot leak the record; it is dropped when the terminal event
/// for its id is processed.
pub struct ExecutionRecord {
    client_id: Uuid,
    kind: OperationKind,
    started: Instant,
    cancel: Option<oneshot::Sender<()>>,
}

impl ExecutionRecord {
    pub fn new(client_id: Uuid, kind: OperationKind, cancel: oneshot::Sender<()>) -> Self {
        Self {
            client_id,
            kind,
            started: Instant::now(),
            cancel: Some(cancel),
        }
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn started(&self) -> Instant {
        self.started
    }
}

/// In-flight executions keyed by `executionId`.
///
/// An id is unique among live records; a second submission with the same id
/// is rejected until the first one's terminal event has been emitted.
#[derive(Default)]
pub struct ExecutionRegistry {
    records: HashMap<String, ExecutionRecord>,
}

impl ExecutionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new execution; fails when the id is already live.
    pub fn insert(&mut self, execution_id: &str, record: ExecutionRecord) -> bool {
        if self.records.contains_key(execution_id) {
            return false;
        }
        self.records.insert(execution_id.to_string(), record);
        true
    }

    /// Signal cancellation to the supervising task. The record stays until
    /// the task emits its (cancelled) terminal event. Returns false for
    /// unknown ids.
    pub fn cancel(&mut self, execution_id: &str) -> bool {
        match self.records.get_mut(execution_id) {
            Some(record) => {
                if let Some(cancel) = record.cancel.take() {
                    let _ = cancel.send(());
                }
                true
            }
            None => false,
        }
    }

    /// Drop a record once its terminal event has been queued.
    pub fn remove(&mut self, execution_id: &str) -> Option<ExecutionRecord> {
        self.records.remove(execution_id)
    }

    pub fn contains(&self, execution_id: &str) -> bool {
        self.records.contains_key(execution_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
