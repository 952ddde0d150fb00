//! Pending-request bookkeeping for the multiplexed socket.

use crate::core::errors::GremlinError;
use crate::core::types::{RequestId, Traversers};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::oneshot;

/// Outcome delivered to a `submit` caller
pub type SubmitOutcome = Result<Traversers, GremlinError>;

/// Single-use continuation for one request.
///
/// `resolve` consumes the completion, so a request can be settled at most once.
#[derive(Debug)]
pub struct Completion {
    tx: oneshot::Sender<SubmitOutcome>,
}

impl Completion {
    pub fn new(tx: oneshot::Sender<SubmitOutcome>) -> Self {
        Self { tx }
    }

    /// Create a completion and the receiver its outcome arrives on
    pub fn channel() -> (Self, oneshot::Receiver<SubmitOutcome>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    pub fn resolve(self, outcome: SubmitOutcome) {
        // The caller may have stopped waiting; nothing to do then
        let _ = self.tx.send(outcome);
    }
}

/// A request waiting for its response frames
#[derive(Debug)]
pub struct PendingRequest {
    id: RequestId,
    accumulated: Option<Vec<Value>>,
    completion: Completion,
}

impl PendingRequest {
    pub const fn id(&self) -> RequestId {
        self.id
    }

    /// Elements received so far, `None` before the first data frame
    pub fn accumulated(&self) -> Option<&[Value]> {
        self.accumulated.as_deref()
    }

    fn resolve(self, outcome: SubmitOutcome) {
        self.completion.resolve(outcome);
    }
}

/// Map from request id to pending request, owned by the connection driver
#[derive(Debug, Default)]
pub struct RequestRegistry {
    pending: HashMap<RequestId, PendingRequest>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new request.
    ///
    /// An id that is already pending is refused: the new completion is
    /// resolved with an error and the existing entry is left untouched.
    pub fn register(&mut self, id: RequestId, completion: Completion) -> Result<(), GremlinError> {
        if self.pending.contains_key(&id) {
            let err = GremlinError::SerializationError(format!("duplicate request id {}", id));
            completion.resolve(Err(err.clone()));
            return Err(err);
        }
        self.pending.insert(
            id,
            PendingRequest {
                id,
                accumulated: None,
                completion,
            },
        );
        Ok(())
    }

    pub fn lookup(&self, id: &RequestId) -> Option<&PendingRequest> {
        self.pending.get(id)
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.pending.contains_key(id)
    }

    /// Append partial results; returns whether the request is (still) pending
    pub fn record_partial(&mut self, id: &RequestId, elements: Vec<Value>) -> bool {
        match self.pending.get_mut(id) {
            Some(request) => {
                request
                    .accumulated
                    .get_or_insert_with(Vec::new)
                    .extend(elements);
                true
            }
            None => false,
        }
    }

    /// Settle a request with `outcome` and forget it
    pub fn complete(&mut self, id: &RequestId, outcome: SubmitOutcome) -> bool {
        match self.pending.remove(id) {
            Some(request) => {
                request.resolve(outcome);
                true
            }
            None => false,
        }
    }

    /// Append the final elements and settle with everything accumulated
    pub fn finish(&mut self, id: &RequestId, elements: Vec<Value>) -> bool {
        match self.pending.remove(id) {
            Some(mut request) => {
                let mut traversers = request.accumulated.take().unwrap_or_default();
                traversers.extend(elements);
                request.resolve(Ok(traversers));
                true
            }
            None => false,
        }
    }

    /// Fail every pending request with `error` and empty the registry
    pub fn drain_all(&mut self, error: &GremlinError) -> usize {
        let drained = self.pending.len();
        for (_, request) in self.pending.drain() {
            request.resolve(Err(error.clone()));
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Drop for RequestRegistry {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            self.drain_all(&GremlinError::ConnectionClosed(
                "connection dropped".to_string(),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registered(registry: &mut RequestRegistry) -> (RequestId, oneshot::Receiver<SubmitOutcome>) {
        let id = RequestId::new_v4();
        let (completion, rx) = Completion::channel();
        registry.register(id, completion).unwrap();
        (id, rx)
    }

    #[test]
    fn test_partial_then_finish_concatenates() {
        let mut registry = RequestRegistry::new();
        let (id, mut rx) = registered(&mut registry);

        assert!(registry.lookup(&id).unwrap().accumulated().is_none());
        assert!(registry.record_partial(&id, vec![json!(1)]));
        assert!(registry.record_partial(&id, vec![json!("a"), json!("b")]));
        assert_eq!(
            registry.lookup(&id).unwrap().accumulated().unwrap().len(),
            3
        );
        assert!(rx.try_recv().is_err());

        assert!(registry.finish(&id, vec![]));
        assert!(registry.is_empty());
        assert_eq!(
            rx.try_recv().unwrap().unwrap(),
            vec![json!(1), json!("a"), json!("b")]
        );
    }

    #[test]
    fn test_unknown_id_is_a_silent_miss() {
        let mut registry = RequestRegistry::new();
        let (_id, _rx) = registered(&mut registry);
        let other = RequestId::new_v4();

        assert!(registry.lookup(&other).is_none());
        assert!(!registry.record_partial(&other, vec![json!(1)]));
        assert!(!registry.complete(&other, Ok(vec![])));
        assert!(!registry.finish(&other, vec![]));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_complete_removes_entry() {
        let mut registry = RequestRegistry::new();
        let (id, mut rx) = registered(&mut registry);

        let err = GremlinError::ServerError {
            code: 500,
            message: "boom".to_string(),
        };
        assert!(registry.complete(&id, Err(err.clone())));
        assert!(!registry.contains(&id));
        assert_eq!(rx.try_recv().unwrap(), Err(err));
        assert!(!registry.complete(&id, Ok(vec![])));
    }

    #[test]
    fn test_duplicate_registration_is_refused() {
        let mut registry = RequestRegistry::new();
        let (id, mut first) = registered(&mut registry);
        let (completion, mut second) = Completion::channel();

        assert!(registry.register(id, completion).is_err());
        assert!(second.try_recv().unwrap().is_err());
        assert!(first.try_recv().is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_drain_all_fails_everything() {
        let mut registry = RequestRegistry::new();
        let mut receivers: Vec<_> = (0..3).map(|_| registered(&mut registry).1).collect();

        let err = GremlinError::ConnectionClosed("socket closed".to_string());
        assert_eq!(registry.drain_all(&err), 3);
        assert!(registry.is_empty());
        for rx in &mut receivers {
            assert_eq!(rx.try_recv().unwrap(), Err(err.clone()));
        }
    }

    #[test]
    fn test_drop_fails_leftovers() {
        let mut registry = RequestRegistry::new();
        let (_id, mut rx) = registered(&mut registry);
        drop(registry);
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(GremlinError::ConnectionClosed(_))
        ));
    }
}
