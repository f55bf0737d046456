use std::{
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use parking_lot::Mutex;
use tokio::sync::{
    mpsc::UnboundedSender,
    oneshot,
};

use crate::{
    core::{
        error::SessionError,
        id::{
            Id,
            SequentialIdAllocator,
        },
        types::HashMap,
        uri::WildcardUri,
    },
    session::{
        handler::InvocationHandler,
        session::{
            Event,
            RpcResult,
        },
    },
};

/// A request waiting for its reply from the router.
///
/// Every variant carries the single-fulfillment slot of the caller waiting on it.
pub(crate) enum PendingRequest {
    Call(oneshot::Sender<Result<RpcResult>>),
    Publish(oneshot::Sender<Result<Id>>),
    Subscribe {
        topic: WildcardUri,
        key: u64,
        event_tx: UnboundedSender<Event>,
        response_tx: oneshot::Sender<Result<Id>>,
    },
    Unsubscribe(oneshot::Sender<Result<()>>),
    Register {
        procedure: WildcardUri,
        handler: Arc<dyn InvocationHandler>,
        response_tx: oneshot::Sender<Result<Id>>,
    },
    Unregister(oneshot::Sender<Result<()>>),
}

impl PendingRequest {
    /// The type code of the message that started the request, as echoed in ERROR messages.
    pub fn request_type(&self) -> u64 {
        match self {
            Self::Call(_) => 48,
            Self::Publish(_) => 16,
            Self::Subscribe { .. } => 32,
            Self::Unsubscribe(_) => 34,
            Self::Register { .. } => 64,
            Self::Unregister(_) => 66,
        }
    }

    /// Resolves the request with an error.
    pub fn fail(self, error: anyhow::Error) {
        // The caller may have stopped waiting, which is not an error here.
        match self {
            Self::Call(tx) => tx.send(Err(error)).ok(),
            Self::Publish(tx) => tx.send(Err(error)).ok(),
            Self::Subscribe { response_tx, .. } => response_tx.send(Err(error)).ok(),
            Self::Unsubscribe(tx) => tx.send(Err(error)).ok(),
            Self::Register { response_tx, .. } => response_tx.send(Err(error)).ok(),
            Self::Unregister(tx) => tx.send(Err(error)).ok(),
        };
    }
}

struct RequestTableInner {
    open: bool,
    ids: SequentialIdAllocator,
    pending: HashMap<Id, PendingRequest>,
}

/// Table of outstanding requests, keyed by request ID.
///
/// Requests are inserted by the issuing path and removed by the dispatcher, a timeout or the
/// caller going away, whichever happens first. All mutations take the same lock, which is never
/// held across an await.
pub(crate) struct RequestTable {
    inner: Mutex<RequestTableInner>,
}

impl Default for RequestTable {
    fn default() -> Self {
        Self {
            inner: Mutex::new(RequestTableInner {
                open: false,
                ids: SequentialIdAllocator::default(),
                pending: HashMap::default(),
            }),
        }
    }
}

impl RequestTable {
    /// Opens the table for a newly-established session, restarting IDs at 1.
    pub fn open(&self) {
        let mut inner = self.inner.lock();
        inner.open = true;
        inner.ids.reset();
    }

    /// Allocates an ID that is not used by any outstanding request, without tracking a request.
    pub fn allocate_id(&self) -> Result<Id, SessionError> {
        let mut inner = self.inner.lock();
        Self::next_id(&mut inner)
    }

    fn next_id(inner: &mut RequestTableInner) -> Result<Id, SessionError> {
        if !inner.open {
            return Err(SessionError::SessionClosed);
        }
        let RequestTableInner { ids, pending, .. } = inner;
        ids.generate_id(|id| pending.contains_key(&id))
            .ok_or(SessionError::ConnectionLost)
    }

    /// Inserts a request that nobody waits on.
    pub fn insert_detached(&self, request: PendingRequest) -> Result<Id, SessionError> {
        let mut inner = self.inner.lock();
        let id = Self::next_id(&mut inner)?;
        inner.pending.insert(id, request);
        Ok(id)
    }

    /// Inserts a request, returning a guard that removes it again when the caller stops waiting.
    pub fn insert(&self, request: PendingRequest) -> Result<PendingRequestGuard<'_>, SessionError> {
        let id = self.insert_detached(request)?;
        Ok(PendingRequestGuard { table: self, id })
    }

    /// Removes and returns the request with the given ID, if it is of the expected type.
    ///
    /// A request of another type stays in the table.
    pub fn take(&self, id: Id, request_type: u64) -> Option<PendingRequest> {
        let mut inner = self.inner.lock();
        match inner.pending.get(&id) {
            Some(request) if request.request_type() == request_type => inner.pending.remove(&id),
            _ => None,
        }
    }

    pub fn remove(&self, id: Id) {
        self.inner.lock().pending.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Closes the table and resolves every outstanding request with [`SessionError::ConnectionLost`].
    pub fn drain(&self) -> usize {
        let pending = {
            let mut inner = self.inner.lock();
            inner.open = false;
            std::mem::take(&mut inner.pending)
        };
        let count = pending.len();
        for (_, request) in pending {
            request.fail(SessionError::ConnectionLost.into());
        }
        count
    }
}

/// Removes its request from the [`RequestTable`] when dropped.
///
/// Dropped when the caller's future completes, times out or is itself dropped.
pub(crate) struct PendingRequestGuard<'a> {
    table: &'a RequestTable,
    id: Id,
}

impl PendingRequestGuard<'_> {
    pub fn id(&self) -> Id {
        self.id
    }

    /// Waits for the request to be resolved.
    ///
    /// Timing out removes the request without notifying the router.
    pub async fn wait<T>(
        self,
        rx: oneshot::Receiver<Result<T>>,
        timeout: Option<Duration>,
    ) -> Result<T> {
        let result = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, rx)
                .await
                .map_err(|_| SessionError::Timeout(timeout))?,
            None => rx.await,
        };
        match result {
            Ok(result) => result,
            Err(_) => Err(SessionError::ConnectionLost.into()),
        }
    }
}

impl Drop for PendingRequestGuard<'_> {
    fn drop(&mut self) {
        self.table.remove(self.id);
    }
}

#[cfg(test)]
mod requests_test {
    use std::time::Duration;

    use tokio::sync::oneshot;

    use crate::{
        core::{
            error::SessionError,
            id::Id,
        },
        session::{
            requests::{
                PendingRequest,
                RequestTable,
            },
            session::RpcResult,
        },
    };

    #[test]
    fn rejects_requests_until_opened() {
        let table = RequestTable::default();
        let (tx, _rx) = oneshot::channel();
        assert_matches::assert_matches!(
            table.insert_detached(PendingRequest::Call(tx)),
            Err(SessionError::SessionClosed)
        );
        table.open();
        assert_eq!(table.allocate_id().unwrap(), Id::MIN);
    }

    #[test]
    fn skips_outstanding_ids() {
        let table = RequestTable::default();
        table.open();
        let (tx, _rx) = oneshot::channel();
        let first = table.insert_detached(PendingRequest::Call(tx)).unwrap();
        assert_eq!(first.value(), 1);
        assert_eq!(table.allocate_id().unwrap().value(), 2);
        table.open();
        // The counter restarts, but request 1 is still outstanding.
        assert_eq!(table.allocate_id().unwrap().value(), 2);
    }

    #[test]
    fn takes_only_matching_request_type() {
        let table = RequestTable::default();
        table.open();
        let (tx, _rx) = oneshot::channel();
        let id = table.insert_detached(PendingRequest::Publish(tx)).unwrap();
        assert!(table.take(id, 48).is_none());
        assert_eq!(table.len(), 1);
        assert!(table.take(id, 16).is_some());
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn drains_with_connection_lost() {
        let table = RequestTable::default();
        table.open();
        let (a_tx, a_rx) = oneshot::channel::<anyhow::Result<RpcResult>>();
        let (b_tx, b_rx) = oneshot::channel::<anyhow::Result<RpcResult>>();
        table.insert_detached(PendingRequest::Call(a_tx)).unwrap();
        table.insert_detached(PendingRequest::Call(b_tx)).unwrap();
        assert_eq!(table.drain(), 2);
        for rx in [a_rx, b_rx] {
            assert_matches::assert_matches!(rx.await, Ok(Err(err)) => {
                assert_matches::assert_matches!(err.downcast_ref::<SessionError>(), Some(SessionError::ConnectionLost));
            });
        }
        let (tx, _rx) = oneshot::channel();
        assert_matches::assert_matches!(
            table.insert_detached(PendingRequest::Call(tx)),
            Err(SessionError::SessionClosed)
        );
    }

    #[tokio::test]
    async fn guard_removes_request_on_timeout() {
        let table = RequestTable::default();
        table.open();
        let (tx, rx) = oneshot::channel::<anyhow::Result<RpcResult>>();
        let guard = table.insert(PendingRequest::Call(tx)).unwrap();
        assert_eq!(table.len(), 1);
        assert_matches::assert_matches!(guard.wait(rx, Some(Duration::from_millis(10))).await, Err(err) => {
            assert_matches::assert_matches!(err.downcast_ref::<SessionError>(), Some(SessionError::Timeout(_)));
        });
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn guard_removes_request_on_drop() {
        let table = RequestTable::default();
        table.open();
        let (tx, _rx) = oneshot::channel();
        let guard = table.insert(PendingRequest::Unsubscribe(tx)).unwrap();
        assert_eq!(guard.id().value(), 1);
        drop(guard);
        assert_eq!(table.len(), 0);
    }
}
