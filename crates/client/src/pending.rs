//! Correlation of in-flight requests with their responses.
//!
//! Every entry is removed exactly once: by the response that completes it, by
//! the caller giving up (timeout or drop), or by its connection going away.
//! Removal is the decision point, so whichever path removes the entry owns
//! the outcome and every other path is a no-op.

use crate::error::{Error, Result};

use dashmap::DashMap;
use srpc_protocol::Response;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;

struct Entry<O> {
    sender: oneshot::Sender<Response>,
    owner: O,
}

/// Map from request id to the waiting caller.
///
/// `O` is whatever the entry needs to hand back on completion; the client
/// stores the connection that carried the request.
pub struct PendingTable<O> {
    entries: DashMap<u32, Entry<O>>,
}

impl<O> PendingTable<O> {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Register a request that has been written.
    ///
    /// A still-pending entry under the same id (possible only after the id
    /// counter wraps) is displaced and its caller observes a closed
    /// connection.
    pub fn insert(&self, request_id: u32, owner: O) -> oneshot::Receiver<Response> {
        let (sender, receiver) = oneshot::channel();
        self.entries.insert(request_id, Entry { sender, owner });
        receiver
    }

    /// Deliver a response to its caller.
    ///
    /// Returns the entry's owner, or `None` if no entry exists (duplicate,
    /// stale or already timed out).
    pub fn complete(&self, request_id: u32, response: Response) -> Option<O> {
        let (_, entry) = self.entries.remove(&request_id)?;
        // The caller may have stopped listening; the entry is gone either way.
        let _ = entry.sender.send(response);
        Some(entry.owner)
    }

    /// Remove an entry without completing it.
    pub fn remove(&self, request_id: u32) -> Option<O> {
        self.entries
            .remove(&request_id)
            .map(|(_, entry)| entry.owner)
    }

    /// Remove every entry whose owner matches, failing their callers.
    ///
    /// Returns the number of entries removed.
    pub fn remove_owned_by(&self, mut matches: impl FnMut(&O) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !matches(&entry.owner));
        before.saturating_sub(self.entries.len())
    }

    /// Whether any entry's owner matches.
    pub fn any_owned_by(&self, mut matches: impl FnMut(&O) -> bool) -> bool {
        self.entries.iter().any(|entry| matches(&entry.owner))
    }

    /// Remove all entries, failing their callers.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Whether a request id is pending.
    pub fn contains(&self, request_id: u32) -> bool {
        self.entries.contains_key(&request_id)
    }

    /// Number of pending requests.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no request is pending.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<O> Default for PendingTable<O> {
    fn default() -> Self {
        Self::new()
    }
}

/// The eventual response to a sent request.
///
/// Awaiting it directly waits indefinitely; [`PendingResponse::wait`] bounds
/// the wait. Dropping it abandons the request and frees its table entry.
pub struct PendingResponse<O> {
    table: Arc<PendingTable<O>>,
    request_id: u32,
    receiver: oneshot::Receiver<Response>,
}

impl<O> PendingResponse<O> {
    /// Wrap a receiver obtained from [`PendingTable::insert`].
    #[must_use]
    pub const fn new(
        table: Arc<PendingTable<O>>,
        request_id: u32,
        receiver: oneshot::Receiver<Response>,
    ) -> Self {
        Self {
            table,
            request_id,
            receiver,
        }
    }

    /// Id the request was sent under.
    #[must_use]
    pub const fn request_id(&self) -> u32 {
        self.request_id
    }

    /// Wait up to `timeout` for the response.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if no response arrived in time, or
    /// [`Error::ConnectionClosed`] if the request was dropped from the table
    /// without a response.
    pub async fn wait(mut self, timeout: Duration) -> Result<Response> {
        match tokio::time::timeout(timeout, &mut self.receiver).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                if self.table.remove(self.request_id).is_some() {
                    return Err(Error::Timeout(timeout));
                }
                // A completion removed the entry first and is delivering now.
                match (&mut self.receiver).await {
                    Ok(response) => Ok(response),
                    Err(_) => Err(Error::Timeout(timeout)),
                }
            }
        }
    }
}

impl<O> Future for PendingResponse<O> {
    type Output = Result<Response>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.map_err(|_| Error::ConnectionClosed))
    }
}

impl<O> Drop for PendingResponse<O> {
    fn drop(&mut self) {
        // No-op once completed or timed out.
        self.table.remove(self.request_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table() -> Arc<PendingTable<()>> {
        Arc::new(PendingTable::new())
    }

    fn pending(table: &Arc<PendingTable<()>>, id: u32) -> PendingResponse<()> {
        PendingResponse::new(Arc::clone(table), id, table.insert(id, ()))
    }

    #[tokio::test]
    async fn test_complete_delivers_once() {
        let table = table();
        let response = pending(&table, 7);

        assert!(table.complete(7, Response::ok(7, json!("hi"))).is_some());
        assert!(table.complete(7, Response::ok(7, json!("again"))).is_none());

        let response = response.await.unwrap();
        assert_eq!(response.request_id(), 7);
        assert_eq!(response.result(), Some(&json!("hi")));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_id_is_dropped() {
        let table = table();
        assert!(table.complete(99, Response::ok(99, json!(null))).is_none());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_reversed_completion_order() {
        let table = table();
        let handles: Vec<_> = (0..1000u32)
            .map(|id| {
                let response = pending(&table, id);
                tokio::spawn(async move { (id, response.await) })
            })
            .collect();

        for id in (0..1000u32).rev() {
            assert!(table.complete(id, Response::ok(id, json!(id))).is_some());
        }

        for handle in handles {
            let (id, response) = handle.await.unwrap();
            let response = response.unwrap();
            assert_eq!(response.request_id(), id);
            assert_eq!(response.result(), Some(&json!(id)));
        }
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_entry() {
        let table = table();
        let response = pending(&table, 1);

        let result = response.wait(Duration::from_millis(100)).await;
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert!(table.is_empty());

        // The late response finds nothing.
        assert!(table.complete(1, Response::ok(1, json!(1))).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_racing_completion_has_one_outcome() {
        for _ in 0..100 {
            let table = table();
            let response = pending(&table, 3);

            let completer = {
                let table = Arc::clone(&table);
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    table.complete(3, Response::ok(3, json!("late"))).is_some()
                })
            };

            let outcome = response.wait(Duration::from_millis(10)).await;
            let completed = completer.await.unwrap();

            match outcome {
                Ok(response) => {
                    assert!(completed);
                    assert_eq!(response.result(), Some(&json!("late")));
                }
                Err(Error::Timeout(_)) => assert!(!completed),
                Err(other) => panic!("unexpected outcome: {other}"),
            }
            assert!(table.is_empty());
        }
    }

    #[tokio::test]
    async fn test_drop_frees_entry() {
        let table = table();
        drop(pending(&table, 5));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_remove_owned_by_fails_callers() {
        let table: Arc<PendingTable<u8>> = Arc::new(PendingTable::new());
        let a = PendingResponse::new(Arc::clone(&table), 1, table.insert(1, 1));
        let b = PendingResponse::new(Arc::clone(&table), 2, table.insert(2, 2));

        assert!(table.any_owned_by(|owner| *owner == 1));
        assert_eq!(table.remove_owned_by(|owner| *owner == 1), 1);
        assert!(!table.any_owned_by(|owner| *owner == 1));

        assert!(matches!(a.await, Err(Error::ConnectionClosed)));
        assert!(table.contains(2));
        table.complete(2, Response::ok(2, json!(2)));
        assert!(b.await.is_ok());
    }
}
