//! Host pool — bounded reservation of build-agent hosts.
//!
//! Members live in a map; availability is an unbounded queue of host
//! handles. `reserve` hands out one queued host at a time, so at most
//! one build runs per member. A host deallocated while queued or
//! reserved is dropped lazily: `reserve` skips it and `release` does
//! not requeue it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info};

use dockyard_core::{HostId, HostInfo};
use dockyard_runtime::Host;

pub struct HostPool {
    members: Mutex<HashMap<HostId, Arc<Host>>>,
    queue_tx: mpsc::UnboundedSender<Arc<Host>>,
    queue_rx: Mutex<mpsc::UnboundedReceiver<Arc<Host>>>,
}

impl Default for HostPool {
    fn default() -> Self {
        Self::new()
    }
}

impl HostPool {
    pub fn new() -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            members: Mutex::new(HashMap::new()),
            queue_tx,
            queue_rx: Mutex::new(queue_rx),
        }
    }

    /// Add `host` and mark it available. Returns `false` if a host with
    /// the same id is already a member.
    pub async fn allocate(&self, host: Arc<Host>) -> bool {
        let mut members = self.members.lock().await;
        if members.contains_key(host.id()) {
            return false;
        }
        info!(host = %host.id(), "host added to pool");
        members.insert(host.id().to_string(), host.clone());
        // the pool holds the receiver, so the send cannot fail
        let _ = self.queue_tx.send(host);
        true
    }

    /// Remove a member. An in-flight reservation is allowed to finish.
    pub async fn deallocate(&self, id: &str) -> bool {
        let removed = self.members.lock().await.remove(id).is_some();
        if removed {
            info!(host = %id, "host removed from pool");
        }
        removed
    }

    /// Wait for an available host. There is no timeout; wrap the call in
    /// `tokio::time::timeout` for a bounded wait.
    pub async fn reserve(&self) -> Arc<Host> {
        let mut rx = self.queue_rx.lock().await;
        while let Some(host) = rx.recv().await {
            if self.is_member(&host).await {
                debug!(host = %host.id(), "host reserved");
                return host;
            }
            debug!(host = %host.id(), "skipping deallocated host");
        }
        // the pool holds a sender, so the queue never closes
        std::future::pending().await
    }

    /// Return a reserved host. Dropped if it is no longer a member.
    pub async fn release(&self, host: Arc<Host>) {
        if self.is_member(&host).await {
            debug!(host = %host.id(), "host released");
            let _ = self.queue_tx.send(host);
        } else {
            debug!(host = %host.id(), "released host no longer in pool, dropping");
        }
    }

    /// Membership is by handle, so a host re-allocated under the same id
    /// does not revive stale queue entries.
    async fn is_member(&self, host: &Arc<Host>) -> bool {
        self.members
            .lock()
            .await
            .get(host.id())
            .is_some_and(|m| Arc::ptr_eq(m, host))
    }

    pub async fn members(&self) -> Vec<HostInfo> {
        let mut infos: Vec<HostInfo> = self
            .members
            .lock()
            .await
            .values()
            .map(|h| h.info().clone())
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub async fn len(&self) -> usize {
        self.members.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use dockyard_runtime::MemoryRuntime;

    fn make_host(id: &str) -> Arc<Host> {
        Arc::new(Host::new(
            HostInfo::new(id, format!("mem://{id}"), 2.0, 2048.0),
            Arc::new(MemoryRuntime::new()),
        ))
    }

    #[tokio::test]
    async fn allocate_twice() {
        let pool = HostPool::new();
        let h = make_host("h1");
        assert!(pool.allocate(h.clone()).await);
        assert!(!pool.allocate(h).await);
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn reserve_returns_allocated_host() {
        let pool = HostPool::new();
        let h = make_host("h1");
        pool.allocate(h.clone()).await;
        let got = pool.reserve().await;
        assert!(Arc::ptr_eq(&got, &h));
    }

    #[tokio::test]
    async fn second_reserve_blocks_until_release() {
        let pool = Arc::new(HostPool::new());
        pool.allocate(make_host("h1")).await;
        let first = pool.reserve().await;

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.reserve().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        pool.release(first.clone()).await;
        let second = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn deallocated_while_reserved_is_not_requeued() {
        let pool = HostPool::new();
        let h = make_host("h1");
        pool.allocate(h.clone()).await;
        let reserved = pool.reserve().await;

        assert!(pool.deallocate("h1").await);
        pool.release(reserved).await;

        let blocked = tokio::time::timeout(Duration::from_millis(20), pool.reserve()).await;
        assert!(blocked.is_err());
    }

    #[tokio::test]
    async fn deallocated_while_queued_is_skipped() {
        let pool = HostPool::new();
        pool.allocate(make_host("h1")).await;
        pool.allocate(make_host("h2")).await;
        pool.deallocate("h1").await;

        let got = pool.reserve().await;
        assert_eq!(got.id(), "h2");
    }

    #[tokio::test]
    async fn reallocated_host_gets_one_slot() {
        let pool = HostPool::new();
        pool.allocate(make_host("h1")).await;
        pool.deallocate("h1").await;
        let fresh = make_host("h1");
        pool.allocate(fresh.clone()).await;

        let got = pool.reserve().await;
        assert!(Arc::ptr_eq(&got, &fresh));
        let again = tokio::time::timeout(Duration::from_millis(20), pool.reserve()).await;
        assert!(again.is_err());
    }

    #[tokio::test]
    async fn members_sorted_by_id() {
        let pool = HostPool::new();
        pool.allocate(make_host("b")).await;
        pool.allocate(make_host("a")).await;
        let ids: Vec<String> = pool.members().await.into_iter().map(|h| h.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
