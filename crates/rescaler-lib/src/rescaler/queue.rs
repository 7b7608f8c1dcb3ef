//! Pending request queue
//!
//! Requests are consumed straight from the state store. Before dispatch the
//! queue drops expired requests and keeps only the newest request per
//! structure and action; every discarded request is deleted immediately.

use crate::models::{Direction, Request};
use crate::store::{StateStore, StoreResult};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Requests ready for dispatch and what was discarded to get them
#[derive(Debug, Default)]
pub struct QueueReport {
    pub requests: Vec<Request>,
    pub expired: usize,
    pub superseded: usize,
}

/// Deduplicating view over the pending requests in the store
pub struct RequestQueue<'a> {
    store: &'a dyn StateStore,
}

impl<'a> RequestQueue<'a> {
    pub fn new(store: &'a dyn StateStore) -> Self {
        Self { store }
    }

    /// Collect the requests to dispatch at `now` (unix seconds)
    ///
    /// A request older than `max_age` is deleted. Among requests for the
    /// same structure and action only the newest survives; on equal
    /// timestamps the one listed first is kept. Survivors are returned in
    /// the order their group was first seen.
    pub async fn collect_pending(&self, max_age: Duration, now: i64) -> StoreResult<QueueReport> {
        let max_age = max_age.as_secs() as i64;
        let mut report = QueueReport::default();
        let mut groups: HashMap<(String, String), usize> = HashMap::new();

        for request in self.store.get_requests().await? {
            if request.age(now) > max_age {
                debug!(structure = %request.structure, action = %request.action, timestamp = request.timestamp, "Deleting expired request");
                self.store.delete_request(&request).await?;
                report.expired += 1;
                continue;
            }

            match groups.entry((request.structure.clone(), request.action.clone())) {
                Entry::Vacant(entry) => {
                    entry.insert(report.requests.len());
                    report.requests.push(request);
                }
                Entry::Occupied(entry) => {
                    let kept = &mut report.requests[*entry.get()];
                    let stale = if request.timestamp > kept.timestamp {
                        std::mem::replace(kept, request)
                    } else {
                        request
                    };
                    debug!(structure = %stale.structure, action = %stale.action, timestamp = stale.timestamp, "Deleting superseded request");
                    self.store.delete_request(&stale).await?;
                    report.superseded += 1;
                }
            }
        }

        Ok(report)
    }

    /// Delete every pending request, returning how many were removed
    pub async fn purge(&self) -> StoreResult<usize> {
        let requests = self.store.get_requests().await?;
        for request in &requests {
            self.store.delete_request(request).await?;
        }
        Ok(requests.len())
    }
}

/// Split requests into scale-down and scale-up batches
///
/// Requests whose action carries no direction are dropped here and left in
/// the store until they expire.
pub fn split_by_direction(requests: Vec<Request>) -> (Vec<Request>, Vec<Request>) {
    let mut down = Vec::new();
    let mut up = Vec::new();
    for request in requests {
        match request.direction() {
            Some(Direction::Down) => down.push(request),
            Some(Direction::Up) => up.push(request),
            None => debug!(structure = %request.structure, action = %request.action, "Skipping request without direction"),
        }
    }
    (down, up)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AgentEndpoint, Placement, ResourceKind};
    use crate::store::MemoryStore;

    fn request(structure: &str, amount: i64, timestamp: i64) -> Request {
        let placement = Placement {
            host: "host0".to_string(),
            endpoint: AgentEndpoint {
                ip: "10.0.0.1".to_string(),
                port: 8000,
            },
        };
        Request::new(structure, ResourceKind::Cpu, amount, &placement, timestamp)
    }

    async fn store_with(requests: &[Request]) -> MemoryStore {
        let store = MemoryStore::new();
        for request in requests {
            store.insert(request).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_newest_duplicate_survives() {
        let store = store_with(&[
            request("node0", 10, 990),
            request("node0", 20, 995),
            request("node0", 30, 992),
            request("node1", 10, 991),
        ])
        .await;

        let report = RequestQueue::new(&store)
            .collect_pending(Duration::from_secs(60), 1000)
            .await
            .unwrap();

        assert_eq!(report.superseded, 2);
        assert_eq!(report.requests.len(), 2);
        assert_eq!(report.requests[0].structure, "node0");
        assert_eq!(report.requests[0].amount, 20);
        assert_eq!(report.requests[1].structure, "node1");
        assert_eq!(store.count::<Request>().await, 2);
    }

    #[tokio::test]
    async fn test_equal_timestamps_keep_first_seen() {
        let store = store_with(&[request("node0", 10, 990), request("node0", 20, 990)]).await;

        let report = RequestQueue::new(&store)
            .collect_pending(Duration::from_secs(60), 1000)
            .await
            .unwrap();

        assert_eq!(report.requests.len(), 1);
        assert_eq!(report.requests[0].amount, 10);
        assert_eq!(store.get_requests().await.unwrap()[0].amount, 10);
    }

    #[tokio::test]
    async fn test_directions_are_deduplicated_separately() {
        let store = store_with(&[request("node0", 10, 990), request("node0", -10, 991)]).await;

        let report = RequestQueue::new(&store)
            .collect_pending(Duration::from_secs(60), 1000)
            .await
            .unwrap();

        assert_eq!(report.requests.len(), 2);
        assert_eq!(report.superseded, 0);
    }

    #[tokio::test]
    async fn test_expired_requests_are_deleted() {
        let store = store_with(&[
            request("node0", 10, 900),
            request("node0", 20, 939),
            request("node1", 10, 940),
        ])
        .await;

        let report = RequestQueue::new(&store)
            .collect_pending(Duration::from_secs(60), 1000)
            .await
            .unwrap();

        // The 939 request is both expired and the newest; it is still dropped
        // while the one exactly `max_age` old survives
        assert_eq!(report.expired, 2);
        assert_eq!(report.requests.len(), 1);
        assert_eq!(report.requests[0].structure, "node1");
        assert_eq!(store.count::<Request>().await, 1);
    }

    #[tokio::test]
    async fn test_zero_max_age_keeps_only_current_requests() {
        let store = store_with(&[request("node0", 10, 1000), request("node1", 10, 999)]).await;

        let report = RequestQueue::new(&store)
            .collect_pending(Duration::ZERO, 1000)
            .await
            .unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(report.requests.len(), 1);
        assert_eq!(report.requests[0].structure, "node0");

        store.insert(&request("node0", 10, 5000)).await.unwrap();
        assert_eq!(RequestQueue::new(&store).purge().await.unwrap(), 2);
        assert_eq!(store.count::<Request>().await, 0);
    }

    #[test]
    fn test_split_by_direction() {
        let mut odd = request("node2", 10, 0);
        odd.action = "Reboot".to_string();
        let (down, up) = split_by_direction(vec![
            request("node0", 10, 0),
            request("node1", -10, 0),
            odd,
        ]);

        assert_eq!(down.len(), 1);
        assert_eq!(down[0].structure, "node1");
        assert_eq!(up.len(), 1);
        assert_eq!(up[0].structure, "node0");
    }
}
