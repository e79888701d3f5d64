//! # Response Delivery Queue
//!
//! Per-connection outboxes that decouple host-thread execution from socket
//! I/O. The host thread pushes responses; each connection task drains its
//! own outbox in push order. Outboxes exist only while their connection is
//! registered, so responses for a departed client are dropped.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use crate::execution::command::{ClientId, Response};

#[derive(Debug, Default)]
struct Outbox {
    responses: Mutex<VecDeque<Response>>,
    ready: Notify,
}

impl Outbox {
    fn take(&self) -> Vec<Response> {
        self.responses.lock().drain(..).collect()
    }
}

#[derive(Debug, Default)]
pub struct ResponseDeliveryQueue {
    outboxes: DashMap<ClientId, Arc<Outbox>>,
}

impl ResponseDeliveryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, client: ClientId) {
        self.outboxes.entry(client).or_default();
    }

    /// Drop the client's outbox and anything still in it
    pub fn unregister(&self, client: ClientId) -> usize {
        self.outboxes
            .remove(&client)
            .map(|(_, outbox)| outbox.responses.lock().len())
            .unwrap_or(0)
    }

    /// Queue a response; returns false (and drops it) for unknown clients
    pub fn enqueue(&self, client: ClientId, response: Response) -> bool {
        let Some(outbox) = self.outbox(client) else {
            return false;
        };
        outbox.responses.lock().push_back(response);
        outbox.ready.notify_one();
        true
    }

    /// Drain everything pending for `client`, in push order
    pub fn take_responses(&self, client: ClientId) -> Vec<Response> {
        self.outbox(client)
            .map(|outbox| outbox.take())
            .unwrap_or_default()
    }

    pub fn has_responses(&self, client: ClientId) -> bool {
        self.outbox(client)
            .is_some_and(|outbox| !outbox.responses.lock().is_empty())
    }

    pub fn is_registered(&self, client: ClientId) -> bool {
        self.outboxes.contains_key(&client)
    }

    pub fn client_count(&self) -> usize {
        self.outboxes.len()
    }

    /// Wait up to `timeout` for at least one response, then drain
    ///
    /// Returns an empty vector on timeout or if the client is unknown.
    pub async fn wait_for_responses(&self, client: ClientId, timeout: Duration) -> Vec<Response> {
        let Some(outbox) = self.outbox(client) else {
            return Vec::new();
        };

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let ready = outbox.take();
            if !ready.is_empty() {
                return ready;
            }
            if tokio::time::timeout_at(deadline, outbox.ready.notified())
                .await
                .is_err()
            {
                return outbox.take();
            }
        }
    }

    /// Clone the Arc out so no map shard lock is held across awaits
    fn outbox(&self, client: ClientId) -> Option<Arc<Outbox>> {
        self.outboxes.get(&client).map(|entry| Arc::clone(entry.value()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::command::{Command, Payload};
    use serde_json::json;

    fn response(id: &str) -> Response {
        Response::ok(&Command::new("echo", id, Payload::new()), json!(null))
    }

    #[test]
    fn test_drains_in_push_order() {
        let queue = ResponseDeliveryQueue::new();
        let client = ClientId::new();
        queue.register(client);

        assert!(queue.enqueue(client, response("1")));
        assert!(queue.enqueue(client, response("2")));
        assert!(queue.has_responses(client));

        let ids: Vec<_> = queue
            .take_responses(client)
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["1", "2"]);
        assert!(!queue.has_responses(client));
    }

    #[test]
    fn test_unregistered_client_responses_are_discarded() {
        let queue = ResponseDeliveryQueue::new();
        let client = ClientId::new();

        assert!(!queue.enqueue(client, response("orphan")));

        queue.register(client);
        queue.enqueue(client, response("pending"));
        assert_eq!(queue.unregister(client), 1);
        assert!(!queue.is_registered(client));
        assert!(queue.take_responses(client).is_empty());
        assert!(!queue.enqueue(client, response("late")));
    }

    #[tokio::test]
    async fn test_wait_wakes_on_enqueue() {
        let queue = Arc::new(ResponseDeliveryQueue::new());
        let client = ClientId::new();
        queue.register(client);

        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                queue.enqueue(client, response("done"));
            })
        };

        let responses = queue
            .wait_for_responses(client, Duration::from_secs(5))
            .await;
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].id, "done");
        producer.join().unwrap();
    }

    #[tokio::test]
    async fn test_wait_times_out_empty() {
        let queue = ResponseDeliveryQueue::new();
        let client = ClientId::new();
        queue.register(client);

        let responses = queue
            .wait_for_responses(client, Duration::from_millis(20))
            .await;
        assert!(responses.is_empty());

        let unknown = queue
            .wait_for_responses(ClientId::new(), Duration::from_millis(20))
            .await;
        assert!(unknown.is_empty());
    }
}
