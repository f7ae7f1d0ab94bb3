//! Queue Module Tests
//!
//! ## Test Scopes
//! - **AsyncQueue**: per-key FIFO order, round-robin across keys, requeue at the tail.
//! - **SyncQueue**: the N-put/N-get phase machine including the first-update flip, and
//!   the per-key capacity limit.
//! - **Dispatcher**: handler routing, retry of not-ready requests and the ordered
//!   table-data lane.

#[cfg(test)]
mod tests {
    use crate::error::Error;
    use crate::queue::consistency::{AsyncQueue, RequestQueue, SyncQueue};
    use crate::queue::dispatcher::Dispatcher;
    use crate::queue::types::{Phase, QueueKey};
    use crate::transport::network::RequestSink;
    use crate::transport::types::{Message, Tag};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn request(tag: Tag, key: u8, marker: u8) -> Message {
        Message::new(tag)
            .with_table(1, 0)
            .with_key(vec![key])
            .with_value(vec![marker])
    }

    fn queue_key(key: u8) -> QueueKey {
        QueueKey {
            table: 1,
            key: vec![key],
        }
    }

    /// Pops the next request and reports it served.
    fn serve(queue: &dyn RequestQueue) -> Option<Message> {
        let msg = queue.next_request()?;
        queue.complete(msg.clone(), true);
        Some(msg)
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    // ============================================================
    // ASYNC QUEUE TESTS
    // ============================================================

    #[test]
    fn test_async_queue_serves_each_key_in_arrival_order() {
        let queue = AsyncQueue::fifo();
        for marker in 0..5 {
            queue.enqueue(request(Tag::UpdateRequest, 7, marker)).unwrap();
        }

        let served: Vec<u8> = std::iter::from_fn(|| serve(&queue))
            .map(|msg| msg.value[0])
            .collect();

        assert_eq!(served, vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_async_queue_round_robins_keys() {
        let queue = AsyncQueue::fifo();
        queue.enqueue(request(Tag::PutRequest, 1, 10)).unwrap();
        queue.enqueue(request(Tag::PutRequest, 1, 11)).unwrap();
        queue.enqueue(request(Tag::PutRequest, 2, 20)).unwrap();

        let served: Vec<u8> = std::iter::from_fn(|| serve(&queue))
            .map(|msg| msg.value[0])
            .collect();

        assert_eq!(served, vec![10, 20, 11], "Keys should take turns");
        assert_eq!(queue.key_count(), 2);
    }

    #[test]
    fn test_async_queue_requeues_at_tail() {
        let queue = AsyncQueue::fifo();
        queue.enqueue(request(Tag::GetRequest, 3, 1)).unwrap();
        queue.enqueue(request(Tag::GetRequest, 3, 2)).unwrap();

        // ACT: the first request is not ready
        let first = queue.next_request().unwrap();
        queue.complete(first, false);

        // ASSERT
        assert_eq!(queue.len(), 2, "A requeued request is waiting again");
        assert_eq!(serve(&queue).unwrap().value, vec![2]);
        assert_eq!(serve(&queue).unwrap().value, vec![1]);
    }

    // ============================================================
    // SYNC QUEUE TESTS
    // ============================================================

    #[test]
    fn test_sync_queue_first_update_opens_get_phase() {
        let queue = SyncQueue::new(3);

        queue.enqueue(request(Tag::UpdateRequest, 9, 1)).unwrap();
        queue.enqueue(request(Tag::UpdateRequest, 9, 2)).unwrap();
        queue.enqueue(request(Tag::UpdateRequest, 9, 3)).unwrap();

        assert_eq!(serve(&queue).unwrap().value, vec![1]);
        assert_eq!(queue.phase_of(&queue_key(9)), Some(Phase::Get), "First update flips at once");
        assert!(
            queue.next_request().is_none(),
            "Updates #2 and #3 wait until the get phase is over"
        );

        for marker in 0..3 {
            queue.enqueue(request(Tag::GetRequest, 9, 100 + marker)).unwrap();
        }
        for marker in 0..3 {
            let msg = serve(&queue).unwrap();
            assert_eq!(msg.tag, Tag::GetRequest);
            assert_eq!(msg.value, vec![100 + marker]);
        }
        assert_eq!(queue.phase_of(&queue_key(9)), Some(Phase::Put), "Three gets flip back");

        assert_eq!(serve(&queue).unwrap().value, vec![2]);
        assert_eq!(serve(&queue).unwrap().value, vec![3]);
        assert_eq!(queue.phase_of(&queue_key(9)), Some(Phase::Put));
        assert_eq!(queue.counter_of(&queue_key(9)), Some(2));

        queue.enqueue(request(Tag::UpdateRequest, 9, 4)).unwrap();
        assert_eq!(serve(&queue).unwrap().value, vec![4]);
        assert_eq!(
            queue.phase_of(&queue_key(9)),
            Some(Phase::Get),
            "The third update of the round flips to gets"
        );
        assert_eq!(queue.counter_of(&queue_key(9)), Some(0));
    }

    #[test]
    fn test_sync_queue_holds_gets_during_put_phase() {
        let queue = SyncQueue::new(2);

        queue.enqueue(request(Tag::GetRequest, 5, 1)).unwrap();

        assert!(queue.next_request().is_none(), "No get before the first write");
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_sync_queue_rejects_overflow() {
        let queue = SyncQueue::new(2);
        queue.enqueue(request(Tag::GetRequest, 5, 1)).unwrap();
        queue.enqueue(request(Tag::GetRequest, 5, 2)).unwrap();

        let result = queue.enqueue(request(Tag::GetRequest, 5, 3));

        assert!(matches!(result, Err(Error::ProtocolViolation(_))));
        assert!(
            queue.enqueue(request(Tag::PutRequest, 5, 4)).is_ok(),
            "Each sub-queue has its own limit"
        );
    }

    #[test]
    fn test_sync_queue_unserved_request_does_not_count() {
        let queue = SyncQueue::new(2);
        queue.enqueue(request(Tag::PutRequest, 1, 1)).unwrap();

        let msg = queue.next_request().unwrap();
        queue.complete(msg, false);

        assert_eq!(queue.phase_of(&queue_key(1)), Some(Phase::Put));
        assert_eq!(queue.counter_of(&queue_key(1)), Some(0));
        assert_eq!(serve(&queue).unwrap().value, vec![1], "The retry is served next");
        assert_eq!(queue.phase_of(&queue_key(1)), Some(Phase::Get));
    }

    #[test]
    fn test_sync_queue_contains_follows_writes_outside_rounds() {
        let queue = SyncQueue::new(2);
        queue.enqueue(request(Tag::PutRequest, 4, 1)).unwrap();
        queue.enqueue(request(Tag::ContainsRequest, 4, 2)).unwrap();

        assert_eq!(serve(&queue).unwrap().tag, Tag::PutRequest, "The earlier write goes first");
        assert_eq!(serve(&queue).unwrap().tag, Tag::ContainsRequest);

        assert_eq!(queue.phase_of(&queue_key(4)), Some(Phase::Get));
        assert_eq!(queue.counter_of(&queue_key(4)), Some(0), "contains is not a round member");

        queue.enqueue(request(Tag::ContainsRequest, 6, 3)).unwrap();
        assert_eq!(
            serve(&queue).unwrap().value,
            vec![3],
            "A key nobody wrote is still answered"
        );
        assert!(queue.is_empty());
    }

    // ============================================================
    // DISPATCHER TESTS
    // ============================================================

    #[tokio::test]
    async fn test_dispatcher_runs_registered_handler() {
        let dispatcher = Dispatcher::new(Box::new(AsyncQueue::fifo()), Duration::from_millis(1));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let log = seen.clone();
        dispatcher.register(Tag::PutRequest, move |msg| {
            log.lock().unwrap().push(msg.value[0]);
            Ok(true)
        });
        dispatcher.clone().start().await;

        for marker in 0..4 {
            dispatcher.submit(request(Tag::PutRequest, 1, marker)).unwrap();
        }

        eventually(|| seen.lock().unwrap().len() == 4).await;
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3]);
        dispatcher.stop();
    }

    #[tokio::test]
    async fn test_dispatcher_retries_until_ready() {
        let dispatcher = Dispatcher::new(Box::new(AsyncQueue::fifo()), Duration::from_millis(1));
        let attempts = Arc::new(AtomicUsize::new(0));
        let other_key = Arc::new(AtomicUsize::new(0));

        let tries = attempts.clone();
        let other = other_key.clone();
        dispatcher.register(Tag::GetRequest, move |msg| {
            if msg.key == vec![1] {
                // Ready on the third attempt.
                Ok(tries.fetch_add(1, Ordering::SeqCst) >= 2)
            } else {
                other.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }
        });
        dispatcher.clone().start().await;

        dispatcher.submit(request(Tag::GetRequest, 1, 0)).unwrap();
        dispatcher.submit(request(Tag::GetRequest, 2, 0)).unwrap();

        eventually(|| attempts.load(Ordering::SeqCst) == 3).await;
        eventually(|| dispatcher.queue().is_empty()).await;
        assert_eq!(other_key.load(Ordering::SeqCst), 1, "Other keys keep progressing");
        dispatcher.stop();
    }

    #[tokio::test]
    async fn test_dispatcher_table_data_lane_keeps_order() {
        let dispatcher = Dispatcher::new(Box::new(SyncQueue::new(1)), Duration::from_millis(1));
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in [Tag::DataPutRequest, Tag::DataPutRequestFinish] {
            let log = seen.clone();
            dispatcher.register(tag, move |msg| {
                log.lock().unwrap().push((msg.tag, msg.value[0]));
                Ok(true)
            });
        }
        dispatcher.clone().start().await;

        for marker in 0..3 {
            dispatcher.submit(request(Tag::DataPutRequest, marker, marker)).unwrap();
        }
        dispatcher.submit(request(Tag::DataPutRequestFinish, 0, 9)).unwrap();

        eventually(|| seen.lock().unwrap().len() == 4).await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (Tag::DataPutRequest, 0),
                (Tag::DataPutRequest, 1),
                (Tag::DataPutRequest, 2),
                (Tag::DataPutRequestFinish, 9),
            ],
            "The end marker must follow every block"
        );
        assert!(dispatcher.queue().is_empty(), "Table data bypasses the consistency queue");
        dispatcher.stop();
    }

    #[tokio::test]
    async fn test_invoke_without_handler_fails() {
        let dispatcher = Dispatcher::new(Box::new(AsyncQueue::fifo()), Duration::from_millis(1));

        let result = dispatcher.invoke(&request(Tag::UpdateRequest, 1, 1));

        assert!(matches!(result, Err(Error::UnknownHandler(Tag::UpdateRequest))));
        assert!(!dispatcher.has_handler(Tag::UpdateRequest));
    }
}
