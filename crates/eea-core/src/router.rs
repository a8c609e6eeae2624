//! Queues connecting the producer threads, the guest host thread and the
//! connectivity thread.
//!
//! Each queue has exactly one consumer. Producers only ever push; nobody
//! iterates a queue in place, and the lock is held only for a single push or
//! pop so a consumer never blocks producers while it works on an item.

use crate::types::{InboundEvent, OutboundPublish};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// A mutex-guarded FIFO queue
#[derive(Debug)]
pub struct EventQueue<T> {
    items: Mutex<VecDeque<T>>,
}

impl<T> Default for EventQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, item: T) {
        self.items.lock().push_back(item);
    }

    /// Return an item the consumer could not finish to the head of the queue.
    pub fn push_front(&self, item: T) {
        self.items.lock().push_front(item);
    }

    pub fn pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

/// Handle to the agent's inbound and outbound queues
#[derive(Debug, Clone, Default)]
pub struct Router {
    inbound: Arc<EventQueue<InboundEvent>>,
    outbound: Arc<EventQueue<OutboundPublish>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events for the guest host thread
    pub fn inbound(&self) -> &Arc<EventQueue<InboundEvent>> {
        &self.inbound
    }

    /// Publish requests for the connectivity thread
    pub fn outbound(&self) -> &Arc<EventQueue<OutboundPublish>> {
        &self.outbound
    }

    pub fn notify(&self, event: InboundEvent) {
        tracing::trace!(kind = event.kind(), "Inbound event queued");
        self.inbound.push(event);
    }

    pub fn publish(&self, message: OutboundPublish) {
        tracing::trace!(topic = %message.topic, "Outbound publish queued");
        self.outbound.push(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QoS;
    use std::thread;

    #[test]
    fn test_fifo_and_push_front() {
        let queue = EventQueue::new();
        queue.push(1);
        queue.push(2);
        queue.push(3);

        let first = queue.pop().unwrap();
        queue.push_front(first);

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
        assert!(queue.is_empty());
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_concurrent_producers_keep_their_order() {
        let router = Router::new();
        let producers: Vec<_> = (0..4)
            .map(|producer| {
                let router = router.clone();
                thread::spawn(move || {
                    for seq in 0..250 {
                        router.notify(InboundEvent::GuestMessage {
                            topic: format!("p{}", producer),
                            payload: seq.to_string().into_bytes(),
                        });
                    }
                })
            })
            .collect();
        for handle in producers {
            handle.join().unwrap();
        }

        let mut next_seq = [0u32; 4];
        let mut total = 0;
        while let Some(event) = router.inbound().pop() {
            let InboundEvent::GuestMessage { topic, payload } = event else {
                panic!("unexpected event");
            };
            let producer: usize = topic[1..].parse().unwrap();
            let seq: u32 = String::from_utf8(payload).unwrap().parse().unwrap();
            assert_eq!(seq, next_seq[producer]);
            next_seq[producer] += 1;
            total += 1;
        }
        assert_eq!(total, 1000);
    }

    #[test]
    fn test_outbound_preserves_enqueue_order() {
        let router = Router::new();
        for i in 0..3 {
            router.publish(OutboundPublish::new(format!("t/{}", i), "{}", QoS::AtLeastOnce));
        }
        let topics: Vec<_> = std::iter::from_fn(|| router.outbound().pop())
            .map(|m| m.topic)
            .collect();
        assert_eq!(topics, vec!["t/0", "t/1", "t/2"]);
    }
}
