// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Bounded multi-producer/single-consumer event queue.
//!
//! This is the handoff point between the interrupt-context producers and
//! the worker-context consumers: the top half pushes (never blocking,
//! failing loudly on overflow) and a worker thread pops (blocking until an
//! event arrives). Dropping events silently is not an option — a missed
//! endpoint lifecycle event leaves the port wedged — so `push` surfaces
//! overflow as an error for the producer to log.

use parking_lot::Condvar;
use parking_lot::Mutex;
use std::collections::VecDeque;
use thiserror::Error;

/// An error pushing to an [`EventQueue`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    /// The queue is full; the event was not enqueued.
    #[error("event queue overflow (capacity {0})")]
    Overflow(usize),
}

/// A bounded FIFO of events.
pub struct EventQueue<T> {
    events: Mutex<VecDeque<T>>,
    ready: Condvar,
    capacity: usize,
}

impl<T> EventQueue<T> {
    /// Creates a queue holding at most `capacity` undelivered events.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            ready: Condvar::new(),
            capacity,
        }
    }

    /// Enqueues an event without blocking.
    pub fn push(&self, event: T) -> Result<(), QueueError> {
        let mut events = self.events.lock();
        if events.len() >= self.capacity {
            return Err(QueueError::Overflow(self.capacity));
        }
        events.push_back(event);
        drop(events);
        self.ready.notify_one();
        Ok(())
    }

    /// Dequeues the oldest event, blocking until one is available.
    pub fn pop(&self) -> T {
        let mut events = self.events.lock();
        loop {
            if let Some(event) = events.pop_front() {
                return event;
            }
            self.ready.wait(&mut events);
        }
    }

    /// Number of undelivered events.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn fifo_order() {
        let queue = EventQueue::new(4);
        queue.push(1u32).unwrap();
        queue.push(2).unwrap();
        queue.push(3).unwrap();
        assert_eq!(queue.pop(), 1);
        assert_eq!(queue.pop(), 2);
        assert_eq!(queue.pop(), 3);
    }

    #[test]
    fn overflow_is_an_error_not_data_loss() {
        let queue = EventQueue::new(2);
        queue.push(1u32).unwrap();
        queue.push(2).unwrap();
        assert_eq!(queue.push(3), Err(QueueError::Overflow(2)));
        // The original contents are intact.
        assert_eq!(queue.pop(), 1);
        assert_eq!(queue.pop(), 2);
    }

    #[test]
    fn pop_blocks_until_an_event_arrives() {
        let queue = Arc::new(EventQueue::new(4));
        let consumer = {
            let queue = queue.clone();
            std::thread::spawn(move || queue.pop())
        };
        // Give the consumer a chance to block first.
        std::thread::sleep(std::time::Duration::from_millis(10));
        queue.push(7u32).unwrap();
        assert_eq!(consumer.join().unwrap(), 7);
    }

    #[test]
    fn multiple_producers_single_consumer() {
        let queue = Arc::new(EventQueue::new(64));
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let queue = queue.clone();
                std::thread::spawn(move || {
                    for i in 0..8 {
                        queue.push(p * 8 + i).unwrap();
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }
        let mut seen: Vec<u32> = (0..32).map(|_| queue.pop()).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..32).collect::<Vec<_>>());
    }
}
