//! Interpreter output messages.
//!
//! Produced by the interpreter thread, drained by the host, in production
//! order, through a lock-free queue: the interpreter must never block the
//! host and vice versa.

use std::sync::Arc;

use crossbeam::queue::SegQueue;

#[derive(Debug, Clone, PartialEq)]
pub enum OutputMessage {
    Print {
        message: String,
    },
    PlotCreate {
        title: String,
        x_label: String,
        y_label: String,
    },
    PlotDiscreteSeries {
        data: Vec<(f64, f64)>,
    },
}

/// Single-producer / single-consumer FIFO over a lock-free segment queue.
#[derive(Clone)]
pub struct MessageQueue {
    queue: Arc<SegQueue<OutputMessage>>,
}

impl MessageQueue {
    pub fn new() -> Self {
        MessageQueue {
            queue: Arc::new(SegQueue::new()),
        }
    }

    pub fn enqueue(&self, message: OutputMessage) {
        self.queue.push(message);
    }

    pub fn dequeue(&self) -> Option<OutputMessage> {
        self.queue.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drain everything currently queued, in production order.
    pub fn drain(&self) -> Vec<OutputMessage> {
        let mut messages = Vec::new();
        while let Some(message) = self.queue.pop() {
            messages.push(message);
        }
        messages
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_is_preserved() {
        let queue = MessageQueue::new();
        for i in 0..100 {
            queue.enqueue(OutputMessage::Print {
                message: i.to_string(),
            });
        }
        let drained = queue.drain();
        assert_eq!(drained.len(), 100);
        for (i, message) in drained.iter().enumerate() {
            assert_eq!(
                message,
                &OutputMessage::Print {
                    message: i.to_string()
                }
            );
        }
    }

    #[test]
    fn clones_share_the_queue() {
        let a = MessageQueue::new();
        let b = a.clone();
        a.enqueue(OutputMessage::Print {
            message: "hello".into(),
        });
        assert!(!b.is_empty());
        assert!(b.dequeue().is_some());
        assert!(a.is_empty());
    }

    #[test]
    fn cross_thread_order_is_preserved() {
        let queue = MessageQueue::new();
        let producer = queue.clone();
        let handle = std::thread::spawn(move || {
            for i in 0..1000 {
                producer.enqueue(OutputMessage::Print {
                    message: i.to_string(),
                });
            }
        });
        handle.join().unwrap();
        let drained = queue.drain();
        assert_eq!(drained.len(), 1000);
        assert_eq!(
            drained[999],
            OutputMessage::Print {
                message: "999".into()
            }
        );
    }
}
