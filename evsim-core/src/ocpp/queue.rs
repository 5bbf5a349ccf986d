//! Outbound frame queue
//!
//! Buffers fully serialized frames while the socket is unreachable. The
//! queue is unbounded, survives any number of reconnect attempts, and is
//! drained exactly once per reconnection: immediately after the socket
//! reports open, before any new frame is sent, so wire order matches send
//! order.

use std::collections::VecDeque;

/// FIFO of serialized frames awaiting a reachable socket
#[derive(Debug, Default)]
pub struct OutboundQueue {
    frames: VecDeque<String>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self {
            frames: VecDeque::new(),
        }
    }

    /// Append a frame to the back of the queue.
    pub fn enqueue(&mut self, frame: String) {
        self.frames.push_back(frame);
    }

    /// Return the whole queue contents in enqueue order and clear it.
    pub fn flush(&mut self) -> Vec<String> {
        self.frames.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_preserves_fifo_order() {
        let mut queue = OutboundQueue::new();
        queue.enqueue("first".to_string());
        queue.enqueue("second".to_string());
        queue.enqueue("third".to_string());

        assert_eq!(queue.flush(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_flush_clears_queue() {
        let mut queue = OutboundQueue::new();
        queue.enqueue("only".to_string());

        assert_eq!(queue.flush().len(), 1);
        assert!(queue.is_empty());
        assert!(queue.flush().is_empty());
    }

    #[test]
    fn test_enqueue_after_flush() {
        let mut queue = OutboundQueue::new();
        queue.enqueue("a".to_string());
        queue.flush();
        queue.enqueue("b".to_string());

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.flush(), vec!["b"]);
    }
}
