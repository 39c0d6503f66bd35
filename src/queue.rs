//! The waitable-queue dequeue algorithm (§4.4, §9 "typed waitable
//! queue abstraction").
//!
//! This type only implements the FIFO-with-partial-dequeue mechanics;
//! the actual waiting happens on the connection's shared data-ready
//! condvar (§3: "they share one mutex and one condition variable per
//! connection"), so a bare `ByteQueue` is not itself lockable — it is
//! always found behind a connection's `data-ready` mutex.

use std::collections::VecDeque;

#[derive(Debug, Default)]
pub(crate) struct ByteQueue {
    items: VecDeque<Vec<u8>>,
}

impl ByteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Empty payloads are legal; an empty app-send payload signals EOF
    /// (§4.4).
    pub fn enqueue(&mut self, payload: Vec<u8>) {
        self.items.push_back(payload);
    }

    /// Removes bytes from the head of the queue, per §4.4:
    ///
    /// - if the head is empty, or its length is `<= max_len`, or
    ///   `partial` is false: the whole head is removed and copied
    ///   (truncated to `max_len` if the destination is smaller);
    /// - otherwise (head longer than `max_len` and `partial` is true):
    ///   `max_len` bytes are copied out and the remainder slides to
    ///   the front of the head buffer, which stays queued.
    ///
    /// Returns `None` if the queue is empty (caller re-waits on the
    /// condvar); otherwise `Some(bytes_copied)`.
    pub fn dequeue(&mut self, dst: &mut [u8], partial: bool) -> Option<usize> {
        let head = self.items.front_mut()?;
        let max_len = dst.len();

        if head.len() <= max_len || !partial {
            let head = self.items.pop_front().unwrap();
            let copy_len = head.len().min(max_len);
            dst[..copy_len].copy_from_slice(&head[..copy_len]);
            Some(head.len())
        } else {
            dst.copy_from_slice(&head[..max_len]);
            head.drain(..max_len);
            Some(max_len)
        }
    }
}
