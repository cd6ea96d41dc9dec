//! Per-channel transmit queue.
//!
//! Producers on any thread push shared [`OutgoingMessage`]s; the channel
//! task drains the whole queue on each wake-up. Only the first push into
//! an idle queue schedules a wake-up, later pushes ride along with it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::packet::OutgoingMessage;

#[derive(Debug, Default)]
struct Inner {
    queue: VecDeque<Arc<OutgoingMessage>>,
    blocked: bool,
    wakeup_pending: bool,
}

/// Mutex-guarded FIFO with a blocked flag and a coalesced wake-up.
#[derive(Debug, Default)]
pub struct TransmitQueue {
    inner: Mutex<Inner>,
    wakeup: Notify,
    wakeups: AtomicU64,
}

impl TransmitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `msg`. Returns `false` if the queue is blocked.
    pub fn push(&self, msg: Arc<OutgoingMessage>) -> bool {
        let schedule = {
            let mut inner = self.inner.lock();
            if inner.blocked {
                tracing::warn!(msg_type = msg.msg_type(), "transmit queue blocked, dropping message");
                return false;
            }
            inner.queue.push_back(msg);
            !std::mem::replace(&mut inner.wakeup_pending, true)
        };
        if schedule {
            self.wakeups.fetch_add(1, Ordering::Relaxed);
            self.wakeup.notify_one();
        }
        true
    }

    /// Remove every queued message, oldest first, and re-arm the wake-up.
    pub fn take_all(&self) -> Vec<Arc<OutgoingMessage>> {
        let mut inner = self.inner.lock();
        inner.wakeup_pending = false;
        inner.queue.drain(..).collect()
    }

    /// Resolves once a wake-up was scheduled.
    pub async fn notified(&self) {
        self.wakeup.notified().await
    }

    /// Reject further pushes (teardown).
    pub fn block(&self) {
        self.inner.lock().blocked = true;
    }

    pub fn unblock(&self) {
        self.inner.lock().blocked = false;
    }

    pub fn is_blocked(&self) -> bool {
        self.inner.lock().blocked
    }

    /// Drop everything queued.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.queue.clear();
        inner.wakeup_pending = false;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of wake-ups scheduled since creation.
    pub fn scheduled_wakeups(&self) -> u64 {
        self.wakeups.load(Ordering::Relaxed)
    }

    /// Exchange the queued messages and blocked flags of two queues.
    ///
    /// Locks are taken in address order so concurrent swaps cannot
    /// deadlock. Both queues get a fresh wake-up if they hold messages.
    pub fn swap_contents(a: &TransmitQueue, b: &TransmitQueue) {
        if std::ptr::eq(a, b) {
            return;
        }
        let (first, second) = if (a as *const Self) < (b as *const Self) {
            (a, b)
        } else {
            (b, a)
        };
        {
            let mut x = first.inner.lock();
            let mut y = second.inner.lock();
            std::mem::swap(&mut x.queue, &mut y.queue);
            std::mem::swap(&mut x.blocked, &mut y.blocked);
            x.wakeup_pending = false;
            y.wakeup_pending = false;
        }
        for q in [a, b] {
            if !q.is_empty() {
                q.wakeup.notify_one();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ChannelType, client};
    use std::time::Duration;

    fn msg(msg_type: u16) -> Arc<OutgoingMessage> {
        OutgoingMessage::new(ChannelType::Display, msg_type).into_shared()
    }

    #[test]
    fn fifo_with_single_wakeup() {
        let q = Arc::new(TransmitQueue::new());
        let handles: Vec<_> = [client::ACK, client::PONG, client::ACK_SYNC]
            .into_iter()
            .map(|ty| {
                let q = Arc::clone(&q);
                std::thread::spawn(move || q.push(msg(ty)))
            })
            .collect();
        // Threads race each other, so only the coalescing is order-free.
        for h in handles {
            assert!(h.join().unwrap());
        }
        assert_eq!(q.scheduled_wakeups(), 1);
        assert_eq!(q.take_all().len(), 3);

        q.push(msg(client::ACK));
        q.push(msg(client::PONG));
        q.push(msg(client::ACK_SYNC));
        assert_eq!(q.scheduled_wakeups(), 2);
        let order: Vec<u16> = q.take_all().iter().map(|m| m.msg_type()).collect();
        assert_eq!(order, vec![client::ACK, client::PONG, client::ACK_SYNC]);
    }

    #[test]
    fn blocked_queue_rejects() {
        let q = TransmitQueue::new();
        q.block();
        assert!(!q.push(msg(client::ACK)));
        assert!(q.is_empty());
        assert_eq!(q.scheduled_wakeups(), 0);
        q.unblock();
        assert!(q.push(msg(client::ACK)));
    }

    #[tokio::test]
    async fn notified_after_push() {
        let q = Arc::new(TransmitQueue::new());
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.notified().await })
        };
        tokio::task::yield_now().await;
        q.push(msg(client::PONG));
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("timeout")
            .unwrap();
    }

    #[test]
    fn swap_exchanges_messages() {
        let a = TransmitQueue::new();
        let b = TransmitQueue::new();
        a.push(msg(client::ACK));
        b.block();
        TransmitQueue::swap_contents(&a, &b);
        assert!(a.is_empty());
        assert!(a.is_blocked());
        assert_eq!(b.len(), 1);
        assert!(!b.is_blocked());
        // The swapped-in queue was re-armed.
        b.take_all();
        b.push(msg(client::PONG));
        assert_eq!(b.len(), 1);
    }
}
