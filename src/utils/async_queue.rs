use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

/// Bounded multi-producer queue with at-least-once consumption.
///
/// A consumer takes a pop guard, reads the front item and only removes it
/// by committing the guard; dropping the guard without committing leaves
/// the item in place for redelivery.
#[derive(Clone)]
pub struct AsyncQueue<T> {
    inner: Arc<AsyncQueueInner<T>>,
}

struct AsyncQueueInner<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    push_notify: Notify,
    pop_notify: Notify,
    pop_guard_exists: AtomicBool,
}

/// Returned by `try_push` when the queue is at capacity. The boundary maps
/// this to `rate_limited`.
#[derive(Debug, PartialEq, Eq)]
pub struct QueueFull;

impl<T> AsyncQueue<T> {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        AsyncQueue {
            inner: Arc::new(AsyncQueueInner {
                capacity,
                items: Mutex::new(VecDeque::with_capacity(capacity)),
                push_notify: Notify::new(),
                pop_notify: Notify::new(),
                pop_guard_exists: AtomicBool::new(false),
            }),
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.items.lock().await.is_empty()
    }

    /// Pushes an item, blocking while the queue is full.
    pub async fn push(&self, item: T) {
        loop {
            let mut items = self.inner.items.lock().await;

            if items.len() < self.inner.capacity {
                items.push_back(item);
                self.inner.push_notify.notify_one();
                return;
            }

            drop(items);

            self.inner.pop_notify.notified().await;
        }
    }

    /// Pushes an item if there is room, otherwise fails immediately.
    pub async fn try_push(&self, item: T) -> Result<(), QueueFull> {
        let mut items = self.inner.items.lock().await;

        if items.len() >= self.inner.capacity {
            return Err(QueueFull);
        }

        items.push_back(item);
        self.inner.push_notify.notify_one();
        Ok(())
    }

    /// Waits for an item and returns a guard over the queue front.
    ///
    /// Only one pop guard exists at a time; a second call blocks until the
    /// first guard is committed or dropped.
    pub async fn pop(&self) -> AsyncPopGuard<'_, T> {
        loop {
            let no_other_guards_exist = !self.inner.pop_guard_exists.load(Ordering::SeqCst);
            let queue_is_not_empty = self.inner.items.lock().await.front().is_some();

            if no_other_guards_exist && queue_is_not_empty {
                self.inner.pop_guard_exists.store(true, Ordering::SeqCst);

                return AsyncPopGuard { queue: self };
            }

            tokio::select! {
                _ = self.inner.push_notify.notified() => {}
                _ = self.inner.pop_notify.notified() => {}
            }
        }
    }
}

pub struct AsyncPopGuard<'a, T> {
    queue: &'a AsyncQueue<T>,
}

impl<'a, T> AsyncPopGuard<'a, T>
where
    T: Clone,
{
    pub async fn read(&self) -> T {
        let items = self.queue.inner.items.lock().await;
        items.front().unwrap().clone()
    }

    pub async fn commit(self) {
        let mut items = self.queue.inner.items.lock().await;
        self.queue.inner.pop_notify.notify_one();
        items.pop_front();
    }
}

impl<'a, T> Drop for AsyncPopGuard<'a, T> {
    fn drop(&mut self) {
        self.queue
            .inner
            .pop_guard_exists
            .store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::{timeout, Duration};

    use super::*;

    #[tokio::test]
    async fn pop_on_empty_queue_blocks() {
        let queue: AsyncQueue<i32> = AsyncQueue::new(2);

        let pop_guard = timeout(Duration::from_secs_f32(0.5), queue.pop()).await;

        assert!(pop_guard.is_err(), "Pop on empty queue should timeout");
    }

    #[tokio::test]
    async fn read_and_commit_single_item() {
        let queue: AsyncQueue<i32> = AsyncQueue::new(2);

        queue.push(1).await;

        let pop_guard = queue.pop().await;

        queue.push(2).await;

        assert_eq!(pop_guard.read().await, 1);

        pop_guard.commit().await;

        let pop_guard = queue.pop().await;

        assert_eq!(pop_guard.read().await, 2);
    }

    #[tokio::test]
    async fn drop_without_commit_does_not_remove_item() {
        let queue: AsyncQueue<i32> = AsyncQueue::new(2);

        queue.push(1).await;

        let pop_guard = queue.pop().await;

        assert_eq!(pop_guard.read().await, 1);

        drop(pop_guard);

        let pop_guard = queue.pop().await;
        assert_eq!(pop_guard.read().await, 1);
    }

    #[tokio::test]
    async fn only_a_single_pop_guard_can_exist() {
        let queue: AsyncQueue<i32> = AsyncQueue::new(2);

        queue.push(1).await;

        let first_guard = queue.pop().await;
        assert_eq!(first_guard.read().await, 1);

        let second_guard = timeout(Duration::from_secs_f32(0.5), queue.pop()).await;

        assert!(second_guard.is_err(), "Second pop should block");

        drop(first_guard);

        let pop_guard = queue.pop().await;
        assert_eq!(pop_guard.read().await, 1);
    }

    #[tokio::test]
    async fn try_push_fails_when_full() {
        let queue: AsyncQueue<i32> = AsyncQueue::new(2);

        assert_eq!(queue.try_push(1).await, Ok(()));
        assert_eq!(queue.try_push(2).await, Ok(()));
        assert_eq!(queue.try_push(3).await, Err(QueueFull));

        queue.pop().await.commit().await;

        assert_eq!(queue.try_push(3).await, Ok(()));
        assert_eq!(queue.len().await, 2);
    }

    #[tokio::test]
    async fn queue_is_fifo() {
        let queue: AsyncQueue<i32> = AsyncQueue::new(2);

        queue.push(1).await;
        queue.push(2).await;

        let pop_guard = queue.pop().await;
        assert_eq!(pop_guard.read().await, 1);
        pop_guard.commit().await;

        let pop_guard = queue.pop().await;
        assert_eq!(pop_guard.read().await, 2);
    }
}
