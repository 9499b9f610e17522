use std::time::Duration;

use tokio::time::Instant;

/// Collects items into groups of up to `capacity`, or whatever arrived
/// within `delay` of the first item of a group.
///
/// The owner drives it from a `select!` loop: `push` hands back a full
/// group, and [`Batcher::deadline`] says when a partial one is due.
#[derive(Debug)]
pub struct Batcher<T> {
    capacity: usize,
    delay: Duration,
    items: Vec<T>,
    deadline: Option<Instant>,
}

impl<T> Batcher<T> {
    pub fn new(capacity: usize, delay: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            delay,
            items: Vec::new(),
            deadline: None,
        }
    }

    /// Queue an item. Returns a full group as soon as one is ready.
    pub fn push(&mut self, item: T) -> Option<Vec<T>> {
        if self.items.is_empty() {
            self.deadline = Some(Instant::now() + self.delay);
        }
        self.items.push(item);
        if self.items.len() >= self.capacity {
            Some(self.take())
        } else {
            None
        }
    }

    /// When the queued partial group should be flushed.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_due(&self) -> bool {
        self.deadline.is_some_and(|d| d <= Instant::now())
    }

    /// Everything queued, oldest first.
    pub fn take(&mut self) -> Vec<T> {
        self.deadline = None;
        std::mem::take(&mut self.items)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Sleep until `deadline`, or forever without one.
pub async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
