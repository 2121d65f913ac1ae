//! In-memory FIFO of pending notifications and the record of finished ones.
//!
//! Nothing here is persisted: queued notifications are lost when the
//! process exits.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::events::{Notification, NotificationId, NotificationStatus};

/// FIFO of pending notifications. Priority does not reorder it.
#[derive(Debug, Default)]
pub struct NotificationQueue {
    inner: Mutex<VecDeque<Notification>>,
}

impl NotificationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the tail.
    pub fn push(&self, notification: Notification) {
        self.inner.lock().push_back(notification);
    }

    /// Take the head.
    pub fn pop(&self) -> Option<Notification> {
        self.inner.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn get(&self, id: NotificationId) -> Option<Notification> {
        self.inner.lock().iter().find(|n| n.id == id).cloned()
    }
}

/// Bounded record of notifications that reached a terminal state.
///
/// Totals keep counting after old entries are evicted.
#[derive(Debug)]
pub struct DeliveryHistory {
    capacity: usize,
    entries: Mutex<VecDeque<Notification>>,
    sent_total: AtomicU64,
    failed_total: AtomicU64,
}

impl DeliveryHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::new()),
            sent_total: AtomicU64::new(0),
            failed_total: AtomicU64::new(0),
        }
    }

    /// Record a finished notification. Pending ones are ignored.
    pub fn record(&self, notification: Notification) {
        match notification.status {
            NotificationStatus::Sent => self.sent_total.fetch_add(1, Ordering::Relaxed),
            NotificationStatus::Failed => self.failed_total.fetch_add(1, Ordering::Relaxed),
            NotificationStatus::Pending => return,
        };

        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.lock();
        entries.push_back(notification);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    pub fn get(&self, id: NotificationId) -> Option<Notification> {
        self.entries.lock().iter().rev().find(|n| n.id == id).cloned()
    }

    /// Retained entries, oldest first.
    pub fn entries(&self) -> Vec<Notification> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn sent_total(&self) -> u64 {
        self.sent_total.load(Ordering::Relaxed)
    }

    pub fn failed_total(&self) -> u64 {
        self.failed_total.load(Ordering::Relaxed)
    }
}
