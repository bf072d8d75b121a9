use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing;

use crate::types::{Notification, Priority};

/// In-process holding area for notifications that are ready to be sent.
///
/// One FIFO lane per priority. Nothing here is durable: after a restart the
/// outbox relay and the scheduled release poller rebuild the backlog from
/// storage.
#[derive(Debug, Default)]
pub struct DispatchQueue {
    lanes: Mutex<[VecDeque<Notification>; 4]>,
    available: Notify,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub critical: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
    pub total: usize,
}

fn lane(priority: Priority) -> usize {
    match priority {
        Priority::Critical => 0,
        Priority::High => 1,
        Priority::Normal => 2,
        Priority::Low => 3,
    }
}

impl DispatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lanes(&self) -> MutexGuard<'_, [VecDeque<Notification>; 4]> {
        self.lanes.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Never blocks on capacity and never fails.
    pub fn enqueue(&self, notification: Notification) {
        let id = notification.id;
        let priority = notification.priority;
        self.lanes()[lane(priority)].push_back(notification);
        self.available.notify_one();
        tracing::debug!("Enqueued notification {} ({})", id, priority);
    }

    pub fn dequeue(&self, priority: Priority) -> Option<Notification> {
        self.lanes()[lane(priority)].pop_front()
    }

    /// Takes the oldest item of the highest non-empty priority class.
    pub fn dequeue_next(&self) -> Option<Notification> {
        let mut lanes = self.lanes();
        Priority::DESCENDING
            .iter()
            .find_map(|priority| lanes[lane(*priority)].pop_front())
    }

    /// Waits until an item is available and takes it.
    pub async fn next(&self) -> Notification {
        loop {
            if let Some(notification) = self.dequeue_next() {
                return notification;
            }
            self.available.notified().await;
        }
    }

    pub fn depth(&self) -> usize {
        self.lanes().iter().map(VecDeque::len).sum()
    }

    pub fn depth_of(&self, priority: Priority) -> usize {
        self.lanes()[lane(priority)].len()
    }

    pub fn snapshot(&self) -> QueueDepth {
        let lanes = self.lanes();
        let depth = QueueDepth {
            critical: lanes[lane(Priority::Critical)].len(),
            high: lanes[lane(Priority::High)].len(),
            normal: lanes[lane(Priority::Normal)].len(),
            low: lanes[lane(Priority::Low)].len(),
            total: 0,
        };
        QueueDepth {
            total: depth.critical + depth.high + depth.normal + depth.low,
            ..depth
        }
    }
}
