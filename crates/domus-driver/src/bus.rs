use std::collections::VecDeque;
use std::sync::Arc;

use domus::notification::Notification;

use parking_lot::Mutex;

use tracing::debug;

use crate::event::{EventSignal, WatcherContext};

/// A subscriber callback.
///
/// It is invoked synchronously on the thread of the driver that produced
/// the notification, so it must not block.
pub type SubscriberCallback = fn(&Notification, &WatcherContext);

#[derive(Clone)]
struct Subscriber {
    callback: SubscriberCallback,
    context: WatcherContext,
}

impl Subscriber {
    fn is(&self, callback: SubscriberCallback, context: &WatcherContext) -> bool {
        std::ptr::fn_addr_eq(self.callback, callback) && Arc::ptr_eq(&self.context, context)
    }
}

/// Delivers notifications to all subscribers.
///
/// A subscriber is identified by its callback and context pair, and the
/// same pair can be subscribed only once. Subscribers are notified in
/// subscription order.
#[derive(Default)]
pub struct NotificationBus {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl std::fmt::Debug for NotificationBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationBus")
            .field("subscribers", &self.subscribers.lock().len())
            .finish()
    }
}

impl NotificationBus {
    /// Creates a [`NotificationBus`] without subscribers.
    #[must_use]
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subscriber.
    ///
    /// Returns `false` when the same pair is already subscribed.
    pub fn subscribe(&self, callback: SubscriberCallback, context: WatcherContext) -> bool {
        let mut subscribers = self.subscribers.lock();
        if subscribers.iter().any(|s| s.is(callback, &context)) {
            return false;
        }
        subscribers.push(Subscriber { callback, context });
        true
    }

    /// Removes a subscriber.
    ///
    /// Returns `false` when the pair was not subscribed.
    pub fn unsubscribe(&self, callback: SubscriberCallback, context: &WatcherContext) -> bool {
        let mut subscribers = self.subscribers.lock();
        if let Some(position) = subscribers.iter().position(|s| s.is(callback, context)) {
            let _ = subscribers.remove(position);
            true
        } else {
            false
        }
    }

    /// Delivers a notification to every subscriber.
    pub fn publish(&self, notification: &Notification) {
        let subscribers = self.subscribers.lock();
        for subscriber in subscribers.iter() {
            (subscriber.callback)(notification, &subscriber.context);
        }
    }

    /// Returns the number of subscribers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Checks whether there are no subscribers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribers.lock().is_empty()
    }
}

/// The notifications queued by a driver and not yet delivered.
///
/// The associated signal is set if and only if the buffer is not empty.
#[derive(Debug)]
pub struct NotificationBuffer {
    notifications: Mutex<VecDeque<Notification>>,
    signal: EventSignal,
}

impl Default for NotificationBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationBuffer {
    /// Creates an empty [`NotificationBuffer`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            notifications: Mutex::new(VecDeque::new()),
            signal: EventSignal::new("Notifications"),
        }
    }

    /// Queues a notification.
    pub fn push(&self, notification: Notification) {
        debug!("Queueing notification: {notification}");
        let mut notifications = self.notifications.lock();
        notifications.push_back(notification);
        self.signal.set();
    }

    /// Takes all queued notifications in FIFO order.
    pub fn take(&self) -> Vec<Notification> {
        let mut notifications = self.notifications.lock();
        self.signal.clear();
        notifications.drain(..).collect()
    }

    /// Delivers all queued notifications to the given bus.
    ///
    /// Returns the number of delivered notifications.
    pub fn drain_into(&self, bus: &NotificationBus) -> usize {
        let notifications = self.take();
        for notification in &notifications {
            bus.publish(notification);
        }
        notifications.len()
    }

    /// Discards all queued notifications.
    pub fn discard(&self) {
        let _ = self.take();
    }

    /// Returns the number of queued notifications.
    #[must_use]
    pub fn len(&self) -> usize {
        self.notifications.lock().len()
    }

    /// Checks whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.notifications.lock().is_empty()
    }

    /// Returns the signal set while the buffer is not empty.
    #[must_use]
    #[inline]
    pub const fn signal(&self) -> &EventSignal {
        &self.signal
    }
}
