use std::any::Any;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use tracing::debug;

/// The context handed to a [`Watcher`] callback.
///
/// Contexts are compared by identity, so two contexts are the same only
/// when they point to the same allocation.
pub type WatcherContext = Arc<dyn Any + Send + Sync>;

/// A [`Watcher`] callback.
pub type WatcherCallback = fn(&WatcherContext);

/// A callback registered on an [`EventSignal`], invoked every time the
/// signal is set.
///
/// Two watchers are equal when both their callbacks and their contexts are
/// the same, so a watcher can be removed by building it again from the
/// same pair.
#[derive(Clone)]
pub struct Watcher {
    callback: WatcherCallback,
    context: WatcherContext,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("callback", &(self.callback as *const ()))
            .field("context", &Arc::as_ptr(&self.context))
            .finish()
    }
}

impl PartialEq for Watcher {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::fn_addr_eq(self.callback, other.callback)
            && Arc::ptr_eq(&self.context, &other.context)
    }
}

impl Eq for Watcher {}

impl Watcher {
    /// Creates a [`Watcher`].
    #[must_use]
    #[inline]
    pub fn new(callback: WatcherCallback, context: WatcherContext) -> Self {
        Self { callback, context }
    }

    /// Invokes the callback with its context.
    #[inline]
    pub fn call(&self) {
        (self.callback)(&self.context);
    }
}

/// A binary signal.
///
/// Threads can block on the signal until it is set, and callbacks can be
/// registered to be notified each time it is set. Setting a signal which is
/// already set notifies waiters and watchers again.
///
/// The flag only changes under the signal's own lock, while watchers are
/// always invoked outside of it, so a watcher may set, clear, or register
/// other watchers on the very same signal.
pub struct EventSignal {
    name: Cow<'static, str>,
    flag: Mutex<bool>,
    condition: Condvar,
    watchers: Mutex<Vec<Watcher>>,
}

impl std::fmt::Debug for EventSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSignal")
            .field("name", &self.name)
            .field("set", &self.is_set())
            .finish_non_exhaustive()
    }
}

impl EventSignal {
    /// Creates an unsignaled [`EventSignal`] with a name used in logs.
    #[must_use]
    #[inline]
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            name: name.into(),
            flag: Mutex::new(false),
            condition: Condvar::new(),
            watchers: Mutex::new(Vec::new()),
        }
    }

    /// Returns the signal name.
    #[must_use]
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Checks whether the signal is set.
    #[must_use]
    #[inline]
    pub fn is_set(&self) -> bool {
        *self.flag.lock()
    }

    /// Sets the signal, wakes up all blocked waiters and then invokes all
    /// registered watchers.
    pub fn set(&self) {
        {
            let mut flag = self.flag.lock();
            *flag = true;
            let _ = self.condition.notify_all();
        }

        // Watchers run on a snapshot, outside of any lock.
        let watchers = self.watchers.lock().clone();
        for watcher in &watchers {
            watcher.call();
        }
    }

    /// Clears the signal without notifying anyone.
    pub fn clear(&self) {
        *self.flag.lock() = false;
    }

    /// Blocks until the signal is set or the timeout elapses.
    ///
    /// A [`None`] timeout waits forever.
    ///
    /// Returns whether the signal is set.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut flag = self.flag.lock();
        match timeout {
            None => {
                while !*flag {
                    self.condition.wait(&mut flag);
                }
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while !*flag {
                    if self.condition.wait_until(&mut flag, deadline).timed_out() {
                        break;
                    }
                }
            }
        }
        *flag
    }

    /// Registers a watcher.
    ///
    /// When the signal is already set, the callback is invoked immediately
    /// on the calling thread.
    pub fn add_watcher(&self, callback: WatcherCallback, context: WatcherContext) {
        let watcher = Watcher::new(callback, context);
        self.watchers.lock().push(watcher.clone());

        if self.is_set() {
            debug!(
                "Watcher added to the already signaled `{}`, calling it immediately",
                self.name
            );
            watcher.call();
        }
    }

    /// Removes the first watcher built from the same callback and context.
    ///
    /// Returns whether a watcher has been removed.
    pub fn remove_watcher(&self, callback: WatcherCallback, context: &WatcherContext) -> bool {
        let watcher = Watcher::new(callback, Arc::clone(context));
        let mut watchers = self.watchers.lock();
        if let Some(position) = watchers.iter().position(|w| *w == watcher) {
            let _ = watchers.remove(position);
            true
        } else {
            false
        }
    }

    #[cfg(test)]
    pub(crate) fn watchers_count(&self) -> usize {
        self.watchers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use super::{EventSignal, WatcherContext};

    fn count(context: &WatcherContext) {
        if let Some(counter) = context.downcast_ref::<AtomicUsize>() {
            let _ = counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn clear_itself(context: &WatcherContext) {
        if let Some(signal) = context.downcast_ref::<EventSignal>() {
            signal.clear();
        }
    }

    #[test]
    fn set_and_clear() {
        let signal = EventSignal::new("Test");
        assert!(!signal.is_set());

        signal.set();
        assert!(signal.is_set());
        assert!(signal.wait(Some(Duration::ZERO)));

        signal.clear();
        assert!(!signal.is_set());
        assert!(!signal.wait(Some(Duration::from_millis(10))));
    }

    #[test]
    fn wait_is_woken_by_another_thread() {
        let signal = Arc::new(EventSignal::new("Test"));

        let setter = {
            let signal = Arc::clone(&signal);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                signal.set();
            })
        };

        assert!(signal.wait(Some(Duration::from_secs(5))));
        setter.join().unwrap();
    }

    #[test]
    fn watchers_are_called_on_set() {
        let signal = EventSignal::new("Test");
        let counter: WatcherContext = Arc::new(AtomicUsize::new(0));

        signal.add_watcher(count, Arc::clone(&counter));
        signal.set();
        signal.set();

        let calls = counter.downcast_ref::<AtomicUsize>().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Clearing does not notify.
        signal.clear();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn watcher_added_to_set_signal_fires_immediately() {
        let signal = EventSignal::new("Test");
        signal.set();

        let counter: WatcherContext = Arc::new(AtomicUsize::new(0));
        signal.add_watcher(count, Arc::clone(&counter));

        let calls = counter.downcast_ref::<AtomicUsize>().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remove_watcher_by_identity() {
        let signal = EventSignal::new("Test");
        let first: WatcherContext = Arc::new(AtomicUsize::new(0));
        let second: WatcherContext = Arc::new(AtomicUsize::new(0));

        signal.add_watcher(count, Arc::clone(&first));
        signal.add_watcher(count, Arc::clone(&second));
        assert_eq!(signal.watchers_count(), 2);

        // A different context with the same content is another watcher.
        let stranger: WatcherContext = Arc::new(AtomicUsize::new(0));
        assert!(!signal.remove_watcher(count, &stranger));

        assert!(signal.remove_watcher(count, &first));
        assert!(!signal.remove_watcher(count, &first));
        assert_eq!(signal.watchers_count(), 1);

        signal.set();
        assert_eq!(
            first
                .downcast_ref::<AtomicUsize>()
                .unwrap()
                .load(Ordering::SeqCst),
            0
        );
        assert_eq!(
            second
                .downcast_ref::<AtomicUsize>()
                .unwrap()
                .load(Ordering::SeqCst),
            1
        );
    }

    #[test]
    fn watcher_may_reenter_its_signal() {
        let signal = Arc::new(EventSignal::new("Reentrant"));
        let context: WatcherContext = signal.clone();

        signal.add_watcher(clear_itself, Arc::clone(&context));
        signal.set();

        // The watcher has cleared the signal without deadlocking.
        assert!(!signal.is_set());
    }
}
