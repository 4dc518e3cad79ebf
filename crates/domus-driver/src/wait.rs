use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::event::{EventSignal, WatcherContext};

// Sets the aggregate signal a wait is blocked on.
fn wake_aggregate(context: &WatcherContext) {
    if let Some(aggregate) = context.downcast_ref::<EventSignal>() {
        aggregate.set();
    }
}

/// Blocks until at least one of the given signals is set, or until the
/// timeout elapses.
///
/// A [`None`] timeout waits forever.
///
/// Returns the index of the first signaled input, so that the lowest index
/// always has priority over the others. The return value is [`None`] only
/// when the timeout has elapsed with no input signaled, or when the input
/// list is empty.
///
/// Whatever the outcome, no watcher is left registered on the inputs.
pub fn multiple(signals: &[&EventSignal], timeout: Option<Duration>) -> Option<usize> {
    if signals.is_empty() {
        return None;
    }

    let aggregate = Arc::new(EventSignal::new("MultiWait"));
    let context: WatcherContext = aggregate.clone();

    for signal in signals {
        signal.add_watcher(wake_aggregate, Arc::clone(&context));
    }

    let deadline = timeout.map(|timeout| Instant::now() + timeout);

    let index = loop {
        let remaining = deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));
        let woken = aggregate.wait(remaining);

        // The aggregate is cleared before scanning, so that an input set
        // during the scan wakes up the next wait.
        aggregate.clear();

        if let Some(index) = signals.iter().position(|signal| signal.is_set()) {
            break Some(index);
        }

        // An input may have been set and cleared again by another thread.
        if !woken || remaining.is_some_and(|remaining| remaining.is_zero()) {
            break None;
        }
    };

    for signal in signals {
        let _ = signal.remove_watcher(wake_aggregate, &context);
    }

    index
}

/// Blocks until the signal is set, or until the timeout elapses.
///
/// Returns whether the signal has been set in time.
#[inline]
pub fn single(signal: &EventSignal, timeout: Option<Duration>) -> bool {
    multiple(&[signal], timeout).is_some()
}
