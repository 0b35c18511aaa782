// Copyright 2024 The dedupv1d Authors.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A one-shot, many-waiter cancellation signal.
//!
//! The kernel SCSI bridge interface is observed only (§6), so `Event` does
//! not wrap a real file descriptor the way crosvm's `base::Event` wraps an
//! `eventfd`. It plays the same role in this codebase: `WorkerThread` hands
//! one to its closure as the cooperative-cancellation token a worker polls
//! for alongside its blocking work (§5, "Workers exit at the next state
//! check").

use std::sync::Arc;
use std::time::Duration;

use sync::Condvar;
use sync::Mutex;

#[derive(Clone)]
pub struct Event {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl Event {
    pub fn new() -> Self {
        Event {
            inner: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    /// Signals the event. Idempotent.
    pub fn signal(&self) {
        let (lock, cvar) = &*self.inner;
        let mut fired = lock.lock();
        *fired = true;
        cvar.notify_all();
    }

    /// True once `signal` has been called.
    pub fn is_signaled(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Blocks until signaled or the timeout elapses, returning whether the
    /// event had fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let mut fired = lock.lock();
        if !*fired {
            cvar.wait_for(&mut fired, timeout);
        }
        *fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_wakes_waiter() {
        let ev = Event::new();
        let waiter = ev.clone();
        let handle = std::thread::spawn(move || waiter.wait_timeout(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(20));
        ev.signal();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn timeout_without_signal() {
        let ev = Event::new();
        assert!(!ev.wait_timeout(Duration::from_millis(20)));
    }
}
