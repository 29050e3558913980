// Wait objects and the cross-domain message queue. These are the only
// pieces of a domain touched by foreign threads; everything else is
// single-threaded by construction.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// A pulse-style event. Waiters block until another thread pulses; a pulse
/// with no waiter is remembered (latched) so a late waiter does not hang.
/// Auto-reset by default; sticky wait objects stay signaled once pulsed
/// (domain readiness, domain termination).
#[derive(Default)]
pub struct WaitObject {
    state: Mutex<bool>,
    cond: Condvar,
    sticky: bool,
}

impl WaitObject {
    pub fn new() -> Arc<WaitObject> {
        Arc::new(WaitObject::default())
    }

    pub fn new_sticky() -> Arc<WaitObject> {
        Arc::new(WaitObject {
            sticky: true,
            ..WaitObject::default()
        })
    }

    pub fn pulse(&self) {
        let mut signaled = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *signaled = true;
        self.cond.notify_all();
    }

    /// Waits up to `timeout`; `None` waits forever. Returns false on
    /// timeout. Consumes the latched pulse.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut signaled = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let deadline = timeout.map(|t| Instant::now() + t);
        while !*signaled {
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (guard, result) = self
                        .cond
                        .wait_timeout(signaled, deadline - now)
                        .unwrap_or_else(|e| e.into_inner());
                    signaled = guard;
                    if result.timed_out() && !*signaled {
                        return false;
                    }
                }
                None => {
                    signaled = self.cond.wait(signaled).unwrap_or_else(|e| e.into_inner());
                }
            }
        }
        if !self.sticky {
            *signaled = false;
        }
        true
    }
}

/// FIFO queue of domain messages, protected by a mutex and a wait object.
/// Messages from one source are delivered in send order; multiple sources
/// interleave by arrival.
pub struct MessageQueue<T> {
    items: Mutex<VecDeque<T>>,
    cond: Condvar,
}

impl<T> MessageQueue<T> {
    pub fn new() -> Arc<MessageQueue<T>> {
        Arc::new(MessageQueue {
            items: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
        })
    }

    pub fn enqueue(&self, item: T) {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        items.push_back(item);
        self.cond.notify_one();
    }

    /// Removes and returns the head, waiting up to `timeout` for one to
    /// arrive. `None` when the queue stayed empty.
    pub fn poll(&self, timeout: Duration) -> Option<T> {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(item) = items.pop_front() {
                return Some(item);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(items, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            items = guard;
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_latched_pulse() {
        let w = WaitObject::new();
        w.pulse();
        assert!(w.wait(Some(Duration::from_millis(1))));
        // Consumed: the next wait times out.
        assert!(!w.wait(Some(Duration::from_millis(1))));
    }

    #[test]
    fn test_cross_thread_pulse() {
        let w = WaitObject::new();
        let w2 = Arc::clone(&w);
        let t = thread::spawn(move || w2.pulse());
        assert!(w.wait(Some(Duration::from_secs(5))));
        t.join().unwrap();
    }

    #[test]
    fn test_queue_is_fifo() {
        let q: Arc<MessageQueue<i32>> = MessageQueue::new();
        q.enqueue(1);
        q.enqueue(2);
        q.enqueue(3);
        assert_eq!(q.poll(Duration::from_millis(1)), Some(1));
        assert_eq!(q.poll(Duration::from_millis(1)), Some(2));
        assert_eq!(q.poll(Duration::from_millis(1)), Some(3));
        assert_eq!(q.poll(Duration::from_millis(1)), None);
    }
}
