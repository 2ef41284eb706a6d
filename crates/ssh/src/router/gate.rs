//! Exclusive right to perform the next blocking read.
//!
//! Every thread waiting for a message competes for the gate. The winner
//! reads one packet, dispatches it and releases the gate; releasing bumps a
//! generation counter and wakes every waiter, which then re-checks its own
//! mailbox before competing again. There is no queue: whoever re-checks
//! first wins.

use crate::lock;
use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};
use std::time::Instant;

#[derive(Debug, Default)]
struct GateState {
    owner: Option<ThreadId>,
    generation: u64,
    abandoned: bool,
}

/// Grants at most one thread the right to read from the connection.
#[derive(Debug, Default)]
pub struct ThreadGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

/// Ownership of a [`ThreadGate`]; released on drop.
///
/// A guard dropped while its thread is panicking marks the gate
/// abandoned: the stream may be mid-packet and can no longer be read.
#[derive(Debug)]
pub struct GateGuard<'a> {
    gate: &'a ThreadGate,
}

impl ThreadGate {
    /// Creates an unowned gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes ownership if nobody holds the gate and it is not abandoned.
    pub fn try_acquire(&self) -> Option<GateGuard<'_>> {
        let mut state = lock(&self.state);
        if state.owner.is_some() || state.abandoned {
            return None;
        }
        state.owner = Some(thread::current().id());
        Some(GateGuard { gate: self })
    }

    /// Current generation. Capture it before checking a mailbox and pass it
    /// to [`ThreadGate::wait`] so that a release in between is not missed.
    pub fn generation(&self) -> u64 {
        lock(&self.state).generation
    }

    /// Blocks until the generation moves past `seen` or the gate is
    /// abandoned.
    ///
    /// Returns false if `deadline` passed first.
    pub fn wait(&self, seen: u64, deadline: Option<Instant>) -> bool {
        let mut state = lock(&self.state);
        loop {
            if state.generation != seen || state.abandoned {
                return true;
            }
            state = match deadline {
                None => self
                    .changed
                    .wait(state)
                    .unwrap_or_else(|e| e.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    self.changed
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0
                }
            };
        }
    }

    /// Wakes every waiter without changing ownership.
    pub fn notify(&self) {
        lock(&self.state).generation += 1;
        self.changed.notify_all();
    }

    /// Returns true once an owner has panicked while holding the gate.
    pub fn is_abandoned(&self) -> bool {
        lock(&self.state).abandoned
    }

    /// The thread currently holding the gate.
    pub fn owner(&self) -> Option<ThreadId> {
        lock(&self.state).owner
    }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        let mut state = lock(&self.gate.state);
        state.owner = None;
        state.generation += 1;
        if thread::panicking() {
            state.abandoned = true;
        }
        drop(state);
        self.gate.changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_single_owner() {
        let gate = ThreadGate::new();
        let guard = gate.try_acquire().unwrap();
        assert!(gate.try_acquire().is_none());
        assert_eq!(gate.owner(), Some(thread::current().id()));

        drop(guard);
        assert!(gate.owner().is_none());
        assert!(gate.try_acquire().is_some());
    }

    #[test]
    fn test_release_wakes_waiter() {
        let gate = Arc::new(ThreadGate::new());
        let guard_gate = Arc::clone(&gate);
        let seen = gate.generation();

        let owner = thread::spawn(move || {
            let _guard = guard_gate.try_acquire().unwrap();
            thread::sleep(Duration::from_millis(20));
        });

        assert!(gate.wait(seen, Some(Instant::now() + Duration::from_secs(5))));
        owner.join().unwrap();
    }

    #[test]
    fn test_wait_times_out() {
        let gate = ThreadGate::new();
        let seen = gate.generation();
        let start = Instant::now();
        assert!(!gate.wait(seen, Some(start + Duration::from_millis(30))));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_missed_release_not_lost() {
        let gate = ThreadGate::new();
        let seen = gate.generation();
        drop(gate.try_acquire());
        // Released between the check and the wait: returns at once
        assert!(gate.wait(seen, None));
    }

    #[test]
    fn test_panicking_owner_abandons() {
        let gate = Arc::new(ThreadGate::new());
        let owner_gate = Arc::clone(&gate);
        let result = thread::spawn(move || {
            let _guard = owner_gate.try_acquire().unwrap();
            panic!("handler failed");
        })
        .join();

        assert!(result.is_err());
        assert!(gate.is_abandoned());
        assert!(gate.try_acquire().is_none());
        assert!(gate.wait(gate.generation(), None));
    }

    #[test]
    fn test_exclusive_under_contention() {
        let gate = Arc::new(ThreadGate::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let entries = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let gate = Arc::clone(&gate);
                let inside = Arc::clone(&inside);
                let entries = Arc::clone(&entries);
                thread::spawn(move || {
                    let mut acquired = 0;
                    while acquired < 200 {
                        let seen = gate.generation();
                        match gate.try_acquire() {
                            Some(_guard) => {
                                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                                thread::yield_now();
                                inside.fetch_sub(1, Ordering::SeqCst);
                                entries.fetch_add(1, Ordering::SeqCst);
                                acquired += 1;
                            }
                            None => {
                                gate.wait(seen, Some(Instant::now() + Duration::from_millis(50)));
                            }
                        }
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(entries.load(Ordering::SeqCst), 8 * 200);
        assert!(!gate.is_abandoned());
    }
}
