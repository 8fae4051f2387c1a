use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// FIFO write lock for a single table.
///
/// Waiters are served strictly in arrival order: on release, ownership is
/// handed directly to the oldest waiter, so the lock never appears free while
/// someone is queued. Not reentrant and has no timeout. Release happens when
/// the returned guard is dropped, including on early `?` returns.
#[derive(Debug, Default)]
pub struct TableLock {
    state: Mutex<LockState>,
    handoff: Condvar,
}

#[derive(Debug, Default)]
struct LockState {
    locked: bool,
    queue: VecDeque<u64>,
    granted: Option<u64>,
    next_ticket: u64,
}

/// Holds the table lock until dropped.
#[derive(Debug)]
#[must_use = "the table lock is released as soon as the guard is dropped"]
pub struct TableLockGuard<'a> {
    lock: &'a TableLock,
}

impl TableLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire the lock, blocking behind every earlier caller.
    pub fn lock(&self) -> TableLockGuard<'_> {
        let mut state = self.state();
        if !state.locked {
            state.locked = true;
            return TableLockGuard { lock: self };
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.queue.push_back(ticket);

        while state.granted != Some(ticket) {
            state = self
                .handoff
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.granted = None;
        TableLockGuard { lock: self }
    }

    fn unlock(&self) {
        let mut state = self.state();
        match state.queue.pop_front() {
            Some(next) => {
                state.granted = Some(next);
                drop(state);
                self.handoff.notify_all();
            }
            None => state.locked = false,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.state().locked
    }

    /// Number of callers currently waiting for the lock
    pub fn waiting(&self) -> usize {
        self.state().queue.len()
    }
}

impl Drop for TableLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn wait_for_waiters(lock: &TableLock, count: usize) {
        while lock.waiting() < count {
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_lock_and_release() {
        let lock = TableLock::new();
        assert!(!lock.is_locked());
        {
            let _guard = lock.lock();
            assert!(lock.is_locked());
        }
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_released_on_error_path() {
        fn failing(lock: &TableLock) -> Result<(), String> {
            let _guard = lock.lock();
            Err("validation failed".into())
        }

        let lock = TableLock::new();
        assert!(failing(&lock).is_err());
        assert!(!lock.is_locked());
        let _guard = lock.lock();
    }

    #[test]
    fn test_waiters_served_in_fifo_order() {
        let lock = Arc::new(TableLock::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let guard = lock.lock();
        let mut handles = Vec::new();
        for i in 0..5 {
            let waiter = Arc::clone(&lock);
            let order = Arc::clone(&order);
            handles.push(thread::spawn(move || {
                let _guard = waiter.lock();
                order.lock().unwrap().push(i);
            }));
            // Make sure waiter `i` is queued before spawning the next one.
            wait_for_waiters(&lock, i + 1);
        }

        assert_eq!(lock.waiting(), 5);
        drop(guard);
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_ownership_transfers_without_unlocking() {
        let lock = Arc::new(TableLock::new());
        let guard = lock.lock();

        let waiter = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                let _guard = lock.lock();
                thread::sleep(Duration::from_millis(20));
            })
        };
        wait_for_waiters(&lock, 1);
        drop(guard);
        // The waiter now owns the lock; it never became free in between.
        assert!(lock.is_locked());
        waiter.join().unwrap();
        assert!(!lock.is_locked());
    }
}
