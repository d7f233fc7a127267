//! The three per-node locks.
//!
//! - [TravelLock] guards traversal: many readers or one writer may be inside
//!   a node.
//! - [ChangeLock] guards mutation of a node's payload. It can be taken on a
//!   group of nodes at once; while a group acquisition is under way, plain
//!   acquisitions of any member wait, so the group never ends up half-held
//!   behind them.
//! - [OwnerLock] counts the traversals relying on a node's payload, running
//!   the load on the first and the release on the last.
//!
//! The locks are not RAII guards: the tree algorithm acquires them in one
//! hook and releases them in another.

use std::sync::{Condvar, Mutex};

/// Whether a node is visited for reading or for structural change.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    Read,
    Write,
}

#[derive(Default)]
struct TravelState {
    readers: usize,
    writer: bool,
}

#[derive(Default)]
pub struct TravelLock {
    state: Mutex<TravelState>,
    cond: Condvar,
}

impl TravelLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self, mode: Mode) {
        let mut state = self.state.lock().unwrap();
        match mode {
            Mode::Read => {
                while state.writer {
                    state = self.cond.wait(state).unwrap();
                }
                state.readers += 1;
            }
            Mode::Write => {
                while state.writer || state.readers > 0 {
                    state = self.cond.wait(state).unwrap();
                }
                state.writer = true;
            }
        }
    }

    pub fn unlock(&self, mode: Mode) {
        let mut state = self.state.lock().unwrap();
        match mode {
            Mode::Read => {
                debug_assert!(state.readers > 0, "travel read lock underflow");
                state.readers -= 1;
                if state.readers == 0 {
                    self.cond.notify_all();
                }
            }
            Mode::Write => {
                debug_assert!(state.writer, "travel write lock not held");
                state.writer = false;
                self.cond.notify_all();
            }
        }
    }
}

#[derive(Default)]
struct ChangeState {
    readers: usize,
    writer: bool,
    /// Group acquisitions currently trying to take this lock.
    contenders: usize,
}

#[derive(Default)]
pub struct ChangeLock {
    state: Mutex<ChangeState>,
    cond: Condvar,
}

impl ChangeLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared acquisition, for serializing a payload that is not modified.
    pub fn lock_read(&self) {
        let mut state = self.state.lock().unwrap();
        while state.writer || state.contenders > 0 {
            state = self.cond.wait(state).unwrap();
        }
        state.readers += 1;
    }

    pub fn unlock_read(&self) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.readers > 0, "change read lock underflow");
        state.readers -= 1;
        if state.readers == 0 {
            self.cond.notify_all();
        }
    }

    pub fn lock_write(&self) {
        let mut state = self.state.lock().unwrap();
        while state.writer || state.readers > 0 || state.contenders > 0 {
            state = self.cond.wait(state).unwrap();
        }
        state.writer = true;
    }

    pub fn unlock_write(&self) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.writer, "change write lock not held");
        state.writer = false;
        self.cond.notify_all();
    }

    /// Takes the write lock on every member of `locks` as one unit.
    ///
    /// Members are first flagged as contended, which holds off plain
    /// acquisitions. Then one member is locked blocking and the others are
    /// tried; on any failure everything is released and the acquisition
    /// restarts by blocking on the member that failed. Finally the flags are
    /// cleared and waiters woken.
    pub fn lock_group(locks: &[&ChangeLock]) {
        let mut members: Vec<&ChangeLock> = Vec::with_capacity(locks.len());
        for lock in locks {
            if !members.iter().any(|m| std::ptr::eq(*m, *lock)) {
                members.push(*lock);
            }
        }
        match members.as_slice() {
            [] => return,
            [single] => return single.lock_write(),
            _ => (),
        }

        for lock in &members {
            lock.state.lock().unwrap().contenders += 1;
        }

        let mut first = 0;
        'retry: loop {
            members[first].acquire_contended();
            for (i, lock) in members.iter().enumerate() {
                if i == first || lock.try_acquire_contended() {
                    continue;
                }
                for (j, held) in members.iter().enumerate() {
                    if j == first || j < i {
                        held.unlock_write();
                    }
                }
                first = i;
                continue 'retry;
            }
            break;
        }

        for lock in &members {
            let mut state = lock.state.lock().unwrap();
            state.contenders -= 1;
            if state.contenders == 0 {
                lock.cond.notify_all();
            }
        }
    }

    /// Releases a lock taken by [ChangeLock::lock_group].
    pub fn unlock_group(locks: &[&ChangeLock]) {
        let mut released: Vec<&ChangeLock> = Vec::with_capacity(locks.len());
        for lock in locks {
            if !released.iter().any(|m| std::ptr::eq(*m, *lock)) {
                lock.unlock_write();
                released.push(*lock);
            }
        }
    }

    /// Write acquisition on behalf of a group, ignoring contention flags.
    fn acquire_contended(&self) {
        let mut state = self.state.lock().unwrap();
        while state.writer || state.readers > 0 {
            state = self.cond.wait(state).unwrap();
        }
        state.writer = true;
    }

    fn try_acquire_contended(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.writer || state.readers > 0 {
            return false;
        }
        state.writer = true;
        true
    }

    #[cfg(test)]
    fn is_write_locked(&self) -> bool {
        self.state.lock().unwrap().writer
    }
}

/// Counts owners of a node's payload.
#[derive(Default)]
pub struct OwnerLock {
    owners: Mutex<usize>,
}

impl OwnerLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new owner. For the first owner, `first` runs before the
    /// count is raised, with the lock held, so later owners wait until it
    /// finishes. If `first` fails the count is left unchanged.
    pub fn enter<E>(&self, first: impl FnOnce() -> Result<(), E>) -> Result<bool, E> {
        let mut owners = self.owners.lock().unwrap();
        let is_first = *owners == 0;
        if is_first {
            first()?;
        }
        *owners += 1;
        Ok(is_first)
    }

    /// Drops an owner. For the last owner, `last` runs with the lock held.
    /// Returns true if this was the last owner.
    pub fn leave(&self, last: impl FnOnce()) -> bool {
        let mut owners = self.owners.lock().unwrap();
        debug_assert!(*owners > 0, "owner count underflow");
        *owners = owners.saturating_sub(1);
        let is_last = *owners == 0;
        if is_last {
            last();
        }
        is_last
    }

    pub fn owners(&self) -> usize {
        *self.owners.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    use super::{ChangeLock, Mode, OwnerLock, TravelLock};

    #[test]
    fn travel_readers_share_writer_excludes() {
        let lock = Arc::new(TravelLock::new());
        lock.lock(Mode::Read);
        lock.lock(Mode::Read);

        let entered = Arc::new(AtomicUsize::new(0));
        let writer = {
            let lock = lock.clone();
            let entered = entered.clone();
            thread::spawn(move || {
                lock.lock(Mode::Write);
                entered.store(1, Ordering::SeqCst);
                lock.unlock(Mode::Write);
            })
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(entered.load(Ordering::SeqCst), 0);
        lock.unlock(Mode::Read);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(entered.load(Ordering::SeqCst), 0);
        lock.unlock(Mode::Read);
        writer.join().unwrap();
        assert_eq!(entered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn owner_first_and_last() {
        let lock = OwnerLock::new();
        let loads = AtomicUsize::new(0);
        let load = || {
            loads.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ()>(())
        };
        assert_eq!(lock.enter(load), Ok(true));
        assert_eq!(lock.enter(load), Ok(false));
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(!lock.leave(|| panic!("not last")));
        let mut released = false;
        assert!(lock.leave(|| released = true));
        assert!(released);

        assert_eq!(lock.enter(|| Err("boom")), Err("boom"));
        assert_eq!(lock.owners(), 0);
    }

    #[test]
    fn change_readers_share_and_hold_off_writers() {
        let lock = Arc::new(ChangeLock::new());
        lock.lock_read();
        lock.lock_read();

        let written = Arc::new(AtomicBool::new(false));
        let writer = {
            let (lock, written) = (lock.clone(), written.clone());
            thread::spawn(move || {
                lock.lock_write();
                written.store(true, Ordering::SeqCst);
                lock.unlock_write();
            })
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!written.load(Ordering::SeqCst));
        lock.unlock_read();
        thread::sleep(Duration::from_millis(20));
        assert!(!written.load(Ordering::SeqCst));
        lock.unlock_read();
        writer.join().unwrap();
        assert!(written.load(Ordering::SeqCst));

        // A group in progress also holds off new readers.
        let other = Arc::new(ChangeLock::new());
        other.lock_write();
        let grouped = {
            let (lock, other) = (lock.clone(), other.clone());
            thread::spawn(move || {
                ChangeLock::lock_group(&[&lock, &other]);
                ChangeLock::unlock_group(&[&lock, &other]);
            })
        };
        thread::sleep(Duration::from_millis(20));
        let reader = {
            let lock = lock.clone();
            thread::spawn(move || {
                lock.lock_read();
                lock.unlock_read();
            })
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!reader.is_finished());
        other.unlock_write();
        grouped.join().unwrap();
        reader.join().unwrap();
    }

    #[test]
    fn group_waits_for_single_holder() {
        let a = Arc::new(ChangeLock::new());
        let b = Arc::new(ChangeLock::new());
        b.lock_write();

        let grouped = {
            let (a, b) = (a.clone(), b.clone());
            thread::spawn(move || {
                ChangeLock::lock_group(&[&a, &b]);
                ChangeLock::unlock_group(&[&a, &b]);
            })
        };
        thread::sleep(Duration::from_millis(20));
        // The group backs off instead of sitting on `a`.
        assert!(!grouped.is_finished());
        assert!(!a.is_write_locked());
        b.unlock_write();
        grouped.join().unwrap();
        assert!(!a.is_write_locked());
        assert!(!b.is_write_locked());
    }

    #[test]
    fn overlapping_groups_do_not_deadlock() {
        const THREADS: usize = 8;
        const ROUNDS: usize = 500;

        let locks: Arc<Vec<ChangeLock>> = Arc::new((0..3).map(|_| ChangeLock::new()).collect());
        let busy: Arc<Vec<AtomicBool>> = Arc::new((0..3).map(|_| AtomicBool::new(false)).collect());
        let done = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(THREADS));
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let locks = locks.clone();
                let busy = busy.clone();
                let done = done.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    for round in 0..ROUNDS {
                        let members: &[usize] = match (t + round) % 4 {
                            0 => &[0, 1],
                            1 => &[1, 0, 2],
                            2 => &[2, 1],
                            _ => &[2],
                        };
                        let group: Vec<&ChangeLock> = members.iter().map(|&i| &locks[i]).collect();
                        ChangeLock::lock_group(&group);
                        for &i in members {
                            assert!(!busy[i].swap(true, Ordering::SeqCst));
                        }
                        for &i in members {
                            busy[i].store(false, Ordering::SeqCst);
                        }
                        ChangeLock::unlock_group(&group);

                        let single = &locks[round % 3];
                        single.lock_write();
                        assert!(!busy[round % 3].swap(true, Ordering::SeqCst));
                        busy[round % 3].store(false, Ordering::SeqCst);
                        single.unlock_write();
                    }
                    done.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(done.load(Ordering::SeqCst), THREADS);
    }
}
