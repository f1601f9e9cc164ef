#![forbid(unsafe_code)]

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::panic::Location;
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::thread;

/// How a `CheckedMutex` treats a second acquisition attempt while held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockDiscipline {
    /// Single-owner debugging aid: any attempt to enter a held lock is a
    /// programming error and panics, identifying both holders.
    Strict,
    /// Plain blocking mutex for production use.
    Blocking,
}

#[derive(Debug, Clone)]
struct Holder {
    thread: String,
    file: &'static str,
    line: u32,
}

/// A mutex wrapper that records who holds it and, under `Strict`
/// discipline, turns contention and same-thread reentry into an immediate
/// panic instead of blocking. Construction is initialization and guard
/// drop is release, so double-init, double-release, and use-after-destroy
/// cannot be expressed.
#[derive(Debug)]
pub struct CheckedMutex<T> {
    name: String,
    discipline: LockDiscipline,
    holder: Mutex<Option<Holder>>,
    inner: Mutex<T>,
}

pub struct CheckedGuard<'a, T> {
    owner: &'a CheckedMutex<T>,
    guard: Option<MutexGuard<'a, T>>,
}

impl<T> CheckedMutex<T> {
    pub fn new(name: &str, discipline: LockDiscipline, value: T) -> Self {
        CheckedMutex {
            name: name.to_string(),
            discipline,
            holder: Mutex::new(None),
            inner: Mutex::new(value),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn discipline(&self) -> LockDiscipline {
        self.discipline
    }

    /// Acquire the lock, recording the caller as holder.
    #[track_caller]
    pub fn enter(&self) -> CheckedGuard<'_, T> {
        let caller = Location::caller();
        match self.inner.try_lock() {
            Ok(guard) => self.admit(guard, caller),
            Err(TryLockError::WouldBlock) => match self.discipline {
                LockDiscipline::Strict => self.contended(caller),
                LockDiscipline::Blocking => {
                    let guard = match self.inner.lock() {
                        Ok(guard) => guard,
                        Err(_) => panic!("lock '{}' poisoned", self.name),
                    };
                    self.admit(guard, caller)
                }
            },
            Err(TryLockError::Poisoned(_)) => panic!("lock '{}' poisoned", self.name),
        }
    }

    fn admit<'a>(
        &'a self,
        guard: MutexGuard<'a, T>,
        caller: &'static Location<'static>,
    ) -> CheckedGuard<'a, T> {
        if let Ok(mut holder) = self.holder.lock() {
            *holder = Some(Holder {
                thread: thread::current().name().unwrap_or("unnamed").to_string(),
                file: caller.file(),
                line: caller.line(),
            });
        }
        CheckedGuard {
            owner: self,
            guard: Some(guard),
        }
    }

    fn contended(&self, caller: &'static Location<'static>) -> ! {
        let holder = self
            .holder
            .lock()
            .ok()
            .and_then(|h| h.as_ref().cloned());
        match holder {
            Some(h) => panic!(
                "lock '{}' entered at {}:{} while held by thread '{}' (entered at {}:{})",
                self.name,
                caller.file(),
                caller.line(),
                h.thread,
                h.file,
                h.line
            ),
            None => panic!(
                "lock '{}' entered at {}:{} while held",
                self.name,
                caller.file(),
                caller.line()
            ),
        }
    }
}

impl<T> Deref for CheckedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.as_ref().expect("guard present until drop")
    }
}

impl<T> DerefMut for CheckedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().expect("guard present until drop")
    }
}

impl<T> Drop for CheckedGuard<'_, T> {
    fn drop(&mut self) {
        // release order: inner lock first, then the holder record
        self.guard.take();
        if let Ok(mut holder) = self.owner.holder.lock() {
            *holder = None;
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for CheckedGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckedGuard")
            .field("lock", &self.owner.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn enter_exit_reenter() {
        let lock = CheckedMutex::new("frag", LockDiscipline::Strict, 0u32);
        {
            let mut guard = lock.enter();
            *guard += 1;
        }
        let guard = lock.enter();
        assert_eq!(*guard, 1);
    }

    #[test]
    #[should_panic(expected = "while held")]
    fn strict_double_enter_panics() {
        let lock = CheckedMutex::new("frag", LockDiscipline::Strict, ());
        let _held = lock.enter();
        let _second = lock.enter();
    }

    #[test]
    fn strict_panic_names_holder_location() {
        let lock = Arc::new(CheckedMutex::new("pool", LockDiscipline::Strict, ()));
        let held = lock.enter();
        let second = Arc::clone(&lock);
        let result = thread::Builder::new()
            .name("intruder".into())
            .spawn(move || {
                let _ = second.enter();
            })
            .unwrap()
            .join();
        drop(held);
        let err = result.expect_err("second enter must panic");
        let msg = err
            .downcast_ref::<String>()
            .cloned()
            .unwrap_or_default();
        assert!(msg.contains("lock 'pool'"), "message was: {msg}");
        assert!(msg.contains("lock.rs"), "message was: {msg}");
    }

    #[test]
    fn blocking_discipline_waits() {
        let lock = Arc::new(CheckedMutex::new("frag", LockDiscipline::Blocking, 0u32));
        let held = lock.enter();
        let contender = Arc::clone(&lock);
        let handle = thread::spawn(move || {
            let mut guard = contender.enter();
            *guard += 1;
        });
        thread::sleep(Duration::from_millis(20));
        drop(held);
        handle.join().unwrap();
        assert_eq!(*lock.enter(), 1);
    }
}
