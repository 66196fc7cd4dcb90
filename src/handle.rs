//! Liveness-checked ownership of a native handle.
//!
//! Every native pointer lives in a [`HandleCell`] next to the bookkeeping
//! state of its handle kind. The pointer is only reachable through
//! [`HandleCell::execute`], which refuses to run once the handle has been
//! released, and it is released at most once through [`HandleCell::take`].
//!
//! Lock order across cells is environment, then transaction (parent before
//! child), then cursor. The database registry and the writer slot are leaf
//! locks and are never held while acquiring a cell.
//!
//! Caller code that runs while a cell is locked goes through
//! [`run_callback`]. Until it returns, no cell can be locked on that thread;
//! attempts fail with `Error::Reentrant` instead of deadlocking.

use std::cell::Cell;
use std::ptr::NonNull;

use parking_lot::{Mutex, MutexGuard};

use crate::error::{Error, HandleKind, Result};

thread_local! {
    static IN_CALLBACK: Cell<bool> = Cell::new(false);
}

/// Whether caller code is running under a cell lock on this thread.
pub(crate) fn in_callback() -> bool {
    IN_CALLBACK.with(Cell::get)
}

/// Runs caller-supplied `f` while a cell lock is held.
pub(crate) fn run_callback<R>(f: impl FnOnce() -> R) -> R {
    struct Restore(bool);

    impl Drop for Restore {
        fn drop(&mut self) {
            IN_CALLBACK.with(|flag| flag.set(self.0));
        }
    }

    let _restore = Restore(IN_CALLBACK.with(|flag| flag.replace(true)));
    f()
}

pub(crate) struct Slot<T, S> {
    ptr: Option<NonNull<T>>,
    pub(crate) state: S,
}

impl<T, S> Slot<T, S> {
    pub(crate) fn ptr(&self) -> Option<*mut T> {
        self.ptr.map(NonNull::as_ptr)
    }

    pub(crate) fn is_live(&self) -> bool {
        self.ptr.is_some()
    }

    /// Clears the pointer, handing it back to the caller exactly once.
    pub(crate) fn take(&mut self) -> Option<*mut T> {
        self.ptr.take().map(NonNull::as_ptr)
    }
}

pub(crate) struct HandleCell<T, S = ()> {
    kind: HandleKind,
    slot: Mutex<Slot<T, S>>,
}

impl<T, S> HandleCell<T, S> {
    pub(crate) fn new(kind: HandleKind, ptr: *mut T, state: S) -> Self {
        HandleCell {
            kind,
            slot: Mutex::new(Slot {
                ptr: NonNull::new(ptr),
                state,
            }),
        }
    }

    pub(crate) fn kind(&self) -> HandleKind {
        self.kind
    }

    /// Locks the cell, or fails with `Reentrant` inside a callback.
    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Slot<T, S>>> {
        if in_callback() {
            return Err(Error::Reentrant(self.kind));
        }
        Ok(self.slot.lock())
    }

    pub(crate) fn is_live(&self) -> bool {
        match self.lock() {
            Ok(slot) => slot.is_live(),
            // a cell busy under a callback belongs to the live handle
            // running it
            Err(_) => self.slot.try_lock().map_or(true, |slot| slot.is_live()),
        }
    }

    /// Runs `f` with the live pointer while holding the cell's lock.
    pub(crate) fn execute<R>(&self, f: impl FnOnce(*mut T, &mut S) -> Result<R>) -> Result<R> {
        let mut slot = self.lock()?;
        let ptr = slot.ptr().ok_or(Error::Stale(self.kind()))?;
        f(ptr, &mut slot.state)
    }

    /// Marks the handle dead. Returns the pointer only to the first caller.
    pub(crate) fn take(&self) -> Result<Option<*mut T>> {
        Ok(self.lock()?.take())
    }
}

// SAFETY: the pointer is only dereferenced by the engine while the cell's
// lock is held, and is cleared under the same lock before it is released.
unsafe impl<T, S: Send> Send for HandleCell<T, S> {}
unsafe impl<T, S: Send> Sync for HandleCell<T, S> {}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell(value: &mut u32) -> HandleCell<u32, usize> {
        HandleCell::new(HandleKind::Cursor, value as *mut u32, 0)
    }

    #[test]
    fn execute_sees_pointer_and_state() {
        let mut value = 7;
        let cell = cell(&mut value);
        let read = cell
            .execute(|ptr, calls| {
                *calls += 1;
                Ok(unsafe { *ptr })
            })
            .unwrap();
        assert_eq!(read, 7);
        assert_eq!(cell.lock().unwrap().state, 1);
        assert!(cell.is_live());
    }

    #[test]
    fn take_is_idempotent() {
        let mut value = 1;
        let cell = cell(&mut value);
        assert!(cell.take().unwrap().is_some());
        assert!(cell.take().unwrap().is_none());
        assert!(!cell.is_live());
    }

    #[test]
    fn dead_cell_fails_closed() {
        let mut value = 1;
        let cell = cell(&mut value);
        cell.take().unwrap();
        let mut ran = false;
        let err = cell
            .execute(|_, _| {
                ran = true;
                Ok(())
            })
            .unwrap_err();
        assert_eq!(err, Error::Stale(HandleKind::Cursor));
        assert!(!ran);
    }

    #[test]
    fn null_pointer_starts_dead() {
        let cell: HandleCell<u32> = HandleCell::new(HandleKind::Environment, std::ptr::null_mut(), ());
        assert!(!cell.is_live());
        assert_eq!(cell.kind(), HandleKind::Environment);
    }

    #[test]
    fn callback_cannot_relock_its_cell() {
        let mut value = 3;
        let cell = cell(&mut value);
        let inner = cell
            .execute(|_, _| Ok(run_callback(|| cell.execute(|ptr, _| Ok(unsafe { *ptr })))))
            .unwrap();
        assert_eq!(inner.unwrap_err(), Error::Reentrant(HandleKind::Cursor));
        assert!(!in_callback());
        assert_eq!(cell.execute(|ptr, _| Ok(unsafe { *ptr })).unwrap(), 3);
    }

    #[test]
    fn callback_flag_survives_panic() {
        let result = std::panic::catch_unwind(|| run_callback(|| panic!("fill failed")));
        assert!(result.is_err());
        assert!(!in_callback());
    }

    #[test]
    fn liveness_is_readable_inside_callback() {
        let mut value = 1;
        let cell = cell(&mut value);
        let live = cell.execute(|_, _| Ok(run_callback(|| cell.is_live()))).unwrap();
        assert!(live);
    }
}
