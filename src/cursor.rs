use std::fmt;
use std::marker::PhantomData;
use std::ptr;
use std::sync::{Arc, Weak};

use lmdb_sys as ffi;
use log::{debug, warn};

use crate::constants::{WriteFlags, UNSUPPORTED_PUT_FLAGS};
use crate::database::Database;
use crate::env::Environment;
use crate::error::{lmdb_result, Error, HandleKind, Result};
use crate::handle::HandleCell;
use crate::transaction::{Transaction, TxnInner};
use crate::types::CursorOp;
use crate::value::{self, Pair};

pub(crate) struct CursorState {
    /// Transaction the cursor is bound to. Never keeps it alive.
    owner: Weak<TxnInner>,
    bound: bool,
}

pub(crate) struct CursorInner {
    cell: HandleCell<ffi::MDB_cursor, CursorState>,
    env: Environment,
    db: Database,
    read_only: bool,
}

impl CursorInner {
    pub(crate) fn new(
        cursor: *mut ffi::MDB_cursor,
        owner: Weak<TxnInner>,
        db: Database,
        env: Environment,
        read_only: bool,
    ) -> Self {
        let state = CursorState { owner, bound: true };
        CursorInner {
            cell: HandleCell::new(HandleKind::Cursor, cursor, state),
            env,
            db,
            read_only,
        }
    }

    /// Called by the owner, under its lock, when it ends or is reset.
    pub(crate) fn unbind(&self) {
        // the owner's lock was granted, so this one is too
        let Ok(mut slot) = self.cell.lock() else {
            return;
        };
        slot.state.bound = false;
        slot.state.owner = Weak::new();
        if !self.read_only {
            // freed by the engine together with its write transaction
            slot.take();
        }
    }

    /// Closes the native cursor if it is still allocated.
    pub(crate) fn release(&self) {
        if let Err(err) = self.try_release() {
            warn!("cursor on database {} not released: {}", self.db.dbi(), err);
        }
    }

    fn try_release(&self) -> Result<()> {
        let owner = {
            let slot = self.cell.lock()?;
            if !slot.is_live() {
                return Ok(());
            }
            if slot.state.bound {
                slot.state.owner.upgrade()
            } else {
                None
            }
        };
        // a bound cursor is unlinked from its transaction, so that one must
        // be held still
        let _guard = owner.as_ref().map(|txn| txn.cell.lock()).transpose()?;
        if let Some(cursor) = self.cell.take()? {
            unsafe { ffi::mdb_cursor_close(cursor) };
            debug!("cursor on database {} closed", self.db.dbi());
        }
        Ok(())
    }

    /// Runs `f` with the cursor while holding its owner's lock and its own.
    fn with_owner<R>(
        &self,
        f: impl FnOnce(*mut ffi::MDB_cursor, &TxnInner) -> Result<R>,
    ) -> Result<R> {
        let owner = {
            let slot = self.cell.lock()?;
            if !slot.is_live() || !slot.state.bound {
                return Err(Error::Stale(HandleKind::Cursor));
            }
            slot.state
                .owner
                .upgrade()
                .ok_or(Error::Stale(HandleKind::Transaction))?
        };
        owner.execute(|_, _| {
            self.env.check_db(self.db)?;
            self.cell.execute(|cursor, state| {
                // the owner may have changed between the two locks
                if !state.bound || !ptr::eq(state.owner.as_ptr(), Arc::as_ptr(&owner)) {
                    return Err(Error::Stale(HandleKind::Cursor));
                }
                f(cursor, owner.as_ref())
            })
        })
    }

    fn get_raw(
        &self,
        key: Option<&[u8]>,
        data: Option<&[u8]>,
        op: CursorOp,
    ) -> Result<Option<Pair>> {
        if op.requires_key() && key.is_none() {
            return Err(Error::MissingArgument("key"));
        }
        if op.requires_data() && data.is_none() {
            return Err(Error::MissingArgument("data"));
        }
        self.with_owner(|cursor, _| {
            let mut key_val = value::to_val_opt(key);
            let mut data_val = value::to_val_opt(data);
            match unsafe { ffi::mdb_cursor_get(cursor, &mut key_val, &mut data_val, op.raw()) } {
                ffi::MDB_SUCCESS => {
                    let pair = unsafe { (value::copy_out(&key_val), value::copy_out(&data_val)) };
                    Ok(Some(pair))
                }
                ffi::MDB_NOTFOUND => Ok(None),
                code => Err(Error::from_code(code)),
            }
        })
    }
}

impl Drop for CursorInner {
    fn drop(&mut self) {
        self.release();
    }
}

/// Cursor over one database
///
/// A cursor holds its transaction weakly. When a read-write transaction
/// ends, its cursors die with it. When a read-only transaction ends or is
/// reset, its cursors stay allocated and can be rebound with
/// [`Cursor::renew`].
#[derive(Clone)]
pub struct Cursor {
    inner: Arc<CursorInner>,
    _not_send: PhantomData<*mut ()>,
}

impl Cursor {
    pub(crate) fn from_inner(inner: Arc<CursorInner>) -> Self {
        Cursor {
            inner,
            _not_send: PhantomData,
        }
    }

    /// Positions the cursor and returns the pair found there, or `None`.
    pub fn get(&self, key: Option<&[u8]>, op: CursorOp) -> Result<Option<Pair>> {
        self.inner.get_raw(key, None, op)
    }

    /// Like [`Cursor::get`] for operations that also match on the value,
    /// such as [`CursorOp::GetBoth`].
    pub fn get_with_data(
        &self,
        key: Option<&[u8]>,
        data: Option<&[u8]>,
        op: CursorOp,
    ) -> Result<Option<Pair>> {
        self.inner.get_raw(key, data, op)
    }

    /// Positions the cursor and returns only the key.
    pub fn get_key(&self, key: Option<&[u8]>, op: CursorOp) -> Result<Option<Vec<u8>>> {
        Ok(self.get(key, op)?.map(|(key, _)| key))
    }

    pub fn put(&self, key: &[u8], data: &[u8], flags: WriteFlags) -> Result<()> {
        self.inner.with_owner(|cursor, owner| {
            if owner.read_only {
                return Err(Error::ReadOnly);
            }
            if flags.intersects(UNSUPPORTED_PUT_FLAGS) {
                return Err(Error::InvalidArgument(
                    "RESERVE and MULTIPLE are not accepted by put",
                ));
            }
            let mut key_val = value::to_val(key);
            let mut data_val = value::to_val(data);
            lmdb_result(unsafe {
                ffi::mdb_cursor_put(cursor, &mut key_val, &mut data_val, flags.bits())
            })
        })
    }

    /// Deletes the item at the current position. `NODUPDATA` removes every
    /// duplicate of the current key.
    pub fn del(&self, flags: WriteFlags) -> Result<()> {
        self.inner.with_owner(|cursor, owner| {
            if owner.read_only {
                return Err(Error::ReadOnly);
            }
            lmdb_result(unsafe { ffi::mdb_cursor_del(cursor, flags.bits()) })
        })
    }

    /// Number of duplicates at the current position of a `DUPSORT` database.
    pub fn count(&self) -> Result<usize> {
        self.inner.with_owner(|cursor, _| {
            let mut count: usize = 0;
            lmdb_result(unsafe { ffi::mdb_cursor_count(cursor, &mut count) })?;
            Ok(count)
        })
    }

    /// Binds an unbound read-only cursor to `txn`.
    pub fn renew(&self, txn: &Transaction) -> Result<()> {
        let inner = &self.inner;
        if !inner.env.same_env(&txn.inner.env) {
            return Err(Error::EnvMismatch);
        }
        txn.inner.execute(|txn_ptr, txn_state| {
            if !txn.inner.read_only || !inner.read_only {
                return Err(Error::NotReadOnly);
            }
            inner.env.check_db(inner.db)?;
            inner.cell.execute(|cursor, state| {
                if state.bound {
                    return Err(Error::InvalidArgument(
                        "cursor is still bound to a live transaction",
                    ));
                }
                lmdb_result(unsafe { ffi::mdb_cursor_renew(txn_ptr, cursor) })?;
                state.owner = Arc::downgrade(&txn.inner);
                state.bound = true;
                Ok(())
            })?;
            txn_state.track_cursor(Arc::downgrade(inner));
            Ok(())
        })
    }

    /// Releases the cursor. No-op if it is already dead.
    ///
    /// Fails with `Error::Reentrant` when called from inside a
    /// [`Transaction::put_reserved`] fill closure.
    pub fn close(&self) -> Result<()> {
        self.inner.try_release()
    }

    pub fn db(&self) -> Database {
        self.inner.db
    }

    /// The transaction the cursor is bound to, if any.
    pub fn txn(&self) -> Option<Transaction> {
        let slot = self.inner.cell.lock().ok()?;
        if !slot.state.bound {
            return None;
        }
        slot.state.owner.upgrade().map(Transaction::from_inner)
    }

    pub fn is_live(&self) -> bool {
        self.inner.cell.is_live()
    }

    pub fn is_bound(&self) -> bool {
        self.inner
            .cell
            .lock()
            .map_or(false, |slot| slot.is_live() && slot.state.bound)
    }
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("db", &self.inner.db)
            .field("live", &self.is_live())
            .field("bound", &self.is_bound())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DbFlags, WriteFlags};
    use tempfile::tempdir;

    fn populated() -> (tempfile::TempDir, Environment, Database) {
        let dir = tempdir().unwrap();
        let env = Environment::builder().set_max_dbs(4).open(dir.path()).unwrap();
        let txn = env.begin_rw_txn().unwrap();
        let db = txn.create_db(Some("dups"), DbFlags::DUPSORT).unwrap();
        for (key, data) in [(b"a", b"1"), (b"b", b"1"), (b"b", b"2"), (b"c", b"1")] {
            txn.put(db, key, data, WriteFlags::empty()).unwrap();
        }
        txn.commit().unwrap();
        (dir, env, db)
    }

    #[test]
    fn missing_key_is_rejected_before_native_call() {
        let (_dir, env, db) = populated();
        let txn = env.begin_ro_txn().unwrap();
        let cursor = txn.open_cursor(db).unwrap();
        assert_eq!(
            cursor.get(None, CursorOp::SetRange).unwrap_err(),
            Error::MissingArgument("key")
        );
        assert_eq!(
            cursor.get_with_data(Some(b"b"), None, CursorOp::GetBoth).unwrap_err(),
            Error::MissingArgument("data")
        );
    }

    #[test]
    fn duplicates_are_counted_and_matched() {
        let (_dir, env, db) = populated();
        let txn = env.begin_ro_txn().unwrap();
        let cursor = txn.open_cursor(db).unwrap();
        let pair = cursor.get(Some(b"b"), CursorOp::Set).unwrap().unwrap();
        assert_eq!(pair, (b"b".to_vec(), b"1".to_vec()));
        assert_eq!(cursor.count().unwrap(), 2);
        let pair = cursor
            .get_with_data(Some(b"b"), Some(b"2"), CursorOp::GetBoth)
            .unwrap()
            .unwrap();
        assert_eq!(pair.1, b"2");
        assert_eq!(cursor.get_key(None, CursorOp::NextNoDup).unwrap().unwrap(), b"c");
        assert_eq!(cursor.get(None, CursorOp::Next).unwrap(), None);
    }

    #[test]
    fn write_cursor_dies_with_transaction() {
        let (_dir, env, db) = populated();
        let txn = env.begin_rw_txn().unwrap();
        let cursor = txn.open_cursor(db).unwrap();
        cursor.put(b"d", b"1", WriteFlags::empty()).unwrap();
        txn.commit().unwrap();
        assert!(!cursor.is_live());
        assert_eq!(
            cursor.get(None, CursorOp::First).unwrap_err(),
            Error::Stale(HandleKind::Cursor)
        );
        cursor.close().unwrap();
    }

    #[test]
    fn read_cursor_is_kept_for_renew() {
        let (_dir, env, db) = populated();
        let first = env.begin_ro_txn().unwrap();
        let cursor = first.open_cursor(db).unwrap();
        first.abort();
        assert!(cursor.is_live());
        assert!(!cursor.is_bound());
        assert!(cursor.txn().is_none());

        let second = env.begin_ro_txn().unwrap();
        cursor.renew(&second).unwrap();
        assert!(cursor.is_bound());
        assert_eq!(cursor.get_key(None, CursorOp::First).unwrap().unwrap(), b"a");
        assert!(matches!(
            cursor.renew(&second).unwrap_err(),
            Error::InvalidArgument(_)
        ));
    }

    #[test]
    fn cursor_writes_need_read_write_owner() {
        let (_dir, env, db) = populated();
        let txn = env.begin_ro_txn().unwrap();
        let cursor = txn.open_cursor(db).unwrap();
        cursor.get(None, CursorOp::First).unwrap();
        assert_eq!(cursor.put(b"z", b"1", WriteFlags::empty()).unwrap_err(), Error::ReadOnly);
        assert_eq!(cursor.del(WriteFlags::empty()).unwrap_err(), Error::ReadOnly);
    }

    #[test]
    fn cursor_del_removes_current_item() {
        let (_dir, env, db) = populated();
        let txn = env.begin_rw_txn().unwrap();
        let cursor = txn.open_cursor(db).unwrap();
        cursor.get(Some(b"b"), CursorOp::Set).unwrap().unwrap();
        cursor.del(WriteFlags::NODUPDATA).unwrap();
        assert_eq!(txn.get(db, b"b").unwrap(), None);
        assert_eq!(cursor.txn().unwrap().id(), txn.id());
    }
}
