use std::cmp::Ordering;
use std::ffi::CString;
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::os::raw::{c_int, c_uint};
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};

use lmdb_sys as ffi;
use log::{debug, warn};

use crate::constants::{DbFlags, TxnFlags, WriteFlags, UNSUPPORTED_PUT_FLAGS};
use crate::cursor::{Cursor, CursorInner};
use crate::database::{Database, CORE_DBS};
use crate::env::Environment;
use crate::error::{lmdb_result, Error, HandleKind, Result};
use crate::handle::{self, HandleCell};
use crate::types::Stat;
use crate::value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndMode {
    Commit,
    Abort,
}

/// Bookkeeping guarded by the transaction's lock.
#[derive(Default)]
pub(crate) struct TxnState {
    /// Suspended by `reset`; only `renew`, `commit` and `abort` are accepted
    reset: bool,
    /// Root write transaction holding the environment's writer slot
    holds_writer: bool,
    /// Nested transactions
    children: Vec<Weak<TxnInner>>,
    /// Cursors currently bound to this transaction
    cursors: Vec<Weak<CursorInner>>,
    /// Database handles first opened by this transaction
    new_dbis: Vec<ffi::MDB_dbi>,
}

impl TxnState {
    /// The engine accepts nothing but commit/abort from a transaction with an
    /// active child, and nothing but renew from a reset one.
    pub(crate) fn check_usable(&self) -> Result<()> {
        if self.reset {
            return Err(Error::TxnReset);
        }
        if self.has_live_child() {
            return Err(Error::HasChild);
        }
        Ok(())
    }

    fn has_live_child(&self) -> bool {
        self.children
            .iter()
            .filter_map(Weak::upgrade)
            .any(|child| child.cell.is_live())
    }

    pub(crate) fn adopt_child(&mut self, child: Weak<TxnInner>) {
        self.children.retain(|c| c.strong_count() > 0);
        self.children.push(child);
    }

    pub(crate) fn track_cursor(&mut self, cursor: Weak<CursorInner>) {
        self.cursors.retain(|c| c.strong_count() > 0);
        self.cursors.push(cursor);
    }

    /// Marks every nested transaction and bound cursor dead. Runs before the
    /// owner's lock is released, so nobody observes an ended transaction with
    /// a live dependent. Returns the database handles the descendants opened.
    fn invalidate_dependents(&mut self) -> Vec<ffi::MDB_dbi> {
        let mut dbis = Vec::new();
        for child in self.children.drain(..).filter_map(|c| c.upgrade()) {
            dbis.extend(child.detach());
        }
        for cursor in self.cursors.drain(..).filter_map(|c| c.upgrade()) {
            cursor.unbind();
        }
        dbis
    }
}

pub(crate) struct TxnInner {
    pub(crate) cell: HandleCell<ffi::MDB_txn, TxnState>,
    pub(crate) env: Environment,
    /// Keeps the parent alive for as long as the child exists
    parent: Option<Arc<TxnInner>>,
    pub(crate) read_only: bool,
    /// Engine transaction id, kept for diagnostics after the end
    id: AtomicU64,
}

impl TxnInner {
    pub(crate) fn new(
        env: Environment,
        parent: Option<Arc<TxnInner>>,
        txn: *mut ffi::MDB_txn,
        read_only: bool,
        holds_writer: bool,
    ) -> Self {
        let id = unsafe { ffi::mdb_txn_id(txn) } as u64;
        let state = TxnState {
            holds_writer,
            ..TxnState::default()
        };
        TxnInner {
            cell: HandleCell::new(HandleKind::Transaction, txn, state),
            env,
            parent,
            read_only,
            id: AtomicU64::new(id),
        }
    }

    /// Runs `f` if the transaction is live, not reset and has no live child.
    pub(crate) fn execute<R>(
        &self,
        f: impl FnOnce(*mut ffi::MDB_txn, &mut TxnState) -> Result<R>,
    ) -> Result<R> {
        self.cell.execute(|txn, state| {
            state.check_usable()?;
            f(txn, state)
        })
    }

    fn end(&self, mode: EndMode) -> Result<()> {
        let mut slot = self.cell.lock()?;
        let txn = match slot.take() {
            Some(txn) => txn,
            None => return Ok(()),
        };

        // a reset transaction has nothing left to commit
        let committing = mode == EndMode::Commit && !slot.state.reset;
        let outcome = if committing {
            // the engine frees the transaction even when commit fails
            lmdb_result(unsafe { ffi::mdb_txn_commit(txn) })
        } else {
            unsafe { ffi::mdb_txn_abort(txn) };
            Ok(())
        };

        let mut dbis = mem::take(&mut slot.state.new_dbis);
        dbis.extend(slot.state.invalidate_dependents());
        let holds_writer = mem::replace(&mut slot.state.holds_writer, false);
        drop(slot);

        match (&self.parent, committing && outcome.is_ok()) {
            (Some(parent), true) => parent.adopt_dbis(dbis),
            (None, true) => {}
            (_, false) => self.env.inner.dbs.discard(&dbis),
        }
        if holds_writer {
            self.env.inner.writer.release();
        }

        match &outcome {
            Ok(()) if committing => debug!("transaction {} committed", self.id()),
            Ok(()) => debug!("transaction {} aborted", self.id()),
            Err(err) => debug!("transaction {} failed to commit: {}", self.id(), err),
        }
        outcome
    }

    pub(crate) fn abort(&self) {
        // the native abort cannot fail; only a locked-out caller can
        if let Err(err) = self.end(EndMode::Abort) {
            warn!("transaction {} not aborted: {}", self.id(), err);
        }
    }

    /// Ends this transaction as part of its parent ending. The engine has
    /// already committed or aborted it together with the parent.
    fn detach(&self) -> Vec<ffi::MDB_dbi> {
        // the parent's lock was granted, so this one is too
        let Ok(mut slot) = self.cell.lock() else {
            return Vec::new();
        };
        if slot.take().is_none() {
            return Vec::new();
        }
        let mut dbis = mem::take(&mut slot.state.new_dbis);
        dbis.extend(slot.state.invalidate_dependents());
        dbis
    }

    /// Takes over handles opened by a committed child.
    fn adopt_dbis(&self, dbis: Vec<ffi::MDB_dbi>) {
        if dbis.is_empty() {
            return;
        }
        match self.cell.lock() {
            Ok(mut slot) if slot.is_live() => slot.state.new_dbis.extend(dbis),
            _ => self.env.inner.dbs.discard(&dbis),
        }
    }

    fn id(&self) -> u64 {
        self.id.load(AtomicOrdering::Relaxed)
    }
}

impl Drop for TxnInner {
    fn drop(&mut self) {
        if !self.cell.is_live() {
            return;
        }
        if self.read_only {
            debug!("read-only transaction {} dropped while live; aborting", self.id());
        } else {
            warn!(
                "write transaction {} dropped without commit or abort; aborting it",
                self.id()
            );
        }
        self.abort();
    }
}

/// Database transaction
///
/// Clones share one underlying transaction. `commit`, `abort` and `close`
/// may be called on any clone any number of times; only the first one
/// reaches the engine. When the last clone is dropped while the transaction
/// is still live it is aborted, never committed.
///
/// Transactions are bound to the thread that began them.
#[derive(Clone)]
pub struct Transaction {
    pub(crate) inner: Arc<TxnInner>,
    _not_send: PhantomData<*mut ()>,
}

impl Transaction {
    pub(crate) fn from_inner(inner: Arc<TxnInner>) -> Self {
        Transaction {
            inner,
            _not_send: PhantomData,
        }
    }

    /// Commits the transaction.
    ///
    /// Whatever the outcome, the transaction is dead afterwards and every
    /// cursor and nested transaction still open on it has been invalidated.
    /// A nested transaction folds its changes into the parent, which stays
    /// live. Calling it on an ended transaction is a no-op.
    pub fn commit(&self) -> Result<()> {
        self.inner.end(EndMode::Commit)
    }

    /// Discards the transaction's changes. No-op if it already ended.
    pub fn abort(&self) {
        self.inner.abort();
    }

    pub fn close(&self) {
        self.abort();
    }

    /// Suspends a read-only transaction, keeping its reader slot.
    ///
    /// Cursors bound to it are unbound and must be renewed after
    /// [`Transaction::renew`].
    pub fn reset(&self) -> Result<()> {
        let dbis = self.inner.cell.execute(|txn, state| {
            if !self.inner.read_only {
                return Err(Error::NotReadOnly);
            }
            if state.reset {
                return Ok(Vec::new());
            }
            unsafe { ffi::mdb_txn_reset(txn) };
            state.reset = true;
            let mut dbis = mem::take(&mut state.new_dbis);
            dbis.extend(state.invalidate_dependents());
            Ok(dbis)
        })?;
        self.inner.env.inner.dbs.discard(&dbis);
        Ok(())
    }

    /// Resumes a reset read-only transaction on a fresh snapshot.
    pub fn renew(&self) -> Result<()> {
        self.inner.cell.execute(|txn, state| {
            if !self.inner.read_only {
                return Err(Error::NotReadOnly);
            }
            if !state.reset {
                return Err(Error::InvalidArgument("transaction has not been reset"));
            }
            lmdb_result(unsafe { ffi::mdb_txn_renew(txn) })?;
            state.reset = false;
            let id = unsafe { ffi::mdb_txn_id(txn) } as u64;
            self.inner.id.store(id, AtomicOrdering::Relaxed);
            Ok(())
        })
    }

    /// Begins a transaction nested inside this one.
    pub fn begin_nested(&self, flags: TxnFlags) -> Result<Transaction> {
        self.inner.env.begin_txn(Some(self), flags)
    }

    /// Opens a handle to a database, the default one when `name` is `None`.
    ///
    /// The handle belongs to the environment. If this transaction is aborted
    /// or reset instead of committed, the engine forgets a handle it opened
    /// for the first time and the handle becomes stale.
    pub fn open_db(&self, name: Option<&str>, flags: DbFlags) -> Result<Database> {
        let c_name = name
            .map(CString::new)
            .transpose()
            .map_err(|_| Error::InvalidArgument("database name contains a NUL byte"))?;
        let env = &self.inner.env;
        self.inner.execute(|txn, state| {
            let name_ptr = c_name.as_ref().map_or(ptr::null(), |name| name.as_ptr());
            let mut dbi: ffi::MDB_dbi = 0;
            lmdb_result(unsafe { ffi::mdb_dbi_open(txn, name_ptr, flags.bits(), &mut dbi) })?;
            if env.inner.dbs.register(dbi, name, flags) {
                state.new_dbis.push(dbi);
            }
            Ok(Database::new(dbi, env.id()))
        })
    }

    /// Opens a database, creating it if necessary.
    pub fn create_db(&self, name: Option<&str>, flags: DbFlags) -> Result<Database> {
        self.open_db(name, flags | DbFlags::CREATE)
    }

    pub fn stat(&self, db: Database) -> Result<Stat> {
        self.read(db, |txn| {
            let mut stat: ffi::MDB_stat = unsafe { mem::zeroed() };
            lmdb_result(unsafe { ffi::mdb_stat(txn, db.dbi(), &mut stat) })?;
            Ok(Stat::from(stat))
        })
    }

    pub fn db_flags(&self, db: Database) -> Result<DbFlags> {
        self.read(db, |txn| {
            let mut flags: c_uint = 0;
            lmdb_result(unsafe { ffi::mdb_dbi_flags(txn, db.dbi(), &mut flags) })?;
            Ok(DbFlags::from_bits_truncate(flags))
        })
    }

    /// Empties the database, or deletes it and closes its handle when
    /// `delete` is set.
    pub fn drop_db(&self, db: Database, delete: bool) -> Result<()> {
        let env = &self.inner.env;
        self.inner.execute(|txn, state| {
            if self.inner.read_only {
                return Err(Error::ReadOnly);
            }
            env.check_db(db)?;
            lmdb_result(unsafe { ffi::mdb_drop(txn, db.dbi(), delete as c_int) })?;
            // the engine closes the handle right away; the core tables are
            // only emptied
            if delete && db.dbi() >= CORE_DBS {
                env.inner.dbs.unregister(db.dbi());
                state.new_dbis.retain(|dbi| *dbi != db.dbi());
            }
            Ok(())
        })
    }

    /// Gets an item from a database.
    ///
    /// Returns `Ok(None)` if the key is not present. The value is copied out
    /// of the map before returning.
    pub fn get(&self, db: Database, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.read(db, |txn| {
            let mut key_val = value::to_val(key);
            let mut data_val = value::absent();
            match unsafe { ffi::mdb_get(txn, db.dbi(), &mut key_val, &mut data_val) } {
                ffi::MDB_SUCCESS => Ok(Some(unsafe { value::copy_out(&data_val) })),
                ffi::MDB_NOTFOUND => Ok(None),
                code => Err(Error::from_code(code)),
            }
        })
    }

    /// Stores an item into a database.
    pub fn put(&self, db: Database, key: &[u8], data: &[u8], flags: WriteFlags) -> Result<()> {
        self.write(db, |txn| {
            if flags.intersects(UNSUPPORTED_PUT_FLAGS) {
                return Err(Error::InvalidArgument(
                    "RESERVE and MULTIPLE are not accepted by put",
                ));
            }
            let mut key_val = value::to_val(key);
            let mut data_val = value::to_val(data);
            lmdb_result(unsafe {
                ffi::mdb_put(txn, db.dbi(), &mut key_val, &mut data_val, flags.bits())
            })
        })
    }

    /// Reserves `len` bytes for the value at `key` and lets `fill` write
    /// them. The buffer is engine memory and is only valid inside `fill`.
    ///
    /// `fill` runs with the transaction locked and must not use any handle
    /// of this crate: such calls fail with `Error::Reentrant`.
    pub fn put_reserved(
        &self,
        db: Database,
        key: &[u8],
        len: usize,
        flags: WriteFlags,
        fill: impl FnOnce(&mut [u8]),
    ) -> Result<()> {
        self.write(db, |txn| {
            if flags.contains(WriteFlags::MULTIPLE) {
                return Err(Error::InvalidArgument("MULTIPLE cannot be combined with RESERVE"));
            }
            let mut key_val = value::to_val(key);
            let mut data_val = ffi::MDB_val {
                mv_size: len,
                mv_data: ptr::null_mut(),
            };
            let flags = flags | WriteFlags::RESERVE;
            lmdb_result(unsafe {
                ffi::mdb_put(txn, db.dbi(), &mut key_val, &mut data_val, flags.bits())
            })?;
            if data_val.mv_size == 0 || data_val.mv_data.is_null() {
                handle::run_callback(|| fill(&mut []));
            } else {
                let buf = unsafe {
                    slice::from_raw_parts_mut(data_val.mv_data as *mut u8, data_val.mv_size)
                };
                handle::run_callback(|| fill(buf));
            }
            Ok(())
        })
    }

    /// Deletes items from a database.
    ///
    /// With `data` given only the matching duplicate is removed, otherwise
    /// every value of `key`. Returns false if nothing matched.
    pub fn del(&self, db: Database, key: &[u8], data: Option<&[u8]>) -> Result<bool> {
        self.write(db, |txn| {
            let mut key_val = value::to_val(key);
            let mut data_val = data.map(value::to_val);
            let data_ptr = value::opt_ptr(&mut data_val);
            match unsafe { ffi::mdb_del(txn, db.dbi(), &mut key_val, data_ptr) } {
                ffi::MDB_SUCCESS => Ok(true),
                ffi::MDB_NOTFOUND => Ok(false),
                code => Err(Error::from_code(code)),
            }
        })
    }

    /// Compares two keys with the database's key ordering.
    pub fn cmp(&self, db: Database, a: &[u8], b: &[u8]) -> Result<Ordering> {
        self.read(db, |txn| {
            let a = value::to_val(a);
            let b = value::to_val(b);
            Ok(unsafe { ffi::mdb_cmp(txn, db.dbi(), &a, &b) }.cmp(&0))
        })
    }

    /// Compares two values with the database's duplicate ordering.
    pub fn dcmp(&self, db: Database, a: &[u8], b: &[u8]) -> Result<Ordering> {
        self.read(db, |txn| {
            let a = value::to_val(a);
            let b = value::to_val(b);
            Ok(unsafe { ffi::mdb_dcmp(txn, db.dbi(), &a, &b) }.cmp(&0))
        })
    }

    /// The engine's transaction id. Remains readable after the transaction
    /// has ended.
    pub fn id(&self) -> u64 {
        self.inner.id()
    }

    /// Opens a cursor on `db`, bound to this transaction.
    pub fn open_cursor(&self, db: Database) -> Result<Cursor> {
        let env = &self.inner.env;
        self.inner.execute(|txn, state| {
            env.check_db(db)?;
            let mut cursor: *mut ffi::MDB_cursor = ptr::null_mut();
            lmdb_result(unsafe { ffi::mdb_cursor_open(txn, db.dbi(), &mut cursor) })?;
            let inner = Arc::new(CursorInner::new(
                cursor,
                Arc::downgrade(&self.inner),
                db,
                env.clone(),
                self.inner.read_only,
            ));
            state.track_cursor(Arc::downgrade(&inner));
            env.inner.track_cursor(Arc::downgrade(&inner));
            Ok(Cursor::from_inner(inner))
        })
    }

    /// Rebinds a cursor whose transaction ended or was reset to this one.
    pub fn renew_cursor(&self, cursor: &Cursor) -> Result<()> {
        cursor.renew(self)
    }

    pub fn env(&self) -> Environment {
        self.inner.env.clone()
    }

    pub fn parent(&self) -> Option<Transaction> {
        self.inner.parent.clone().map(Transaction::from_inner)
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.read_only
    }

    pub fn is_live(&self) -> bool {
        self.inner.cell.is_live()
    }

    pub fn is_reset(&self) -> bool {
        self.inner.cell.lock().map_or(false, |slot| slot.state.reset)
    }

    fn read<R>(&self, db: Database, f: impl FnOnce(*mut ffi::MDB_txn) -> Result<R>) -> Result<R> {
        self.inner.execute(|txn, _| {
            self.inner.env.check_db(db)?;
            f(txn)
        })
    }

    fn write<R>(&self, db: Database, f: impl FnOnce(*mut ffi::MDB_txn) -> Result<R>) -> Result<R> {
        self.inner.execute(|txn, _| {
            if self.inner.read_only {
                return Err(Error::ReadOnly);
            }
            self.inner.env.check_db(db)?;
            f(txn)
        })
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id())
            .field("read_only", &self.inner.read_only)
            .field("live", &self.is_live())
            .finish_non_exhaustive()
    }
}
