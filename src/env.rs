use std::ffi::{CStr, CString};
use std::fmt;
use std::mem;
use std::os::raw::{c_char, c_int, c_uint};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use lmdb_sys as ffi;
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::constants::{CopyFlags, EnvFlags, TxnFlags, DEFAULT_FILE_MODE, FORCED_ENV_FLAGS};
use crate::cursor::CursorInner;
use crate::database::{Database, DbInfo, DbRegistry};
use crate::error::{lmdb_result, Error, HandleKind, Result};
use crate::handle::HandleCell;
use crate::transaction::{Transaction, TxnInner};
use crate::types::{Info, Stat};

/// What `begin_txn` does when another thread holds the write transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriterPolicy {
    /// Wait until the active writer commits or aborts.
    #[default]
    Block,
    /// Fail immediately with `Error::WriterBusy`.
    FailFast,
}

enum Claim {
    Acquired,
    AlreadyHeld,
}

struct WriterState {
    holder: Option<ThreadId>,
    policy: WriterPolicy,
}

/// The environment's single write-transaction permit.
pub(crate) struct WriterSlot {
    state: Mutex<WriterState>,
    released: Condvar,
}

impl WriterSlot {
    fn new() -> Self {
        WriterSlot {
            state: Mutex::new(WriterState {
                holder: None,
                policy: WriterPolicy::default(),
            }),
            released: Condvar::new(),
        }
    }

    fn acquire(&self) -> Result<()> {
        match self.claim()? {
            Claim::Acquired => Ok(()),
            // waiting on ourselves would never return
            Claim::AlreadyHeld => Err(Error::WriterBusy),
        }
    }

    /// Waits, per policy, until no other thread holds the slot, then takes
    /// it if it is free.
    fn claim(&self) -> Result<Claim> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        loop {
            match state.holder {
                None => {
                    state.holder = Some(me);
                    return Ok(Claim::Acquired);
                }
                Some(holder) if holder == me => return Ok(Claim::AlreadyHeld),
                Some(_) => match state.policy {
                    WriterPolicy::FailFast => return Err(Error::WriterBusy),
                    WriterPolicy::Block => self.released.wait(&mut state),
                },
            }
        }
    }

    pub(crate) fn release(&self) {
        self.state.lock().holder = None;
        // writers and closers wait on the same condvar
        self.released.notify_all();
    }

    fn set_policy(&self, policy: WriterPolicy) {
        self.state.lock().policy = policy;
    }

    fn is_held(&self) -> bool {
        self.state.lock().holder.is_some()
    }
}

#[derive(Default)]
pub(crate) struct EnvState {
    /// Set once `open` succeeded
    opened: bool,
    /// Root transactions, for cascade on close
    txns: Vec<Weak<TxnInner>>,
}

pub(crate) struct EnvInner {
    pub(crate) cell: HandleCell<ffi::MDB_env, EnvState>,
    pub(crate) writer: WriterSlot,
    pub(crate) dbs: DbRegistry,
    /// Every cursor opened in this environment. Read-only cursors outlive
    /// their transaction and must be released before the environment.
    cursors: Mutex<Vec<Weak<CursorInner>>>,
    /// Process-unique identity, never reused
    id: usize,
}

static NEXT_ENV_ID: AtomicUsize = AtomicUsize::new(1);

impl EnvInner {
    /// Closes the environment once no other thread holds a write
    /// transaction. The writer slot is held for the duration so no new
    /// writer can begin.
    fn close(&self) -> Result<()> {
        if !self.cell.lock()?.is_live() {
            return Ok(());
        }
        // a write transaction may only be ended by the thread that began it
        let claim = self.writer.claim()?;
        let result = self.close_locked();
        if let Claim::Acquired = claim {
            self.writer.release();
        }
        result
    }

    fn close_locked(&self) -> Result<()> {
        let mut slot = self.cell.lock()?;
        let env = match slot.ptr() {
            Some(env) => env,
            None => return Ok(()),
        };

        let txns: Vec<_> = slot.state.txns.drain(..).filter_map(|txn| txn.upgrade()).collect();
        for txn in &txns {
            if txn.cell.is_live() {
                warn!("closing environment with a live transaction; aborting it");
                txn.abort();
            }
        }
        drop(txns);

        let cursors = mem::take(&mut *self.cursors.lock());
        for cursor in cursors.iter().filter_map(Weak::upgrade) {
            cursor.release();
        }

        slot.take();
        slot.state.opened = false;
        unsafe { ffi::mdb_env_close(env) };
        self.dbs.clear();
        debug!("environment closed");
        Ok(())
    }

    pub(crate) fn track_cursor(&self, cursor: Weak<CursorInner>) {
        let mut cursors = self.cursors.lock();
        cursors.retain(|c| c.strong_count() > 0);
        cursors.push(cursor);
    }
}

impl Drop for EnvInner {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!("environment not closed on drop: {}", err);
        }
    }
}

/// LMDB environment
///
/// A cheap, cloneable handle to one environment. The environment is released
/// by an explicit [`Environment::close`] on any clone, or when the last clone
/// and every transaction and cursor created from it have been dropped.
#[derive(Clone)]
pub struct Environment {
    pub(crate) inner: Arc<EnvInner>,
}

impl Environment {
    /// Allocates a native environment that is not yet bound to a path.
    pub fn create() -> Result<Environment> {
        let mut env: *mut ffi::MDB_env = ptr::null_mut();
        lmdb_result(unsafe { ffi::mdb_env_create(&mut env) })?;
        Ok(Environment {
            inner: Arc::new(EnvInner {
                cell: HandleCell::new(HandleKind::Environment, env, EnvState::default()),
                writer: WriterSlot::new(),
                dbs: DbRegistry::default(),
                cursors: Mutex::new(Vec::new()),
                id: NEXT_ENV_ID.fetch_add(1, Ordering::Relaxed),
            }),
        })
    }

    pub fn builder() -> EnvironmentBuilder {
        EnvironmentBuilder::default()
    }

    /// Binds the environment to `path`.
    ///
    /// On failure the native handle is released, as the engine requires, and
    /// the environment is closed.
    pub fn open(&self, path: &Path, flags: EnvFlags, mode: u32) -> Result<()> {
        let c_path = path_to_cstring(path)?;
        let result = self.inner.cell.execute(|env, state| {
            if state.opened {
                return Err(Error::InvalidArgument("environment is already open"));
            }
            let flags = flags | FORCED_ENV_FLAGS;
            lmdb_result(unsafe {
                ffi::mdb_env_open(env, c_path.as_ptr(), flags.bits(), mode as ffi::mode_t)
            })?;
            state.opened = true;
            Ok(())
        });
        match result {
            Ok(()) => {
                debug!("environment opened at {}", path.display());
                Ok(())
            }
            Err(err @ Error::Native { .. }) => {
                debug!("opening environment at {} failed: {}", path.display(), err);
                if let Err(close_err) = self.inner.close() {
                    warn!("environment not released after failed open: {}", close_err);
                }
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Copies the environment to an existing, empty directory.
    pub fn copy(&self, path: &Path) -> Result<()> {
        self.copy_with_flags(path, CopyFlags::empty())
    }

    /// Copies the environment, omitting free pages.
    pub fn copy_compact(&self, path: &Path) -> Result<()> {
        self.copy_with_flags(path, CopyFlags::COMPACT)
    }

    pub fn copy_with_flags(&self, path: &Path, flags: CopyFlags) -> Result<()> {
        let c_path = path_to_cstring(path)?;
        self.with_open(|env| {
            lmdb_result(unsafe { ffi::mdb_env_copy2(env, c_path.as_ptr(), flags.bits()) })
        })
    }

    pub fn stat(&self) -> Result<Stat> {
        self.with_open(|env| {
            let mut stat: ffi::MDB_stat = unsafe { mem::zeroed() };
            lmdb_result(unsafe { ffi::mdb_env_stat(env, &mut stat) })?;
            Ok(Stat::from(stat))
        })
    }

    pub fn info(&self) -> Result<Info> {
        self.with_open(|env| {
            let mut info: ffi::MDB_envinfo = unsafe { mem::zeroed() };
            lmdb_result(unsafe { ffi::mdb_env_info(env, &mut info) })?;
            Ok(Info::from(info))
        })
    }

    /// Flushes buffers to disk. `force` syncs even under `NOSYNC`/`MAPASYNC`.
    pub fn sync(&self, force: bool) -> Result<()> {
        self.with_open(|env| lmdb_result(unsafe { ffi::mdb_env_sync(env, force as c_int) }))
    }

    /// Turns the given flags on or off.
    pub fn set_flags(&self, flags: EnvFlags, on: bool) -> Result<()> {
        self.inner.cell.execute(|env, _| {
            lmdb_result(unsafe { ffi::mdb_env_set_flags(env, flags.bits(), on as c_int) })
        })
    }

    pub fn flags(&self) -> Result<EnvFlags> {
        self.inner.cell.execute(|env, _| {
            let mut flags: c_uint = 0;
            lmdb_result(unsafe { ffi::mdb_env_get_flags(env, &mut flags) })?;
            Ok(EnvFlags::from_bits_truncate(flags))
        })
    }

    pub fn path(&self) -> Result<PathBuf> {
        self.with_open(|env| {
            let mut path: *const c_char = ptr::null();
            lmdb_result(unsafe { ffi::mdb_env_get_path(env, &mut path) })?;
            if path.is_null() {
                return Err(Error::NotOpen);
            }
            let bytes = unsafe { CStr::from_ptr(path) }.to_bytes();
            Ok(PathBuf::from(std::ffi::OsStr::from_bytes(bytes)))
        })
    }

    pub fn set_map_size(&self, size: usize) -> Result<()> {
        self.inner
            .cell
            .execute(|env, _| lmdb_result(unsafe { ffi::mdb_env_set_mapsize(env, size) }))
    }

    /// Sets the number of named databases. Only valid before `open`.
    pub fn set_max_dbs(&self, dbs: u32) -> Result<()> {
        self.inner
            .cell
            .execute(|env, _| lmdb_result(unsafe { ffi::mdb_env_set_maxdbs(env, dbs) }))
    }

    /// Sets the reader slot budget. Only valid before `open`.
    pub fn set_max_readers(&self, readers: u32) -> Result<()> {
        self.inner
            .cell
            .execute(|env, _| lmdb_result(unsafe { ffi::mdb_env_set_maxreaders(env, readers) }))
    }

    pub fn max_readers(&self) -> Result<u32> {
        self.inner.cell.execute(|env, _| {
            let mut readers: c_uint = 0;
            lmdb_result(unsafe { ffi::mdb_env_get_maxreaders(env, &mut readers) })?;
            Ok(readers)
        })
    }

    pub fn max_key_size(&self) -> Result<usize> {
        self.with_open(|env| Ok(unsafe { ffi::mdb_env_get_maxkeysize(env) } as usize))
    }

    /// Clears reader slots left behind by dead processes, returning how many
    /// were cleared.
    pub fn reader_check(&self) -> Result<usize> {
        self.with_open(|env| {
            let mut dead: c_int = 0;
            lmdb_result(unsafe { ffi::mdb_reader_check(env, &mut dead) })?;
            Ok(dead as usize)
        })
    }

    pub fn set_writer_policy(&self, policy: WriterPolicy) {
        self.inner.writer.set_policy(policy);
    }

    /// Closes the environment. Live transactions are aborted and cursors
    /// released first; every handle derived from this environment reports
    /// `Error::Stale` afterwards. Calling it again is a no-op.
    ///
    /// A write transaction begun on another thread is never aborted from
    /// here: `close` waits for it to end, or fails with `WriterBusy` under
    /// [`WriterPolicy::FailFast`].
    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }

    pub fn is_live(&self) -> bool {
        self.inner.cell.is_live()
    }

    pub fn is_open(&self) -> bool {
        self.inner.cell.lock().map_or(false, |slot| slot.state.opened)
    }

    /// Whether a root write transaction currently holds the writer slot.
    pub fn has_writer(&self) -> bool {
        self.inner.writer.is_held()
    }

    /// Begins a transaction, nested under `parent` when given.
    pub fn begin_txn(&self, parent: Option<&Transaction>, flags: TxnFlags) -> Result<Transaction> {
        match parent {
            Some(parent) => self.begin_nested(parent, flags),
            None => self.begin_root(flags),
        }
    }

    pub fn begin_ro_txn(&self) -> Result<Transaction> {
        self.begin_root(TxnFlags::RDONLY)
    }

    pub fn begin_rw_txn(&self) -> Result<Transaction> {
        self.begin_root(TxnFlags::empty())
    }

    fn begin_root(&self, flags: TxnFlags) -> Result<Transaction> {
        let read_only = flags.contains(TxnFlags::RDONLY);
        if !self.is_live() {
            return Err(Error::Stale(HandleKind::Environment));
        }
        if !read_only {
            self.inner.writer.acquire()?;
        }
        let result = self.inner.cell.execute(|env, state| {
            if !state.opened {
                return Err(Error::NotOpen);
            }
            let mut txn: *mut ffi::MDB_txn = ptr::null_mut();
            lmdb_result(unsafe { ffi::mdb_txn_begin(env, ptr::null_mut(), flags.bits(), &mut txn) })?;
            let inner = Arc::new(TxnInner::new(self.clone(), None, txn, read_only, !read_only));
            state.txns.retain(|t| t.strong_count() > 0);
            state.txns.push(Arc::downgrade(&inner));
            Ok(Transaction::from_inner(inner))
        });
        match &result {
            Ok(_) => debug!("began root {} transaction", if read_only { "read-only" } else { "write" }),
            Err(_) if !read_only => self.inner.writer.release(),
            Err(_) => {}
        }
        result
    }

    fn begin_nested(&self, parent: &Transaction, flags: TxnFlags) -> Result<Transaction> {
        if !Arc::ptr_eq(&parent.inner.env.inner, &self.inner) {
            return Err(Error::EnvMismatch);
        }
        self.inner.cell.execute(|env, state| {
            if !state.opened {
                return Err(Error::NotOpen);
            }
            parent.inner.cell.execute(|parent_txn, parent_state| {
                parent_state.check_usable()?;
                if parent.inner.read_only {
                    return Err(Error::ReadOnly);
                }
                if flags.contains(TxnFlags::RDONLY) {
                    return Err(Error::InvalidArgument(
                        "nested transactions inherit the parent's read-write mode",
                    ));
                }
                let mut txn: *mut ffi::MDB_txn = ptr::null_mut();
                lmdb_result(unsafe { ffi::mdb_txn_begin(env, parent_txn, flags.bits(), &mut txn) })?;
                let child = Arc::new(TxnInner::new(
                    self.clone(),
                    Some(Arc::clone(&parent.inner)),
                    txn,
                    false,
                    false,
                ));
                parent_state.adopt_child(Arc::downgrade(&child));
                debug!("began nested write transaction");
                Ok(Transaction::from_inner(child))
            })
        })
    }

    /// Closes a database handle. Normally unnecessary; the caller must not
    /// use the handle in any transaction afterwards.
    pub fn close_dbi(&self, db: Database) -> Result<()> {
        if db.env_id() != self.id() {
            return Err(Error::EnvMismatch);
        }
        self.inner.cell.execute(|env, _| {
            if self.inner.dbs.unregister(db.dbi()) {
                unsafe { ffi::mdb_dbi_close(env, db.dbi()) };
            }
            Ok(())
        })
    }

    /// Name and flags the handle was opened with, if it is still open.
    pub fn db_info(&self, db: Database) -> Option<DbInfo> {
        if db.env_id() != self.id() {
            return None;
        }
        self.inner.dbs.info(db.dbi())
    }

    pub(crate) fn id(&self) -> usize {
        self.inner.id
    }

    pub(crate) fn check_db(&self, db: Database) -> Result<()> {
        if db.env_id() != self.id() {
            return Err(Error::EnvMismatch);
        }
        if !self.inner.dbs.contains(db.dbi()) {
            return Err(Error::Stale(HandleKind::Database));
        }
        Ok(())
    }

    pub(crate) fn same_env(&self, other: &Environment) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn with_open<R>(&self, f: impl FnOnce(*mut ffi::MDB_env) -> Result<R>) -> Result<R> {
        self.inner.cell.execute(|env, state| {
            if !state.opened {
                return Err(Error::NotOpen);
            }
            f(env)
        })
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("live", &self.is_live())
            .finish_non_exhaustive()
    }
}

fn path_to_cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::InvalidArgument("path contains a NUL byte"))
}

/// Options for creating and opening an environment in one step.
#[derive(Debug, Clone)]
pub struct EnvironmentBuilder {
    flags: EnvFlags,
    mode: u32,
    map_size: Option<usize>,
    max_dbs: Option<u32>,
    max_readers: Option<u32>,
    writer_policy: WriterPolicy,
}

impl Default for EnvironmentBuilder {
    fn default() -> Self {
        EnvironmentBuilder {
            flags: EnvFlags::empty(),
            mode: DEFAULT_FILE_MODE,
            map_size: None,
            max_dbs: None,
            max_readers: None,
            writer_policy: WriterPolicy::default(),
        }
    }
}

impl EnvironmentBuilder {
    pub fn set_flags(&mut self, flags: EnvFlags) -> &mut Self {
        self.flags = flags;
        self
    }

    /// File mode for the data and lock files.
    pub fn set_mode(&mut self, mode: u32) -> &mut Self {
        self.mode = mode;
        self
    }

    pub fn set_map_size(&mut self, size: usize) -> &mut Self {
        self.map_size = Some(size);
        self
    }

    pub fn set_max_dbs(&mut self, dbs: u32) -> &mut Self {
        self.max_dbs = Some(dbs);
        self
    }

    pub fn set_max_readers(&mut self, readers: u32) -> &mut Self {
        self.max_readers = Some(readers);
        self
    }

    pub fn set_writer_policy(&mut self, policy: WriterPolicy) -> &mut Self {
        self.writer_policy = policy;
        self
    }

    pub fn open(&self, path: &Path) -> Result<Environment> {
        let env = Environment::create()?;
        if let Some(size) = self.map_size {
            env.set_map_size(size)?;
        }
        if let Some(dbs) = self.max_dbs {
            env.set_max_dbs(dbs)?;
        }
        if let Some(readers) = self.max_readers {
            env.set_max_readers(readers)?;
        }
        env.set_writer_policy(self.writer_policy);
        env.open(path, self.flags, self.mode)?;
        Ok(env)
    }
}
