//! Safe handle-lifecycle bindings over LMDB.
//!
//! Environments, transactions and cursors are reference-counted handles that
//! check liveness on every call. Ending a transaction invalidates its nested
//! transactions and cursors, closing an environment ends everything opened
//! from it, and dropping the last clone of a live handle releases it. A
//! read-write transaction is never committed implicitly.
//!
//! ```no_run
//! use lightning::{DbFlags, Environment, WriteFlags};
//!
//! # fn main() -> lightning::Result<()> {
//! let env = Environment::builder().set_max_dbs(4).open("/tmp/store".as_ref())?;
//! let txn = env.begin_rw_txn()?;
//! let db = txn.create_db(Some("users"), DbFlags::empty())?;
//! txn.put(db, b"alice", b"1", WriteFlags::empty())?;
//! txn.commit()?;
//! # Ok(())
//! # }
//! ```

mod constants;
mod cursor;
mod database;
mod env;
mod error;
mod handle;
mod transaction;
mod types;
mod value;

pub use constants::{CopyFlags, DbFlags, EnvFlags, TxnFlags, WriteFlags, DEFAULT_FILE_MODE};
pub use cursor::Cursor;
pub use database::{Database, DbInfo};
pub use env::{Environment, EnvironmentBuilder, WriterPolicy};
pub use error::{strerror, version, Error, HandleKind, Result, Status};
pub use transaction::Transaction;
pub use types::{CursorOp, Info, Stat};
pub use value::Pair;
