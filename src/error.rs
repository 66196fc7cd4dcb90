use std::ffi::CStr;
use std::fmt;
use std::os::raw::c_int;
use std::result;

use lmdb_sys as ffi;
use once_cell::sync::Lazy;

/// Custom result type for binding operations
pub type Result<T> = result::Result<T, Error>;

/// The kind of handle an operation was attempted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Environment,
    Transaction,
    Database,
    Cursor,
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandleKind::Environment => "environment",
            HandleKind::Transaction => "transaction",
            HandleKind::Database => "database",
            HandleKind::Cursor => "cursor",
        };
        f.write_str(name)
    }
}

/// LMDB status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Key/data pair already exists
    KeyExist,
    /// No matching key/data pair found
    NotFound,
    /// Requested page not found
    PageNotFound,
    /// Located page was wrong type
    Corrupted,
    /// Update of meta page failed or environment had fatal error
    Panic,
    /// Environment version mismatch
    VersionMismatch,
    /// File is not a valid LMDB file
    Invalid,
    /// Environment mapsize reached
    MapFull,
    /// Environment maxdbs reached
    DbsFull,
    /// Environment maxreaders reached
    ReadersFull,
    /// Too many TLS keys in use
    TlsFull,
    /// Transaction has too many dirty pages
    TxnFull,
    /// Cursor stack too deep
    CursorFull,
    /// Page has not enough space
    PageFull,
    /// Database contents grew beyond environment mapsize
    MapResized,
    /// Operation and DB incompatible, or DB flags changed
    Incompatible,
    /// Invalid reuse of reader locktable slot
    BadRslot,
    /// Transaction must abort, has a child, or is invalid
    BadTxn,
    /// Unsupported size of key/DB name/data, or wrong DUPFIXED size
    BadValSize,
    /// The specified DBI was changed unexpectedly
    BadDbi,
    /// A system error number
    Other(c_int),
}

impl Status {
    pub fn from_code(code: c_int) -> Status {
        match code {
            ffi::MDB_KEYEXIST => Status::KeyExist,
            ffi::MDB_NOTFOUND => Status::NotFound,
            ffi::MDB_PAGE_NOTFOUND => Status::PageNotFound,
            ffi::MDB_CORRUPTED => Status::Corrupted,
            ffi::MDB_PANIC => Status::Panic,
            ffi::MDB_VERSION_MISMATCH => Status::VersionMismatch,
            ffi::MDB_INVALID => Status::Invalid,
            ffi::MDB_MAP_FULL => Status::MapFull,
            ffi::MDB_DBS_FULL => Status::DbsFull,
            ffi::MDB_READERS_FULL => Status::ReadersFull,
            ffi::MDB_TLS_FULL => Status::TlsFull,
            ffi::MDB_TXN_FULL => Status::TxnFull,
            ffi::MDB_CURSOR_FULL => Status::CursorFull,
            ffi::MDB_PAGE_FULL => Status::PageFull,
            ffi::MDB_MAP_RESIZED => Status::MapResized,
            ffi::MDB_INCOMPATIBLE => Status::Incompatible,
            ffi::MDB_BAD_RSLOT => Status::BadRslot,
            ffi::MDB_BAD_TXN => Status::BadTxn,
            ffi::MDB_BAD_VALSIZE => Status::BadValSize,
            ffi::MDB_BAD_DBI => Status::BadDbi,
            other => Status::Other(other),
        }
    }

    pub fn code(self) -> c_int {
        match self {
            Status::KeyExist => ffi::MDB_KEYEXIST,
            Status::NotFound => ffi::MDB_NOTFOUND,
            Status::PageNotFound => ffi::MDB_PAGE_NOTFOUND,
            Status::Corrupted => ffi::MDB_CORRUPTED,
            Status::Panic => ffi::MDB_PANIC,
            Status::VersionMismatch => ffi::MDB_VERSION_MISMATCH,
            Status::Invalid => ffi::MDB_INVALID,
            Status::MapFull => ffi::MDB_MAP_FULL,
            Status::DbsFull => ffi::MDB_DBS_FULL,
            Status::ReadersFull => ffi::MDB_READERS_FULL,
            Status::TlsFull => ffi::MDB_TLS_FULL,
            Status::TxnFull => ffi::MDB_TXN_FULL,
            Status::CursorFull => ffi::MDB_CURSOR_FULL,
            Status::PageFull => ffi::MDB_PAGE_FULL,
            Status::MapResized => ffi::MDB_MAP_RESIZED,
            Status::Incompatible => ffi::MDB_INCOMPATIBLE,
            Status::BadRslot => ffi::MDB_BAD_RSLOT,
            Status::BadTxn => ffi::MDB_BAD_TXN,
            Status::BadValSize => ffi::MDB_BAD_VALSIZE,
            Status::BadDbi => ffi::MDB_BAD_DBI,
            Status::Other(code) => code,
        }
    }
}

/// Errors reported by the binding layer.
///
/// Misuse of a handle (closed handle, wrong transaction mode, missing
/// argument) is reported without calling into the engine. Engine failures
/// carry the native status and its canonical message unchanged. A lookup
/// that finds nothing is not an error: it is `Ok(None)`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("{0} handle is closed")]
    Stale(HandleKind),
    #[error("environment has not been opened")]
    NotOpen,
    #[error("operation requires a read-write transaction")]
    ReadOnly,
    #[error("operation requires a read-only transaction")]
    NotReadOnly,
    #[error("transaction has been reset and must be renewed first")]
    TxnReset,
    #[error("transaction has an active child transaction")]
    HasChild,
    #[error("handles belong to different environments")]
    EnvMismatch,
    #[error("another write transaction is active on this environment")]
    WriterBusy,
    #[error("{0} handle used from inside a callback running under a handle lock")]
    Reentrant(HandleKind),
    #[error("missing required argument: {0}")]
    MissingArgument(&'static str),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("{message}")]
    Native { status: Status, message: String },
}

impl Error {
    pub(crate) fn from_code(code: c_int) -> Error {
        Error::Native {
            status: Status::from_code(code),
            message: strerror(code),
        }
    }

    /// The native status code, if the engine reported this error.
    pub fn code(&self) -> Option<c_int> {
        match self {
            Error::Native { status, .. } => Some(status.code()),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<Status> {
        match self {
            Error::Native { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether the error indicates misuse by the caller rather than an
    /// engine or contention failure.
    pub fn is_programming(&self) -> bool {
        !matches!(self, Error::Native { .. } | Error::WriterBusy)
    }
}

/// Converts a native return code into a `Result`.
pub(crate) fn lmdb_result(code: c_int) -> Result<()> {
    if code == ffi::MDB_SUCCESS {
        Ok(())
    } else {
        Err(Error::from_code(code))
    }
}

/// Canonical message for a native status code.
pub fn strerror(code: c_int) -> String {
    // mdb_strerror returns a pointer to a static string (or to strerror's
    // buffer for system errors), copied before returning
    unsafe {
        let msg = ffi::mdb_strerror(code);
        if msg.is_null() {
            return format!("unknown error code {}", code);
        }
        CStr::from_ptr(msg).to_string_lossy().into_owned()
    }
}

static VERSION: Lazy<String> = Lazy::new(|| unsafe {
    let ver = ffi::mdb_version(std::ptr::null_mut(), std::ptr::null_mut(), std::ptr::null_mut());
    if ver.is_null() {
        String::new()
    } else {
        CStr::from_ptr(ver).to_string_lossy().into_owned()
    }
});

/// Version string of the linked engine.
pub fn version() -> &'static str {
    VERSION.as_str()
}
