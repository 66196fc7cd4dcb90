use bitflags::bitflags;
use lmdb_sys as ffi;

// Environment flags
bitflags! {
    /// Flags accepted by `Environment::open` and `Environment::set_flags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EnvFlags: u32 {
        const FIXEDMAP = ffi::MDB_FIXEDMAP;
        const NOSUBDIR = ffi::MDB_NOSUBDIR;
        const NOSYNC = ffi::MDB_NOSYNC;
        const RDONLY = ffi::MDB_RDONLY;
        const NOMETASYNC = ffi::MDB_NOMETASYNC;
        const WRITEMAP = ffi::MDB_WRITEMAP;
        const MAPASYNC = ffi::MDB_MAPASYNC;
        const NOTLS = ffi::MDB_NOTLS;
        const NOLOCK = ffi::MDB_NOLOCK;
        const NORDAHEAD = ffi::MDB_NORDAHEAD;
        const NOMEMINIT = ffi::MDB_NOMEMINIT;
    }
}

// Database flags
bitflags! {
    /// Flags accepted by `Transaction::open_db`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DbFlags: u32 {
        const REVERSEKEY = ffi::MDB_REVERSEKEY;
        const DUPSORT = ffi::MDB_DUPSORT;
        const INTEGERKEY = ffi::MDB_INTEGERKEY;
        const DUPFIXED = ffi::MDB_DUPFIXED;
        const INTEGERDUP = ffi::MDB_INTEGERDUP;
        const REVERSEDUP = ffi::MDB_REVERSEDUP;
        const CREATE = ffi::MDB_CREATE;
    }
}

// Write operation flags
bitflags! {
    /// Flags accepted by the put and delete operations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct WriteFlags: u32 {
        const NOOVERWRITE = ffi::MDB_NOOVERWRITE;
        const NODUPDATA = ffi::MDB_NODUPDATA;
        const CURRENT = ffi::MDB_CURRENT;
        const RESERVE = ffi::MDB_RESERVE;
        const APPEND = ffi::MDB_APPEND;
        const APPENDDUP = ffi::MDB_APPENDDUP;
        const MULTIPLE = ffi::MDB_MULTIPLE;
    }
}

// Transaction flags
bitflags! {
    /// Flags accepted by `Environment::begin_txn`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TxnFlags: u32 {
        const RDONLY = EnvFlags::RDONLY.bits();
        const NOSYNC = EnvFlags::NOSYNC.bits();
        const NOMETASYNC = EnvFlags::NOMETASYNC.bits();
    }
}

// Copy operation flags
bitflags! {
    /// Flags accepted by `Environment::copy_with_flags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CopyFlags: u32 {
        const COMPACT = ffi::MDB_CP_COMPACT;
    }
}

/// Default file mode for newly created data and lock files.
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// Flags always added when an environment is opened. Reader slots are tied
/// to transactions so that one thread may hold several read-only
/// transactions and cycle them through reset/renew.
pub(crate) const FORCED_ENV_FLAGS: EnvFlags = EnvFlags::NOTLS;

/// Write flags that hand engine memory back to the caller and so cannot go
/// through the plain put path.
pub(crate) const UNSUPPORTED_PUT_FLAGS: WriteFlags =
    WriteFlags::RESERVE.union(WriteFlags::MULTIPLE);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_bits_match_native_values() {
        assert_eq!(EnvFlags::RDONLY.bits(), 0x20000);
        assert_eq!(EnvFlags::NOSUBDIR.bits(), 0x4000);
        assert_eq!(DbFlags::DUPSORT.bits(), 0x04);
        assert_eq!(DbFlags::CREATE.bits(), 0x40000);
        assert_eq!(WriteFlags::NOOVERWRITE.bits(), 0x10);
        assert_eq!(TxnFlags::RDONLY.bits(), EnvFlags::RDONLY.bits());
    }

    #[test]
    fn unsupported_put_flags() {
        assert!(UNSUPPORTED_PUT_FLAGS.contains(WriteFlags::RESERVE));
        assert!(UNSUPPORTED_PUT_FLAGS.contains(WriteFlags::MULTIPLE));
        assert!(!UNSUPPORTED_PUT_FLAGS.intersects(WriteFlags::NOOVERWRITE | WriteFlags::APPEND));
    }
}
