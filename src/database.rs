use std::collections::HashMap;

use lmdb_sys as ffi;
use parking_lot::Mutex;

use crate::constants::DbFlags;

/// Handles below this id are the engine's core tables. They are never
/// discarded when the transaction that opened them ends without committing.
pub(crate) const CORE_DBS: ffi::MDB_dbi = 2;

/// Database handle
///
/// A lightweight id for one named table (or the default unnamed one) in an
/// environment. Handles are `Copy`, carry no native resource and stay valid
/// for the lifetime of the environment once the transaction that opened them
/// commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Database {
    /// Database identifier
    dbi: ffi::MDB_dbi,
    /// Identity of the owning environment
    env_id: usize,
}

impl Database {
    pub(crate) fn new(dbi: ffi::MDB_dbi, env_id: usize) -> Self {
        Database { dbi, env_id }
    }

    /// The native database id.
    pub fn dbi(&self) -> u32 {
        self.dbi
    }

    pub(crate) fn env_id(&self) -> usize {
        self.env_id
    }
}

/// Name and creation flags of an open database handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbInfo {
    /// `None` for the default table
    pub name: Option<String>,
    pub flags: DbFlags,
}

/// Open database handles of one environment.
#[derive(Default)]
pub(crate) struct DbRegistry {
    open: Mutex<HashMap<ffi::MDB_dbi, DbInfo>>,
}

impl DbRegistry {
    /// Records an opened handle. Returns true if the handle was not open
    /// before, meaning the opening transaction decides whether it survives.
    pub(crate) fn register(&self, dbi: ffi::MDB_dbi, name: Option<&str>, flags: DbFlags) -> bool {
        let mut open = self.open.lock();
        if open.contains_key(&dbi) {
            return false;
        }
        open.insert(
            dbi,
            DbInfo {
                name: name.map(str::to_owned),
                flags: flags - DbFlags::CREATE,
            },
        );
        dbi >= CORE_DBS
    }

    pub(crate) fn contains(&self, dbi: ffi::MDB_dbi) -> bool {
        self.open.lock().contains_key(&dbi)
    }

    pub(crate) fn info(&self, dbi: ffi::MDB_dbi) -> Option<DbInfo> {
        self.open.lock().get(&dbi).cloned()
    }

    pub(crate) fn unregister(&self, dbi: ffi::MDB_dbi) -> bool {
        self.open.lock().remove(&dbi).is_some()
    }

    /// Forgets handles that the engine discarded along with the transaction
    /// that opened them.
    pub(crate) fn discard(&self, dbis: &[ffi::MDB_dbi]) {
        if dbis.is_empty() {
            return;
        }
        let mut open = self.open.lock();
        for dbi in dbis {
            open.remove(dbi);
        }
    }

    pub(crate) fn clear(&self) {
        self.open.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_reports_new_handles_only() {
        let registry = DbRegistry::default();
        assert!(registry.register(2, Some("users"), DbFlags::CREATE | DbFlags::DUPSORT));
        assert!(!registry.register(2, Some("users"), DbFlags::empty()));
        let info = registry.info(2).unwrap();
        assert_eq!(info.name.as_deref(), Some("users"));
        assert_eq!(info.flags, DbFlags::DUPSORT);
    }

    #[test]
    fn main_table_is_never_transaction_scoped() {
        let registry = DbRegistry::default();
        assert!(!registry.register(1, None, DbFlags::empty()));
        assert!(registry.contains(1));
    }

    #[test]
    fn discard_and_unregister() {
        let registry = DbRegistry::default();
        registry.register(2, Some("a"), DbFlags::empty());
        registry.register(3, Some("b"), DbFlags::empty());
        registry.discard(&[2]);
        assert!(!registry.contains(2));
        assert!(registry.unregister(3));
        assert!(!registry.unregister(3));
        registry.register(4, Some("c"), DbFlags::empty());
        registry.clear();
        assert!(!registry.contains(4));
    }

    #[test]
    fn handle_exposes_dbi() {
        let db = Database::new(5, 42);
        assert_eq!(db.dbi(), 5);
        assert_eq!(db.env_id(), 42);
    }
}
