use lmdb_sys as ffi;

/// Cursor positioning operations
///
/// The full LMDB vocabulary. New engine operations are added as variants;
/// callers matching on this enum must keep a wildcard arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CursorOp {
    First,
    FirstDup,
    GetBoth,
    GetBothRange,
    GetCurrent,
    GetMultiple,
    Last,
    LastDup,
    Next,
    NextDup,
    NextMultiple,
    NextNoDup,
    Prev,
    PrevDup,
    PrevNoDup,
    Set,
    SetKey,
    SetRange,
}

impl CursorOp {
    pub fn raw(self) -> ffi::MDB_cursor_op {
        match self {
            CursorOp::First => ffi::MDB_FIRST,
            CursorOp::FirstDup => ffi::MDB_FIRST_DUP,
            CursorOp::GetBoth => ffi::MDB_GET_BOTH,
            CursorOp::GetBothRange => ffi::MDB_GET_BOTH_RANGE,
            CursorOp::GetCurrent => ffi::MDB_GET_CURRENT,
            CursorOp::GetMultiple => ffi::MDB_GET_MULTIPLE,
            CursorOp::Last => ffi::MDB_LAST,
            CursorOp::LastDup => ffi::MDB_LAST_DUP,
            CursorOp::Next => ffi::MDB_NEXT,
            CursorOp::NextDup => ffi::MDB_NEXT_DUP,
            CursorOp::NextMultiple => ffi::MDB_NEXT_MULTIPLE,
            CursorOp::NextNoDup => ffi::MDB_NEXT_NODUP,
            CursorOp::Prev => ffi::MDB_PREV,
            CursorOp::PrevDup => ffi::MDB_PREV_DUP,
            CursorOp::PrevNoDup => ffi::MDB_PREV_NODUP,
            CursorOp::Set => ffi::MDB_SET,
            CursorOp::SetKey => ffi::MDB_SET_KEY,
            CursorOp::SetRange => ffi::MDB_SET_RANGE,
        }
    }

    pub fn from_raw(op: ffi::MDB_cursor_op) -> Option<CursorOp> {
        let op = match op {
            ffi::MDB_FIRST => CursorOp::First,
            ffi::MDB_FIRST_DUP => CursorOp::FirstDup,
            ffi::MDB_GET_BOTH => CursorOp::GetBoth,
            ffi::MDB_GET_BOTH_RANGE => CursorOp::GetBothRange,
            ffi::MDB_GET_CURRENT => CursorOp::GetCurrent,
            ffi::MDB_GET_MULTIPLE => CursorOp::GetMultiple,
            ffi::MDB_LAST => CursorOp::Last,
            ffi::MDB_LAST_DUP => CursorOp::LastDup,
            ffi::MDB_NEXT => CursorOp::Next,
            ffi::MDB_NEXT_DUP => CursorOp::NextDup,
            ffi::MDB_NEXT_MULTIPLE => CursorOp::NextMultiple,
            ffi::MDB_NEXT_NODUP => CursorOp::NextNoDup,
            ffi::MDB_PREV => CursorOp::Prev,
            ffi::MDB_PREV_DUP => CursorOp::PrevDup,
            ffi::MDB_PREV_NODUP => CursorOp::PrevNoDup,
            ffi::MDB_SET => CursorOp::Set,
            ffi::MDB_SET_KEY => CursorOp::SetKey,
            ffi::MDB_SET_RANGE => CursorOp::SetRange,
            _ => return None,
        };
        Some(op)
    }

    /// Whether the operation reads the key argument.
    pub fn requires_key(self) -> bool {
        matches!(
            self,
            CursorOp::Set
                | CursorOp::SetKey
                | CursorOp::SetRange
                | CursorOp::GetBoth
                | CursorOp::GetBothRange
        )
    }

    /// Whether the operation reads the data argument.
    pub fn requires_data(self) -> bool {
        matches!(self, CursorOp::GetBoth | CursorOp::GetBothRange)
    }
}

/// Database statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub page_size: u32,
    pub depth: u32,
    pub branch_pages: usize,
    pub leaf_pages: usize,
    pub overflow_pages: usize,
    pub entries: usize,
}

impl From<ffi::MDB_stat> for Stat {
    fn from(stat: ffi::MDB_stat) -> Self {
        Stat {
            page_size: stat.ms_psize,
            depth: stat.ms_depth,
            branch_pages: stat.ms_branch_pages,
            leaf_pages: stat.ms_leaf_pages,
            overflow_pages: stat.ms_overflow_pages,
            entries: stat.ms_entries,
        }
    }
}

/// Environment information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Info {
    pub map_size: usize,
    pub last_pgno: usize,
    pub last_txnid: usize,
    pub max_readers: u32,
    pub num_readers: u32,
}

impl From<ffi::MDB_envinfo> for Info {
    fn from(info: ffi::MDB_envinfo) -> Self {
        Info {
            map_size: info.me_mapsize,
            last_pgno: info.me_last_pgno,
            last_txnid: info.me_last_txnid,
            max_readers: info.me_maxreaders,
            num_readers: info.me_numreaders,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_native_op_maps_back() {
        for raw in ffi::MDB_FIRST..=ffi::MDB_SET_RANGE {
            let op = CursorOp::from_raw(raw).unwrap();
            assert_eq!(op.raw(), raw);
        }
        assert_eq!(CursorOp::from_raw(ffi::MDB_SET_RANGE + 1), None);
    }

    #[test]
    fn argument_requirements() {
        assert!(CursorOp::SetRange.requires_key());
        assert!(!CursorOp::SetRange.requires_data());
        assert!(CursorOp::GetBoth.requires_data());
        assert!(!CursorOp::Next.requires_key());
        assert!(!CursorOp::First.requires_data());
    }
}
