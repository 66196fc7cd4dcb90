use std::os::raw::c_void;
use std::ptr;
use std::slice;

use lmdb_sys as ffi;

/// Borrows `data` as a native value for the duration of one call.
///
/// The engine never writes through input values, the `*mut` is only what the
/// C signature asks for.
pub(crate) fn to_val(data: &[u8]) -> ffi::MDB_val {
    ffi::MDB_val {
        mv_size: data.len(),
        mv_data: data.as_ptr() as *mut c_void,
    }
}

/// The absent value. Distinct from an empty slice: the data pointer is null.
pub(crate) fn absent() -> ffi::MDB_val {
    ffi::MDB_val {
        mv_size: 0,
        mv_data: ptr::null_mut(),
    }
}

/// Marshals an optional input, `None` becoming the absent value.
pub(crate) fn to_val_opt(data: Option<&[u8]>) -> ffi::MDB_val {
    match data {
        Some(data) => to_val(data),
        None => absent(),
    }
}

pub(crate) fn is_absent(val: &ffi::MDB_val) -> bool {
    val.mv_data.is_null()
}

/// Pointer to an optional value, null when there is none.
pub(crate) fn opt_ptr(val: &mut Option<ffi::MDB_val>) -> *mut ffi::MDB_val {
    val.as_mut().map_or(ptr::null_mut(), |val| val as *mut ffi::MDB_val)
}

/// Copies a value produced by the engine into caller-owned memory.
///
/// # Safety
///
/// `val` must point at `mv_size` readable bytes, i.e. it must come straight
/// from an engine call made under the owning transaction's lock.
pub(crate) unsafe fn copy_out(val: &ffi::MDB_val) -> Vec<u8> {
    if val.mv_size == 0 || is_absent(val) {
        return Vec::new();
    }
    slice::from_raw_parts(val.mv_data as *const u8, val.mv_size).to_vec()
}

/// Key/value pair returned by cursor positioning.
pub type Pair = (Vec<u8>, Vec<u8>);
