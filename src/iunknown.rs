//! The universal lifetime-control surface. Every interop object, on either
//! side, starts its vtable with these three slots; their shapes are fixed,
//! so they are called through typed function pointers rather than
//! synthesized call shapes. One calling convention — the platform's
//! standard non-vararg C convention — is shared by every slot in the
//! process.

use std::ffi::c_void;

use crate::guid::Guid;

/// Identity every interop object answers QueryInterface for.
pub const IID_UNKNOWN: Guid = Guid::from_fields(
    0x0000_0000,
    0x0000,
    0x0000,
    [0xc0, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x46],
);

pub type QueryInterfaceFn =
    unsafe extern "C" fn(this: *mut c_void, iid: *const Guid, out: *mut *mut c_void) -> i32;
pub type AddRefFn = unsafe extern "C" fn(this: *mut c_void) -> u32;
pub type ReleaseFn = unsafe extern "C" fn(this: *mut c_void) -> u32;

pub const SLOT_QUERY_INTERFACE: usize = 0;
pub const SLOT_ADD_REF: usize = 1;
pub const SLOT_RELEASE: usize = 2;

/// # Safety
/// `slot` must be the QueryInterface entry of a live object's vtable and
/// `this` the matching object pointer.
pub(crate) unsafe fn call_query_interface(
    slot: *const c_void,
    this: *mut c_void,
    iid: &Guid,
    out: &mut *mut c_void,
) -> i32 {
    let f: QueryInterfaceFn = std::mem::transmute(slot);
    f(this, iid as *const Guid, out as *mut *mut c_void)
}

/// # Safety
/// `slot` must be the AddRef entry of a live object's vtable.
pub(crate) unsafe fn call_add_ref(slot: *const c_void, this: *mut c_void) -> u32 {
    let f: AddRefFn = std::mem::transmute(slot);
    f(this)
}

/// # Safety
/// `slot` must be the Release entry of a live object's vtable.
pub(crate) unsafe fn call_release(slot: *const c_void, this: *mut c_void) -> u32 {
    let f: ReleaseFn = std::mem::transmute(slot);
    f(this)
}

/// Release one reference on a raw object pointer by reading its vtable.
///
/// # Safety
/// `ptr` must be a live object pointer following the vtable-first layout.
pub(crate) unsafe fn release_raw(ptr: *mut c_void) -> u32 {
    let vtbl = *(ptr as *const *const *const c_void);
    call_release(*vtbl.add(SLOT_RELEASE), ptr)
}
