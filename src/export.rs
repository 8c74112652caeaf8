//! Inbound wrappers: local implementations exported behind native-callable
//! vtables.
//!
//! The wrapper owns one heap block of pointer-sized slots. The slot the
//! returned object pointer designates holds the address of the next slot,
//! reproducing the address-of-address convention exactly: native code reads
//! the object pointer, finds the vtable pointer, and calls through it. One
//! allocation-private header word sits ahead of the object pointer so the
//! universal thunks can recover the wrapper without any global lookup.
//!
//! Errors raised by the implementation are converted to status codes at
//! exactly this boundary — nothing else of the local error crosses. The one
//! exception is the pointer return convention, which has no status channel:
//! those methods swallow the error and return null.

use std::ffi::c_void;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use libffi::low::ffi_cif;
use libffi::middle::Closure;

use crate::descriptor::{
    InterfaceDescriptor, MarshalDirection, ParamDirection, ParamType, ReturnKind,
};
use crate::error::Error;
use crate::guid::Guid;
use crate::hresult::HResult;
use crate::iunknown::IID_UNKNOWN;
use crate::live;
use crate::marshal;
use crate::shape::{NativeType, SlotBinding};
use crate::tracer::trace_msg;
use crate::value::Value;

/// Dispatch surface a local object implements to become exportable. The
/// wrapper decodes native arguments into `Value`s per the interface
/// descriptor, invokes, and encodes the result; `method` is the index into
/// the descriptor's flattened method list.
///
/// Input parameters arrive converted; output parameters arrive seeded with
/// their type's default and must be assigned before returning. The returned
/// value is the method's logical result: the raw code for status-returning
/// methods, a bool, a pointer, an interface, or `Value::Void`.
pub trait ComImpl: Send + Sync + 'static {
    fn invoke(&self, method: usize, args: &mut [Value]) -> Result<Value, Error>;

    /// Opt into the disposal notification; return `Some(self)` to be told
    /// when the native side releases its last reference.
    fn as_disposable(&self) -> Option<&dyn ComDisposable> {
        None
    }
}

/// Notification capability: fires every time the native-facing reference
/// counter transitions from one to zero, exactly once per transition.
pub trait ComDisposable {
    fn last_native_reference_released(&self);
}

/// One header word ahead of the object pointer, plus the object pointer
/// cell itself.
const HEADER_SLOTS: usize = 2;
/// Index of the first vtable entry (QueryInterface).
const VTBL_FIRST: usize = 2;

pub(crate) struct ExportedInner {
    desc: Arc<InterfaceDescriptor>,
    iid: Guid,
    /// The implementation, weakly tracked while no native references exist.
    weak_impl: Weak<dyn ComImpl>,
    /// Strong handle pinning the implementation while the counter is > 0.
    pinned: Mutex<Option<Arc<dyn ComImpl>>>,
    /// References held by native code, independent of any local `Arc`s.
    count: AtomicU32,
}

impl ExportedInner {
    fn current_impl(&self) -> Option<Arc<dyn ComImpl>> {
        if let Ok(guard) = self.pinned.lock() {
            if let Some(p) = guard.as_ref() {
                return Some(p.clone());
            }
        }
        self.weak_impl.upgrade()
    }

    fn add_ref(&self) -> u32 {
        let n = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        if n == 1 {
            // 0 -> 1 pins the implementation against collection
            if let Ok(mut guard) = self.pinned.lock() {
                *guard = self.weak_impl.upgrade();
            }
        }
        n
    }

    fn release(&self) -> u32 {
        let n = self.count.fetch_sub(1, Ordering::SeqCst).wrapping_sub(1);
        if n == 0 {
            let pinned = match self.pinned.lock() {
                Ok(mut guard) => guard.take(),
                Err(_) => None,
            };
            let imp = pinned.or_else(|| self.weak_impl.upgrade());
            if let Some(imp) = imp {
                if let Some(disposable) = imp.as_disposable() {
                    trace_msg!("notifying {} of last native release", self.desc.name());
                    disposable.last_native_reference_released();
                }
            }
        }
        n
    }
}

struct MethodThunk {
    inner: *const ExportedInner,
    index: usize,
}

pub struct ExportedObject {
    // declaration order is drop order: trampolines go before the state they
    // point into
    closures: Vec<Closure<'static>>,
    #[allow(dead_code)]
    thunks: Vec<Box<MethodThunk>>,
    inner: Box<ExportedInner>,
    table: Box<[*const c_void]>,
}

// The table and thunk data are immutable after construction; the mutable
// state behind them is guarded by atomics and a mutex.
unsafe impl Send for ExportedObject {}
unsafe impl Sync for ExportedObject {}

impl ExportedObject {
    fn build(desc: &Arc<InterfaceDescriptor>, imp: &Arc<dyn ComImpl>) -> Result<ExportedObject, Error> {
        for m in desc.methods() {
            if m.retval.is_some() {
                return Err(Error::contract(
                    format!("{}::{}", desc.name(), m.name),
                    "return-value output slots are only supported on native-backed objects",
                ));
            }
            for p in &m.params {
                if matches!(p.ty, ParamType::InterfaceArray(_)) {
                    return Err(Error::contract(
                        format!("{}::{}({})", desc.name(), m.name, p.name),
                        "interface arrays cannot cross into local implementations",
                    ));
                }
            }
        }

        let shapes = desc.shapes();
        let method_count = shapes.methods.len();

        let inner = Box::new(ExportedInner {
            desc: desc.clone(),
            iid: desc.iid(),
            weak_impl: Arc::downgrade(imp),
            pinned: Mutex::new(None),
            count: AtomicU32::new(0),
        });
        let inner_ptr = &*inner as *const ExportedInner;

        let mut table =
            vec![std::ptr::null::<c_void>(); HEADER_SLOTS + 3 + method_count].into_boxed_slice();
        let mut thunks = Vec::with_capacity(method_count);
        let mut closures = Vec::with_capacity(method_count);

        for (i, shape) in shapes.methods.iter().enumerate() {
            let data = Box::new(MethodThunk {
                inner: inner_ptr,
                index: i,
            });
            // the borrow is tied to the boxed allocation, which lives in
            // `thunks` exactly as long as the closure does
            let data_ref: &'static MethodThunk = unsafe { &*(&*data as *const MethodThunk) };
            let closure = match shape.ret {
                NativeType::Ptr => Closure::new(shape.cif(), pointer_method_thunk, data_ref),
                _ => Closure::new(shape.cif(), status_method_thunk, data_ref),
            };
            let code: unsafe extern "C" fn() = *closure.code_ptr();
            table[VTBL_FIRST + 3 + i] = code as *const c_void;
            thunks.push(data);
            closures.push(closure);
        }

        table[0] = inner_ptr as *const c_void;
        table[1] = &table[VTBL_FIRST] as *const *const c_void as *const c_void;
        table[VTBL_FIRST] = query_interface_thunk as *const c_void;
        table[VTBL_FIRST + 1] = add_ref_thunk as *const c_void;
        table[VTBL_FIRST + 2] = release_thunk as *const c_void;

        trace_msg!(
            "exported {} with {method_count} methods at {:p}",
            desc.name(),
            &table[1] as *const *const c_void
        );

        Ok(ExportedObject {
            closures,
            thunks,
            inner,
            table,
        })
    }

    /// The native-facing object pointer: points at the cell holding the
    /// vtable address.
    pub(crate) fn address(&self) -> *mut c_void {
        &self.table[1] as *const *const c_void as *mut c_void
    }

    pub(crate) fn descriptor(&self) -> &Arc<InterfaceDescriptor> {
        &self.inner.desc
    }

    pub(crate) fn current_impl(&self) -> Option<Arc<dyn ComImpl>> {
        self.inner.current_impl()
    }

    pub(crate) fn native_ref_count(&self) -> u32 {
        self.inner.count.load(Ordering::SeqCst)
    }

    pub(crate) fn add_ref_native(&self) -> u32 {
        self.inner.add_ref()
    }

    /// Live as long as either the implementation exists or native code
    /// still holds references.
    pub(crate) fn is_alive(&self) -> bool {
        self.inner.weak_impl.strong_count() > 0 || self.native_ref_count() > 0
    }
}

unsafe fn inner_of(this: *mut c_void) -> *const ExportedInner {
    // object pointer is table[1]; the header back-pointer precedes it
    *(this as *const *const ExportedInner).sub(1)
}

unsafe extern "C" fn query_interface_thunk(
    this: *mut c_void,
    iid: *const Guid,
    out: *mut *mut c_void,
) -> i32 {
    if out.is_null() {
        return HResult::E_POINTER.0;
    }
    *out = std::ptr::null_mut();
    if iid.is_null() {
        return HResult::E_POINTER.0;
    }
    let inner = &*inner_of(this);
    let requested = *iid;
    if requested == inner.iid || requested == IID_UNKNOWN {
        inner.add_ref();
        *out = this;
        HResult::OK.0
    } else {
        HResult::E_NOINTERFACE.0
    }
}

unsafe extern "C" fn add_ref_thunk(this: *mut c_void) -> u32 {
    (*inner_of(this)).add_ref()
}

unsafe extern "C" fn release_thunk(this: *mut c_void) -> u32 {
    (*inner_of(this)).release()
}

/// Decode native arguments per the call shape, invoke the implementation,
/// and write outputs back on success.
unsafe fn dispatch(
    inner: &ExportedInner,
    index: usize,
    args: *const *const c_void,
) -> Result<Value, Error> {
    let method = &inner.desc.methods()[index];
    let shape = &inner.desc.shapes().methods[index];

    let imp = inner
        .current_impl()
        .ok_or(Error::Com(HResult::E_UNEXPECTED))?;

    let mut locals: Vec<Value> = method
        .params
        .iter()
        .map(|p| Value::default_for(&p.ty))
        .collect();
    let mut outs: Vec<(usize, *mut c_void)> = vec![];

    for (slot, binding) in shape.bindings.iter().enumerate() {
        let storage = *args.add(slot + 1); // slot 0 is the this pointer
        match *binding {
            SlotBinding::Param(i) => {
                let p = &method.params[i];
                if p.direction.contains(ParamDirection::OUT) {
                    let dest = *(storage as *const *mut c_void);
                    if p.direction.contains(ParamDirection::IN) && !dest.is_null() {
                        locals[i] = marshal::read_scalar(dest, &p.ty)?;
                    }
                    outs.push((i, dest));
                } else {
                    locals[i] = match marshal::resolve(p)? {
                        Some(m) => {
                            let word = *(storage as *const *mut c_void);
                            m.to_local(word, p)?
                        }
                        None => marshal::read_scalar(storage, &p.ty)?,
                    };
                }
            }
            // rejected at build time
            SlotBinding::RetVal => return Err(Error::Com(HResult::E_NOTIMPL)),
        }
    }

    let ret = imp.invoke(index, &mut locals)?;

    for (i, dest) in outs {
        if dest.is_null() {
            continue;
        }
        let p = &method.params[i];
        match marshal::resolve(p)? {
            Some(m) => m.write_back(&locals[i], dest, p)?,
            None => marshal::write_scalar(dest, &locals[i], &p.ty)?,
        }
    }
    Ok(ret)
}

unsafe extern "C" fn status_method_thunk(
    _cif: &ffi_cif,
    result: &mut i32,
    args: *const *const c_void,
    data: &MethodThunk,
) {
    let inner = &*data.inner;
    let index = data.index;
    let outcome = catch_unwind(AssertUnwindSafe(|| unsafe { dispatch(inner, index, args) }));
    *result = match outcome {
        Ok(Ok(ret)) => {
            let method = &inner.desc.methods()[index];
            match method.ret {
                ReturnKind::Status => ret.as_i32().unwrap_or(HResult::E_UNEXPECTED.0),
                ReturnKind::Void => HResult::OK.0,
                ReturnKind::Bool => match ret.as_bool() {
                    Ok(true) => HResult::OK.0,
                    Ok(false) => HResult::FALSE.0,
                    Err(_) => HResult::E_UNEXPECTED.0,
                },
                // pointer kinds use the pointer trampoline
                _ => HResult::E_UNEXPECTED.0,
            }
        }
        Ok(Err(e)) => {
            trace_msg!("{} call failed: {e}", inner.desc.name());
            e.hresult().0
        }
        Err(_) => HResult::E_UNEXPECTED.0,
    };
}

unsafe extern "C" fn pointer_method_thunk(
    _cif: &ffi_cif,
    result: &mut *mut c_void,
    args: *const *const c_void,
    data: &MethodThunk,
) {
    let inner = &*data.inner;
    let index = data.index;
    let outcome = catch_unwind(AssertUnwindSafe(|| unsafe { dispatch(inner, index, args) }));
    // no status channel in this return convention: failures become null
    *result = match outcome {
        Ok(Ok(ret)) => {
            let method = &inner.desc.methods()[index];
            match method.ret {
                ReturnKind::Pointer => ret.as_ptr().unwrap_or(std::ptr::null_mut()),
                ReturnKind::Interface(iid) => match ret {
                    Value::Interface(Some(r)) => {
                        r.to_native_owned(iid).unwrap_or(std::ptr::null_mut())
                    }
                    _ => std::ptr::null_mut(),
                },
                _ => std::ptr::null_mut(),
            }
        }
        _ => std::ptr::null_mut(),
    };
}

/// Export a local implementation as a native-callable object pointer.
///
/// Repeated exports of the same implementation under the same interface
/// reuse the live wrapper. Pass `add_ref = true` to move ownership to the
/// native side: the counter is bumped and the callee becomes responsible
/// for the matching release.
pub fn wrap(
    desc: &Arc<InterfaceDescriptor>,
    imp: &Arc<dyn ComImpl>,
    add_ref: bool,
) -> Result<*mut c_void, Error> {
    if !desc.direction().contains(MarshalDirection::LOCAL_TO_NATIVE) {
        return Err(Error::DirectionNotSupported {
            interface: desc.name().to_string(),
            attempted: "local-to-native",
        });
    }

    let (obj, _hit) = live::exported_insert_or_fetch(desc, imp, || ExportedObject::build(desc, imp))?;
    if add_ref {
        obj.add_ref_native();
    }
    Ok(obj.address())
}
