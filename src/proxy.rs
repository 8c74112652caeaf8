//! Outbound proxies: native objects wrapped into callable local objects.
//!
//! A proxy owns exactly one reference on the underlying native object and a
//! snapshot of its vtable, read once at construction. Calls marshal
//! arguments into native words, invoke the slot's function pointer through a
//! per-call `Cif`, and translate the native return value back into the
//! local convention. The reference is released at most once — explicit
//! `release()` or drop, whichever happens first — and a call on a released
//! proxy fails fast.

use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use libffi::middle::{Arg, CodePtr};

use crate::comref::ComRef;
use crate::descriptor::{
    interface_by_iid, InterfaceDescriptor, MarshalDirection, MethodDescriptor, ParamDirection,
    RetVal,
};
use crate::error::Error;
use crate::guid::Guid;
use crate::hresult::HResult;
use crate::iunknown::{self, SLOT_ADD_REF, SLOT_QUERY_INTERFACE, SLOT_RELEASE};
use crate::live;
use crate::marshal::{self, CallFrame, OutCell};
use crate::shape::{SlotBinding, IUNKNOWN_SLOTS};
use crate::tracer::trace_msg;
use crate::value::{self, Value};
use crate::{comref, descriptor::ParamDescriptor};

/// Whether the caller hands over a reference along with the pointer.
/// Factory results, output parameters, and QueryInterface results arrive
/// owned; pointers seen as inbound call arguments are borrowed.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Ownership {
    Owned,
    Borrowed,
}

pub struct NativeProxy {
    ptr: *mut c_void,
    /// IUnknown slots 0-2, then one slot per method in descriptor order.
    vtable: Vec<*const c_void>,
    desc: Arc<InterfaceDescriptor>,
    released: AtomicBool,
}

// The raw pointers reference the foreign object; every mutation of proxy
// state goes through atomics, and native code must tolerate calls from any
// thread per the interop contract.
unsafe impl Send for NativeProxy {}
unsafe impl Sync for NativeProxy {}

impl NativeProxy {
    /// Read the complete vtable from the native object pointer. The
    /// snapshot is taken once; later vtable changes on the native side are
    /// not observed.
    pub(crate) fn snapshot(desc: &Arc<InterfaceDescriptor>, ptr: *mut c_void) -> NativeProxy {
        let count = desc.shapes().vtable_len();
        let vtbl = unsafe { *(ptr as *const *const *const c_void) };
        let vtable = (0..count).map(|i| unsafe { *vtbl.add(i) }).collect();
        trace_msg!("wrapping native {ptr:p} as {}", desc.name());
        NativeProxy {
            ptr,
            vtable,
            desc: desc.clone(),
            released: AtomicBool::new(false),
        }
    }

    pub fn descriptor(&self) -> &Arc<InterfaceDescriptor> {
        &self.desc
    }

    pub fn native_pointer(&self) -> *mut c_void {
        self.ptr
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    fn ensure_live(&self) -> Result<(), Error> {
        if self.is_released() {
            Err(Error::UseAfterRelease {
                interface: self.desc.name().to_string(),
            })
        } else {
            Ok(())
        }
    }

    pub fn add_ref(&self) -> Result<u32, Error> {
        self.ensure_live()?;
        Ok(unsafe { iunknown::call_add_ref(self.vtable[SLOT_ADD_REF], self.ptr) })
    }

    /// Release the owned native reference. Safe to call multiple times;
    /// only the first call takes effect. The cache entry is dropped before
    /// the native reference so a concurrent lookup cannot resurrect a
    /// pointer that is about to die.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            live::native_remove(self.ptr as usize, self as *const NativeProxy);
            trace_msg!("releasing {} proxy for {:p}", self.desc.name(), self.ptr);
            unsafe { iunknown::call_release(self.vtable[SLOT_RELEASE], self.ptr) };
        }
    }

    /// Issue a native identity query. On success the returned pointer
    /// carries one reference; passing `add_ref = false` balances it
    /// immediately, leaving a pointer that is only valid while this proxy
    /// holds the object alive.
    pub fn query_interface(&self, iid: Guid, add_ref: bool) -> Result<*mut c_void, Error> {
        self.ensure_live()?;
        let mut out = std::ptr::null_mut();
        let hr = unsafe {
            iunknown::call_query_interface(
                self.vtable[SLOT_QUERY_INTERFACE],
                self.ptr,
                &iid,
                &mut out,
            )
        };
        HResult(hr).check()?;
        if !add_ref {
            unsafe { iunknown::call_release(self.vtable[SLOT_RELEASE], self.ptr) };
        }
        Ok(out)
    }

    pub fn call(&self, method: &str, args: &mut [Value]) -> Result<Value, Error> {
        let index = self.desc.method_index(method).ok_or_else(|| {
            Error::contract(
                self.desc.name(),
                format!("interface has no method named \"{method}\""),
            )
        })?;
        self.call_index(index, args)
    }

    pub fn call_index(&self, index: usize, args: &mut [Value]) -> Result<Value, Error> {
        self.ensure_live()?;
        let method = self.desc.methods().get(index).ok_or_else(|| {
            Error::contract(
                self.desc.name(),
                format!("interface has no method at slot {index}"),
            )
        })?;
        if args.len() != method.params.len() {
            return Err(Error::marshal(
                format!("{}::{}", self.desc.name(), method.name),
                format!(
                    "expected {} arguments, received {}",
                    method.params.len(),
                    args.len()
                ),
            ));
        }

        let shapes = self.desc.shapes();
        let shape = &shapes.methods[index];

        let mut frame = CallFrame::new();
        frame.words.reserve(shape.args.len());
        frame.words.push(value::NativeWord::Ptr(self.ptr));

        // Which output cells feed which caller-visible values, converted
        // only after the call signals success.
        let mut post: Vec<PostAction> = vec![];

        for binding in &shape.bindings {
            match *binding {
                SlotBinding::Param(i) => {
                    let p = &method.params[i];
                    if p.direction.contains(ParamDirection::OUT) {
                        let mut cell = OutCell::zeroed();
                        if p.direction.contains(ParamDirection::IN) {
                            seed_inout_cell(&mut cell, &args[i], p)?;
                        }
                        let cell_ptr = cell.ptr();
                        frame.cells.push(cell);
                        post.push(PostAction::Output {
                            cell: frame.cells.len() - 1,
                            param: i,
                        });
                        frame.words.push(value::NativeWord::Ptr(cell_ptr));
                    } else {
                        let word = match marshal::resolve(p)? {
                            Some(m) => m.to_native(&args[i], p, &mut frame)?,
                            None => value::scalar_word(&args[i], &p.ty)?,
                        };
                        frame.words.push(word);
                    }
                }
                SlotBinding::RetVal => {
                    let cell = OutCell::zeroed();
                    let cell_ptr = cell.ptr();
                    frame.cells.push(cell);
                    post.push(PostAction::RetVal {
                        cell: frame.cells.len() - 1,
                    });
                    frame.words.push(value::NativeWord::Ptr(cell_ptr));
                }
            }
        }

        if let Some(conv) = self.desc.conventions() {
            if let Some(prologue) = conv.prologue {
                prologue();
            }
        }
        trace_msg!("calling {}::{}", self.desc.name(), method.name);

        let cif = shape.cif();
        let code = CodePtr::from_ptr(self.vtable[IUNKNOWN_SLOTS + index]);
        let arg_values: Vec<Arg> = frame.words.iter().map(|w| w.as_arg()).collect();

        use crate::descriptor::ReturnKind::*;
        match method.ret {
            Status => {
                let hr = HResult(unsafe { cif.call::<i32>(code, &arg_values) });
                self.check_status(hr)?;
                self.finish_outputs(method, &frame, &post, args)?;
                Ok(Value::I32(hr.0))
            }
            Void => {
                let hr = HResult(unsafe { cif.call::<i32>(code, &arg_values) });
                self.check_status(hr)?;
                match self.finish_outputs(method, &frame, &post, args)? {
                    Some(retval) => Ok(retval),
                    None => Ok(Value::Void),
                }
            }
            Bool => {
                let hr = HResult(unsafe { cif.call::<i32>(code, &arg_values) });
                let b = self.check_bool(hr)?;
                self.finish_outputs(method, &frame, &post, args)?;
                Ok(Value::Bool(b))
            }
            Pointer => {
                let p = unsafe { cif.call::<*mut c_void>(code, &arg_values) };
                self.finish_outputs(method, &frame, &post, args)?;
                Ok(Value::Ptr(p))
            }
            Interface(iid) => {
                let p = unsafe { cif.call::<*mut c_void>(code, &arg_values) };
                self.finish_outputs(method, &frame, &post, args)?;
                if p.is_null() {
                    return Ok(Value::Interface(None));
                }
                let target = interface_by_iid(iid).ok_or_else(|| {
                    Error::marshal(
                        method.name.clone(),
                        format!("returned interface {iid} is not registered"),
                    )
                })?;
                Ok(Value::Interface(Some(comref::wrap_owned(&target, p)?)))
            }
        }
    }

    fn check_status(&self, hr: HResult) -> Result<(), Error> {
        match self.desc.conventions().and_then(|c| c.check_status) {
            Some(check) => check(hr),
            None => hr.check(),
        }
    }

    fn check_bool(&self, hr: HResult) -> Result<bool, Error> {
        match self.desc.conventions().and_then(|c| c.check_bool) {
            Some(check) => check(hr),
            None => hr.check_bool(),
        }
    }

    /// Convert output cells into caller-visible values. Runs only on
    /// success; a failed call leaves the output arguments untouched.
    /// Returns the extracted return value if the method declares one.
    fn finish_outputs(
        &self,
        method: &MethodDescriptor,
        frame: &CallFrame,
        post: &[PostAction],
        args: &mut [Value],
    ) -> Result<Option<Value>, Error> {
        let mut retval = None;
        for action in post {
            match *action {
                PostAction::Output { cell, param } => {
                    let p = &method.params[param];
                    let cell = &frame.cells[cell];
                    args[param] = match marshal::resolve(p)? {
                        Some(m) => m.from_native_out(cell, p)?,
                        None => marshal::scalar_from_cell(cell, &p.ty)?,
                    };
                }
                PostAction::RetVal { cell } => {
                    let rv = method
                        .retval
                        .as_ref()
                        .expect("return-value slot without a declaration");
                    let p = retval_param(rv);
                    let cell = &frame.cells[cell];
                    retval = Some(match marshal::resolve(&p)? {
                        Some(m) => m.from_native_out(cell, &p)?,
                        None => marshal::scalar_from_cell(cell, &p.ty)?,
                    });
                }
            }
        }
        Ok(retval)
    }
}

impl Drop for NativeProxy {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for NativeProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "NativeProxy({} at {:p}{})",
            self.desc.name(),
            self.ptr,
            if self.is_released() { ", released" } else { "" }
        )
    }
}

enum PostAction {
    Output { cell: usize, param: usize },
    RetVal { cell: usize },
}

fn retval_param(rv: &RetVal) -> ParamDescriptor {
    ParamDescriptor {
        name: "retval".to_string(),
        ty: rv.ty.clone(),
        direction: ParamDirection::OUT,
    }
}

fn seed_inout_cell(cell: &mut OutCell, value: &Value, p: &ParamDescriptor) -> Result<(), Error> {
    if !p.ty.is_scalar() {
        return Err(Error::marshal(
            p.name.clone(),
            "in-out is only supported for directly-representable types",
        ));
    }
    unsafe { marshal::write_scalar(cell.ptr(), value, &p.ty) }
}

/// Wrap a native pointer, taking ownership of the reference the caller
/// holds. Repeated wrapping of the same pointer under the same interface
/// family reuses the live proxy; the surplus incoming reference is released
/// so the proxy keeps owning exactly one.
pub fn wrap(desc: &Arc<InterfaceDescriptor>, ptr: *mut c_void) -> Result<ComRef, Error> {
    wrap_with(desc, ptr, Ownership::Owned)
}

pub(crate) fn wrap_with(
    desc: &Arc<InterfaceDescriptor>,
    ptr: *mut c_void,
    ownership: Ownership,
) -> Result<ComRef, Error> {
    if !desc.direction().contains(MarshalDirection::NATIVE_TO_LOCAL) {
        return Err(Error::DirectionNotSupported {
            interface: desc.name().to_string(),
            attempted: "native-to-local",
        });
    }
    if ptr.is_null() {
        return Err(Error::Com(HResult::E_POINTER));
    }

    // The pointer may be one of our own exported objects; short-circuit to
    // the local implementation instead of proxying calls through the vtable.
    if let Some((imp, exported_desc)) = live::exported_local(ptr as usize) {
        if exported_desc.implements(desc.iid()) {
            // a local reference holds no native count; balance the one the
            // caller handed over
            if ownership == Ownership::Owned {
                unsafe { iunknown::release_raw(ptr) };
            }
            return Ok(ComRef::from_local(desc.clone(), imp));
        }
    }

    let (proxy, hit) = live::native_insert_or_fetch(desc, ptr, || NativeProxy::snapshot(desc, ptr));
    match (hit, ownership) {
        // the existing proxy already owns its reference; balance the one we
        // were just handed
        (true, Ownership::Owned) => {
            unsafe { iunknown::release_raw(ptr) };
        }
        // a freshly built proxy around a borrowed pointer must own a
        // reference of its own
        (false, Ownership::Borrowed) => {
            proxy.add_ref()?;
        }
        _ => {}
    }
    Ok(ComRef::from_proxy(desc.clone(), proxy))
}
