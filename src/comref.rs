//! `ComRef`: the uniform interface-typed handle. A reference is backed
//! either by an outbound proxy around a native object or directly by a
//! local implementation, so interface-typed values round-trip across the
//! boundary without ever proxying one of our own objects through its own
//! vtable.

use std::ffi::c_void;
use std::sync::Arc;

use crate::descriptor::{interface_by_iid, InterfaceDescriptor};
use crate::error::Error;
use crate::export::{self, ComImpl};
use crate::guid::Guid;
use crate::iunknown;
use crate::proxy::{self, NativeProxy, Ownership};
use crate::value::Value;

#[derive(Clone)]
pub struct ComRef {
    desc: Arc<InterfaceDescriptor>,
    backing: Backing,
}

#[derive(Clone)]
enum Backing {
    Native(Arc<NativeProxy>),
    Local(Arc<dyn ComImpl>),
}

impl ComRef {
    pub(crate) fn from_proxy(desc: Arc<InterfaceDescriptor>, proxy: Arc<NativeProxy>) -> ComRef {
        ComRef {
            desc,
            backing: Backing::Native(proxy),
        }
    }

    pub(crate) fn from_local(desc: Arc<InterfaceDescriptor>, imp: Arc<dyn ComImpl>) -> ComRef {
        ComRef {
            desc,
            backing: Backing::Local(imp),
        }
    }

    /// View a local implementation under an interface without exporting it.
    /// A vtable is only synthesized if the reference later crosses to the
    /// native side.
    pub fn local(desc: &Arc<InterfaceDescriptor>, imp: Arc<dyn ComImpl>) -> ComRef {
        ComRef::from_local(desc.clone(), imp)
    }

    pub fn descriptor(&self) -> &Arc<InterfaceDescriptor> {
        &self.desc
    }

    pub fn is_native(&self) -> bool {
        matches!(self.backing, Backing::Native(_))
    }

    /// The underlying proxy, when native-backed.
    pub fn proxy(&self) -> Option<&Arc<NativeProxy>> {
        match &self.backing {
            Backing::Native(p) => Some(p),
            Backing::Local(_) => None,
        }
    }

    pub fn native_pointer(&self) -> Option<*mut c_void> {
        self.proxy().map(|p| p.native_pointer())
    }

    /// Identity comparison: two references to the same underlying wrapper
    /// or implementation.
    pub fn ptr_eq(&self, other: &ComRef) -> bool {
        match (&self.backing, &other.backing) {
            (Backing::Native(a), Backing::Native(b)) => Arc::ptr_eq(a, b),
            (Backing::Local(a), Backing::Local(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
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
        match &self.backing {
            Backing::Native(p) => p.call_index(index, args),
            Backing::Local(imp) => {
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
                // both sides are local; calls never touch the boundary
                imp.invoke(index, args)
            }
        }
    }

    /// Release the owned native reference early, if native-backed. Further
    /// calls through this reference fail fast.
    pub fn release(&self) {
        if let Backing::Native(p) = &self.backing {
            p.release();
        }
    }

    /// Reinterpret the reference under another interface.
    ///
    /// If the current interface already covers the target, the same
    /// underlying wrapper is returned and no native call is issued.
    /// Otherwise a native identity query runs, and `release_old` releases
    /// this reference's ownership as part of the query, whether or not it
    /// succeeds.
    pub fn cast(&self, target: &Arc<InterfaceDescriptor>, release_old: bool) -> Result<ComRef, Error> {
        if self.desc.implements(target.iid()) {
            return Ok(ComRef {
                desc: target.clone(),
                backing: self.backing.clone(),
            });
        }

        match &self.backing {
            Backing::Native(p) => {
                let queried = p.query_interface(target.iid(), true);
                if release_old {
                    p.release();
                }
                let ptr = queried.map_err(|e| {
                    Error::invalid_cast(
                        target.name(),
                        format!("the native object does not support the interface: {e}"),
                    )
                })?;
                match proxy::wrap(target, ptr) {
                    Ok(r) => Ok(r),
                    Err(e) => {
                        // balance the reference the query handed us
                        unsafe { iunknown::release_raw(ptr) };
                        Err(e)
                    }
                }
            }
            Backing::Local(_) => Err(Error::invalid_cast(
                target.name(),
                format!("{} does not implement the interface", self.desc.name()),
            )),
        }
    }

    /// Native pointer for an input position: no reference is transferred,
    /// the pointer stays valid only while this reference lives.
    pub(crate) fn to_native_borrowed(&self, iid: Guid) -> Result<*mut c_void, Error> {
        match &self.backing {
            Backing::Native(p) => {
                if p.descriptor().implements(iid) {
                    Ok(p.native_pointer())
                } else {
                    p.query_interface(iid, false)
                }
            }
            Backing::Local(imp) => {
                let desc = exported_descriptor(iid)?;
                export::wrap(&desc, imp, false)
            }
        }
    }

    /// Native pointer carrying one reference for the receiver.
    pub(crate) fn to_native_owned(&self, iid: Guid) -> Result<*mut c_void, Error> {
        match &self.backing {
            Backing::Native(p) => {
                if p.descriptor().implements(iid) {
                    p.add_ref()?;
                    Ok(p.native_pointer())
                } else {
                    p.query_interface(iid, true)
                }
            }
            Backing::Local(imp) => {
                let desc = exported_descriptor(iid)?;
                export::wrap(&desc, imp, true)
            }
        }
    }
}

impl std::fmt::Debug for ComRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.backing {
            Backing::Native(p) => write!(f, "ComRef({} -> {p:?})", self.desc.name()),
            Backing::Local(_) => write!(f, "ComRef({} -> local)", self.desc.name()),
        }
    }
}

fn exported_descriptor(iid: Guid) -> Result<Arc<InterfaceDescriptor>, Error> {
    interface_by_iid(iid).ok_or_else(|| {
        Error::marshal(
            format!("{iid}"),
            "interface is not registered; register its descriptor first",
        )
    })
}

/// Wrap a native pointer received with ownership of one reference.
pub(crate) fn wrap_owned(
    desc: &Arc<InterfaceDescriptor>,
    ptr: *mut c_void,
) -> Result<ComRef, Error> {
    proxy::wrap_with(desc, ptr, Ownership::Owned)
}

/// Wrap a borrowed native pointer; a newly built proxy takes a reference of
/// its own.
pub(crate) fn wrap_borrowed(
    desc: &Arc<InterfaceDescriptor>,
    ptr: *mut c_void,
) -> Result<ComRef, Error> {
    proxy::wrap_with(desc, ptr, Ownership::Borrowed)
}
