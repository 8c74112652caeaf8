//! Built-in marshalers for interop interfaces and arrays of them. Used
//! automatically whenever one interop object produces or consumes another.

use std::ffi::c_void;
use std::sync::Arc;

use super::{CallFrame, Marshal, OutCell};
use crate::comref;
use crate::descriptor::{
    interface_by_iid, InterfaceDescriptor, MethodDescriptor, ParamDescriptor, ParamDirection,
    ParamType,
};
use crate::error::Error;
use crate::guid::Guid;
use crate::value::{NativeWord, Value};

fn param_iid(param: &ParamDescriptor) -> Result<Guid, Error> {
    match &param.ty {
        ParamType::Interface(iid) => Ok(*iid),
        other => Err(Error::marshal(
            param.name.clone(),
            format!("interface marshaler applied to a {other:?} parameter"),
        )),
    }
}

fn target_descriptor(
    param: &ParamDescriptor,
    iid: Guid,
) -> Result<Arc<InterfaceDescriptor>, Error> {
    interface_by_iid(iid).ok_or_else(|| {
        Error::marshal(
            param.name.clone(),
            format!("interface {iid} is not registered"),
        )
    })
}

/// Interface ↔ opaque pointer. Inputs cross borrowed; outputs carry one
/// reference for the receiver, per the usual ownership convention for
/// methods that create or return objects.
#[derive(Clone, Copy, Default)]
pub struct InterfaceMarshaler;

impl Marshal for InterfaceMarshaler {
    fn validate(
        &self,
        iface: &str,
        method: &MethodDescriptor,
        param: &ParamDescriptor,
    ) -> Result<(), Error> {
        let ctx = format!("{iface}::{}({})", method.name, param.name);
        let iid = param_iid(param).map_err(|_| {
            Error::marshal(ctx.clone(), "interface marshaler applied to a non-interface")
        })?;
        if iid.is_nil() {
            return Err(Error::contract(ctx, "interface parameter with a nil id"));
        }
        if param.direction == ParamDirection::INOUT {
            return Err(Error::contract(
                ctx,
                "interfaces can only be marshaled in or out, in-out is not supported",
            ));
        }
        Ok(())
    }

    fn to_native(
        &self,
        value: &Value,
        param: &ParamDescriptor,
        frame: &mut CallFrame,
    ) -> Result<NativeWord, Error> {
        let iid = param_iid(param)?;
        match value.as_interface()? {
            None => Ok(NativeWord::Ptr(std::ptr::null_mut())),
            Some(r) => {
                let ptr = r.to_native_borrowed(iid)?;
                // the reference behind a borrowed pointer must survive the call
                frame.keepalive.push(r.clone());
                Ok(NativeWord::Ptr(ptr))
            }
        }
    }

    fn from_native_out(&self, cell: &OutCell, param: &ParamDescriptor) -> Result<Value, Error> {
        let ptr = unsafe { cell.read::<*mut c_void>() };
        self.wrap_received(ptr, param)
    }

    fn to_local(&self, word: *mut c_void, param: &ParamDescriptor) -> Result<Value, Error> {
        if word.is_null() {
            return Ok(Value::Interface(None));
        }
        let desc = target_descriptor(param, param_iid(param)?)?;
        Ok(Value::Interface(Some(comref::wrap_borrowed(&desc, word)?)))
    }

    fn write_back(
        &self,
        value: &Value,
        dest: *mut c_void,
        param: &ParamDescriptor,
    ) -> Result<(), Error> {
        let iid = param_iid(param)?;
        let ptr = match value.as_interface()? {
            None => std::ptr::null_mut(),
            // output direction moves ownership: the native receiver gets a
            // reference it is responsible for releasing
            Some(r) => r.to_native_owned(iid)?,
        };
        unsafe { *(dest as *mut *mut c_void) = ptr };
        Ok(())
    }
}

impl InterfaceMarshaler {
    /// Wrap a pointer received from the native side with ownership of one
    /// reference (out-params and QueryInterface results arrive this way).
    fn wrap_received(&self, ptr: *mut c_void, param: &ParamDescriptor) -> Result<Value, Error> {
        if ptr.is_null() {
            return Ok(Value::Interface(None));
        }
        let desc = target_descriptor(param, param_iid(param)?)?;
        Ok(Value::Interface(Some(comref::wrap_owned(&desc, ptr)?)))
    }
}

/// Array of interfaces → array of opaque pointers. One way only: local
/// arrays passed into native code. The pointers are borrowed for the
/// duration of the call.
#[derive(Clone, Copy, Default)]
pub struct InterfaceArrayMarshaler;

impl Marshal for InterfaceArrayMarshaler {
    fn validate(
        &self,
        iface: &str,
        method: &MethodDescriptor,
        param: &ParamDescriptor,
    ) -> Result<(), Error> {
        let ctx = format!("{iface}::{}({})", method.name, param.name);
        let ParamType::InterfaceArray(iid) = &param.ty else {
            return Err(Error::marshal(
                ctx,
                "interface-array marshaler applied to a non-array parameter",
            ));
        };
        if iid.is_nil() {
            return Err(Error::contract(ctx, "interface array with a nil element id"));
        }
        if param.direction != ParamDirection::IN {
            return Err(Error::marshal(
                ctx,
                "interface arrays can only be marshaled one way, as inputs",
            ));
        }
        Ok(())
    }

    fn to_native(
        &self,
        value: &Value,
        param: &ParamDescriptor,
        frame: &mut CallFrame,
    ) -> Result<NativeWord, Error> {
        let ParamType::InterfaceArray(iid) = &param.ty else {
            return Err(Error::marshal(param.name.clone(), "not an interface array"));
        };
        let Value::InterfaceArray(items) = value else {
            return Err(Error::marshal(
                param.name.clone(),
                format!("expected an interface array, received {}", value.kind()),
            ));
        };

        let mut pointers = Vec::with_capacity(items.len());
        for item in items {
            match item {
                None => pointers.push(std::ptr::null_mut()),
                Some(r) => {
                    pointers.push(r.to_native_borrowed(*iid)?);
                    frame.keepalive.push(r.clone());
                }
            }
        }
        frame.ptr_arrays.push(pointers);
        let stored = frame.ptr_arrays.last().unwrap();
        Ok(NativeWord::Ptr(stored.as_ptr() as *mut c_void))
    }

    fn from_native_out(&self, _cell: &OutCell, param: &ParamDescriptor) -> Result<Value, Error> {
        Err(one_way(param))
    }

    fn to_local(&self, _word: *mut c_void, param: &ParamDescriptor) -> Result<Value, Error> {
        Err(one_way(param))
    }

    fn write_back(
        &self,
        _value: &Value,
        _dest: *mut c_void,
        param: &ParamDescriptor,
    ) -> Result<(), Error> {
        Err(one_way(param))
    }
}

fn one_way(param: &ParamDescriptor) -> Error {
    Error::marshal(
        param.name.clone(),
        "interface arrays only cross local-to-native, as inputs",
    )
}
