//! Custom marshaler registry and the value-conversion machinery shared by
//! both wrap directions.
//!
//! Resolution precedence, first match wins: interop-interface parameters get
//! the built-in interface marshaler, interface arrays the (one-way) array
//! marshaler, explicitly tagged parameters the custom marshaler registered
//! under that tag, and everything else crosses in its direct native
//! representation. Marshalers are stateless; the registry caches one
//! instance per tag no matter how many interfaces use it.
//!
//! Every marshaled value crosses the boundary as a single pointer-sized
//! word. The split between call-time conversion and post-call writeback
//! matters: output parameters get a temporary declared before the call,
//! passed by reference, and converted into the caller-visible output only
//! after the native call signals success.

use std::collections::HashMap;
use std::ffi::{c_void, CString};
use std::sync::{Arc, Mutex, OnceLock};

use enum_dispatch::enum_dispatch;

use crate::comref::ComRef;
use crate::descriptor::{MethodDescriptor, ParamDescriptor, ParamType};
use crate::error::Error;
use crate::value::{NativeWord, Value};

pub mod interface;
pub mod string;
pub mod stream;

pub use interface::{InterfaceArrayMarshaler, InterfaceMarshaler};
pub use string::NativeStringMarshaler;
pub use stream::{ReadStreamMarshaler, WriteStreamMarshaler};

/// A bidirectional value converter for parameters whose native
/// representation differs from the local one. The native representation is
/// always one pointer-sized word.
#[enum_dispatch]
pub trait Marshal {
    /// Reject parameter shapes this marshaler does not support. Runs at
    /// interface validation time, never at call time.
    fn validate(
        &self,
        iface: &str,
        method: &MethodDescriptor,
        param: &ParamDescriptor,
    ) -> Result<(), Error>;

    /// Local value to native input word; temporaries whose storage the
    /// native call borrows go into the frame.
    fn to_native(
        &self,
        value: &Value,
        param: &ParamDescriptor,
        frame: &mut CallFrame,
    ) -> Result<NativeWord, Error>;

    /// Native output cell, written by the callee, back to a local value.
    /// Only runs after the native call succeeded.
    fn from_native_out(&self, cell: &OutCell, param: &ParamDescriptor) -> Result<Value, Error>;

    /// Native input word to local value (inbound direction).
    fn to_local(&self, word: *mut c_void, param: &ParamDescriptor) -> Result<Value, Error>;

    /// Local output value through the native output pointer (inbound
    /// direction). Only runs after the implementation succeeded, and only
    /// with a `dest` the native caller supplied for pointer-sized storage.
    fn write_back(
        &self,
        value: &Value,
        dest: *mut c_void,
        param: &ParamDescriptor,
    ) -> Result<(), Error>;
}

/// The closed set of built-in marshalers, statically dispatched.
#[enum_dispatch(Marshal)]
#[derive(Clone)]
pub enum BuiltinMarshaler {
    InterfaceMarshaler,
    InterfaceArrayMarshaler,
    ReadStreamMarshaler,
    WriteStreamMarshaler,
    NativeStringMarshaler,
}

/// Resolved marshaler handle: a built-in, or a registered custom instance.
#[derive(Clone)]
pub enum MarshalerRef {
    Builtin(BuiltinMarshaler),
    Custom(Arc<dyn Marshal + Send + Sync>),
}

impl MarshalerRef {
    pub fn validate(
        &self,
        iface: &str,
        method: &MethodDescriptor,
        param: &ParamDescriptor,
    ) -> Result<(), Error> {
        match self {
            MarshalerRef::Builtin(m) => m.validate(iface, method, param),
            MarshalerRef::Custom(m) => m.validate(iface, method, param),
        }
    }

    pub fn to_native(
        &self,
        value: &Value,
        param: &ParamDescriptor,
        frame: &mut CallFrame,
    ) -> Result<NativeWord, Error> {
        match self {
            MarshalerRef::Builtin(m) => m.to_native(value, param, frame),
            MarshalerRef::Custom(m) => m.to_native(value, param, frame),
        }
    }

    pub fn from_native_out(
        &self,
        cell: &OutCell,
        param: &ParamDescriptor,
    ) -> Result<Value, Error> {
        match self {
            MarshalerRef::Builtin(m) => m.from_native_out(cell, param),
            MarshalerRef::Custom(m) => m.from_native_out(cell, param),
        }
    }

    pub fn to_local(&self, word: *mut c_void, param: &ParamDescriptor) -> Result<Value, Error> {
        match self {
            MarshalerRef::Builtin(m) => m.to_local(word, param),
            MarshalerRef::Custom(m) => m.to_local(word, param),
        }
    }

    pub fn write_back(
        &self,
        value: &Value,
        dest: *mut c_void,
        param: &ParamDescriptor,
    ) -> Result<(), Error> {
        match self {
            MarshalerRef::Builtin(m) => m.write_back(value, dest, param),
            MarshalerRef::Custom(m) => m.write_back(value, dest, param),
        }
    }
}

static CUSTOM: OnceLock<Mutex<HashMap<&'static str, Arc<dyn Marshal + Send + Sync>>>> =
    OnceLock::new();

fn custom() -> &'static Mutex<HashMap<&'static str, Arc<dyn Marshal + Send + Sync>>> {
    CUSTOM.get_or_init(Default::default)
}

/// Register a custom marshaler under a tag, referenced from descriptors via
/// `ParamType::Tagged`. The first registration for a tag wins; marshalers
/// are stateless and shared across every interface that uses the tag.
pub fn register_marshaler(tag: &'static str, marshaler: Arc<dyn Marshal + Send + Sync>) {
    custom().lock().unwrap().entry(tag).or_insert(marshaler);
}

/// Resolve the marshaler for a parameter. `None` means the value crosses in
/// its direct native representation. An unregistered tag is a marshaling
/// error, raised at validation time.
pub fn resolve(param: &ParamDescriptor) -> Result<Option<MarshalerRef>, Error> {
    let m = match &param.ty {
        ParamType::Interface(_) => MarshalerRef::Builtin(InterfaceMarshaler.into()),
        ParamType::InterfaceArray(_) => MarshalerRef::Builtin(InterfaceArrayMarshaler.into()),
        ParamType::ReadStream => MarshalerRef::Builtin(ReadStreamMarshaler.into()),
        ParamType::WriteStream => MarshalerRef::Builtin(WriteStreamMarshaler.into()),
        ParamType::NativeString => MarshalerRef::Builtin(NativeStringMarshaler.into()),
        ParamType::Tagged(tag) => {
            let found = custom().lock().unwrap().get(tag).cloned();
            match found {
                Some(m) => MarshalerRef::Custom(m),
                None => {
                    return Err(Error::marshal(
                        param.name.clone(),
                        format!("no custom marshaler registered under tag \"{tag}\""),
                    ))
                }
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(m))
}

/// Output-parameter cell: pointer-aligned storage handed to the native side
/// to write through, read back only after the call succeeds.
#[repr(C, align(8))]
pub struct OutCell([u8; 8]);

impl OutCell {
    pub fn zeroed() -> Box<OutCell> {
        Box::new(OutCell([0; 8]))
    }

    pub fn ptr(&self) -> *mut c_void {
        self.0.as_ptr() as *mut c_void
    }

    /// # Safety
    /// `T` must be at most 8 bytes and match what the native side wrote.
    pub unsafe fn read<T: Copy>(&self) -> T {
        debug_assert!(std::mem::size_of::<T>() <= 8);
        *(self.0.as_ptr() as *const T)
    }

    pub fn write<T: Copy>(&mut self, v: T) {
        debug_assert!(std::mem::size_of::<T>() <= 8);
        unsafe { *(self.0.as_mut_ptr() as *mut T) = v };
    }
}

/// Per-call scratch owning everything a native call borrows: argument
/// words, output cells, string buffers, pointer arrays, and wrapper
/// references that must stay alive until the call returns.
#[derive(Default)]
pub struct CallFrame {
    pub words: Vec<NativeWord>,
    pub cells: Vec<Box<OutCell>>,
    pub cstrings: Vec<CString>,
    pub wstrings: Vec<Vec<u16>>,
    pub ptr_arrays: Vec<Vec<*mut c_void>>,
    pub keepalive: Vec<ComRef>,
}

impl CallFrame {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Scalar conversions shared by both directions.
pub(crate) fn scalar_from_cell(cell: &OutCell, ty: &ParamType) -> Result<Value, Error> {
    unsafe { read_scalar(cell.ptr() as *const c_void, ty) }
}

/// # Safety
/// `src` must point to a live native value of the given scalar type.
pub(crate) unsafe fn read_scalar(src: *const c_void, ty: &ParamType) -> Result<Value, Error> {
    let v = match ty {
        ParamType::I8 => Value::I8(*(src as *const i8)),
        ParamType::U8 => Value::U8(*(src as *const u8)),
        ParamType::I16 => Value::I16(*(src as *const i16)),
        ParamType::U16 => Value::U16(*(src as *const u16)),
        ParamType::I32 => Value::I32(*(src as *const i32)),
        ParamType::U32 => Value::U32(*(src as *const u32)),
        ParamType::I64 => Value::I64(*(src as *const i64)),
        ParamType::U64 => Value::U64(*(src as *const u64)),
        ParamType::F32 => Value::F32(*(src as *const f32)),
        ParamType::F64 => Value::F64(*(src as *const f64)),
        ParamType::Bool => Value::Bool(*(src as *const u8) != 0),
        ParamType::Ptr => Value::Ptr(*(src as *const *mut c_void)),
        other => {
            return Err(Error::marshal(
                format!("{other:?}"),
                "not a directly-representable native type",
            ))
        }
    };
    Ok(v)
}

/// # Safety
/// `dest` must point to writable storage of the given scalar type.
pub(crate) unsafe fn write_scalar(
    dest: *mut c_void,
    value: &Value,
    ty: &ParamType,
) -> Result<(), Error> {
    match (ty, value) {
        (ParamType::I8, Value::I8(v)) => *(dest as *mut i8) = *v,
        (ParamType::U8, Value::U8(v)) => *(dest as *mut u8) = *v,
        (ParamType::I16, Value::I16(v)) => *(dest as *mut i16) = *v,
        (ParamType::U16, Value::U16(v)) => *(dest as *mut u16) = *v,
        (ParamType::I32, Value::I32(v)) => *(dest as *mut i32) = *v,
        (ParamType::U32, Value::U32(v)) => *(dest as *mut u32) = *v,
        (ParamType::I64, Value::I64(v)) => *(dest as *mut i64) = *v,
        (ParamType::U64, Value::U64(v)) => *(dest as *mut u64) = *v,
        (ParamType::F32, Value::F32(v)) => *(dest as *mut f32) = *v,
        (ParamType::F64, Value::F64(v)) => *(dest as *mut f64) = *v,
        (ParamType::Bool, Value::Bool(v)) => *(dest as *mut u8) = *v as u8,
        (ParamType::Ptr, Value::Ptr(v)) => *(dest as *mut *mut c_void) = *v,
        (ty, value) => {
            return Err(Error::marshal(
                format!("{ty:?}"),
                format!("cannot write a {} value as {ty:?}", value.kind()),
            ))
        }
    }
    Ok(())
}
