//! The boundary value model: `Value` is what local callers and
//! implementations traffic in, `NativeWord` is the wire form a single
//! argument takes while a native call is in flight.

use std::ffi::c_void;
use std::fmt::{Debug, Formatter};

use libffi::middle::Arg;

use crate::comref::ComRef;
use crate::descriptor::ParamType;
use crate::error::Error;
use crate::marshal::stream::{SharedReadStream, SharedWriteStream};

#[derive(Clone)]
pub enum Value {
    Void,
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Bool(bool),
    Ptr(*mut c_void),
    /// Native string payload. A null native pointer unmarshals as the empty
    /// string.
    Str(String),
    Interface(Option<ComRef>),
    InterfaceArray(Vec<Option<ComRef>>),
    ReadStream(Option<SharedReadStream>),
    WriteStream(Option<SharedWriteStream>),
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Void => "void",
            Value::I8(_) => "i8",
            Value::U8(_) => "u8",
            Value::I16(_) => "i16",
            Value::U16(_) => "u16",
            Value::I32(_) => "i32",
            Value::U32(_) => "u32",
            Value::I64(_) => "i64",
            Value::U64(_) => "u64",
            Value::F32(_) => "f32",
            Value::F64(_) => "f64",
            Value::Bool(_) => "bool",
            Value::Ptr(_) => "ptr",
            Value::Str(_) => "str",
            Value::Interface(_) => "interface",
            Value::InterfaceArray(_) => "interface[]",
            Value::ReadStream(_) => "read-stream",
            Value::WriteStream(_) => "write-stream",
        }
    }

    /// Seed value for an output temporary of the given declared type,
    /// overwritten after the native call succeeds.
    pub fn default_for(ty: &ParamType) -> Value {
        match ty {
            ParamType::I8 => Value::I8(0),
            ParamType::U8 => Value::U8(0),
            ParamType::I16 => Value::I16(0),
            ParamType::U16 => Value::U16(0),
            ParamType::I32 => Value::I32(0),
            ParamType::U32 => Value::U32(0),
            ParamType::I64 => Value::I64(0),
            ParamType::U64 => Value::U64(0),
            ParamType::F32 => Value::F32(0.0),
            ParamType::F64 => Value::F64(0.0),
            ParamType::Bool => Value::Bool(false),
            ParamType::Ptr => Value::Ptr(std::ptr::null_mut()),
            ParamType::NativeString => Value::Str(String::new()),
            ParamType::Interface(_) => Value::Interface(None),
            ParamType::InterfaceArray(_) => Value::InterfaceArray(vec![]),
            ParamType::ReadStream => Value::ReadStream(None),
            ParamType::WriteStream => Value::WriteStream(None),
            ParamType::Tagged(_) => Value::Ptr(std::ptr::null_mut()),
        }
    }

    fn mismatch(&self, expected: &'static str) -> Error {
        Error::marshal(
            expected,
            format!("expected a {expected} value, received {}", self.kind()),
        )
    }

    pub fn as_u8(&self) -> Result<u8, Error> {
        match self {
            Value::U8(v) => Ok(*v),
            other => Err(other.mismatch("u8")),
        }
    }

    pub fn as_i32(&self) -> Result<i32, Error> {
        match self {
            Value::I32(v) => Ok(*v),
            other => Err(other.mismatch("i32")),
        }
    }

    pub fn as_i64(&self) -> Result<i64, Error> {
        match self {
            Value::I64(v) => Ok(*v),
            other => Err(other.mismatch("i64")),
        }
    }

    pub fn as_bool(&self) -> Result<bool, Error> {
        match self {
            Value::Bool(v) => Ok(*v),
            other => Err(other.mismatch("bool")),
        }
    }

    pub fn as_ptr(&self) -> Result<*mut c_void, Error> {
        match self {
            Value::Ptr(v) => Ok(*v),
            other => Err(other.mismatch("ptr")),
        }
    }

    pub fn as_str(&self) -> Result<&str, Error> {
        match self {
            Value::Str(v) => Ok(v),
            other => Err(other.mismatch("str")),
        }
    }

    pub fn as_interface(&self) -> Result<Option<&ComRef>, Error> {
        match self {
            Value::Interface(v) => Ok(v.as_ref()),
            other => Err(other.mismatch("interface")),
        }
    }

    pub fn as_read_stream(&self) -> Result<Option<&SharedReadStream>, Error> {
        match self {
            Value::ReadStream(v) => Ok(v.as_ref()),
            other => Err(other.mismatch("read-stream")),
        }
    }

    pub fn as_write_stream(&self) -> Result<Option<&SharedWriteStream>, Error> {
        match self {
            Value::WriteStream(v) => Ok(v.as_ref()),
            other => Err(other.mismatch("write-stream")),
        }
    }
}

impl Debug for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Void => write!(f, "Void"),
            Value::I8(v) => write!(f, "I8({v})"),
            Value::U8(v) => write!(f, "U8({v})"),
            Value::I16(v) => write!(f, "I16({v})"),
            Value::U16(v) => write!(f, "U16({v})"),
            Value::I32(v) => write!(f, "I32({v})"),
            Value::U32(v) => write!(f, "U32({v})"),
            Value::I64(v) => write!(f, "I64({v})"),
            Value::U64(v) => write!(f, "U64({v})"),
            Value::F32(v) => write!(f, "F32({v})"),
            Value::F64(v) => write!(f, "F64({v})"),
            Value::Bool(v) => write!(f, "Bool({v})"),
            Value::Ptr(v) => write!(f, "Ptr({v:?})"),
            Value::Str(v) => write!(f, "Str({v:?})"),
            Value::Interface(Some(_)) => write!(f, "Interface(..)"),
            Value::Interface(None) => write!(f, "Interface(null)"),
            Value::InterfaceArray(v) => write!(f, "InterfaceArray(len {})", v.len()),
            Value::ReadStream(v) => write!(f, "ReadStream({})", opt(v.is_some())),
            Value::WriteStream(v) => write!(f, "WriteStream({})", opt(v.is_some())),
        }
    }
}

fn opt(present: bool) -> &'static str {
    if present {
        ".."
    } else {
        "null"
    }
}

/// Storage for one in-flight native argument. The words live in the call
/// frame for the duration of the native call; `as_arg` borrows the stored
/// field, so the vector they sit in must not move once built.
#[derive(Clone, Copy, Debug)]
pub enum NativeWord {
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Ptr(*mut c_void),
}

impl NativeWord {
    pub fn as_arg(&self) -> Arg {
        match self {
            NativeWord::I8(v) => Arg::new(v),
            NativeWord::U8(v) => Arg::new(v),
            NativeWord::I16(v) => Arg::new(v),
            NativeWord::U16(v) => Arg::new(v),
            NativeWord::I32(v) => Arg::new(v),
            NativeWord::U32(v) => Arg::new(v),
            NativeWord::I64(v) => Arg::new(v),
            NativeWord::U64(v) => Arg::new(v),
            NativeWord::F32(v) => Arg::new(v),
            NativeWord::F64(v) => Arg::new(v),
            NativeWord::Ptr(v) => Arg::new(v),
        }
    }
}

/// Direct native representation of a scalar argument.
pub(crate) fn scalar_word(value: &Value, ty: &ParamType) -> Result<NativeWord, Error> {
    let word = match (ty, value) {
        (ParamType::I8, Value::I8(v)) => NativeWord::I8(*v),
        (ParamType::U8, Value::U8(v)) => NativeWord::U8(*v),
        (ParamType::I16, Value::I16(v)) => NativeWord::I16(*v),
        (ParamType::U16, Value::U16(v)) => NativeWord::U16(*v),
        (ParamType::I32, Value::I32(v)) => NativeWord::I32(*v),
        (ParamType::U32, Value::U32(v)) => NativeWord::U32(*v),
        (ParamType::I64, Value::I64(v)) => NativeWord::I64(*v),
        (ParamType::U64, Value::U64(v)) => NativeWord::U64(*v),
        (ParamType::F32, Value::F32(v)) => NativeWord::F32(*v),
        (ParamType::F64, Value::F64(v)) => NativeWord::F64(*v),
        (ParamType::Bool, Value::Bool(v)) => NativeWord::U8(*v as u8),
        (ParamType::Ptr, Value::Ptr(v)) => NativeWord::Ptr(*v),
        (ty, value) => {
            return Err(Error::marshal(
                format!("{ty:?}"),
                format!("cannot pass a {} value as {ty:?}", value.kind()),
            ))
        }
    };
    Ok(word)
}
