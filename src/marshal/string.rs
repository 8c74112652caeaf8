//! Native string marshaler: null-terminated, platform-appropriate encoding.
//! Wide characters (UTF-16) on Windows, UTF-8 everywhere else — the usual
//! `LPCTSTR` convention on the native side. Strings cross one way only.

use std::ffi::c_void;
#[cfg(not(windows))]
use std::ffi::CString;

use super::{CallFrame, Marshal, OutCell};
use crate::descriptor::{MethodDescriptor, ParamDescriptor, ParamDirection, ParamType};
use crate::error::Error;
use crate::value::{NativeWord, Value};

#[derive(Clone, Copy, Default)]
pub struct NativeStringMarshaler;

impl Marshal for NativeStringMarshaler {
    fn validate(
        &self,
        iface: &str,
        method: &MethodDescriptor,
        param: &ParamDescriptor,
    ) -> Result<(), Error> {
        let ctx = format!("{iface}::{}({})", method.name, param.name);
        if param.ty != ParamType::NativeString {
            return Err(Error::marshal(
                ctx,
                "native-string marshaler applied to a non-string parameter",
            ));
        }
        if param.direction != ParamDirection::IN {
            return Err(Error::marshal(ctx, "native strings cross as inputs only"));
        }
        Ok(())
    }

    #[cfg(windows)]
    fn to_native(
        &self,
        value: &Value,
        _param: &ParamDescriptor,
        frame: &mut CallFrame,
    ) -> Result<NativeWord, Error> {
        let s = value.as_str()?;
        let mut wide: Vec<u16> = s.encode_utf16().collect();
        wide.push(0);
        frame.wstrings.push(wide);
        let stored = frame.wstrings.last().unwrap();
        Ok(NativeWord::Ptr(stored.as_ptr() as *mut c_void))
    }

    #[cfg(not(windows))]
    fn to_native(
        &self,
        value: &Value,
        param: &ParamDescriptor,
        frame: &mut CallFrame,
    ) -> Result<NativeWord, Error> {
        let s = value.as_str()?;
        let c = CString::new(s).map_err(|_| {
            Error::marshal(
                param.name.clone(),
                "string contains an interior NUL byte and cannot cross as a C string",
            )
        })?;
        frame.cstrings.push(c);
        let stored = frame.cstrings.last().unwrap();
        Ok(NativeWord::Ptr(stored.as_ptr() as *mut c_void))
    }

    fn from_native_out(&self, _cell: &OutCell, param: &ParamDescriptor) -> Result<Value, Error> {
        Err(input_only(param))
    }

    fn to_local(&self, word: *mut c_void, param: &ParamDescriptor) -> Result<Value, Error> {
        if word.is_null() {
            return Ok(Value::Str(String::new()));
        }
        decode(word, param)
    }

    fn write_back(
        &self,
        _value: &Value,
        _dest: *mut c_void,
        param: &ParamDescriptor,
    ) -> Result<(), Error> {
        Err(input_only(param))
    }
}

fn input_only(param: &ParamDescriptor) -> Error {
    Error::marshal(param.name.clone(), "native strings cross as inputs only")
}

#[cfg(windows)]
fn decode(word: *mut c_void, param: &ParamDescriptor) -> Result<Value, Error> {
    let mut chars = vec![];
    let mut p = word as *const u16;
    unsafe {
        while *p != 0 {
            chars.push(*p);
            p = p.add(1);
        }
    }
    String::from_utf16(&chars)
        .map(Value::Str)
        .map_err(|_| Error::marshal(param.name.clone(), "native string is not valid UTF-16"))
}

#[cfg(not(windows))]
fn decode(word: *mut c_void, param: &ParamDescriptor) -> Result<Value, Error> {
    let c = unsafe { std::ffi::CStr::from_ptr(word as *const std::ffi::c_char) };
    c.to_str()
        .map(|s| Value::Str(s.to_string()))
        .map_err(|_| Error::marshal(param.name.clone(), "native string is not valid UTF-8"))
}
