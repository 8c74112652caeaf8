//! Byte-stream interop. Two small fixed contracts — a readable stream
//! (read/seek/position/length) and a writable stream (write/flush) — let
//! `std::io` streams cross the boundary in either direction: a local stream
//! is exported behind a native-callable vtable, and a native stream pointer
//! becomes an object implementing the `std::io` traits.
//!
//! The interface ids are part of the wire contract and must match the
//! native side's declarations exactly.

use std::collections::HashMap;
use std::ffi::c_void;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

use super::{CallFrame, Marshal, OutCell};
use crate::comref::{self, ComRef};
use crate::descriptor::{
    InterfaceDescriptor, MethodDescriptor, ParamDescriptor, ParamDirection, ParamType, ReturnKind,
};
use crate::error::Error;
use crate::export::{self, ComImpl};
use crate::hresult::HResult;
use crate::value::{NativeWord, Value};

pub const READ_STREAM_IID: &str = "006af6db-734e-4595-8c94-19304b2389ac";
pub const WRITE_STREAM_IID: &str = "d7c3eb39-9170-43b9-ba98-2ea1f2fed8a8";

/// Position in a stream to seek from. Byte-valued on the wire.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SeekOrigin {
    Begin = 0,
    Current = 1,
    End = 2,
}

impl SeekOrigin {
    pub fn from_u8(v: u8) -> Result<Self, Error> {
        match v {
            0 => Ok(SeekOrigin::Begin),
            1 => Ok(SeekOrigin::Current),
            2 => Ok(SeekOrigin::End),
            other => Err(Error::marshal(
                "origin",
                format!("{other} is not a valid seek origin"),
            )),
        }
    }

    pub fn to_seek_from(self, offset: i64) -> SeekFrom {
        match self {
            SeekOrigin::Begin => SeekFrom::Start(offset as u64),
            SeekOrigin::Current => SeekFrom::Current(offset),
            SeekOrigin::End => SeekFrom::End(offset),
        }
    }
}

pub trait ReadSeek: Read + Seek {}
impl<T: Read + Seek> ReadSeek for T {}

/// Shared handles the stream values hold; the mutex serializes access from
/// whichever thread the native side calls on.
pub type SharedReadStream = Arc<Mutex<dyn ReadSeek + Send>>;
pub type SharedWriteStream = Arc<Mutex<dyn Write + Send>>;

static READ_DESC: OnceLock<Arc<InterfaceDescriptor>> = OnceLock::new();
static WRITE_DESC: OnceLock<Arc<InterfaceDescriptor>> = OnceLock::new();

/// The readable stream contract. `read` uses the status-code return so a
/// read past end of data (`E_EOF`) stays distinct from a zero-length read
/// (`S_FALSE`).
pub fn read_stream_descriptor() -> Arc<InterfaceDescriptor> {
    READ_DESC
        .get_or_init(|| {
            InterfaceDescriptor::builder("iReadStream", READ_STREAM_IID)
                .method(
                    MethodDescriptor::new("read")
                        .input("buffer", ParamType::Ptr)
                        .input("bytes_to_read", ParamType::I32)
                        .output("bytes_read", ParamType::I32)
                        .returns(ReturnKind::Status),
                )
                .method(
                    MethodDescriptor::new("seek")
                        .input("offset", ParamType::I64)
                        .input("origin", ParamType::U8),
                )
                .method(MethodDescriptor::new("get_position").output("position", ParamType::I64))
                .method(MethodDescriptor::new("get_length").output("length", ParamType::I64))
                .register()
                .expect("the read-stream contract is statically valid")
        })
        .clone()
}

/// The writable stream contract.
pub fn write_stream_descriptor() -> Arc<InterfaceDescriptor> {
    WRITE_DESC
        .get_or_init(|| {
            InterfaceDescriptor::builder("iWriteStream", WRITE_STREAM_IID)
                .method(
                    MethodDescriptor::new("write")
                        .input("buffer", ParamType::Ptr)
                        .input("bytes_to_write", ParamType::I32),
                )
                .method(MethodDescriptor::new("flush"))
                .register()
                .expect("the write-stream contract is statically valid")
        })
        .clone()
}

fn lock_stream<T: ?Sized>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>, Error> {
    m.lock().map_err(|_| Error::Com(HResult::E_UNEXPECTED))
}

fn io_failure(_e: io::Error) -> Error {
    Error::Com(HResult::E_FAIL)
}

/// Native-callable face of a local readable stream.
struct ReadStreamExport {
    stream: SharedReadStream,
}

impl ComImpl for ReadStreamExport {
    fn invoke(&self, method: usize, args: &mut [Value]) -> Result<Value, Error> {
        match method {
            // read(buffer, bytes_to_read, out bytes_read)
            0 => {
                let buffer = args[0].as_ptr()?;
                let requested = args[1].as_i32()?;
                if requested <= 0 {
                    args[2] = Value::I32(0);
                    return Ok(Value::I32(HResult::FALSE.0));
                }
                if buffer.is_null() {
                    return Err(Error::Com(HResult::E_POINTER));
                }
                let dest = unsafe {
                    std::slice::from_raw_parts_mut(buffer as *mut u8, requested as usize)
                };
                let mut stream = lock_stream(&self.stream)?;
                let mut total = 0;
                while total < dest.len() {
                    match stream.read(&mut dest[total..]) {
                        Ok(0) => break,
                        Ok(n) => total += n,
                        Err(e) => return Err(io_failure(e)),
                    }
                }
                if total == 0 {
                    return Err(Error::Com(HResult::E_EOF));
                }
                args[2] = Value::I32(total as i32);
                Ok(Value::I32(HResult::OK.0))
            }
            // seek(offset, origin)
            1 => {
                let offset = args[0].as_i64()?;
                let origin = SeekOrigin::from_u8(args[1].as_u8()?)?;
                let mut stream = lock_stream(&self.stream)?;
                stream
                    .seek(origin.to_seek_from(offset))
                    .map_err(io_failure)?;
                Ok(Value::Void)
            }
            // get_position(out position)
            2 => {
                let mut stream = lock_stream(&self.stream)?;
                let pos = stream.stream_position().map_err(io_failure)?;
                args[0] = Value::I64(pos as i64);
                Ok(Value::Void)
            }
            // get_length(out length)
            3 => {
                let mut stream = lock_stream(&self.stream)?;
                let pos = stream.stream_position().map_err(io_failure)?;
                let len = stream.seek(SeekFrom::End(0)).map_err(io_failure)?;
                stream.seek(SeekFrom::Start(pos)).map_err(io_failure)?;
                args[0] = Value::I64(len as i64);
                Ok(Value::Void)
            }
            _ => Err(Error::Com(HResult::E_NOTIMPL)),
        }
    }
}

/// Native-callable face of a local writable stream.
struct WriteStreamExport {
    stream: SharedWriteStream,
}

impl ComImpl for WriteStreamExport {
    fn invoke(&self, method: usize, args: &mut [Value]) -> Result<Value, Error> {
        match method {
            // write(buffer, bytes_to_write)
            0 => {
                let buffer = args[0].as_ptr()?;
                let count = args[1].as_i32()?;
                if count < 0 {
                    return Err(Error::Com(HResult::E_INVALIDARG));
                }
                if count == 0 {
                    return Ok(Value::Void);
                }
                if buffer.is_null() {
                    return Err(Error::Com(HResult::E_POINTER));
                }
                let src =
                    unsafe { std::slice::from_raw_parts(buffer as *const u8, count as usize) };
                let mut stream = lock_stream(&self.stream)?;
                stream.write_all(src).map_err(io_failure)?;
                Ok(Value::Void)
            }
            // flush()
            1 => {
                let mut stream = lock_stream(&self.stream)?;
                stream.flush().map_err(io_failure)?;
                Ok(Value::Void)
            }
            _ => Err(Error::Com(HResult::E_NOTIMPL)),
        }
    }
}

// One export adapter per underlying stream, alive as long as the stream is.
// Keyed by the shared handle's allocation address; a dead entry (the stream
// itself was dropped) is replaced on next use of that key.
type ReadAdapters = HashMap<usize, (Weak<Mutex<dyn ReadSeek + Send>>, Arc<ReadStreamExport>)>;
type WriteAdapters = HashMap<usize, (Weak<Mutex<dyn Write + Send>>, Arc<WriteStreamExport>)>;

static READ_ADAPTERS: OnceLock<Mutex<ReadAdapters>> = OnceLock::new();
static WRITE_ADAPTERS: OnceLock<Mutex<WriteAdapters>> = OnceLock::new();

pub(crate) fn export_read_stream(
    stream: &SharedReadStream,
    add_ref: bool,
) -> Result<*mut c_void, Error> {
    let key = Arc::as_ptr(stream) as *const () as usize;
    let adapter = {
        let mut map = READ_ADAPTERS.get_or_init(Default::default).lock().unwrap();
        match map.get(&key) {
            Some((alive, adapter)) if alive.upgrade().is_some() => adapter.clone(),
            _ => {
                let adapter = Arc::new(ReadStreamExport {
                    stream: stream.clone(),
                });
                map.insert(key, (Arc::downgrade(stream), adapter.clone()));
                adapter
            }
        }
    };
    let imp: Arc<dyn ComImpl> = adapter;
    export::wrap(&read_stream_descriptor(), &imp, add_ref)
}

pub(crate) fn export_write_stream(
    stream: &SharedWriteStream,
    add_ref: bool,
) -> Result<*mut c_void, Error> {
    let key = Arc::as_ptr(stream) as *const () as usize;
    let adapter = {
        let mut map = WRITE_ADAPTERS.get_or_init(Default::default).lock().unwrap();
        match map.get(&key) {
            Some((alive, adapter)) if alive.upgrade().is_some() => adapter.clone(),
            _ => {
                let adapter = Arc::new(WriteStreamExport {
                    stream: stream.clone(),
                });
                map.insert(key, (Arc::downgrade(stream), adapter.clone()));
                adapter
            }
        }
    };
    let imp: Arc<dyn ComImpl> = adapter;
    export::wrap(&write_stream_descriptor(), &imp, add_ref)
}

/// `std::io` face of a native readable stream.
pub struct ProxyReadStream {
    iface: ComRef,
}

impl ProxyReadStream {
    pub(crate) fn new(iface: ComRef) -> Self {
        Self { iface }
    }
}

impl Read for ProxyReadStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let len = buf.len().min(i32::MAX as usize) as i32;
        let mut args = [
            Value::Ptr(buf.as_mut_ptr() as *mut c_void),
            Value::I32(len),
            Value::I32(0),
        ];
        match self.iface.call_index(0, &mut args) {
            Ok(_) => {
                let read = args[2].as_i32().unwrap_or(0);
                Ok(read.max(0) as usize)
            }
            // end of data maps onto the io convention for EOF
            Err(Error::Com(hr)) if hr == HResult::E_EOF => Ok(0),
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e)),
        }
    }
}

impl Seek for ProxyReadStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let (offset, origin) = match pos {
            SeekFrom::Start(o) => (o as i64, SeekOrigin::Begin),
            SeekFrom::Current(o) => (o, SeekOrigin::Current),
            SeekFrom::End(o) => (o, SeekOrigin::End),
        };
        let mut args = [Value::I64(offset), Value::U8(origin as u8)];
        self.iface
            .call_index(1, &mut args)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        let mut args = [Value::I64(0)];
        self.iface
            .call_index(2, &mut args)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(args[0].as_i64().unwrap_or(0) as u64)
    }
}

/// `std::io` face of a native writable stream.
pub struct ProxyWriteStream {
    iface: ComRef,
}

impl ProxyWriteStream {
    pub(crate) fn new(iface: ComRef) -> Self {
        Self { iface }
    }
}

impl Write for ProxyWriteStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let len = buf.len().min(i32::MAX as usize) as i32;
        let mut args = [Value::Ptr(buf.as_ptr() as *mut c_void), Value::I32(len)];
        self.iface
            .call_index(0, &mut args)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(len as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut args: [Value; 0] = [];
        self.iface
            .call_index(1, &mut args)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(())
    }
}

fn stream_direction_ok(ctx: String, param: &ParamDescriptor) -> Result<(), Error> {
    if param.direction == ParamDirection::INOUT {
        return Err(Error::contract(
            ctx,
            "streams can be marshaled in or out, in-out is not supported",
        ));
    }
    Ok(())
}

/// Readable stream ↔ opaque pointer.
#[derive(Clone, Copy, Default)]
pub struct ReadStreamMarshaler;

impl Marshal for ReadStreamMarshaler {
    fn validate(
        &self,
        iface: &str,
        method: &MethodDescriptor,
        param: &ParamDescriptor,
    ) -> Result<(), Error> {
        let ctx = format!("{iface}::{}({})", method.name, param.name);
        if param.ty != ParamType::ReadStream {
            return Err(Error::marshal(
                ctx,
                "read-stream marshaler applied to a non-stream parameter",
            ));
        }
        stream_direction_ok(ctx, param)
    }

    fn to_native(
        &self,
        value: &Value,
        _param: &ParamDescriptor,
        _frame: &mut CallFrame,
    ) -> Result<NativeWord, Error> {
        match value.as_read_stream()? {
            None => Ok(NativeWord::Ptr(std::ptr::null_mut())),
            Some(s) => Ok(NativeWord::Ptr(export_read_stream(s, false)?)),
        }
    }

    fn from_native_out(&self, cell: &OutCell, _param: &ParamDescriptor) -> Result<Value, Error> {
        let ptr = unsafe { cell.read::<*mut c_void>() };
        if ptr.is_null() {
            return Ok(Value::ReadStream(None));
        }
        let iface = comref::wrap_owned(&read_stream_descriptor(), ptr)?;
        Ok(Value::ReadStream(Some(Arc::new(Mutex::new(
            ProxyReadStream::new(iface),
        )))))
    }

    fn to_local(&self, word: *mut c_void, _param: &ParamDescriptor) -> Result<Value, Error> {
        if word.is_null() {
            return Ok(Value::ReadStream(None));
        }
        let iface = comref::wrap_borrowed(&read_stream_descriptor(), word)?;
        Ok(Value::ReadStream(Some(Arc::new(Mutex::new(
            ProxyReadStream::new(iface),
        )))))
    }

    fn write_back(
        &self,
        value: &Value,
        dest: *mut c_void,
        _param: &ParamDescriptor,
    ) -> Result<(), Error> {
        let ptr = match value.as_read_stream()? {
            None => std::ptr::null_mut(),
            Some(s) => export_read_stream(s, true)?,
        };
        unsafe { *(dest as *mut *mut c_void) = ptr };
        Ok(())
    }
}

/// Writable stream ↔ opaque pointer.
#[derive(Clone, Copy, Default)]
pub struct WriteStreamMarshaler;

impl Marshal for WriteStreamMarshaler {
    fn validate(
        &self,
        iface: &str,
        method: &MethodDescriptor,
        param: &ParamDescriptor,
    ) -> Result<(), Error> {
        let ctx = format!("{iface}::{}({})", method.name, param.name);
        if param.ty != ParamType::WriteStream {
            return Err(Error::marshal(
                ctx,
                "write-stream marshaler applied to a non-stream parameter",
            ));
        }
        stream_direction_ok(ctx, param)
    }

    fn to_native(
        &self,
        value: &Value,
        _param: &ParamDescriptor,
        _frame: &mut CallFrame,
    ) -> Result<NativeWord, Error> {
        match value.as_write_stream()? {
            None => Ok(NativeWord::Ptr(std::ptr::null_mut())),
            Some(s) => Ok(NativeWord::Ptr(export_write_stream(s, false)?)),
        }
    }

    fn from_native_out(&self, cell: &OutCell, _param: &ParamDescriptor) -> Result<Value, Error> {
        let ptr = unsafe { cell.read::<*mut c_void>() };
        if ptr.is_null() {
            return Ok(Value::WriteStream(None));
        }
        let iface = comref::wrap_owned(&write_stream_descriptor(), ptr)?;
        Ok(Value::WriteStream(Some(Arc::new(Mutex::new(
            ProxyWriteStream::new(iface),
        )))))
    }

    fn to_local(&self, word: *mut c_void, _param: &ParamDescriptor) -> Result<Value, Error> {
        if word.is_null() {
            return Ok(Value::WriteStream(None));
        }
        let iface = comref::wrap_borrowed(&write_stream_descriptor(), word)?;
        Ok(Value::WriteStream(Some(Arc::new(Mutex::new(
            ProxyWriteStream::new(iface),
        )))))
    }

    fn write_back(
        &self,
        value: &Value,
        dest: *mut c_void,
        _param: &ParamDescriptor,
    ) -> Result<(), Error> {
        let ptr = match value.as_write_stream()? {
            None => std::ptr::null_mut(),
            Some(s) => export_write_stream(s, true)?,
        };
        unsafe { *(dest as *mut *mut c_void) = ptr };
        Ok(())
    }
}
