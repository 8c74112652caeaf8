//! Custom marshaler registration and resolution through a real native call:
//! a tagged parameter crosses as a pointer-sized word under the control of a
//! user-registered converter.

use std::ffi::c_void;
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, Mutex};

use combridge::marshal::{CallFrame, OutCell};
use combridge::value::NativeWord;
use combridge::{
    register_marshaler, ComInterface, Error, Guid, InterfaceDescriptor,
    InterfaceDescriptorBuilder, Marshal, MethodDescriptor, ParamDescriptor, ParamDirection,
    ParamType, Value,
};

const IID_HANDLE_TAKER: &str = "b67a3a9b-50d1-4d31-8a74-6a01bd01c230";

/// Treats a `Value::I64` as an opaque handle, passing the raw value in the
/// pointer word itself. Input only.
struct HandleMarshaler;

impl Marshal for HandleMarshaler {
    fn validate(
        &self,
        iface: &str,
        method: &MethodDescriptor,
        param: &ParamDescriptor,
    ) -> Result<(), Error> {
        if param.direction != ParamDirection::IN {
            return Err(Error::marshal(
                format!("{iface}::{}({})", method.name, param.name),
                "handles cross as inputs only",
            ));
        }
        Ok(())
    }

    fn to_native(
        &self,
        value: &Value,
        _param: &ParamDescriptor,
        _frame: &mut CallFrame,
    ) -> Result<NativeWord, Error> {
        Ok(NativeWord::Ptr(value.as_i64()? as usize as *mut c_void))
    }

    fn from_native_out(&self, _cell: &OutCell, param: &ParamDescriptor) -> Result<Value, Error> {
        Err(Error::marshal(param.name.clone(), "handles cross as inputs only"))
    }

    fn to_local(&self, word: *mut c_void, _param: &ParamDescriptor) -> Result<Value, Error> {
        Ok(Value::I64(word as usize as i64))
    }

    fn write_back(
        &self,
        _value: &Value,
        _dest: *mut c_void,
        param: &ParamDescriptor,
    ) -> Result<(), Error> {
        Err(Error::marshal(param.name.clone(), "handles cross as inputs only"))
    }
}

struct IHandleTaker;

impl ComInterface for IHandleTaker {
    fn define() -> InterfaceDescriptorBuilder {
        register_marshaler("handle", Arc::new(HandleMarshaler));
        InterfaceDescriptor::builder("IHandleTaker", IID_HANDLE_TAKER).method(
            MethodDescriptor::new("take_handle")
                .input("handle", ParamType::Tagged("handle"))
                .ret_via(1, ParamType::I64),
        )
    }
}

#[repr(C)]
struct TakerVtbl {
    query_interface: unsafe extern "C" fn(*mut c_void, *const Guid, *mut *mut c_void) -> i32,
    add_ref: unsafe extern "C" fn(*mut c_void) -> u32,
    release: unsafe extern "C" fn(*mut c_void) -> u32,
    take_handle: unsafe extern "C" fn(*mut c_void, *mut c_void, *mut i64) -> i32,
}

#[repr(C)]
struct TakerObj {
    vtbl: *const TakerVtbl,
    refs: AtomicU32,
    seen: Arc<Mutex<Vec<u64>>>,
}

unsafe fn obj(this: *mut c_void) -> &'static TakerObj {
    &*(this as *const TakerObj)
}

unsafe extern "C" fn qi(this: *mut c_void, iid: *const Guid, out: *mut *mut c_void) -> i32 {
    let unknown = Guid::parse("00000000-0000-0000-c000-000000000046").unwrap();
    if *iid == Guid::parse(IID_HANDLE_TAKER).unwrap() || *iid == unknown {
        obj(this).refs.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        *out = this;
        0
    } else {
        *out = std::ptr::null_mut();
        0x8000_4002u32 as i32
    }
}

unsafe extern "C" fn add_ref(this: *mut c_void) -> u32 {
    obj(this).refs.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1
}

unsafe extern "C" fn release(this: *mut c_void) -> u32 {
    let remaining = obj(this)
        .refs
        .fetch_sub(1, std::sync::atomic::Ordering::SeqCst)
        - 1;
    if remaining == 0 {
        drop(Box::from_raw(this as *mut TakerObj));
    }
    remaining
}

unsafe extern "C" fn take_handle(this: *mut c_void, handle: *mut c_void, echoed: *mut i64) -> i32 {
    obj(this).seen.lock().unwrap().push(handle as usize as u64);
    *echoed = handle as usize as i64;
    0
}

static TAKER_VTBL: TakerVtbl = TakerVtbl {
    query_interface: qi,
    add_ref,
    release,
    take_handle,
};

fn create_taker() -> (*mut c_void, Arc<Mutex<Vec<u64>>>) {
    let seen = Arc::new(Mutex::new(vec![]));
    let boxed = Box::new(TakerObj {
        vtbl: &TAKER_VTBL,
        refs: AtomicU32::new(1),
        seen: seen.clone(),
    });
    (Box::into_raw(boxed) as *mut c_void, seen)
}

#[test]
fn tagged_parameters_resolve_to_the_registered_marshaler() {
    let (ptr, seen) = create_taker();
    let taker = combridge::wrap::<IHandleTaker>(ptr).unwrap();

    let echoed = taker
        .call("take_handle", &mut [Value::I64(0x1234_5678)])
        .unwrap();
    assert_eq!(echoed.as_i64().unwrap(), 0x1234_5678);
    assert_eq!(&*seen.lock().unwrap(), &[0x1234_5678u64]);
}

#[test]
fn unregistered_tags_fail_at_validation_time() {
    let err = InterfaceDescriptor::builder(
        "IOrphan",
        "b67a3a9b-50d1-4d31-8a74-6a01bd01c231",
    )
    .method(MethodDescriptor::new("go").input("thing", ParamType::Tagged("no-such-tag")))
    .register()
    .unwrap_err();
    assert!(matches!(err, Error::Marshal { .. }));
}
