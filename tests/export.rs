//! Inbound wrappers driven the way native client code would: raw calls
//! through the exported vtable, reference-count symmetry, disposal
//! notification, and error-to-status conversion at the boundary.

mod common;

use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use combridge::{
    descriptor_of, export, ComDisposable, ComImpl, ComInterface, Error, Guid, HResult,
    InterfaceDescriptor, InterfaceDescriptorBuilder, MarshalDirection, MethodDescriptor,
    ParamType, ReturnKind, Value,
};
use common::IExportOnly;

const IID_ECHO: &str = "b67a3a9b-50d1-4d31-8a74-6a01bd01c210";
const IID_NATIVE_ONLY: &str = "b67a3a9b-50d1-4d31-8a74-6a01bd01c211";

struct IEcho;

impl ComInterface for IEcho {
    fn define() -> InterfaceDescriptorBuilder {
        InterfaceDescriptor::builder("IEcho", IID_ECHO)
            .method(
                MethodDescriptor::new("echo")
                    .input("value", ParamType::I32)
                    .output("doubled", ParamType::I32),
            )
            .method(
                MethodDescriptor::new("fail_with")
                    .input("code", ParamType::I32)
                    .returns(ReturnKind::Status),
            )
            .method(
                MethodDescriptor::new("is_even")
                    .input("value", ParamType::I32)
                    .returns(ReturnKind::Bool),
            )
            .method(
                MethodDescriptor::new("combine")
                    .input("other", ParamType::Interface(Guid::parse(IID_ECHO).unwrap()))
                    .input("value", ParamType::I32)
                    .output("result", ParamType::I32),
            )
            .method(MethodDescriptor::new("explode"))
            .method(
                MethodDescriptor::new("data_ptr")
                    .input("fail", ParamType::Bool)
                    .returns(ReturnKind::Pointer),
            )
    }
}

struct INativeOnly;

impl ComInterface for INativeOnly {
    fn define() -> InterfaceDescriptorBuilder {
        InterfaceDescriptor::builder("INativeOnly", IID_NATIVE_ONLY)
            .direction(MarshalDirection::NATIVE_TO_LOCAL)
            .method(MethodDescriptor::new("poke").input("value", ParamType::I32))
    }
}

#[derive(Default)]
struct LocalEcho {
    disposals: AtomicU32,
    saw_local_peer: AtomicBool,
}

impl ComImpl for LocalEcho {
    fn invoke(&self, method: usize, args: &mut [Value]) -> Result<Value, Error> {
        match method {
            // echo(value, out doubled)
            0 => {
                let v = args[0].as_i32()?;
                args[1] = Value::I32(v * 2);
                Ok(Value::Void)
            }
            // fail_with(code) -> status
            1 => {
                let code = args[0].as_i32()?;
                if code < 0 {
                    Err(Error::Com(HResult(code)))
                } else {
                    Ok(Value::I32(code))
                }
            }
            // is_even(value) -> bool
            2 => Ok(Value::Bool(args[0].as_i32()? % 2 == 0)),
            // combine(other, value, out result)
            3 => {
                let peer = match args[0].as_interface()? {
                    Some(p) => p.clone(),
                    None => return Err(Error::Com(HResult::E_POINTER)),
                };
                let v = args[1].as_i32()?;
                // a pointer to one of our own exports must come back as the
                // local implementation, not as a proxy over our own vtable
                if !peer.is_native() {
                    self.saw_local_peer.store(true, Ordering::SeqCst);
                }
                let mut inner = [Value::I32(v), Value::I32(0)];
                peer.call_index(0, &mut inner)?;
                args[2] = inner[1].clone();
                Ok(Value::Void)
            }
            // explode()
            4 => panic!("deliberate implementation panic"),
            // data_ptr(fail) -> raw pointer
            5 => {
                if args[0].as_bool()? {
                    Err(Error::Com(HResult::E_FAIL))
                } else {
                    Ok(Value::Ptr(self as *const LocalEcho as *mut std::ffi::c_void))
                }
            }
            _ => Err(Error::Com(HResult::E_NOTIMPL)),
        }
    }

    fn as_disposable(&self) -> Option<&dyn ComDisposable> {
        Some(self)
    }
}

impl ComDisposable for LocalEcho {
    fn last_native_reference_released(&self) {
        self.disposals.fetch_add(1, Ordering::SeqCst);
    }
}

/// Native view of the exported vtable.
#[repr(C)]
struct EchoVtbl {
    query_interface: unsafe extern "C" fn(*mut c_void, *const Guid, *mut *mut c_void) -> i32,
    add_ref: unsafe extern "C" fn(*mut c_void) -> u32,
    release: unsafe extern "C" fn(*mut c_void) -> u32,
    echo: unsafe extern "C" fn(*mut c_void, i32, *mut i32) -> i32,
    fail_with: unsafe extern "C" fn(*mut c_void, i32) -> i32,
    is_even: unsafe extern "C" fn(*mut c_void, i32) -> i32,
    combine: unsafe extern "C" fn(*mut c_void, *mut c_void, i32, *mut i32) -> i32,
    explode: unsafe extern "C" fn(*mut c_void) -> i32,
    data_ptr: unsafe extern "C" fn(*mut c_void, u8) -> *mut c_void,
}

unsafe fn vtbl(ptr: *mut c_void) -> &'static EchoVtbl {
    &**(ptr as *const *const EchoVtbl)
}

fn new_echo() -> (Arc<LocalEcho>, Arc<dyn ComImpl>) {
    let echo = Arc::new(LocalEcho::default());
    let imp: Arc<dyn ComImpl> = echo.clone();
    (echo, imp)
}

#[test]
fn exported_methods_are_native_callable() {
    let (_echo, imp) = new_echo();
    let ptr = export::<IEcho>(&imp, false).unwrap();

    unsafe {
        let v = vtbl(ptr);
        let mut out = 0;
        assert_eq!((v.echo)(ptr, 21, &mut out), HResult::OK.0);
        assert_eq!(out, 42);

        assert_eq!((v.is_even)(ptr, 4), HResult::OK.0);
        assert_eq!((v.is_even)(ptr, 5), HResult::FALSE.0);
    }
}

#[test]
fn reference_counting_is_symmetric_with_one_disposal() {
    let (echo, imp) = new_echo();
    let ptr = export::<IEcho>(&imp, false).unwrap();

    unsafe {
        let v = vtbl(ptr);
        assert_eq!((v.add_ref)(ptr), 1);
        assert_eq!((v.add_ref)(ptr), 2);
        assert_eq!((v.release)(ptr), 1);
        assert_eq!(echo.disposals.load(Ordering::SeqCst), 0);
        assert_eq!((v.release)(ptr), 0);
    }
    assert_eq!(echo.disposals.load(Ordering::SeqCst), 1);
}

#[test]
fn query_interface_answers_own_iid_and_the_universal_identity() {
    let (_echo, imp) = new_echo();
    let ptr = export::<IEcho>(&imp, false).unwrap();

    unsafe {
        let v = vtbl(ptr);
        let own = Guid::parse(IID_ECHO).unwrap();
        let unknown = Guid::parse("00000000-0000-0000-c000-000000000046").unwrap();
        let unrelated = Guid::parse(common::IID_ADDER).unwrap();

        let mut out = std::ptr::null_mut();
        assert_eq!((v.query_interface)(ptr, &own, &mut out), HResult::OK.0);
        assert_eq!(out, ptr);
        assert_eq!((v.release)(ptr), 0);

        out = std::ptr::null_mut();
        assert_eq!((v.query_interface)(ptr, &unknown, &mut out), HResult::OK.0);
        assert_eq!(out, ptr);
        assert_eq!((v.release)(ptr), 0);

        out = ptr;
        assert_eq!(
            (v.query_interface)(ptr, &unrelated, &mut out),
            HResult::E_NOINTERFACE.0
        );
        assert!(out.is_null());
    }
}

#[test]
fn implementation_errors_become_status_codes() {
    let (_echo, imp) = new_echo();
    let ptr = export::<IEcho>(&imp, false).unwrap();

    unsafe {
        let v = vtbl(ptr);
        assert_eq!((v.fail_with)(ptr, 5), 5);
        let code = HResult::E_UNINITIALIZED.0;
        assert_eq!((v.fail_with)(ptr, code), code);
    }
}

#[test]
fn implementation_panics_become_unexpected_failures() {
    let (_echo, imp) = new_echo();
    let ptr = export::<IEcho>(&imp, false).unwrap();

    unsafe {
        let v = vtbl(ptr);
        assert_eq!((v.explode)(ptr), HResult::E_UNEXPECTED.0);
    }
}

#[test]
fn pointer_returns_swallow_errors_as_null() {
    let (_echo, imp) = new_echo();
    let ptr = export::<IEcho>(&imp, false).unwrap();

    unsafe {
        let v = vtbl(ptr);
        // success yields the implementation's pointer
        assert!(!(v.data_ptr)(ptr, 0).is_null());
        // there is no status channel in this convention: the error is
        // discarded and the native caller sees null
        assert!((v.data_ptr)(ptr, 1).is_null());
    }
}

#[test]
fn exporting_twice_reuses_the_wrapper() {
    let (_echo, imp) = new_echo();
    let first = export::<IEcho>(&imp, false).unwrap();
    let second = export::<IEcho>(&imp, false).unwrap();
    assert_eq!(first, second);

    // ownership transfer bumps the counter on the cached wrapper
    let third = export::<IEcho>(&imp, true).unwrap();
    assert_eq!(third, first);
    unsafe {
        assert_eq!((vtbl(first).release)(first), 0);
    }
}

#[test]
fn our_own_pointers_short_circuit_to_the_local_implementation() {
    let (echo_a, imp_a) = new_echo();
    let (_echo_b, imp_b) = new_echo();
    let a = export::<IEcho>(&imp_a, false).unwrap();
    let b = export::<IEcho>(&imp_b, false).unwrap();

    unsafe {
        let v = vtbl(a);
        let mut out = 0;
        assert_eq!((v.combine)(a, b, 5, &mut out), HResult::OK.0);
        assert_eq!(out, 10);
    }
    assert!(echo_a.saw_local_peer.load(Ordering::SeqCst));
}

#[test]
fn reference_bump_recognizes_exported_pointers() {
    let (echo, imp) = new_echo();
    let ptr = export::<IEcho>(&imp, false).unwrap();

    combridge::live::add_ref(ptr).unwrap();
    unsafe {
        assert_eq!((vtbl(ptr).release)(ptr), 0);
    }
    assert_eq!(echo.disposals.load(Ordering::SeqCst), 1);
}

#[test]
fn wrapper_pins_the_implementation_while_native_holds_references() {
    let (echo, imp) = new_echo();
    let ptr = export::<IEcho>(&imp, true).unwrap();

    // drop every local handle; the native reference keeps the object alive
    drop(imp);
    drop(echo);

    unsafe {
        let v = vtbl(ptr);
        let mut out = 0;
        assert_eq!((v.echo)(ptr, 8, &mut out), HResult::OK.0);
        assert_eq!(out, 16);

        assert_eq!((v.release)(ptr), 0);
        // implementation gone and counter at zero: calls now fail fast
        // instead of touching freed state
        assert_eq!((v.echo)(ptr, 8, &mut out), HResult::E_UNEXPECTED.0);
    }
}

#[test]
fn export_respects_the_direction_policy() {
    let (_echo, imp) = new_echo();

    let err = export::<INativeOnly>(&imp, false).unwrap_err();
    assert!(matches!(err, Error::DirectionNotSupported { .. }));

    // the declared direction works
    let exp = descriptor_of::<IExportOnly>().unwrap();
    assert!(combridge::export::wrap(&exp, &imp, false).is_ok());
}
