//! Hand-built native objects standing in for the C++ side of the interop:
//! `#[repr(C)]` vtable-first structs with `extern "C"` slots, reference
//! counted and destroyed exactly the way a native implementation would.

#![allow(dead_code)]

use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use combridge::{
    ComInterface, Guid, InterfaceDescriptor, InterfaceDescriptorBuilder, MarshalDirection,
    MethodDescriptor, ParamType, ReturnKind,
};

pub const IID_ADDER: &str = "b67a3a9b-50d1-4d31-8a74-6a01bd01c201";
pub const IID_CALCULATOR: &str = "b67a3a9b-50d1-4d31-8a74-6a01bd01c202";
pub const IID_EXPORT_ONLY: &str = "b67a3a9b-50d1-4d31-8a74-6a01bd01c203";

/// The failure code the fixture reports for arithmetic overflow.
pub const E_BOUNDS: i32 = 0x8000_000Bu32 as i32;
pub const E_FAIL: i32 = 0x8000_4005u32 as i32;

pub fn adder_iid() -> Guid {
    Guid::parse(IID_ADDER).unwrap()
}

/// Basic calculator surface. `add` delivers its result through an output
/// slot; the other methods cover the remaining return conventions.
pub struct IAdder;

impl ComInterface for IAdder {
    fn define() -> InterfaceDescriptorBuilder {
        InterfaceDescriptor::builder("IAdder", IID_ADDER)
            .method(
                MethodDescriptor::new("add")
                    .input("a", ParamType::I32)
                    .input("b", ParamType::I32)
                    .ret_via(2, ParamType::I32),
            )
            .method(
                MethodDescriptor::new("echo_status")
                    .input("code", ParamType::I32)
                    .returns(ReturnKind::Status),
            )
            .method(
                MethodDescriptor::new("is_positive")
                    .input("value", ParamType::I32)
                    .returns(ReturnKind::Bool),
            )
            .method(
                MethodDescriptor::new("parse_int")
                    .input("text", ParamType::NativeString)
                    .ret_via(1, ParamType::I32),
            )
            .method(
                MethodDescriptor::new("clone_self")
                    .output("copy", ParamType::Interface(Guid::parse(IID_ADDER).unwrap())),
            )
            .method(
                MethodDescriptor::new("count_items")
                    .input(
                        "items",
                        ParamType::InterfaceArray(Guid::parse(IID_ADDER).unwrap()),
                    )
                    .input("count", ParamType::I32)
                    .ret_via(2, ParamType::I32),
            )
    }
}

/// Derived surface: everything the adder does, plus `mul`.
pub struct ICalculator;

impl ComInterface for ICalculator {
    fn define() -> InterfaceDescriptorBuilder {
        let base = combridge::descriptor_of::<IAdder>().unwrap();
        InterfaceDescriptor::builder("ICalculator", IID_CALCULATOR)
            .extends(&base)
            .method(
                MethodDescriptor::new("mul")
                    .input("a", ParamType::I32)
                    .input("b", ParamType::I32)
                    .ret_via(2, ParamType::I32),
            )
    }
}

/// Declared local-to-native only; wrapping a native pointer under it is the
/// disallowed direction.
pub struct IExportOnly;

impl ComInterface for IExportOnly {
    fn define() -> InterfaceDescriptorBuilder {
        InterfaceDescriptor::builder("IExportOnly", IID_EXPORT_ONLY)
            .direction(MarshalDirection::LOCAL_TO_NATIVE)
            .method(MethodDescriptor::new("poke").input("value", ParamType::I32))
    }
}

/// Observable fixture state that outlives the native object.
pub struct FixtureCounters {
    pub refs: AtomicU32,
    pub destroyed: AtomicBool,
    pub qi_calls: AtomicU32,
}

impl FixtureCounters {
    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn qi_calls(&self) -> u32 {
        self.qi_calls.load(Ordering::SeqCst)
    }
}

#[repr(C)]
pub struct AdderVtbl {
    pub query_interface:
        unsafe extern "C" fn(*mut c_void, *const Guid, *mut *mut c_void) -> i32,
    pub add_ref: unsafe extern "C" fn(*mut c_void) -> u32,
    pub release: unsafe extern "C" fn(*mut c_void) -> u32,
    pub add: unsafe extern "C" fn(*mut c_void, i32, i32, *mut i32) -> i32,
    pub echo_status: unsafe extern "C" fn(*mut c_void, i32) -> i32,
    pub is_positive: unsafe extern "C" fn(*mut c_void, i32) -> i32,
    pub parse_int: unsafe extern "C" fn(*mut c_void, *const c_void, *mut i32) -> i32,
    pub clone_self: unsafe extern "C" fn(*mut c_void, *mut *mut c_void) -> i32,
    pub count_items:
        unsafe extern "C" fn(*mut c_void, *const *mut c_void, i32, *mut i32) -> i32,
}

#[repr(C)]
pub struct CalcVtbl {
    pub base: AdderVtbl,
    pub mul: unsafe extern "C" fn(*mut c_void, i32, i32, *mut i32) -> i32,
}

#[repr(C)]
struct AdderObj {
    vtbl: *const c_void,
    supports_calc: bool,
    counters: Arc<FixtureCounters>,
}

unsafe fn obj(this: *mut c_void) -> &'static AdderObj {
    &*(this as *const AdderObj)
}

unsafe extern "C" fn adder_qi(this: *mut c_void, iid: *const Guid, out: *mut *mut c_void) -> i32 {
    let o = obj(this);
    o.counters.qi_calls.fetch_add(1, Ordering::SeqCst);
    if out.is_null() || iid.is_null() {
        return E_FAIL;
    }
    let requested = *iid;
    let unknown = Guid::parse("00000000-0000-0000-c000-000000000046").unwrap();
    let supported = requested == Guid::parse(IID_ADDER).unwrap()
        || (o.supports_calc && requested == Guid::parse(IID_CALCULATOR).unwrap())
        || requested == unknown;
    if supported {
        o.counters.refs.fetch_add(1, Ordering::SeqCst);
        *out = this;
        0
    } else {
        *out = std::ptr::null_mut();
        0x8000_4002u32 as i32 // E_NOINTERFACE
    }
}

unsafe extern "C" fn adder_add_ref(this: *mut c_void) -> u32 {
    obj(this).counters.refs.fetch_add(1, Ordering::SeqCst) + 1
}

unsafe extern "C" fn adder_release(this: *mut c_void) -> u32 {
    let counters = obj(this).counters.clone();
    let remaining = counters.refs.fetch_sub(1, Ordering::SeqCst) - 1;
    if remaining == 0 {
        counters.destroyed.store(true, Ordering::SeqCst);
        drop(Box::from_raw(this as *mut AdderObj));
    }
    remaining
}

unsafe extern "C" fn adder_add(this: *mut c_void, a: i32, b: i32, result: *mut i32) -> i32 {
    let _ = obj(this);
    match a.checked_add(b) {
        Some(sum) => {
            *result = sum;
            0
        }
        None => E_BOUNDS,
    }
}

unsafe extern "C" fn adder_echo_status(_this: *mut c_void, code: i32) -> i32 {
    code
}

unsafe extern "C" fn adder_is_positive(_this: *mut c_void, value: i32) -> i32 {
    if value > 0 {
        0 // S_OK => true
    } else {
        1 // S_FALSE => false
    }
}

#[cfg(not(windows))]
unsafe extern "C" fn adder_parse_int(
    _this: *mut c_void,
    text: *const c_void,
    result: *mut i32,
) -> i32 {
    let s = std::ffi::CStr::from_ptr(text as *const std::ffi::c_char);
    match s.to_str().ok().and_then(|s| s.parse::<i32>().ok()) {
        Some(v) => {
            *result = v;
            0
        }
        None => E_FAIL,
    }
}

#[cfg(windows)]
unsafe extern "C" fn adder_parse_int(
    _this: *mut c_void,
    text: *const c_void,
    result: *mut i32,
) -> i32 {
    let mut chars = vec![];
    let mut p = text as *const u16;
    while *p != 0 {
        chars.push(*p);
        p = p.add(1);
    }
    match String::from_utf16(&chars).ok().and_then(|s| s.parse::<i32>().ok()) {
        Some(v) => {
            *result = v;
            0
        }
        None => E_FAIL,
    }
}

unsafe extern "C" fn adder_clone_self(this: *mut c_void, out: *mut *mut c_void) -> i32 {
    // hand out another reference to the same object, per the output-param
    // ownership convention
    obj(this).counters.refs.fetch_add(1, Ordering::SeqCst);
    *out = this;
    0
}

unsafe extern "C" fn adder_count_items(
    _this: *mut c_void,
    items: *const *mut c_void,
    count: i32,
    result: *mut i32,
) -> i32 {
    if count < 0 || (count > 0 && items.is_null()) {
        return E_FAIL;
    }
    for i in 0..count as usize {
        if (*items.add(i)).is_null() {
            return E_FAIL;
        }
    }
    *result = count;
    0
}

unsafe extern "C" fn calc_mul(_this: *mut c_void, a: i32, b: i32, result: *mut i32) -> i32 {
    match a.checked_mul(b) {
        Some(product) => {
            *result = product;
            0
        }
        None => E_BOUNDS,
    }
}

static ADDER_VTBL: AdderVtbl = AdderVtbl {
    query_interface: adder_qi,
    add_ref: adder_add_ref,
    release: adder_release,
    add: adder_add,
    echo_status: adder_echo_status,
    is_positive: adder_is_positive,
    parse_int: adder_parse_int,
    clone_self: adder_clone_self,
    count_items: adder_count_items,
};

static CALC_VTBL: CalcVtbl = CalcVtbl {
    base: AdderVtbl {
        query_interface: adder_qi,
        add_ref: adder_add_ref,
        release: adder_release,
        add: adder_add,
        echo_status: adder_echo_status,
        is_positive: adder_is_positive,
        parse_int: adder_parse_int,
        clone_self: adder_clone_self,
        count_items: adder_count_items,
    },
    mul: calc_mul,
};

fn create(vtbl: *const c_void, supports_calc: bool) -> (*mut c_void, Arc<FixtureCounters>) {
    let counters = Arc::new(FixtureCounters {
        refs: AtomicU32::new(1),
        destroyed: AtomicBool::new(false),
        qi_calls: AtomicU32::new(0),
    });
    let boxed = Box::new(AdderObj {
        vtbl,
        supports_calc,
        counters: counters.clone(),
    });
    (Box::into_raw(boxed) as *mut c_void, counters)
}

/// New native adder with one outstanding reference, owned by the caller.
pub fn create_adder() -> (*mut c_void, Arc<FixtureCounters>) {
    create(&ADDER_VTBL as *const AdderVtbl as *const c_void, false)
}

/// New native calculator (implements both interfaces) with one reference.
pub fn create_calculator() -> (*mut c_void, Arc<FixtureCounters>) {
    create(&CALC_VTBL as *const CalcVtbl as *const c_void, true)
}

/// Call AddRef the way native client code would, through the vtable.
pub unsafe fn raw_add_ref(ptr: *mut c_void) -> u32 {
    let vtbl = *(ptr as *const *const AdderVtbl);
    ((*vtbl).add_ref)(ptr)
}

/// Call Release the way native client code would.
pub unsafe fn raw_release(ptr: *mut c_void) -> u32 {
    let vtbl = *(ptr as *const *const AdderVtbl);
    ((*vtbl).release)(ptr)
}
