//! Native call-shape synthesis. A shape is the C-ABI row of a single vtable
//! slot: the native parameter types in order (with the implicit `this`
//! pointer at slot 0 and the return-value out-slot spliced in where
//! declared) plus the native return type. Synthesis is a pure function of
//! the descriptor, so the outbound and inbound directions independently
//! arrive at bit-compatible layouts; the result is cached per interface.

use libffi::middle::{Cif, Type};

use crate::descriptor::{
    InterfaceDescriptor, MethodDescriptor, ParamDescriptor, ParamDirection, ParamType, ReturnKind,
};

/// The three universal lifetime-control slots that precede user methods:
/// QueryInterface, AddRef, Release.
pub const IUNKNOWN_SLOTS: usize = 3;

/// Wire representation of a single argument or return value.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NativeType {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    /// C++ `bool`, one byte.
    Bool,
    Ptr,
}

impl NativeType {
    pub fn ffi_type(self) -> Type {
        match self {
            NativeType::I8 => Type::i8(),
            NativeType::U8 | NativeType::Bool => Type::u8(),
            NativeType::I16 => Type::i16(),
            NativeType::U16 => Type::u16(),
            NativeType::I32 => Type::i32(),
            NativeType::U32 => Type::u32(),
            NativeType::I64 => Type::i64(),
            NativeType::U64 => Type::u64(),
            NativeType::F32 => Type::f32(),
            NativeType::F64 => Type::f64(),
            NativeType::Ptr => Type::pointer(),
        }
    }
}

/// What a native argument slot carries, parallel to the shape's argument row
/// past the leading `this` pointer.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SlotBinding {
    /// Index into the method's declared parameter list.
    Param(usize),
    /// The spliced-in return-value output slot.
    RetVal,
}

#[derive(Clone, Debug)]
pub struct NativeCallShape {
    /// Argument row including the leading `this` pointer.
    pub args: Vec<NativeType>,
    /// Bindings for `args[1..]`.
    pub bindings: Vec<SlotBinding>,
    /// `I32` status code unless the method returns a raw pointer.
    pub ret: NativeType,
}

impl NativeCallShape {
    /// Build the libffi call interface for this shape. Built fresh per call
    /// site; the description itself is what gets cached.
    pub fn cif(&self) -> Cif {
        Cif::new(
            self.args.iter().map(|t| t.ffi_type()),
            self.ret.ffi_type(),
        )
    }
}

/// The full shape set of one interface, vtable slot `IUNKNOWN_SLOTS + i` per
/// method `i` in descriptor order.
#[derive(Clone, Debug)]
pub struct CallShapes {
    pub methods: Vec<NativeCallShape>,
}

impl CallShapes {
    /// Total vtable entries: the universal slots plus one per method.
    pub fn vtable_len(&self) -> usize {
        IUNKNOWN_SLOTS + self.methods.len()
    }
}

pub fn shapes_for(desc: &InterfaceDescriptor) -> CallShapes {
    CallShapes {
        methods: desc.methods().iter().map(shape_for).collect(),
    }
}

fn shape_for(method: &MethodDescriptor) -> NativeCallShape {
    let mut args = vec![NativeType::Ptr]; // this
    let mut bindings = vec![];

    let retval_at = method
        .retval
        .as_ref()
        .map(|rv| rv.index.min(method.params.len()));

    for (i, p) in method.params.iter().enumerate() {
        if retval_at == Some(i) {
            args.push(NativeType::Ptr);
            bindings.push(SlotBinding::RetVal);
        }
        args.push(param_native_type(p));
        bindings.push(SlotBinding::Param(i));
    }
    if retval_at == Some(method.params.len()) {
        args.push(NativeType::Ptr);
        bindings.push(SlotBinding::RetVal);
    }

    let ret = match method.ret {
        ReturnKind::Pointer | ReturnKind::Interface(_) => NativeType::Ptr,
        ReturnKind::Status | ReturnKind::Void | ReturnKind::Bool => NativeType::I32,
    };

    NativeCallShape {
        args,
        bindings,
        ret,
    }
}

/// Output parameters cross as a pointer to the native representation;
/// marshaled values cross as pointer-sized words; scalars cross directly.
fn param_native_type(p: &ParamDescriptor) -> NativeType {
    if p.direction.contains(ParamDirection::OUT) {
        return NativeType::Ptr;
    }
    match p.ty {
        ParamType::I8 => NativeType::I8,
        ParamType::U8 => NativeType::U8,
        ParamType::I16 => NativeType::I16,
        ParamType::U16 => NativeType::U16,
        ParamType::I32 => NativeType::I32,
        ParamType::U32 => NativeType::U32,
        ParamType::I64 => NativeType::I64,
        ParamType::U64 => NativeType::U64,
        ParamType::F32 => NativeType::F32,
        ParamType::F64 => NativeType::F64,
        ParamType::Bool => NativeType::Bool,
        ParamType::Ptr
        | ParamType::NativeString
        | ParamType::Interface(_)
        | ParamType::InterfaceArray(_)
        | ParamType::ReadStream
        | ParamType::WriteStream
        | ParamType::Tagged(_) => NativeType::Ptr,
    }
}
