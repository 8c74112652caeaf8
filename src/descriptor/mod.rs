//! Interface contracts: what an interop interface looks like, independent of
//! either wrap direction. Descriptors are built once through the builder API,
//! validated, and interned forever in the process-wide registry; both the
//! outbound proxy and the inbound wrapper consume the same descriptor so the
//! two directions agree on the wire shape by construction.

use std::fmt::{Debug, Formatter};
use std::sync::{Arc, OnceLock};

use bitflags::bitflags;

use crate::error::Error;
use crate::guid::Guid;
use crate::hresult::HResult;
use crate::shape::{self, CallShapes};

mod registry;
mod validate;

pub use registry::{descriptor_of, interface_by_iid, ComInterface};

bitflags! {
    /// Data flow of a single parameter across the boundary.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct ParamDirection: u8 {
        const IN = 1;
        const OUT = 2;
        const INOUT = Self::IN.bits() | Self::OUT.bits();
    }
}

bitflags! {
    /// Which wrap directions an interface permits. Wrapping outside the
    /// declared direction fails fast with a not-supported error.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct MarshalDirection: u8 {
        /// Native objects may be wrapped into callable proxies.
        const NATIVE_TO_LOCAL = 1;
        /// Local implementations may be exported as native-callable vtables.
        const LOCAL_TO_NATIVE = 2;
        const BOTH = Self::NATIVE_TO_LOCAL.bits() | Self::LOCAL_TO_NATIVE.bits();
    }
}

/// Declared type of a parameter. Scalars cross the boundary in their direct
/// native representation; everything else resolves to a marshaler and crosses
/// as a pointer-sized word.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum ParamType {
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
    Bool,
    /// Opaque pointer, passed through untouched.
    Ptr,
    /// Null-terminated native string: UTF-16 on Windows, UTF-8 elsewhere.
    /// Input only.
    NativeString,
    /// Another interop interface, referenced by IID.
    Interface(Guid),
    /// Array of interop interfaces. Input only, local-to-native one way.
    InterfaceArray(Guid),
    /// Readable byte stream (`std::io::Read + Seek`).
    ReadStream,
    /// Writable byte stream (`std::io::Write`).
    WriteStream,
    /// Explicitly tagged custom marshaler, resolved through the marshaler
    /// registry at validation time.
    Tagged(&'static str),
}

impl ParamType {
    pub fn is_scalar(&self) -> bool {
        use ParamType::*;
        matches!(
            self,
            I8 | U8 | I16 | U16 | I32 | U32 | I64 | U64 | F32 | F64 | Bool | Ptr
        )
    }
}

/// How the native return value is translated back.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReturnKind {
    /// Native returns a status code; negative raises, the non-negative code
    /// is handed back raw so qualified successes stay visible.
    Status,
    /// Native returns a status code; only failures are surfaced.
    Void,
    /// Boolean-as-status: 0 is true, other non-negative codes are false,
    /// negative raises.
    Bool,
    /// Native returns a raw pointer. No status channel exists for this
    /// convention.
    Pointer,
    /// Native returns a raw pointer that is itself an interop interface;
    /// non-null results are wrapped, carrying one reference.
    Interface(Guid),
}

#[derive(Clone, PartialEq, Debug)]
pub struct ParamDescriptor {
    pub name: String,
    pub ty: ParamType,
    pub direction: ParamDirection,
}

/// Marks a method whose logical return value is delivered through a native
/// output parameter spliced in at `index` among the declared parameters.
#[derive(Clone, PartialEq, Debug)]
pub struct RetVal {
    pub index: usize,
    pub ty: ParamType,
}

#[derive(Clone, PartialEq, Debug)]
pub struct MethodDescriptor {
    pub name: String,
    pub params: Vec<ParamDescriptor>,
    pub ret: ReturnKind,
    pub retval: Option<RetVal>,
}

impl MethodDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: vec![],
            ret: ReturnKind::Void,
            retval: None,
        }
    }

    pub fn param(mut self, name: &str, ty: ParamType, direction: ParamDirection) -> Self {
        self.params.push(ParamDescriptor {
            name: name.to_string(),
            ty,
            direction,
        });
        self
    }

    pub fn input(self, name: &str, ty: ParamType) -> Self {
        self.param(name, ty, ParamDirection::IN)
    }

    pub fn output(self, name: &str, ty: ParamType) -> Self {
        self.param(name, ty, ParamDirection::OUT)
    }

    pub fn returns(mut self, ret: ReturnKind) -> Self {
        self.ret = ret;
        self
    }

    /// Deliver the logical return value through a native out parameter at
    /// `index`. The method's return kind stays `Void` (native returns a
    /// status code), and a successful call yields the extracted value.
    pub fn ret_via(mut self, index: usize, ty: ParamType) -> Self {
        self.retval = Some(RetVal { index, ty });
        self
    }
}

/// Per-interface hooks replacing the default call conventions: an optional
/// prologue run immediately before every outbound native call, and custom
/// translation of status codes into the local error convention.
#[derive(Clone, Copy, Default)]
pub struct CustomConventions {
    pub prologue: Option<fn()>,
    pub check_status: Option<fn(HResult) -> Result<(), Error>>,
    pub check_bool: Option<fn(HResult) -> Result<bool, Error>>,
}

pub struct InterfaceDescriptor {
    name: String,
    iid: Guid,
    base: Option<Arc<InterfaceDescriptor>>,
    /// Flattened method list: base methods first, own methods after, in
    /// declaration order. Order determines vtable slot assignment.
    methods: Vec<MethodDescriptor>,
    direction: MarshalDirection,
    conventions: Option<CustomConventions>,
    shapes: OnceLock<CallShapes>,
}

impl InterfaceDescriptor {
    pub fn builder(name: impl Into<String>, iid: &str) -> InterfaceDescriptorBuilder {
        InterfaceDescriptorBuilder {
            name: name.into(),
            iid: iid.to_string(),
            base: None,
            methods: vec![],
            direction: MarshalDirection::BOTH,
            conventions: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn iid(&self) -> Guid {
        self.iid
    }

    pub fn methods(&self) -> &[MethodDescriptor] {
        &self.methods
    }

    pub fn direction(&self) -> MarshalDirection {
        self.direction
    }

    pub fn conventions(&self) -> Option<&CustomConventions> {
        self.conventions.as_ref()
    }

    pub fn base(&self) -> Option<&Arc<InterfaceDescriptor>> {
        self.base.as_ref()
    }

    /// True if this interface is the requested one or inherits from it.
    pub fn implements(&self, iid: Guid) -> bool {
        if self.iid == iid {
            return true;
        }
        let mut base = self.base.as_deref();
        while let Some(b) = base {
            if b.iid == iid {
                return true;
            }
            base = b.base.as_deref();
        }
        false
    }

    pub fn method_index(&self, name: &str) -> Option<usize> {
        self.methods.iter().position(|m| m.name == name)
    }

    /// Native call shapes for every method, synthesized once per interface.
    /// Both wrap directions consume this identical set.
    pub fn shapes(&self) -> &CallShapes {
        self.shapes.get_or_init(|| shape::shapes_for(self))
    }

    /// Structural identity check used when the same IID is registered twice:
    /// the wire shape must match exactly.
    fn same_shape(&self, other: &InterfaceDescriptor) -> bool {
        self.iid == other.iid
            && self.direction == other.direction
            && self.methods == other.methods
    }
}

impl Debug for InterfaceDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "InterfaceDescriptor({}, {}, {} methods)",
            self.name,
            self.iid,
            self.methods.len()
        )
    }
}

pub struct InterfaceDescriptorBuilder {
    name: String,
    iid: String,
    base: Option<Arc<InterfaceDescriptor>>,
    methods: Vec<MethodDescriptor>,
    direction: MarshalDirection,
    conventions: Option<CustomConventions>,
}

impl InterfaceDescriptorBuilder {
    pub fn direction(mut self, direction: MarshalDirection) -> Self {
        self.direction = direction;
        self
    }

    /// Inherit another interface: its methods occupy the leading vtable
    /// slots of this one, so a pointer to the derived interface is valid
    /// under the base interface as well.
    pub fn extends(mut self, base: &Arc<InterfaceDescriptor>) -> Self {
        self.base = Some(base.clone());
        self
    }

    pub fn conventions(mut self, conventions: CustomConventions) -> Self {
        self.conventions = Some(conventions);
        self
    }

    pub fn method(mut self, method: MethodDescriptor) -> Self {
        self.methods.push(method);
        self
    }

    /// Validate the contract and intern the descriptor in the process-wide
    /// registry. Registering the same IID twice returns the existing
    /// descriptor when the wire shape matches, and is a contract error
    /// otherwise. Errors are not cached; a later retry revalidates.
    ///
    /// Validation runs before interning, so a failed registration leaves no
    /// trace in the registry.
    pub fn register(self) -> Result<Arc<InterfaceDescriptor>, Error> {
        let iid = Guid::parse(&self.iid).map_err(|_| {
            Error::contract(
                self.name.clone(),
                format!("\"{}\" is not a valid interface id", self.iid),
            )
        })?;

        let mut methods = match &self.base {
            Some(b) => b.methods.clone(),
            None => vec![],
        };
        methods.extend(self.methods);

        let desc = InterfaceDescriptor {
            name: self.name,
            iid,
            base: self.base,
            methods,
            direction: self.direction,
            conventions: self.conventions,
            shapes: OnceLock::new(),
        };
        validate::validate(&desc)?;
        registry::intern(desc)
    }
}
