//! A bidirectional COM-style interop bridge: native objects with
//! vtable-first layouts become callable local objects, and local
//! implementations become native-callable vtables, with reference counting
//! via AddRef/Release, 128-bit interface identifiers, and signed status
//! codes shared across both worlds.
//!
//! An interface is described once through [`InterfaceDescriptor`]'s builder
//! (or a [`ComInterface`] marker type), validated, and interned. From there:
//!
//! - [`proxy::wrap`] turns a native object pointer into a [`ComRef`] whose
//!   calls forward through the object's vtable, marshaling arguments and
//!   translating status codes.
//! - [`export::wrap`] turns a local [`ComImpl`] into a native-callable
//!   object pointer whose vtable trampolines into the implementation,
//!   converting errors to status codes at the boundary.
//!
//! Repeated wrapping of the same identity reuses a single wrapper through
//! the live object cache, so reference counts stay consistent no matter how
//! many times a pointer crosses.

pub mod tracer;

pub mod comref;
pub mod descriptor;
pub mod error;
pub mod export;
pub mod guid;
pub mod hresult;
pub mod iunknown;
pub mod library;
pub mod live;
pub mod marshal;
pub mod proxy;
pub mod shape;
pub mod value;

use std::ffi::c_void;
use std::sync::Arc;

pub use comref::ComRef;
pub use descriptor::{
    descriptor_of, interface_by_iid, ComInterface, CustomConventions, InterfaceDescriptor,
    InterfaceDescriptorBuilder, MarshalDirection, MethodDescriptor, ParamDescriptor,
    ParamDirection, ParamType, ReturnKind,
};
pub use marshal::stream::{read_stream_descriptor, write_stream_descriptor};
pub use error::Error;
pub use export::{ComDisposable, ComImpl};
pub use guid::Guid;
pub use hresult::HResult;
pub use marshal::stream::{SeekOrigin, SharedReadStream, SharedWriteStream};
pub use marshal::{register_marshaler, Marshal};
pub use proxy::NativeProxy;
pub use value::Value;

/// Wrap a native object pointer under the interface declared by `I`,
/// taking ownership of the reference the caller holds.
pub fn wrap<I: ComInterface>(ptr: *mut c_void) -> Result<ComRef, Error> {
    proxy::wrap(&descriptor_of::<I>()?, ptr)
}

/// Export a local implementation under the interface declared by `I`. Pass
/// `add_ref = true` to move ownership to the native side.
pub fn export<I: ComInterface>(
    imp: &Arc<dyn ComImpl>,
    add_ref: bool,
) -> Result<*mut c_void, Error> {
    export::wrap(&descriptor_of::<I>()?, imp, add_ref)
}

/// Cast a reference to the interface declared by `I`.
pub fn cast<I: ComInterface>(obj: &ComRef, release_old: bool) -> Result<ComRef, Error> {
    obj.cast(&descriptor_of::<I>()?, release_old)
}
