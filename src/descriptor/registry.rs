//! Process-wide descriptor registries. Descriptors are expensive enough to
//! build and validate that they are interned forever: once by IID (the wire
//! identity nested-interface marshaling resolves through), and once by Rust
//! type for the `ComInterface` sugar. Both follow the one-builder-wins
//! discipline: the first caller pays the build cost under the lock,
//! subsequent callers fetch the cached result. Build errors are not cached.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use super::{InterfaceDescriptor, InterfaceDescriptorBuilder};
use crate::error::Error;
use crate::guid::Guid;

static BY_IID: OnceLock<Mutex<HashMap<Guid, Arc<InterfaceDescriptor>>>> = OnceLock::new();
static BY_TYPE: OnceLock<Mutex<HashMap<TypeId, Arc<InterfaceDescriptor>>>> = OnceLock::new();

fn by_iid() -> &'static Mutex<HashMap<Guid, Arc<InterfaceDescriptor>>> {
    BY_IID.get_or_init(Default::default)
}

fn by_type() -> &'static Mutex<HashMap<TypeId, Arc<InterfaceDescriptor>>> {
    BY_TYPE.get_or_init(Default::default)
}

pub(super) fn intern(desc: InterfaceDescriptor) -> Result<Arc<InterfaceDescriptor>, Error> {
    let mut map = by_iid().lock().unwrap();
    if let Some(existing) = map.get(&desc.iid) {
        return if existing.same_shape(&desc) {
            Ok(existing.clone())
        } else {
            Err(Error::contract(
                desc.name,
                format!(
                    "interface id {} is already registered as {} with a different wire shape",
                    desc.iid, existing.name
                ),
            ))
        };
    }
    let desc = Arc::new(desc);
    map.insert(desc.iid, desc.clone());
    Ok(desc)
}

/// Look up a registered interface by its wire identity. Used by the
/// interface marshalers when a parameter references an interface by IID.
pub fn interface_by_iid(iid: Guid) -> Option<Arc<InterfaceDescriptor>> {
    by_iid().lock().unwrap().get(&iid).cloned()
}

/// Associates a Rust marker type with its interface contract, so call sites
/// can say `wrap::<IAdder>(ptr)` instead of passing descriptors around.
pub trait ComInterface: 'static {
    fn define() -> InterfaceDescriptorBuilder;
}

/// Descriptor for a marker type, built on first use and memoized by
/// `TypeId`.
pub fn descriptor_of<I: ComInterface>() -> Result<Arc<InterfaceDescriptor>, Error> {
    {
        let map = by_type().lock().unwrap();
        if let Some(desc) = map.get(&TypeId::of::<I>()) {
            return Ok(desc.clone());
        }
    }
    // Build outside the type lock; register() takes the IID lock itself and
    // deduplicates there, so a racing builder converges on one descriptor.
    let desc = I::define().register()?;
    by_type()
        .lock()
        .unwrap()
        .entry(TypeId::of::<I>())
        .or_insert_with(|| desc.clone());
    Ok(desc)
}
