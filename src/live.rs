//! Live object cache: the deduplicating registries that keep one wrapper
//! per identity on each side of the bridge.
//!
//! The native side is a multimap — interface inheritance means the same
//! pointer may legitimately be wrapped under several interface lineages at
//! once — holding weak entries, with dead ones purged lazily on the next
//! lookup or insert for that key. The exported side owns its wrappers
//! strongly per (implementation identity, interface id) and keeps a weak
//! address index for pointer lookups.
//!
//! Each side is serialized by one mutex. Insert-or-fetch runs entirely
//! under it so that concurrent wrap requests construct exactly one wrapper
//! per identity; reference bumps happen after the lock is dropped, because
//! they may run foreign code that could reenter the cache.

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use crate::descriptor::InterfaceDescriptor;
use crate::error::Error;
use crate::export::{ComImpl, ExportedObject};
use crate::guid::Guid;
use crate::proxy::NativeProxy;
use crate::tracer::trace_msg;

static NATIVE: OnceLock<Mutex<HashMap<usize, Vec<Weak<NativeProxy>>>>> = OnceLock::new();

struct ExportedMaps {
    by_impl: HashMap<(usize, Guid), Arc<ExportedObject>>,
    by_addr: HashMap<usize, Weak<ExportedObject>>,
}

static EXPORTED: OnceLock<Mutex<ExportedMaps>> = OnceLock::new();

fn native() -> &'static Mutex<HashMap<usize, Vec<Weak<NativeProxy>>>> {
    NATIVE.get_or_init(Default::default)
}

fn exported() -> &'static Mutex<ExportedMaps> {
    EXPORTED.get_or_init(|| {
        Mutex::new(ExportedMaps {
            by_impl: HashMap::new(),
            by_addr: HashMap::new(),
        })
    })
}

/// Fetch the live proxy for `ptr` whose interface lineage covers the
/// requested one, or construct and register a new proxy — all under the
/// cache lock, so at most one proxy is ever constructed per identity.
pub(crate) fn native_insert_or_fetch(
    desc: &Arc<InterfaceDescriptor>,
    ptr: *mut c_void,
    build: impl FnOnce() -> NativeProxy,
) -> (Arc<NativeProxy>, bool) {
    let key = ptr as usize;
    let mut map = native().lock().unwrap();
    let entries = map.entry(key).or_default();
    entries.retain(|w| w.strong_count() > 0);

    for w in entries.iter() {
        if let Some(p) = w.upgrade() {
            if !p.is_released() && p.descriptor().implements(desc.iid()) {
                return (p, true);
            }
        }
    }

    let proxy = Arc::new(build());
    entries.push(Arc::downgrade(&proxy));
    (proxy, false)
}

/// Drop the cache entry for a proxy being released. Runs in the same
/// critical section discipline as the release itself: the entry is gone
/// before the native reference is, so a racing lookup can never hand out a
/// pointer that is about to die.
pub(crate) fn native_remove(key: usize, proxy: *const NativeProxy) {
    let mut map = native().lock().unwrap();
    if let Some(entries) = map.get_mut(&key) {
        entries.retain(|w| w.as_ptr() != proxy && w.strong_count() > 0);
        if entries.is_empty() {
            map.remove(&key);
        }
    }
}

fn native_any_live(key: usize) -> Option<Arc<NativeProxy>> {
    let map = native().lock().unwrap();
    let entries = map.get(&key)?;
    entries
        .iter()
        .filter_map(Weak::upgrade)
        .find(|p| !p.is_released())
}

/// Fetch or build the exported wrapper for an implementation under one
/// interface. Entries own their wrapper; a dead entry (implementation gone
/// and no native references) found under the key is purged first, which
/// also covers identity reuse after the old implementation's memory was
/// recycled.
pub(crate) fn exported_insert_or_fetch(
    desc: &Arc<InterfaceDescriptor>,
    imp: &Arc<dyn ComImpl>,
    build: impl FnOnce() -> Result<ExportedObject, Error>,
) -> Result<(Arc<ExportedObject>, bool), Error> {
    let key = (Arc::as_ptr(imp) as *const () as usize, desc.iid());
    let mut maps = exported().lock().unwrap();

    if let Some(existing) = maps.by_impl.get(&key) {
        if existing.is_alive() {
            return Ok((existing.clone(), true));
        }
        let stale_addr = existing.address() as usize;
        maps.by_impl.remove(&key);
        maps.by_addr.remove(&stale_addr);
    }

    let obj = Arc::new(build()?);
    maps.by_impl.insert(key, obj.clone());
    maps.by_addr.insert(obj.address() as usize, Arc::downgrade(&obj));
    Ok((obj, false))
}

/// If the address belongs to one of our exported objects, return its
/// implementation and the interface it was exported under.
pub(crate) fn exported_local(
    addr: usize,
) -> Option<(Arc<dyn ComImpl>, Arc<InterfaceDescriptor>)> {
    let obj = {
        let maps = exported().lock().unwrap();
        maps.by_addr.get(&addr).and_then(Weak::upgrade)?
    };
    let imp = obj.current_impl()?;
    Some((imp, obj.descriptor().clone()))
}

/// Reference bump for a raw pointer of unknown provenance: exported side
/// first, then native proxies. An untracked pointer is a loud failure by
/// design — silently ignoring it would mask a reference that is bumped but
/// never released.
pub fn add_ref(ptr: *mut c_void) -> Result<(), Error> {
    if ptr.is_null() {
        return Err(Error::UntrackedPointer(0));
    }
    let key = ptr as usize;

    let exported_hit = {
        let maps = exported().lock().unwrap();
        maps.by_addr.get(&key).and_then(Weak::upgrade)
    };
    if let Some(obj) = exported_hit {
        obj.add_ref_native();
        trace_msg!("bumped exported object at {ptr:p}");
        return Ok(());
    }

    if let Some(proxy) = native_any_live(key) {
        proxy.add_ref()?;
        trace_msg!("bumped native object at {ptr:p}");
        return Ok(());
    }

    Err(Error::UntrackedPointer(key))
}
