//! Loading the user-supplied native entry point. The bridge itself never
//! activates objects; users declare a factory function exported by their
//! native library, obtain the first object pointer from it, and wrap that.

use std::{collections::HashMap, path::PathBuf};

use libffi::middle::CodePtr;
use libloading::{Library, Symbol};

use crate::error::Error;
use crate::tracer::trace_msg;

pub struct NativeLibraries {
    root: PathBuf,
    libraries: HashMap<String, Library>,
}

impl NativeLibraries {
    pub fn new(root: impl AsRef<str>) -> Self {
        Self {
            root: PathBuf::from(root.as_ref()),
            libraries: HashMap::new(),
        }
    }

    /// Load a library by name, matching any file under the root whose name
    /// starts with it (so `"adder"` finds `libadder.so` or `adder.dll`).
    /// Loaded libraries stay cached for the life of this loader.
    pub fn get_library(&mut self, name: &str) -> Result<&Library, Error> {
        if !self.libraries.contains_key(name) {
            let mut path = PathBuf::from(name);
            let entries = self
                .root
                .read_dir()
                .map_err(|e| Error::Library(format!("cannot read {}: {e}", self.root.display())))?;
            for d in entries.flatten() {
                let file_name = d.file_name();
                let matches = file_name
                    .to_str()
                    .map(|n| n.starts_with(name) || n.starts_with(&format!("lib{name}")))
                    .unwrap_or(false);
                if matches {
                    path = d.path();
                    break;
                }
            }
            let library = unsafe { Library::new(&path) }
                .map_err(|e| Error::Library(format!("cannot load {}: {e}", path.display())))?;
            trace_msg!("loaded native library {}", path.display());
            self.libraries.insert(name.to_string(), library);
        }
        Ok(&self.libraries[name])
    }

    /// Resolve an exported entry point to a callable code pointer.
    pub fn get_function(&mut self, library: &str, name: &str) -> Result<CodePtr, Error> {
        let l = self.get_library(library)?;
        let sym: Symbol<unsafe extern "C" fn()> = unsafe { l.get(name.as_bytes()) }
            .map_err(|e| Error::Library(format!("{library} has no symbol {name}: {e}")))?;
        Ok(CodePtr::from_fun(*sym))
    }
}
