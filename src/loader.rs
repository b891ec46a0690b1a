//! Loading serialized code objects from the filesystem.
//!
//! Programs and modules are stored as [`Code`] objects written in
//! [rsn](https://github.com/khonsulabs/rsn). The module `a.b` is found at
//! `a/b.rsn`, or at `a/b/__init__.rsn` if `a.b` is a package.

use std::path::{Path, PathBuf};

use bytevm_lang::code::Code;
use bytevm_lang::runtime::symbol::Symbol;
use bytevm_lang::runtime::value::Value;
use bytevm_lang::vm::import::{CompiledModule, LoadError, ModuleLoader, SearchContext};
use bytevm_lang::vm::Vm;
use bytevm_lang::Error;

/// The extension of serialized code files.
pub const EXTENSION: &str = "rsn";

/// Reads the code object stored at `path`.
pub fn read_code(path: &Path) -> Result<Code, String> {
    let contents = std::fs::read_to_string(path).map_err(|err| err.to_string())?;
    parse_code(&contents)
}

/// Reads the program at `path` and runs it as the `__main__` module.
pub fn run_file(vm: &mut Vm, path: &Path) -> Result<Value, Error> {
    let code = read_code(path).map_err(|reason| LoadError::Unreadable {
        name: Symbol::from("__main__"),
        reason,
    })?;
    Ok(vm.run(&code, [])?)
}

/// Parses a code object from its rsn representation.
pub fn parse_code(source: &str) -> Result<Code, String> {
    rsn::from_str(source).map_err(|err| err.to_string())
}

/// Returns the rsn representation of `code`.
#[must_use]
pub fn to_rsn(code: &Code) -> String {
    rsn::to_string_pretty(code)
}

/// A [`ModuleLoader`] that searches a directory for serialized modules.
#[derive(Debug, Clone)]
pub struct FsLoader {
    root: PathBuf,
}

impl FsLoader {
    /// Returns a loader resolving modules relative to `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the directory modules are resolved in.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn module_path(&self, name: &Symbol) -> PathBuf {
        let mut path = self.root.clone();
        for part in name.split('.') {
            path.push(part);
        }
        path
    }
}

impl ModuleLoader for FsLoader {
    fn resolve_and_compile(
        &self,
        name: &Symbol,
        _context: &SearchContext<'_>,
    ) -> Result<CompiledModule, LoadError> {
        if name.is_empty() || name.split('.').any(|part| part.is_empty() || part == "..") {
            return Err(LoadError::NotFound(name.clone()));
        }
        let base = self.module_path(name);
        let module = base.with_extension(EXTENSION);
        let package = base.join("__init__").with_extension(EXTENSION);
        let (path, is_package) = if module.is_file() {
            (module, false)
        } else if package.is_file() {
            (package, true)
        } else {
            return Err(LoadError::NotFound(name.clone()));
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(module = %name, path = %path.display(), "loading module");
        let code = read_code(&path).map_err(|reason| LoadError::Unreadable {
            name: name.clone(),
            reason,
        })?;
        Ok(if is_package {
            CompiledModule::package(code)
        } else {
            CompiledModule::module(code)
        })
    }
}
