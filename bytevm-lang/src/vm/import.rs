//! Modules and the import system.

use std::fmt::{Debug, Display};
use std::sync::Arc;

use kempt::Map;

use crate::code::Code;
use crate::runtime::exception::ErrorKind;
use crate::runtime::namespace::Namespace;
use crate::runtime::symbol::Symbol;
use crate::runtime::value::{AnyDynamic, CustomType, Value};
use crate::vm::frame::Frame;
use crate::vm::{Fault, FrameExit, Vm};

/// Initializes a module implemented by the host, returning its namespace.
pub type NativeModule = Arc<dyn Fn(&mut Vm) -> Result<Arc<Namespace>, Fault> + Send + Sync>;

/// Information about the import being resolved.
#[derive(Debug, Clone, Copy)]
pub struct SearchContext<'a> {
    /// The `__name__` of the module performing the import, if any.
    pub importer: Option<&'a Symbol>,
}

/// A module's compiled code.
#[derive(Debug, Clone)]
pub struct CompiledModule {
    /// The module body.
    pub code: Code,
    /// True if the module is a package that may contain submodules.
    pub package: bool,
}

impl CompiledModule {
    /// Returns a plain module executing `code`.
    #[must_use]
    pub const fn module(code: Code) -> Self {
        Self {
            code,
            package: false,
        }
    }

    /// Returns a package executing `code`.
    #[must_use]
    pub const fn package(code: Code) -> Self {
        Self {
            code,
            package: true,
        }
    }
}

/// Resolves qualified module names to compiled code.
pub trait ModuleLoader: Send + Sync + Debug {
    /// Returns the compiled code of the module `name`.
    fn resolve_and_compile(
        &self,
        name: &Symbol,
        context: &SearchContext<'_>,
    ) -> Result<CompiledModule, LoadError>;
}

/// An error resolving a module.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum LoadError {
    /// No module with the name exists.
    NotFound(Symbol),
    /// The module exists but could not be read or compiled.
    Unreadable {
        /// The module's qualified name.
        name: Symbol,
        /// A description of the failure.
        reason: String,
    },
}

impl Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadError::NotFound(name) => write!(f, "No module named '{name}'"),
            LoadError::Unreadable { name, reason } => {
                write!(f, "module '{name}' could not be loaded: {reason}")
            }
        }
    }
}

impl std::error::Error for LoadError {}

impl From<LoadError> for Fault {
    fn from(err: LoadError) -> Self {
        match &err {
            LoadError::NotFound(_) => Fault::error(ErrorKind::ModuleNotFoundError, err.to_string()),
            LoadError::Unreadable { .. } => Fault::error(ErrorKind::ImportError, err.to_string()),
        }
    }
}

/// A [`ModuleLoader`] serving code registered ahead of time.
#[derive(Debug, Default, Clone)]
pub struct SourceRegistry {
    modules: Map<Symbol, CompiledModule>,
}

impl SourceRegistry {
    /// Registers a module.
    #[must_use]
    pub fn with_module(mut self, name: impl Into<Symbol>, code: Code) -> Self {
        self.insert(name, CompiledModule::module(code));
        self
    }

    /// Registers a package.
    #[must_use]
    pub fn with_package(mut self, name: impl Into<Symbol>, code: Code) -> Self {
        self.insert(name, CompiledModule::package(code));
        self
    }

    /// Registers `module` as `name`, replacing any previous registration.
    pub fn insert(&mut self, name: impl Into<Symbol>, module: CompiledModule) {
        self.modules.insert(name.into(), module);
    }
}

impl ModuleLoader for SourceRegistry {
    fn resolve_and_compile(
        &self,
        name: &Symbol,
        _context: &SearchContext<'_>,
    ) -> Result<CompiledModule, LoadError> {
        self.modules
            .get(name)
            .cloned()
            .ok_or_else(|| LoadError::NotFound(name.clone()))
    }
}

/// A loaded module.
pub struct Module {
    name: Symbol,
    namespace: Arc<Namespace>,
}

impl Module {
    /// Returns a module named `name` whose attributes live in `namespace`.
    #[must_use]
    pub const fn new(name: Symbol, namespace: Arc<Namespace>) -> Self {
        Self { name, namespace }
    }

    /// Returns the module's qualified name.
    #[must_use]
    pub const fn name(&self) -> &Symbol {
        &self.name
    }

    /// Returns the module's global namespace.
    #[must_use]
    pub const fn namespace(&self) -> &Arc<Namespace> {
        &self.namespace
    }
}

impl Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module").field("name", &self.name).finish_non_exhaustive()
    }
}

impl CustomType for Module {
    fn type_name(&self) -> Symbol {
        Symbol::from("module")
    }

    fn repr(&self, _this: &AnyDynamic) -> String {
        format!("<module '{}'>", self.name)
    }

    fn get_attr(&self, _vm: &mut Vm, _this: &AnyDynamic, name: &Symbol) -> Result<Value, Fault> {
        if name == "__dict__" {
            return Ok(Value::shared(self.namespace.clone()));
        }
        self.namespace.get(name).ok_or_else(|| {
            Fault::error(
                ErrorKind::AttributeError,
                format!("module '{}' has no attribute '{name}'", self.name),
            )
        })
    }

    fn set_attr(
        &self,
        _vm: &mut Vm,
        _this: &AnyDynamic,
        name: Symbol,
        value: Value,
    ) -> Result<(), Fault> {
        self.namespace.insert(name, value);
        Ok(())
    }

    fn del_attr(&self, _vm: &mut Vm, _this: &AnyDynamic, name: &Symbol) -> Result<(), Fault> {
        self.namespace.remove(name).map(|_| ()).ok_or_else(|| {
            Fault::error(
                ErrorKind::AttributeError,
                format!("module '{}' has no attribute '{name}'", self.name),
            )
        })
    }
}

impl Vm {
    /// Performs `IMPORT_NAME`: imports `name`, resolved relative to the
    /// current module when `level` is positive, and returns the top-level
    /// package or, when `fromlist` is non-empty, the named module itself.
    pub(crate) fn import_name(
        &mut self,
        name: &Symbol,
        fromlist: &Value,
        level: usize,
    ) -> Result<Value, Fault> {
        let qualified = if level > 0 {
            self.resolve_relative(name, level)?
        } else {
            name.clone()
        };
        if qualified.is_empty() {
            return Err(Fault::value_error("Empty module name"));
        }
        let (top, leaf) = self.import_chain(&qualified)?;
        if fromlist.truthy(self)? {
            Ok(leaf)
        } else {
            Ok(top)
        }
    }

    /// Imports the module `name` and every parent package, returning the
    /// module itself.
    pub(crate) fn import_module(&mut self, name: &Symbol) -> Result<Value, Fault> {
        self.import_chain(name).map(|(_, leaf)| leaf)
    }

    /// Performs `IMPORT_FROM`: reads `name` from `module`, importing it as a
    /// submodule if the module has no such attribute.
    pub(crate) fn import_from(&mut self, module: &Value, name: &Symbol) -> Result<Value, Fault> {
        match module.get_attr(self, name) {
            Ok(value) => Ok(value),
            Err(err) if err.is_exception(ErrorKind::AttributeError) => {
                let package = module.get_attr(self, &Symbol::from("__name__"))?;
                let submodule = Symbol::from(format!("{package}.{name}"));
                self.import_module(&submodule).map_err(|err| {
                    if err.is_exception(ErrorKind::ImportError) {
                        Fault::error(
                            ErrorKind::ImportError,
                            format!("cannot import name '{name}'"),
                        )
                    } else {
                        err
                    }
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Performs `IMPORT_STAR`: copies the public names of `module` into the
    /// current frame's locals.
    pub(crate) fn import_star(&mut self, module: &Value) -> Result<(), Fault> {
        let module = module
            .downcast_ref::<Module>()
            .ok_or_else(|| Fault::type_error("import * requires a module"))?;
        let namespace = module.namespace().clone();
        let names = match namespace.get(&Symbol::from("__all__")) {
            Some(all) => all
                .collect(self)?
                .into_iter()
                .map(|name| {
                    name.as_symbol().cloned().ok_or_else(|| {
                        Fault::type_error(format!(
                            "Item in {}.__all__ must be str, not {}",
                            module.name(),
                            name.type_name()
                        ))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => namespace
                .names()
                .into_iter()
                .filter(|name| !name.is_private())
                .collect(),
        };
        let locals = self.frame().locals.clone();
        for name in names {
            let value = namespace.get(&name).ok_or_else(|| {
                Fault::error(
                    ErrorKind::AttributeError,
                    format!("module '{}' has no attribute '{name}'", module.name()),
                )
            })?;
            locals.insert(name, value);
        }
        Ok(())
    }

    fn resolve_relative(&self, name: &Symbol, level: usize) -> Result<Symbol, Fault> {
        let globals = &self.frame().globals;
        let package = match globals.get(&Symbol::from("__package__")) {
            Some(Value::Str(package)) if !package.is_empty() => package,
            _ => match globals.get(&Symbol::from("__name__")) {
                Some(Value::Str(module)) if globals.contains(&Symbol::from("__path__")) => module,
                Some(Value::Str(module)) => match module.rsplit_once('.') {
                    Some((parent, _)) => Symbol::from(parent),
                    None => Symbol::empty(),
                },
                _ => Symbol::empty(),
            },
        };
        if package.is_empty() {
            return Err(Fault::error(
                ErrorKind::ImportError,
                "attempted relative import with no known parent package",
            ));
        }
        let mut base = package.as_str();
        for _ in 1..level {
            base = match base.rsplit_once('.') {
                Some((parent, _)) => parent,
                None => {
                    return Err(Fault::value_error(
                        "attempted relative import beyond top-level package",
                    ))
                }
            };
        }
        Ok(if name.is_empty() {
            Symbol::from(base)
        } else {
            Symbol::from(format!("{base}.{name}"))
        })
    }

    /// Loads each component of the dotted `name` in order, binding each
    /// submodule as an attribute of its parent. Returns the top-level and
    /// final modules.
    fn import_chain(&mut self, name: &Symbol) -> Result<(Value, Value), Fault> {
        let mut qualified = String::with_capacity(name.len());
        let mut chain: Option<(Value, Value)> = None;
        for part in name.split('.') {
            if !qualified.is_empty() {
                qualified.push('.');
            }
            qualified.push_str(part);
            let module = self.load_module(&Symbol::from(qualified.as_str()))?;
            chain = Some(match chain {
                Some((top, parent)) => {
                    parent.set_attr(self, Symbol::from(part), module.clone())?;
                    (top, module)
                }
                None => (module.clone(), module),
            });
        }
        chain.ok_or_else(|| Fault::value_error("Empty module name"))
    }

    /// Returns the cached module `name`, loading and executing it if needed.
    fn load_module(&mut self, name: &Symbol) -> Result<Value, Fault> {
        if let Some(module) = self.modules.get(name) {
            trace!(module = %name, "module cache hit");
            return Ok(module.clone());
        }

        let importer = self
            .current_frame()
            .and_then(|frame| frame.globals.get(&Symbol::from("__name__")))
            .and_then(|name| name.as_symbol().cloned());
        let context = SearchContext {
            importer: importer.as_ref(),
        };
        let loaded = match &self.loader {
            Some(loader) => loader.resolve_and_compile(name, &context),
            None => Err(LoadError::NotFound(name.clone())),
        };

        match loaded {
            Ok(compiled) => self.execute_module(name, compiled),
            Err(err) => {
                let Some(init) = self.native_modules.get(name).cloned() else {
                    return Err(Fault::from(err));
                };
                info!(module = %name, reason = %err, "using native module");
                let namespace = init(self)?;
                let module = Value::dynamic(Module::new(name.clone(), namespace));
                self.modules.insert(name.clone(), module.clone());
                Ok(module)
            }
        }
    }

    fn execute_module(&mut self, name: &Symbol, compiled: CompiledModule) -> Result<Value, Fault> {
        let namespace = self.module_namespace(name.clone());
        if compiled.package {
            namespace.insert(Symbol::from("__path__"), Value::list(Vec::new()));
            namespace.insert(Symbol::from("__package__"), Value::Str(name.clone()));
        } else {
            let package = name.rsplit_once('.').map_or("", |(parent, _)| parent);
            namespace.insert(Symbol::from("__package__"), Value::from(package));
        }
        let module = Value::dynamic(Module::new(name.clone(), namespace.clone()));
        self.modules.insert(name.clone(), module.clone());

        info!(module = %name, "executing module");
        let frame = Frame::new(
            compiled.code,
            namespace.clone(),
            namespace,
            self.builtins().clone(),
            &[],
        )?;
        let result = match self.run_frame(frame) {
            Ok(FrameExit::Returned(..)) => Ok(module),
            Ok(FrameExit::Yielded(..)) => Err(Fault::UnexpectedYield),
            Err(fault) => Err(fault),
        };
        if result.is_err() {
            self.modules.remove(name);
        }
        result
    }
}
