//! The dispatch engine: frames, the decode/execute loop and the block-stack
//! unwind machine.

use std::fmt::{Debug, Display};
use std::io::Write;
use std::num::NonZeroUsize;
use std::sync::Arc;

use ahash::AHashMap;
use kempt::Map;
use parking_lot::Mutex;

use self::call::Arguments;
use self::frame::{Block, BlockKind, Frame, Marker, Why};
use self::import::{ModuleLoader, NativeModule};
use crate::code::decode::{Decoder, StandardDecoder};
use crate::code::Code;
use crate::runtime::builtins;
use crate::runtime::exception::{ErrorKind, ExceptionTriple, TracebackEntry};
use crate::runtime::namespace::Namespace;
use crate::runtime::symbol::Symbol;
use crate::runtime::value::Value;

pub mod call;
pub mod frame;
pub mod function;
pub mod generator;
pub mod import;
mod ops;

/// The default limit on nested frames.
pub const DEFAULT_MAX_DEPTH: usize = 200;

/// The native stack space that must remain before a frame starts running.
const STACK_RED_ZONE: usize = 256 * 1024;
/// The size of each native stack segment allocated for nested frames.
const STACK_SEGMENT: usize = 4 * 1024 * 1024;

/// A virtual machine: one execution session's call stack and interpreter
/// state.
pub struct Vm {
    frames: Vec<Frame>,
    return_value: Value,
    pending: Option<ExceptionTriple>,
    handled: Option<ExceptionTriple>,
    steps: u64,
    budget: Budget,
    max_depth: usize,
    builtins: Arc<Namespace>,
    modules: AHashMap<Symbol, Value>,
    loader: Option<Arc<dyn ModuleLoader>>,
    native_modules: Map<Symbol, NativeModule>,
    decoder: Arc<dyn Decoder>,
    output: Box<dyn Write + Send>,
}

impl Default for Vm {
    fn default() -> Self {
        Self {
            frames: Vec::new(),
            return_value: Value::None,
            pending: None,
            handled: None,
            steps: 0,
            budget: Budget::default(),
            max_depth: DEFAULT_MAX_DEPTH,
            builtins: Arc::new(builtins::namespace()),
            modules: AHashMap::new(),
            loader: None,
            native_modules: Map::new(),
            decoder: Arc::new(StandardDecoder),
            output: Box::new(std::io::stdout()),
        }
        .with_native_module("builtins", |vm| Ok(vm.builtins.clone()))
    }
}

impl Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("frames", &self.frames)
            .field("pending", &self.pending)
            .field("handled", &self.handled)
            .field("steps", &self.steps)
            .field("max_depth", &self.max_depth)
            .finish_non_exhaustive()
    }
}

impl Vm {
    /// Returns a virtual machine with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves imports using `loader`.
    #[must_use]
    pub fn with_loader(mut self, loader: impl ModuleLoader + 'static) -> Self {
        self.loader = Some(Arc::new(loader));
        self
    }

    /// Decodes instructions using `decoder`.
    #[must_use]
    pub fn with_decoder(mut self, decoder: impl Decoder) -> Self {
        self.decoder = Arc::new(decoder);
        self
    }

    /// Limits the number of nested frames. Exceeding the limit raises
    /// `RecursionError`.
    #[must_use]
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Directs `print` and `PRINT_EXPR` output to `output`.
    #[must_use]
    pub fn with_output(mut self, output: impl Write + Send + 'static) -> Self {
        self.output = Box::new(output);
        self
    }

    /// Registers a module implemented by the host. It is used when the
    /// module loader cannot provide interpreted code for `name`.
    #[must_use]
    pub fn with_native_module<F>(mut self, name: impl Into<Symbol>, init: F) -> Self
    where
        F: Fn(&mut Vm) -> Result<Arc<Namespace>, Fault> + Send + Sync + 'static,
    {
        self.native_modules.insert(name.into(), Arc::new(init));
        self
    }

    /// Allows `amount` more instructions to execute. Until this is first
    /// called, execution is unbudgeted.
    pub fn increase_budget(&mut self, amount: usize) {
        self.budget.allocate(amount);
    }

    /// Returns the number of instructions executed by this virtual machine.
    #[must_use]
    pub const fn steps(&self) -> u64 {
        self.steps
    }

    /// Returns the active call stack, outermost first.
    #[must_use]
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Returns the frame currently executing.
    #[must_use]
    pub fn current_frame(&self) -> Option<&Frame> {
        self.frames.last()
    }

    /// Returns the shared builtins namespace.
    #[must_use]
    pub const fn builtins(&self) -> &Arc<Namespace> {
        &self.builtins
    }

    /// Returns the exception currently being handled by an `except` or
    /// `finally` block.
    #[must_use]
    pub const fn handled_exception(&self) -> Option<&ExceptionTriple> {
        self.handled.as_ref()
    }

    /// Returns the loaded modules, keyed by qualified name.
    #[must_use]
    pub const fn modules(&self) -> &AHashMap<Symbol, Value> {
        &self.modules
    }

    /// Returns a traceback of the active call stack, outermost first.
    #[must_use]
    pub fn stack_trace(&self) -> Vec<TracebackEntry> {
        self.frames.iter().map(TracebackEntry::for_frame).collect()
    }

    /// Returns a fresh namespace suitable for running a module named `name`.
    #[must_use]
    pub fn module_namespace(&self, name: impl Into<Symbol>) -> Arc<Namespace> {
        let namespace = Namespace::default();
        namespace.insert(Symbol::from("__name__"), Value::Str(name.into()));
        namespace.insert(Symbol::from("__doc__"), Value::None);
        namespace.insert(
            Symbol::from("__builtins__"),
            Value::shared(self.builtins.clone()),
        );
        Arc::new(namespace)
    }

    /// Runs `code` as the `__main__` module, with `bindings` predefined as
    /// globals, and returns the value it returns.
    pub fn run(
        &mut self,
        code: &Code,
        bindings: impl IntoIterator<Item = (Symbol, Value)>,
    ) -> Result<Value, ExecutionError> {
        let globals = self.module_namespace("__main__");
        for (name, value) in bindings {
            globals.insert(name, value);
        }
        self.run_in(code, &globals)
    }

    /// Runs `code` using `globals` as both its global and local namespace.
    ///
    /// On normal completion the call stack and the module frame's operand
    /// stack must be empty; anything left behind is reported as an internal
    /// error.
    pub fn run_in(&mut self, code: &Code, globals: &Arc<Namespace>) -> Result<Value, ExecutionError> {
        let base = self.frames.len();
        if base == 0 {
            self.pending = None;
            self.handled = None;
        }
        let frame = Frame::new(
            code.clone(),
            globals.clone(),
            globals.clone(),
            self.builtins.clone(),
            &[],
        )?;
        match self.run_frame(frame) {
            Ok(FrameExit::Returned(value, frame)) => {
                if self.frames.len() != base {
                    Err(ExecutionError::Internal(Fault::FramesLeftOver))
                } else if !frame.stack().is_empty() {
                    Err(ExecutionError::Internal(Fault::DataLeftOnStack))
                } else {
                    Ok(value)
                }
            }
            Ok(FrameExit::Yielded(..)) => Err(ExecutionError::Internal(Fault::UnexpectedYield)),
            Err(fault) => {
                self.frames.truncate(base);
                Err(ExecutionError::from(fault))
            }
        }
    }

    /// Invokes `callable` from the host.
    pub fn call(&mut self, callable: &Value, args: Arguments) -> Result<Value, ExecutionError> {
        let base = self.frames.len();
        self.invoke(callable, args).map_err(|fault| {
            self.frames.truncate(base);
            ExecutionError::from(fault)
        })
    }

    /// Imports the module `name` from the host, as `import name` would, and
    /// returns the module itself.
    pub fn import(&mut self, name: &str) -> Result<Value, ExecutionError> {
        let base = self.frames.len();
        self.import_module(&Symbol::from(name)).map_err(|fault| {
            self.frames.truncate(base);
            ExecutionError::from(fault)
        })
    }

    /// Writes `text` to this virtual machine's output.
    pub fn write_output(&mut self, text: &str) -> Result<(), Fault> {
        self.output
            .write_all(text.as_bytes())
            .and_then(|()| self.output.flush())
            .map_err(|err| Fault::error(ErrorKind::OSError, err.to_string()))
    }

    pub(crate) fn invoke(&mut self, callable: &Value, args: Arguments) -> Result<Value, Fault> {
        callable.call(self, args)
    }

    pub(crate) fn frame(&self) -> &Frame {
        self.frames.last().expect("no active frame")
    }

    pub(crate) fn frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("no active frame")
    }

    /// Runs `frame` until it returns, raises, or yields.
    ///
    /// Interpreted calls nest on the native stack, so it is grown in
    /// segments whenever less than [`STACK_RED_ZONE`] bytes remain.
    pub(crate) fn run_frame(&mut self, frame: Frame) -> Result<FrameExit, Fault> {
        stacker::maybe_grow(STACK_RED_ZONE, STACK_SEGMENT, || self.run_frame_inner(frame))
    }

    fn run_frame_inner(&mut self, frame: Frame) -> Result<FrameExit, Fault> {
        if self.frames.len() >= self.max_depth {
            return Err(Fault::error(
                ErrorKind::RecursionError,
                "maximum recursion depth exceeded",
            ));
        }
        debug!(code = %frame.code().name, depth = self.frames.len(), "entering frame");
        self.frames.push(frame);
        let why = match self.execute_current_frame() {
            Ok(why) => why,
            Err(fault) => {
                self.frames.pop();
                return Err(fault);
            }
        };
        let frame = self.frames.pop().expect("frame pushed above");
        debug!(code = %frame.code().name, ?why, "leaving frame");
        match why {
            Why::Yield => Ok(FrameExit::Yielded(
                std::mem::take(&mut self.return_value),
                frame,
            )),
            Why::Return => Ok(FrameExit::Returned(
                std::mem::take(&mut self.return_value),
                frame,
            )),
            Why::Exception | Why::Reraise => Err(Fault::Raised(
                self.pending.take().ok_or(Fault::MissingException)?,
            )),
            Why::Break | Why::Continue => Err(Fault::BlockMismatch),
        }
    }

    fn execute_current_frame(&mut self) -> Result<Why, Fault> {
        loop {
            let why = match self.step() {
                Ok(None) => continue,
                Ok(Some(Why::Reraise)) => Why::Exception,
                Ok(Some(why)) => why,
                Err(fault) => {
                    self.capture(fault)?;
                    Why::Exception
                }
            };

            if why == Why::Yield {
                return Ok(why);
            }

            let mut unhandled = Some(why);
            while let Some(why) = unhandled {
                if self.frame().blocks.is_empty() {
                    return Ok(why);
                }
                unhandled = self.unwind(why)?;
            }
        }
    }

    fn step(&mut self) -> Result<Option<Why>, Fault> {
        self.budget.charge()?;
        self.steps += 1;
        let frame = self.frames.last_mut().expect("no active frame");
        let instruction = self.decoder.decode(&frame.code, frame.pc)?;
        frame.last_offset = instruction.offset;
        frame.pc = instruction.next;
        trace!(
            step = self.steps,
            offset = instruction.offset,
            opcode = %instruction.opcode,
            operand = %instruction.operand,
            stack = frame.stack.len(),
            blocks = frame.blocks.len(),
            "{}",
            frame.code.name
        );
        self.dispatch(instruction)
    }

    /// Converts a language-level fault into the pending exception, recording
    /// the current frame in its traceback. Internal faults are returned.
    fn capture(&mut self, fault: Fault) -> Result<(), Fault> {
        let triple = match fault {
            Fault::Raised(triple) => triple,
            internal if internal.is_internal() => return Err(internal),
            other => {
                let triple = other.into_triple()?;
                if let Some(handled) = &self.handled {
                    triple.set_context(handled);
                }
                triple
            }
        };
        let triple = triple.with_entry(TracebackEntry::for_frame(self.frame()));
        debug!(exception = %triple, "exception raised");
        self.pending = Some(triple);
        Ok(())
    }

    /// Applies one transition of the block-stack machine, returning the why
    /// signal still unhandled afterwards.
    fn unwind(&mut self, why: Why) -> Result<Option<Why>, Fault> {
        let continue_target = self.return_value.as_usize();
        let frame = self.frame_mut();
        let Some(block) = frame.blocks.last().copied() else {
            return Ok(Some(why));
        };
        trace!(?why, block = ?block.kind, level = block.level, "unwinding");

        if block.kind == BlockKind::Loop && why == Why::Continue {
            frame.pc = continue_target.ok_or(Fault::InvalidOperand)?;
            return Ok(None);
        }

        frame.blocks.pop();
        if block.kind == BlockKind::ExceptHandler {
            self.unwind_except_handler(block)?;
            return Ok(Some(why));
        }
        frame.truncate(block.level);

        match (block.kind, why) {
            (BlockKind::Loop, Why::Break) => {
                frame.pc = block.handler;
                Ok(None)
            }
            (BlockKind::SetupExcept | BlockKind::Finally | BlockKind::With, Why::Exception) => {
                self.enter_handler(block.handler)?;
                Ok(None)
            }
            (BlockKind::Finally | BlockKind::With, _) => {
                if matches!(why, Why::Return | Why::Continue) {
                    let value = self.return_value.clone();
                    self.frame_mut().push(value);
                }
                let frame = self.frame_mut();
                frame.push(Value::dynamic(Marker::Why(why)));
                frame.pc = block.handler;
                Ok(None)
            }
            _ => Ok(Some(why)),
        }
    }

    /// Moves the pending exception into the handled slot and transfers
    /// control to `handler`.
    ///
    /// The previously handled exception (or a `None` triple) is pushed first
    /// so that leaving the handler can restore it, followed by the exception
    /// being handled.
    fn enter_handler(&mut self, handler: usize) -> Result<(), Fault> {
        let pending = self.pending.take().ok_or(Fault::MissingException)?;
        let previous = self
            .handled
            .replace(pending.clone())
            .unwrap_or_else(ExceptionTriple::none);
        let frame = self.frame_mut();
        frame.push_block(BlockKind::ExceptHandler, handler);
        frame.push_triple(previous);
        frame.push_triple(pending);
        frame.pc = handler;
        Ok(())
    }

    /// Discards an except-handler block's stack entries, restoring the
    /// exception that was being handled when the block was entered.
    pub(crate) fn unwind_except_handler(&mut self, block: Block) -> Result<(), Fault> {
        let frame = self.frame_mut();
        frame.truncate(block.level + 3);
        let [traceback, value, kind] = frame.pop_array()?;
        self.handled = if kind.is_none() {
            None
        } else {
            Some(ExceptionTriple {
                kind,
                value,
                traceback,
            })
        };
        Ok(())
    }
}

/// How a frame stopped running.
#[derive(Debug)]
pub(crate) enum FrameExit {
    Returned(Value, Frame),
    Yielded(Value, Frame),
}

/// A failure raised while executing an instruction.
///
/// Language-level faults become interpreted exceptions. Internal faults
/// indicate a defect in the interpreter or unsupported code, and are never
/// delivered to interpreted handlers.
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    /// An interpreted exception.
    Raised(ExceptionTriple),
    /// An exception of a builtin class, constructed with one argument.
    Error(ErrorKind, Value),
    /// An iterator was exhausted with the contained value.
    StopIteration(Value),
    /// The instruction budget was exhausted.
    NoBudget,
    /// An opcode number outside the supported instruction set.
    UnknownOpcode(u8),
    /// A known opcode that may not reach the dispatch loop.
    UnsupportedOpcode(crate::code::opcode::Opcode),
    /// An instruction popped more values than its frame's stack held.
    StackUnderflow,
    /// `END_FINALLY` found an unexpected value on the stack.
    ConfusedEndFinally,
    /// The block stack did not contain the expected block.
    BlockMismatch,
    /// An instruction's argument could not be resolved.
    InvalidOperand,
    /// Execution reached an offset outside of the code.
    InvalidInstructionAddress(usize),
    /// A non-generator frame yielded.
    UnexpectedYield,
    /// Exception handling began without a pending exception.
    MissingException,
    /// Frames remained on the call stack after the top-level frame
    /// returned.
    FramesLeftOver,
    /// Values remained on the top-level frame's stack after it returned.
    DataLeftOnStack,
}

impl Fault {
    /// Returns true if this fault is an interpreter defect rather than an
    /// interpreted exception.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        !matches!(
            self,
            Fault::Raised(_) | Fault::Error(..) | Fault::StopIteration(_)
        )
    }

    /// Returns true if this fault is an exception of class `kind` or one of
    /// its subclasses.
    #[must_use]
    pub fn is_exception(&self, kind: ErrorKind) -> bool {
        match self {
            Fault::Raised(triple) => triple.is_instance_of(kind),
            Fault::Error(raised, _) => raised.is_subclass_of(kind),
            Fault::StopIteration(_) => ErrorKind::StopIteration.is_subclass_of(kind),
            _ => false,
        }
    }

    /// Returns an exception of class `kind` with `message`.
    #[must_use]
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error(kind, Value::from(message.into()))
    }

    /// Returns a `TypeError`.
    #[must_use]
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::error(ErrorKind::TypeError, message)
    }

    /// Returns a `ValueError`.
    #[must_use]
    pub fn value_error(message: impl Into<String>) -> Self {
        Self::error(ErrorKind::ValueError, message)
    }

    /// Returns an `IndexError`.
    #[must_use]
    pub fn index_error(message: impl Into<String>) -> Self {
        Self::error(ErrorKind::IndexError, message)
    }

    /// Returns a `KeyError` for `key`.
    #[must_use]
    pub fn key_error(key: Value) -> Self {
        Self::Error(ErrorKind::KeyError, key)
    }

    /// Returns a `RuntimeError`.
    #[must_use]
    pub fn runtime_error(message: impl Into<String>) -> Self {
        Self::error(ErrorKind::RuntimeError, message)
    }

    /// Returns a `NameError` for an undefined name.
    #[must_use]
    pub fn name_error(name: &Symbol) -> Self {
        Self::error(ErrorKind::NameError, format!("name '{name}' is not defined"))
    }

    /// Returns an `UnboundLocalError` for `name`.
    #[must_use]
    pub fn unbound_local(name: &Symbol) -> Self {
        Self::error(
            ErrorKind::UnboundLocalError,
            format!("local variable '{name}' referenced before assignment"),
        )
    }

    /// Returns an `AttributeError` for a missing attribute.
    #[must_use]
    pub fn no_attribute(type_name: &Symbol, name: &Symbol) -> Self {
        Self::error(
            ErrorKind::AttributeError,
            format!("'{type_name}' object has no attribute '{name}'"),
        )
    }

    /// Returns a `ZeroDivisionError`.
    #[must_use]
    pub fn zero_division(message: impl Into<String>) -> Self {
        Self::error(ErrorKind::ZeroDivisionError, message)
    }

    /// Returns an `OverflowError` for integer results outside of the 64-bit
    /// range.
    #[must_use]
    pub fn overflow() -> Self {
        Self::error(
            ErrorKind::OverflowError,
            "integer result does not fit in 64 bits",
        )
    }
}

impl Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Fault::Raised(triple) => Display::fmt(triple, f),
            Fault::Error(kind, arg) => write!(f, "{}: {arg}", kind.name()),
            Fault::StopIteration(value) if value.is_none() => f.write_str("StopIteration"),
            Fault::StopIteration(value) => write!(f, "StopIteration: {value}"),
            Fault::NoBudget => f.write_str("execution budget exhausted"),
            Fault::UnknownOpcode(number) => write!(f, "unknown opcode {number}"),
            Fault::UnsupportedOpcode(opcode) => write!(f, "unsupported opcode {opcode}"),
            Fault::StackUnderflow => f.write_str("operand stack underflow"),
            Fault::ConfusedEndFinally => f.write_str("confused END_FINALLY"),
            Fault::BlockMismatch => f.write_str("unexpected block on the block stack"),
            Fault::InvalidOperand => f.write_str("invalid instruction operand"),
            Fault::InvalidInstructionAddress(offset) => {
                write!(f, "no instruction at offset {offset}")
            }
            Fault::UnexpectedYield => f.write_str("yield outside of a generator"),
            Fault::MissingException => f.write_str("no pending exception"),
            Fault::FramesLeftOver => f.write_str("frames left over on the call stack"),
            Fault::DataLeftOnStack => f.write_str("data left on the operand stack"),
        }
    }
}

impl std::error::Error for Fault {}

/// An error returned to the host.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionError {
    /// The instruction budget was exhausted.
    NoBudget,
    /// An exception was not handled by interpreted code.
    Exception(ExceptionTriple),
    /// The interpreter encountered an internal error.
    Internal(Fault),
}

impl ExecutionError {
    /// Returns the uncaught exception, if this is one.
    #[must_use]
    pub const fn exception(&self) -> Option<&ExceptionTriple> {
        match self {
            ExecutionError::Exception(triple) => Some(triple),
            _ => None,
        }
    }

    /// Returns true if this is an uncaught exception of class `kind` or a
    /// subclass.
    #[must_use]
    pub fn is_exception(&self, kind: ErrorKind) -> bool {
        self.exception()
            .is_some_and(|triple| triple.is_instance_of(kind))
    }
}

impl From<Fault> for ExecutionError {
    fn from(fault: Fault) -> Self {
        match fault {
            Fault::NoBudget => ExecutionError::NoBudget,
            other => match other.into_triple() {
                Ok(triple) => ExecutionError::Exception(triple),
                Err(internal) => ExecutionError::Internal(internal),
            },
        }
    }
}

impl Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionError::NoBudget => f.write_str("execution budget exhausted"),
            ExecutionError::Exception(triple) => Display::fmt(triple, f),
            ExecutionError::Internal(fault) => write!(f, "internal error: {fault}"),
        }
    }
}

impl std::error::Error for ExecutionError {}

/// A [`Write`] implementation that collects output in memory.
#[derive(Debug, Default, Clone)]
pub struct OutputBuffer(Arc<Mutex<Vec<u8>>>);

impl OutputBuffer {
    /// Returns everything written so far.
    #[must_use]
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl Write for OutputBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct Budget(Option<NonZeroUsize>);

impl Budget {
    fn allocate(&mut self, amount: usize) {
        self.0 = match self.0 {
            Some(budget) => Some(budget.saturating_add(amount)),
            None => NonZeroUsize::new(amount.saturating_add(1)),
        };
    }

    fn charge(&mut self) -> Result<(), Fault> {
        if let Some(amount) = &mut self.0 {
            *amount = NonZeroUsize::new(amount.get().saturating_sub(1)).ok_or(Fault::NoBudget)?;
        }
        Ok(())
    }
}
