//! Activation records and the block stack.

use std::fmt::Debug;
use std::sync::Arc;

use kempt::Map;

use crate::code::Code;
use crate::runtime::exception::ExceptionTriple;
use crate::runtime::namespace::Namespace;
use crate::runtime::symbol::Symbol;
use crate::runtime::value::{AnyDynamic, CustomType, Value};
use crate::vm::function::Cell;
use crate::vm::Fault;

/// Why the normal flow of a frame was interrupted.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Why {
    /// `return`
    Return,
    /// `break`
    Break,
    /// `continue` from inside a `try` block.
    Continue,
    /// A generator yielded.
    Yield,
    /// An exception was raised.
    Exception,
    /// An exception was re-raised by `END_FINALLY`.
    Reraise,
}

impl Why {
    /// Returns the lowercase name of this signal.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Why::Return => "return",
            Why::Break => "break",
            Why::Continue => "continue",
            Why::Yield => "yield",
            Why::Exception => "exception",
            Why::Reraise => "reraise",
        }
    }
}

/// The construct a [`Block`] was pushed for.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum BlockKind {
    /// `SETUP_LOOP`
    Loop,
    /// `SETUP_EXCEPT`
    SetupExcept,
    /// `SETUP_FINALLY`
    Finally,
    /// `SETUP_WITH`
    With,
    /// An `except` or `finally` body handling an exception.
    ExceptHandler,
}

/// A block stack entry.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Block {
    /// The construct this block was pushed for.
    pub kind: BlockKind,
    /// The offset control transfers to when this block handles a signal.
    pub handler: usize,
    /// The operand stack depth when this block was pushed.
    pub level: usize,
}

/// Sentinels pushed onto the operand stack for `END_FINALLY` to interpret.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum Marker {
    /// A `finally` body was entered because of this signal.
    Why(Why),
    /// A `with` statement's exit method suppressed the exception.
    Silenced,
}

impl CustomType for Marker {
    fn type_name(&self) -> Symbol {
        Symbol::from("why")
    }

    fn repr(&self, _this: &AnyDynamic) -> String {
        match self {
            Marker::Why(why) => format!("<why {}>", why.name()),
            Marker::Silenced => String::from("<why silenced>"),
        }
    }

    fn equals(&self, other: &Value) -> bool {
        other.downcast_ref::<Marker>() == Some(self)
    }
}

/// The activation record of one code object execution.
pub struct Frame {
    pub(crate) code: Code,
    pub(crate) stack: Vec<Value>,
    pub(crate) blocks: Vec<Block>,
    pub(crate) locals: Arc<Namespace>,
    pub(crate) globals: Arc<Namespace>,
    pub(crate) builtins: Arc<Namespace>,
    pub(crate) cells: Map<Symbol, Cell>,
    pub(crate) pc: usize,
    pub(crate) last_offset: usize,
}

impl Frame {
    /// Returns a frame ready to execute `code` from its first instruction.
    ///
    /// Cell variables that shadow a bound argument in `locals` start out
    /// holding the argument. Free variables are bound, in order, to
    /// `closure`.
    pub(crate) fn new(
        code: Code,
        globals: Arc<Namespace>,
        locals: Arc<Namespace>,
        builtins: Arc<Namespace>,
        closure: &[Cell],
    ) -> Result<Self, Fault> {
        if closure.len() != code.freevars.len() {
            return Err(Fault::value_error(format!(
                "{}() requires a closure of length {}, not {}",
                code.name,
                code.freevars.len(),
                closure.len()
            )));
        }
        let mut cells = Map::new();
        for name in &code.cellvars {
            let cell = locals.get(name).map(Cell::new).unwrap_or_default();
            cells.insert(name.clone(), cell);
        }
        for (name, cell) in code.freevars.iter().zip(closure) {
            cells.insert(name.clone(), cell.clone());
        }
        Ok(Self {
            code,
            stack: Vec::new(),
            blocks: Vec::new(),
            locals,
            globals,
            builtins,
            cells,
            pc: 0,
            last_offset: 0,
        })
    }

    /// Returns the code this frame is executing.
    #[must_use]
    pub const fn code(&self) -> &Code {
        &self.code
    }

    /// Returns the operand stack, bottom first.
    #[must_use]
    pub fn stack(&self) -> &[Value] {
        &self.stack
    }

    /// Returns the block stack, outermost first.
    #[must_use]
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Returns the local namespace.
    #[must_use]
    pub const fn locals(&self) -> &Arc<Namespace> {
        &self.locals
    }

    /// Returns the global namespace.
    #[must_use]
    pub const fn globals(&self) -> &Arc<Namespace> {
        &self.globals
    }

    /// Returns the offset of the next instruction to execute.
    #[must_use]
    pub const fn pc(&self) -> usize {
        self.pc
    }

    /// Returns the offset of the instruction most recently executed.
    #[must_use]
    pub const fn last_offset(&self) -> usize {
        self.last_offset
    }

    /// Returns the source line of the instruction most recently executed.
    #[must_use]
    pub fn line(&self) -> Option<u32> {
        self.code.line_for(self.last_offset)
    }

    /// Looks `name` up in each of `scopes`, in order.
    pub(crate) fn resolve(&self, name: &Symbol, scopes: &[Scope]) -> Option<Value> {
        scopes.iter().find_map(|scope| {
            match scope {
                Scope::Locals => &self.locals,
                Scope::Globals => &self.globals,
                Scope::Builtins => &self.builtins,
            }
            .get(name)
        })
    }

    pub(crate) fn cell(&self, name: &Symbol) -> Result<&Cell, Fault> {
        self.cells.get(name).ok_or(Fault::InvalidOperand)
    }

    pub(crate) fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub(crate) fn pop(&mut self) -> Result<Value, Fault> {
        self.stack.pop().ok_or(Fault::StackUnderflow)
    }

    /// Removes the top `count` values, returning them bottom first.
    pub(crate) fn popn(&mut self, count: usize) -> Result<Vec<Value>, Fault> {
        let start = self
            .stack
            .len()
            .checked_sub(count)
            .ok_or(Fault::StackUnderflow)?;
        Ok(self.stack.split_off(start))
    }

    /// Removes the top `N` values, returning them bottom first.
    pub(crate) fn pop_array<const N: usize>(&mut self) -> Result<[Value; N], Fault> {
        let values = self.popn(N)?;
        <[Value; N]>::try_from(values).map_err(|_| Fault::StackUnderflow)
    }

    pub(crate) fn top(&self) -> Result<&Value, Fault> {
        self.peek(1)
    }

    /// Returns the value `depth` entries from the top, where `1` is the top.
    pub(crate) fn peek(&self, depth: usize) -> Result<&Value, Fault> {
        let index = self
            .stack
            .len()
            .checked_sub(depth)
            .ok_or(Fault::StackUnderflow)?;
        self.stack.get(index).ok_or(Fault::StackUnderflow)
    }

    /// Discards values until the stack is no deeper than `level`.
    pub(crate) fn truncate(&mut self, level: usize) {
        self.stack.truncate(level);
    }

    /// Pushes `triple` as traceback, value, then type.
    pub(crate) fn push_triple(&mut self, triple: ExceptionTriple) {
        self.stack.push(triple.traceback);
        self.stack.push(triple.value);
        self.stack.push(triple.kind);
    }

    pub(crate) fn push_block(&mut self, kind: BlockKind, handler: usize) {
        self.blocks.push(Block {
            kind,
            handler,
            level: self.stack.len(),
        });
    }

    pub(crate) fn pop_block(&mut self) -> Result<Block, Fault> {
        self.blocks.pop().ok_or(Fault::BlockMismatch)
    }
}

impl Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("code", &self.code)
            .field("pc", &self.pc)
            .field("stack", &self.stack)
            .field("blocks", &self.blocks)
            .finish_non_exhaustive()
    }
}

/// A namespace consulted during name resolution.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum Scope {
    Locals,
    Globals,
    Builtins,
}
