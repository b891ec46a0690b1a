//! A frame-executing virtual machine for CPython 3.6 bytecode.
//!
//! Code objects are interpreted one instruction at a time against an explicit
//! operand stack and block stack, so every step of execution can be observed
//! through `tracing` or inspected on the [`Vm`](vm::Vm) between calls.

macro_rules! impl_from {
    ($on:ty, $from:ty, $variant:ident) => {
        impl From<$from> for $on {
            fn from(value: $from) -> Self {
                Self::$variant(value.into())
            }
        }
    };
}

#[cfg(feature = "tracing")]
#[macro_use]
extern crate tracing;
#[cfg(not(feature = "tracing"))]
#[macro_use]
mod mock_tracing;

pub mod code;
pub mod runtime;
pub mod vm;

#[cfg(test)]
mod tests;

use std::fmt::Display;

use vm::import::LoadError;
use vm::ExecutionError;

/// An error raised while loading or executing code.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// A module or program could not be loaded.
    Load(LoadError),
    /// An execution error.
    Execution(ExecutionError),
}

impl From<LoadError> for Error {
    fn from(value: LoadError) -> Self {
        Self::Load(value)
    }
}

impl From<ExecutionError> for Error {
    fn from(value: ExecutionError) -> Self {
        Self::Execution(value)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Load(err) => Display::fmt(err, f),
            Error::Execution(err) => Display::fmt(err, f),
        }
    }
}

impl std::error::Error for Error {}
