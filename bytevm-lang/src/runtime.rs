//! Types and functionality that interpreted code operates on.

pub mod builtins;
pub mod exception;
pub mod iter;
pub mod list;
pub mod map;
pub mod methods;
pub mod namespace;
pub mod operators;
pub mod string;
pub mod symbol;
pub mod types;
pub mod value;
