//! A frame-executing interpreter for CPython 3.6 bytecode.
#![cfg_attr(all(docsrs, not(doctest)), feature(doc_auto_cfg))]

pub use bytevm_lang::*;

#[cfg(feature = "rsn")]
pub mod loader;
