//! linqc AST - query combinator tree and chain simplifier

pub mod ast;
mod names;
mod shortcuts;
mod simplify;

pub use ast::*;
pub use names::NameGen;
pub use shortcuts::rewrite_aggregate_shortcuts;
pub use simplify::{simplify, SimplifyError};
