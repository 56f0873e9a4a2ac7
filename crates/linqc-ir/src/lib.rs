//! linqc IR - statement tree, scope tracking, and the C++ translator

pub mod cpp;
pub mod rep;
pub mod scope;
pub mod statement;

pub use cpp::{
    compile, CompileError, CppTranslator, GeneratedQuery, OutputField, SourceConfig,
    TranslateError,
};
pub use rep::{Rep, Sequence, Value};
pub use scope::{CodeBuffer, Scope, ScopeError};
pub use statement::{Block, BlockId, Blocks, SourceEmitter, Statement, VarDecl};
