//! C++ statement generation backend

mod translator;

pub use translator::{
    compile, CompileError, CppTranslator, GeneratedQuery, OutputField, SourceConfig,
    TranslateError,
};
