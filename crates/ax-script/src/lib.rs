//! Strategy scripts: static validation and a sandboxed interpreter
//! exposing the backtrader-style API strategies are written against.

mod ast;
mod builtins;
mod format;
mod indicators;
mod interp;
mod lexer;
mod natives;
mod parser;
mod value;

pub mod error;
pub mod loader;
pub mod runtime;
pub mod validate;

pub use error::{ParseError, ScriptError};
pub use loader::{introspect_parameters, DiscardLogs, ParameterIntrospection, ScriptStrategy, StrategyLoader, StrategyType};
pub use runtime::SandboxLimits;
pub use validate::{validate, Validator, ValidatorConfig};
