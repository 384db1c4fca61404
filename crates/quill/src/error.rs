//! Unified error taxonomy for every stage of the pipeline.
//!
//! A single positioned error type, [`QuillError`], flows from the lexer all
//! the way to the host. Each [`ErrorCode`] maps to exactly one
//! [`ErrorKind`], so severity and presentation are derived from the code
//! rather than chosen ad hoc at the raise site.

use std::fmt::{self, Write};

use serde::{Deserialize, Serialize};
use strum::{Display, IntoStaticStr};

/// Result type alias for operations that can produce a positioned error.
pub type QuillResult<T> = Result<T, QuillError>;

/// Coarse category an error code belongs to.
///
/// Frontend stages report `SyntacticError`; the compiler reports
/// `CompileTimeError`; the VM reports `RuntimeError`; failures that
/// originate in host callbacks report `ExternalError`. The advisory kinds
/// (`Todo`, `Hint`, `Lint`, and the static warnings) are carried for
/// analyzer-style consumers and never abort execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr, Serialize, Deserialize)]
pub enum ErrorKind {
    Todo,
    Hint,
    Lint,
    SyntacticError,
    StaticTypeWarning,
    StaticWarning,
    CompileTimeError,
    RuntimeError,
    ExternalError,
}

impl ErrorKind {
    /// Default severity for errors of this kind.
    #[must_use]
    pub fn severity(self) -> ErrorSeverity {
        match self {
            Self::Todo | Self::Hint => ErrorSeverity::Info,
            Self::Lint | Self::StaticTypeWarning | Self::StaticWarning => ErrorSeverity::Warning,
            Self::SyntacticError | Self::CompileTimeError | Self::RuntimeError | Self::ExternalError => {
                ErrorSeverity::Error
            }
        }
    }
}

/// How serious an error is for presentation purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
}

/// Every error the engine can raise, one variant per distinct condition.
///
/// The code, not the raise site, decides the [`ErrorKind`]. Keeping the
/// mapping in one place means a new code cannot silently land in the wrong
/// category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr, Serialize, Deserialize)]
pub enum ErrorCode {
    // --- syntactic ---
    /// A character the lexer cannot begin any token with.
    UnexpectedChar,
    /// A token that does not fit the grammar at this position.
    UnexpectedToken,
    /// Assignment target is not a legal left value.
    InvalidLeftValue,
    /// A `${ ... }` segment did not parse to exactly one expression.
    StringInterpolation,
    /// A statement form that the current source type does not admit.
    UnsupportedSourceType,
    /// `return` outside of a function body.
    ReturnOutsideFunction,
    /// `this` or `super` outside of an instance context.
    MisplacedThisSuper,
    /// Constructor or factory declared outside a class body.
    CtorOutsideClass,
    /// Unterminated string or block comment.
    UnterminatedLiteral,

    // --- compile time ---
    /// A construct only meaningful on external declarations, or a body on
    /// an external declaration.
    ExternalMisuse,
    /// `const` declaration without an initializer.
    ConstMustInit,
    /// Break or continue outside a loop.
    MisplacedLoopControl,

    // --- runtime ---
    /// Symbol already defined in the current namespace.
    Defined,
    /// Symbol not found walking the namespace chain.
    Undefined,
    /// External class/function not registered with the interpreter.
    UndefinedExternal,
    /// The callee value is not callable.
    NotCallable,
    /// Positional argument count outside `[minArity, maxArity]`.
    Arity,
    /// A named argument does not match any declared parameter.
    NamedArg,
    /// Member access or call on `null`.
    NullObject,
    /// Assignment to an immutable binding or member.
    Immutable,
    /// `as` cast failed at runtime.
    TypeCast,
    /// Member does not exist on the receiver.
    UndefinedMember,
    /// Subscript key has the wrong type for the receiver.
    SubGetKey,
    /// List index out of range.
    OutOfRange,
    /// Read of a late-initialized declaration whose initializer faulted.
    NotInitialized,
    /// Bytecode image does not start with the expected signature.
    BytesSignature,
    /// Bytecode image was produced by an incompatible compiler version.
    BytecodeVersion,
    /// Byte value that is not a known opcode.
    UnknownOpcode,
    /// Module key not present in the loaded image.
    MissingModule,
    /// Condition the VM cannot express (internal limits, bad operand).
    Unsupported,
    /// Script recursion exceeded the configured limit.
    StackOverflow,
    /// The host requested cancellation between opcodes.
    Cancelled,

    // --- external ---
    /// The injected source resolver failed to resolve an import key.
    SourceProviderError,
    /// A host binding returned an error.
    ExternalError,
}

impl ErrorCode {
    /// The category this code belongs to. Total, one kind per code.
    #[must_use]
    pub fn kind(self) -> ErrorKind {
        match self {
            Self::UnexpectedChar
            | Self::UnexpectedToken
            | Self::InvalidLeftValue
            | Self::StringInterpolation
            | Self::UnsupportedSourceType
            | Self::ReturnOutsideFunction
            | Self::MisplacedThisSuper
            | Self::CtorOutsideClass
            | Self::UnterminatedLiteral => ErrorKind::SyntacticError,
            Self::ExternalMisuse | Self::ConstMustInit | Self::MisplacedLoopControl => ErrorKind::CompileTimeError,
            Self::Defined
            | Self::Undefined
            | Self::UndefinedExternal
            | Self::NotCallable
            | Self::Arity
            | Self::NamedArg
            | Self::NullObject
            | Self::Immutable
            | Self::TypeCast
            | Self::UndefinedMember
            | Self::SubGetKey
            | Self::OutOfRange
            | Self::NotInitialized
            | Self::BytesSignature
            | Self::BytecodeVersion
            | Self::UnknownOpcode
            | Self::MissingModule
            | Self::Unsupported
            | Self::StackOverflow
            | Self::Cancelled => ErrorKind::RuntimeError,
            Self::SourceProviderError | Self::ExternalError => ErrorKind::ExternalError,
        }
    }
}

/// A positioned error with its accumulated stack trace.
///
/// `line` and `column` are 1-based; `offset`/`length` are byte positions in
/// the module source. Errors raised before a position is known (e.g. a bad
/// bytecode signature) carry a zeroed position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuillError {
    pub code: ErrorCode,
    pub severity: ErrorSeverity,
    /// Absolute key of the module the error was raised in, when known.
    pub module: Option<String>,
    pub line: u32,
    pub column: u32,
    pub offset: u32,
    pub length: u32,
    pub message: String,
    /// One `name (module:line:col)` line per unwound call frame, innermost
    /// first. Populated by the VM during unwinding.
    pub stack_trace: Vec<String>,
}

impl QuillError {
    /// Creates an error at an explicit position.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>, line: u32, column: u32, offset: u32, length: u32) -> Self {
        Self {
            code,
            severity: code.kind().severity(),
            module: None,
            line,
            column,
            offset,
            length,
            message: message.into(),
            stack_trace: Vec::new(),
        }
    }

    /// Creates an error with no source position (image-level failures).
    #[must_use]
    pub fn positionless(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(code, message, 0, 0, 0, 0)
    }

    /// Attaches the module key, keeping an already-set key.
    #[must_use]
    pub fn in_module(mut self, key: &str) -> Self {
        if self.module.is_none() {
            self.module = Some(key.to_owned());
        }
        self
    }

    /// The kind derived from this error's code.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.code.kind()
    }
}

impl fmt::Display for QuillError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let module = self.module.as_deref().unwrap_or("<anonymous>");
        write!(f, "{}: {}", self.kind(), self.message)?;
        if self.line != 0 {
            write!(f, " ({module}:{}:{})", self.line, self.column)?;
        } else {
            write!(f, " ({module})")?;
        }
        if !self.stack_trace.is_empty() {
            let mut trace = String::new();
            for frame in &self.stack_trace {
                write!(trace, "\n  at {frame}")?;
            }
            f.write_str(&trace)?;
        }
        Ok(())
    }
}

impl std::error::Error for QuillError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_code_maps_to_one_kind() {
        // A few spot checks across the partition boundaries.
        assert_eq!(ErrorCode::UnexpectedChar.kind(), ErrorKind::SyntacticError);
        assert_eq!(ErrorCode::ConstMustInit.kind(), ErrorKind::CompileTimeError);
        assert_eq!(ErrorCode::Arity.kind(), ErrorKind::RuntimeError);
        assert_eq!(ErrorCode::SourceProviderError.kind(), ErrorKind::ExternalError);
    }

    #[test]
    fn display_includes_position_and_trace() {
        let mut err = QuillError::new(ErrorCode::Undefined, "undefined symbol `x`", 3, 7, 21, 1).in_module("main.ql");
        err.stack_trace.push("f (main.ql:3:7)".to_owned());
        let text = err.to_string();
        assert!(text.contains("RuntimeError: undefined symbol `x` (main.ql:3:7)"));
        assert!(text.contains("\n  at f (main.ql:3:7)"));
    }

    #[test]
    fn severity_follows_kind() {
        assert_eq!(ErrorKind::Hint.severity(), ErrorSeverity::Info);
        assert_eq!(ErrorKind::Lint.severity(), ErrorSeverity::Warning);
        assert_eq!(ErrorKind::RuntimeError.severity(), ErrorSeverity::Error);
    }
}
