//! Quill: a small, embeddable scripting language.
//!
//! Source text is lexed, parsed into an AST, compiled to a compact
//! bytecode image, and executed by a register-augmented stack virtual
//! machine. The language is dynamically typed with optional advisory
//! type annotations and supports imperative control flow, first-class
//! functions and closures, classes with single inheritance,
//! enumerations, and prototype-based struct objects.
//!
//! The embedding surface is [`Interpreter`]: register host bindings with
//! `init`, run sources with `eval`, precompile with `compile` and
//! `load_bytecode`, and call into scripts with `invoke`.

pub mod ast;
mod bytes;
mod class;
mod compiler;
mod consttable;
mod declaration;
mod error;
mod external;
mod function;
mod heap;
mod image;
mod interpreter;
mod io;
mod lexer;
mod module;
mod namespace;
mod opcode;
mod parser;
mod resource;
mod struct_obj;
mod token;
mod tracer;
mod value;
mod vm;

pub use crate::{
    class::{Class, FieldDef, Instance},
    declaration::{CodeRef, Declaration, LateInit},
    error::{ErrorCode, ErrorKind, ErrorSeverity, QuillError, QuillResult},
    external::{
        Builtin, CallArguments, ExternalBindings, ExternalCallable, ExternalClassBinding, HostContext, HostResult,
    },
    function::{Function, ParamDef, RedirectRecord},
    heap::{Heap, HeapData, HeapId},
    interpreter::{EvalOptions, Interpreter},
    io::{CollectStringPrint, NoPrint, PrintWriter, SharedStringPrint, StdPrint},
    module::{
        CompilationBundle, MemoryResolver, ModuleLoader, ParsedModule, ResolvedSource, SourceResolver, SourceType,
    },
    namespace::{Namespace, NamespaceId, Namespaces},
    opcode::{LocalType, Opcode, REGISTER_COUNT, Register, SIGNATURE, VERSION},
    resource::{CancellationFlag, DEFAULT_MAX_RECURSION_DEPTH, ResourceLimits},
    struct_obj::StructObject,
    tracer::{NoopTracer, StderrTracer, VmTracer},
    value::{TypeValue, Value},
};
