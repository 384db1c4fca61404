//! AST node variants produced by the parser and consumed by the compiler.
//!
//! Every node carries a [`Span`]; statements and declarations are the same
//! node type as expressions so blocks hold a uniform node list.

use serde::{Deserialize, Serialize};

/// Source span of a node: 1-based line/column plus byte offset/length.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub line: u32,
    pub column: u32,
    pub offset: u32,
    pub length: u32,
}

impl Span {
    #[must_use]
    pub fn new(line: u32, column: u32, offset: u32, length: u32) -> Self {
        Self {
            line,
            column,
            offset,
            length,
        }
    }

    /// Extends this span to cover `other` (assumed to start later).
    #[must_use]
    pub fn to(self, other: Self) -> Self {
        let end = other.offset + other.length;
        Self {
            length: end.saturating_sub(self.offset),
            ..self
        }
    }
}

/// One parsed node with its source span.
#[derive(Debug, Clone, PartialEq)]
pub struct AstNode {
    pub kind: AstKind,
    pub span: Span,
}

impl AstNode {
    #[must_use]
    pub fn new(kind: AstKind, span: Span) -> Self {
        Self { kind, span }
    }

    /// A synthetic node used to keep downstream passes going after an
    /// unrecoverable parse failure at this position.
    #[must_use]
    pub fn empty(span: Span) -> Self {
        Self {
            kind: AstKind::NullLiteral,
            span,
        }
    }
}

/// Prefix operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Negate,
    Not,
}

/// Binary operators at their precedence levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    LogicalOr,
    LogicalAnd,
    Equal,
    NotEqual,
    Lesser,
    Greater,
    LesserOrEqual,
    GreaterOrEqual,
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
}

/// Declared type annotations. Advisory at runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeExpr {
    /// A named type, possibly with type arguments: `List<num>`, `str?`.
    Nominal {
        name: String,
        args: Vec<TypeExpr>,
        nullable: bool,
    },
    /// A function type: `fun (num, str) -> bool`.
    Function {
        params: Vec<TypeExpr>,
        return_type: Box<TypeExpr>,
        nullable: bool,
    },
}

impl TypeExpr {
    #[must_use]
    pub fn nominal(name: impl Into<String>) -> Self {
        Self::Nominal {
            name: name.into(),
            args: Vec::new(),
            nullable: false,
        }
    }

    /// The nominal name, or a synthetic name for function types.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Nominal { name, .. } => name,
            Self::Function { .. } => "function",
        }
    }
}

/// Modifier set on declarations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Modifiers {
    pub is_external: bool,
    pub is_static: bool,
    pub is_const: bool,
    pub is_mutable: bool,
    pub is_exported: bool,
    pub is_top_level: bool,
    pub late_initialize: bool,
}

/// What kind of callable a function declaration introduces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionCategory {
    Normal,
    Literal,
    Method,
    Getter,
    Setter,
    Constructor,
    Factory,
}

impl FunctionCategory {
    /// Byte encoding used inside function declaration opcodes.
    #[must_use]
    pub fn to_byte(self) -> u8 {
        match self {
            Self::Normal => 0,
            Self::Literal => 1,
            Self::Method => 2,
            Self::Getter => 3,
            Self::Setter => 4,
            Self::Constructor => 5,
            Self::Factory => 6,
        }
    }

    #[must_use]
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0 => Self::Normal,
            1 => Self::Literal,
            2 => Self::Method,
            3 => Self::Getter,
            4 => Self::Setter,
            5 => Self::Constructor,
            6 => Self::Factory,
            _ => return None,
        })
    }
}

/// One declared parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub declared_type: Option<TypeExpr>,
    pub initializer: Option<AstNode>,
    pub is_optional: bool,
    pub is_named: bool,
    pub is_variadic: bool,
    pub span: Span,
}

/// Redirecting-constructor record: `construct(...) : super(...)`.
#[derive(Debug, Clone, PartialEq)]
pub struct RedirectingCall {
    pub target: RedirectTarget,
    /// Named-constructor key on the target, if any.
    pub key: Option<String>,
    pub positional: Vec<AstNode>,
    pub named: Vec<(String, AstNode)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectTarget {
    Super,
    This,
}

/// A function declaration or literal.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDecl {
    /// Script-visible name; `None` for anonymous literals.
    pub name: Option<String>,
    /// Unique internal name used for binding and stack traces.
    pub internal_name: String,
    pub category: FunctionCategory,
    pub modifiers: Modifiers,
    pub generic_params: Vec<String>,
    pub params: Vec<Param>,
    pub min_arity: u8,
    pub max_arity: u8,
    pub is_variadic: bool,
    pub return_type: Option<TypeExpr>,
    pub redirect: Option<RedirectingCall>,
    /// Block body; absent on external and abstract declarations.
    pub body: Option<Box<AstNode>>,
}

/// A variable declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct VarDecl {
    pub name: String,
    /// Owning class name when declared inside a class body.
    pub class_name: Option<String>,
    pub modifiers: Modifiers,
    pub declared_type: Option<TypeExpr>,
    pub initializer: Option<Box<AstNode>>,
}

/// A class declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassDecl {
    pub name: String,
    pub super_type: Option<TypeExpr>,
    pub generic_params: Vec<String>,
    pub implements: Vec<TypeExpr>,
    pub mixes: Vec<TypeExpr>,
    pub modifiers: Modifiers,
    pub is_abstract: bool,
    /// Member declarations: `VarDecl` and `FunctionDecl` nodes.
    pub members: Vec<AstNode>,
    pub has_user_constructor: bool,
}

/// An enum declaration. Lowered to a class by the compiler.
#[derive(Debug, Clone, PartialEq)]
pub struct EnumDecl {
    pub name: String,
    pub modifiers: Modifiers,
    pub values: Vec<String>,
}

/// A named struct declaration with an optional prototype.
#[derive(Debug, Clone, PartialEq)]
pub struct StructDecl {
    pub name: String,
    pub prototype: Option<String>,
    pub fields: Vec<(String, AstNode)>,
    pub modifiers: Modifiers,
}

/// An import declaration. `resolved_key` is annotated by the module
/// loader once the injected resolver has produced the absolute key.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportDecl {
    pub key: String,
    pub resolved_key: Option<String>,
    pub alias: Option<String>,
    pub show: Vec<String>,
}

/// Every node variant.
#[derive(Debug, Clone, PartialEq)]
pub enum AstKind {
    // expressions
    NullLiteral,
    BoolLiteral(bool),
    IntLiteral(i64),
    FloatLiteral(f64),
    StringLiteral(String),
    /// `text` holds `{N}` placeholders, one per segment expression.
    InterpolatedString {
        text: String,
        segments: Vec<AstNode>,
    },
    Identifier(String),
    Group(Box<AstNode>),
    ListLiteral(Vec<AstNode>),
    StructLiteral {
        /// Optional nominal id for named struct values.
        id: Option<String>,
        prototype: Option<String>,
        fields: Vec<(String, AstNode)>,
    },
    FunctionLiteral(Box<FunctionDecl>),
    This,
    Super,
    Unary {
        op: UnaryOp,
        operand: Box<AstNode>,
    },
    Binary {
        op: BinaryOp,
        left: Box<AstNode>,
        right: Box<AstNode>,
    },
    Ternary {
        condition: Box<AstNode>,
        then_value: Box<AstNode>,
        else_value: Box<AstNode>,
    },
    Member {
        object: Box<AstNode>,
        name: String,
    },
    Subscript {
        object: Box<AstNode>,
        key: Box<AstNode>,
    },
    Call {
        callee: Box<AstNode>,
        positional: Vec<AstNode>,
        named: Vec<(String, AstNode)>,
    },
    Assign {
        target: Box<AstNode>,
        value: Box<AstNode>,
    },
    TypeCheck {
        operand: Box<AstNode>,
        ty: TypeExpr,
        negated: bool,
    },
    TypeCast {
        operand: Box<AstNode>,
        ty: TypeExpr,
    },
    TypeOf {
        operand: Box<AstNode>,
    },

    // statements
    Block(Vec<AstNode>),
    If {
        condition: Box<AstNode>,
        then_branch: Box<AstNode>,
        else_branch: Option<Box<AstNode>>,
    },
    While {
        condition: Box<AstNode>,
        body: Box<AstNode>,
    },
    DoWhile {
        body: Box<AstNode>,
        condition: Box<AstNode>,
    },
    For {
        init: Option<Box<AstNode>>,
        condition: Option<Box<AstNode>>,
        increment: Option<Box<AstNode>>,
        body: Box<AstNode>,
    },
    ForIn {
        decl_name: String,
        iterable: Box<AstNode>,
        body: Box<AstNode>,
    },
    When {
        subject: Option<Box<AstNode>>,
        cases: Vec<(AstNode, AstNode)>,
        else_branch: Option<Box<AstNode>>,
    },
    Return {
        value: Option<Box<AstNode>>,
    },
    Break,
    Continue,
    /// Blank-line marker preserved from the token stream.
    EmptyLine,

    // declarations
    VarDecl(VarDecl),
    FunctionDecl(Box<FunctionDecl>),
    ClassDecl(Box<ClassDecl>),
    EnumDecl(EnumDecl),
    StructDecl(Box<StructDecl>),
    TypeAliasDecl {
        name: String,
        ty: TypeExpr,
        modifiers: Modifiers,
    },
    ImportDecl(ImportDecl),
    LibraryDecl {
        name: String,
    },
}

impl AstKind {
    /// Whether this node is a declaration form.
    #[must_use]
    pub fn is_declaration(&self) -> bool {
        matches!(
            self,
            Self::VarDecl(_)
                | Self::FunctionDecl(_)
                | Self::ClassDecl(_)
                | Self::EnumDecl(_)
                | Self::StructDecl(_)
                | Self::TypeAliasDecl { .. }
                | Self::ImportDecl(_)
                | Self::LibraryDecl { .. }
        )
    }

    /// Whether assignment may target this node form.
    #[must_use]
    pub fn is_legal_left_value(&self) -> bool {
        matches!(self, Self::Identifier(_) | Self::Member { .. } | Self::Subscript { .. })
    }
}
