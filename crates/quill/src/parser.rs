//! Recursive-descent parser with precedence climbing.
//!
//! The parser is context-sensitive on a [`SourceType`]: script sources
//! admit top-level statements, module sources admit declarations only,
//! class bodies admit member forms, function bodies admit statements and
//! `return`, and expression sources admit exactly one expression.
//!
//! Errors are accumulated rather than thrown; recovery advances one token
//! past the error site so a single typo does not hide the rest of the
//! module. Compound assignment and `++`/`--` are lowered here, at parse
//! time, into plain assignments over binary expressions.

use crate::{
    ast::{
        AstKind, AstNode, BinaryOp, ClassDecl, EnumDecl, FunctionCategory, FunctionDecl, ImportDecl, Modifiers, Param,
        RedirectTarget, RedirectingCall, Span, StructDecl, TypeExpr, UnaryOp, VarDecl,
    },
    error::{ErrorCode, QuillError},
    module::SourceType,
    token::{Token, TokenKind, TokenLiteral},
};

/// Maximum expression nesting depth before the parser refuses to recurse
/// further. Prevents stack overflow on pathological inputs like
/// `((((((...))))))`.
const MAX_NESTING_DEPTH: u32 = 200;

/// Parses a token stream under the given source type.
///
/// Returns the node list and every accumulated error. For
/// [`SourceType::Expression`] the node list holds exactly one expression
/// on success.
#[must_use]
pub fn parse(tokens: &[Token], source_type: SourceType) -> (Vec<AstNode>, Vec<QuillError>) {
    let mut parser = Parser::new(tokens, source_type);
    let nodes = parser.run();
    (nodes, parser.errors)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    source_type: SourceType,
    errors: Vec<QuillError>,
    /// Updated at every primary and postfix step; consulted when an
    /// assignment operator appears.
    left_value_legal: bool,
    loop_depth: u32,
    function_depth: u32,
    class_name: Option<String>,
    nesting: u32,
    anon_counter: u32,
}

impl<'a> Parser<'a> {
    fn new(tokens: &'a [Token], source_type: SourceType) -> Self {
        Self {
            tokens,
            pos: 0,
            source_type,
            errors: Vec::new(),
            left_value_legal: false,
            loop_depth: 0,
            function_depth: 0,
            class_name: None,
            nesting: 0,
            anon_counter: 0,
        }
    }

    fn run(&mut self) -> Vec<AstNode> {
        if self.source_type == SourceType::Expression {
            let node = self.expression();
            if !self.check(TokenKind::EndOfFile) {
                self.error_here(ErrorCode::UnexpectedToken, "expected end of expression");
            }
            return vec![node];
        }
        let mut nodes = Vec::new();
        while !self.check(TokenKind::EndOfFile) {
            if self.matches(TokenKind::EmptyLine) {
                nodes.push(AstNode::new(AstKind::EmptyLine, self.prev_span()));
                continue;
            }
            let before = self.pos;
            nodes.push(self.statement());
            if self.pos == before {
                // no progress; skip the offending token so parsing terminates
                self.advance();
            }
        }
        nodes
    }

    // --- token access -----------------------------------------------------

    fn current(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> TokenKind {
        self.current().kind
    }

    fn peek_at(&self, offset: usize) -> TokenKind {
        self.tokens[(self.pos + offset).min(self.tokens.len() - 1)].kind
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn advance(&mut self) -> &Token {
        let token = &self.tokens[self.pos.min(self.tokens.len() - 1)];
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, context: &str) -> bool {
        if self.matches(kind) {
            true
        } else {
            let found = self.current().lexeme.clone();
            self.error_here(
                ErrorCode::UnexpectedToken,
                format!("expected {kind} {context}, found `{found}`"),
            );
            false
        }
    }

    fn span_here(&self) -> Span {
        let t = self.current();
        Span::new(t.line, t.column, t.offset, t.length)
    }

    fn prev_span(&self) -> Span {
        let t = &self.tokens[self.pos.saturating_sub(1)];
        Span::new(t.line, t.column, t.offset, t.length)
    }

    fn close_span(&self, start: Span) -> Span {
        start.to(self.prev_span())
    }

    fn error_here(&mut self, code: ErrorCode, message: impl Into<String>) {
        let span = self.span_here();
        self.errors
            .push(QuillError::new(code, message, span.line, span.column, span.offset, span.length));
    }

    fn skip_empty_lines(&mut self) {
        while self.matches(TokenKind::EmptyLine) {}
    }

    fn next_anonymous(&mut self) -> String {
        self.anon_counter += 1;
        format!("$anonymous_{}", self.anon_counter)
    }

    fn expect_identifier(&mut self, context: &str) -> Option<String> {
        if self.check(TokenKind::Identifier) {
            Some(self.advance().lexeme.clone())
        } else {
            let found = self.current().lexeme.clone();
            self.error_here(
                ErrorCode::UnexpectedToken,
                format!("expected identifier {context}, found `{found}`"),
            );
            None
        }
    }

    // --- statements -------------------------------------------------------

    fn statement(&mut self) -> AstNode {
        let start = self.span_here();
        let modifiers = self.parse_modifiers();
        let kind = self.peek_kind();

        if self.source_type == SourceType::Module && !Self::starts_declaration(kind) {
            self.error_here(
                ErrorCode::UnsupportedSourceType,
                "only declarations are allowed at module top level",
            );
        }

        match kind {
            TokenKind::Semicolon => {
                self.advance();
                AstNode::new(AstKind::EmptyLine, start)
            }
            TokenKind::Var | TokenKind::Final | TokenKind::Const => self.var_decl(start, modifiers),
            TokenKind::Fun => self.function_decl_statement(start, modifiers),
            TokenKind::Abstract | TokenKind::Class => self.class_decl(start, modifiers),
            TokenKind::Enum => self.enum_decl(start, modifiers),
            TokenKind::Struct if self.peek_at(1) == TokenKind::Identifier => self.struct_decl(start, modifiers),
            TokenKind::Type => self.type_alias_decl(start, modifiers),
            TokenKind::Import => self.import_decl(start),
            TokenKind::Library => self.library_decl(start),
            TokenKind::Construct | TokenKind::Factory | TokenKind::Get | TokenKind::Set
                if self.source_type == SourceType::ClassBody =>
            {
                self.class_member_function(start, modifiers)
            }
            TokenKind::LeftBrace if self.source_type != SourceType::Expression => self.block_statement(),
            TokenKind::If => self.if_statement(),
            TokenKind::While => self.while_statement(),
            TokenKind::Do => self.do_while_statement(),
            TokenKind::For => self.for_statement(),
            TokenKind::When => self.when_statement(),
            TokenKind::Return => self.return_statement(),
            TokenKind::Break => {
                self.advance();
                if self.loop_depth == 0 {
                    self.error_here(ErrorCode::MisplacedLoopControl, "`break` outside of a loop");
                }
                self.matches(TokenKind::Semicolon);
                AstNode::new(AstKind::Break, start)
            }
            TokenKind::Continue => {
                self.advance();
                if self.loop_depth == 0 {
                    self.error_here(ErrorCode::MisplacedLoopControl, "`continue` outside of a loop");
                }
                self.matches(TokenKind::Semicolon);
                AstNode::new(AstKind::Continue, start)
            }
            _ => {
                let node = self.expression();
                self.matches(TokenKind::Semicolon);
                node
            }
        }
    }

    fn starts_declaration(kind: TokenKind) -> bool {
        matches!(
            kind,
            TokenKind::Var
                | TokenKind::Final
                | TokenKind::Const
                | TokenKind::Fun
                | TokenKind::Class
                | TokenKind::Abstract
                | TokenKind::Enum
                | TokenKind::Struct
                | TokenKind::Type
                | TokenKind::Import
                | TokenKind::Export
                | TokenKind::Library
        )
    }

    fn parse_modifiers(&mut self) -> Modifiers {
        let mut modifiers = Modifiers::default();
        loop {
            match self.peek_kind() {
                TokenKind::External => {
                    self.advance();
                    modifiers.is_external = true;
                }
                TokenKind::Static => {
                    self.advance();
                    modifiers.is_static = true;
                }
                TokenKind::Late => {
                    self.advance();
                    modifiers.late_initialize = true;
                }
                TokenKind::Export => {
                    self.advance();
                    modifiers.is_exported = true;
                }
                _ => return modifiers,
            }
        }
    }

    fn var_decl(&mut self, start: Span, mut modifiers: Modifiers) -> AstNode {
        let keyword = self.advance().kind;
        match keyword {
            TokenKind::Var => modifiers.is_mutable = true,
            TokenKind::Const => modifiers.is_const = true,
            _ => {}
        }
        let name = self.expect_identifier("after variable keyword").unwrap_or_default();
        let declared_type = if self.matches(TokenKind::Colon) {
            Some(self.type_expr())
        } else {
            None
        };
        let initializer = if self.matches(TokenKind::Assign) {
            Some(Box::new(self.expression()))
        } else {
            if modifiers.is_const && !modifiers.is_external {
                self.error_here(ErrorCode::ConstMustInit, format!("const `{name}` needs an initializer"));
            }
            None
        };
        self.matches(TokenKind::Semicolon);
        AstNode::new(
            AstKind::VarDecl(VarDecl {
                name,
                class_name: self.class_name.clone(),
                modifiers,
                declared_type,
                initializer,
            }),
            self.close_span(start),
        )
    }

    fn function_decl_statement(&mut self, start: Span, modifiers: Modifiers) -> AstNode {
        self.advance(); // fun
        let category = if self.source_type == SourceType::ClassBody && !modifiers.is_static {
            FunctionCategory::Method
        } else {
            FunctionCategory::Normal
        };
        let decl = self.function_rest(category, modifiers, None);
        AstNode::new(AstKind::FunctionDecl(Box::new(decl)), self.close_span(start))
    }

    fn class_member_function(&mut self, start: Span, modifiers: Modifiers) -> AstNode {
        let keyword = self.advance().kind;
        let category = match keyword {
            TokenKind::Construct => FunctionCategory::Constructor,
            TokenKind::Factory => FunctionCategory::Factory,
            TokenKind::Get => FunctionCategory::Getter,
            TokenKind::Set => FunctionCategory::Setter,
            _ => unreachable!("caller checked the keyword"),
        };
        if self.class_name.is_none() {
            self.error_here(
                ErrorCode::CtorOutsideClass,
                "constructor forms are only allowed inside a class body",
            );
        }
        let decl = self.function_rest(category, modifiers, None);
        AstNode::new(AstKind::FunctionDecl(Box::new(decl)), self.close_span(start))
    }

    /// Parses everything after the introducing keyword of a function:
    /// name, generic parameters, parameter list, return type or
    /// redirecting constructor, and body.
    fn function_rest(
        &mut self,
        category: FunctionCategory,
        modifiers: Modifiers,
        forced_name: Option<String>,
    ) -> FunctionDecl {
        let name = forced_name.or_else(|| {
            if self.check(TokenKind::Identifier) {
                Some(self.advance().lexeme.clone())
            } else {
                None
            }
        });
        let internal_name = match (category, &name) {
            (FunctionCategory::Constructor, Some(key)) => format!("$construct.{key}"),
            (FunctionCategory::Constructor, None) => "$construct".to_owned(),
            (FunctionCategory::Getter, Some(n)) => format!("$get.{n}"),
            (FunctionCategory::Setter, Some(n)) => format!("$set.{n}"),
            (_, Some(n)) => n.clone(),
            (_, None) => self.next_anonymous(),
        };

        let generic_params = self.generic_params();

        // getters take no parameter list; `fun t { ... }` declares a
        // zero-parameter function
        let mut params = Vec::new();
        let mut is_variadic = false;
        if category != FunctionCategory::Getter && self.check(TokenKind::LeftParen) {
            (params, is_variadic) = self.param_list();
        }

        let (min_arity, max_arity) = Self::arities(&params);

        let mut return_type = None;
        let mut redirect = None;
        if self.matches(TokenKind::Colon) {
            if category == FunctionCategory::Constructor {
                redirect = self.redirecting_call();
            } else {
                return_type = Some(self.type_expr());
            }
        }

        let body = self.function_body(&modifiers);

        FunctionDecl {
            name,
            internal_name,
            category,
            modifiers,
            generic_params,
            params,
            min_arity,
            max_arity,
            is_variadic,
            return_type,
            redirect,
            body,
        }
    }

    fn function_body(&mut self, modifiers: &Modifiers) -> Option<Box<AstNode>> {
        if self.check(TokenKind::LeftBrace) {
            if modifiers.is_external {
                self.error_here(ErrorCode::ExternalMisuse, "external function cannot have a body");
            }
            self.function_depth += 1;
            let body = self.block_statement_with(SourceType::FunctionBody);
            self.function_depth -= 1;
            Some(Box::new(body))
        } else if self.matches(TokenKind::Arrow) {
            self.function_depth += 1;
            let expr = self.expression();
            self.function_depth -= 1;
            let span = expr.span;
            let ret = AstNode::new(
                AstKind::Return {
                    value: Some(Box::new(expr)),
                },
                span,
            );
            self.matches(TokenKind::Semicolon);
            Some(Box::new(AstNode::new(AstKind::Block(vec![ret]), span)))
        } else {
            // abstract methods and external declarations legitimately omit
            // the body; anything else gets flagged when invoked
            self.matches(TokenKind::Semicolon);
            None
        }
    }

    fn arities(params: &[Param]) -> (u8, u8) {
        let mut min = 0u8;
        let mut max = 0u8;
        for param in params {
            if param.is_named || param.is_variadic {
                continue;
            }
            max = max.saturating_add(1);
            if !param.is_optional {
                min = min.saturating_add(1);
            }
        }
        (min, max)
    }

    fn generic_params(&mut self) -> Vec<String> {
        let mut names = Vec::new();
        if self.check(TokenKind::Lesser) && self.peek_at(1) == TokenKind::Identifier {
            self.advance();
            loop {
                match self.expect_identifier("in generic parameter list") {
                    Some(name) => names.push(name),
                    None => break,
                }
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
            self.expect(TokenKind::Greater, "to close generic parameters");
        }
        names
    }

    /// Parses `( a, b = 1, [c = 2], {d = 3}, ...rest )`.
    ///
    /// Square brackets group optional positional parameters, braces group
    /// named parameters, and a spread-prefixed name is the terminal
    /// variadic parameter.
    fn param_list(&mut self) -> (Vec<Param>, bool) {
        self.expect(TokenKind::LeftParen, "to open parameter list");
        let mut params = Vec::new();
        let mut is_variadic = false;
        loop {
            self.skip_empty_lines();
            match self.peek_kind() {
                TokenKind::RightParen | TokenKind::EndOfFile => break,
                TokenKind::LeftBracket => {
                    self.advance();
                    loop {
                        self.skip_empty_lines();
                        if self.check(TokenKind::RightBracket) || self.check(TokenKind::EndOfFile) {
                            break;
                        }
                        if let Some(param) = self.single_param(true, false) {
                            params.push(param);
                        }
                        if !self.matches(TokenKind::Comma) {
                            break;
                        }
                    }
                    self.expect(TokenKind::RightBracket, "to close optional parameters");
                }
                TokenKind::LeftBrace => {
                    self.advance();
                    loop {
                        self.skip_empty_lines();
                        if self.check(TokenKind::RightBrace) || self.check(TokenKind::EndOfFile) {
                            break;
                        }
                        if let Some(param) = self.single_param(false, true) {
                            params.push(param);
                        }
                        if !self.matches(TokenKind::Comma) {
                            break;
                        }
                    }
                    self.expect(TokenKind::RightBrace, "to close named parameters");
                }
                TokenKind::Spread => {
                    self.advance();
                    if let Some(mut param) = self.single_param(false, false) {
                        param.is_variadic = true;
                        is_variadic = true;
                        params.push(param);
                    }
                }
                _ => {
                    if let Some(param) = self.single_param(false, false) {
                        params.push(param);
                    } else {
                        self.advance();
                    }
                }
            }
            if !self.matches(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RightParen, "to close parameter list");
        (params, is_variadic)
    }

    fn single_param(&mut self, optional: bool, named: bool) -> Option<Param> {
        let start = self.span_here();
        let name = self.expect_identifier("as parameter name")?;
        let declared_type = if self.matches(TokenKind::Colon) {
            Some(self.type_expr())
        } else {
            None
        };
        let initializer = if self.matches(TokenKind::Assign) {
            Some(self.expression())
        } else {
            None
        };
        Some(Param {
            name,
            declared_type,
            initializer,
            is_optional: optional,
            is_named: named,
            is_variadic: false,
            span: self.close_span(start),
        })
    }

    /// Parses `super(...)`, `super.key(...)`, `this(...)` or `this.key(...)`
    /// after the colon of a redirecting constructor.
    fn redirecting_call(&mut self) -> Option<RedirectingCall> {
        let target = match self.peek_kind() {
            TokenKind::Super => RedirectTarget::Super,
            TokenKind::This => RedirectTarget::This,
            _ => {
                self.error_here(
                    ErrorCode::UnexpectedToken,
                    "expected `super` or `this` in redirecting constructor",
                );
                return None;
            }
        };
        self.advance();
        let key = if self.matches(TokenKind::Dot) {
            self.expect_identifier("as constructor key")
        } else {
            None
        };
        let (positional, named) = self.call_arguments();
        Some(RedirectingCall {
            target,
            key,
            positional,
            named,
        })
    }

    fn class_decl(&mut self, start: Span, modifiers: Modifiers) -> AstNode {
        let is_abstract = self.matches(TokenKind::Abstract);
        self.expect(TokenKind::Class, "to begin class declaration");
        let name = self.expect_identifier("as class name").unwrap_or_default();
        let generic_params = self.generic_params();
        let super_type = if self.matches(TokenKind::Extends) {
            Some(self.type_expr())
        } else {
            None
        };
        let mut implements = Vec::new();
        if self.matches(TokenKind::Implements) {
            loop {
                implements.push(self.type_expr());
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        let mut mixes = Vec::new();
        if self.matches(TokenKind::With) {
            loop {
                mixes.push(self.type_expr());
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }

        let mut members = Vec::new();
        let mut has_user_constructor = false;
        if self.expect(TokenKind::LeftBrace, "to open class body") {
            let saved_type = self.source_type;
            let saved_class = self.class_name.replace(name.clone());
            self.source_type = SourceType::ClassBody;
            while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::EndOfFile) {
                if self.matches(TokenKind::EmptyLine) {
                    continue;
                }
                let before = self.pos;
                let member = self.statement();
                if let AstKind::FunctionDecl(decl) = &member.kind
                    && decl.category == FunctionCategory::Constructor
                {
                    has_user_constructor = true;
                }
                members.push(member);
                if self.pos == before {
                    self.advance();
                }
            }
            self.expect(TokenKind::RightBrace, "to close class body");
            self.source_type = saved_type;
            self.class_name = saved_class;
        }

        AstNode::new(
            AstKind::ClassDecl(Box::new(ClassDecl {
                name,
                super_type,
                generic_params,
                implements,
                mixes,
                modifiers,
                is_abstract,
                members,
                has_user_constructor,
            })),
            self.close_span(start),
        )
    }

    fn enum_decl(&mut self, start: Span, modifiers: Modifiers) -> AstNode {
        self.advance(); // enum
        let name = self.expect_identifier("as enum name").unwrap_or_default();
        let mut values = Vec::new();
        if self.expect(TokenKind::LeftBrace, "to open enum body") {
            loop {
                self.skip_empty_lines();
                if self.check(TokenKind::RightBrace) || self.check(TokenKind::EndOfFile) {
                    break;
                }
                match self.expect_identifier("as enumerator") {
                    Some(value) => values.push(value),
                    None => {
                        self.advance();
                        continue;
                    }
                }
                if !self.matches(TokenKind::Comma) {
                    self.skip_empty_lines();
                    break;
                }
            }
            self.expect(TokenKind::RightBrace, "to close enum body");
        }
        AstNode::new(
            AstKind::EnumDecl(EnumDecl {
                name,
                modifiers,
                values,
            }),
            self.close_span(start),
        )
    }

    fn struct_decl(&mut self, start: Span, modifiers: Modifiers) -> AstNode {
        self.advance(); // struct
        let name = self.expect_identifier("as struct name").unwrap_or_default();
        let prototype = if self.matches(TokenKind::Extends) {
            self.expect_identifier("as struct prototype")
        } else {
            None
        };
        let fields = if self.expect(TokenKind::LeftBrace, "to open struct body") {
            self.struct_fields()
        } else {
            Vec::new()
        };
        AstNode::new(
            AstKind::StructDecl(Box::new(StructDecl {
                name,
                prototype,
                fields,
                modifiers,
            })),
            self.close_span(start),
        )
    }

    /// Parses `key: value` pairs up to and including the closing brace.
    fn struct_fields(&mut self) -> Vec<(String, AstNode)> {
        let mut fields = Vec::new();
        loop {
            self.skip_empty_lines();
            if self.check(TokenKind::RightBrace) || self.check(TokenKind::EndOfFile) {
                break;
            }
            let key = match self.peek_kind() {
                TokenKind::Identifier => self.advance().lexeme.clone(),
                TokenKind::StringLiteral => {
                    let token = self.advance();
                    match &token.literal {
                        Some(TokenLiteral::Str(s)) => s.clone(),
                        _ => token.lexeme.clone(),
                    }
                }
                _ => {
                    self.error_here(ErrorCode::UnexpectedToken, "expected struct field key");
                    self.advance();
                    continue;
                }
            };
            self.expect(TokenKind::Colon, "after struct field key");
            let value = self.expression();
            fields.push((key, value));
            if !self.matches(TokenKind::Comma) {
                self.skip_empty_lines();
                break;
            }
        }
        self.expect(TokenKind::RightBrace, "to close struct fields");
        fields
    }

    fn type_alias_decl(&mut self, start: Span, modifiers: Modifiers) -> AstNode {
        self.advance(); // type
        let name = self.expect_identifier("as type alias name").unwrap_or_default();
        self.expect(TokenKind::Assign, "in type alias");
        let ty = self.type_expr();
        self.matches(TokenKind::Semicolon);
        AstNode::new(AstKind::TypeAliasDecl { name, ty, modifiers }, self.close_span(start))
    }

    fn import_decl(&mut self, start: Span) -> AstNode {
        self.advance(); // import
        let key = if self.check(TokenKind::StringLiteral) {
            let token = self.advance();
            match &token.literal {
                Some(TokenLiteral::Str(s)) => s.clone(),
                _ => token.lexeme.clone(),
            }
        } else {
            self.error_here(ErrorCode::UnexpectedToken, "expected import key string");
            String::new()
        };
        let alias = if self.matches(TokenKind::As) {
            self.expect_identifier("as import alias")
        } else {
            None
        };
        let mut show = Vec::new();
        if self.matches(TokenKind::Show) {
            loop {
                match self.expect_identifier("in show list") {
                    Some(name) => show.push(name),
                    None => break,
                }
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.matches(TokenKind::Semicolon);
        AstNode::new(
            AstKind::ImportDecl(ImportDecl {
                key,
                resolved_key: None,
                alias,
                show,
            }),
            self.close_span(start),
        )
    }

    fn library_decl(&mut self, start: Span) -> AstNode {
        self.advance(); // library
        let name = match self.peek_kind() {
            TokenKind::StringLiteral => {
                let token = self.advance();
                match &token.literal {
                    Some(TokenLiteral::Str(s)) => s.clone(),
                    _ => token.lexeme.clone(),
                }
            }
            TokenKind::Identifier => self.advance().lexeme.clone(),
            _ => {
                self.error_here(ErrorCode::UnexpectedToken, "expected library name");
                String::new()
            }
        };
        self.matches(TokenKind::Semicolon);
        AstNode::new(AstKind::LibraryDecl { name }, self.close_span(start))
    }

    fn block_statement(&mut self) -> AstNode {
        self.block_statement_with(self.block_source_type())
    }

    fn block_source_type(&self) -> SourceType {
        match self.source_type {
            SourceType::Module => SourceType::Script,
            other => other,
        }
    }

    fn block_statement_with(&mut self, source_type: SourceType) -> AstNode {
        let start = self.span_here();
        self.expect(TokenKind::LeftBrace, "to open block");
        let saved = self.source_type;
        self.source_type = source_type;
        let mut nodes = Vec::new();
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::EndOfFile) {
            if self.matches(TokenKind::EmptyLine) {
                continue;
            }
            let before = self.pos;
            nodes.push(self.statement());
            if self.pos == before {
                self.advance();
            }
        }
        self.expect(TokenKind::RightBrace, "to close block");
        self.source_type = saved;
        AstNode::new(AstKind::Block(nodes), self.close_span(start))
    }

    /// Parses the branch of a control statement: a block, or a single
    /// statement wrapped into one.
    fn branch(&mut self) -> AstNode {
        self.skip_empty_lines();
        if self.check(TokenKind::LeftBrace) {
            self.block_statement()
        } else {
            let node = self.statement();
            let span = node.span;
            AstNode::new(AstKind::Block(vec![node]), span)
        }
    }

    fn if_statement(&mut self) -> AstNode {
        let start = self.span_here();
        self.advance(); // if
        self.expect(TokenKind::LeftParen, "after `if`");
        let condition = Box::new(self.expression());
        self.expect(TokenKind::RightParen, "to close `if` condition");
        let then_branch = Box::new(self.branch());
        let else_branch = if self.matches(TokenKind::Else) {
            if self.check(TokenKind::If) {
                Some(Box::new(self.if_statement()))
            } else {
                Some(Box::new(self.branch()))
            }
        } else {
            None
        };
        AstNode::new(
            AstKind::If {
                condition,
                then_branch,
                else_branch,
            },
            self.close_span(start),
        )
    }

    fn while_statement(&mut self) -> AstNode {
        let start = self.span_here();
        self.advance(); // while
        self.expect(TokenKind::LeftParen, "after `while`");
        let condition = Box::new(self.expression());
        self.expect(TokenKind::RightParen, "to close `while` condition");
        self.loop_depth += 1;
        let body = Box::new(self.branch());
        self.loop_depth -= 1;
        AstNode::new(AstKind::While { condition, body }, self.close_span(start))
    }

    fn do_while_statement(&mut self) -> AstNode {
        let start = self.span_here();
        self.advance(); // do
        self.loop_depth += 1;
        let body = Box::new(self.branch());
        self.loop_depth -= 1;
        self.expect(TokenKind::While, "after `do` body");
        self.expect(TokenKind::LeftParen, "after `while`");
        let condition = Box::new(self.expression());
        self.expect(TokenKind::RightParen, "to close `do-while` condition");
        self.matches(TokenKind::Semicolon);
        AstNode::new(AstKind::DoWhile { body, condition }, self.close_span(start))
    }

    fn for_statement(&mut self) -> AstNode {
        let start = self.span_here();
        self.advance(); // for
        self.expect(TokenKind::LeftParen, "after `for`");

        // `for (var x in expr)` against `for (init; cond; inc)`
        let is_for_in = matches!(self.peek_kind(), TokenKind::Var | TokenKind::Final)
            && self.peek_at(1) == TokenKind::Identifier
            && self.peek_at(2) == TokenKind::In;
        if is_for_in {
            self.advance();
            let decl_name = self.advance().lexeme.clone();
            self.advance(); // in
            let iterable = Box::new(self.expression());
            self.expect(TokenKind::RightParen, "to close `for-in` header");
            self.loop_depth += 1;
            let body = Box::new(self.branch());
            self.loop_depth -= 1;
            return AstNode::new(
                AstKind::ForIn {
                    decl_name,
                    iterable,
                    body,
                },
                self.close_span(start),
            );
        }

        let init = if self.check(TokenKind::Semicolon) {
            self.advance();
            None
        } else {
            let node = self.statement();
            Some(Box::new(node))
        };
        let condition = if self.check(TokenKind::Semicolon) {
            None
        } else {
            Some(Box::new(self.expression()))
        };
        self.expect(TokenKind::Semicolon, "after `for` condition");
        let increment = if self.check(TokenKind::RightParen) {
            None
        } else {
            Some(Box::new(self.expression()))
        };
        self.expect(TokenKind::RightParen, "to close `for` header");
        self.loop_depth += 1;
        let body = Box::new(self.branch());
        self.loop_depth -= 1;
        AstNode::new(
            AstKind::For {
                init,
                condition,
                increment,
                body,
            },
            self.close_span(start),
        )
    }

    fn when_statement(&mut self) -> AstNode {
        let start = self.span_here();
        self.advance(); // when
        let subject = if self.matches(TokenKind::LeftParen) {
            let node = self.expression();
            self.expect(TokenKind::RightParen, "to close `when` subject");
            Some(Box::new(node))
        } else {
            None
        };
        let mut cases = Vec::new();
        let mut else_branch = None;
        if self.expect(TokenKind::LeftBrace, "to open `when` body") {
            loop {
                self.skip_empty_lines();
                if self.check(TokenKind::RightBrace) || self.check(TokenKind::EndOfFile) {
                    break;
                }
                if self.matches(TokenKind::Else) {
                    self.expect(TokenKind::Arrow, "after `else` case");
                    else_branch = Some(Box::new(self.branch()));
                } else {
                    let case = self.expression();
                    self.expect(TokenKind::Arrow, "after case expression");
                    let body = self.branch();
                    cases.push((case, body));
                }
                self.matches(TokenKind::Comma);
            }
            self.expect(TokenKind::RightBrace, "to close `when` body");
        }
        AstNode::new(
            AstKind::When {
                subject,
                cases,
                else_branch,
            },
            self.close_span(start),
        )
    }

    fn return_statement(&mut self) -> AstNode {
        let start = self.span_here();
        let return_line = self.current().line;
        self.advance(); // return
        if self.function_depth == 0 && self.source_type != SourceType::FunctionBody {
            self.error_here(ErrorCode::ReturnOutsideFunction, "`return` outside of a function body");
        }
        let value = if self.current().line == return_line && Self::starts_expression(self.peek_kind()) {
            Some(Box::new(self.expression()))
        } else {
            None
        };
        self.matches(TokenKind::Semicolon);
        AstNode::new(AstKind::Return { value }, self.close_span(start))
    }

    fn starts_expression(kind: TokenKind) -> bool {
        matches!(
            kind,
            TokenKind::Null
                | TokenKind::True
                | TokenKind::False
                | TokenKind::IntLiteral
                | TokenKind::FloatLiteral
                | TokenKind::StringLiteral
                | TokenKind::InterpolatedString
                | TokenKind::Identifier
                | TokenKind::This
                | TokenKind::Super
                | TokenKind::If
                | TokenKind::Fun
                | TokenKind::TypeOf
                | TokenKind::LeftParen
                | TokenKind::LeftBracket
                | TokenKind::LeftBrace
                | TokenKind::Minus
                | TokenKind::LogicalNot
                | TokenKind::Increment
                | TokenKind::Decrement
        )
    }

    // --- expressions ------------------------------------------------------

    fn expression(&mut self) -> AstNode {
        if self.nesting >= MAX_NESTING_DEPTH {
            self.error_here(ErrorCode::UnexpectedToken, "expression nesting too deep");
            let span = self.span_here();
            self.advance();
            return AstNode::empty(span);
        }
        self.nesting += 1;
        let node = self.assignment();
        self.nesting -= 1;
        node
    }

    /// Assignment, right-associative. Compound forms lower into a plain
    /// assignment whose right-hand side is a binary expression over the
    /// original left value.
    fn assignment(&mut self) -> AstNode {
        let left = self.ternary();
        let left_legal = self.left_value_legal;
        let op = match self.peek_kind() {
            TokenKind::Assign => None,
            TokenKind::PlusAssign => Some(BinaryOp::Add),
            TokenKind::MinusAssign => Some(BinaryOp::Subtract),
            TokenKind::StarAssign => Some(BinaryOp::Multiply),
            TokenKind::SlashAssign => Some(BinaryOp::Divide),
            _ => return left,
        };
        if !left_legal || !left.kind.is_legal_left_value() {
            self.error_here(ErrorCode::InvalidLeftValue, "illegal assignment target");
        }
        self.advance();
        let rhs = self.assignment();
        let span = left.span.to(rhs.span);
        let value = match op {
            Some(op) => {
                let rhs_span = rhs.span;
                AstNode::new(
                    AstKind::Binary {
                        op,
                        left: Box::new(left.clone()),
                        right: Box::new(rhs),
                    },
                    rhs_span,
                )
            }
            None => rhs,
        };
        self.left_value_legal = false;
        AstNode::new(
            AstKind::Assign {
                target: Box::new(left),
                value: Box::new(value),
            },
            span,
        )
    }

    fn ternary(&mut self) -> AstNode {
        let condition = self.logical_or();
        if !self.matches(TokenKind::Question) {
            return condition;
        }
        let then_value = self.ternary();
        self.expect(TokenKind::Colon, "in ternary expression");
        let else_value = self.ternary();
        self.left_value_legal = false;
        let span = condition.span.to(else_value.span);
        AstNode::new(
            AstKind::Ternary {
                condition: Box::new(condition),
                then_value: Box::new(then_value),
                else_value: Box::new(else_value),
            },
            span,
        )
    }

    fn logical_or(&mut self) -> AstNode {
        let mut left = self.logical_and();
        while self.matches(TokenKind::LogicalOr) {
            let right = self.logical_and();
            let span = left.span.to(right.span);
            left = AstNode::new(
                AstKind::Binary {
                    op: BinaryOp::LogicalOr,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            );
            self.left_value_legal = false;
        }
        left
    }

    fn logical_and(&mut self) -> AstNode {
        let mut left = self.equality();
        while self.matches(TokenKind::LogicalAnd) {
            let right = self.equality();
            let span = left.span.to(right.span);
            left = AstNode::new(
                AstKind::Binary {
                    op: BinaryOp::LogicalAnd,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            );
            self.left_value_legal = false;
        }
        left
    }

    /// Equality is non-associative: at most one `==`/`!=` application.
    fn equality(&mut self) -> AstNode {
        let left = self.relational();
        let op = match self.peek_kind() {
            TokenKind::Equal => BinaryOp::Equal,
            TokenKind::NotEqual => BinaryOp::NotEqual,
            _ => return left,
        };
        self.advance();
        let right = self.relational();
        self.left_value_legal = false;
        let span = left.span.to(right.span);
        AstNode::new(
            AstKind::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
            span,
        )
    }

    /// Relational comparisons plus the type operators `as`, `is`, `is!`.
    /// Non-associative.
    fn relational(&mut self) -> AstNode {
        let left = self.additive();
        match self.peek_kind() {
            TokenKind::Lesser
            | TokenKind::Greater
            | TokenKind::LesserOrEqual
            | TokenKind::GreaterOrEqual => {
                let op = match self.advance().kind {
                    TokenKind::Lesser => BinaryOp::Lesser,
                    TokenKind::Greater => BinaryOp::Greater,
                    TokenKind::LesserOrEqual => BinaryOp::LesserOrEqual,
                    _ => BinaryOp::GreaterOrEqual,
                };
                let right = self.additive();
                self.left_value_legal = false;
                let span = left.span.to(right.span);
                AstNode::new(
                    AstKind::Binary {
                        op,
                        left: Box::new(left),
                        right: Box::new(right),
                    },
                    span,
                )
            }
            TokenKind::As => {
                self.advance();
                let ty = self.type_expr();
                self.left_value_legal = false;
                let span = self.close_span(left.span);
                AstNode::new(
                    AstKind::TypeCast {
                        operand: Box::new(left),
                        ty,
                    },
                    span,
                )
            }
            TokenKind::Is => {
                self.advance();
                // `is!` is sugar for a negated check
                let negated = self.matches(TokenKind::LogicalNot);
                let ty = self.type_expr();
                self.left_value_legal = false;
                let span = self.close_span(left.span);
                AstNode::new(
                    AstKind::TypeCheck {
                        operand: Box::new(left),
                        ty,
                        negated,
                    },
                    span,
                )
            }
            _ => left,
        }
    }

    fn additive(&mut self) -> AstNode {
        let mut left = self.multiplicative();
        loop {
            let op = match self.peek_kind() {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Subtract,
                _ => return left,
            };
            self.advance();
            let right = self.multiplicative();
            self.left_value_legal = false;
            let span = left.span.to(right.span);
            left = AstNode::new(
                AstKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            );
        }
    }

    fn multiplicative(&mut self) -> AstNode {
        let mut left = self.unary();
        loop {
            let op = match self.peek_kind() {
                TokenKind::Star => BinaryOp::Multiply,
                TokenKind::Slash => BinaryOp::Divide,
                TokenKind::Percent => BinaryOp::Modulo,
                _ => return left,
            };
            self.advance();
            let right = self.unary();
            self.left_value_legal = false;
            let span = left.span.to(right.span);
            left = AstNode::new(
                AstKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            );
        }
    }

    fn unary(&mut self) -> AstNode {
        let start = self.span_here();
        match self.peek_kind() {
            TokenKind::Minus => {
                self.advance();
                let operand = self.unary();
                self.left_value_legal = false;
                let span = start.to(operand.span);
                AstNode::new(
                    AstKind::Unary {
                        op: UnaryOp::Negate,
                        operand: Box::new(operand),
                    },
                    span,
                )
            }
            TokenKind::LogicalNot => {
                self.advance();
                let operand = self.unary();
                self.left_value_legal = false;
                let span = start.to(operand.span);
                AstNode::new(
                    AstKind::Unary {
                        op: UnaryOp::Not,
                        operand: Box::new(operand),
                    },
                    span,
                )
            }
            TokenKind::Increment | TokenKind::Decrement => {
                let op = if self.advance().kind == TokenKind::Increment {
                    BinaryOp::Add
                } else {
                    BinaryOp::Subtract
                };
                let operand = self.unary();
                self.increment_node(operand, op, start)
            }
            TokenKind::TypeOf => {
                self.advance();
                let operand = self.unary();
                self.left_value_legal = false;
                let span = start.to(operand.span);
                AstNode::new(
                    AstKind::TypeOf {
                        operand: Box::new(operand),
                    },
                    span,
                )
            }
            _ => self.postfix(),
        }
    }

    /// Lowers `++x` / `x++` into `x = x + 1` (same pattern for `--`).
    fn increment_node(&mut self, operand: AstNode, op: BinaryOp, start: Span) -> AstNode {
        if !operand.kind.is_legal_left_value() {
            self.error_here(ErrorCode::InvalidLeftValue, "increment target is not assignable");
        }
        self.left_value_legal = false;
        let span = start.to(operand.span);
        let one = AstNode::new(AstKind::IntLiteral(1), operand.span);
        let value = AstNode::new(
            AstKind::Binary {
                op,
                left: Box::new(operand.clone()),
                right: Box::new(one),
            },
            span,
        );
        AstNode::new(
            AstKind::Assign {
                target: Box::new(operand),
                value: Box::new(value),
            },
            span,
        )
    }

    fn postfix(&mut self) -> AstNode {
        let mut node = self.primary();
        loop {
            match self.peek_kind() {
                TokenKind::Dot => {
                    self.advance();
                    let name = self.expect_identifier("after `.`").unwrap_or_default();
                    let span = self.close_span(node.span);
                    node = AstNode::new(
                        AstKind::Member {
                            object: Box::new(node),
                            name,
                        },
                        span,
                    );
                    self.left_value_legal = true;
                }
                TokenKind::LeftBracket => {
                    self.advance();
                    let key = self.expression();
                    self.expect(TokenKind::RightBracket, "to close subscript");
                    let span = self.close_span(node.span);
                    node = AstNode::new(
                        AstKind::Subscript {
                            object: Box::new(node),
                            key: Box::new(key),
                        },
                        span,
                    );
                    self.left_value_legal = true;
                }
                TokenKind::LeftParen => {
                    let (positional, named) = self.call_arguments();
                    let span = self.close_span(node.span);
                    node = AstNode::new(
                        AstKind::Call {
                            callee: Box::new(node),
                            positional,
                            named,
                        },
                        span,
                    );
                    self.left_value_legal = false;
                }
                TokenKind::Increment => {
                    let start = self.span_here();
                    self.advance();
                    node = self.increment_node(node, BinaryOp::Add, start);
                }
                TokenKind::Decrement => {
                    let start = self.span_here();
                    self.advance();
                    node = self.increment_node(node, BinaryOp::Subtract, start);
                }
                _ => return node,
            }
        }
    }

    /// Parses `( positional..., name: value... )`.
    fn call_arguments(&mut self) -> (Vec<AstNode>, Vec<(String, AstNode)>) {
        let mut positional = Vec::new();
        let mut named = Vec::new();
        self.expect(TokenKind::LeftParen, "to open argument list");
        loop {
            self.skip_empty_lines();
            if self.check(TokenKind::RightParen) || self.check(TokenKind::EndOfFile) {
                break;
            }
            if self.check(TokenKind::Identifier) && self.peek_at(1) == TokenKind::Colon {
                let name = self.advance().lexeme.clone();
                self.advance(); // colon
                named.push((name, self.expression()));
            } else {
                positional.push(self.expression());
            }
            if !self.matches(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RightParen, "to close argument list");
        (positional, named)
    }

    fn primary(&mut self) -> AstNode {
        let start = self.span_here();
        self.left_value_legal = false;
        match self.peek_kind() {
            TokenKind::Null => {
                self.advance();
                AstNode::new(AstKind::NullLiteral, start)
            }
            TokenKind::True | TokenKind::False => {
                let value = self.advance().bool_value();
                AstNode::new(AstKind::BoolLiteral(value), start)
            }
            TokenKind::IntLiteral => {
                let value = match &self.advance().literal {
                    Some(TokenLiteral::Int(v)) => *v,
                    _ => 0,
                };
                AstNode::new(AstKind::IntLiteral(value), start)
            }
            TokenKind::FloatLiteral => {
                let value = match &self.advance().literal {
                    Some(TokenLiteral::Float(v)) => *v,
                    _ => 0.0,
                };
                AstNode::new(AstKind::FloatLiteral(value), start)
            }
            TokenKind::StringLiteral => {
                let value = match &self.advance().literal {
                    Some(TokenLiteral::Str(s)) => s.clone(),
                    _ => String::new(),
                };
                AstNode::new(AstKind::StringLiteral(value), start)
            }
            TokenKind::InterpolatedString => self.interpolated_string(),
            TokenKind::This => {
                self.advance();
                if self.function_depth == 0 {
                    self.error_here(ErrorCode::MisplacedThisSuper, "`this` outside of a function body");
                }
                AstNode::new(AstKind::This, start)
            }
            TokenKind::Super => {
                self.advance();
                if self.class_name.is_none() && self.function_depth == 0 {
                    self.error_here(ErrorCode::MisplacedThisSuper, "`super` outside of a class method");
                }
                AstNode::new(AstKind::Super, start)
            }
            TokenKind::LeftParen => self.group_or_arrow_function(),
            TokenKind::LeftBracket => {
                self.advance();
                let mut items = Vec::new();
                loop {
                    self.skip_empty_lines();
                    if self.check(TokenKind::RightBracket) || self.check(TokenKind::EndOfFile) {
                        break;
                    }
                    items.push(self.expression());
                    if !self.matches(TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(TokenKind::RightBracket, "to close list literal");
                self.left_value_legal = false;
                AstNode::new(AstKind::ListLiteral(items), self.close_span(start))
            }
            TokenKind::LeftBrace => {
                self.advance();
                let fields = self.struct_fields();
                AstNode::new(
                    AstKind::StructLiteral {
                        id: None,
                        prototype: None,
                        fields,
                    },
                    self.close_span(start),
                )
            }
            TokenKind::Fun => {
                self.advance();
                let decl = self.function_rest(FunctionCategory::Literal, Modifiers::default(), None);
                AstNode::new(AstKind::FunctionLiteral(Box::new(decl)), self.close_span(start))
            }
            TokenKind::If => self.if_statement(),
            TokenKind::Identifier => {
                let name = self.advance().lexeme.clone();
                self.left_value_legal = true;
                AstNode::new(AstKind::Identifier(name), start)
            }
            _ => {
                let found = self.current().lexeme.clone();
                self.error_here(
                    ErrorCode::UnexpectedToken,
                    format!("expected an expression, found `{found}`"),
                );
                self.advance();
                AstNode::empty(start)
            }
        }
    }

    /// Re-enters the parser over each interpolation segment's token list
    /// in expression mode. A segment must yield exactly one expression.
    fn interpolated_string(&mut self) -> AstNode {
        let token = self.advance().clone();
        let span = Span::new(token.line, token.column, token.offset, token.length);
        let Some(TokenLiteral::Interpolation { text, segments }) = token.literal else {
            return AstNode::empty(span);
        };
        let mut parsed = Vec::with_capacity(segments.len());
        for segment in &segments {
            let (nodes, errors) = parse(segment, SourceType::Expression);
            let valid = errors.is_empty() && nodes.len() == 1;
            if valid {
                parsed.push(nodes.into_iter().next().expect("length checked"));
            } else {
                let at = segment.first().map_or(span, |t| Span::new(t.line, t.column, t.offset, t.length));
                self.errors.push(QuillError::new(
                    ErrorCode::StringInterpolation,
                    "interpolation segment must be a single expression",
                    at.line,
                    at.column,
                    at.offset,
                    at.length,
                ));
                parsed.push(AstNode::empty(at));
            }
        }
        AstNode::new(
            AstKind::InterpolatedString {
                text,
                segments: parsed,
            },
            span,
        )
    }

    /// Disambiguates `( expr )` from `( params ) => expr`.
    fn group_or_arrow_function(&mut self) -> AstNode {
        if self.is_arrow_function() {
            let start = self.span_here();
            let (params, is_variadic) = self.param_list();
            let (min_arity, max_arity) = Self::arities(&params);
            self.expect(TokenKind::Arrow, "after arrow-function parameters");
            self.function_depth += 1;
            let body = if self.check(TokenKind::LeftBrace) {
                self.block_statement_with(SourceType::FunctionBody)
            } else {
                let expr = self.expression();
                let span = expr.span;
                let ret = AstNode::new(
                    AstKind::Return {
                        value: Some(Box::new(expr)),
                    },
                    span,
                );
                AstNode::new(AstKind::Block(vec![ret]), span)
            };
            self.function_depth -= 1;
            let internal_name = self.next_anonymous();
            let decl = FunctionDecl {
                name: None,
                internal_name,
                category: FunctionCategory::Literal,
                modifiers: Modifiers::default(),
                generic_params: Vec::new(),
                params,
                min_arity,
                max_arity,
                is_variadic,
                return_type: None,
                redirect: None,
                body: Some(Box::new(body)),
            };
            return AstNode::new(AstKind::FunctionLiteral(Box::new(decl)), self.close_span(start));
        }
        let start = self.span_here();
        self.advance(); // (
        let inner = self.expression();
        self.expect(TokenKind::RightParen, "to close group");
        self.left_value_legal = false;
        AstNode::new(AstKind::Group(Box::new(inner)), self.close_span(start))
    }

    /// Looks ahead from a `(` for the matching `)` followed by `=>`.
    fn is_arrow_function(&self) -> bool {
        let mut depth = 0usize;
        let mut offset = 0usize;
        loop {
            match self.peek_at(offset) {
                TokenKind::LeftParen => depth += 1,
                TokenKind::RightParen => {
                    depth -= 1;
                    if depth == 0 {
                        return self.peek_at(offset + 1) == TokenKind::Arrow;
                    }
                }
                TokenKind::EndOfFile => return false,
                _ => {}
            }
            offset += 1;
        }
    }

    // --- type expressions -------------------------------------------------

    fn type_expr(&mut self) -> TypeExpr {
        if self.matches(TokenKind::Fun) {
            let mut params = Vec::new();
            if self.matches(TokenKind::LeftParen) {
                loop {
                    if self.check(TokenKind::RightParen) || self.check(TokenKind::EndOfFile) {
                        break;
                    }
                    params.push(self.type_expr());
                    if !self.matches(TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(TokenKind::RightParen, "to close function type parameters");
            }
            let return_type = if self.matches(TokenKind::Arrow) {
                self.type_expr()
            } else {
                TypeExpr::nominal("any")
            };
            let nullable = self.matches(TokenKind::Question);
            return TypeExpr::Function {
                params,
                return_type: Box::new(return_type),
                nullable,
            };
        }
        let name = self.expect_identifier("as type name").unwrap_or_else(|| "any".to_owned());
        let mut args = Vec::new();
        if self.check(TokenKind::Lesser)
            && matches!(self.peek_at(1), TokenKind::Identifier | TokenKind::Fun)
        {
            self.advance();
            loop {
                args.push(self.type_expr());
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
            self.expect(TokenKind::Greater, "to close type arguments");
        }
        let nullable = self.matches(TokenKind::Question);
        TypeExpr::Nominal { name, args, nullable }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::lexer::lex;

    fn parse_script(source: &str) -> (Vec<AstNode>, Vec<QuillError>) {
        let (tokens, lex_errors) = lex(source);
        assert!(lex_errors.is_empty(), "lex errors: {lex_errors:?}");
        parse(&tokens, SourceType::Script)
    }

    fn parse_ok(source: &str) -> Vec<AstNode> {
        let (nodes, errors) = parse_script(source);
        assert!(errors.is_empty(), "parse errors: {errors:?}");
        nodes
    }

    #[test]
    fn parses_var_decl_with_type() {
        let nodes = parse_ok("var x: num = 1 + 2");
        let AstKind::VarDecl(decl) = &nodes[0].kind else {
            panic!("expected var decl, got {:?}", nodes[0].kind);
        };
        assert_eq!(decl.name, "x");
        assert!(decl.modifiers.is_mutable);
        assert_eq!(decl.declared_type.as_ref().map(TypeExpr::name), Some("num"));
        assert!(matches!(
            decl.initializer.as_deref().map(|n| &n.kind),
            Some(AstKind::Binary { op: BinaryOp::Add, .. })
        ));
    }

    #[test]
    fn precedence_multiplication_binds_tighter() {
        let nodes = parse_ok("1 + 2 * 3");
        let AstKind::Binary { op, right, .. } = &nodes[0].kind else {
            panic!("expected binary");
        };
        assert_eq!(*op, BinaryOp::Add);
        assert!(matches!(
            &right.kind,
            AstKind::Binary {
                op: BinaryOp::Multiply,
                ..
            }
        ));
    }

    #[test]
    fn compound_assignment_lowers_to_binary() {
        let nodes = parse_ok("x += 2");
        let AstKind::Assign { target, value } = &nodes[0].kind else {
            panic!("expected assign");
        };
        assert!(matches!(&target.kind, AstKind::Identifier(n) if n == "x"));
        assert!(matches!(&value.kind, AstKind::Binary { op: BinaryOp::Add, .. }));
    }

    #[test]
    fn postfix_increment_lowers_to_assignment() {
        let nodes = parse_ok("i++");
        let AstKind::Assign { value, .. } = &nodes[0].kind else {
            panic!("expected assign");
        };
        let AstKind::Binary { op, right, .. } = &value.kind else {
            panic!("expected binary rhs");
        };
        assert_eq!(*op, BinaryOp::Add);
        assert!(matches!(right.kind, AstKind::IntLiteral(1)));
    }

    #[test]
    fn invalid_left_value_is_reported_but_parsing_continues() {
        let (nodes, errors) = parse_script("1 = 2\nvar ok = 3");
        assert!(errors.iter().any(|e| e.code == ErrorCode::InvalidLeftValue));
        assert!(nodes.iter().any(|n| matches!(n.kind, AstKind::VarDecl(_))));
    }

    #[test]
    fn function_with_optional_and_named_params() {
        let nodes = parse_ok("fun f(a, [b = 2], {c = 3}) => a + b + c");
        let AstKind::FunctionDecl(decl) = &nodes[0].kind else {
            panic!("expected function decl");
        };
        assert_eq!(decl.params.len(), 3);
        assert_eq!((decl.min_arity, decl.max_arity), (1, 2));
        assert!(decl.params[1].is_optional);
        assert!(decl.params[2].is_named);
        assert!(decl.body.is_some());
    }

    #[test]
    fn variadic_parameter_is_terminal() {
        let nodes = parse_ok("fun f(a, ...rest) {}");
        let AstKind::FunctionDecl(decl) = &nodes[0].kind else {
            panic!("expected function decl");
        };
        assert!(decl.is_variadic);
        assert!(decl.params[1].is_variadic);
        assert_eq!((decl.min_arity, decl.max_arity), (1, 1));
    }

    #[test]
    fn class_with_redirecting_constructor() {
        let nodes = parse_ok("class B extends A { construct(y) : super(y * 2) { this.y = y } }");
        let AstKind::ClassDecl(decl) = &nodes[0].kind else {
            panic!("expected class decl");
        };
        assert_eq!(decl.name, "B");
        assert!(decl.has_user_constructor);
        let AstKind::FunctionDecl(ctor) = &decl.members[0].kind else {
            panic!("expected ctor member");
        };
        assert_eq!(ctor.category, FunctionCategory::Constructor);
        let redirect = ctor.redirect.as_ref().expect("redirect");
        assert_eq!(redirect.target, RedirectTarget::Super);
        assert_eq!(redirect.positional.len(), 1);
    }

    #[test]
    fn enum_members_parse_in_order() {
        let nodes = parse_ok("enum E { a, b, c }");
        let AstKind::EnumDecl(decl) = &nodes[0].kind else {
            panic!("expected enum decl");
        };
        assert_eq!(decl.values, vec!["a", "b", "c"]);
    }

    #[test]
    fn struct_literal_and_member_write() {
        let nodes = parse_ok("var f = { value: 42, greeting: 'hi!' }\nf.value = 'ha!'");
        let AstKind::VarDecl(decl) = &nodes[0].kind else {
            panic!("expected var decl");
        };
        let Some(init) = decl.initializer.as_deref() else {
            panic!("expected initializer");
        };
        let AstKind::StructLiteral { fields, .. } = &init.kind else {
            panic!("expected struct literal");
        };
        assert_eq!(fields[0].0, "value");
        assert!(matches!(&nodes[1].kind, AstKind::Assign { .. }));
    }

    #[test]
    fn for_in_parses() {
        let nodes = parse_ok("for (var x in [1, 2]) { x }");
        assert!(matches!(&nodes[0].kind, AstKind::ForIn { decl_name, .. } if decl_name == "x"));
    }

    #[test]
    fn when_with_subject_and_else() {
        let nodes = parse_ok("when (x) { 1 => { a() } 2 => b() else => { c() } }");
        let AstKind::When {
            subject,
            cases,
            else_branch,
        } = &nodes[0].kind
        else {
            panic!("expected when");
        };
        assert!(subject.is_some());
        assert_eq!(cases.len(), 2);
        assert!(else_branch.is_some());
    }

    #[test]
    fn interpolation_segment_must_be_single_expression() {
        let (tokens, _) = lex("'${var x = 1}'");
        let (_, errors) = parse(&tokens, SourceType::Script);
        assert!(errors.iter().any(|e| e.code == ErrorCode::StringInterpolation));
    }

    #[test]
    fn module_source_rejects_loose_statements() {
        let (tokens, _) = lex("1 + 2");
        let (_, errors) = parse(&tokens, SourceType::Module);
        assert!(errors.iter().any(|e| e.code == ErrorCode::UnsupportedSourceType));
    }

    #[test]
    fn arrow_function_in_expression_position() {
        let nodes = parse_ok("var f = (a, b) => a + b");
        let AstKind::VarDecl(decl) = &nodes[0].kind else {
            panic!("expected var decl");
        };
        assert!(matches!(
            decl.initializer.as_deref().map(|n| &n.kind),
            Some(AstKind::FunctionLiteral(_))
        ));
    }

    #[test]
    fn is_and_as_operators() {
        let nodes = parse_ok("x is! num\ny as str");
        assert!(matches!(&nodes[0].kind, AstKind::TypeCheck { negated: true, .. }));
        assert!(matches!(&nodes[1].kind, AstKind::TypeCast { .. }));
    }

    #[test]
    fn import_with_alias_and_show() {
        let nodes = parse_ok("import 'util.ql' as util show helper, twice");
        let AstKind::ImportDecl(decl) = &nodes[0].kind else {
            panic!("expected import");
        };
        assert_eq!(decl.key, "util.ql");
        assert_eq!(decl.alias.as_deref(), Some("util"));
        assert_eq!(decl.show, vec!["helper", "twice"]);
    }
}
