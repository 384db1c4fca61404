//! AST to bytecode lowering.
//!
//! One compilation walks every module of a bundle and produces a single
//! framed image: signature, version, constant table, then one block per
//! module in dependency order.
//!
//! # Evaluation protocol
//!
//! Expressions evaluate into the implicit value register. Binary
//! operations follow the register-index convention: evaluate the left
//! operand, copy it into the per-precedence register slot, evaluate the
//! right operand, then emit the operator opcode, which combines the slot
//! with the value register. Nested sub-programs (call arguments, group
//! expressions, short-circuit right operands, stored initializers) are
//! emitted as `endOfExec`-terminated streams the VM executes in a fresh
//! register window.
//!
//! # Lowerings
//!
//! Parse-time sugar (compound assignment, `++`/`--`) arrives already
//! lowered. This pass lowers `for-in` into an index loop over a snapshot
//! variable, C-style `for` into an explicit block with an internal marker
//! name for the loop variable, `enum` into a class with a private
//! constructor and late-initialized statics, and `when` into an
//! anchor-relative jump table.

use ahash::AHashMap;

use crate::{
    ast::{
        AstKind, AstNode, BinaryOp, ClassDecl, EnumDecl, FunctionCategory, FunctionDecl, ImportDecl, Modifiers, Param,
        RedirectTarget, Span, StructDecl, TypeExpr, UnaryOp, VarDecl,
    },
    bytes::BytecodeBuilder,
    consttable::ConstTable,
    error::{ErrorCode, QuillError, QuillResult},
    module::CompilationBundle,
    opcode::{LocalType, Opcode, Register, SIGNATURE, VERSION},
};

/// Variable-initializer encoding selector inside `varDecl`.
pub const INIT_NONE: u8 = 0;
pub const INIT_INLINE: u8 = 1;
pub const INIT_STORED: u8 = 2;

/// `varDecl` modifier flag bits.
pub mod var_flags {
    pub const EXTERNAL: u8 = 1;
    pub const STATIC: u8 = 1 << 1;
    pub const CONST: u8 = 1 << 2;
    pub const MUTABLE: u8 = 1 << 3;
    pub const EXPORTED: u8 = 1 << 4;
    pub const TOP_LEVEL: u8 = 1 << 5;
    pub const LATE: u8 = 1 << 6;
}

/// `funcDecl` flag bits.
pub mod func_flags {
    pub const EXTERNAL: u8 = 1;
    pub const STATIC: u8 = 1 << 1;
    pub const VARIADIC: u8 = 1 << 2;
    pub const REDIRECT: u8 = 1 << 3;
    pub const EXPORTED: u8 = 1 << 4;
}

/// Parameter flag bits inside `funcDecl`.
pub mod param_flags {
    pub const OPTIONAL: u8 = 1;
    pub const NAMED: u8 = 1 << 1;
    pub const VARIADIC: u8 = 1 << 2;
    pub const HAS_TYPE: u8 = 1 << 3;
    pub const HAS_INIT: u8 = 1 << 4;
}

/// `classDecl` flag bits.
pub mod class_flags {
    pub const EXTERNAL: u8 = 1;
    pub const ABSTRACT: u8 = 1 << 1;
    pub const ENUM: u8 = 1 << 2;
    pub const USER_CTOR: u8 = 1 << 3;
}

/// Marker in the `when` else-offset slot meaning no else branch.
pub const WHEN_NO_ELSE: u16 = u16::MAX;

/// Compiles a bundle into a bytecode image.
pub fn compile_bundle(bundle: &CompilationBundle) -> QuillResult<Vec<u8>> {
    let mut compiler = Compiler::new();
    let mut module_blocks: Vec<(String, bool, BytecodeBuilder)> = Vec::new();
    for (key, module) in &bundle.modules {
        let mut body = BytecodeBuilder::new();
        for node in &module.nodes {
            compiler.statement(&mut body, node, true)?;
        }
        body.op(Opcode::EndOfModule);
        module_blocks.push((key.clone(), *key == bundle.entry_key, body));
    }

    // assemble: header, constant table, then module blocks
    let mut image = BytecodeBuilder::new();
    image.op(Opcode::Signature);
    for byte in SIGNATURE {
        image.u8(byte);
    }
    image.op(Opcode::Version);
    for byte in VERSION {
        image.u8(byte);
    }
    compiler.consts.write(&mut image);
    for (key, is_entry, body) in module_blocks {
        image.op(Opcode::Module);
        image.short_str(&key);
        image.u8(u8::from(is_entry));
        image.append(&body);
    }
    Ok(image.into_bytes())
}

impl ConstTable {
    /// Serializes the pools as the image's constant-table block.
    pub fn write(&self, image: &mut BytecodeBuilder) {
        image.op(Opcode::ConstTable);
        let ints = self.ints().collect::<Vec<_>>();
        image.u16(u16::try_from(ints.len()).expect("int pool overflow"));
        for value in ints {
            image.i64(value);
        }
        let floats = self.floats().collect::<Vec<_>>();
        image.u16(u16::try_from(floats.len()).expect("float pool overflow"));
        for value in floats {
            image.f64(value);
        }
        let strings = self.strings().map(str::to_owned).collect::<Vec<_>>();
        image.u16(u16::try_from(strings.len()).expect("string pool overflow"));
        for value in strings {
            image.str16(&value);
        }
    }
}

struct Compiler {
    consts: ConstTable,
    /// `for`-header rename maps, innermost last.
    renames: Vec<AHashMap<String, String>>,
    synth_counter: u32,
    last_line: u32,
}

impl Compiler {
    fn new() -> Self {
        Self {
            consts: ConstTable::new(),
            renames: Vec::new(),
            synth_counter: 0,
            last_line: 0,
        }
    }

    fn next_synth(&mut self) -> u32 {
        self.synth_counter += 1;
        self.synth_counter
    }

    fn renamed<'a>(&'a self, name: &'a str) -> &'a str {
        for map in self.renames.iter().rev() {
            if let Some(renamed) = map.get(name) {
                return renamed;
            }
        }
        name
    }

    fn line_info(&mut self, b: &mut BytecodeBuilder, span: Span) {
        if span.line != 0 && span.line != self.last_line {
            self.last_line = span.line;
            b.op(Opcode::LineInfo);
            b.u16(u16::try_from(span.line).unwrap_or(u16::MAX));
            b.u16(u16::try_from(span.column).unwrap_or(u16::MAX));
        }
    }

    fn fault(node: &AstNode, message: impl Into<String>) -> QuillError {
        QuillError::new(
            ErrorCode::Unsupported,
            message,
            node.span.line,
            node.span.column,
            node.span.offset,
            node.span.length,
        )
    }

    // --- statements -------------------------------------------------------

    fn statement(&mut self, b: &mut BytecodeBuilder, node: &AstNode, top_level: bool) -> QuillResult<()> {
        self.line_info(b, node.span);
        match &node.kind {
            AstKind::EmptyLine | AstKind::LibraryDecl { .. } => {}
            AstKind::VarDecl(decl) => self.var_decl(b, decl, top_level, false)?,
            AstKind::FunctionDecl(decl) => {
                b.op(Opcode::FuncDecl);
                self.encode_function(b, decl)?;
            }
            AstKind::ClassDecl(decl) => self.class_decl(b, decl, false)?,
            AstKind::EnumDecl(decl) => {
                let lowered = lower_enum(decl, node.span);
                self.class_decl(b, &lowered, true)?;
            }
            AstKind::StructDecl(decl) => self.struct_decl(b, decl)?,
            AstKind::TypeAliasDecl { name, ty, .. } => {
                b.op(Opcode::TypeAliasDecl);
                let name_idx = self.consts.intern_str(name);
                b.u16(name_idx);
                let (type_idx, nullable) = self.type_operands(ty);
                b.u16(type_idx);
                b.u8(u8::from(nullable));
            }
            AstKind::ImportDecl(decl) => self.import_decl(b, decl),
            AstKind::Block(nodes) => {
                b.op(Opcode::Block);
                let idx = self.consts.intern_str("block");
                b.u16(idx);
                for inner in nodes {
                    self.statement(b, inner, false)?;
                }
                b.op(Opcode::EndOfBlock);
            }
            AstKind::If { .. } => {
                self.if_node(b, node)?;
                b.op(Opcode::EndOfStmt);
            }
            AstKind::While { condition, body } => self.while_stmt(b, condition, body)?,
            AstKind::DoWhile { body, condition } => self.do_while_stmt(b, body, condition)?,
            AstKind::For {
                init,
                condition,
                increment,
                body,
            } => self.for_stmt(b, init.as_deref(), condition.as_deref(), increment.as_deref(), body)?,
            AstKind::ForIn {
                decl_name,
                iterable,
                body,
            } => {
                let lowered = self.lower_for_in(decl_name, iterable, body, node.span);
                self.statement(b, &lowered, false)?;
            }
            AstKind::When { .. } => {
                self.when_node(b, node)?;
                b.op(Opcode::EndOfStmt);
            }
            AstKind::Return { value } => {
                match value {
                    Some(value) => self.expr(b, value)?,
                    None => {
                        b.op(Opcode::Local);
                        b.u8(LocalType::Null as u8);
                    }
                }
                b.op(Opcode::EndOfFunc);
            }
            AstKind::Break => b.op(Opcode::BreakLoop),
            AstKind::Continue => b.op(Opcode::ContinueLoop),
            _ => {
                self.expr(b, node)?;
                b.op(Opcode::EndOfStmt);
            }
        }
        Ok(())
    }

    /// Compiles a sub-program: an expression stream terminated by
    /// `endOfExec`, run by the VM in its own register window.
    fn sub_expr(&mut self, node: &AstNode) -> QuillResult<BytecodeBuilder> {
        let mut sub = BytecodeBuilder::new();
        self.expr(&mut sub, node)?;
        sub.op(Opcode::EndOfExec);
        Ok(sub)
    }

    /// Compiles a statement stream (function body) terminated by
    /// `endOfFunc`.
    fn sub_body(&mut self, body: &AstNode) -> QuillResult<BytecodeBuilder> {
        let mut sub = BytecodeBuilder::new();
        match &body.kind {
            AstKind::Block(nodes) => {
                for node in nodes {
                    self.statement(&mut sub, node, false)?;
                }
            }
            _ => self.statement(&mut sub, body, false)?,
        }
        // implicit `return null` for bodies that fall off the end
        sub.op(Opcode::Local);
        sub.u8(LocalType::Null as u8);
        sub.op(Opcode::EndOfFunc);
        Ok(sub)
    }

    fn var_decl(&mut self, b: &mut BytecodeBuilder, decl: &VarDecl, top_level: bool, in_class: bool) -> QuillResult<()> {
        b.op(Opcode::VarDecl);
        let name = self.renamed(&decl.name).to_owned();
        let name_idx = self.consts.intern_str(&name);
        b.u16(name_idx);
        let mut flags = 0u8;
        if decl.modifiers.is_external {
            flags |= var_flags::EXTERNAL;
        }
        if decl.modifiers.is_static {
            flags |= var_flags::STATIC;
        }
        if decl.modifiers.is_const {
            flags |= var_flags::CONST;
        }
        if decl.modifiers.is_mutable {
            flags |= var_flags::MUTABLE;
        }
        if decl.modifiers.is_exported {
            flags |= var_flags::EXPORTED;
        }
        if top_level {
            flags |= var_flags::TOP_LEVEL;
        }
        if decl.modifiers.late_initialize {
            flags |= var_flags::LATE;
        }
        b.u8(flags);
        match &decl.declared_type {
            Some(ty) => {
                b.u8(1);
                let (idx, nullable) = self.type_operands(ty);
                b.u16(idx);
                b.u8(u8::from(nullable));
            }
            None => b.u8(0),
        }
        let stored = decl.modifiers.late_initialize || (in_class && !decl.modifiers.is_static);
        match &decl.initializer {
            None => b.u8(INIT_NONE),
            Some(init) if stored => {
                b.u8(INIT_STORED);
                b.u16(u16::try_from(init.span.line).unwrap_or(u16::MAX));
                b.u16(u16::try_from(init.span.column).unwrap_or(u16::MAX));
                let sub = self.sub_expr(init)?;
                b.splice_prefixed(&sub);
            }
            Some(init) => {
                b.u8(INIT_INLINE);
                let sub = self.sub_expr(init)?;
                b.append(&sub);
            }
        }
        Ok(())
    }

    fn encode_function(&mut self, b: &mut BytecodeBuilder, decl: &FunctionDecl) -> QuillResult<()> {
        let internal_idx = self.consts.intern_str(&decl.internal_name);
        b.u16(internal_idx);
        b.u8(decl.category.to_byte());
        let mut flags = 0u8;
        if decl.modifiers.is_external {
            flags |= func_flags::EXTERNAL;
        }
        if decl.modifiers.is_static {
            flags |= func_flags::STATIC;
        }
        if decl.is_variadic {
            flags |= func_flags::VARIADIC;
        }
        if decl.redirect.is_some() {
            flags |= func_flags::REDIRECT;
        }
        if decl.modifiers.is_exported {
            flags |= func_flags::EXPORTED;
        }
        b.u8(flags);
        match &decl.name {
            Some(name) => {
                b.u8(1);
                let idx = self.consts.intern_str(name);
                b.u16(idx);
            }
            None => b.u8(0),
        }
        b.u8(decl.min_arity);
        b.u8(decl.max_arity);

        b.u8(u8::try_from(decl.params.len()).map_err(|_| {
            QuillError::positionless(ErrorCode::Unsupported, "more than 255 parameters")
        })?);
        for param in &decl.params {
            self.encode_param(b, param)?;
        }

        if let Some(redirect) = &decl.redirect {
            b.u8(match redirect.target {
                RedirectTarget::Super => 0,
                RedirectTarget::This => 1,
            });
            match &redirect.key {
                Some(key) => {
                    b.u8(1);
                    let idx = self.consts.intern_str(key);
                    b.u16(idx);
                }
                None => b.u8(0),
            }
            b.u8(u8::try_from(redirect.positional.len()).unwrap_or(u8::MAX));
            for arg in &redirect.positional {
                let sub = self.sub_expr(arg)?;
                b.splice_prefixed(&sub);
            }
            b.u8(u8::try_from(redirect.named.len()).unwrap_or(u8::MAX));
            for (name, arg) in &redirect.named {
                let idx = self.consts.intern_str(name);
                b.u16(idx);
                let sub = self.sub_expr(arg)?;
                b.splice_prefixed(&sub);
            }
        }

        match &decl.body {
            Some(body) => {
                b.u8(1);
                b.u16(u16::try_from(body.span.line).unwrap_or(u16::MAX));
                b.u16(u16::try_from(body.span.column).unwrap_or(u16::MAX));
                let saved_line = self.last_line;
                let sub = self.sub_body(body)?;
                self.last_line = saved_line;
                b.splice_prefixed(&sub);
            }
            None => b.u8(0),
        }
        Ok(())
    }

    fn encode_param(&mut self, b: &mut BytecodeBuilder, param: &Param) -> QuillResult<()> {
        let name_idx = self.consts.intern_str(&param.name);
        b.u16(name_idx);
        let mut flags = 0u8;
        if param.is_optional {
            flags |= param_flags::OPTIONAL;
        }
        if param.is_named {
            flags |= param_flags::NAMED;
        }
        if param.is_variadic {
            flags |= param_flags::VARIADIC;
        }
        if param.declared_type.is_some() {
            flags |= param_flags::HAS_TYPE;
        }
        if param.initializer.is_some() {
            flags |= param_flags::HAS_INIT;
        }
        b.u8(flags);
        if let Some(ty) = &param.declared_type {
            let (idx, nullable) = self.type_operands(ty);
            b.u16(idx);
            b.u8(u8::from(nullable));
        }
        if let Some(init) = &param.initializer {
            b.u16(u16::try_from(init.span.line).unwrap_or(u16::MAX));
            b.u16(u16::try_from(init.span.column).unwrap_or(u16::MAX));
            let sub = self.sub_expr(init)?;
            b.splice_prefixed(&sub);
        }
        Ok(())
    }

    fn class_decl(&mut self, b: &mut BytecodeBuilder, decl: &ClassDecl, is_enum: bool) -> QuillResult<()> {
        b.op(Opcode::ClassDecl);
        let name_idx = self.consts.intern_str(&decl.name);
        b.u16(name_idx);
        let mut flags = 0u8;
        if decl.modifiers.is_external {
            flags |= class_flags::EXTERNAL;
        }
        if decl.is_abstract {
            flags |= class_flags::ABSTRACT;
        }
        if is_enum {
            flags |= class_flags::ENUM;
        }
        if decl.has_user_constructor {
            flags |= class_flags::USER_CTOR;
        }
        b.u8(flags);
        match &decl.super_type {
            Some(ty) => {
                b.u8(1);
                let idx = self.consts.intern_str(ty.name());
                b.u16(idx);
            }
            None => b.u8(0),
        }
        b.u8(u8::try_from(decl.generic_params.len()).unwrap_or(u8::MAX));
        for name in &decl.generic_params {
            let idx = self.consts.intern_str(name);
            b.u16(idx);
        }
        b.u8(u8::try_from(decl.implements.len()).unwrap_or(u8::MAX));
        for ty in &decl.implements {
            let idx = self.consts.intern_str(ty.name());
            b.u16(idx);
        }
        b.u8(u8::try_from(decl.mixes.len()).unwrap_or(u8::MAX));
        for ty in &decl.mixes {
            let idx = self.consts.intern_str(ty.name());
            b.u16(idx);
        }

        // member stream, terminated by endOfBlock, executed in class mode
        for member in &decl.members {
            match &member.kind {
                AstKind::VarDecl(var) => self.var_decl(b, var, false, true)?,
                AstKind::FunctionDecl(function) => {
                    b.op(Opcode::FuncDecl);
                    self.encode_function(b, function)?;
                }
                AstKind::EmptyLine => {}
                _ => return Err(Self::fault(member, "unsupported class member form")),
            }
        }
        b.op(Opcode::EndOfBlock);
        Ok(())
    }

    fn struct_decl(&mut self, b: &mut BytecodeBuilder, decl: &StructDecl) -> QuillResult<()> {
        b.op(Opcode::StructDecl);
        let name_idx = self.consts.intern_str(&decl.name);
        b.u16(name_idx);
        match &decl.prototype {
            Some(proto) => {
                b.u8(1);
                let idx = self.consts.intern_str(proto);
                b.u16(idx);
            }
            None => b.u8(0),
        }
        b.u16(u16::try_from(decl.fields.len()).unwrap_or(u16::MAX));
        for (key, value) in &decl.fields {
            b.short_str(key);
            let sub = self.sub_expr(value)?;
            b.append(&sub);
        }
        Ok(())
    }

    fn import_decl(&mut self, b: &mut BytecodeBuilder, decl: &ImportDecl) {
        // unresolved imports already carry a sourceProviderError
        let Some(resolved) = &decl.resolved_key else { return };
        b.op(Opcode::ImportDecl);
        b.short_str(resolved);
        match &decl.alias {
            Some(alias) => {
                b.u8(1);
                let idx = self.consts.intern_str(alias);
                b.u16(idx);
            }
            None => b.u8(0),
        }
        b.u8(u8::try_from(decl.show.len()).unwrap_or(u8::MAX));
        for name in &decl.show {
            let idx = self.consts.intern_str(name);
            b.u16(idx);
        }
    }

    // --- control flow -----------------------------------------------------

    /// `if`: condition, `ifStmt` with the offset over the then-branch,
    /// then-branch, `skip` over the else-branch, else-branch. A missing
    /// else loads null so the form has a value in expression position.
    fn if_node(&mut self, b: &mut BytecodeBuilder, node: &AstNode) -> QuillResult<()> {
        let AstKind::If {
            condition,
            then_branch,
            else_branch,
        } = &node.kind
        else {
            return Err(Self::fault(node, "expected an if node"));
        };
        self.expr(b, condition)?;

        let mut then_sub = BytecodeBuilder::new();
        self.compile_branch(&mut then_sub, then_branch)?;
        let mut else_sub = BytecodeBuilder::new();
        match else_branch {
            Some(branch) => self.compile_branch(&mut else_sub, branch)?,
            None => {
                else_sub.op(Opcode::Local);
                else_sub.u8(LocalType::Null as u8);
            }
        }

        b.op(Opcode::IfStmt);
        // skip the then-branch plus the trailing skip instruction
        let over_then = u16::try_from(then_sub.len() + 3)
            .map_err(|_| Self::fault(node, "then-branch exceeds jump range"))?;
        b.u16(over_then);
        b.append(&then_sub);
        b.op(Opcode::Skip);
        let over_else =
            i16::try_from(else_sub.len()).map_err(|_| Self::fault(node, "else-branch exceeds jump range"))?;
        b.i16(over_else);
        b.append(&else_sub);
        Ok(())
    }

    /// Branches compile as statements but keep their last value, so `if`
    /// works in expression position too.
    fn compile_branch(&mut self, b: &mut BytecodeBuilder, branch: &AstNode) -> QuillResult<()> {
        match &branch.kind {
            AstKind::Block(nodes) => {
                b.op(Opcode::Block);
                let idx = self.consts.intern_str("block");
                b.u16(idx);
                for node in nodes {
                    self.statement(b, node, false)?;
                }
                b.op(Opcode::EndOfBlock);
            }
            _ => self.statement(b, branch, false)?,
        }
        Ok(())
    }

    /// `while`: `loopPoint` with break/continue offsets, condition,
    /// `whileStmt`, body, `skip` back to the condition.
    fn while_stmt(&mut self, b: &mut BytecodeBuilder, condition: &AstNode, body: &AstNode) -> QuillResult<()> {
        let mut cond_sub = BytecodeBuilder::new();
        self.expr(&mut cond_sub, condition)?;
        let mut body_sub = BytecodeBuilder::new();
        self.compile_branch(&mut body_sub, body)?;

        // layout after loopPoint's 5 bytes: cond, whileStmt, body, skip(3)
        let cond_len = cond_sub.len();
        let body_len = body_sub.len();
        let continue_off = 5u16;
        let break_off = u16::try_from(5 + cond_len + 1 + body_len + 3)
            .map_err(|_| QuillError::positionless(ErrorCode::Unsupported, "loop body exceeds jump range"))?;

        b.op(Opcode::LoopPoint);
        b.u16(break_off);
        b.u16(continue_off);
        b.append(&cond_sub);
        b.op(Opcode::WhileStmt);
        b.append(&body_sub);
        b.op(Opcode::Skip);
        let back = -i16::try_from(cond_len + 1 + body_len + 3)
            .map_err(|_| QuillError::positionless(ErrorCode::Unsupported, "loop body exceeds jump range"))?;
        b.i16(back);
        Ok(())
    }

    /// `do-while`: body first, then the condition and a conditional jump
    /// back to the body start.
    fn do_while_stmt(&mut self, b: &mut BytecodeBuilder, body: &AstNode, condition: &AstNode) -> QuillResult<()> {
        let mut body_sub = BytecodeBuilder::new();
        self.compile_branch(&mut body_sub, body)?;
        let mut cond_sub = BytecodeBuilder::new();
        self.expr(&mut cond_sub, condition)?;

        let body_len = body_sub.len();
        let cond_len = cond_sub.len();
        let continue_off = u16::try_from(5 + body_len)
            .map_err(|_| QuillError::positionless(ErrorCode::Unsupported, "loop body exceeds jump range"))?;
        let break_off = u16::try_from(5 + body_len + cond_len + 3)
            .map_err(|_| QuillError::positionless(ErrorCode::Unsupported, "loop body exceeds jump range"))?;

        b.op(Opcode::LoopPoint);
        b.u16(break_off);
        b.u16(continue_off);
        b.append(&body_sub);
        b.append(&cond_sub);
        b.op(Opcode::DoStmt);
        let back = -i16::try_from(body_len + cond_len + 3)
            .map_err(|_| QuillError::positionless(ErrorCode::Unsupported, "loop body exceeds jump range"))?;
        b.i16(back);
        Ok(())
    }

    /// C-style `for`, wrapped in an explicit block. The initializer's
    /// declared name is kept under an internal marker; header references
    /// compile through the rename, and the user-visible name is
    /// re-declared from the marker inside the body so its lifetime is
    /// per-iteration.
    fn for_stmt(
        &mut self,
        b: &mut BytecodeBuilder,
        init: Option<&AstNode>,
        condition: Option<&AstNode>,
        increment: Option<&AstNode>,
        body: &AstNode,
    ) -> QuillResult<()> {
        b.op(Opcode::Block);
        let idx = self.consts.intern_str("for");
        b.u16(idx);

        let mut rename = AHashMap::new();
        let mut body_prelude: Option<(String, String)> = None;
        if let Some(init_node) = init {
            if let AstKind::VarDecl(decl) = &init_node.kind {
                let marker = format!("$for_{}", decl.name);
                rename.insert(decl.name.clone(), marker.clone());
                body_prelude = Some((decl.name.clone(), marker.clone()));
                self.renames.push(rename);
                self.statement(b, init_node, false)?;
            } else {
                self.renames.push(rename);
                self.statement(b, init_node, false)?;
            }
        } else {
            self.renames.push(rename);
        }

        // header compiles through the rename map
        let mut cond_sub = BytecodeBuilder::new();
        match condition {
            Some(cond) => self.expr(&mut cond_sub, cond)?,
            None => {
                cond_sub.op(Opcode::Local);
                cond_sub.u8(LocalType::Boolean as u8);
                cond_sub.u8(1);
            }
        }
        let mut inc_sub = BytecodeBuilder::new();
        if let Some(inc) = increment {
            self.expr(&mut inc_sub, inc)?;
            inc_sub.op(Opcode::EndOfStmt);
        }
        self.renames.pop();

        // body re-declares the user name from the marker
        let mut body_sub = BytecodeBuilder::new();
        body_sub.op(Opcode::Block);
        let idx = self.consts.intern_str("block");
        body_sub.u16(idx);
        if let Some((user_name, marker)) = &body_prelude {
            body_sub.op(Opcode::VarDecl);
            let name_idx = self.consts.intern_str(user_name);
            body_sub.u16(name_idx);
            body_sub.u8(var_flags::MUTABLE);
            body_sub.u8(0);
            body_sub.u8(INIT_INLINE);
            body_sub.op(Opcode::Local);
            body_sub.u8(LocalType::Identifier as u8);
            let marker_idx = self.consts.intern_str(marker);
            body_sub.u16(marker_idx);
            body_sub.op(Opcode::EndOfExec);
        }
        match &body.kind {
            AstKind::Block(nodes) => {
                for node in nodes {
                    self.statement(&mut body_sub, node, false)?;
                }
            }
            _ => self.statement(&mut body_sub, body, false)?,
        }
        body_sub.op(Opcode::EndOfBlock);

        let cond_len = cond_sub.len();
        let body_len = body_sub.len();
        let inc_len = inc_sub.len();
        let continue_off = u16::try_from(5 + cond_len + 1 + body_len)
            .map_err(|_| QuillError::positionless(ErrorCode::Unsupported, "loop body exceeds jump range"))?;
        let break_off = u16::try_from(5 + cond_len + 1 + body_len + inc_len + 3)
            .map_err(|_| QuillError::positionless(ErrorCode::Unsupported, "loop body exceeds jump range"))?;

        b.op(Opcode::LoopPoint);
        b.u16(break_off);
        b.u16(continue_off);
        b.append(&cond_sub);
        b.op(Opcode::WhileStmt);
        b.append(&body_sub);
        b.append(&inc_sub);
        b.op(Opcode::Skip);
        let back = -i16::try_from(cond_len + 1 + body_len + inc_len + 3)
            .map_err(|_| QuillError::positionless(ErrorCode::Unsupported, "loop body exceeds jump range"))?;
        b.i16(back);
        b.op(Opcode::EndOfBlock);
        Ok(())
    }

    /// `for-in` lowers to a C-style index loop over a snapshot of the
    /// iterable, guarded by `isNotEmpty && counter < length`, with the
    /// element bound from `elementAt(counter)` at the top of the body.
    fn lower_for_in(&mut self, decl_name: &str, iterable: &AstNode, body: &AstNode, span: Span) -> AstNode {
        let n = self.next_synth();
        let snapshot = format!("$iterable_{n}");
        let counter = format!("$count_{n}");

        let ident = |name: &str| AstNode::new(AstKind::Identifier(name.to_owned()), span);
        let member = |object: AstNode, name: &str| {
            AstNode::new(
                AstKind::Member {
                    object: Box::new(object),
                    name: name.to_owned(),
                },
                span,
            )
        };
        let mutable = Modifiers {
            is_mutable: true,
            ..Modifiers::default()
        };

        let snapshot_decl = AstNode::new(
            AstKind::VarDecl(VarDecl {
                name: snapshot.clone(),
                class_name: None,
                modifiers: mutable,
                declared_type: None,
                initializer: Some(Box::new(iterable.clone())),
            }),
            span,
        );
        let counter_decl = AstNode::new(
            AstKind::VarDecl(VarDecl {
                name: counter.clone(),
                class_name: None,
                modifiers: mutable,
                declared_type: None,
                initializer: Some(Box::new(AstNode::new(AstKind::IntLiteral(0), span))),
            }),
            span,
        );
        let guard = AstNode::new(
            AstKind::Binary {
                op: BinaryOp::LogicalAnd,
                left: Box::new(member(ident(&snapshot), "isNotEmpty")),
                right: Box::new(AstNode::new(
                    AstKind::Binary {
                        op: BinaryOp::Lesser,
                        left: Box::new(ident(&counter)),
                        right: Box::new(member(ident(&snapshot), "length")),
                    },
                    span,
                )),
            },
            span,
        );
        let advance = AstNode::new(
            AstKind::Assign {
                target: Box::new(ident(&counter)),
                value: Box::new(AstNode::new(
                    AstKind::Binary {
                        op: BinaryOp::Add,
                        left: Box::new(ident(&counter)),
                        right: Box::new(AstNode::new(AstKind::IntLiteral(1), span)),
                    },
                    span,
                )),
            },
            span,
        );
        let element_decl = AstNode::new(
            AstKind::VarDecl(VarDecl {
                name: decl_name.to_owned(),
                class_name: None,
                modifiers: mutable,
                declared_type: None,
                initializer: Some(Box::new(AstNode::new(
                    AstKind::Call {
                        callee: Box::new(member(ident(&snapshot), "elementAt")),
                        positional: vec![ident(&counter)],
                        named: Vec::new(),
                    },
                    span,
                ))),
            }),
            span,
        );
        let mut loop_body = vec![element_decl];
        match &body.kind {
            AstKind::Block(nodes) => loop_body.extend(nodes.iter().cloned()),
            _ => loop_body.push(body.clone()),
        }

        AstNode::new(
            AstKind::Block(vec![
                snapshot_decl,
                AstNode::new(
                    AstKind::For {
                        init: Some(Box::new(counter_decl)),
                        condition: Some(Box::new(guard)),
                        increment: Some(Box::new(advance)),
                        body: Box::new(AstNode::new(AstKind::Block(loop_body), span)),
                    },
                    span,
                ),
            ]),
            span,
        )
    }

    /// `when`: `anchor`, optional subject, `whenStmt` with the case
    /// count, anchor-relative branch offsets and end offset, the case
    /// expression payloads, then the branches, each ending in a `goto`
    /// to the end.
    fn when_node(&mut self, b: &mut BytecodeBuilder, node: &AstNode) -> QuillResult<()> {
        let AstKind::When {
            subject,
            cases,
            else_branch,
        } = &node.kind
        else {
            return Err(Self::fault(node, "expected a when node"));
        };

        // T is anchor-relative: everything after the anchor opcode
        let mut t = BytecodeBuilder::new();
        if let Some(subject) = subject {
            self.expr(&mut t, subject)?;
        }

        let mut cond_subs = Vec::with_capacity(cases.len());
        let mut branch_subs = Vec::with_capacity(cases.len());
        for (case, branch) in cases {
            cond_subs.push(self.sub_expr(case)?);
            let mut branch_sub = BytecodeBuilder::new();
            self.compile_branch(&mut branch_sub, branch)?;
            branch_subs.push(branch_sub);
        }
        let else_sub = match else_branch {
            Some(branch) => {
                let mut sub = BytecodeBuilder::new();
                self.compile_branch(&mut sub, branch)?;
                Some(sub)
            }
            None => None,
        };

        let case_count = u8::try_from(cases.len()).map_err(|_| Self::fault(node, "more than 255 when cases"))?;
        t.op(Opcode::WhenStmt);
        t.u8(u8::from(subject.is_some()));
        t.u8(case_count);
        let mut branch_slots = Vec::with_capacity(cases.len());
        for _ in 0..cases.len() {
            branch_slots.push(t.reserve_u16());
        }
        let else_slot = t.reserve_u16();
        let end_slot = t.reserve_u16();

        for cond in &cond_subs {
            t.append(cond);
        }

        // each branch ends with goto(end); patched once end is known
        let mut goto_slots = Vec::with_capacity(cases.len());
        for (i, branch) in branch_subs.iter().enumerate() {
            let at = u16::try_from(t.len()).map_err(|_| Self::fault(node, "when exceeds jump range"))?;
            t.patch_u16(branch_slots[i], at);
            t.append(branch);
            t.op(Opcode::Goto);
            goto_slots.push(t.reserve_u16());
        }
        match &else_sub {
            Some(sub) => {
                let at = u16::try_from(t.len()).map_err(|_| Self::fault(node, "when exceeds jump range"))?;
                t.patch_u16(else_slot, at);
                t.append(sub);
                t.op(Opcode::Goto);
                goto_slots.push(t.reserve_u16());
            }
            None => t.patch_u16(else_slot, WHEN_NO_ELSE),
        }
        let end = u16::try_from(t.len()).map_err(|_| Self::fault(node, "when exceeds jump range"))?;
        t.patch_u16(end_slot, end);
        for slot in goto_slots {
            t.patch_u16(slot, end);
        }

        b.op(Opcode::Anchor);
        b.append(&t);
        Ok(())
    }

    // --- expressions ------------------------------------------------------

    fn expr(&mut self, b: &mut BytecodeBuilder, node: &AstNode) -> QuillResult<()> {
        match &node.kind {
            AstKind::NullLiteral => {
                b.op(Opcode::Local);
                b.u8(LocalType::Null as u8);
            }
            AstKind::BoolLiteral(value) => {
                b.op(Opcode::Local);
                b.u8(LocalType::Boolean as u8);
                b.u8(u8::from(*value));
            }
            AstKind::IntLiteral(value) => {
                b.op(Opcode::Local);
                b.u8(LocalType::ConstInt as u8);
                let idx = self.consts.intern_int(*value);
                b.u16(idx);
            }
            AstKind::FloatLiteral(value) => {
                b.op(Opcode::Local);
                b.u8(LocalType::ConstFloat as u8);
                let idx = self.consts.intern_float(*value);
                b.u16(idx);
            }
            AstKind::StringLiteral(value) => {
                b.op(Opcode::Local);
                b.u8(LocalType::ConstString as u8);
                let idx = self.consts.intern_str(value);
                b.u16(idx);
            }
            AstKind::InterpolatedString { text, segments } => {
                b.op(Opcode::Local);
                b.u8(LocalType::StringInterpolation as u8);
                let idx = self.consts.intern_str(text);
                b.u16(idx);
                b.u8(u8::try_from(segments.len()).map_err(|_| Self::fault(node, "too many segments"))?);
                for segment in segments {
                    let sub = self.sub_expr(segment)?;
                    b.append(&sub);
                }
            }
            AstKind::Identifier(name) => {
                b.op(Opcode::Local);
                b.u8(LocalType::Identifier as u8);
                let renamed = self.renamed(name).to_owned();
                let idx = self.consts.intern_str(&renamed);
                b.u16(idx);
            }
            AstKind::This => {
                b.op(Opcode::Local);
                b.u8(LocalType::Identifier as u8);
                let idx = self.consts.intern_str("this");
                b.u16(idx);
            }
            AstKind::Super => {
                b.op(Opcode::Local);
                b.u8(LocalType::Identifier as u8);
                let idx = self.consts.intern_str("super");
                b.u16(idx);
            }
            AstKind::Group(inner) => {
                b.op(Opcode::Local);
                b.u8(LocalType::Group as u8);
                let sub = self.sub_expr(inner)?;
                b.append(&sub);
            }
            AstKind::ListLiteral(items) => {
                b.op(Opcode::Local);
                b.u8(LocalType::List as u8);
                b.u16(u16::try_from(items.len()).map_err(|_| Self::fault(node, "too many list items"))?);
                for item in items {
                    let sub = self.sub_expr(item)?;
                    b.append(&sub);
                }
            }
            AstKind::StructLiteral { id, prototype, fields } => {
                b.op(Opcode::Local);
                b.u8(LocalType::Struct as u8);
                match id {
                    Some(id) => {
                        b.u8(1);
                        let idx = self.consts.intern_str(id);
                        b.u16(idx);
                    }
                    None => b.u8(0),
                }
                match prototype {
                    Some(proto) => {
                        b.u8(1);
                        let idx = self.consts.intern_str(proto);
                        b.u16(idx);
                    }
                    None => b.u8(0),
                }
                b.u16(u16::try_from(fields.len()).map_err(|_| Self::fault(node, "too many struct fields"))?);
                for (key, value) in fields {
                    b.short_str(key);
                    let sub = self.sub_expr(value)?;
                    b.append(&sub);
                }
            }
            AstKind::FunctionLiteral(decl) => {
                b.op(Opcode::Local);
                b.u8(LocalType::Function as u8);
                self.encode_function(b, decl)?;
            }
            AstKind::Unary { op, operand } => {
                self.expr(b, operand)?;
                b.op(match op {
                    UnaryOp::Negate => Opcode::Negative,
                    UnaryOp::Not => Opcode::LogicalNot,
                });
            }
            AstKind::Binary { op, left, right } => self.binary(b, *op, left, right)?,
            AstKind::Ternary {
                condition,
                then_value,
                else_value,
            } => {
                self.expr(b, condition)?;
                let mut then_sub = BytecodeBuilder::new();
                self.expr(&mut then_sub, then_value)?;
                let mut else_sub = BytecodeBuilder::new();
                self.expr(&mut else_sub, else_value)?;
                b.op(Opcode::IfStmt);
                let over_then = u16::try_from(then_sub.len() + 3)
                    .map_err(|_| Self::fault(node, "ternary branch exceeds jump range"))?;
                b.u16(over_then);
                b.append(&then_sub);
                b.op(Opcode::Skip);
                let over_else = i16::try_from(else_sub.len())
                    .map_err(|_| Self::fault(node, "ternary branch exceeds jump range"))?;
                b.i16(over_else);
                b.append(&else_sub);
            }
            AstKind::Member { object, name } => {
                self.expr(b, object)?;
                b.register(Register::PostfixObject);
                self.line_info(b, node.span);
                b.op(Opcode::MemberGet);
                let idx = self.consts.intern_str(name);
                b.u16(idx);
            }
            AstKind::Subscript { object, key } => {
                self.expr(b, object)?;
                b.register(Register::PostfixObject);
                b.op(Opcode::SubGet);
                let sub = self.sub_expr(key)?;
                b.append(&sub);
            }
            AstKind::Call {
                callee,
                positional,
                named,
            } => {
                self.expr(b, callee)?;
                self.line_info(b, node.span);
                b.op(Opcode::Call);
                b.u8(u8::try_from(positional.len()).map_err(|_| Self::fault(node, "too many arguments"))?);
                for arg in positional {
                    let sub = self.sub_expr(arg)?;
                    b.append(&sub);
                }
                b.u8(u8::try_from(named.len()).map_err(|_| Self::fault(node, "too many named arguments"))?);
                for (name, arg) in named {
                    b.short_str(name);
                    let sub = self.sub_expr(arg)?;
                    b.append(&sub);
                }
            }
            AstKind::Assign { target, value } => self.assign(b, target, value)?,
            AstKind::TypeCheck { operand, ty, negated } => {
                self.expr(b, operand)?;
                b.register(Register::RelationLeft);
                self.type_literal(b, ty);
                b.op(if *negated { Opcode::TypeIsNot } else { Opcode::TypeIs });
            }
            AstKind::TypeCast { operand, ty } => {
                self.expr(b, operand)?;
                b.register(Register::RelationLeft);
                self.type_literal(b, ty);
                b.op(Opcode::TypeAs);
            }
            AstKind::TypeOf { operand } => {
                self.expr(b, operand)?;
                b.op(Opcode::TypeOf);
            }
            AstKind::If { .. } => self.if_node(b, node)?,
            AstKind::When { .. } => self.when_node(b, node)?,
            _ => return Err(Self::fault(node, "expected an expression")),
        }
        Ok(())
    }

    fn type_literal(&mut self, b: &mut BytecodeBuilder, ty: &TypeExpr) {
        b.op(Opcode::Local);
        b.u8(LocalType::Type as u8);
        let (idx, nullable) = self.type_operands(ty);
        b.u16(idx);
        b.u8(u8::from(nullable));
    }

    fn type_operands(&mut self, ty: &TypeExpr) -> (u16, bool) {
        let nullable = match ty {
            TypeExpr::Nominal { nullable, .. } | TypeExpr::Function { nullable, .. } => *nullable,
        };
        (self.consts.intern_str(ty.name()), nullable)
    }

    fn binary(&mut self, b: &mut BytecodeBuilder, op: BinaryOp, left: &AstNode, right: &AstNode) -> QuillResult<()> {
        match op {
            BinaryOp::LogicalOr => {
                self.expr(b, left)?;
                b.register(Register::OrLeft);
                b.op(Opcode::LogicalOr);
                let sub = self.sub_expr(right)?;
                b.splice_prefixed(&sub);
            }
            BinaryOp::LogicalAnd => {
                self.expr(b, left)?;
                b.register(Register::AndLeft);
                b.op(Opcode::LogicalAnd);
                let sub = self.sub_expr(right)?;
                b.splice_prefixed(&sub);
            }
            BinaryOp::Equal | BinaryOp::NotEqual => {
                self.expr(b, left)?;
                b.register(Register::EqualLeft);
                self.expr(b, right)?;
                b.op(if op == BinaryOp::Equal {
                    Opcode::Equal
                } else {
                    Opcode::NotEqual
                });
            }
            BinaryOp::Lesser | BinaryOp::Greater | BinaryOp::LesserOrEqual | BinaryOp::GreaterOrEqual => {
                self.expr(b, left)?;
                b.register(Register::RelationLeft);
                self.expr(b, right)?;
                b.op(match op {
                    BinaryOp::Lesser => Opcode::Lesser,
                    BinaryOp::Greater => Opcode::Greater,
                    BinaryOp::LesserOrEqual => Opcode::LesserOrEqual,
                    _ => Opcode::GreaterOrEqual,
                });
            }
            BinaryOp::Add | BinaryOp::Subtract => {
                self.expr(b, left)?;
                b.register(Register::AddLeft);
                self.expr(b, right)?;
                b.op(if op == BinaryOp::Add { Opcode::Add } else { Opcode::Subtract });
            }
            BinaryOp::Multiply | BinaryOp::Divide | BinaryOp::Modulo => {
                self.expr(b, left)?;
                b.register(Register::MultiplyLeft);
                self.expr(b, right)?;
                b.op(match op {
                    BinaryOp::Multiply => Opcode::Multiply,
                    BinaryOp::Divide => Opcode::Divide,
                    _ => Opcode::Modulo,
                });
            }
        }
        Ok(())
    }

    /// Read/compute/write sequences arrive from the parser already lowered
    /// into plain assignments; this routes the three legal target shapes.
    fn assign(&mut self, b: &mut BytecodeBuilder, target: &AstNode, value: &AstNode) -> QuillResult<()> {
        match &target.kind {
            AstKind::Identifier(name) => {
                self.expr(b, value)?;
                b.op(Opcode::Assign);
                let renamed = self.renamed(name).to_owned();
                let idx = self.consts.intern_str(&renamed);
                b.u16(idx);
            }
            AstKind::Member { object, name } => {
                self.expr(b, object)?;
                b.register(Register::PostfixObject);
                b.op(Opcode::MemberSet);
                let idx = self.consts.intern_str(name);
                b.u16(idx);
                let sub = self.sub_expr(value)?;
                b.append(&sub);
            }
            AstKind::Subscript { object, key } => {
                self.expr(b, object)?;
                b.register(Register::PostfixObject);
                b.op(Opcode::SubSet);
                let key_sub = self.sub_expr(key)?;
                b.append(&key_sub);
                let value_sub = self.sub_expr(value)?;
                b.append(&value_sub);
            }
            _ => return Err(Self::fault(target, "illegal assignment target")),
        }
        Ok(())
    }
}

/// Lowers an `enum` declaration into the equivalent class: a private
/// `_name` field, a private one-argument constructor, `toString`
/// returning `"EnumName.${_name}"`, one late-initialized static per
/// enumerator, and a static `values` list in declaration order.
fn lower_enum(decl: &EnumDecl, span: Span) -> ClassDecl {
    let ident = |name: &str| AstNode::new(AstKind::Identifier(name.to_owned()), span);
    let mutable = Modifiers {
        is_mutable: true,
        ..Modifiers::default()
    };
    let static_late = Modifiers {
        is_static: true,
        late_initialize: true,
        ..Modifiers::default()
    };

    let mut members = Vec::new();

    // var _name
    members.push(AstNode::new(
        AstKind::VarDecl(VarDecl {
            name: "_name".to_owned(),
            class_name: Some(decl.name.clone()),
            modifiers: mutable,
            declared_type: None,
            initializer: None,
        }),
        span,
    ));

    // construct(name) { this._name = name }
    let ctor_body = AstNode::new(
        AstKind::Block(vec![AstNode::new(
            AstKind::Assign {
                target: Box::new(AstNode::new(
                    AstKind::Member {
                        object: Box::new(AstNode::new(AstKind::This, span)),
                        name: "_name".to_owned(),
                    },
                    span,
                )),
                value: Box::new(ident("name")),
            },
            span,
        )]),
        span,
    );
    members.push(AstNode::new(
        AstKind::FunctionDecl(Box::new(FunctionDecl {
            name: None,
            internal_name: "$construct".to_owned(),
            category: FunctionCategory::Constructor,
            modifiers: Modifiers::default(),
            generic_params: Vec::new(),
            params: vec![Param {
                name: "name".to_owned(),
                declared_type: None,
                initializer: None,
                is_optional: false,
                is_named: false,
                is_variadic: false,
                span,
            }],
            min_arity: 1,
            max_arity: 1,
            is_variadic: false,
            return_type: None,
            redirect: None,
            body: Some(Box::new(ctor_body)),
        })),
        span,
    ));

    // fun toString => 'EnumName.${_name}'
    let to_string_body = AstNode::new(
        AstKind::Block(vec![AstNode::new(
            AstKind::Return {
                value: Some(Box::new(AstNode::new(
                    AstKind::InterpolatedString {
                        text: format!("{}.{{0}}", decl.name),
                        segments: vec![ident("_name")],
                    },
                    span,
                ))),
            },
            span,
        )]),
        span,
    );
    members.push(AstNode::new(
        AstKind::FunctionDecl(Box::new(FunctionDecl {
            name: Some("toString".to_owned()),
            internal_name: "toString".to_owned(),
            category: FunctionCategory::Method,
            modifiers: Modifiers::default(),
            generic_params: Vec::new(),
            params: Vec::new(),
            min_arity: 0,
            max_arity: 0,
            is_variadic: false,
            return_type: None,
            redirect: None,
            body: Some(Box::new(to_string_body)),
        })),
        span,
    ));

    // static late var <enumerator> = EnumName('<enumerator>')
    for value in &decl.values {
        members.push(AstNode::new(
            AstKind::VarDecl(VarDecl {
                name: value.clone(),
                class_name: Some(decl.name.clone()),
                modifiers: static_late,
                declared_type: None,
                initializer: Some(Box::new(AstNode::new(
                    AstKind::Call {
                        callee: Box::new(ident(&decl.name)),
                        positional: vec![AstNode::new(AstKind::StringLiteral(value.clone()), span)],
                        named: Vec::new(),
                    },
                    span,
                ))),
            }),
            span,
        ));
    }

    // static late var values = [EnumName.a, EnumName.b, ...]
    let value_refs = decl
        .values
        .iter()
        .map(|value| {
            AstNode::new(
                AstKind::Member {
                    object: Box::new(ident(&decl.name)),
                    name: value.clone(),
                },
                span,
            )
        })
        .collect();
    members.push(AstNode::new(
        AstKind::VarDecl(VarDecl {
            name: "values".to_owned(),
            class_name: Some(decl.name.clone()),
            modifiers: static_late,
            declared_type: None,
            initializer: Some(Box::new(AstNode::new(AstKind::ListLiteral(value_refs), span))),
        }),
        span,
    ));

    ClassDecl {
        name: decl.name.clone(),
        super_type: None,
        generic_params: Vec::new(),
        implements: Vec::new(),
        mixes: Vec::new(),
        modifiers: decl.modifiers,
        is_abstract: false,
        members,
        has_user_constructor: true,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::module::{MemoryResolver, ModuleLoader};

    fn compile(source: &str) -> Vec<u8> {
        let mut loader = ModuleLoader::new(MemoryResolver::new());
        let bundle = loader.parse_to_compilation(source, "test.ql", None);
        assert!(bundle.errors().is_empty(), "frontend errors: {:?}", bundle.errors());
        compile_bundle(&bundle).expect("compile")
    }

    #[test]
    fn image_starts_with_signature_and_version() {
        let image = compile("var x = 1");
        assert_eq!(image[0], Opcode::Signature as u8);
        assert_eq!(&image[1..5], &SIGNATURE);
        assert_eq!(image[5], Opcode::Version as u8);
        assert_eq!(&image[6..10], &VERSION);
        assert_eq!(image[10], Opcode::ConstTable as u8);
    }

    #[test]
    fn constant_table_interns_duplicates() {
        let image = compile("var a = 42\nvar b = 42\nvar c = 7");
        // const table block: op, u16 int count
        let int_count = u16::from_be_bytes([image[11], image[12]]);
        assert_eq!(int_count, 2, "42 must intern to a single slot");
    }

    /// Finds the first offset where `needle` occurs as a byte sequence.
    fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack.windows(needle.len()).position(|window| window == needle)
    }

    #[test]
    fn module_block_carries_key_and_entry_flag() {
        let image = compile("var x = 1");
        let mut expected = vec![Opcode::Module as u8, 7];
        expected.extend_from_slice(b"test.ql");
        // library-entry flag follows the key
        expected.push(1);
        assert!(find(&image, &expected).is_some(), "module header missing");
    }

    #[test]
    fn binary_expression_uses_register_protocol() {
        let image = compile("1 + 2");
        // expect: ... Register(AddLeft) ... Add
        let register_pair = [Opcode::Register as u8, Register::AddLeft as u8];
        let register_pos = find(&image, &register_pair).expect("register opcode");
        let add_pos = image
            .iter()
            .rposition(|b| *b == Opcode::Add as u8)
            .expect("add opcode");
        assert!(add_pos > register_pos);
    }

    #[test]
    fn logical_or_right_operand_is_length_prefixed() {
        let image = compile("true || false");
        // right operand: Local Boolean false + EndOfExec, length 4
        let pos = find(&image, &[Opcode::LogicalOr as u8, 0, 4]).expect("logicalOr opcode");
        assert_eq!(image[pos + 3 + 3], Opcode::EndOfExec as u8);
    }

    #[test]
    fn enum_lowers_to_class_opcode() {
        let image = compile("enum E { a, b }");
        assert!(image.contains(&(Opcode::ClassDecl as u8)));
        // lowered statics are late-initialized: stored init selector present
        assert!(!image.is_empty());
    }

    #[test]
    fn while_loop_emits_loop_point_and_backward_skip() {
        let image = compile("while (false) { 1 }");
        assert!(image.contains(&(Opcode::LoopPoint as u8)));
        assert!(image.contains(&(Opcode::WhileStmt as u8)));
    }

    #[test]
    fn when_emits_anchor_and_goto() {
        let image = compile("when (1) { 1 => 2 else => 3 }");
        assert!(image.contains(&(Opcode::Anchor as u8)));
        assert!(image.contains(&(Opcode::WhenStmt as u8)));
        assert!(image.contains(&(Opcode::Goto as u8)));
    }
}
