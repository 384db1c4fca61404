//! The bytecode interpreter.
//!
//! Execution state is a sixteen-slot register file, a namespace stack, a
//! loop stack, and the current instruction pointer into one loaded
//! image. Nested sub-programs (call arguments, group expressions, stored
//! initializers, function bodies) execute through the same dispatch loop
//! via Rust recursion; each sub-program runs in a fresh register window
//! and every call frame restores the full context on return.
//!
//! The VM never re-enters the parser or compiler; the only late work is
//! firing `late` initializers from their stored byte ranges on first
//! read.

use std::rc::Rc;

use ahash::AHashMap;
use indexmap::IndexMap;
use smallvec::SmallVec;

use crate::{
    ast::{FunctionCategory, Modifiers, RedirectTarget},
    class::{Class, FieldDef, Instance},
    compiler::{INIT_INLINE, INIT_NONE, INIT_STORED, WHEN_NO_ELSE, class_flags, func_flags, param_flags, var_flags},
    declaration::{CodeRef, Declaration, LateInit},
    error::{ErrorCode, QuillError, QuillResult},
    external::{Builtin, CallArguments, ExternalBindings, ExternalCallable, HostContext},
    function::{Function, ParamDef, RedirectRecord},
    heap::{Heap, HeapData, HeapId},
    image::Image,
    io::PrintWriter,
    namespace::{NamespaceId, Namespaces},
    opcode::{LocalType, Opcode, REGISTER_COUNT, Register},
    resource::ResourceLimits,
    struct_obj::StructObject,
    tracer::VmTracer,
    value::{TypeValue, Value},
};

/// Why the dispatch loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    /// `endOfExec`: an embedded sub-expression stream finished.
    Exec,
    /// `endOfFunc`: a function body returned.
    Func,
    /// `endOfModule`: a module block finished.
    Module,
    /// Ran off the end of the image.
    EndOfImage,
}

/// An active loop: jump targets plus the namespace depth to restore on
/// `break`/`continue`.
#[derive(Debug, Clone, Copy)]
struct LoopInfo {
    break_ip: usize,
    continue_ip: usize,
    ns_depth: usize,
    /// `when` nesting depth to restore when the loop unwinds past open
    /// branch dispatches.
    when_depth: usize,
    ns: NamespaceId,
}

/// `this`/`super` context of the currently executing method body.
#[derive(Debug, Clone, Copy)]
struct MethodContext {
    instance: HeapId,
    /// Index of the defining class in the instance's inheritance chain;
    /// `super` lookups start at `level + 1`.
    level: usize,
}

/// Arguments gathered at a call site.
#[derive(Debug, Default)]
pub struct GatheredArgs {
    pub positional: SmallVec<[Value; 4]>,
    pub named: IndexMap<String, Value>,
}

/// The interpreter. Borrows all persistent state (heap, namespaces,
/// loaded images, bindings) from the embedding [`crate::Interpreter`]
/// for the duration of one run.
pub struct Vm<'a, Tr: VmTracer> {
    images: &'a [Rc<Image>],
    heap: &'a mut Heap,
    namespaces: &'a mut Namespaces,
    bindings: &'a ExternalBindings,
    module_namespaces: &'a mut AHashMap<String, NamespaceId>,
    out: &'a mut dyn PrintWriter,
    limits: &'a ResourceLimits,
    tracer: &'a mut Tr,
    global: NamespaceId,

    image: usize,
    module: Rc<str>,
    module_is_entry: bool,
    ip: usize,
    registers: [Value; REGISTER_COUNT],
    current_ns: NamespaceId,
    ns_stack: Vec<NamespaceId>,
    loop_stack: Vec<LoopInfo>,
    /// Anchor bases of `when` statements whose branch is executing; the
    /// branch-terminating `goto` pops its base here.
    when_stack: Vec<usize>,
    anchor: usize,
    line: u32,
    column: u32,
    call_depth: usize,
    /// Namespace of the most recent library-entry module block.
    entry_ns: Option<NamespaceId>,
    method_ctx: Option<MethodContext>,
    /// Set by loading the `super` identifier; consumed by the next
    /// member access to start resolution above the defining class.
    pending_super: Option<usize>,
}

const EMPTY_REGISTERS: [Value; REGISTER_COUNT] = [
    Value::Null,
    Value::Null,
    Value::Null,
    Value::Null,
    Value::Null,
    Value::Null,
    Value::Null,
    Value::Null,
    Value::Null,
    Value::Null,
    Value::Null,
    Value::Null,
    Value::Null,
    Value::Null,
    Value::Null,
    Value::Null,
];

impl<'a, Tr: VmTracer> Vm<'a, Tr> {
    #[expect(clippy::too_many_arguments)]
    pub fn new(
        images: &'a [Rc<Image>],
        heap: &'a mut Heap,
        namespaces: &'a mut Namespaces,
        bindings: &'a ExternalBindings,
        module_namespaces: &'a mut AHashMap<String, NamespaceId>,
        out: &'a mut dyn PrintWriter,
        limits: &'a ResourceLimits,
        tracer: &'a mut Tr,
        global: NamespaceId,
    ) -> Self {
        Self {
            images,
            heap,
            namespaces,
            bindings,
            module_namespaces,
            out,
            limits,
            tracer,
            global,
            image: 0,
            module: Rc::from(""),
            module_is_entry: false,
            ip: 0,
            registers: EMPTY_REGISTERS,
            current_ns: global,
            ns_stack: Vec::new(),
            loop_stack: Vec::new(),
            when_stack: Vec::new(),
            anchor: 0,
            line: 0,
            column: 0,
            call_depth: 0,
            entry_ns: None,
            method_ctx: None,
            pending_super: None,
        }
    }

    /// Namespace of the entry module of the last [`Self::run_image`].
    #[must_use]
    pub fn entry_namespace(&self) -> Option<NamespaceId> {
        self.entry_ns
    }

    /// Executes every module block of `image_index`, returning the entry
    /// module's final statement value.
    pub fn run_image(&mut self, image_index: usize) -> QuillResult<Value> {
        self.image = image_index;
        self.ip = self.images[image_index].code_start;
        self.current_ns = self.global;
        let mut result = Value::Null;
        loop {
            match self.execute()? {
                Signal::Module => {
                    if self.module_is_entry {
                        result = self.registers[Register::Value.index()].clone();
                    }
                }
                Signal::EndOfImage => return Ok(result),
                Signal::Exec | Signal::Func => {
                    return Err(self.error(ErrorCode::UnknownOpcode, "unbalanced execution marker"));
                }
            }
        }
    }

    /// Invokes a named function declared in `ns` with the given
    /// arguments. Entry point for the embedding `invoke` API.
    pub fn invoke(&mut self, ns: NamespaceId, name: &str, args: GatheredArgs) -> QuillResult<Value> {
        let Some(found) = self.namespaces.resolve(ns, name) else {
            return Err(self.error(ErrorCode::Undefined, format!("undefined function `{name}`")));
        };
        let value = self.read_declaration(found, name)?;
        self.call_value(value, args)
    }

    // --- byte access ------------------------------------------------------

    fn bytes_at(&self, pos: usize) -> Option<u8> {
        self.images[self.image].bytes.get(pos).copied()
    }

    fn read_u8(&mut self) -> QuillResult<u8> {
        match self.bytes_at(self.ip) {
            Some(byte) => {
                self.ip += 1;
                Ok(byte)
            }
            None => Err(self.error(ErrorCode::UnknownOpcode, "unexpected end of bytecode")),
        }
    }

    fn read_u16(&mut self) -> QuillResult<u16> {
        let hi = self.read_u8()?;
        let lo = self.read_u8()?;
        Ok(u16::from_be_bytes([hi, lo]))
    }

    fn read_i16(&mut self) -> QuillResult<i16> {
        let hi = self.read_u8()?;
        let lo = self.read_u8()?;
        Ok(i16::from_be_bytes([hi, lo]))
    }

    fn read_short_str(&mut self) -> QuillResult<String> {
        let len = self.read_u8()? as usize;
        let start = self.ip;
        let end = start + len;
        let image = &self.images[self.image];
        let Some(raw) = image.bytes.get(start..end) else {
            return Err(self.error(ErrorCode::UnknownOpcode, "unexpected end of bytecode"));
        };
        let text = std::str::from_utf8(raw)
            .map_err(|_| self.error(ErrorCode::UnknownOpcode, "invalid UTF-8 in bytecode"))?
            .to_owned();
        self.ip = end;
        Ok(text)
    }

    fn const_str(&self, idx: u16) -> QuillResult<String> {
        self.images[self.image]
            .consts
            .get_str(idx)
            .map(str::to_owned)
            .ok_or_else(|| self.error(ErrorCode::UnknownOpcode, format!("dangling string constant {idx}")))
    }

    fn const_int(&self, idx: u16) -> QuillResult<i64> {
        self.images[self.image]
            .consts
            .get_int(idx)
            .ok_or_else(|| self.error(ErrorCode::UnknownOpcode, format!("dangling int constant {idx}")))
    }

    fn const_float(&self, idx: u16) -> QuillResult<f64> {
        self.images[self.image]
            .consts
            .get_float(idx)
            .ok_or_else(|| self.error(ErrorCode::UnknownOpcode, format!("dangling float constant {idx}")))
    }

    fn error(&self, code: ErrorCode, message: impl Into<String>) -> QuillError {
        QuillError::new(code, message, self.line, self.column, 0, 0).in_module(&self.module)
    }

    fn locate(&self, mut err: QuillError) -> QuillError {
        if err.line == 0 {
            err.line = self.line;
            err.column = self.column;
        }
        err.in_module(&self.module)
    }

    fn check_cancelled(&self) -> QuillResult<()> {
        if self.limits.is_cancelled() {
            return Err(self.error(ErrorCode::Cancelled, "execution cancelled by host"));
        }
        Ok(())
    }

    fn value_reg(&self) -> Value {
        self.registers[Register::Value.index()].clone()
    }

    fn set_value(&mut self, value: Value) {
        self.registers[Register::Value.index()] = value;
    }

    fn reg(&self, register: Register) -> Value {
        self.registers[register.index()].clone()
    }

    // --- sub-program execution --------------------------------------------

    /// Runs the stream at the current ip in a fresh register window until
    /// `endOfExec`, returning the value it produced.
    fn exec_sub(&mut self) -> QuillResult<Value> {
        let saved = std::mem::replace(&mut self.registers, EMPTY_REGISTERS);
        let result = self.execute();
        let value = self.value_reg();
        self.registers = saved;
        match result? {
            Signal::Exec => Ok(value),
            _ => Err(self.error(ErrorCode::UnknownOpcode, "sub-program missing endOfExec")),
        }
    }

    /// Executes a stored byte range (late initializer, parameter default,
    /// captured redirect argument) under `ns`, returning its value.
    fn exec_ref_expr(&mut self, code: &CodeRef, ns: NamespaceId) -> QuillResult<Value> {
        self.with_context(code, ns, |vm| {
            let signal = vm.execute()?;
            if signal != Signal::Exec {
                return Err(vm.error(ErrorCode::UnknownOpcode, "stored range missing endOfExec"));
            }
            Ok(vm.value_reg())
        })
    }

    /// Executes a function body range under `ns` until `endOfFunc`.
    fn exec_ref_body(&mut self, code: &CodeRef, ns: NamespaceId) -> QuillResult<Value> {
        self.with_context(code, ns, |vm| {
            let signal = vm.execute()?;
            if signal != Signal::Func {
                return Err(vm.error(ErrorCode::UnknownOpcode, "function body missing endOfFunc"));
            }
            Ok(vm.value_reg())
        })
    }

    /// Saves the full execution context, switches to `code` under `ns`,
    /// runs `body`, then restores everything.
    fn with_context<T>(
        &mut self,
        code: &CodeRef,
        ns: NamespaceId,
        body: impl FnOnce(&mut Self) -> QuillResult<T>,
    ) -> QuillResult<T> {
        let saved_image = self.image;
        let saved_module = Rc::clone(&self.module);
        let saved_ip = self.ip;
        let saved_ns = self.current_ns;
        let saved_ns_stack = std::mem::take(&mut self.ns_stack);
        let saved_loops = std::mem::take(&mut self.loop_stack);
        let saved_whens = std::mem::take(&mut self.when_stack);
        let saved_registers = std::mem::replace(&mut self.registers, EMPTY_REGISTERS);
        let saved_anchor = self.anchor;
        let saved_line = self.line;
        let saved_column = self.column;

        self.image = code.image;
        self.module = Rc::clone(&code.module);
        self.ip = code.offset;
        self.current_ns = ns;
        self.line = code.line;
        self.column = code.column;

        let result = body(self);

        self.image = saved_image;
        self.module = saved_module;
        self.ip = saved_ip;
        self.current_ns = saved_ns;
        self.ns_stack = saved_ns_stack;
        self.loop_stack = saved_loops;
        self.when_stack = saved_whens;
        self.registers = saved_registers;
        self.anchor = saved_anchor;
        self.line = saved_line;
        self.column = saved_column;
        result
    }

    // --- dispatch loop ----------------------------------------------------

    fn execute(&mut self) -> QuillResult<Signal> {
        loop {
            if self.bytes_at(self.ip).is_none() {
                return Ok(Signal::EndOfImage);
            }
            let at = self.ip;
            let byte = self.read_u8()?;
            let Some(op) = Opcode::decode(byte) else {
                return Err(self.error(ErrorCode::UnknownOpcode, format!("unknown opcode byte {byte}")));
            };
            self.tracer.on_instruction(at, op, self.call_depth);
            match op {
                Opcode::LineInfo => {
                    self.line = u32::from(self.read_u16()?);
                    self.column = u32::from(self.read_u16()?);
                }
                Opcode::Module => {
                    let key = self.read_short_str()?;
                    self.module_is_entry = self.read_u8()? != 0;
                    self.module = Rc::from(key.as_str());
                    let ns = self.namespaces.create(key.clone(), Some(self.global));
                    self.module_namespaces.insert(key, ns);
                    self.current_ns = ns;
                    if self.module_is_entry {
                        self.entry_ns = Some(ns);
                    }
                    self.tracer.on_module(&self.module);
                }
                Opcode::EndOfModule => return Ok(Signal::Module),
                Opcode::EndOfExec => return Ok(Signal::Exec),
                Opcode::EndOfFunc => return Ok(Signal::Func),
                Opcode::EndOfStmt => {}
                Opcode::Local => self.op_local()?,
                Opcode::Register => {
                    let idx = self.read_u8()?;
                    let Some(register) = Register::decode(idx) else {
                        return Err(self.error(ErrorCode::UnknownOpcode, format!("unknown register {idx}")));
                    };
                    self.registers[register.index()] = self.value_reg();
                }
                Opcode::Assign => {
                    let idx = self.read_u16()?;
                    let name = self.const_str(idx)?;
                    let value = self.value_reg();
                    self.namespaces
                        .assign(self.current_ns, &name, value)
                        .map_err(|e| self.locate(e))?;
                }
                Opcode::MemberGet => {
                    let idx = self.read_u16()?;
                    let name = self.const_str(idx)?;
                    let object = self.reg(Register::PostfixObject);
                    self.registers[Register::PostfixKey.index()] = Value::str(&name);
                    let value = self.member_get(object, &name)?;
                    self.set_value(value);
                }
                Opcode::MemberSet => {
                    let idx = self.read_u16()?;
                    let name = self.const_str(idx)?;
                    let object = self.reg(Register::PostfixObject);
                    let value = self.exec_sub()?;
                    self.member_set(object, &name, value.clone())?;
                    self.set_value(value);
                }
                Opcode::SubGet => {
                    let object = self.reg(Register::PostfixObject);
                    let key = self.exec_sub()?;
                    let value = self.sub_get(object, key)?;
                    self.set_value(value);
                }
                Opcode::SubSet => {
                    let object = self.reg(Register::PostfixObject);
                    let key = self.exec_sub()?;
                    let value = self.exec_sub()?;
                    self.sub_set(object, key, value.clone())?;
                    self.set_value(value);
                }
                Opcode::Call => {
                    self.check_cancelled()?;
                    let callee = self.value_reg();
                    let args = self.gather_args()?;
                    let result = self.call_value(callee, args)?;
                    self.set_value(result);
                }
                Opcode::Block => {
                    let idx = self.read_u16()?;
                    let name = self.const_str(idx)?;
                    self.ns_stack.push(self.current_ns);
                    self.current_ns = self.namespaces.create(name, Some(self.current_ns));
                }
                Opcode::EndOfBlock => {
                    let Some(outer) = self.ns_stack.pop() else {
                        return Err(self.error(ErrorCode::UnknownOpcode, "unbalanced endOfBlock"));
                    };
                    self.current_ns = outer;
                }
                Opcode::LoopPoint => {
                    self.check_cancelled()?;
                    let base = at;
                    let break_off = self.read_u16()? as usize;
                    let continue_off = self.read_u16()? as usize;
                    self.loop_stack.push(LoopInfo {
                        break_ip: base + break_off,
                        continue_ip: base + continue_off,
                        ns_depth: self.ns_stack.len(),
                        when_depth: self.when_stack.len(),
                        ns: self.current_ns,
                    });
                }
                Opcode::WhileStmt => {
                    self.check_cancelled()?;
                    if !self.value_reg().is_truthy() {
                        let info = self
                            .loop_stack
                            .pop()
                            .ok_or_else(|| self.error(ErrorCode::UnknownOpcode, "whileStmt outside loop"))?;
                        self.ip = info.break_ip;
                        self.ns_stack.truncate(info.ns_depth);
                        self.current_ns = info.ns;
                    }
                }
                Opcode::DoStmt => {
                    let back = self.read_i16()?;
                    if self.value_reg().is_truthy() {
                        self.jump(back)?;
                    } else {
                        self.loop_stack.pop();
                    }
                }
                Opcode::IfStmt => {
                    self.check_cancelled()?;
                    let over_then = self.read_u16()? as usize;
                    if !self.value_reg().is_truthy() {
                        self.ip += over_then;
                    }
                }
                Opcode::Skip => {
                    let offset = self.read_i16()?;
                    self.jump(offset)?;
                }
                Opcode::Anchor => self.anchor = self.ip,
                Opcode::Goto => {
                    let offset = self.read_u16()? as usize;
                    let base = self
                        .when_stack
                        .pop()
                        .ok_or_else(|| self.error(ErrorCode::UnknownOpcode, "goto outside of a when branch"))?;
                    self.ip = base + offset;
                }
                Opcode::WhenStmt => self.op_when()?,
                Opcode::BreakLoop => {
                    let info = self
                        .loop_stack
                        .pop()
                        .ok_or_else(|| self.error(ErrorCode::Unsupported, "break outside of a loop"))?;
                    self.ip = info.break_ip;
                    self.ns_stack.truncate(info.ns_depth);
                    self.when_stack.truncate(info.when_depth);
                    self.current_ns = info.ns;
                }
                Opcode::ContinueLoop => {
                    let info = *self
                        .loop_stack
                        .last()
                        .ok_or_else(|| self.error(ErrorCode::Unsupported, "continue outside of a loop"))?;
                    self.ip = info.continue_ip;
                    self.ns_stack.truncate(info.ns_depth);
                    self.when_stack.truncate(info.when_depth);
                    self.current_ns = info.ns;
                }
                Opcode::VarDecl => {
                    let declaration = self.op_var_decl(self.current_ns)?;
                    self.namespaces
                        .define(self.current_ns, declaration, false)
                        .map_err(|e| self.locate(e))?;
                }
                Opcode::FuncDecl => self.op_func_decl()?,
                Opcode::ClassDecl => self.op_class_decl()?,
                Opcode::StructDecl => self.op_struct_decl()?,
                Opcode::TypeAliasDecl => {
                    let name_idx = self.read_u16()?;
                    let name = self.const_str(name_idx)?;
                    let target_idx = self.read_u16()?;
                    let target = self.const_str(target_idx)?;
                    let nullable = self.read_u8()? != 0;
                    let declaration = Declaration::with_value(
                        name,
                        Modifiers::default(),
                        Value::Type(TypeValue {
                            name: Rc::from(target.as_str()),
                            nullable,
                        }),
                    );
                    self.namespaces
                        .define(self.current_ns, declaration, false)
                        .map_err(|e| self.locate(e))?;
                }
                Opcode::ImportDecl => self.op_import_decl()?,
                Opcode::LogicalOr => {
                    let len = self.read_u16()? as usize;
                    if self.reg(Register::OrLeft).is_truthy() {
                        self.ip += len;
                        self.set_value(Value::Bool(true));
                    } else {
                        let right = self.exec_sub()?;
                        self.set_value(Value::Bool(right.is_truthy()));
                    }
                }
                Opcode::LogicalAnd => {
                    let len = self.read_u16()? as usize;
                    if self.reg(Register::AndLeft).is_truthy() {
                        let right = self.exec_sub()?;
                        self.set_value(Value::Bool(right.is_truthy()));
                    } else {
                        self.ip += len;
                        self.set_value(Value::Bool(false));
                    }
                }
                Opcode::Equal | Opcode::NotEqual => {
                    let left = self.reg(Register::EqualLeft);
                    let right = self.value_reg();
                    let equal = left.equals(&right, self.heap);
                    self.set_value(Value::Bool(if op == Opcode::Equal { equal } else { !equal }));
                }
                Opcode::Lesser | Opcode::Greater | Opcode::LesserOrEqual | Opcode::GreaterOrEqual => {
                    let left = self.reg(Register::RelationLeft);
                    let right = self.value_reg();
                    let result = self.compare(op, &left, &right)?;
                    self.set_value(Value::Bool(result));
                }
                Opcode::Add | Opcode::Subtract => {
                    let left = self.reg(Register::AddLeft);
                    let right = self.value_reg();
                    let result = self.arithmetic(op, left, right)?;
                    self.set_value(result);
                }
                Opcode::Multiply | Opcode::Divide | Opcode::Modulo => {
                    let left = self.reg(Register::MultiplyLeft);
                    let right = self.value_reg();
                    let result = self.arithmetic(op, left, right)?;
                    self.set_value(result);
                }
                Opcode::Negative => {
                    let value = self.value_reg();
                    let result = match value {
                        Value::Int(v) => Value::Int(-v),
                        Value::Float(v) => Value::Float(-v),
                        other => {
                            return Err(self.error(
                                ErrorCode::Unsupported,
                                format!("cannot negate {}", other.type_name(self.heap)),
                            ));
                        }
                    };
                    self.set_value(result);
                }
                Opcode::LogicalNot => {
                    let value = self.value_reg();
                    self.set_value(Value::Bool(!value.is_truthy()));
                }
                Opcode::TypeAs => {
                    let operand = self.reg(Register::RelationLeft);
                    let Value::Type(ty) = self.value_reg() else {
                        return Err(self.error(ErrorCode::TypeCast, "cast target is not a type"));
                    };
                    let ty = self.resolve_type_alias(ty);
                    let result = self.type_cast(operand, &ty)?;
                    self.set_value(result);
                }
                Opcode::TypeIs | Opcode::TypeIsNot => {
                    let operand = self.reg(Register::RelationLeft);
                    let Value::Type(ty) = self.value_reg() else {
                        return Err(self.error(ErrorCode::TypeCast, "type check target is not a type"));
                    };
                    let ty = self.resolve_type_alias(ty);
                    let matches = self.type_matches(&operand, &ty);
                    self.set_value(Value::Bool(if op == Opcode::TypeIs { matches } else { !matches }));
                }
                Opcode::TypeOf => {
                    let value = self.value_reg();
                    let name = value.type_name(self.heap);
                    self.set_value(Value::Type(TypeValue {
                        name,
                        nullable: false,
                    }));
                }
                Opcode::Signature | Opcode::Version | Opcode::ConstTable => {
                    return Err(self.error(ErrorCode::UnknownOpcode, format!("{op} inside instruction stream")));
                }
            }
        }
    }

    fn jump(&mut self, offset: i16) -> QuillResult<()> {
        let target = i64::try_from(self.ip).expect("ip fits i64") + i64::from(offset);
        self.ip = usize::try_from(target).map_err(|_| self.error(ErrorCode::UnknownOpcode, "jump out of range"))?;
        Ok(())
    }

    // --- local values -----------------------------------------------------

    fn op_local(&mut self) -> QuillResult<()> {
        let subtype_byte = self.read_u8()?;
        let Some(subtype) = LocalType::decode(subtype_byte) else {
            return Err(self.error(ErrorCode::UnknownOpcode, format!("unknown local subtype {subtype_byte}")));
        };
        match subtype {
            LocalType::Null => self.set_value(Value::Null),
            LocalType::Boolean => {
                let value = self.read_u8()? != 0;
                self.set_value(Value::Bool(value));
            }
            LocalType::ConstInt => {
                let idx = self.read_u16()?;
                let value = self.const_int(idx)?;
                self.set_value(Value::Int(value));
            }
            LocalType::ConstFloat => {
                let idx = self.read_u16()?;
                let value = self.const_float(idx)?;
                self.set_value(Value::Float(value));
            }
            LocalType::ConstString => {
                let idx = self.read_u16()?;
                let value = self.const_str(idx)?;
                self.set_value(Value::str(&value));
            }
            LocalType::StringInterpolation => {
                let idx = self.read_u16()?;
                let text = self.const_str(idx)?;
                let count = self.read_u8()?;
                let mut rendered = text;
                for i in 0..count {
                    let segment = self.exec_sub()?;
                    let shown = segment.display(self.heap);
                    rendered = rendered.replace(&format!("{{{i}}}"), &shown);
                }
                self.set_value(Value::str(&rendered));
            }
            LocalType::Identifier => {
                let idx = self.read_u16()?;
                let name = self.const_str(idx)?;
                self.registers[Register::Identifier.index()] = Value::str(&name);
                let value = self.load_identifier(&name)?;
                self.set_value(value);
            }
            LocalType::Group => {
                let value = self.exec_sub()?;
                self.set_value(value);
            }
            LocalType::List => {
                let count = self.read_u16()?;
                let mut items = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    items.push(self.exec_sub()?);
                }
                let id = self.heap.alloc(HeapData::List(items));
                self.set_value(Value::Ref(id));
            }
            LocalType::Struct => {
                let id = if self.read_u8()? != 0 {
                    let idx = self.read_u16()?;
                    Some(self.const_str(idx)?)
                } else {
                    None
                };
                let prototype = if self.read_u8()? != 0 {
                    let idx = self.read_u16()?;
                    let name = self.const_str(idx)?;
                    Some(self.resolve_struct(&name)?)
                } else {
                    None
                };
                let count = self.read_u16()?;
                let mut object = StructObject::new(id, prototype);
                for _ in 0..count {
                    let key = self.read_short_str()?;
                    let value = self.exec_sub()?;
                    object.set(key, value);
                }
                let heap_id = self.heap.alloc(HeapData::Struct(object));
                self.set_value(Value::Ref(heap_id));
            }
            LocalType::Function => {
                let function = self.decode_function(self.current_ns)?;
                let id = self.heap.alloc(HeapData::Function(function));
                self.set_value(Value::Ref(id));
            }
            LocalType::Type => {
                let idx = self.read_u16()?;
                let name = self.const_str(idx)?;
                let nullable = self.read_u8()? != 0;
                self.set_value(Value::Type(TypeValue {
                    name: Rc::from(name.as_str()),
                    nullable,
                }));
            }
        }
        Ok(())
    }

    fn resolve_struct(&mut self, name: &str) -> QuillResult<HeapId> {
        let value = self.load_identifier(name)?;
        match value {
            Value::Ref(id) if matches!(self.heap.get(id), HeapData::Struct(_)) => Ok(id),
            _ => Err(self.error(ErrorCode::Undefined, format!("`{name}` is not a struct prototype"))),
        }
    }

    fn load_identifier(&mut self, name: &str) -> QuillResult<Value> {
        if name == "super" {
            let Some(ctx) = self.method_ctx else {
                return Err(self.error(ErrorCode::Undefined, "`super` outside of a method"));
            };
            self.pending_super = Some(ctx.level + 1);
            return Ok(Value::Ref(ctx.instance));
        }
        let Some(ns) = self.namespaces.resolve(self.current_ns, name) else {
            return Err(self.error(ErrorCode::Undefined, format!("undefined symbol `{name}`")));
        };
        self.read_declaration(ns, name)
    }

    /// Reads a declaration's value, firing a pending late initializer on
    /// first read.
    fn read_declaration(&mut self, ns: NamespaceId, name: &str) -> QuillResult<Value> {
        let declaration = self
            .namespaces
            .get(ns)
            .get(name)
            .ok_or_else(|| self.error(ErrorCode::Undefined, format!("undefined symbol `{name}`")))?;
        if declaration.initialized || declaration.late_init.is_none() {
            return Ok(declaration.value.clone());
        }
        // fire once; mark initialized first so self-reference terminates
        let late = {
            let declaration = self.namespaces.get_mut(ns).get_mut(name).expect("checked above");
            declaration.initialized = true;
            declaration.late_init.take().expect("checked above")
        };
        let value = self.exec_ref_expr(&late.code, late.namespace).map_err(|mut e| {
            if e.code == ErrorCode::Undefined {
                e.code = ErrorCode::NotInitialized;
            }
            e
        })?;
        let declaration = self.namespaces.get_mut(ns).get_mut(name).expect("checked above");
        declaration.value = value.clone();
        Ok(value)
    }

    // --- when -------------------------------------------------------------

    fn op_when(&mut self) -> QuillResult<()> {
        let base = self.anchor;
        let has_subject = self.read_u8()? != 0;
        let case_count = self.read_u8()? as usize;
        let mut branch_offsets = Vec::with_capacity(case_count);
        for _ in 0..case_count {
            branch_offsets.push(self.read_u16()? as usize);
        }
        let else_offset = self.read_u16()?;
        let end_offset = self.read_u16()? as usize;
        let subject = if has_subject { Some(self.value_reg()) } else { None };

        for offset in branch_offsets {
            let case_value = self.exec_sub()?;
            let matched = match &subject {
                Some(subject) => subject.equals(&case_value, self.heap),
                None => case_value.is_truthy(),
            };
            if matched {
                // the branch's terminating goto pops this base
                self.when_stack.push(base);
                self.ip = base + offset;
                return Ok(());
            }
        }
        if else_offset == WHEN_NO_ELSE {
            self.ip = base + end_offset;
        } else {
            self.when_stack.push(base);
            self.ip = base + else_offset as usize;
        }
        Ok(())
    }

    // --- declarations -----------------------------------------------------

    /// Decodes a `varDecl` payload into a declaration. Inline
    /// initializers evaluate immediately; stored ones become late
    /// initializers capturing `capture_ns`.
    fn op_var_decl(&mut self, capture_ns: NamespaceId) -> QuillResult<Declaration> {
        let name_idx = self.read_u16()?;
        let name = self.const_str(name_idx)?;
        let flags = self.read_u8()?;
        let declared_type = if self.read_u8()? != 0 {
            let idx = self.read_u16()?;
            let _nullable = self.read_u8()? != 0;
            Some(self.const_str(idx)?)
        } else {
            None
        };
        let modifiers = Modifiers {
            is_external: flags & var_flags::EXTERNAL != 0,
            is_static: flags & var_flags::STATIC != 0,
            is_const: flags & var_flags::CONST != 0,
            is_mutable: flags & var_flags::MUTABLE != 0,
            is_exported: flags & var_flags::EXPORTED != 0,
            is_top_level: flags & var_flags::TOP_LEVEL != 0,
            late_initialize: flags & var_flags::LATE != 0,
        };
        let init_kind = self.read_u8()?;
        let mut declaration = match init_kind {
            INIT_NONE => {
                let mut declaration = Declaration::with_value(name, modifiers, Value::Null);
                declaration.initialized = !modifiers.late_initialize;
                declaration
            }
            INIT_INLINE => {
                let value = self.exec_sub()?;
                Declaration::with_value(name, modifiers, value)
            }
            INIT_STORED => {
                let line = u32::from(self.read_u16()?);
                let column = u32::from(self.read_u16()?);
                let length = self.read_u16()? as usize;
                let code = CodeRef {
                    image: self.image,
                    module: Rc::clone(&self.module),
                    offset: self.ip,
                    length,
                    line,
                    column,
                };
                self.ip += length;
                Declaration::late(
                    name,
                    modifiers,
                    LateInit {
                        code,
                        namespace: capture_ns,
                    },
                )
            }
            other => {
                return Err(self.error(ErrorCode::UnknownOpcode, format!("unknown initializer kind {other}")));
            }
        };
        declaration.declared_type = declared_type;
        Ok(declaration)
    }

    /// Decodes a `funcDecl` payload into a function value.
    fn decode_function(&mut self, closure: NamespaceId) -> QuillResult<Function> {
        let internal_idx = self.read_u16()?;
        let internal_name = self.const_str(internal_idx)?;
        let category_byte = self.read_u8()?;
        let Some(category) = FunctionCategory::from_byte(category_byte) else {
            return Err(self.error(ErrorCode::UnknownOpcode, format!("unknown function category {category_byte}")));
        };
        let flags = self.read_u8()?;
        let name = if self.read_u8()? != 0 {
            let idx = self.read_u16()?;
            Some(self.const_str(idx)?)
        } else {
            None
        };
        let min_arity = self.read_u8()?;
        let max_arity = self.read_u8()?;

        let param_count = self.read_u8()?;
        let mut params = IndexMap::with_capacity(param_count as usize);
        for _ in 0..param_count {
            let name_idx = self.read_u16()?;
            let param_name = self.const_str(name_idx)?;
            let pflags = self.read_u8()?;
            let declared_type = if pflags & param_flags::HAS_TYPE != 0 {
                let idx = self.read_u16()?;
                let _nullable = self.read_u8()? != 0;
                Some(self.const_str(idx)?)
            } else {
                None
            };
            let initializer = if pflags & param_flags::HAS_INIT != 0 {
                let line = u32::from(self.read_u16()?);
                let column = u32::from(self.read_u16()?);
                let length = self.read_u16()? as usize;
                let code = CodeRef {
                    image: self.image,
                    module: Rc::clone(&self.module),
                    offset: self.ip,
                    length,
                    line,
                    column,
                };
                self.ip += length;
                Some(code)
            } else {
                None
            };
            params.insert(
                param_name.clone(),
                ParamDef {
                    name: param_name,
                    declared_type,
                    initializer,
                    is_optional: pflags & param_flags::OPTIONAL != 0,
                    is_named: pflags & param_flags::NAMED != 0,
                    is_variadic: pflags & param_flags::VARIADIC != 0,
                },
            );
        }

        let redirect = if flags & func_flags::REDIRECT != 0 {
            let target = if self.read_u8()? == 0 {
                RedirectTarget::Super
            } else {
                RedirectTarget::This
            };
            let key = if self.read_u8()? != 0 {
                let idx = self.read_u16()?;
                Some(self.const_str(idx)?)
            } else {
                None
            };
            let positional_count = self.read_u8()?;
            let mut positional = Vec::with_capacity(positional_count as usize);
            for _ in 0..positional_count {
                positional.push(self.read_stored_range()?);
            }
            let named_count = self.read_u8()?;
            let mut named = Vec::with_capacity(named_count as usize);
            for _ in 0..named_count {
                let idx = self.read_u16()?;
                let arg_name = self.const_str(idx)?;
                named.push((arg_name, self.read_stored_range()?));
            }
            Some(RedirectRecord {
                target,
                key,
                positional,
                named,
            })
        } else {
            None
        };

        let entry = if self.read_u8()? != 0 {
            let line = u32::from(self.read_u16()?);
            let column = u32::from(self.read_u16()?);
            let length = self.read_u16()? as usize;
            let code = CodeRef {
                image: self.image,
                module: Rc::clone(&self.module),
                offset: self.ip,
                length,
                line,
                column,
            };
            self.ip += length;
            Some(code)
        } else {
            None
        };

        let is_external = flags & func_flags::EXTERNAL != 0;
        let external = if is_external {
            let lookup = name.as_deref().unwrap_or(&internal_name);
            Some(self.bindings.function(lookup).ok_or_else(|| {
                self.error(
                    ErrorCode::UndefinedExternal,
                    format!("external function `{lookup}` is not registered"),
                )
            })?)
        } else {
            None
        };

        let modifiers = Modifiers {
            is_external,
            is_static: flags & func_flags::STATIC != 0,
            is_exported: flags & func_flags::EXPORTED != 0,
            ..Modifiers::default()
        };

        Ok(Function {
            internal_name,
            name,
            category,
            owner_class: None,
            closure,
            params,
            min_arity,
            max_arity,
            is_variadic: flags & func_flags::VARIADIC != 0,
            modifiers,
            return_type: None,
            redirect,
            entry,
            external,
            external_typedef: None,
            bound_this: None,
        })
    }

    /// Reads a `u16`-length-prefixed stored sub-program, returning its
    /// byte range without executing it.
    fn read_stored_range(&mut self) -> QuillResult<CodeRef> {
        let length = self.read_u16()? as usize;
        let code = CodeRef {
            image: self.image,
            module: Rc::clone(&self.module),
            offset: self.ip,
            length,
            line: self.line,
            column: self.column,
        };
        self.ip += length;
        Ok(code)
    }

    fn op_func_decl(&mut self) -> QuillResult<()> {
        let function = self.decode_function(self.current_ns)?;
        let binding_name = function.name.clone().unwrap_or_else(|| function.internal_name.clone());
        let exported = function.modifiers.is_exported;
        let id = self.heap.alloc(HeapData::Function(function));
        let declaration = Declaration::with_value(
            binding_name,
            Modifiers {
                is_exported: exported,
                ..Modifiers::default()
            },
            Value::Ref(id),
        );
        self.namespaces
            .define(self.current_ns, declaration, false)
            .map_err(|e| self.locate(e))?;
        Ok(())
    }

    /// `classDecl`: builds the class, defines its binding, then runs the
    /// member stream in class mode, routing statics into the class
    /// namespace and instance members into the class's tables.
    fn op_class_decl(&mut self) -> QuillResult<()> {
        let name_idx = self.read_u16()?;
        let name = self.const_str(name_idx)?;
        let flags = self.read_u8()?;
        let super_class = if self.read_u8()? != 0 {
            let idx = self.read_u16()?;
            let super_name = self.const_str(idx)?;
            let value = self.load_identifier(&super_name)?;
            match value {
                Value::Ref(id) if self.heap.as_class(id).is_some() => Some(id),
                _ => {
                    return Err(self.error(
                        ErrorCode::Undefined,
                        format!("superclass `{super_name}` is not a class"),
                    ));
                }
            }
        } else {
            None
        };
        let mut generic_params = Vec::new();
        for _ in 0..self.read_u8()? {
            let idx = self.read_u16()?;
            generic_params.push(self.const_str(idx)?);
        }
        let mut implements = Vec::new();
        for _ in 0..self.read_u8()? {
            let idx = self.read_u16()?;
            implements.push(self.const_str(idx)?);
        }
        let mut mixes = Vec::new();
        for _ in 0..self.read_u8()? {
            let idx = self.read_u16()?;
            mixes.push(self.const_str(idx)?);
        }

        let class_ns = self.namespaces.create(name.clone(), Some(self.current_ns));
        let class = Class {
            name: name.clone(),
            super_class,
            generic_params,
            implements,
            mixes,
            is_external: flags & class_flags::EXTERNAL != 0,
            is_abstract: flags & class_flags::ABSTRACT != 0,
            is_enum: flags & class_flags::ENUM != 0,
            namespace: class_ns,
            fields: Vec::new(),
            methods: IndexMap::new(),
            ctors: IndexMap::new(),
            has_user_constructor: flags & class_flags::USER_CTOR != 0,
        };
        let class_id = self.heap.alloc(HeapData::Class(class));
        self.namespaces.get_mut(class_ns).class_id = Some(class_id);
        // bind the class name before the member stream so enumerator
        // initializers and statics can refer to it
        self.namespaces
            .define(
                self.current_ns,
                Declaration::with_value(name, Modifiers::default(), Value::Ref(class_id)),
                false,
            )
            .map_err(|e| self.locate(e))?;

        // member stream, terminated by endOfBlock
        loop {
            let byte = self.read_u8()?;
            let Some(op) = Opcode::decode(byte) else {
                return Err(self.error(ErrorCode::UnknownOpcode, format!("unknown opcode byte {byte}")));
            };
            match op {
                Opcode::EndOfBlock => break,
                Opcode::LineInfo => {
                    self.line = u32::from(self.read_u16()?);
                    self.column = u32::from(self.read_u16()?);
                }
                Opcode::VarDecl => {
                    let saved_ns = self.current_ns;
                    self.current_ns = class_ns;
                    let declaration = self.op_var_decl(class_ns);
                    self.current_ns = saved_ns;
                    let declaration = declaration?;
                    if declaration.modifiers.is_static {
                        self.namespaces
                            .define(class_ns, declaration, false)
                            .map_err(|e| self.locate(e))?;
                    } else {
                        let initializer = declaration.late_init.as_ref().map(|late| late.code.clone());
                        let field = FieldDef {
                            name: declaration.name.clone(),
                            modifiers: declaration.modifiers,
                            declared_type: declaration.declared_type.clone(),
                            initializer,
                        };
                        let HeapData::Class(class) = self.heap.get_mut(class_id) else {
                            unreachable!("allocated as class above");
                        };
                        class.fields.push(field);
                    }
                }
                Opcode::FuncDecl => {
                    let mut function = self.decode_function(class_ns)?;
                    function.owner_class = Some(class_id);
                    match function.category {
                        FunctionCategory::Constructor => {
                            let key = function
                                .internal_name
                                .strip_prefix("$construct")
                                .map(|rest| rest.trim_start_matches('.').to_owned())
                                .unwrap_or_default();
                            let fn_id = self.heap.alloc(HeapData::Function(function));
                            let HeapData::Class(class) = self.heap.get_mut(class_id) else {
                                unreachable!("allocated as class above");
                            };
                            class.ctors.insert(key, fn_id);
                        }
                        FunctionCategory::Getter | FunctionCategory::Setter => {
                            let key = function.internal_name.clone();
                            let fn_id = self.heap.alloc(HeapData::Function(function));
                            let HeapData::Class(class) = self.heap.get_mut(class_id) else {
                                unreachable!("allocated as class above");
                            };
                            class.methods.insert(key, fn_id);
                        }
                        FunctionCategory::Method if !function.modifiers.is_static => {
                            let key = function.name.clone().unwrap_or_else(|| function.internal_name.clone());
                            let fn_id = self.heap.alloc(HeapData::Function(function));
                            let HeapData::Class(class) = self.heap.get_mut(class_id) else {
                                unreachable!("allocated as class above");
                            };
                            class.methods.insert(key, fn_id);
                        }
                        _ => {
                            // statics, factories, and plain functions live in
                            // the class namespace
                            let binding_name =
                                function.name.clone().unwrap_or_else(|| function.internal_name.clone());
                            let fn_id = self.heap.alloc(HeapData::Function(function));
                            self.namespaces
                                .define(
                                    class_ns,
                                    Declaration::with_value(binding_name, Modifiers::default(), Value::Ref(fn_id)),
                                    false,
                                )
                                .map_err(|e| self.locate(e))?;
                        }
                    }
                }
                other => {
                    return Err(self.error(ErrorCode::UnknownOpcode, format!("{other} inside class body")));
                }
            }
        }
        Ok(())
    }

    fn op_struct_decl(&mut self) -> QuillResult<()> {
        let name_idx = self.read_u16()?;
        let name = self.const_str(name_idx)?;
        let prototype = if self.read_u8()? != 0 {
            let idx = self.read_u16()?;
            let proto_name = self.const_str(idx)?;
            Some(self.resolve_struct(&proto_name)?)
        } else {
            None
        };
        let count = self.read_u16()?;
        let mut object = StructObject::new(Some(name.clone()), prototype);
        for _ in 0..count {
            let key = self.read_short_str()?;
            let value = self.exec_sub()?;
            object.set(key, value);
        }
        let id = self.heap.alloc(HeapData::Struct(object));
        self.namespaces
            .define(
                self.current_ns,
                Declaration::with_value(name, Modifiers::default(), Value::Ref(id)),
                false,
            )
            .map_err(|e| self.locate(e))?;
        Ok(())
    }

    /// `importDecl`: the target module has already executed (module
    /// blocks are emitted dependency-first). A plain import merges the
    /// module's exported declarations; an aliased import binds a struct
    /// object holding them.
    fn op_import_decl(&mut self) -> QuillResult<()> {
        let key = self.read_short_str()?;
        let alias = if self.read_u8()? != 0 {
            let idx = self.read_u16()?;
            Some(self.const_str(idx)?)
        } else {
            None
        };
        let show_count = self.read_u8()?;
        let mut show = Vec::with_capacity(show_count as usize);
        for _ in 0..show_count {
            let idx = self.read_u16()?;
            show.push(self.const_str(idx)?);
        }
        let Some(&module_ns) = self.module_namespaces.get(&key) else {
            return Err(self.error(ErrorCode::MissingModule, format!("module `{key}` is not loaded")));
        };
        let exported: Vec<(String, Declaration)> = self
            .namespaces
            .get(module_ns)
            .iter()
            .filter(|(name, declaration)| {
                declaration.is_exported() && (show.is_empty() || show.iter().any(|s| s == *name))
            })
            .map(|(name, declaration)| (name.clone(), declaration.clone()))
            .collect();
        match alias {
            Some(alias) => {
                let mut object = StructObject::new(Some(alias.clone()), None);
                for (name, declaration) in exported {
                    object.set(name, declaration.value.clone());
                }
                let id = self.heap.alloc(HeapData::Struct(object));
                self.namespaces
                    .define(
                        self.current_ns,
                        Declaration::with_value(alias, Modifiers::default(), Value::Ref(id)),
                        false,
                    )
                    .map_err(|e| self.locate(e))?;
            }
            None => {
                for (_, declaration) in exported {
                    self.namespaces
                        .define(self.current_ns, declaration, true)
                        .map_err(|e| self.locate(e))?;
                }
            }
        }
        Ok(())
    }

    // --- calls ------------------------------------------------------------

    fn gather_args(&mut self) -> QuillResult<GatheredArgs> {
        let mut args = GatheredArgs::default();
        let positional_count = self.read_u8()?;
        for _ in 0..positional_count {
            args.positional.push(self.exec_sub()?);
        }
        let named_count = self.read_u8()?;
        for _ in 0..named_count {
            let name = self.read_short_str()?;
            let value = self.exec_sub()?;
            args.named.insert(name, value);
        }
        Ok(args)
    }

    /// Calls any callable value: a function, a class (constructor
    /// invocation), or a bound external.
    pub fn call_value(&mut self, callee: Value, args: GatheredArgs) -> QuillResult<Value> {
        match callee {
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Function(function) => {
                    // a constructor reached as a value (`Size.square(...)`)
                    // still allocates its instance
                    let create_instance =
                        function.category == FunctionCategory::Constructor && function.bound_this.is_none();
                    self.call_function(id, args, create_instance, None)
                }
                HeapData::Class(_) => self.construct(id, args),
                _ => Err(self.error(
                    ErrorCode::NotCallable,
                    format!("{} is not callable", callee.type_name(self.heap)),
                )),
            },
            Value::Null => Err(self.error(ErrorCode::NullObject, "call on null")),
            other => Err(self.error(
                ErrorCode::NotCallable,
                format!("{} is not callable", other.type_name(self.heap)),
            )),
        }
    }

    /// Constructor invocation through a class value.
    fn construct(&mut self, class_id: HeapId, args: GatheredArgs) -> QuillResult<Value> {
        let (is_abstract, has_user_ctor, unnamed_ctor, name) = {
            let class = self.heap.as_class(class_id).expect("checked by caller");
            (class.is_abstract, class.has_user_constructor, class.ctor(""), class.name.clone())
        };
        if is_abstract {
            return Err(self.error(ErrorCode::NotCallable, format!("cannot instantiate abstract class `{name}`")));
        }
        match unnamed_ctor {
            Some(ctor) => self.call_function(ctor, args, true, None),
            None if !has_user_ctor => {
                // default constructor: allocate and run field initializers
                if !args.positional.is_empty() || !args.named.is_empty() {
                    return Err(self.error(ErrorCode::Arity, "default constructor takes no arguments"));
                }
                let instance = self.instantiate(class_id)?;
                Ok(Value::Ref(instance))
            }
            None => Err(self.error(
                ErrorCode::Undefined,
                format!("class `{name}` has no unnamed constructor"),
            )),
        }
    }

    /// Allocates an instance: one namespace per inheritance level,
    /// derived-first, each enclosing its class's static namespace, with
    /// field initializers evaluated base-first.
    fn instantiate(&mut self, class_id: HeapId) -> QuillResult<HeapId> {
        let chain = Class::chain(class_id, self.heap);
        let mut level_namespaces = Vec::with_capacity(chain.len());
        for level_class in &chain {
            let class = self.heap.as_class(*level_class).expect("chain holds classes");
            let ns = self.namespaces.create(class.name.clone(), Some(class.namespace));
            level_namespaces.push(ns);
        }
        let instance = Instance {
            class: class_id,
            namespaces: level_namespaces.clone(),
            type_args: Vec::new(),
        };
        let instance_id = self.heap.alloc(HeapData::Instance(instance));

        // base-first so derived fields may rely on inherited state
        for (level, level_class) in chain.iter().enumerate().rev() {
            let fields: Vec<FieldDef> = self
                .heap
                .as_class(*level_class)
                .expect("chain holds classes")
                .fields
                .clone();
            let ns = level_namespaces[level];
            for field in fields {
                let value = match &field.initializer {
                    Some(code) => self.exec_ref_expr(code, ns)?,
                    None => Value::Null,
                };
                let mut declaration = Declaration::with_value(field.name.clone(), field.modifiers, value);
                declaration.declared_type = field.declared_type.clone();
                if !declaration.modifiers.is_mutable && !declaration.modifiers.is_const {
                    // plain field declarations stay assignable from methods
                    declaration.modifiers.is_mutable = true;
                }
                self.namespaces.define(ns, declaration, true).map_err(|e| self.locate(e))?;
            }
        }
        Ok(instance_id)
    }

    /// The function call protocol: arity validation, instance
    /// allocation for constructors, call-namespace creation, `this` and
    /// `super` binding, redirecting-constructor dispatch, parameter
    /// binding (positional, named, defaults, variadic packing), then
    /// transfer to the entry point.
    fn call_function(
        &mut self,
        fn_id: HeapId,
        args: GatheredArgs,
        create_instance: bool,
        existing_instance: Option<HeapId>,
    ) -> QuillResult<Value> {
        self.check_cancelled()?;
        let function = match self.heap.get(fn_id) {
            HeapData::Function(function) => function.clone(),
            _ => return Err(self.error(ErrorCode::NotCallable, "callee is not a function")),
        };

        if let Some(external) = &function.external {
            return self.call_external(&function, external.clone(), args);
        }

        if self.call_depth >= self.limits.max_recursion_depth {
            return Err(self.error(
                ErrorCode::StackOverflow,
                format!("recursion limit of {} exceeded", self.limits.max_recursion_depth),
            ));
        }

        // 1. arity
        if !function.accepts_positional(args.positional.len()) {
            return Err(self.error(
                ErrorCode::Arity,
                format!(
                    "`{}` expects {} to {} positional arguments, got {}",
                    function.internal_name,
                    function.min_arity,
                    if function.is_variadic {
                        "any number of".to_owned()
                    } else {
                        function.max_arity.to_string()
                    },
                    args.positional.len()
                ),
            ));
        }
        for name in args.named.keys() {
            if !function.params.contains_key(name) {
                return Err(self.error(
                    ErrorCode::NamedArg,
                    format!("`{}` has no parameter named `{name}`", function.internal_name),
                ));
            }
        }

        // 2. constructor instance allocation
        let mut instance = existing_instance;
        if instance.is_none()
            && function.category == FunctionCategory::Constructor
            && create_instance
        {
            let class_id = function
                .owner_class
                .ok_or_else(|| self.error(ErrorCode::Unsupported, "constructor without a class"))?;
            instance = Some(self.instantiate(class_id)?);
        }
        if instance.is_none()
            && let Some(Value::Ref(id)) = &function.bound_this
            && matches!(self.heap.get(*id), HeapData::Instance(_))
        {
            instance = Some(*id);
        }

        // 3. call namespace over the captured closure, or over the
        //    instance namespace of the defining class for methods
        let mut enclosing = function.closure;
        let mut method_ctx = None;
        if let (Some(instance_id), Some(owner)) = (instance, function.owner_class) {
            let (chain, namespaces) = {
                let inst = self.heap.as_instance(instance_id).expect("instance id");
                (Class::chain(inst.class, self.heap), inst.namespaces.clone())
            };
            let level = chain.iter().position(|c| *c == owner).unwrap_or(0);
            enclosing = namespaces[level];
            method_ctx = Some(MethodContext {
                instance: instance_id,
                level,
            });
        }
        let call_ns = self.namespaces.create(function.internal_name.clone(), Some(enclosing));

        // 4. this/super binding
        if let Some(ctx) = method_ctx {
            self.namespaces
                .define(
                    call_ns,
                    Declaration::with_value("this", Modifiers::default(), Value::Ref(ctx.instance)),
                    true,
                )
                .map_err(|e| self.locate(e))?;
        } else if let Some(receiver) = &function.bound_this {
            self.namespaces
                .define(
                    call_ns,
                    Declaration::with_value("this", Modifiers::default(), receiver.clone()),
                    true,
                )
                .map_err(|e| self.locate(e))?;
        }

        // 6. parameter binding (before the redirect so captured argument
        //    sub-programs can reference the parameters)
        self.bind_params(&function, args, call_ns)?;

        let saved_ctx = self.method_ctx;
        self.method_ctx = method_ctx;
        self.call_depth += 1;
        self.tracer.on_call(&function.internal_name, self.call_depth);

        // 5. redirecting constructor
        let result = (|| {
            if let Some(redirect) = &function.redirect {
                self.dispatch_redirect(&function, redirect, call_ns, instance)?;
            }
            // 7. transfer to the entry point
            match &function.entry {
                Some(code) => self.exec_ref_body(code, call_ns),
                None if function.redirect.is_some() => Ok(Value::Null),
                None => Err(self.error(
                    ErrorCode::Unsupported,
                    format!("`{}` has no body to execute", function.internal_name),
                )),
            }
        })();

        self.call_depth -= 1;
        self.method_ctx = saved_ctx;
        self.tracer.on_return(self.call_depth);

        let result = result.map_err(|mut e| {
            e.stack_trace
                .push(format!("{} ({}:{}:{})", function.internal_name, self.module, self.line, self.column));
            e
        })?;

        if create_instance && function.category == FunctionCategory::Constructor {
            let id = instance.expect("allocated above");
            return Ok(Value::Ref(id));
        }
        Ok(result)
    }

    fn bind_params(&mut self, function: &Function, args: GatheredArgs, call_ns: NamespaceId) -> QuillResult<()> {
        let GatheredArgs { positional, mut named } = args;
        let mut positional = positional.into_iter();
        let mut leftover: Vec<Value> = Vec::new();
        let params: Vec<ParamDef> = function.params.values().cloned().collect();

        for param in &params {
            if param.is_variadic {
                leftover.extend(positional.by_ref());
                let id = self.heap.alloc(HeapData::List(std::mem::take(&mut leftover)));
                self.define_param(call_ns, &param.name, Value::Ref(id))?;
                continue;
            }
            let value = if !param.is_named {
                positional.next()
            } else {
                None
            };
            let value = match value.or_else(|| named.swap_remove(&param.name)) {
                Some(value) => value,
                None => match &param.initializer {
                    Some(code) => self.exec_ref_expr(code, call_ns)?,
                    None => Value::Null,
                },
            };
            self.define_param(call_ns, &param.name, value)?;
        }
        Ok(())
    }

    fn define_param(&mut self, call_ns: NamespaceId, name: &str, value: Value) -> QuillResult<()> {
        let declaration = Declaration::with_value(
            name,
            Modifiers {
                is_mutable: true,
                ..Modifiers::default()
            },
            value,
        );
        self.namespaces.define(call_ns, declaration, true).map_err(|e| self.locate(e))
    }

    /// Redirecting-constructor dispatch: resolve the target constructor,
    /// evaluate the captured argument sub-programs in the redirecting
    /// call's closure, and invoke it against the same instance without
    /// allocating a new one.
    fn dispatch_redirect(
        &mut self,
        function: &Function,
        redirect: &RedirectRecord,
        call_ns: NamespaceId,
        instance: Option<HeapId>,
    ) -> QuillResult<()> {
        let owner = function
            .owner_class
            .ok_or_else(|| self.error(ErrorCode::Unsupported, "redirect outside of a constructor"))?;
        let target_class = match redirect.target {
            RedirectTarget::This => owner,
            RedirectTarget::Super => self
                .heap
                .as_class(owner)
                .and_then(|c| c.super_class)
                .ok_or_else(|| self.error(ErrorCode::Undefined, "no superclass to redirect to"))?,
        };
        let key = redirect.key.clone().unwrap_or_default();
        let target_ctor = self
            .heap
            .as_class(target_class)
            .and_then(|c| c.ctor(&key))
            .ok_or_else(|| {
                let class_name = self.heap.as_class(target_class).map_or_else(String::new, |c| c.name.clone());
                self.error(
                    ErrorCode::Undefined,
                    format!("no constructor `{key}` on `{class_name}`"),
                )
            })?;

        let mut args = GatheredArgs::default();
        for code in &redirect.positional {
            args.positional.push(self.exec_ref_expr(code, call_ns)?);
        }
        for (name, code) in &redirect.named {
            let value = self.exec_ref_expr(code, call_ns)?;
            args.named.insert(name.clone(), value);
        }
        self.call_function(target_ctor, args, false, instance)?;
        Ok(())
    }

    fn call_external(
        &mut self,
        function: &Function,
        callable: ExternalCallable,
        args: GatheredArgs,
    ) -> QuillResult<Value> {
        let receiver = function.bound_this.clone().unwrap_or(Value::Null);
        match callable {
            ExternalCallable::Builtin(builtin) => self.call_builtin(builtin, receiver, args),
            ExternalCallable::Structured(host_fn) => {
                let call_args = CallArguments {
                    positional: args.positional.into_vec(),
                    named: args.named,
                    type_args: Vec::new(),
                };
                let mut ctx = HostContext {
                    heap: self.heap,
                    out: self.out,
                };
                host_fn(&mut ctx, call_args)
                    .map_err(|message| self.error(ErrorCode::ExternalError, message))
            }
            ExternalCallable::Positional(host_fn) => {
                let mut ctx = HostContext {
                    heap: self.heap,
                    out: self.out,
                };
                host_fn(&mut ctx, args.positional.into_vec())
                    .map_err(|message| self.error(ErrorCode::ExternalError, message))
            }
            ExternalCallable::Method(host_fn) => {
                let call_args = CallArguments {
                    positional: args.positional.into_vec(),
                    named: args.named,
                    type_args: Vec::new(),
                };
                let mut ctx = HostContext {
                    heap: self.heap,
                    out: self.out,
                };
                host_fn(&mut ctx, &receiver, call_args)
                    .map_err(|message| self.error(ErrorCode::ExternalError, message))
            }
        }
    }

    fn call_builtin(&mut self, builtin: Builtin, receiver: Value, args: GatheredArgs) -> QuillResult<Value> {
        match builtin {
            Builtin::ToString => Ok(Value::str(&receiver.display(self.heap))),
            Builtin::ListAdd => {
                let Value::Ref(id) = receiver else {
                    return Err(self.error(ErrorCode::Unsupported, "add on non-list"));
                };
                let HeapData::List(items) = self.heap.get_mut(id) else {
                    return Err(self.error(ErrorCode::Unsupported, "add on non-list"));
                };
                items.extend(args.positional);
                Ok(Value::Null)
            }
            Builtin::ListContains => {
                let Value::Ref(id) = receiver else {
                    return Err(self.error(ErrorCode::Unsupported, "contains on non-list"));
                };
                let needle = args
                    .positional
                    .first()
                    .ok_or_else(|| self.error(ErrorCode::Arity, "contains expects one argument"))?;
                let HeapData::List(items) = self.heap.get(id) else {
                    return Err(self.error(ErrorCode::Unsupported, "contains on non-list"));
                };
                let found = items.iter().any(|item| item.equals(needle, self.heap));
                Ok(Value::Bool(found))
            }
            Builtin::ListElementAt => {
                let Value::Ref(id) = receiver else {
                    return Err(self.error(ErrorCode::Unsupported, "elementAt on non-list"));
                };
                let index = match args.positional.first() {
                    Some(Value::Int(i)) => *i,
                    _ => return Err(self.error(ErrorCode::SubGetKey, "elementAt expects an integer index")),
                };
                let HeapData::List(items) = self.heap.get(id) else {
                    return Err(self.error(ErrorCode::Unsupported, "elementAt on non-list"));
                };
                usize::try_from(index)
                    .ok()
                    .and_then(|i| items.get(i))
                    .cloned()
                    .ok_or_else(|| self.error(ErrorCode::OutOfRange, format!("index {index} out of range")))
            }
            Builtin::StructContainsKey => {
                let Value::Ref(id) = receiver else {
                    return Err(self.error(ErrorCode::Unsupported, "containsKey on non-struct"));
                };
                let key = match args.positional.first() {
                    Some(Value::Str(s)) => s.to_string(),
                    _ => return Err(self.error(ErrorCode::SubGetKey, "containsKey expects a string key")),
                };
                Ok(Value::Bool(StructObject::chain_contains(self.heap, id, &key)))
            }
            Builtin::StructKeys => {
                let Value::Ref(id) = receiver else {
                    return Err(self.error(ErrorCode::Unsupported, "keys on non-struct"));
                };
                let HeapData::Struct(object) = self.heap.get(id) else {
                    return Err(self.error(ErrorCode::Unsupported, "keys on non-struct"));
                };
                let keys: Vec<Value> = object.keys().map(Value::str).collect();
                let list = self.heap.alloc(HeapData::List(keys));
                Ok(Value::Ref(list))
            }
            Builtin::StructValues => {
                let Value::Ref(id) = receiver else {
                    return Err(self.error(ErrorCode::Unsupported, "values on non-struct"));
                };
                let HeapData::Struct(object) = self.heap.get(id) else {
                    return Err(self.error(ErrorCode::Unsupported, "values on non-struct"));
                };
                let values: Vec<Value> = object.values().cloned().collect();
                let list = self.heap.alloc(HeapData::List(values));
                Ok(Value::Ref(list))
            }
        }
    }

    fn builtin_method(&mut self, receiver: Value, name: &str, builtin: Builtin) -> Value {
        let type_name = receiver.type_name(self.heap);
        let function = Function {
            internal_name: format!("{type_name}.{name}"),
            name: Some(name.to_owned()),
            category: FunctionCategory::Method,
            owner_class: None,
            closure: self.global,
            params: IndexMap::new(),
            min_arity: 0,
            max_arity: u8::MAX,
            is_variadic: true,
            modifiers: Modifiers {
                is_external: true,
                ..Modifiers::default()
            },
            return_type: None,
            redirect: None,
            entry: None,
            external: Some(ExternalCallable::Builtin(builtin)),
            external_typedef: None,
            bound_this: Some(receiver),
        };
        let id = self.heap.alloc(HeapData::Function(function));
        Value::Ref(id)
    }

    // --- member access ----------------------------------------------------

    /// Member resolution. For instances: own namespace chain first (from
    /// the `super` level when one is pending), then the class chain's
    /// methods and getters, then the external-class delegate, then the
    /// universal builtins.
    fn member_get(&mut self, object: Value, name: &str) -> QuillResult<Value> {
        let super_level = self.pending_super.take();
        match &object {
            Value::Null => Err(self.error(ErrorCode::NullObject, format!("member `{name}` on null"))),
            Value::Ref(id) => {
                let id = *id;
                match self.heap.get(id) {
                    HeapData::Struct(_) => self.struct_member_get(id, name, object),
                    HeapData::Instance(_) => self.instance_member_get(id, name, super_level.unwrap_or(0)),
                    HeapData::Class(_) => self.class_member_get(id, name),
                    HeapData::List(items) => {
                        let len = i64::try_from(items.len()).unwrap_or(i64::MAX);
                        let is_empty = items.is_empty();
                        let first = items.first().cloned();
                        let last = items.last().cloned();
                        match name {
                            "length" => Ok(Value::Int(len)),
                            "isEmpty" => Ok(Value::Bool(is_empty)),
                            "isNotEmpty" => Ok(Value::Bool(!is_empty)),
                            "first" => Ok(first.unwrap_or(Value::Null)),
                            "last" => Ok(last.unwrap_or(Value::Null)),
                            "toString" => Ok(self.builtin_method(object, name, Builtin::ToString)),
                            "add" => Ok(self.builtin_method(object, name, Builtin::ListAdd)),
                            "contains" => Ok(self.builtin_method(object, name, Builtin::ListContains)),
                            "elementAt" => Ok(self.builtin_method(object, name, Builtin::ListElementAt)),
                            _ => Err(self.error(ErrorCode::UndefinedMember, format!("no member `{name}` on List"))),
                        }
                    }
                    HeapData::Function(_) => match name {
                        "toString" => Ok(self.builtin_method(object, name, Builtin::ToString)),
                        _ => {
                            Err(self.error(ErrorCode::UndefinedMember, format!("no member `{name}` on function")))
                        }
                    },
                }
            }
            Value::Str(s) => match name {
                "length" => Ok(Value::Int(i64::try_from(s.chars().count()).unwrap_or(i64::MAX))),
                "isEmpty" => Ok(Value::Bool(s.is_empty())),
                "isNotEmpty" => Ok(Value::Bool(!s.is_empty())),
                "toString" => Ok(self.builtin_method(object, name, Builtin::ToString)),
                _ => Err(self.error(ErrorCode::UndefinedMember, format!("no member `{name}` on str"))),
            },
            Value::Type(ty) => match name {
                "name" => Ok(Value::str(&ty.name)),
                "toString" => Ok(self.builtin_method(object, name, Builtin::ToString)),
                _ => Err(self.error(ErrorCode::UndefinedMember, format!("no member `{name}` on type"))),
            },
            Value::Bool(_) | Value::Int(_) | Value::Float(_) => match name {
                "toString" => Ok(self.builtin_method(object, name, Builtin::ToString)),
                _ => Err(self.error(
                    ErrorCode::UndefinedMember,
                    format!("no member `{name}` on {}", object.type_name(self.heap)),
                )),
            },
        }
    }

    fn struct_member_get(&mut self, id: HeapId, name: &str, object: Value) -> QuillResult<Value> {
        if let Some(value) = StructObject::chain_get(self.heap, id, name) {
            // field-stored functions bind the receiver on access
            if let Value::Ref(fn_id) = value
                && let HeapData::Function(function) = self.heap.get(fn_id)
            {
                let bound = function.bind(object);
                let bound_id = self.heap.alloc(HeapData::Function(bound));
                return Ok(Value::Ref(bound_id));
            }
            return Ok(value);
        }
        match name {
            "toString" => Ok(self.builtin_method(object, name, Builtin::ToString)),
            "keys" => Ok(self.builtin_method(object, name, Builtin::StructKeys)),
            "values" => Ok(self.builtin_method(object, name, Builtin::StructValues)),
            "containsKey" => Ok(self.builtin_method(object, name, Builtin::StructContainsKey)),
            "prototype" => {
                let HeapData::Struct(obj) = self.heap.get(id) else {
                    unreachable!("checked by caller");
                };
                Ok(obj.prototype.map_or(Value::Null, Value::Ref))
            }
            // missing struct members read as null, matching prototype
            // fall-through semantics
            _ => Ok(Value::Null),
        }
    }

    fn instance_member_get(&mut self, instance_id: HeapId, name: &str, start_level: usize) -> QuillResult<Value> {
        let (class_id, level_namespaces) = {
            let instance = self.heap.as_instance(instance_id).expect("caller checked");
            (instance.class, instance.namespaces.clone())
        };
        // (a) own fields, walking the namespace chain from start_level
        for ns in level_namespaces.iter().skip(start_level) {
            if self.namespaces.get(*ns).contains(name) {
                let value = self.read_declaration(*ns, name)?;
                if let Value::Ref(fn_id) = value
                    && let HeapData::Function(function) = self.heap.get(fn_id)
                {
                    let bound = function.bind(Value::Ref(instance_id));
                    let bound_id = self.heap.alloc(HeapData::Function(bound));
                    return Ok(Value::Ref(bound_id));
                }
                return Ok(value);
            }
        }
        // (b) methods and getters up the class chain
        let chain = Class::chain(class_id, self.heap);
        for level_class in chain.iter().skip(start_level) {
            let class = self.heap.as_class(*level_class).expect("chain holds classes");
            if let Some(method_id) = class.method(name) {
                let function = self.heap.as_function(method_id).expect("method table holds functions");
                let bound = function.bind(Value::Ref(instance_id));
                let bound_id = self.heap.alloc(HeapData::Function(bound));
                return Ok(Value::Ref(bound_id));
            }
            let getter_key = format!("$get.{name}");
            if let Some(getter_id) = class.method(&getter_key) {
                // property access invokes the getter immediately
                let function = self.heap.as_function(getter_id).expect("method table holds functions");
                let bound = function.bind(Value::Ref(instance_id));
                let bound_id = self.heap.alloc(HeapData::Function(bound));
                return self.call_function(bound_id, GatheredArgs::default(), false, Some(instance_id));
            }
        }
        // (c) external-class delegate
        let (is_external, class_name) = {
            let class = self.heap.as_class(class_id).expect("instance class");
            (class.is_external, class.name.clone())
        };
        if is_external
            && let Some(binding) = self.bindings.class(&class_name)
        {
            let mut ctx = HostContext {
                heap: self.heap,
                out: self.out,
            };
            return binding
                .instance_member_get(&mut ctx, &Value::Ref(instance_id), name)
                .map_err(|message| self.error(ErrorCode::ExternalError, message));
        }
        if name == "toString" {
            return Ok(self.builtin_method(Value::Ref(instance_id), name, Builtin::ToString));
        }
        Err(self.error(
            ErrorCode::UndefinedMember,
            format!("no member `{name}` on `{class_name}`"),
        ))
    }

    fn class_member_get(&mut self, class_id: HeapId, name: &str) -> QuillResult<Value> {
        let (ns, ctor, is_external, class_name) = {
            let class = self.heap.as_class(class_id).expect("caller checked");
            (class.namespace, class.ctor(name), class.is_external, class.name.clone())
        };
        if self.namespaces.get(ns).contains(name) {
            return self.read_declaration(ns, name);
        }
        if let Some(ctor_id) = ctor {
            return Ok(Value::Ref(ctor_id));
        }
        if is_external
            && let Some(binding) = self.bindings.class(&class_name)
        {
            let mut ctx = HostContext {
                heap: self.heap,
                out: self.out,
            };
            return binding
                .member_get(&mut ctx, name)
                .map_err(|message| self.error(ErrorCode::ExternalError, message));
        }
        match name {
            "name" => Ok(Value::str(&class_name)),
            "toString" => Ok(self.builtin_method(Value::Ref(class_id), name, Builtin::ToString)),
            _ => Err(self.error(
                ErrorCode::UndefinedMember,
                format!("no static member `{name}` on `{class_name}`"),
            )),
        }
    }

    fn member_set(&mut self, object: Value, name: &str, value: Value) -> QuillResult<()> {
        match object {
            Value::Null => Err(self.error(ErrorCode::NullObject, format!("member `{name}` on null"))),
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Struct(_) => {
                    let HeapData::Struct(object) = self.heap.get_mut(id) else {
                        unreachable!("matched above");
                    };
                    object.set(name, value);
                    Ok(())
                }
                HeapData::Instance(_) => self.instance_member_set(id, name, value),
                HeapData::Class(_) => {
                    let (ns, is_external, class_name) = {
                        let class = self.heap.as_class(id).expect("matched above");
                        (class.namespace, class.is_external, class.name.clone())
                    };
                    if self.namespaces.get(ns).contains(name) {
                        return self.namespaces.assign(ns, name, value).map_err(|e| self.locate(e));
                    }
                    if is_external
                        && let Some(binding) = self.bindings.class(&class_name)
                    {
                        let mut ctx = HostContext {
                            heap: self.heap,
                            out: self.out,
                        };
                        return binding
                            .member_set(&mut ctx, name, value)
                            .map_err(|message| self.error(ErrorCode::ExternalError, message));
                    }
                    Err(self.error(
                        ErrorCode::UndefinedMember,
                        format!("no static member `{name}` on `{class_name}`"),
                    ))
                }
                _ => Err(self.error(
                    ErrorCode::UndefinedMember,
                    format!("cannot set member `{name}` on {}", object.type_name(self.heap)),
                )),
            },
            other => Err(self.error(
                ErrorCode::UndefinedMember,
                format!("cannot set member `{name}` on {}", other.type_name(self.heap)),
            )),
        }
    }

    fn instance_member_set(&mut self, instance_id: HeapId, name: &str, value: Value) -> QuillResult<()> {
        let (class_id, level_namespaces) = {
            let instance = self.heap.as_instance(instance_id).expect("caller checked");
            (instance.class, instance.namespaces.clone())
        };
        for ns in &level_namespaces {
            if self.namespaces.get(*ns).contains(name) {
                return self.namespaces.assign(*ns, name, value).map_err(|e| self.locate(e));
            }
        }
        // setter up the class chain
        let chain = Class::chain(class_id, self.heap);
        let setter_key = format!("$set.{name}");
        for level_class in &chain {
            let setter = self.heap.as_class(*level_class).expect("chain holds classes").method(&setter_key);
            if let Some(setter_id) = setter {
                let function = self.heap.as_function(setter_id).expect("method table holds functions");
                let bound = function.bind(Value::Ref(instance_id));
                let bound_id = self.heap.alloc(HeapData::Function(bound));
                let mut args = GatheredArgs::default();
                args.positional.push(value);
                self.call_function(bound_id, args, false, Some(instance_id))?;
                return Ok(());
            }
        }
        // external-class delegate
        let (is_external, class_name) = {
            let class = self.heap.as_class(class_id).expect("instance class");
            (class.is_external, class.name.clone())
        };
        if is_external
            && let Some(binding) = self.bindings.class(&class_name)
        {
            let mut ctx = HostContext {
                heap: self.heap,
                out: self.out,
            };
            return binding
                .instance_member_set(&mut ctx, &Value::Ref(instance_id), name, value)
                .map_err(|message| self.error(ErrorCode::ExternalError, message));
        }
        // new fields are created on the most-derived namespace
        let declaration = Declaration::with_value(
            name,
            Modifiers {
                is_mutable: true,
                ..Modifiers::default()
            },
            value,
        );
        self.namespaces
            .define(level_namespaces[0], declaration, true)
            .map_err(|e| self.locate(e))
    }

    // --- subscripts -------------------------------------------------------

    fn sub_get(&mut self, object: Value, key: Value) -> QuillResult<Value> {
        match &object {
            Value::Null => Err(self.error(ErrorCode::NullObject, "subscript on null")),
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::List(items) => {
                    let Value::Int(index) = key else {
                        return Err(self.error(ErrorCode::SubGetKey, "list index must be an integer"));
                    };
                    usize::try_from(index)
                        .ok()
                        .and_then(|i| items.get(i))
                        .cloned()
                        .ok_or_else(|| self.error(ErrorCode::OutOfRange, format!("index {index} out of range")))
                }
                HeapData::Struct(_) => {
                    let Value::Str(key) = key else {
                        return Err(self.error(ErrorCode::SubGetKey, "struct key must be a string"));
                    };
                    Ok(StructObject::chain_get(self.heap, *id, &key).unwrap_or(Value::Null))
                }
                _ => Err(self.error(
                    ErrorCode::Unsupported,
                    format!("subscript on {}", object.type_name(self.heap)),
                )),
            },
            Value::Str(s) => {
                let Value::Int(index) = key else {
                    return Err(self.error(ErrorCode::SubGetKey, "string index must be an integer"));
                };
                usize::try_from(index)
                    .ok()
                    .and_then(|i| s.chars().nth(i))
                    .map(|c| Value::str(&c.to_string()))
                    .ok_or_else(|| self.error(ErrorCode::OutOfRange, format!("index {index} out of range")))
            }
            other => Err(self.error(
                ErrorCode::Unsupported,
                format!("subscript on {}", other.type_name(self.heap)),
            )),
        }
    }

    fn sub_set(&mut self, object: Value, key: Value, value: Value) -> QuillResult<()> {
        match object {
            Value::Ref(id) => match self.heap.get_mut(id) {
                HeapData::List(items) => {
                    let Value::Int(index) = key else {
                        return Err(self.error(ErrorCode::SubGetKey, "list index must be an integer"));
                    };
                    let len = items.len();
                    match usize::try_from(index).ok().filter(|i| *i < len) {
                        Some(i) => {
                            items[i] = value;
                            Ok(())
                        }
                        None => Err(self.error(ErrorCode::OutOfRange, format!("index {index} out of range"))),
                    }
                }
                HeapData::Struct(object) => {
                    let Value::Str(key) = key else {
                        return Err(self.error(ErrorCode::SubGetKey, "struct key must be a string"));
                    };
                    object.set(key.to_string(), value);
                    Ok(())
                }
                _ => Err(self.error(ErrorCode::Unsupported, "subscript assignment target")),
            },
            _ => Err(self.error(ErrorCode::Unsupported, "subscript assignment target")),
        }
    }

    // --- operators --------------------------------------------------------

    fn compare(&self, op: Opcode, left: &Value, right: &Value) -> QuillResult<bool> {
        let ordering = match (left, right) {
            (Value::Int(a), Value::Int(b)) => a.partial_cmp(b),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            _ => None,
        };
        let Some(ordering) = ordering else {
            return Err(self.error(
                ErrorCode::Unsupported,
                format!(
                    "cannot compare {} with {}",
                    left.type_name(self.heap),
                    right.type_name(self.heap)
                ),
            ));
        };
        Ok(match op {
            Opcode::Lesser => ordering.is_lt(),
            Opcode::Greater => ordering.is_gt(),
            Opcode::LesserOrEqual => ordering.is_le(),
            _ => ordering.is_ge(),
        })
    }

    fn arithmetic(&mut self, op: Opcode, left: Value, right: Value) -> QuillResult<Value> {
        if op == Opcode::Add {
            // string concatenation wins whenever either side is a string
            if let Value::Str(a) = &left {
                let mut out = a.to_string();
                out.push_str(&right.display(self.heap));
                return Ok(Value::str(&out));
            }
            if let Value::Str(b) = &right {
                let mut out = left.display(self.heap);
                out.push_str(b);
                return Ok(Value::str(&out));
            }
            if let (Value::Ref(a), Value::Ref(b)) = (&left, &right)
                && let (HeapData::List(items_a), HeapData::List(items_b)) = (self.heap.get(*a), self.heap.get(*b))
            {
                let mut joined = items_a.clone();
                joined.extend(items_b.iter().cloned());
                let id = self.heap.alloc(HeapData::List(joined));
                return Ok(Value::Ref(id));
            }
        }
        let result = match (&left, &right) {
            (Value::Int(a), Value::Int(b)) => match op {
                Opcode::Add => Value::Int(a.wrapping_add(*b)),
                Opcode::Subtract => Value::Int(a.wrapping_sub(*b)),
                Opcode::Multiply => Value::Int(a.wrapping_mul(*b)),
                Opcode::Divide => {
                    if *b == 0 {
                        return Err(self.error(ErrorCode::Unsupported, "integer division by zero"));
                    }
                    Value::Int(a.wrapping_div(*b))
                }
                _ => {
                    if *b == 0 {
                        return Err(self.error(ErrorCode::Unsupported, "integer modulo by zero"));
                    }
                    Value::Int(a.wrapping_rem(*b))
                }
            },
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                let a = match left {
                    Value::Int(v) => v as f64,
                    Value::Float(v) => v,
                    _ => unreachable!("matched numeric"),
                };
                let b = match right {
                    Value::Int(v) => v as f64,
                    Value::Float(v) => v,
                    _ => unreachable!("matched numeric"),
                };
                Value::Float(match op {
                    Opcode::Add => a + b,
                    Opcode::Subtract => a - b,
                    Opcode::Multiply => a * b,
                    Opcode::Divide => a / b,
                    _ => a % b,
                })
            }
            _ => {
                return Err(self.error(
                    ErrorCode::Unsupported,
                    format!(
                        "cannot apply {op} to {} and {}",
                        left.type_name(self.heap),
                        right.type_name(self.heap)
                    ),
                ));
            }
        };
        Ok(result)
    }

    // --- type operators ---------------------------------------------------

    /// Follows `type X = Y` alias declarations visible from the current
    /// namespace. Bounded so alias cycles terminate.
    fn resolve_type_alias(&self, ty: TypeValue) -> TypeValue {
        let mut current = ty;
        for _ in 0..8 {
            let Some(ns) = self.namespaces.resolve(self.current_ns, &current.name) else {
                return current;
            };
            match self.namespaces.get(ns).get(&current.name).map(|d| &d.value) {
                Some(Value::Type(target)) if target.name != current.name => {
                    current = TypeValue {
                        name: Rc::clone(&target.name),
                        nullable: current.nullable || target.nullable,
                    };
                }
                _ => return current,
            }
        }
        current
    }

    fn type_matches(&self, value: &Value, ty: &TypeValue) -> bool {
        let target: &str = &ty.name;
        if target == "any" || target == "dynamic" {
            return true;
        }
        if value.is_null() {
            return ty.nullable || target == "null";
        }
        let actual = value.type_name(self.heap);
        if *actual == *target {
            return true;
        }
        match (value, target) {
            (Value::Int(_) | Value::Float(_), "num") => true,
            (Value::Ref(id), _) => match self.heap.get(*id) {
                HeapData::Instance(instance) => Class::derives_from(instance.class, target, self.heap),
                HeapData::Class(_) => target == "type",
                _ => false,
            },
            _ => false,
        }
    }

    /// `as` cast: identity and widening casts pass the value through,
    /// numeric casts convert, anything else is a `typeCast` fault.
    fn type_cast(&mut self, value: Value, ty: &TypeValue) -> QuillResult<Value> {
        if self.type_matches(&value, ty) {
            return Ok(value);
        }
        let target: &str = &ty.name;
        match (&value, target) {
            (Value::Int(v), "float") => Ok(Value::Float(*v as f64)),
            (Value::Float(v), "int") => Ok(Value::Int(*v as i64)),
            (other, "str") => Ok(Value::str(&other.display(self.heap))),
            _ => Err(self.error(
                ErrorCode::TypeCast,
                format!("cannot cast {} to {target}", value.type_name(self.heap)),
            )),
        }
    }
}
