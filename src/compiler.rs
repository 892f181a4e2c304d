//! Single-pass Pratt parser: walks tokens straight into bytecode, no AST in
//! between. Mirrors clox's `compiler.c` shape (a stack of per-function
//! `FunctionCompiler`s, a `RULES` table indexed by token type) generalized
//! for the extended grammar: `fix` bindings, ternary `?:`, `match`,
//! `break`/`continue`, and a small class/method/property surface.

use crate::chunk::{Chunk, OpCode};
use crate::debug;
use crate::object::{Object, ObjFunction};
use crate::scanner::{Scanner, Token, TokenType};
use crate::value::Value;
use crate::vm::{AccessKind, Vm};

struct Local<'a> {
    name: Token<'a>,
    /// -1 marks "declared but not yet initialized" (can't appear in its own
    /// initializer expression).
    depth: i32,
    /// Set once a nested function captures this local, so the enclosing
    /// scope emits `CLOSE_UPVALUE` instead of `POP` when it goes out of
    /// scope.
    is_captured: bool,
    is_fix: bool,
}

#[derive(Clone, Copy)]
struct Upvalue {
    index: usize,
    is_local: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionType {
    Script,
    Function,
    Method,
    /// `init`: a bare `return;` yields `this` instead of `nil`, and an
    /// explicit `return <value>;` is a compile error.
    Initializer,
}

struct FunctionCompiler<'a> {
    function: *mut ObjFunction,
    function_type: FunctionType,
    locals: Vec<Local<'a>>,
    upvalues: Vec<Upvalue>,
    scope_depth: i32,

    /// Chain of pending `break`/`continue` jumps in the innermost enclosing
    /// loop, threaded through the unpatched jump operands themselves (each
    /// holds the offset of the previous pending jump, `0xFFFF` terminates
    /// the chain). `None` outside a loop.
    break_jump: Option<usize>,
    continue_jump: Option<usize>,
    /// Scope depth a `break` unwinds to (the loop's own depth, outside any
    /// per-iteration shadow scope).
    loop_outer_depth: i32,
    /// Scope depth a `continue` unwinds to (one level deeper than
    /// `loop_outer_depth` when `for` shadows a per-iteration copy of its
    /// loop variable, so the copy survives to be written back).
    body_scope_depth: i32,
    in_loop: u32,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
enum Precedence {
    None,
    Assignment, // =
    Conditional, // ?:
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . ()
    Primary,
}

impl From<u8> for Precedence {
    fn from(value: u8) -> Self {
        match value {
            0 => Precedence::None,
            1 => Precedence::Assignment,
            2 => Precedence::Conditional,
            3 => Precedence::Or,
            4 => Precedence::And,
            5 => Precedence::Equality,
            6 => Precedence::Comparison,
            7 => Precedence::Term,
            8 => Precedence::Factor,
            9 => Precedence::Unary,
            10 => Precedence::Call,
            11 => Precedence::Primary,
            other => unreachable!("invalid precedence value: {other}"),
        }
    }
}

type ParseFn = fn(&mut Parser<'_>, can_assign: bool);

#[derive(Clone, Copy)]
struct ParseRule {
    prefix: Option<ParseFn>,
    infix: Option<ParseFn>,
    precedence: Precedence,
}

impl ParseRule {
    const fn new(prefix: Option<ParseFn>, infix: Option<ParseFn>, precedence: Precedence) -> Self {
        ParseRule { prefix, infix, precedence }
    }
}

const RULES: [ParseRule; TokenType::Eof as usize + 1] = {
    let mut rules = [ParseRule::new(None, None, Precedence::None); TokenType::Eof as usize + 1];

    rules[TokenType::LeftParen as usize] =
        ParseRule::new(Some(|p, _| p.grouping()), Some(|p, c| p.call(c)), Precedence::Call);
    rules[TokenType::Dot as usize] =
        ParseRule::new(None, Some(|p, c| p.dot(c)), Precedence::Call);
    rules[TokenType::Minus as usize] =
        ParseRule::new(Some(|p, _| p.unary()), Some(|p, _| p.binary()), Precedence::Term);
    rules[TokenType::Plus as usize] = ParseRule::new(None, Some(|p, _| p.binary()), Precedence::Term);
    rules[TokenType::Slash as usize] = ParseRule::new(None, Some(|p, _| p.binary()), Precedence::Factor);
    rules[TokenType::Star as usize] = ParseRule::new(None, Some(|p, _| p.binary()), Precedence::Factor);
    rules[TokenType::QMark as usize] =
        ParseRule::new(None, Some(|p, _| p.ternary()), Precedence::Conditional);
    rules[TokenType::Number as usize] = ParseRule::new(Some(|p, _| p.number()), None, Precedence::None);
    rules[TokenType::String as usize] = ParseRule::new(Some(|p, _| p.string()), None, Precedence::None);
    rules[TokenType::False as usize] = ParseRule::new(Some(|p, _| p.literal()), None, Precedence::None);
    rules[TokenType::True as usize] = ParseRule::new(Some(|p, _| p.literal()), None, Precedence::None);
    rules[TokenType::Nil as usize] = ParseRule::new(Some(|p, _| p.literal()), None, Precedence::None);
    rules[TokenType::This as usize] = ParseRule::new(Some(|p, c| p.this_expr(c)), None, Precedence::None);
    rules[TokenType::Bang as usize] = ParseRule::new(Some(|p, _| p.unary()), None, Precedence::None);
    rules[TokenType::BangEqual as usize] =
        ParseRule::new(None, Some(|p, _| p.binary()), Precedence::Equality);
    rules[TokenType::EqualEqual as usize] =
        ParseRule::new(None, Some(|p, _| p.binary()), Precedence::Equality);
    rules[TokenType::Greater as usize] =
        ParseRule::new(None, Some(|p, _| p.binary()), Precedence::Comparison);
    rules[TokenType::GreaterEqual as usize] =
        ParseRule::new(None, Some(|p, _| p.binary()), Precedence::Comparison);
    rules[TokenType::Less as usize] =
        ParseRule::new(None, Some(|p, _| p.binary()), Precedence::Comparison);
    rules[TokenType::LessEqual as usize] =
        ParseRule::new(None, Some(|p, _| p.binary()), Precedence::Comparison);
    rules[TokenType::Identifier as usize] =
        ParseRule::new(Some(|p, c| p.variable(c)), None, Precedence::None);
    rules[TokenType::And as usize] = ParseRule::new(None, Some(|p, c| p.and_(c)), Precedence::And);
    rules[TokenType::Or as usize] = ParseRule::new(None, Some(|p, c| p.or_(c)), Precedence::Or);

    rules
};

pub struct Parser<'a> {
    current: Token<'a>,
    previous: Token<'a>,
    scanner: Option<Box<Scanner<'a>>>,
    had_error: bool,
    panic_mode: bool,
    compilers: Vec<FunctionCompiler<'a>>,
    /// Nesting depth of class bodies, so `this` outside any class is a
    /// compile error.
    class_depth: u32,
    vm: &'a mut Vm,
}

impl<'a> Parser<'a> {
    fn new(vm: &'a mut Vm) -> Self {
        let eof = Token { token_type: TokenType::Eof, value: "", line: 0 };
        let mut parser = Parser {
            current: eof.clone(),
            previous: eof,
            scanner: None,
            had_error: false,
            panic_mode: false,
            compilers: Vec::new(),
            class_depth: 0,
            vm,
        };
        parser.init_compiler(FunctionType::Script);
        parser
    }

    fn run(&mut self, source: &'a str) -> Option<*mut ObjFunction> {
        self.scanner = Some(Scanner::new(source));
        self.advance();

        while !self.match_token(TokenType::Eof) {
            self.declaration();
        }
        self.consume(TokenType::Eof, "Expect end of expression.");

        let function = self.end_compiler();
        if self.had_error {
            None
        } else {
            function
        }
    }

    // ---- compiler-stack access --------------------------------------------------

    fn specific_compiler(&self, index: usize) -> &FunctionCompiler<'a> {
        self.compilers.get(index).expect("compiler index is invalid")
    }

    fn specific_compiler_mut(&mut self, index: usize) -> &mut FunctionCompiler<'a> {
        self.compilers.get_mut(index).expect("compiler index is invalid")
    }

    fn current_compiler(&self) -> &FunctionCompiler<'a> {
        self.compilers.last().expect("no active compiler")
    }

    fn current_compiler_mut(&mut self) -> &mut FunctionCompiler<'a> {
        self.compilers.last_mut().expect("no active compiler")
    }

    fn current_chunk(&self) -> &Chunk {
        unsafe { &(*self.current_compiler().function).chunk }
    }

    fn current_chunk_mut(&mut self) -> &mut Chunk {
        unsafe { &mut (*self.current_compiler().function).chunk }
    }

    fn current_locals(&self) -> &Vec<Local<'a>> {
        &self.current_compiler().locals
    }

    fn current_locals_mut(&mut self) -> &mut Vec<Local<'a>> {
        &mut self.current_compiler_mut().locals
    }

    // ---- token stream --------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current.clone();
        loop {
            let scanner = self.scanner.as_mut().expect("compiler was not initialized");
            self.current = scanner.scan_token();
            if self.current.token_type != TokenType::Error {
                break;
            }
            self.error_at_current(self.current.value.to_string());
        }
    }

    fn check(&self, token_type: TokenType) -> bool {
        self.current.token_type == token_type
    }

    fn match_token(&mut self, token_type: TokenType) -> bool {
        if !self.check(token_type) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, token_type: TokenType, message: &str) {
        if self.current.token_type == token_type {
            self.advance();
            return;
        }
        self.error_at_current(message.to_string());
    }

    // ---- byte/jump emission --------------------------------------------------

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line as u32;
        self.current_chunk_mut().write(byte, line);
    }

    fn emit_indexed(&mut self, short_op: OpCode, long_op: OpCode, index: usize) {
        let line = self.previous.line as u32;
        self.current_chunk_mut().write_indexed(short_op, long_op, index, line);
    }

    fn emit_return(&mut self) {
        if self.current_compiler().function_type == FunctionType::Initializer {
            self.emit_indexed(OpCode::GetLocal, OpCode::GetLocalLong, 0);
        } else {
            self.emit_byte(OpCode::Nil.to_byte());
        }
        self.emit_byte(OpCode::Return.to_byte());
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_byte(op.to_byte());
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.current_chunk().code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let jump = self.current_chunk().code.len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        let chunk = self.current_chunk_mut();
        chunk.code[offset] = ((jump >> 8) & 0xff) as u8;
        chunk.code[offset + 1] = (jump & 0xff) as u8;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_byte(OpCode::Loop.to_byte());
        let offset = self.current_chunk().code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit_byte(((offset >> 8) & 0xff) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    /// Emits a `JUMP` whose operand temporarily encodes the previous pending
    /// jump's offset (or `0xFFFF` if there isn't one), threading a linked
    /// list of not-yet-patched jumps through the bytecode itself.
    fn emit_chained_jump(&mut self, prev: Option<usize>) -> usize {
        self.emit_byte(OpCode::Jump.to_byte());
        let offset = self.current_chunk().code.len();
        let link: u16 = prev.map(|p| p as u16).unwrap_or(0xFFFF);
        self.emit_byte((link >> 8) as u8);
        self.emit_byte((link & 0xFF) as u8);
        offset
    }

    fn patch_chain_to(&mut self, mut current: Option<usize>, target: usize) {
        while let Some(offset) = current {
            let hi = self.current_chunk().code[offset] as u16;
            let lo = self.current_chunk().code[offset + 1] as u16;
            let link = (hi << 8) | lo;
            let next = if link == 0xFFFF { None } else { Some(link as usize) };
            let jump = (target - offset - 2) as u16;
            let chunk = self.current_chunk_mut();
            chunk.code[offset] = (jump >> 8) as u8;
            chunk.code[offset + 1] = (jump & 0xFF) as u8;
            current = next;
        }
    }

    fn make_constant_byte(&mut self, value: Value) -> u8 {
        let index = self.current_chunk_mut().add_constant(value);
        if index >= 256 {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        index as u8
    }

    /// Interns `token`'s text and adds it to the constant pool, for operands
    /// that name something (property, method, class) rather than index a
    /// slot.
    fn make_name_constant(&mut self, token: &Token) -> usize {
        let interned = self.vm.intern(token.value);
        self.current_chunk_mut().add_constant(Value::Obj(interned as *mut Object))
    }

    // ---- compiler lifecycle --------------------------------------------------

    fn init_compiler(&mut self, function_type: FunctionType) {
        let name = if function_type != FunctionType::Script {
            Some(self.vm.intern(self.previous.value))
        } else {
            None
        };
        let function = self.vm.alloc_function(name);
        self.vm.compiler_roots.push(function as *mut Object);

        // Slot 0 holds the callee itself for a plain function, or the
        // receiver for a method/initializer, named "this" so `this` resolves
        // through the ordinary local-variable path.
        let slot0_name = match function_type {
            FunctionType::Method | FunctionType::Initializer => "this",
            _ => "",
        };
        let locals = vec![Local {
            name: Token { token_type: TokenType::This, value: slot0_name, line: 0 },
            depth: 0,
            is_captured: false,
            is_fix: true,
        }];

        self.compilers.push(FunctionCompiler {
            function,
            function_type,
            locals,
            upvalues: Vec::new(),
            scope_depth: 0,
            break_jump: None,
            continue_jump: None,
            loop_outer_depth: 0,
            body_scope_depth: 0,
            in_loop: 0,
        });
    }

    fn end_compiler(&mut self) -> Option<*mut ObjFunction> {
        self.emit_return();
        let function = self.current_compiler().function;
        self.debug_disassemble(function);
        self.compilers.pop();
        self.vm.compiler_roots.pop();
        Some(function)
    }

    #[cfg(feature = "debug_print_code")]
    fn debug_disassemble(&self, function: *mut ObjFunction) {
        if self.had_error {
            return;
        }
        let name = unsafe { (*function).display_name().to_string() };
        debug::disassemble_chunk(unsafe { &(*function).chunk }, &name);
    }

    #[cfg(not(feature = "debug_print_code"))]
    fn debug_disassemble(&self, _function: *mut ObjFunction) {}

    // ---- declarations --------------------------------------------------

    fn declaration(&mut self) {
        if self.match_token(TokenType::Var) {
            self.variable_declaration(AccessKind::Var);
        } else if self.match_token(TokenType::Fix) {
            self.variable_declaration(AccessKind::Fix);
        } else if self.match_token(TokenType::Fun) {
            self.function_declaration();
        } else if self.match_token(TokenType::Class) {
            self.class_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn variable_declaration(&mut self, access: AccessKind) {
        let global = self.parse_variable("Expect variable name.", access);

        if self.match_token(TokenType::Equal) {
            self.expression();
        } else {
            self.emit_byte(OpCode::Nil.to_byte());
        }
        self.consume(TokenType::Semicolon, "Expect ';' after variable declaration.");

        self.define_variable(global);
    }

    fn parse_variable(&mut self, message: &str, access: AccessKind) -> usize {
        self.consume(TokenType::Identifier, message);
        self.declare_variable(access);
        if self.current_compiler().scope_depth > 0 {
            return 0;
        }
        let name_ptr = self.vm.intern(self.previous.value);
        self.vm.resolve_global(name_ptr, access)
    }

    fn declare_variable(&mut self, access: AccessKind) {
        if self.current_compiler().scope_depth == 0 {
            return;
        }

        let name = self.previous.clone();
        let scope_depth = self.current_compiler().scope_depth;
        let mut duplicate = false;
        for local in self.current_locals().iter().rev() {
            if local.depth != -1 && local.depth < scope_depth {
                break;
            }
            if Self::identifier_equal(&name, &local.name) {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }

        self.add_local(name, access == AccessKind::Fix);
    }

    fn add_local(&mut self, name: Token<'a>, is_fix: bool) {
        self.current_locals_mut().push(Local { name, depth: -1, is_captured: false, is_fix });
    }

    fn define_variable(&mut self, global: usize) {
        if self.current_compiler().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_indexed(OpCode::DefineGlobal, OpCode::DefineGlobalLong, global);
    }

    fn mark_initialized(&mut self) {
        if self.current_compiler().scope_depth == 0 {
            return;
        }
        let depth = self.current_compiler().scope_depth;
        self.current_locals_mut().last_mut().expect("no local to initialize").depth = depth;
    }

    fn function_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.", AccessKind::Var);
        self.mark_initialized();
        self.function(FunctionType::Function);
        self.define_variable(global);
    }

    fn function(&mut self, function_type: FunctionType) {
        self.init_compiler(function_type);
        self.begin_scope();

        self.consume(TokenType::LeftParen, "Expect '(' after function name.");
        let mut arity: u16 = 0;
        if !self.check(TokenType::RightParen) {
            loop {
                arity += 1;
                if arity > 255 {
                    self.error("Can't have more than 255 parameters.");
                }
                let constant = self.parse_variable("Expect parameter name.", AccessKind::Var);
                self.define_variable(constant);

                if !self.match_token(TokenType::Comma) {
                    break;
                }
            }
        }
        unsafe { (*self.current_compiler().function).arity = arity.min(255) as u8 };
        self.consume(TokenType::RightParen, "Expect ')' after parameters.");
        self.consume(TokenType::LeftBrace, "Expect '{' before function body.");
        self.block();

        let upvalues = self.current_compiler().upvalues.clone();
        let function = self.end_compiler().expect("function body always yields a function");

        let index = self.make_constant_byte(Value::Obj(function as *mut Object));
        self.emit_byte(OpCode::Closure.to_byte());
        self.emit_byte(index);
        for upvalue in &upvalues {
            self.emit_byte(if upvalue.is_local { 1 } else { 0 });
            self.emit_byte(upvalue.index as u8);
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenType::Identifier, "Expect class name.");
        let name_token = self.previous.clone();
        self.declare_variable(AccessKind::Var);
        let global = if self.current_compiler().scope_depth > 0 {
            0
        } else {
            let name_ptr = self.vm.intern(name_token.value);
            self.vm.resolve_global(name_ptr, AccessKind::Var)
        };

        let class_name_idx = self.make_name_constant(&name_token);
        self.emit_indexed(OpCode::Class, OpCode::ClassLong, class_name_idx);
        self.define_variable(global);

        // Reload the freshly defined class so the method declarations below
        // can target it; the final POP discards this extra reference.
        self.named_variable(name_token, false);

        self.class_depth += 1;
        self.consume(TokenType::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.method();
        }
        self.consume(TokenType::RightBrace, "Expect '}' after class body.");
        self.class_depth -= 1;

        self.emit_byte(OpCode::Pop.to_byte());
    }

    fn method(&mut self) {
        self.consume(TokenType::Identifier, "Expect method name.");
        let name_token = self.previous.clone();
        let name_idx = self.make_name_constant(&name_token);

        let function_type =
            if name_token.value == "init" { FunctionType::Initializer } else { FunctionType::Method };
        self.function(function_type);
        self.emit_indexed(OpCode::Method, OpCode::MethodLong, name_idx);
    }

    // ---- variable resolution --------------------------------------------------

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.previous.clone(), can_assign);
    }

    fn this_expr(&mut self, _can_assign: bool) {
        if self.class_depth == 0 {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.named_variable(self.previous.clone(), false);
    }

    fn named_variable(&mut self, name: Token<'a>, can_assign: bool) {
        let compiler_index = self.compilers.len() - 1;
        let local_index = self.resolve_local(compiler_index, &name);

        enum Target {
            Local(usize, bool),
            Upvalue(usize),
            Global(usize),
        }

        let target = if local_index != -1 {
            let is_fix = self.current_locals()[local_index as usize].is_fix;
            Target::Local(local_index as usize, is_fix)
        } else {
            let upvalue_index = self.resolve_upvalue(compiler_index, &name);
            if upvalue_index != -1 {
                Target::Upvalue(upvalue_index as usize)
            } else {
                let name_ptr = self.vm.intern(name.value);
                Target::Global(self.vm.resolve_global(name_ptr, AccessKind::Var))
            }
        };

        if can_assign && self.match_token(TokenType::Equal) {
            if let Target::Local(_, true) = target {
                self.error("Can't reassign a fix variable.");
            }
            self.expression();
            match target {
                Target::Local(index, _) => self.emit_indexed(OpCode::SetLocal, OpCode::SetLocalLong, index),
                Target::Upvalue(index) => {
                    self.emit_byte(OpCode::SetUpvalue.to_byte());
                    self.emit_byte(index as u8);
                }
                Target::Global(index) => self.emit_indexed(OpCode::SetGlobal, OpCode::SetGlobalLong, index),
            }
        } else {
            match target {
                Target::Local(index, _) => self.emit_indexed(OpCode::GetLocal, OpCode::GetLocalLong, index),
                Target::Upvalue(index) => {
                    self.emit_byte(OpCode::GetUpvalue.to_byte());
                    self.emit_byte(index as u8);
                }
                Target::Global(index) => self.emit_indexed(OpCode::GetGlobal, OpCode::GetGlobalLong, index),
            }
        }
    }

    fn resolve_local(&mut self, compiler_index: usize, name: &Token) -> i32 {
        let locals = &self.specific_compiler(compiler_index).locals;
        for (index, local) in locals.iter().enumerate().rev() {
            if Self::identifier_equal(name, &local.name) {
                if local.depth == -1 {
                    self.error("Can't read local variable in its own initializer.");
                }
                return index as i32;
            }
        }
        -1
    }

    fn identifier_equal(left: &Token, right: &Token) -> bool {
        left.token_type == right.token_type && left.value == right.value
    }

    fn resolve_upvalue(&mut self, compiler_index: usize, name: &Token) -> i32 {
        if compiler_index == 0 {
            return -1;
        }

        let local = self.resolve_local(compiler_index - 1, name);
        if local != -1 {
            self.specific_compiler_mut(compiler_index - 1).locals[local as usize].is_captured = true;
            return self.add_upvalue(compiler_index, local, true) as i32;
        }

        let upvalue = self.resolve_upvalue(compiler_index - 1, name);
        if upvalue != -1 {
            return self.add_upvalue(compiler_index, upvalue, false) as i32;
        }

        -1
    }

    fn add_upvalue(&mut self, compiler_index: usize, index: i32, is_local: bool) -> usize {
        {
            let upvalues = &self.specific_compiler(compiler_index).upvalues;
            for (i, upvalue) in upvalues.iter().enumerate() {
                if upvalue.is_local == is_local && upvalue.index == index as usize {
                    return i;
                }
            }
        }
        if self.specific_compiler(compiler_index).upvalues.len() >= 256 {
            self.error("Too many closure variables in function.");
            return 0;
        }

        let function = self.specific_compiler(compiler_index).function;
        self.specific_compiler_mut(compiler_index).upvalues.push(Upvalue { index: index as usize, is_local });
        let count = self.specific_compiler(compiler_index).upvalues.len();
        unsafe { (*function).upvalue_count = count };
        count - 1
    }

    // ---- expressions --------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn number(&mut self) {
        let value: f64 = self.previous.value.parse().unwrap_or(0.0);
        let line = self.previous.line as u32;
        self.current_chunk_mut().write_constant(Value::Number(value), line);
    }

    fn string(&mut self) {
        let raw = self.previous.value;
        let content = &raw[1..raw.len() - 1];
        let interned = self.vm.intern(content);
        let line = self.previous.line as u32;
        self.current_chunk_mut().write_constant(Value::Obj(interned as *mut Object), line);
    }

    fn literal(&mut self) {
        match self.previous.token_type {
            TokenType::False => self.emit_byte(OpCode::False.to_byte()),
            TokenType::True => self.emit_byte(OpCode::True.to_byte()),
            TokenType::Nil => self.emit_byte(OpCode::Nil.to_byte()),
            other => unreachable!("unexpected literal token: {other:?}"),
        }
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self) {
        let operator = self.previous.token_type;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenType::Bang => self.emit_byte(OpCode::Not.to_byte()),
            TokenType::Minus => self.emit_byte(OpCode::Negate.to_byte()),
            other => unreachable!("unexpected unary operator: {other:?}"),
        }
    }

    fn binary(&mut self) {
        let operator = self.previous.token_type;
        let rule = &RULES[operator as usize];
        self.parse_precedence((rule.precedence as u8 + 1).into());

        match operator {
            TokenType::BangEqual => {
                self.emit_byte(OpCode::Equal.to_byte());
                self.emit_byte(OpCode::Not.to_byte());
            }
            TokenType::EqualEqual => self.emit_byte(OpCode::Equal.to_byte()),
            TokenType::Greater => self.emit_byte(OpCode::Greater.to_byte()),
            TokenType::GreaterEqual => {
                self.emit_byte(OpCode::Less.to_byte());
                self.emit_byte(OpCode::Not.to_byte());
            }
            TokenType::Less => self.emit_byte(OpCode::Less.to_byte()),
            TokenType::LessEqual => {
                self.emit_byte(OpCode::Greater.to_byte());
                self.emit_byte(OpCode::Not.to_byte());
            }
            TokenType::Plus => self.emit_byte(OpCode::Add.to_byte()),
            TokenType::Minus => self.emit_byte(OpCode::Subtract.to_byte()),
            TokenType::Star => self.emit_byte(OpCode::Multiply.to_byte()),
            TokenType::Slash => self.emit_byte(OpCode::Divide.to_byte()),
            other => unreachable!("unexpected binary operator: {other:?}"),
        }
    }

    /// `cond ? then : else`, right-associative: the else branch parses at
    /// `Conditional` so `a ? b : c ? d : e` nests as `a ? b : (c ? d : e)`.
    fn ternary(&mut self) {
        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_byte(OpCode::Pop.to_byte());
        self.expression();
        self.consume(TokenType::Colon, "Expect ':' after then-branch of ternary.");

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_byte(OpCode::Pop.to_byte());
        self.parse_precedence(Precedence::Conditional);
        self.patch_jump(else_jump);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenType::Identifier, "Expect property name after '.'.");
        let name_token = self.previous.clone();
        let name_idx = self.make_name_constant(&name_token);

        if can_assign && self.match_token(TokenType::Equal) {
            self.expression();
            self.emit_indexed(OpCode::SetProperty, OpCode::SetPropertyLong, name_idx);
        } else if self.match_token(TokenType::LeftParen) {
            let argc = self.argument_list();
            self.emit_indexed(OpCode::Invoke, OpCode::InvokeLong, name_idx);
            self.emit_byte(argc);
        } else {
            self.emit_indexed(OpCode::GetProperty, OpCode::GetPropertyLong, name_idx);
        }
    }

    fn and_(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_byte(OpCode::Pop.to_byte());
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfTrue);
        self.emit_byte(OpCode::Pop.to_byte());
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let argc = self.argument_list();
        self.emit_byte(OpCode::Call.to_byte());
        self.emit_byte(argc);
    }

    fn argument_list(&mut self) -> u8 {
        let mut argc: u16 = 0;
        if !self.check(TokenType::RightParen) {
            loop {
                self.expression();
                if argc >= 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                argc += 1;
                if !self.match_token(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after arguments.");
        argc as u8
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();

        let can_assign = precedence <= Precedence::Assignment;
        match RULES[self.previous.token_type as usize].prefix {
            Some(prefix) => prefix(self, can_assign),
            None => {
                self.error("Expect expression.");
                return;
            }
        }

        while precedence as u8 <= RULES[self.current.token_type as usize].precedence as u8 {
            self.advance();
            match RULES[self.previous.token_type as usize].infix {
                Some(infix) => infix(self, can_assign),
                None => {
                    self.error("Expect infix parse function.");
                    return;
                }
            }
        }

        if can_assign && self.match_token(TokenType::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    // ---- statements --------------------------------------------------

    fn statement(&mut self) {
        if self.match_token(TokenType::If) {
            self.if_statement();
        } else if self.match_token(TokenType::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else if self.match_token(TokenType::While) {
            self.while_statement();
        } else if self.match_token(TokenType::For) {
            self.for_statement();
        } else if self.match_token(TokenType::Match) {
            self.match_statement();
        } else if self.match_token(TokenType::Return) {
            self.return_statement();
        } else if self.match_token(TokenType::Print) {
            self.print_statement();
        } else if self.match_token(TokenType::Break) {
            self.break_statement();
        } else if self.match_token(TokenType::Continue) {
            self.continue_statement();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.declaration();
        }
        self.consume(TokenType::RightBrace, "Expect '}' after block.");
    }

    fn begin_scope(&mut self) {
        self.current_compiler_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.current_compiler_mut().scope_depth -= 1;
        let depth = self.current_compiler().scope_depth;
        loop {
            let above = match self.current_locals().last() {
                Some(local) => local.depth > depth,
                None => false,
            };
            if !above {
                break;
            }
            if self.current_locals().last().unwrap().is_captured {
                self.emit_byte(OpCode::CloseUpvalue.to_byte());
            } else {
                self.emit_byte(OpCode::Pop.to_byte());
            }
            self.current_locals_mut().pop();
        }
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after value.");
        self.emit_byte(OpCode::Print.to_byte());
    }

    fn return_statement(&mut self) {
        if self.current_compiler().function_type == FunctionType::Script {
            self.error("Can't return from top-level code.");
        }

        if self.match_token(TokenType::Semicolon) {
            self.emit_return();
        } else {
            if self.current_compiler().function_type == FunctionType::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenType::Semicolon, "Expect ';' after return value.");
            self.emit_byte(OpCode::Return.to_byte());
        }
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after expression.");
        self.emit_byte(OpCode::Pop.to_byte());
    }

    fn if_statement(&mut self) {
        self.consume(TokenType::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_byte(OpCode::Pop.to_byte());
        self.statement();

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_byte(OpCode::Pop.to_byte());

        if self.match_token(TokenType::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    /// `match (subject) { is case: body ... ?: default }`. Each `is` case
    /// duplicates the subject, compares, and on a miss pops the leftover
    /// boolean before falling through to the next case; a match consumes
    /// `POPN 2` (bool and subject) before its body. The default (if present)
    /// pops the subject once. A case after the default is rejected.
    fn match_statement(&mut self) {
        self.consume(TokenType::LeftParen, "Expect '(' after 'match'.");
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after match subject.");
        self.consume(TokenType::LeftBrace, "Expect '{' before match body.");

        let mut end_jumps: Vec<usize> = Vec::new();
        let mut case_count = 0usize;
        let mut seen_default = false;

        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            if self.match_token(TokenType::Is) {
                if seen_default {
                    self.error("A 'match' case cannot follow the default case.");
                }
                case_count += 1;
                if case_count > 100 {
                    self.error("Too many cases in 'match' statement.");
                }

                self.emit_byte(OpCode::Dup.to_byte());
                self.expression();
                self.consume(TokenType::Colon, "Expect ':' after case expression.");
                self.emit_byte(OpCode::Equal.to_byte());

                let miss_jump = self.emit_jump(OpCode::JumpIfFalse);
                self.emit_byte(OpCode::PopN.to_byte());
                self.emit_byte(2);
                self.statement();
                end_jumps.push(self.emit_jump(OpCode::Jump));

                self.patch_jump(miss_jump);
                self.emit_byte(OpCode::Pop.to_byte());
            } else if self.match_token(TokenType::QMark) {
                seen_default = true;
                self.consume(TokenType::Colon, "Expect ':' after '?' in match default case.");
                self.emit_byte(OpCode::Pop.to_byte());
                self.statement();
            } else {
                self.error_at_current("Expect 'is' or '?' in match body.".to_string());
                self.advance();
            }
        }
        self.consume(TokenType::RightBrace, "Expect '}' after match body.");

        if !seen_default {
            self.emit_byte(OpCode::Pop.to_byte());
        }

        for jump in end_jumps {
            self.patch_jump(jump);
        }
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_chunk().code.len();
        self.consume(TokenType::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_byte(OpCode::Pop.to_byte());

        let saved = self.enter_loop();
        self.statement();

        let continue_target = self.current_chunk().code.len();
        let continue_chain = self.current_compiler().continue_jump;
        self.patch_chain_to(continue_chain, continue_target);

        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit_byte(OpCode::Pop.to_byte());

        let break_target = self.current_chunk().code.len();
        let break_chain = self.current_compiler().break_jump;
        self.patch_chain_to(break_chain, break_target);

        self.finish_loop(saved);
    }

    /// `for (init; cond; incr) body`. When `init` declares a variable, each
    /// iteration runs the body against a fresh shadow copy of it (in its own
    /// scope) and writes the copy back before looping, so a closure formed
    /// in the body captures that iteration's value rather than the one slot
    /// shared across the whole loop.
    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenType::LeftParen, "Expect '(' after 'for'.");

        let mut loop_var_slot: Option<usize> = None;
        if self.match_token(TokenType::Semicolon) {
            // no initializer
        } else if self.match_token(TokenType::Var) {
            self.variable_declaration(AccessKind::Var);
            loop_var_slot = Some(self.current_locals().len() - 1);
        } else if self.match_token(TokenType::Fix) {
            self.variable_declaration(AccessKind::Fix);
            loop_var_slot = Some(self.current_locals().len() - 1);
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk().code.len();
        let mut exit_jump: Option<usize> = None;
        if !self.match_token(TokenType::Semicolon) {
            self.expression();
            self.consume(TokenType::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_byte(OpCode::Pop.to_byte());
        }

        if !self.check(TokenType::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_chunk().code.len();
            self.expression();
            self.emit_byte(OpCode::Pop.to_byte());
            self.consume(TokenType::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        } else {
            self.consume(TokenType::RightParen, "Expect ')' after for clauses.");
        }

        let saved = self.enter_loop();

        let inner_slot = loop_var_slot.map(|outer_slot| {
            self.begin_scope();
            self.emit_indexed(OpCode::GetLocal, OpCode::GetLocalLong, outer_slot);
            let name = self.current_locals()[outer_slot].name.clone();
            let is_fix = self.current_locals()[outer_slot].is_fix;
            self.add_local(name, is_fix);
            self.mark_initialized();
            self.set_body_scope_depth();
            (outer_slot, self.current_locals().len() - 1)
        });

        self.statement();

        let continue_target = self.current_chunk().code.len();
        let continue_chain = self.current_compiler().continue_jump;
        self.patch_chain_to(continue_chain, continue_target);

        if let Some((outer_slot, inner)) = inner_slot {
            self.emit_indexed(OpCode::GetLocal, OpCode::GetLocalLong, inner);
            self.emit_indexed(OpCode::SetLocal, OpCode::SetLocalLong, outer_slot);
            self.emit_byte(OpCode::Pop.to_byte());
            self.end_scope();
        }

        self.emit_loop(loop_start);

        if let Some(jump) = exit_jump {
            self.patch_jump(jump);
            self.emit_byte(OpCode::Pop.to_byte());
        }

        let break_target = self.current_chunk().code.len();
        let break_chain = self.current_compiler().break_jump;
        self.patch_chain_to(break_chain, break_target);

        self.finish_loop(saved);
        self.end_scope();
    }

    fn enter_loop(&mut self) -> (Option<usize>, Option<usize>, i32, i32) {
        let fc = self.current_compiler_mut();
        let saved = (fc.break_jump, fc.continue_jump, fc.loop_outer_depth, fc.body_scope_depth);
        fc.break_jump = None;
        fc.continue_jump = None;
        fc.loop_outer_depth = fc.scope_depth;
        fc.body_scope_depth = fc.scope_depth;
        fc.in_loop += 1;
        saved
    }

    fn set_body_scope_depth(&mut self) {
        let depth = self.current_compiler().scope_depth;
        self.current_compiler_mut().body_scope_depth = depth;
    }

    fn finish_loop(&mut self, saved: (Option<usize>, Option<usize>, i32, i32)) {
        let fc = self.current_compiler_mut();
        fc.break_jump = saved.0;
        fc.continue_jump = saved.1;
        fc.loop_outer_depth = saved.2;
        fc.body_scope_depth = saved.3;
        fc.in_loop -= 1;
    }

    fn break_statement(&mut self) {
        if self.current_compiler().in_loop == 0 {
            self.error("Can't use 'break' outside of a loop.");
            self.consume(TokenType::Semicolon, "Expect ';' after 'break'.");
            return;
        }
        self.emit_scope_unwind(self.current_compiler().loop_outer_depth);
        self.consume(TokenType::Semicolon, "Expect ';' after 'break'.");

        let prev = self.current_compiler().break_jump;
        let offset = self.emit_chained_jump(prev);
        self.current_compiler_mut().break_jump = Some(offset);
    }

    fn continue_statement(&mut self) {
        if self.current_compiler().in_loop == 0 {
            self.error("Can't use 'continue' outside of a loop.");
            self.consume(TokenType::Semicolon, "Expect ';' after 'continue'.");
            return;
        }
        self.emit_scope_unwind(self.current_compiler().body_scope_depth);
        self.consume(TokenType::Semicolon, "Expect ';' after 'continue'.");

        let prev = self.current_compiler().continue_jump;
        let offset = self.emit_chained_jump(prev);
        self.current_compiler_mut().continue_jump = Some(offset);
    }

    fn emit_scope_unwind(&mut self, target_depth: i32) {
        let mut i = self.current_locals().len();
        while i > 0 {
            let local = &self.current_locals()[i - 1];
            if local.depth <= target_depth {
                break;
            }
            if local.is_captured {
                self.emit_byte(OpCode::CloseUpvalue.to_byte());
            } else {
                self.emit_byte(OpCode::Pop.to_byte());
            }
            i -= 1;
        }
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.token_type != TokenType::Eof {
            if self.previous.token_type == TokenType::Semicolon {
                return;
            }
            if matches!(
                self.current.token_type,
                TokenType::Class
                    | TokenType::Fun
                    | TokenType::Var
                    | TokenType::For
                    | TokenType::If
                    | TokenType::While
                    | TokenType::Print
                    | TokenType::Return
                    | TokenType::Match
            ) {
                return;
            }
            self.advance();
        }
    }

    // ---- error reporting --------------------------------------------------

    fn error(&mut self, message: &str) {
        let token = self.previous.clone();
        self.error_at(&token, message.to_string());
    }

    fn error_at_current(&mut self, message: String) {
        let token = self.current.clone();
        self.error_at(&token, message);
    }

    fn error_at(&mut self, token: &Token, message: String) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;

        eprint!("[line {}] Error", token.line);
        match token.token_type {
            TokenType::Eof => eprint!(" at end"),
            TokenType::Error => {}
            _ => eprint!(" at '{}'", token.value),
        }
        eprintln!(": {message}");
        self.had_error = true;
    }
}

/// Entry point called by [`Vm::interpret`]. A plain namespace type (no
/// state of its own) so the call reads `Compiler::compile(source, vm)`
/// without the caller constructing a parser by hand.
pub struct Compiler;

impl Compiler {
    pub fn compile<'a>(source: &'a str, vm: &'a mut Vm) -> Option<*mut ObjFunction> {
        let mut parser = Parser::new(vm);
        parser.run(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::InterpretResult;

    #[test]
    fn arithmetic_and_grouping_compiles() {
        let mut vm = Vm::new();
        assert_eq!(vm.interpret("print !(5 - 4 > 3 * 2 == !nil);"), InterpretResult::Ok);
    }

    #[test]
    fn ternary_expression() {
        let mut vm = Vm::new();
        assert_eq!(vm.interpret("print true ? 1 : 2;"), InterpretResult::Ok);
        assert_eq!(vm.interpret("print 1 < 2 ? \"a\" : 1 < 0 ? \"b\" : \"c\";"), InterpretResult::Ok);
    }

    #[test]
    fn match_statement_picks_case_and_default() {
        let mut vm = Vm::new();
        let source = "match(2){ is 1: print \"a\"; is 2: print \"b\"; ?: print \"z\"; }";
        assert_eq!(vm.interpret(source), InterpretResult::Ok);

        let mut vm = Vm::new();
        let source = "match(9){ is 1: print \"a\"; ?: print \"z\"; }";
        assert_eq!(vm.interpret(source), InterpretResult::Ok);
    }

    #[test]
    fn match_case_after_default_is_compile_error() {
        let mut vm = Vm::new();
        let source = "match(1){ ?: print \"z\"; is 1: print \"a\"; }";
        assert_eq!(vm.interpret(source), InterpretResult::CompileError);
    }

    #[test]
    fn fix_local_reassignment_is_compile_error() {
        let mut vm = Vm::new();
        assert_eq!(vm.interpret("{ fix x = 10; x = 11; }"), InterpretResult::CompileError);
    }

    #[test]
    fn break_and_continue_in_while_loop() {
        let mut vm = Vm::new();
        let source = "\
            var i = 0;\n\
            while (true) {\n\
                i = i + 1;\n\
                if (i == 2) continue;\n\
                if (i >= 4) break;\n\
                print i;\n\
            }\n\
        ";
        assert_eq!(vm.interpret(source), InterpretResult::Ok);
    }

    #[test]
    fn break_outside_loop_is_compile_error() {
        let mut vm = Vm::new();
        assert_eq!(vm.interpret("break;"), InterpretResult::CompileError);
    }

    #[test]
    fn continue_outside_loop_is_compile_error() {
        let mut vm = Vm::new();
        assert_eq!(vm.interpret("continue;"), InterpretResult::CompileError);
    }

    #[test]
    fn for_loop_prints_each_iteration() {
        let mut vm = Vm::new();
        assert_eq!(vm.interpret("for (var i = 0; i < 3; i = i + 1) print i;"), InterpretResult::Ok);
    }

    #[test]
    fn for_loop_closures_capture_fresh_binding_per_iteration() {
        let mut vm = Vm::new();
        let source = "\
            fun make() {\n\
                var result = nil;\n\
                for (var i = 0; i < 3; i = i + 1) {\n\
                    fun capture() { return i; }\n\
                    result = capture;\n\
                }\n\
                return result;\n\
            }\n\
        ";
        assert_eq!(vm.interpret(source), InterpretResult::Ok);
    }

    #[test]
    fn classes_methods_and_this() {
        let mut vm = Vm::new();
        let source = "\
            class Counter {\n\
                init() { this.count = 0; }\n\
                increment() { this.count = this.count + 1; return this.count; }\n\
            }\n\
            var c = Counter();\n\
            c.increment();\n\
            print c.increment();\n\
        ";
        assert_eq!(vm.interpret(source), InterpretResult::Ok);
    }

    #[test]
    fn this_outside_class_is_compile_error() {
        let mut vm = Vm::new();
        assert_eq!(vm.interpret("print this;"), InterpretResult::CompileError);
    }

    #[test]
    fn function_declaration_and_call() {
        let mut vm = Vm::new();
        let source = "\
            fun sum(a, b, c) { return a + b + c; }\n\
            print 4 + sum(5, 6, 7);\n\
        ";
        assert_eq!(vm.interpret(source), InterpretResult::Ok);
    }
}
