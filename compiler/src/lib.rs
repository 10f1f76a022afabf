//! Single-pass compiler: walks tokens from a `lexer::Lexer` with Pratt
//! parsing and emits straight into a `runtime::Chunk`, one function at a
//! time, with no intermediate syntax tree.

pub mod debug;
pub mod error;

use std::rc::Rc;

use lexer::{Lexer, Token, TokenKind};
use runtime::{Chunk, GcRoots, Heap, ObjRef, OpCode, Value};

pub use error::CompileError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . () []
    Primary,
}

impl Precedence {
    fn next(self) -> Self {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

type ParseFn = fn(&mut Compiler, &mut Heap, bool);

#[derive(Clone, Copy)]
struct ParseRule {
    prefix: Option<ParseFn>,
    infix: Option<ParseFn>,
    precedence: Precedence,
}

fn get_rule(kind: TokenKind) -> ParseRule {
    use TokenKind::*;
    let (prefix, infix, precedence): (Option<ParseFn>, Option<ParseFn>, Precedence) = match kind {
        LeftParen => (Some(Compiler::grouping), Some(Compiler::call), Precedence::Call),
        LeftBracket => (Some(Compiler::array), Some(Compiler::index), Precedence::Call),
        Dot => (None, Some(Compiler::dot), Precedence::Call),
        Minus => (Some(Compiler::unary), Some(Compiler::binary), Precedence::Term),
        Plus => (None, Some(Compiler::binary), Precedence::Term),
        Slash | Star => (None, Some(Compiler::binary), Precedence::Factor),
        Bang => (Some(Compiler::unary), None, Precedence::None),
        BangEqual | EqualEqual => (None, Some(Compiler::binary), Precedence::Equality),
        Greater | GreaterEqual | Less | LessEqual => {
            (None, Some(Compiler::binary), Precedence::Comparison)
        }
        Identifier => (Some(Compiler::variable), None, Precedence::None),
        String => (Some(Compiler::string_literal), None, Precedence::None),
        Number => (Some(Compiler::number), None, Precedence::None),
        And => (None, Some(Compiler::and_), Precedence::And),
        Or => (None, Some(Compiler::or_), Precedence::Or),
        False | Nil | True => (Some(Compiler::literal), None, Precedence::None),
        This => (Some(Compiler::this_), None, Precedence::None),
        Super => (Some(Compiler::super_), None, Precedence::None),
        _ => (None, None, Precedence::None),
    };
    ParseRule { prefix, infix, precedence }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local {
    name: Rc<str>,
    /// `None` while the initializer expression for this local is still
    /// being compiled, so reading the name inside it is caught as an error.
    depth: Option<usize>,
    is_captured: bool,
}

#[derive(Clone, Copy)]
struct UpvalueRef {
    index: u8,
    is_local: bool,
}

struct FunctionState {
    kind: FunctionKind,
    name: Option<ObjRef>,
    arity: u8,
    chunk: Chunk,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueRef>,
    scope_depth: usize,
}

struct ClassState {
    has_superclass: bool,
}

/// Compiles one source file. Each nested function or method pushes a new
/// `FunctionState`; functions that would recurse in `original_source/compiler.c`
/// (by holding an `enclosing: *Compiler` pointer) instead index into this
/// stack, which keeps every borrow local instead of threading an owned
/// chain of enclosing compilers through `Box`.
pub struct Compiler {
    lexer: Lexer,
    previous: Option<Rc<Token>>,
    current: Option<Rc<Token>>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,
    states: Vec<FunctionState>,
    class_states: Vec<ClassState>,
}

impl GcRoots for Compiler {
    fn mark_roots(&self, heap: &mut Heap) {
        for state in &self.states {
            if let Some(name) = state.name {
                heap.mark_object(name);
            }
            for constant in &state.chunk.constants {
                heap.mark_value(*constant);
            }
        }
    }
}

/// Compiles `source` into a top-level function (Lox's implicit `script`
/// entry point). Returns the accumulated errors instead of the function on
/// failure, so a caller can report everything wrong with the source at once
/// rather than stopping at the first mistake.
pub fn compile(source: String, heap: &mut Heap) -> Result<ObjRef, Vec<CompileError>> {
    let mut compiler = Compiler::new(source);
    compiler.advance();
    while !compiler.check(TokenKind::Eof) {
        compiler.declaration(heap);
    }
    compiler.consume(TokenKind::Eof, "end of input");

    if compiler.had_error {
        return Err(compiler.errors);
    }
    let (function, _) = compiler.pop_function(heap);
    Ok(function)
}

impl Compiler {
    fn new(source: String) -> Self {
        let script = FunctionState {
            kind: FunctionKind::Script,
            name: None,
            arity: 0,
            chunk: Chunk::new(),
            locals: vec![Local { name: Rc::from(""), depth: Some(0), is_captured: false }],
            upvalues: Vec::new(),
            scope_depth: 0,
        };
        Self {
            lexer: Lexer::new(source),
            previous: None,
            current: None,
            had_error: false,
            panic_mode: false,
            errors: Vec::new(),
            states: vec![script],
            class_states: Vec::new(),
        }
    }

    // ---- token stream plumbing ------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current.take();
        loop {
            let token = Rc::new(self.lexer.next_token());
            if token.kind() != TokenKind::Error {
                self.current = Some(token);
                break;
            }
            self.emit_error(CompileError::InvalidToken(token));
        }
    }

    fn current(&self) -> Rc<Token> {
        Rc::clone(self.current.as_ref().expect("advance() primes current before use"))
    }

    fn previous(&self) -> Rc<Token> {
        Rc::clone(self.previous.as_ref().expect("advance() primes previous before use"))
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.as_ref().unwrap().kind() == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, what: &'static str) {
        if self.check(kind) {
            self.advance();
            return;
        }
        let token = self.current();
        self.emit_error(CompileError::Expected(what, token));
    }

    fn emit_error(&mut self, err: CompileError) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        self.errors.push(err);
    }

    /// Skips tokens until it finds one that plausibly starts a new
    /// declaration, so one mistake doesn't cascade into a wall of follow-on
    /// errors. Only consulted between statements.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while !self.check(TokenKind::Eof) {
            if self.previous.as_ref().unwrap().kind() == TokenKind::Semicolon {
                return;
            }
            match self.current.as_ref().unwrap().kind() {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => self.advance(),
            }
        }
    }

    // ---- bytecode emission ------------------------------------------------

    fn chunk(&mut self) -> &mut Chunk {
        &mut self.states.last_mut().unwrap().chunk
    }

    fn current_line(&self) -> u32 {
        self.previous.as_ref().map(|t| t.line()).unwrap_or(0)
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.current_line();
        self.chunk().write_byte(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        let line = self.current_line();
        self.chunk().write_op(op, line);
    }

    fn emit_ops(&mut self, op: OpCode, byte: u8) {
        self.emit_op(op);
        self.emit_byte(byte);
    }

    fn emit_return(&mut self) {
        if self.states.last().unwrap().kind == FunctionKind::Initializer {
            self.emit_ops(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        match self.chunk().add_constant(value) {
            Some(idx) => idx,
            None => {
                let token = self.previous();
                self.emit_error(CompileError::TooManyConstants(token));
                0
            }
        }
    }

    fn emit_constant(&mut self, value: Value) {
        let idx = self.make_constant(value);
        self.emit_ops(OpCode::Constant, idx);
    }

    fn identifier_constant(&mut self, heap: &mut Heap, name: &str) -> u8 {
        let interned = heap.intern_string(&*self, name);
        self.make_constant(Value::Obj(interned))
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        let line = self.current_line();
        self.chunk().emit_jump(op, line)
    }

    fn patch_jump(&mut self, offset: usize) {
        if self.chunk().patch_jump(offset).is_err() {
            let token = self.previous();
            self.emit_error(CompileError::JumpTooLarge(token));
        }
    }

    fn emit_loop(&mut self, loop_start: usize) {
        let line = self.current_line();
        if self.chunk().emit_loop(loop_start, line).is_err() {
            let token = self.previous();
            self.emit_error(CompileError::JumpTooLarge(token));
        }
    }

    // ---- function-state stack ---------------------------------------------

    fn push_function(&mut self, kind: FunctionKind, name: Option<ObjRef>) {
        let reserved_name = if kind == FunctionKind::Method || kind == FunctionKind::Initializer {
            "this"
        } else {
            ""
        };
        self.states.push(FunctionState {
            kind,
            name,
            arity: 0,
            chunk: Chunk::new(),
            locals: vec![Local { name: Rc::from(reserved_name), depth: Some(0), is_captured: false }],
            upvalues: Vec::new(),
            scope_depth: 0,
        });
    }

    /// Finishes the current function, allocates its `ObjFunction` and pops
    /// its `FunctionState`. The collection check has to run *before* the
    /// state comes off the stack: only while it's still there are the
    /// chunk's constants reachable as compiler roots.
    fn pop_function(&mut self, heap: &mut Heap) -> (ObjRef, Vec<UpvalueRef>) {
        self.emit_return();
        heap.maybe_collect(&*self);
        let state = self.states.pop().expect("pop_function without a matching push");
        if cfg!(feature = "debug-bytecode") && !self.had_error {
            let label = state.name.map(|n| n.to_string()).unwrap_or_else(|| "<script>".to_string());
            print!("{}", debug::disassemble_chunk(&state.chunk, &label));
        }
        let function = heap.alloc_function_no_collect(state.name, state.arity, state.chunk);
        Heap::set_upvalue_count(function, state.upvalues.len() as u8);
        (function, state.upvalues)
    }

    // ---- variable resolution ----------------------------------------------

    fn resolve_local(&self, state_idx: usize, name: &str) -> Option<(usize, bool)> {
        let locals = &self.states[state_idx].locals;
        for i in (0..locals.len()).rev() {
            if locals[i].name.as_ref() == name {
                return Some((i, locals[i].depth.is_some()));
            }
        }
        None
    }

    fn add_upvalue(&mut self, state_idx: usize, index: u8, is_local: bool) -> u8 {
        {
            let upvalues = &self.states[state_idx].upvalues;
            for (i, uv) in upvalues.iter().enumerate() {
                if uv.index == index && uv.is_local == is_local {
                    return i as u8;
                }
            }
            if upvalues.len() >= u8::MAX as usize + 1 {
                let token = self.previous();
                self.emit_error(CompileError::TooManyUpvalues(token));
                return 0;
            }
        }
        self.states[state_idx].upvalues.push(UpvalueRef { index, is_local });
        (self.states[state_idx].upvalues.len() - 1) as u8
    }

    fn resolve_upvalue(&mut self, state_idx: usize, name: &str) -> Option<u8> {
        if state_idx == 0 {
            return None;
        }
        let enclosing = state_idx - 1;
        if let Some((local_idx, _)) = self.resolve_local(enclosing, name) {
            self.states[enclosing].locals[local_idx].is_captured = true;
            return Some(self.add_upvalue(state_idx, local_idx as u8, true));
        }
        if let Some(upvalue_idx) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(state_idx, upvalue_idx, false));
        }
        None
    }

    fn resolve_variable(&mut self, heap: &mut Heap, name: &str) -> (OpCode, OpCode, u8) {
        let state_idx = self.states.len() - 1;
        if let Some((slot, initialized)) = self.resolve_local(state_idx, name) {
            if !initialized {
                let token = self.previous();
                self.emit_error(CompileError::SelfReadInOwnInitializer(token));
            }
            (OpCode::GetLocal, OpCode::SetLocal, slot as u8)
        } else if let Some(slot) = self.resolve_upvalue(state_idx, name) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, slot)
        } else {
            let idx = self.identifier_constant(heap, name);
            (OpCode::GetGlobal, OpCode::SetGlobal, idx)
        }
    }

    fn emit_get_named(&mut self, heap: &mut Heap, name: &str) {
        let (get_op, _, arg) = self.resolve_variable(heap, name);
        self.emit_ops(get_op, arg);
    }

    fn declare_variable(&mut self, name_token: &Rc<Token>) {
        let state_idx = self.states.len() - 1;
        let scope_depth = self.states[state_idx].scope_depth;
        if scope_depth == 0 {
            return;
        }
        let name = name_token.lexeme();
        let mut conflict = false;
        for local in self.states[state_idx].locals.iter().rev() {
            if let Some(depth) = local.depth {
                if depth < scope_depth {
                    break;
                }
            }
            if local.name.as_ref() == name {
                conflict = true;
                break;
            }
        }
        if conflict {
            self.emit_error(CompileError::VariableAlreadyDeclared(Rc::clone(name_token)));
        }
        self.add_local(name_token);
    }

    fn add_local(&mut self, name_token: &Rc<Token>) {
        if self.states.last().unwrap().locals.len() >= u8::MAX as usize + 1 {
            self.emit_error(CompileError::TooManyLocals(Rc::clone(name_token)));
            return;
        }
        self.states.last_mut().unwrap().locals.push(Local {
            name: Rc::from(name_token.lexeme()),
            depth: None,
            is_captured: false,
        });
    }

    fn parse_variable(&mut self, heap: &mut Heap, what: &'static str) -> u8 {
        self.consume(TokenKind::Identifier, what);
        let name_token = self.previous();
        self.declare_variable(&name_token);
        if self.states.last().unwrap().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(heap, name_token.lexeme())
    }

    fn mark_initialized(&mut self) {
        let state = self.states.last_mut().unwrap();
        if state.scope_depth == 0 {
            return;
        }
        let depth = state.scope_depth;
        state.locals.last_mut().unwrap().depth = Some(depth);
    }

    fn define_variable(&mut self, global: u8) {
        if self.states.last().unwrap().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_ops(OpCode::DefineGlobal, global);
    }

    fn begin_scope(&mut self) {
        self.states.last_mut().unwrap().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let state_idx = self.states.len() - 1;
        self.states[state_idx].scope_depth -= 1;
        let depth = self.states[state_idx].scope_depth;
        loop {
            let should_pop = match self.states[state_idx].locals.last() {
                Some(local) => local.depth.map_or(false, |d| d > depth),
                None => false,
            };
            if !should_pop {
                break;
            }
            let captured = self.states[state_idx].locals.pop().unwrap().is_captured;
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
        }
    }

    // ---- expressions --------------------------------------------------------

    fn parse_precedence(&mut self, heap: &mut Heap, precedence: Precedence) {
        self.advance();
        let prefix_rule = get_rule(self.previous.as_ref().unwrap().kind()).prefix;
        let Some(prefix_rule) = prefix_rule else {
            let token = self.previous();
            self.emit_error(CompileError::ExpectedExpression(token));
            return;
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix_rule(self, heap, can_assign);

        while precedence <= get_rule(self.current.as_ref().unwrap().kind()).precedence {
            self.advance();
            let infix_rule = get_rule(self.previous.as_ref().unwrap().kind()).infix.unwrap();
            infix_rule(self, heap, can_assign);
        }

        if can_assign && self.matches(TokenKind::Equal) {
            let token = self.previous();
            self.emit_error(CompileError::InvalidAssignmentTarget(token));
        }
    }

    fn expression(&mut self, heap: &mut Heap) {
        self.parse_precedence(heap, Precedence::Assignment);
    }

    fn number(&mut self, _heap: &mut Heap, _can_assign: bool) {
        let token = self.previous();
        let value: f64 = token.lexeme().parse().unwrap_or(0.0);
        self.emit_constant(Value::Number(value));
    }

    fn string_literal(&mut self, heap: &mut Heap, _can_assign: bool) {
        let token = self.previous();
        let lexeme = token.lexeme();
        let text = &lexeme[1..lexeme.len() - 1];
        let interned = heap.intern_string(&*self, text);
        self.emit_constant(Value::Obj(interned));
    }

    fn literal(&mut self, _heap: &mut Heap, _can_assign: bool) {
        match self.previous.as_ref().unwrap().kind() {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            _ => unreachable!("literal() only wired to false/true/nil"),
        }
    }

    fn grouping(&mut self, heap: &mut Heap, _can_assign: bool) {
        self.expression(heap);
        self.consume(TokenKind::RightParen, "')' after expression");
    }

    fn unary(&mut self, heap: &mut Heap, _can_assign: bool) {
        let kind = self.previous.as_ref().unwrap().kind();
        self.parse_precedence(heap, Precedence::Unary);
        match kind {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!("unary() only wired to '-' and '!'"),
        }
    }

    fn binary(&mut self, heap: &mut Heap, _can_assign: bool) {
        let kind = self.previous.as_ref().unwrap().kind();
        let rule = get_rule(kind);
        self.parse_precedence(heap, rule.precedence.next());
        match kind {
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => {
                self.emit_op(OpCode::Less);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => {
                self.emit_op(OpCode::Greater);
                self.emit_op(OpCode::Not);
            }
            _ => unreachable!("binary() only wired to arithmetic/comparison operators"),
        }
    }

    fn and_(&mut self, heap: &mut Heap, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(heap, Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self, heap: &mut Heap, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(heap, Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn array(&mut self, heap: &mut Heap, _can_assign: bool) {
        let mut count: usize = 0;
        if !self.check(TokenKind::RightBracket) {
            loop {
                self.expression(heap);
                count += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBracket, "']' after array elements");
        if count > u8::MAX as usize {
            let token = self.previous();
            self.emit_error(CompileError::TooManyArrayElements(token));
            count = 0;
        }
        self.emit_ops(OpCode::Array, count as u8);
    }

    fn index(&mut self, heap: &mut Heap, can_assign: bool) {
        self.expression(heap);
        self.consume(TokenKind::RightBracket, "']' after index");
        if can_assign && self.matches(TokenKind::Equal) {
            self.expression(heap);
            self.emit_op(OpCode::SetIndex);
        } else {
            self.emit_op(OpCode::GetIndex);
        }
    }

    fn dot(&mut self, heap: &mut Heap, can_assign: bool) {
        self.consume(TokenKind::Identifier, "property name after '.'");
        let name = self.previous().lexeme().to_string();

        if name == "append" && self.check(TokenKind::LeftParen) {
            self.advance();
            self.expression(heap);
            self.consume(TokenKind::RightParen, "')' after appended value");
            self.emit_op(OpCode::Append);
            return;
        }

        let name_idx = self.identifier_constant(heap, &name);

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression(heap);
            self.emit_ops(OpCode::SetProperty, name_idx);
        } else if self.matches(TokenKind::LeftParen) {
            let arg_count = self.argument_list(heap);
            self.emit_op(OpCode::Invoke);
            self.emit_byte(name_idx);
            self.emit_byte(arg_count);
        } else {
            self.emit_ops(OpCode::GetProperty, name_idx);
        }
    }

    fn call(&mut self, heap: &mut Heap, _can_assign: bool) {
        let arg_count = self.argument_list(heap);
        self.emit_ops(OpCode::Call, arg_count);
    }

    fn argument_list(&mut self, heap: &mut Heap) -> u8 {
        let mut count: usize = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression(heap);
                if count >= u8::MAX as usize {
                    let token = self.previous();
                    self.emit_error(CompileError::TooManyArguments(token));
                }
                count += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "')' after arguments");
        count.min(u8::MAX as usize) as u8
    }

    fn variable(&mut self, heap: &mut Heap, can_assign: bool) {
        let token = self.previous();
        self.named_variable(heap, token, can_assign);
    }

    fn named_variable(&mut self, heap: &mut Heap, name_token: Rc<Token>, can_assign: bool) {
        let name = name_token.lexeme().to_string();
        let (get_op, set_op, arg) = self.resolve_variable(heap, &name);
        if can_assign && self.matches(TokenKind::Equal) {
            self.expression(heap);
            self.emit_ops(set_op, arg);
        } else {
            self.emit_ops(get_op, arg);
        }
    }

    fn this_(&mut self, heap: &mut Heap, _can_assign: bool) {
        if self.class_states.is_empty() {
            let token = self.previous();
            self.emit_error(CompileError::ThisOutsideMethod(token));
            return;
        }
        let token = self.previous();
        self.named_variable(heap, token, false);
    }

    fn super_(&mut self, heap: &mut Heap, _can_assign: bool) {
        let super_token = self.previous();
        if self.class_states.is_empty() {
            self.emit_error(CompileError::SuperOutsideMethod(Rc::clone(&super_token)));
        } else if !self.class_states.last().unwrap().has_superclass {
            self.emit_error(CompileError::SuperWithoutSuperclass(Rc::clone(&super_token)));
        }
        self.consume(TokenKind::Dot, "'.' after 'super'");
        self.consume(TokenKind::Identifier, "superclass method name");
        let method_name = self.previous().lexeme().to_string();
        let name_idx = self.identifier_constant(heap, &method_name);

        self.emit_get_named(heap, "this");
        if self.matches(TokenKind::LeftParen) {
            let arg_count = self.argument_list(heap);
            self.emit_get_named(heap, "super");
            self.emit_op(OpCode::SuperInvoke);
            self.emit_byte(name_idx);
            self.emit_byte(arg_count);
        } else {
            self.emit_get_named(heap, "super");
            self.emit_ops(OpCode::GetSuper, name_idx);
        }
    }

    // ---- statements -----------------------------------------------------

    fn declaration(&mut self, heap: &mut Heap) {
        if self.matches(TokenKind::Class) {
            self.class_declaration(heap);
        } else if self.matches(TokenKind::Fun) {
            self.fun_declaration(heap);
        } else if self.matches(TokenKind::Var) {
            self.var_declaration(heap);
        } else {
            self.statement(heap);
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self, heap: &mut Heap) {
        let global = self.parse_variable(heap, "variable name");
        if self.matches(TokenKind::Equal) {
            self.expression(heap);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "';' after variable declaration");
        self.define_variable(global);
    }

    fn fun_declaration(&mut self, heap: &mut Heap) {
        let global = self.parse_variable(heap, "function name");
        self.mark_initialized();
        self.function(heap, FunctionKind::Function);
        self.define_variable(global);
    }

    fn function(&mut self, heap: &mut Heap, kind: FunctionKind) {
        let name_token = self.previous();
        let name = heap.intern_string(&*self, name_token.lexeme());
        self.push_function(kind, Some(name));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "'(' after function name");
        if !self.check(TokenKind::RightParen) {
            loop {
                let state_idx = self.states.len() - 1;
                if self.states[state_idx].arity == u8::MAX {
                    let token = self.current();
                    self.emit_error(CompileError::TooManyParameters(token));
                } else {
                    self.states[state_idx].arity += 1;
                }
                let constant = self.parse_variable(heap, "parameter name");
                self.define_variable(constant);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "')' after parameters");
        self.consume(TokenKind::LeftBrace, "'{' before function body");
        self.block(heap);

        let (function_obj, upvalues) = self.pop_function(heap);
        let idx = self.make_constant(Value::Obj(function_obj));
        self.emit_ops(OpCode::Closure, idx);
        for uv in upvalues {
            self.emit_byte(uv.is_local as u8);
            self.emit_byte(uv.index);
        }
    }

    fn class_declaration(&mut self, heap: &mut Heap) {
        self.consume(TokenKind::Identifier, "class name");
        let name_token = self.previous();
        let name_idx = self.identifier_constant(heap, name_token.lexeme());
        self.declare_variable(&name_token);

        self.emit_ops(OpCode::Class, name_idx);
        self.define_variable(name_idx);

        let mut has_superclass = false;
        if self.matches(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "superclass name");
            let super_token = self.previous();
            if super_token.lexeme() == name_token.lexeme() {
                self.emit_error(CompileError::SelfInheritance(Rc::clone(&super_token)));
            }
            self.named_variable(heap, Rc::clone(&super_token), false);

            self.begin_scope();
            self.add_local(&Rc::new(synthetic_token(&super_token, "super")));
            self.mark_initialized();

            self.named_variable(heap, name_token.clone(), false);
            self.emit_op(OpCode::Inherit);
            has_superclass = true;
        }

        self.class_states.push(ClassState { has_superclass });
        self.named_variable(heap, name_token.clone(), false);

        self.consume(TokenKind::LeftBrace, "'{' before class body");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method(heap);
        }
        self.consume(TokenKind::RightBrace, "'}' after class body");
        self.emit_op(OpCode::Pop); // the class value pushed by `named_variable` above

        if has_superclass {
            self.end_scope();
        }
        self.class_states.pop();
    }

    fn method(&mut self, heap: &mut Heap) {
        self.consume(TokenKind::Identifier, "method name");
        let name_token = self.previous();
        let name_idx = self.identifier_constant(heap, name_token.lexeme());
        let kind = if name_token.lexeme() == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(heap, kind);
        self.emit_ops(OpCode::Method, name_idx);
    }

    fn statement(&mut self, heap: &mut Heap) {
        if self.matches(TokenKind::Print) {
            self.print_statement(heap);
        } else if self.matches(TokenKind::If) {
            self.if_statement(heap);
        } else if self.matches(TokenKind::While) {
            self.while_statement(heap);
        } else if self.matches(TokenKind::For) {
            self.for_statement(heap);
        } else if self.matches(TokenKind::Return) {
            self.return_statement(heap);
        } else if self.matches(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block(heap);
            self.end_scope();
        } else {
            self.expression_statement(heap);
        }
    }

    fn block(&mut self, heap: &mut Heap) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration(heap);
        }
        self.consume(TokenKind::RightBrace, "'}' after block");
    }

    fn print_statement(&mut self, heap: &mut Heap) {
        self.expression(heap);
        self.consume(TokenKind::Semicolon, "';' after value");
        self.emit_op(OpCode::Print);
    }

    fn expression_statement(&mut self, heap: &mut Heap) {
        self.expression(heap);
        self.consume(TokenKind::Semicolon, "';' after expression");
        self.emit_op(OpCode::Pop);
    }

    fn if_statement(&mut self, heap: &mut Heap) {
        self.consume(TokenKind::LeftParen, "'(' after 'if'");
        self.expression(heap);
        self.consume(TokenKind::RightParen, "')' after condition");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement(heap);

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);

        if self.matches(TokenKind::Else) {
            self.statement(heap);
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self, heap: &mut Heap) {
        let loop_start = self.chunk().len();
        self.consume(TokenKind::LeftParen, "'(' after 'while'");
        self.expression(heap);
        self.consume(TokenKind::RightParen, "')' after condition");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement(heap);
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn for_statement(&mut self, heap: &mut Heap) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "'(' after 'for'");

        if self.matches(TokenKind::Semicolon) {
            // no initializer clause
        } else if self.matches(TokenKind::Var) {
            self.var_declaration(heap);
        } else {
            self.expression_statement(heap);
        }

        let mut loop_start = self.chunk().len();
        let mut exit_jump: Option<usize> = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression(heap);
            self.consume(TokenKind::Semicolon, "';' after loop condition");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.matches(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.chunk().len();
            self.expression(heap);
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "')' after for clauses");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement(heap);
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }

        self.end_scope();
    }

    fn return_statement(&mut self, heap: &mut Heap) {
        let return_token = self.previous();
        if self.states.last().unwrap().kind == FunctionKind::Script {
            self.emit_error(CompileError::ReturnOutsideFunction(return_token));
        }
        if self.matches(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.states.last().unwrap().kind == FunctionKind::Initializer {
                let token = self.previous();
                self.emit_error(CompileError::ReturnValueFromInitializer(token));
            }
            self.expression(heap);
            self.consume(TokenKind::Semicolon, "';' after return value");
            self.emit_op(OpCode::Return);
        }
    }
}

/// Builds a token for an identifier the compiler introduces itself (`super`'s
/// hidden local slot), reusing the position of `near` so any error raised
/// against it still points somewhere sensible in the source.
fn synthetic_token(near: &Token, lexeme: &'static str) -> Token {
    let _ = near;
    Token::new(TokenKind::Identifier, Rc::from(lexeme), 0, lexeme.len(), near.line())
}

#[cfg(test)]
mod tests {
    use super::*;
    use runtime::ObjKind;

    fn compile_ok(source: &str) -> (ObjRef, Heap) {
        let mut heap = Heap::new();
        let function = compile(source.to_string(), &mut heap).expect("expected compilation to succeed");
        (function, heap)
    }

    fn compile_err(source: &str) -> Vec<CompileError> {
        let mut heap = Heap::new();
        compile(source.to_string(), &mut heap).expect_err("expected compilation to fail")
    }

    #[test]
    fn compiles_an_empty_script_to_just_a_return() {
        let (function, _heap) = compile_ok("");
        let chunk = &function.as_function().unwrap().chunk;
        assert_eq!(chunk.code, vec![OpCode::Nil as u8, OpCode::Return as u8]);
    }

    #[test]
    fn arithmetic_respects_precedence() {
        let (function, _heap) = compile_ok("1 + 2 * 3;");
        let chunk = &function.as_function().unwrap().chunk;
        assert!(chunk.code.contains(&(OpCode::Multiply as u8)));
        assert!(chunk.code.contains(&(OpCode::Add as u8)));
        let mul_pos = chunk.code.iter().position(|&b| b == OpCode::Multiply as u8).unwrap();
        let add_pos = chunk.code.iter().position(|&b| b == OpCode::Add as u8).unwrap();
        assert!(mul_pos < add_pos);
    }

    #[test]
    fn identical_string_literals_share_one_constant_slot() {
        let (function, _heap) = compile_ok(r#"print "hi"; print "hi";"#);
        let chunk = &function.as_function().unwrap().chunk;
        assert_eq!(chunk.constants.len(), 1);
    }

    #[test]
    fn global_variable_round_trips_get_and_set() {
        let (function, _heap) = compile_ok("var x = 1; x = 2; print x;");
        let chunk = &function.as_function().unwrap().chunk;
        assert!(chunk.code.contains(&(OpCode::DefineGlobal as u8)));
        assert!(chunk.code.contains(&(OpCode::SetGlobal as u8)));
        assert!(chunk.code.contains(&(OpCode::GetGlobal as u8)));
    }

    #[test]
    fn local_variables_never_touch_the_globals_table() {
        let (function, _heap) = compile_ok("{ var x = 1; print x; }");
        let chunk = &function.as_function().unwrap().chunk;
        assert!(!chunk.code.contains(&(OpCode::DefineGlobal as u8)));
        assert!(chunk.code.contains(&(OpCode::GetLocal as u8)));
    }

    #[test]
    fn reading_own_initializer_is_an_error() {
        let errors = compile_err("{ var x = x; }");
        assert!(matches!(errors[0], CompileError::SelfReadInOwnInitializer(_)));
    }

    #[test]
    fn redeclaring_a_local_in_the_same_scope_is_an_error() {
        let errors = compile_err("{ var x = 1; var x = 2; }");
        assert!(matches!(errors[0], CompileError::VariableAlreadyDeclared(_)));
    }

    #[test]
    fn nested_function_closes_over_an_enclosing_local() {
        let (function, _heap) =
            compile_ok("fun outer() { var x = 1; fun inner() { return x; } return inner; }");
        let chunk = &function.as_function().unwrap().chunk;
        assert!(chunk.code.contains(&(OpCode::Closure as u8)));
    }

    #[test]
    fn returning_from_top_level_is_an_error() {
        let errors = compile_err("return 1;");
        assert!(matches!(errors[0], CompileError::ReturnOutsideFunction(_)));
    }

    #[test]
    fn this_outside_a_method_is_an_error() {
        let errors = compile_err("print this;");
        assert!(matches!(errors[0], CompileError::ThisOutsideMethod(_)));
    }

    #[test]
    fn class_with_method_emits_class_and_method_ops() {
        let (function, _heap) = compile_ok("class Foo { bar() { return 1; } }");
        let chunk = &function.as_function().unwrap().chunk;
        assert!(chunk.code.contains(&(OpCode::Class as u8)));
        assert!(chunk.code.contains(&(OpCode::Method as u8)));
    }

    #[test]
    fn class_inheriting_from_itself_is_an_error() {
        let errors = compile_err("class Foo < Foo {}");
        assert!(matches!(errors[0], CompileError::SelfInheritance(_)));
    }

    #[test]
    fn super_outside_a_subclass_is_an_error() {
        let errors = compile_err("class Foo { bar() { return super.bar(); } }");
        assert!(matches!(errors[0], CompileError::SuperWithoutSuperclass(_)));
    }

    #[test]
    fn array_literal_emits_array_op_with_element_count() {
        let (function, _heap) = compile_ok("[1, 2, 3];");
        let chunk = &function.as_function().unwrap().chunk;
        let pos = chunk.code.iter().position(|&b| b == OpCode::Array as u8).unwrap();
        assert_eq!(chunk.code[pos + 1], 3);
    }

    #[test]
    fn method_call_compiles_to_invoke_not_get_property_then_call() {
        let (function, _heap) = compile_ok("class Foo { bar() { return 1; } } Foo().bar();");
        let chunk = &function.as_function().unwrap().chunk;
        assert!(chunk.code.contains(&(OpCode::Invoke as u8)));
    }

    #[test]
    fn function_object_carries_its_own_name() {
        let (function, _heap) = compile_ok("fun greet() {}");
        let chunk = &function.as_function().unwrap().chunk;
        let closure_pos = chunk.code.iter().position(|&b| b == OpCode::Closure as u8).unwrap();
        let constant_idx = chunk.code[closure_pos + 1];
        let inner = chunk.constants[constant_idx as usize].as_obj().unwrap();
        assert_eq!(inner.kind(), ObjKind::Function);
        assert_eq!(inner.as_function().unwrap().name.unwrap().to_string(), "greet");
    }

    #[test]
    fn call_with_256_arguments_is_too_many() {
        let args = (0..256).map(|i| i.to_string()).collect::<Vec<_>>().join(", ");
        let errors = compile_err(&format!("f({args});"));
        assert!(matches!(errors[0], CompileError::TooManyArguments(_)));
    }

    #[test]
    fn call_with_255_arguments_compiles() {
        let args = (0..255).map(|i| i.to_string()).collect::<Vec<_>>().join(", ");
        let (function, _heap) = compile_ok(&format!("f({args});"));
        let chunk = &function.as_function().unwrap().chunk;
        let pos = chunk.code.iter().position(|&b| b == OpCode::Call as u8).unwrap();
        assert_eq!(chunk.code[pos + 1], 255);
    }
}
