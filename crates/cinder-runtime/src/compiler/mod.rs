//! Single-pass bytecode compiler
//!
//! A Pratt parser that emits bytecode as it parses; there is no AST. The
//! compiler keeps a stack of per-function states (the innermost is the
//! function being compiled); each state owns the function under
//! construction, its locals, and its upvalue metadata. The locals array has
//! the exact same layout the VM stack will have for that function's frame
//! at runtime.
//!
//! Error recovery is panic-mode: the first error on a statement suppresses
//! the rest until the parser synchronizes at a statement boundary. All
//! errors are collected and reported together; a chunk that produced errors
//! is discarded.

mod expr;
mod stmt;

use crate::bytecode::{Chunk, Opcode, CONSTANTS_MAX};
use crate::diagnostic::{CompileError, ErrorLocation};
use crate::heap::Heap;
use crate::lexer::Lexer;
use crate::object::{FunctionObj, ObjKind, ObjRef};
use crate::token::{Token, TokenKind};
use crate::value::Value;

/// Upper bound on locals and on upvalues per function (1-byte slot indices)
const LOCALS_MAX: usize = 256;
const UPVALUES_MAX: usize = 256;

/// Compile source to the top-level script function.
///
/// On success the returned function has arity 0 and no name; the VM wraps
/// it in a closure and calls it. On failure every collected error is
/// returned and nothing runs.
pub fn compile(source: &str, heap: &mut Heap) -> Result<ObjRef, Vec<CompileError>> {
    let mut compiler = Compiler::new(source, heap);
    compiler.advance();
    while !compiler.match_token(TokenKind::Eof) {
        compiler.declaration();
    }
    let (script, _) = compiler.end_function();

    if compiler.had_error {
        Err(compiler.errors)
    } else {
        Ok(script)
    }
}

/// What kind of function body is being compiled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FunctionKind {
    /// Top-level code
    Script,
    /// `fun` declaration
    Function,
    /// Method in a class body
    Method,
    /// The `init` method; returns its receiver
    Initializer,
}

/// A local variable slot.
///
/// `depth == -1` marks a declared-but-uninitialized local; reading it inside
/// its own initializer is a compile error.
#[derive(Debug)]
struct Local<'src> {
    name: &'src str,
    depth: i32,
    is_captured: bool,
}

/// How a closure sources one upvalue: from the enclosing frame's locals
/// (`is_local`) or from the enclosing closure's own upvalues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct UpvalueMeta {
    pub(crate) index: u8,
    pub(crate) is_local: bool,
}

/// Per-function compiler state
struct FunctionState<'src> {
    kind: FunctionKind,
    /// The function being built; its chunk receives all emitted code
    function: FunctionObj,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueMeta>,
    scope_depth: i32,
}

impl<'src> FunctionState<'src> {
    fn new(kind: FunctionKind, name: Option<ObjRef>) -> Self {
        // Slot 0 belongs to the callee; in methods it is `this`
        let reserved = Local {
            name: match kind {
                FunctionKind::Method | FunctionKind::Initializer => "this",
                _ => "",
            },
            depth: 0,
            is_captured: false,
        };
        Self {
            kind,
            function: FunctionObj::new(name),
            locals: vec![reserved],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

/// Compiler state: parser position plus the function-state stack
struct Compiler<'src, 'h> {
    heap: &'h mut Heap,
    lexer: Lexer<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,
    states: Vec<FunctionState<'src>>,
    /// Nesting depth of class bodies; `this` is legal only above zero
    class_depth: usize,
}

impl<'src, 'h> Compiler<'src, 'h> {
    fn new(source: &'src str, heap: &'h mut Heap) -> Self {
        let placeholder = Token {
            kind: TokenKind::Eof,
            lexeme: "",
            line: 1,
        };
        Self {
            heap,
            lexer: Lexer::new(source),
            current: placeholder,
            previous: placeholder,
            had_error: false,
            panic_mode: false,
            errors: Vec::new(),
            states: vec![FunctionState::new(FunctionKind::Script, None)],
            class_depth: 0,
        }
    }

    // ===== Token plumbing =====

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.lexer.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            // Error tokens carry their message in the lexeme slot
            let token = self.current;
            self.error_at(token, token.lexeme);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    /// Advance when the current token matches
    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    // ===== Errors =====

    fn error(&mut self, message: &str) {
        let token = self.previous;
        self.error_at(token, message);
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.current;
        self.error_at(token, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;

        let location = match token.kind {
            TokenKind::Eof => ErrorLocation::Eof,
            TokenKind::Error => ErrorLocation::Source,
            _ => ErrorLocation::Lexeme(token.lexeme.to_string()),
        };
        self.errors.push(CompileError {
            line: token.line,
            location,
            message: message.to_string(),
        });
    }

    /// Skip tokens until a likely statement boundary, then resume reporting
    fn synchronize(&mut self) {
        self.panic_mode = false;

        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ===== State access =====

    fn state(&self) -> &FunctionState<'src> {
        self.states.last().expect("compiler state underflow")
    }

    fn state_mut(&mut self) -> &mut FunctionState<'src> {
        self.states.last_mut().expect("compiler state underflow")
    }

    fn chunk_mut(&mut self) -> &mut Chunk {
        &mut self.state_mut().function.chunk
    }

    fn chunk_offset(&self) -> usize {
        self.state().function.chunk.offset()
    }

    // ===== Emission =====

    fn emit(&mut self, opcode: Opcode) {
        let line = self.previous.line;
        self.chunk_mut().write_op(opcode, line);
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.chunk_mut().write(byte, line);
    }

    /// Add a constant, reporting an error when the pool is full
    fn make_constant(&mut self, value: Value) -> usize {
        if self.state().function.chunk.constants.len() >= CONSTANTS_MAX {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        self.chunk_mut().add_constant(value)
    }

    /// Emit a constant load, short or long form by index width
    fn emit_constant(&mut self, value: Value) {
        if self.state().function.chunk.constants.len() >= CONSTANTS_MAX {
            self.error("Too many constants in one chunk.");
            return;
        }
        let line = self.previous.line;
        self.chunk_mut().write_constant(value, line);
    }

    /// Emit `short index8` or `long index24` depending on the index
    fn emit_const_op(&mut self, short: Opcode, long: Opcode, index: usize) {
        if index <= u8::MAX as usize {
            self.emit(short);
            self.emit_byte(index as u8);
        } else {
            self.emit(long);
            self.emit_byte((index >> 16) as u8);
            self.emit_byte((index >> 8) as u8);
            self.emit_byte(index as u8);
        }
    }

    /// Emit a forward jump with placeholder offset; returns the patch site
    fn emit_jump(&mut self, opcode: Opcode) -> usize {
        self.emit(opcode);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.chunk_offset() - 2
    }

    /// Patch a forward jump to land on the current offset
    fn patch_jump(&mut self, offset: usize) {
        // -2 adjusts for the operand bytes themselves
        let jump = self.chunk_offset() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Jump is too far away. Consider implementing a JUMP_LONG instruction.");
        }

        let chunk = self.chunk_mut();
        chunk.code[offset] = ((jump >> 8) & 0xff) as u8;
        chunk.code[offset + 1] = (jump & 0xff) as u8;
    }

    /// Emit a backward jump to `loop_start`
    fn emit_loop(&mut self, loop_start: usize) {
        self.emit(Opcode::Loop);

        // +2 skips the operand bytes the VM will have consumed
        let offset = self.chunk_offset() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }

        self.emit_byte(((offset >> 8) & 0xff) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    /// Emit the implicit function epilogue.
    ///
    /// Initializers return their receiver from slot 0; everything else
    /// returns nil on fallthrough.
    fn emit_return(&mut self) {
        if self.state().kind == FunctionKind::Initializer {
            self.emit(Opcode::GetLocal);
            self.emit_byte(0);
        } else {
            self.emit(Opcode::Nil);
        }
        self.emit(Opcode::Return);
    }

    /// Finish the innermost function: epilogue, then allocate the function
    /// object. Returns it with the upvalue metadata its `Closure` needs.
    fn end_function(&mut self) -> (ObjRef, Vec<UpvalueMeta>) {
        self.emit_return();
        let state = self.states.pop().expect("compiler state underflow");
        let mut function = state.function;
        function.upvalue_count = state.upvalues.len();
        let function = self.heap.alloc(ObjKind::Function(function));
        (function, state.upvalues)
    }

    // ===== Scopes and variables =====

    fn begin_scope(&mut self) {
        self.state_mut().scope_depth += 1;
    }

    /// Leave a scope, dropping its locals. Plain locals are popped in
    /// coalesced runs; captured locals are hoisted with `CloseUpvalue`.
    fn end_scope(&mut self) {
        self.state_mut().scope_depth -= 1;

        let mut run: u32 = 0;
        loop {
            let doomed = {
                let state = self.state();
                match state.locals.last() {
                    Some(local) if local.depth > state.scope_depth => Some(local.is_captured),
                    _ => None,
                }
            };
            match doomed {
                Some(true) => {
                    self.emit_pop_run(run);
                    run = 0;
                    self.emit(Opcode::CloseUpvalue);
                }
                Some(false) => run += 1,
                None => break,
            }
            self.state_mut().locals.pop();
        }
        self.emit_pop_run(run);
    }

    fn emit_pop_run(&mut self, run: u32) {
        match run {
            0 => {}
            1 => self.emit(Opcode::Pop),
            n => {
                self.emit(Opcode::PopN);
                self.emit_byte(n as u8);
            }
        }
    }

    /// Intern an identifier and add it to the constant pool
    fn identifier_constant(&mut self, name: &str) -> usize {
        let name = self.heap.intern(name);
        self.make_constant(Value::Obj(name))
    }

    /// Consume an identifier; declare it as a local in a nested scope, or
    /// return its name-constant index for a global.
    fn parse_variable(&mut self, message: &str) -> usize {
        self.consume(TokenKind::Identifier, message);

        self.declare_variable();
        if self.state().scope_depth > 0 {
            return 0; // locals are addressed by slot, not by name
        }

        self.identifier_constant(self.previous.lexeme)
    }

    /// Record a new local for the just-parsed identifier. Globals are late
    /// bound and never declared.
    fn declare_variable(&mut self) {
        if self.state().scope_depth == 0 {
            return;
        }

        let name = self.previous.lexeme;

        // Redeclaration in the same scope is an error; shadowing an outer
        // scope is fine.
        let mut duplicate = false;
        {
            let state = self.state();
            for local in state.locals.iter().rev() {
                if local.depth != -1 && local.depth < state.scope_depth {
                    break;
                }
                if local.name == name {
                    duplicate = true;
                    break;
                }
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }

        self.add_local(name);
    }

    fn add_local(&mut self, name: &'src str) {
        if self.state().locals.len() == LOCALS_MAX {
            self.error("Too many local variables in function.");
            return;
        }
        self.state_mut().locals.push(Local {
            name,
            depth: -1, // uninitialized until defineVariable
            is_captured: false,
        });
    }

    /// The just-declared local is ready for use (its initializer finished)
    fn mark_initialized(&mut self) {
        let state = self.state_mut();
        if state.scope_depth == 0 {
            return;
        }
        let depth = state.scope_depth;
        if let Some(local) = state.locals.last_mut() {
            local.depth = depth;
        }
    }

    /// Bind the initialized value: mark a local ready, or emit the global
    /// definition for the given name constant.
    fn define_variable(&mut self, global: usize) {
        if self.state().scope_depth > 0 {
            self.mark_initialized();
            return;
        }

        self.emit_const_op(Opcode::DefineGlobal, Opcode::DefineGlobalLong, global);
    }

    /// Find `name` among the locals of the function at `state_index`,
    /// innermost first. The returned index is the runtime stack slot.
    fn resolve_local(&mut self, state_index: usize, name: &str) -> Option<u8> {
        let mut found = None;
        for (index, local) in self.states[state_index].locals.iter().enumerate().rev() {
            if local.name == name {
                found = Some((index, local.depth == -1));
                break;
            }
        }

        match found {
            Some((index, uninitialized)) => {
                if uninitialized {
                    self.error("Can't read local variable in its own initializer.");
                }
                Some(index as u8)
            }
            None => None,
        }
    }

    /// Find `name` in an enclosing function, threading an upvalue through
    /// every intervening function state. Marks the captured local.
    fn resolve_upvalue(&mut self, state_index: usize, name: &str) -> Option<u8> {
        if state_index == 0 {
            return None;
        }

        if let Some(local) = self.resolve_local(state_index - 1, name) {
            self.states[state_index - 1].locals[local as usize].is_captured = true;
            return self.add_upvalue(state_index, local, true);
        }

        if let Some(upvalue) = self.resolve_upvalue(state_index - 1, name) {
            return self.add_upvalue(state_index, upvalue, false);
        }

        None
    }

    /// Add (or reuse) an upvalue entry on the function at `state_index`
    fn add_upvalue(&mut self, state_index: usize, index: u8, is_local: bool) -> Option<u8> {
        if let Some(existing) = self.states[state_index]
            .upvalues
            .iter()
            .position(|upvalue| upvalue.index == index && upvalue.is_local == is_local)
        {
            return Some(existing as u8);
        }

        if self.states[state_index].upvalues.len() == UPVALUES_MAX {
            self.error("Too many closure variables in function.");
            return Some(0);
        }

        self.states[state_index]
            .upvalues
            .push(UpvalueMeta { index, is_local });
        Some((self.states[state_index].upvalues.len() - 1) as u8)
    }
}
