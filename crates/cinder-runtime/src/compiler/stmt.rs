//! Declarations and statements
//!
//! `declaration` handles `var` / `fun` / `class` plus panic-mode recovery;
//! `statement` handles print, control flow, blocks, returns, and expression
//! statements. Loops and branches are wired with forward jumps patched after
//! the fact; `for` compiles its increment before the body and jumps around
//! it, the only shape a single pass allows.

use super::{Compiler, FunctionKind, FunctionState, UpvalueMeta};
use crate::bytecode::Opcode;
use crate::token::TokenKind;
use crate::value::Value;

impl<'src, 'h> Compiler<'src, 'h> {
    pub(super) fn declaration(&mut self) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    pub(super) fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expected '}' after block.");
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expected variable name.");

        self.consume(
            TokenKind::Equal,
            "Expected initialization of variable after declaration.",
        );
        self.expression();
        self.consume(
            TokenKind::Semicolon,
            "Expected ';' after variable declaration.",
        );

        self.define_variable(global);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expected function name.");
        // Initialized before the body compiles so the function can recurse
        self.mark_initialized();
        self.compile_function(FunctionKind::Function);
        self.define_variable(global);
    }

    /// Compile a function body in a fresh state and emit the closure for it
    fn compile_function(&mut self, kind: FunctionKind) {
        let name = self.heap.intern(self.previous.lexeme);
        self.states.push(FunctionState::new(kind, Some(name)));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expected '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.state().function.arity == u8::MAX {
                    self.error_at_current("Can't have more than 255 parameters.");
                } else {
                    self.state_mut().function.arity += 1;
                }
                let constant = self.parse_variable("Expected parameter name.");
                self.define_variable(constant);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expected ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expected '{' before function body.");
        self.block();

        // No end_scope: discarding the state discards its locals, and the
        // emitted Return unwinds the whole frame at runtime.
        let (function, upvalues) = self.end_function();
        let index = self.make_constant(Value::Obj(function));
        self.emit_const_op(Opcode::Closure, Opcode::ClosureLong, index);

        for UpvalueMeta { index, is_local } in upvalues {
            self.emit_byte(is_local as u8);
            self.emit_byte(index);
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expected class name.");
        let class_name = self.previous;
        let name_constant = self.identifier_constant(self.previous.lexeme);
        self.declare_variable();

        self.emit_const_op(Opcode::Class, Opcode::ClassLong, name_constant);
        self.define_variable(name_constant);

        self.class_depth += 1;

        // Reload the class so Method has it under each closure
        self.named_variable(class_name, false);
        self.consume(TokenKind::LeftBrace, "Expected '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expected '}' after class body.");
        self.emit(Opcode::Pop);

        self.class_depth -= 1;
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expected method name.");
        let name_constant = self.identifier_constant(self.previous.lexeme);

        let kind = if self.previous.lexeme == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.compile_function(kind);

        self.emit_const_op(Opcode::Method, Opcode::MethodLong, name_constant);
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expected ';' after value.");
        self.emit(Opcode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expected ';' after expression.");
        self.emit(Opcode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expected '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expected ')' after condition.");

        let then_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit(Opcode::Pop); // condition, then branch
        self.statement();

        let else_jump = self.emit_jump(Opcode::Jump);

        self.patch_jump(then_jump);
        self.emit(Opcode::Pop); // condition, else branch

        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        // The condition re-evaluates on every pass
        let loop_start = self.chunk_offset();

        self.consume(TokenKind::LeftParen, "Expected '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expected ')' after condition.");

        let exit_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit(Opcode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit(Opcode::Pop);
    }

    /// `for (init; cond; inc) body`
    ///
    /// The increment clause appears in the bytecode before the body but runs
    /// after it: control jumps over the increment into the body, the body
    /// loops back to the increment, and the increment loops back to the
    /// condition.
    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expected '(' after 'for'.");

        if self.match_token(TokenKind::Semicolon) {
            // No initializer
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk_offset();
        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expected ';' after loop condition.");

            exit_jump = Some(self.emit_jump(Opcode::JumpIfFalse));
            self.emit(Opcode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(Opcode::Jump);
            let increment_start = self.chunk_offset();
            self.expression();
            self.emit(Opcode::Pop);
            self.consume(TokenKind::RightParen, "Expected ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit(Opcode::Pop);
        }

        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
            return;
        }

        // A value return; legal everywhere (a top-level return value becomes
        // the process exit code) except in initializers.
        if self.state().kind == FunctionKind::Initializer {
            self.error("Can't return a value from an initializer.");
        }
        self.expression();
        self.consume(TokenKind::Semicolon, "Expected ';' after return value.");
        self.emit(Opcode::Return);
    }
}
