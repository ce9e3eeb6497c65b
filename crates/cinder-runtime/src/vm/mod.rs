//! Stack-based virtual machine
//!
//! Executes bytecode with a value stack and call frames.
//! - One frame per call; slot 0 is the callee or `this`
//! - Closures capture locals through open upvalues, hoisted when scopes end
//! - Classes dispatch through a method table; fields live on the instance
//! - Runtime errors capture a stack trace and reset the VM
//!
//! The VM owns the heap; the collector in [`gc`] finds its roots here.

mod frame;
mod gc;

pub use frame::CallFrame;

use crate::bytecode::{Chunk, Opcode};
use crate::compiler::compile;
use crate::diagnostic::{InterpretError, RuntimeError, TraceFrame};
use crate::heap::Heap;
use crate::object::{
    BoundMethodObj, ClassObj, ClosureObj, InstanceObj, NativeFn, NativeObj, ObjKind, ObjRef,
    UpvalueObj, UpvalueState,
};
use crate::stdlib::{clock_native, stdout_writer, OutputWriter};
use crate::table::Table;
use crate::value::Value;
use std::io::Write;

/// Maximum call depth
pub const FRAMES_MAX: usize = 64;
/// Value stack capacity, reserved up front
pub const STACK_MAX: usize = FRAMES_MAX * 256;

/// Virtual machine state
pub struct VM {
    /// Value stack
    stack: Vec<Value>,
    /// Call frames
    frames: Vec<CallFrame>,
    /// Global variables, late-bound by name
    globals: Table,
    /// Object heap (also owns the interning table)
    heap: Heap,
    /// Head of the open-upvalue list, ordered by decreasing stack slot
    open_upvalues: Option<ObjRef>,
    /// Interned `"init"`, looked up on every class call
    init_string: ObjRef,
    /// Sink for `print` output
    output: OutputWriter,
}

impl VM {
    /// Create a VM with the native environment registered
    pub fn new() -> Self {
        let mut heap = Heap::new();
        let init_string = heap.intern("init");

        let mut vm = Self {
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: Table::new(),
            heap,
            open_upvalues: None,
            init_string,
            output: stdout_writer(),
        };
        vm.define_native("clock", clock_native);
        vm
    }

    /// Set the output writer (used by embedders and tests to capture print)
    pub fn set_output_writer(&mut self, writer: OutputWriter) {
        self.output = writer;
    }

    /// Read-only view of the heap (diagnostics, tests)
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Current value-stack depth (diagnostics, tests)
    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    /// Compile and run `source` to completion.
    ///
    /// Returns the script's exit code: 0 unless a top-level `return`
    /// produced something else (nil/true → 0, false → 1, number →
    /// truncated). Compile errors run nothing; runtime errors reset the
    /// stacks, so the VM (and its globals) stay usable, which is what the
    /// REPL relies on.
    pub fn interpret(&mut self, source: &str) -> Result<i32, InterpretError> {
        let script = compile(source, &mut self.heap).map_err(InterpretError::Compile)?;

        // Anchor the script function while its closure is allocated
        self.push(Value::Obj(script));
        let closure = self.alloc(ObjKind::Closure(ClosureObj {
            function: script,
            upvalues: Vec::new(),
        }));
        self.pop();
        self.push(Value::Obj(closure));
        self.call_closure(closure, 0).map_err(|error| {
            self.reset_stack();
            InterpretError::Runtime(error)
        })?;

        match self.run() {
            Ok(code) => Ok(code),
            Err(error) => {
                self.reset_stack();
                Err(InterpretError::Runtime(error))
            }
        }
    }

    /// Register a native function as a global.
    ///
    /// Both the name and the native are anchored on the stack across the
    /// second allocation, per the allocation-hazard rule.
    fn define_native(&mut self, name: &str, function: NativeFn) {
        let name = self.intern(name);
        self.push(Value::Obj(name));
        let native = self.alloc(ObjKind::Native(NativeObj { function }));
        self.push(Value::Obj(native));

        let hash = self.heap.string(name).hash;
        self.globals.set(name, hash, Value::Obj(native));

        self.pop();
        self.pop();
    }

    // ===== Dispatch loop =====

    fn run(&mut self) -> Result<i32, RuntimeError> {
        loop {
            #[cfg(feature = "trace-exec")]
            self.trace_instruction();

            let opcode = Opcode::try_from(self.read_byte()).expect("invalid opcode in chunk");
            match opcode {
                // ===== Constants and literals =====
                Opcode::Constant => {
                    let value = self.read_constant(false);
                    self.push(value);
                }
                Opcode::ConstantLong => {
                    let value = self.read_constant(true);
                    self.push(value);
                }
                Opcode::Nil => self.push(Value::Nil),
                Opcode::True => self.push(Value::Bool(true)),
                Opcode::False => self.push(Value::Bool(false)),
                Opcode::Zero => self.push(Value::Number(0.0)),
                Opcode::One => self.push(Value::Number(1.0)),
                Opcode::NegOne => self.push(Value::Number(-1.0)),

                // ===== Stack =====
                Opcode::Pop => {
                    self.pop();
                }
                Opcode::PopN => {
                    let count = self.read_byte() as usize;
                    self.stack.truncate(self.stack.len() - count);
                }

                // ===== Variables =====
                Opcode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let value = self.stack[self.frame().slots + slot];
                    self.push(value);
                }
                Opcode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let value = self.peek(0);
                    let base = self.frame().slots;
                    self.stack[base + slot] = value;
                }
                Opcode::GetGlobal => {
                    let name = self.read_constant(false);
                    self.get_global(name)?;
                }
                Opcode::GetGlobalLong => {
                    let name = self.read_constant(true);
                    self.get_global(name)?;
                }
                Opcode::SetGlobal => {
                    let name = self.read_constant(false);
                    self.set_global(name)?;
                }
                Opcode::SetGlobalLong => {
                    let name = self.read_constant(true);
                    self.set_global(name)?;
                }
                Opcode::DefineGlobal => {
                    let name = self.read_constant(false);
                    self.define_global(name);
                }
                Opcode::DefineGlobalLong => {
                    let name = self.read_constant(true);
                    self.define_global(name);
                }
                Opcode::GetUpvalue => {
                    let index = self.read_byte() as usize;
                    let upvalue = self.heap.closure(self.frame().closure).upvalues[index];
                    let value = match self.heap.upvalue(upvalue).state {
                        UpvalueState::Open(slot) => self.stack[slot],
                        UpvalueState::Closed(value) => value,
                    };
                    self.push(value);
                }
                Opcode::SetUpvalue => {
                    let index = self.read_byte() as usize;
                    let value = self.peek(0);
                    let upvalue = self.heap.closure(self.frame().closure).upvalues[index];
                    match self.heap.upvalue(upvalue).state {
                        UpvalueState::Open(slot) => self.stack[slot] = value,
                        UpvalueState::Closed(_) => {
                            self.heap.upvalue_mut(upvalue).state = UpvalueState::Closed(value);
                        }
                    }
                }

                // ===== Properties =====
                Opcode::GetProperty => {
                    let name = self.read_constant(false);
                    self.get_property(name)?;
                }
                Opcode::GetPropertyLong => {
                    let name = self.read_constant(true);
                    self.get_property(name)?;
                }
                Opcode::SetProperty => {
                    let name = self.read_constant(false);
                    self.set_property(name)?;
                }
                Opcode::SetPropertyLong => {
                    let name = self.read_constant(true);
                    self.set_property(name)?;
                }

                // ===== Equality and ordering =====
                Opcode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                Opcode::Greater => self.binary_comparison(|a, b| a > b)?,
                Opcode::Less => self.binary_comparison(|a, b| a < b)?,
                Opcode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()));
                }

                // ===== Arithmetic =====
                Opcode::Add => self.add()?,
                Opcode::Subtract => self.binary_arithmetic(|a, b| a - b)?,
                Opcode::Multiply => self.binary_arithmetic(|a, b| a * b)?,
                Opcode::Divide => {
                    let (Value::Number(a), Value::Number(b)) = (self.peek(1), self.peek(0)) else {
                        return Err(self.runtime_error("Operands must be numbers."));
                    };
                    if b == 0.0 {
                        return Err(self.runtime_error("Divide by zero."));
                    }
                    self.pop();
                    self.pop();
                    self.push(Value::Number(a / b));
                }
                Opcode::Negate => {
                    let Value::Number(n) = self.peek(0) else {
                        return Err(self.runtime_error("Operand must be a number."));
                    };
                    self.pop();
                    self.push(Value::Number(-n));
                }

                Opcode::Print => {
                    let value = self.pop();
                    let text = self.heap.format_value(value);
                    let _ = writeln!(self.output.borrow_mut(), "{}", text);
                }

                // ===== Control flow =====
                Opcode::Jump => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip += offset;
                }
                Opcode::JumpIfFalse => {
                    let offset = self.read_u16() as usize;
                    // The condition stays; statement code pops it
                    if self.peek(0).is_falsey() {
                        self.frame_mut().ip += offset;
                    }
                }
                Opcode::Loop => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip -= offset;
                }

                // ===== Calls and closures =====
                Opcode::Call => {
                    let arg_count = self.read_byte() as usize;
                    self.call_value(arg_count)?;
                }
                Opcode::Closure => {
                    let function = self.read_constant(false);
                    self.make_closure(function);
                }
                Opcode::ClosureLong => {
                    let function = self.read_constant(true);
                    self.make_closure(function);
                }
                Opcode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                Opcode::Return => {
                    let result = self.pop();
                    let frame_slots = self.frame().slots;

                    if self.frames.len() == 1 {
                        // Outermost frame: the script's return value becomes
                        // the exit code
                        let code = match result {
                            Value::Nil | Value::Bool(true) => 0,
                            Value::Bool(false) => 1,
                            Value::Number(n) => n as i32,
                            Value::Obj(_) => {
                                return Err(self.runtime_error(
                                    "Script must return a number, boolean, or nil.",
                                ));
                            }
                        };
                        self.close_upvalues(frame_slots);
                        self.frames.pop();
                        self.stack.truncate(frame_slots);
                        return Ok(code);
                    }

                    self.close_upvalues(frame_slots);
                    self.frames.pop();
                    self.stack.truncate(frame_slots);
                    self.push(result);
                }

                // ===== Classes =====
                Opcode::Class => {
                    let name = self.read_constant(false);
                    self.make_class(name);
                }
                Opcode::ClassLong => {
                    let name = self.read_constant(true);
                    self.make_class(name);
                }
                Opcode::Method => {
                    let name = self.read_constant(false);
                    self.define_method(name);
                }
                Opcode::MethodLong => {
                    let name = self.read_constant(true);
                    self.define_method(name);
                }
            }
        }
    }

    // ===== Stack helpers =====

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues = None;
    }

    // ===== Frame and instruction readers =====

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("call frame underflow")
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("call frame underflow")
    }

    fn current_chunk(&self) -> &Chunk {
        let function = self.heap.closure(self.frame().closure).function;
        &self.heap.function(function).chunk
    }

    fn read_byte(&mut self) -> u8 {
        let ip = self.frame().ip;
        let byte = self.current_chunk().code[ip];
        self.frame_mut().ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let high = self.read_byte() as u16;
        let low = self.read_byte() as u16;
        (high << 8) | low
    }

    fn read_u24(&mut self) -> usize {
        let high = self.read_byte() as usize;
        let mid = self.read_byte() as usize;
        let low = self.read_byte() as usize;
        (high << 16) | (mid << 8) | low
    }

    fn read_constant(&mut self, long: bool) -> Value {
        let index = if long {
            self.read_u24()
        } else {
            self.read_byte() as usize
        };
        self.current_chunk().constants[index]
    }

    // ===== Arithmetic =====

    /// Polymorphic `+`: two numbers add, two strings concatenate
    fn add(&mut self) -> Result<(), RuntimeError> {
        if let (Value::Number(a), Value::Number(b)) = (self.peek(1), self.peek(0)) {
            self.pop();
            self.pop();
            self.push(Value::Number(a + b));
            return Ok(());
        }
        if self.operands_are_strings() {
            self.concatenate();
            return Ok(());
        }
        Err(self.runtime_error("Operands must be two numbers or two strings."))
    }

    fn operands_are_strings(&self) -> bool {
        matches!(
            (self.peek(1), self.peek(0)),
            (Value::Obj(a), Value::Obj(b))
                if matches!(self.heap.kind(a), ObjKind::String(_))
                    && matches!(self.heap.kind(b), ObjKind::String(_))
        )
    }

    fn concatenate(&mut self) {
        // Operands stay on the stack across the interning allocation
        let b = self.peek(0).as_obj().expect("string operand");
        let a = self.peek(1).as_obj().expect("string operand");

        let mut chars =
            String::with_capacity(self.heap.string(a).chars.len() + self.heap.string(b).chars.len());
        chars.push_str(&self.heap.string(a).chars);
        chars.push_str(&self.heap.string(b).chars);
        let result = self.intern_owned(chars);

        self.pop();
        self.pop();
        self.push(Value::Obj(result));
    }

    fn binary_arithmetic(&mut self, op: impl FnOnce(f64, f64) -> f64) -> Result<(), RuntimeError> {
        let (Value::Number(a), Value::Number(b)) = (self.peek(1), self.peek(0)) else {
            return Err(self.runtime_error("Operands must be numbers."));
        };
        self.pop();
        self.pop();
        self.push(Value::Number(op(a, b)));
        Ok(())
    }

    fn binary_comparison(&mut self, op: impl FnOnce(f64, f64) -> bool) -> Result<(), RuntimeError> {
        let (Value::Number(a), Value::Number(b)) = (self.peek(1), self.peek(0)) else {
            return Err(self.runtime_error("Operands must be numbers."));
        };
        self.pop();
        self.pop();
        self.push(Value::Bool(op(a, b)));
        Ok(())
    }

    // ===== Globals =====

    fn get_global(&mut self, name: Value) -> Result<(), RuntimeError> {
        let name = name.as_obj().expect("global name constant");
        let hash = self.heap.string(name).hash;
        match self.globals.get(name, hash) {
            Some(value) => {
                self.push(value);
                Ok(())
            }
            None => Err(self.undefined_variable(name)),
        }
    }

    fn set_global(&mut self, name: Value) -> Result<(), RuntimeError> {
        let name = name.as_obj().expect("global name constant");
        let hash = self.heap.string(name).hash;
        let value = self.peek(0);
        // Assignment never creates a global; back out the accidental insert
        if self.globals.set(name, hash, value) {
            self.globals.delete(name, hash);
            return Err(self.undefined_variable(name));
        }
        Ok(())
    }

    fn define_global(&mut self, name: Value) {
        let name = name.as_obj().expect("global name constant");
        let hash = self.heap.string(name).hash;
        let value = self.peek(0);
        self.globals.set(name, hash, value);
        self.pop();
    }

    fn undefined_variable(&self, name: ObjRef) -> RuntimeError {
        let message = format!("Undefined variable '{}'.", self.heap.string(name).chars);
        self.runtime_error(&message)
    }

    // ===== Properties and methods =====

    fn get_property(&mut self, name: Value) -> Result<(), RuntimeError> {
        let name = name.as_obj().expect("property name constant");
        let Some(instance) = self
            .peek(0)
            .as_obj()
            .filter(|&r| matches!(self.heap.kind(r), ObjKind::Instance(_)))
        else {
            return Err(self.runtime_error("Only instances have properties."));
        };

        let hash = self.heap.string(name).hash;

        // Fields shadow methods
        if let Some(value) = self.heap.instance(instance).fields.get(name, hash) {
            self.pop();
            self.push(value);
            return Ok(());
        }

        self.bind_method(instance, name, hash)
    }

    fn bind_method(&mut self, instance: ObjRef, name: ObjRef, hash: u32) -> Result<(), RuntimeError> {
        let class = self.heap.instance(instance).class;
        let Some(method) = self.heap.class(class).methods.get(name, hash) else {
            let message = format!("Undefined property '{}'.", self.heap.string(name).chars);
            return Err(self.runtime_error(&message));
        };
        let method = method.as_obj().expect("method closure");

        let receiver = self.peek(0);
        let bound = self.alloc(ObjKind::BoundMethod(BoundMethodObj { receiver, method }));
        self.pop();
        self.push(Value::Obj(bound));
        Ok(())
    }

    fn set_property(&mut self, name: Value) -> Result<(), RuntimeError> {
        let name = name.as_obj().expect("property name constant");
        // Stack shape: [instance, value]
        let Some(instance) = self
            .peek(1)
            .as_obj()
            .filter(|&r| matches!(self.heap.kind(r), ObjKind::Instance(_)))
        else {
            return Err(self.runtime_error("Only instances have fields."));
        };

        let hash = self.heap.string(name).hash;
        let value = self.peek(0);
        self.heap.instance_mut(instance).fields.set(name, hash, value);

        let value = self.pop();
        self.pop(); // instance
        self.push(value);
        Ok(())
    }

    fn make_class(&mut self, name: Value) {
        let name = name.as_obj().expect("class name constant");
        let class = self.alloc(ObjKind::Class(ClassObj {
            name,
            methods: Table::new(),
        }));
        self.push(Value::Obj(class));
    }

    /// `Method`: stack holds [class, closure]; install and pop the closure
    fn define_method(&mut self, name: Value) {
        let name = name.as_obj().expect("method name constant");
        let method = self.peek(0);
        let class = self.peek(1).as_obj().expect("class under method closure");
        let hash = self.heap.string(name).hash;
        self.heap.class_mut(class).methods.set(name, hash, method);
        self.pop();
    }

    // ===== Calls =====

    fn call_value(&mut self, arg_count: usize) -> Result<(), RuntimeError> {
        enum Callable {
            Closure,
            Native(NativeFn),
            Class,
            Bound(Value, ObjRef),
            NotCallable,
        }

        let callee = match self.peek(arg_count).as_obj() {
            Some(callee) => callee,
            None => return Err(self.runtime_error("Can only call functions and classes.")),
        };

        let callable = match self.heap.kind(callee) {
            ObjKind::Closure(_) => Callable::Closure,
            ObjKind::Native(native) => Callable::Native(native.function),
            ObjKind::Class(_) => Callable::Class,
            ObjKind::BoundMethod(bound) => Callable::Bound(bound.receiver, bound.method),
            _ => Callable::NotCallable,
        };

        match callable {
            Callable::Closure => self.call_closure(callee, arg_count),
            Callable::Native(function) => {
                let args_start = self.stack.len() - arg_count;
                let result = function(&self.stack[args_start..]);
                // Drop args and callee, leave the result
                self.stack.truncate(args_start - 1);
                self.push(result);
                Ok(())
            }
            Callable::Class => self.call_class(callee, arg_count),
            Callable::Bound(receiver, method) => {
                let slot = self.stack.len() - arg_count - 1;
                self.stack[slot] = receiver;
                self.call_closure(method, arg_count)
            }
            Callable::NotCallable => Err(self.runtime_error("Can only call functions and classes.")),
        }
    }

    fn call_closure(&mut self, closure: ObjRef, arg_count: usize) -> Result<(), RuntimeError> {
        let arity = self.heap.function(self.heap.closure(closure).function).arity as usize;
        if arg_count != arity {
            let message = format!("Expected {} arguments but got {}.", arity, arg_count);
            return Err(self.runtime_error(&message));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }

        self.frames.push(CallFrame {
            closure,
            ip: 0,
            slots: self.stack.len() - arg_count - 1,
        });
        Ok(())
    }

    /// Calling a class builds an instance; `init`, when present, runs with
    /// the instance already in slot 0.
    fn call_class(&mut self, class: ObjRef, arg_count: usize) -> Result<(), RuntimeError> {
        let instance = self.alloc(ObjKind::Instance(InstanceObj {
            class,
            fields: Table::new(),
        }));
        let slot = self.stack.len() - arg_count - 1;
        self.stack[slot] = Value::Obj(instance);

        let init = self.init_string;
        let hash = self.heap.string(init).hash;
        if let Some(initializer) = self.heap.class(class).methods.get(init, hash) {
            let initializer = initializer.as_obj().expect("init closure");
            return self.call_closure(initializer, arg_count);
        }

        if arg_count != 0 {
            let message = format!("Expected 0 arguments but got {}.", arg_count);
            return Err(self.runtime_error(&message));
        }
        Ok(())
    }

    // ===== Upvalues =====

    /// Build a closure for a function constant, capturing its upvalues from
    /// the current frame's slots or the current closure's upvalues.
    fn make_closure(&mut self, function: Value) {
        let function = function.as_obj().expect("function constant");
        let closure = self.alloc(ObjKind::Closure(ClosureObj {
            function,
            upvalues: Vec::new(),
        }));
        // On the stack immediately: every capture below may allocate
        self.push(Value::Obj(closure));

        let upvalue_count = self.heap.function(function).upvalue_count;
        for _ in 0..upvalue_count {
            let is_local = self.read_byte() == 1;
            let index = self.read_byte() as usize;
            let upvalue = if is_local {
                let slot = self.frame().slots + index;
                self.capture_upvalue(slot)
            } else {
                self.heap.closure(self.frame().closure).upvalues[index]
            };
            self.heap.closure_mut(closure).upvalues.push(upvalue);
        }
    }

    /// Find or create the open upvalue for a stack slot. The list is sorted
    /// by decreasing slot, and any slot has at most one open upvalue.
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        let mut prev = None;
        let mut current = self.open_upvalues;
        while let Some(upvalue) = current {
            if self.open_slot(upvalue) <= slot {
                break;
            }
            prev = Some(upvalue);
            current = self.heap.upvalue(upvalue).next;
        }

        if let Some(upvalue) = current {
            if self.open_slot(upvalue) == slot {
                return upvalue;
            }
        }

        let created = self.alloc(ObjKind::Upvalue(UpvalueObj {
            state: UpvalueState::Open(slot),
            next: current,
        }));
        match prev {
            None => self.open_upvalues = Some(created),
            Some(prev) => self.heap.upvalue_mut(prev).next = Some(created),
        }
        created
    }

    /// Close every open upvalue at or above `from`, hoisting the stack
    /// values into the upvalue objects.
    fn close_upvalues(&mut self, from: usize) {
        while let Some(upvalue) = self.open_upvalues {
            let slot = self.open_slot(upvalue);
            if slot < from {
                break;
            }
            let value = self.stack[slot];
            let next = self.heap.upvalue(upvalue).next;
            let u = self.heap.upvalue_mut(upvalue);
            u.state = UpvalueState::Closed(value);
            u.next = None;
            self.open_upvalues = next;
        }
    }

    fn open_slot(&self, upvalue: ObjRef) -> usize {
        match self.heap.upvalue(upvalue).state {
            UpvalueState::Open(slot) => slot,
            UpvalueState::Closed(_) => unreachable!("closed upvalue on the open list"),
        }
    }

    // ===== Errors =====

    /// Build a runtime error with the current stack trace, innermost first
    fn runtime_error(&self, message: &str) -> RuntimeError {
        let mut trace = Vec::with_capacity(self.frames.len());
        for frame in self.frames.iter().rev() {
            let function = self.heap.closure(frame.closure).function;
            let function = self.heap.function(function);
            let line = function.chunk.lines[frame.ip.saturating_sub(1)];
            let name = function
                .name
                .map(|name| self.heap.string(name).chars.to_string());
            trace.push(TraceFrame {
                line,
                function: name,
            });
        }
        RuntimeError {
            message: message.to_string(),
            trace,
        }
    }

    #[cfg(feature = "trace-exec")]
    fn trace_instruction(&self) {
        let mut stack_line = String::from("        ");
        for value in &self.stack {
            stack_line.push_str(&format!("[ {} ]", self.heap.format_value(*value)));
        }
        eprintln!("{}", stack_line);

        let mut offset = self.frame().ip;
        eprintln!(
            "{}",
            crate::bytecode::disassemble_instruction(&self.heap, self.current_chunk(), &mut offset)
        );
    }
}

impl Default for VM {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn run_source(source: &str) -> (Result<i32, InterpretError>, String) {
        let buffer = Rc::new(RefCell::new(Vec::<u8>::new()));
        let mut vm = VM::new();
        vm.set_output_writer(buffer.clone());
        let result = vm.interpret(source);
        let output = String::from_utf8(buffer.borrow().clone()).expect("utf8 output");
        (result, output)
    }

    #[test]
    fn test_arithmetic_precedence() {
        let (result, output) = run_source("print 1 + 2 * 3;");
        assert_eq!(result.unwrap(), 0);
        assert_eq!(output, "7\n");
    }

    #[test]
    fn test_string_concatenation() {
        let (result, output) = run_source("var a = \"hi\"; var b = \" there\"; print a + b;");
        assert_eq!(result.unwrap(), 0);
        assert_eq!(output, "hi there\n");
    }

    #[test]
    fn test_divide_by_zero_is_a_runtime_error() {
        let (result, _) = run_source("print 1 / 0;");
        match result {
            Err(InterpretError::Runtime(error)) => assert_eq!(error.message, "Divide by zero."),
            other => panic!("expected runtime error, got {:?}", other),
        }
    }

    #[test]
    fn test_stack_is_empty_after_clean_halt() {
        let buffer = Rc::new(RefCell::new(Vec::<u8>::new()));
        let mut vm = VM::new();
        vm.set_output_writer(buffer);
        vm.interpret("var a = 1; { var b = a + 1; print b; }").unwrap();
        assert_eq!(vm.stack_depth(), 0);
    }

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(run_source("return;").0.unwrap(), 0);
        assert_eq!(run_source("return nil;").0.unwrap(), 0);
        assert_eq!(run_source("return true;").0.unwrap(), 0);
        assert_eq!(run_source("return false;").0.unwrap(), 1);
        assert_eq!(run_source("return 42;").0.unwrap(), 42);
        assert_eq!(run_source("return 42.9;").0.unwrap(), 42);
    }

    #[test]
    fn test_returning_an_object_from_script_is_an_error() {
        let (result, _) = run_source("return \"exit\";");
        match result {
            Err(InterpretError::Runtime(error)) => {
                assert_eq!(error.message, "Script must return a number, boolean, or nil.");
            }
            other => panic!("expected runtime error, got {:?}", other),
        }
    }

    #[test]
    fn test_vm_survives_a_runtime_error() {
        let buffer = Rc::new(RefCell::new(Vec::<u8>::new()));
        let mut vm = VM::new();
        vm.set_output_writer(buffer.clone());

        vm.interpret("var kept = 7;").unwrap();
        assert!(vm.interpret("print missing;").is_err());
        assert_eq!(vm.stack_depth(), 0);

        // Globals survive the reset, as the REPL expects
        vm.interpret("print kept;").unwrap();
        let output = String::from_utf8(buffer.borrow().clone()).unwrap();
        assert_eq!(output, "7\n");
    }

    #[test]
    fn test_runtime_error_trace_shape() {
        let (result, _) = run_source(
            "fun inner() { return missing; }\n\
             fun outer() { return inner(); }\n\
             outer();",
        );
        let error = match result {
            Err(InterpretError::Runtime(error)) => error,
            other => panic!("expected runtime error, got {:?}", other),
        };
        assert_eq!(error.message, "Undefined variable 'missing'.");
        assert_eq!(error.trace.len(), 3);
        assert_eq!(error.trace[0].function.as_deref(), Some("inner"));
        assert_eq!(error.trace[0].line, 1);
        assert_eq!(error.trace[1].function.as_deref(), Some("outer"));
        assert_eq!(error.trace[1].line, 2);
        assert_eq!(error.trace[2].function, None);
        assert_eq!(error.trace[2].line, 3);
    }

    #[test]
    fn test_native_clock_is_callable() {
        let (result, output) = run_source("print clock() >= 0;");
        assert_eq!(result.unwrap(), 0);
        assert_eq!(output, "true\n");
    }
}
