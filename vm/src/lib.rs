//! The bytecode dispatch loop: a stack of `Value`s, a stack of call frames
//! each pointing into a `Chunk`, and one big match over `OpCode`.

pub mod error;

use runtime::{GcRoots, Heap, ObjKind, ObjRef, OpCode, Table, UpvalueState, Value};

pub use error::RuntimeError;
use error::Backtrace;

const FRAMES_MAX: usize = 64;
const STACK_MAX: usize = 256 * 256;

struct CallFrame {
    closure: ObjRef,
    ip: usize,
    slot_base: usize,
}

/// Borrows just the fields a GC pass needs to mark, so callers can hold
/// `&mut self.heap` at the same time (see the `roots!` macro below).
struct Roots<'a> {
    stack: &'a [Value],
    frames: &'a [CallFrame],
    open_upvalues: &'a [ObjRef],
    globals: &'a Table,
    init_string: Option<ObjRef>,
}

impl GcRoots for Roots<'_> {
    fn mark_roots(&self, heap: &mut Heap) {
        for value in self.stack {
            heap.mark_value(*value);
        }
        for frame in self.frames {
            heap.mark_object(frame.closure);
        }
        for upvalue in self.open_upvalues {
            heap.mark_object(*upvalue);
        }
        for (key, value) in self.globals.iter() {
            heap.mark_object(key);
            heap.mark_value(value);
        }
        if let Some(init_string) = self.init_string {
            heap.mark_object(init_string);
        }
    }
}

macro_rules! roots {
    ($self:ident) => {
        Roots {
            stack: &$self.stack,
            frames: &$self.frames,
            open_upvalues: &$self.open_upvalues,
            globals: &$self.globals,
            init_string: $self.init_string,
        }
    };
}

pub struct Vm {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    open_upvalues: Vec<ObjRef>,
    init_string: Option<ObjRef>,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        let mut vm = Self {
            heap: Heap::new(),
            stack: Vec::new(),
            frames: Vec::new(),
            globals: Table::new(),
            open_upvalues: Vec::new(),
            init_string: None,
        };
        let roots = roots!(vm);
        let init_string = vm.heap.intern_string(&roots, "init");
        vm.init_string = Some(init_string);
        vm
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// Wraps `function` in a closure, pushes a root frame, and runs it to
    /// completion. Globals and interned strings survive across calls, so a
    /// REPL can call this once per line and keep seeing earlier definitions.
    pub fn interpret(&mut self, function: ObjRef) -> Result<(), RuntimeError> {
        let roots = roots!(self);
        let closure = self.heap.alloc_closure(&roots, function, Vec::new());
        self.push(Value::Obj(closure));
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            slot_base: 0,
        });
        let result = self.run();
        if result.is_err() {
            self.stack.clear();
            self.frames.clear();
            self.open_upvalues.clear();
        }
        result
    }

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            #[cfg(feature = "debug-execution")]
            self.trace();

            let byte = self.read_byte();
            let Some(op) = OpCode::from_byte(byte) else {
                return Err(self.fatal(format!("unrecognized opcode {byte}")));
            };

            match op {
                OpCode::Constant => {
                    let value = self.read_constant();
                    self.push(value);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames.last().unwrap().slot_base;
                    self.push(self.stack[base + slot]);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames.last().unwrap().slot_base;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetGlobal => {
                    let name = self.read_constant().as_obj().unwrap();
                    match self.globals.get(name) {
                        Some(value) => self.push(value),
                        None => return Err(self.undefined_variable(&name.to_string())),
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_constant().as_obj().unwrap();
                    let value = self.peek(0);
                    self.globals.set(name, value);
                    self.pop();
                }
                OpCode::SetGlobal => {
                    let name = self.read_constant().as_obj().unwrap();
                    if !self.globals.contains(name) {
                        return Err(self.undefined_variable(&name.to_string()));
                    }
                    self.globals.set(name, self.peek(0));
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let upvalue = self.frames.last().unwrap().closure.as_closure().unwrap().upvalues[slot];
                    let value = match upvalue.as_upvalue().unwrap().state.get() {
                        UpvalueState::Open(idx) => self.stack[idx],
                        UpvalueState::Closed(value) => value,
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let upvalue = self.frames.last().unwrap().closure.as_closure().unwrap().upvalues[slot];
                    let value = self.peek(0);
                    match upvalue.as_upvalue().unwrap().state.get() {
                        UpvalueState::Open(idx) => self.stack[idx] = value,
                        UpvalueState::Closed(_) => {
                            upvalue.as_upvalue().unwrap().state.set(UpvalueState::Closed(value));
                        }
                    }
                }
                OpCode::GetProperty => self.get_property()?,
                OpCode::SetProperty => self.set_property()?,
                OpCode::GetSuper => self.get_super()?,
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::Greater => self.number_compare(|a, b| a > b)?,
                OpCode::Less => self.number_compare(|a, b| a < b)?,
                OpCode::Add => self.add()?,
                OpCode::Subtract => self.number_binary(|a, b| a - b)?,
                OpCode::Multiply => self.number_binary(|a, b| a * b)?,
                OpCode::Divide => self.number_binary(|a, b| a / b)?,
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()));
                }
                OpCode::Negate => {
                    let value = self.peek(0);
                    match value.as_number() {
                        Some(n) => {
                            self.pop();
                            self.push(Value::Number(-n));
                        }
                        None => return Err(self.type_error(format!("operand must be a number, got {}", value.type_name()))),
                    }
                }
                OpCode::Print => {
                    let value = self.pop();
                    println!("{value}");
                }
                OpCode::Jump => {
                    let offset = self.read_u16();
                    self.frames.last_mut().unwrap().ip += offset as usize;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16();
                    if self.peek(0).is_falsey() {
                        self.frames.last_mut().unwrap().ip += offset as usize;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16();
                    self.frames.last_mut().unwrap().ip -= offset as usize;
                }
                OpCode::Call => {
                    let argc = self.read_byte() as usize;
                    self.call_value(argc)?;
                }
                OpCode::Invoke => {
                    let name = self.read_constant().as_obj().unwrap();
                    let argc = self.read_byte() as usize;
                    self.invoke(name, argc)?;
                }
                OpCode::SuperInvoke => {
                    let name = self.read_constant().as_obj().unwrap();
                    let argc = self.read_byte() as usize;
                    let superclass = self.pop().as_obj().unwrap();
                    self.invoke_from_class(superclass, name, argc)?;
                }
                OpCode::Closure => self.closure()?,
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let slot_base = self.frames.last().unwrap().slot_base;
                    self.close_upvalues(slot_base);
                    self.frames.pop();
                    if self.frames.is_empty() {
                        self.stack.pop();
                        return Ok(());
                    }
                    self.stack.truncate(slot_base);
                    self.push(result);
                }
                OpCode::Class => {
                    let name = self.read_constant().as_obj().unwrap();
                    let roots = roots!(self);
                    let class = self.heap.alloc_class(&roots, name);
                    self.push(Value::Obj(class));
                }
                OpCode::Inherit => self.inherit()?,
                OpCode::Method => {
                    let name = self.read_constant().as_obj().unwrap();
                    let method = self.pop();
                    let class = self.peek(0).as_obj().unwrap();
                    class.as_class().unwrap().methods.borrow_mut().set(name, method);
                }
                OpCode::Array => {
                    let count = self.read_byte() as usize;
                    let roots = roots!(self);
                    self.heap.maybe_collect(&roots);
                    let base = self.stack.len() - count;
                    let values = self.stack.split_off(base);
                    let array = self.heap.alloc_array_no_collect(values);
                    self.push(Value::Obj(array));
                }
                OpCode::GetIndex => self.get_index()?,
                OpCode::SetIndex => self.set_index()?,
                OpCode::Append => {
                    let value = self.pop();
                    let receiver = self.pop();
                    match receiver.as_obj().filter(|o| o.kind() == ObjKind::Array) {
                        Some(array) => {
                            array.as_array().unwrap().values.borrow_mut().push(value);
                            self.push(Value::Nil);
                        }
                        None => return Err(self.no_properties(receiver.type_name())),
                    }
                }
            }
        }
    }

    // --- stack helpers -----------------------------------------------

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack underflow")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn chunk(&self) -> &runtime::Chunk {
        let frame = self.frames.last().unwrap();
        &frame.closure.as_closure().unwrap().function.as_function().unwrap().chunk
    }

    fn read_byte(&mut self) -> u8 {
        let ip = self.frames.last().unwrap().ip;
        let byte = self.chunk().code[ip];
        self.frames.last_mut().unwrap().ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let ip = self.frames.last().unwrap().ip;
        let value = self.chunk().read_u16(ip);
        self.frames.last_mut().unwrap().ip += 2;
        value
    }

    fn read_constant(&mut self) -> Value {
        let idx = self.read_byte() as usize;
        self.chunk().constants[idx]
    }

    // --- arithmetic ----------------------------------------------------

    fn number_binary(&mut self, op: impl Fn(f64, f64) -> f64) -> Result<(), RuntimeError> {
        let (a, b) = self.pop_two_numbers()?;
        self.push(Value::Number(op(a, b)));
        Ok(())
    }

    fn number_compare(&mut self, op: impl Fn(f64, f64) -> bool) -> Result<(), RuntimeError> {
        let (a, b) = self.pop_two_numbers()?;
        self.push(Value::Bool(op(a, b)));
        Ok(())
    }

    fn pop_two_numbers(&mut self) -> Result<(f64, f64), RuntimeError> {
        let b = self.peek(0);
        let a = self.peek(1);
        match (a.as_number(), b.as_number()) {
            (Some(a), Some(b)) => {
                self.pop();
                self.pop();
                Ok((a, b))
            }
            _ => Err(self.type_error(format!(
                "operands must be two numbers, got {} and {}",
                a.type_name(),
                b.type_name()
            ))),
        }
    }

    fn add(&mut self) -> Result<(), RuntimeError> {
        let b = self.peek(0);
        let a = self.peek(1);
        match (a.as_number(), b.as_number()) {
            (Some(a), Some(b)) => {
                self.pop();
                self.pop();
                self.push(Value::Number(a + b));
                Ok(())
            }
            _ if (a.is_obj_kind(ObjKind::String) || b.is_obj_kind(ObjKind::String))
                && (a.is_obj_kind(ObjKind::String) || a.as_number().is_some())
                && (b.is_obj_kind(ObjKind::String) || b.as_number().is_some()) =>
            {
                let text = format!("{a}{b}");
                self.pop();
                self.pop();
                let roots = roots!(self);
                let interned = self.heap.intern_string(&roots, &text);
                self.push(Value::Obj(interned));
                Ok(())
            }
            _ => Err(self.type_error(format!(
                "operands must be two numbers or at least one string, got {} and {}",
                a.type_name(),
                b.type_name()
            ))),
        }
    }

    // --- calls -----------------------------------------------------------

    fn call_value(&mut self, argc: usize) -> Result<(), RuntimeError> {
        let callee = self.peek(argc);
        match callee.as_obj() {
            Some(obj) if obj.kind() == ObjKind::Closure => self.call_closure(obj, argc),
            Some(obj) if obj.kind() == ObjKind::Class => self.instantiate(obj, argc),
            Some(obj) if obj.kind() == ObjKind::BoundMethod => {
                let bound = obj.as_bound_method().unwrap();
                let receiver = bound.receiver;
                let method = bound.method;
                let slot = self.stack.len() - argc - 1;
                self.stack[slot] = receiver;
                self.call_closure(method, argc)
            }
            _ => Err(self.not_callable(callee.type_name())),
        }
    }

    fn call_closure(&mut self, closure: ObjRef, argc: usize) -> Result<(), RuntimeError> {
        let arity = closure.as_closure().unwrap().function.as_function().unwrap().arity;
        if arity as usize != argc {
            return Err(self.wrong_arity(arity, argc));
        }
        if self.frames.len() >= FRAMES_MAX || self.stack.len() >= STACK_MAX {
            return Err(self.stack_overflow());
        }
        let slot_base = self.stack.len() - argc - 1;
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            slot_base,
        });
        Ok(())
    }

    fn instantiate(&mut self, class: ObjRef, argc: usize) -> Result<(), RuntimeError> {
        let roots = roots!(self);
        let instance = self.heap.alloc_instance(&roots, class);
        let slot = self.stack.len() - argc - 1;
        self.stack[slot] = Value::Obj(instance);
        let init = class.as_class().unwrap().methods.borrow().get(self.init_string.unwrap());
        match init {
            Some(initializer) => {
                let initializer = initializer.as_obj().unwrap();
                self.call_closure(initializer, argc)
            }
            None if argc == 0 => Ok(()),
            None => Err(self.wrong_arity(0, argc)),
        }
    }

    fn invoke(&mut self, name: ObjRef, argc: usize) -> Result<(), RuntimeError> {
        let receiver = self.peek(argc);
        match receiver.as_obj() {
            Some(obj) if obj.kind() == ObjKind::Instance => {
                let instance = obj.as_instance().unwrap();
                if let Some(value) = instance.fields.borrow().get(name) {
                    let slot = self.stack.len() - argc - 1;
                    self.stack[slot] = value;
                    return self.call_value(argc);
                }
                self.invoke_from_class(instance.class, name, argc)
            }
            _ => Err(self.no_properties(receiver.type_name())),
        }
    }

    fn invoke_from_class(&mut self, class: ObjRef, name: ObjRef, argc: usize) -> Result<(), RuntimeError> {
        match class.as_class().unwrap().methods.borrow().get(name) {
            Some(method) => self.call_closure(method.as_obj().unwrap(), argc),
            None => Err(self.undefined_property(&name.to_string())),
        }
    }

    fn bind_method(&mut self, class: ObjRef, name: ObjRef, receiver: Value) -> Result<(), RuntimeError> {
        match class.as_class().unwrap().methods.borrow().get(name) {
            Some(method) => {
                let roots = roots!(self);
                let bound = self.heap.alloc_bound_method(&roots, receiver, method.as_obj().unwrap());
                self.push(Value::Obj(bound));
                Ok(())
            }
            None => Err(self.undefined_property(&name.to_string())),
        }
    }

    // --- properties & indexing -------------------------------------------

    fn get_property(&mut self) -> Result<(), RuntimeError> {
        let name = self.read_constant().as_obj().unwrap();
        let receiver = self.pop();
        match receiver.as_obj() {
            Some(obj) if obj.kind() == ObjKind::Instance => {
                let instance = obj.as_instance().unwrap();
                if let Some(value) = instance.fields.borrow().get(name) {
                    self.push(value);
                    Ok(())
                } else {
                    self.bind_method(instance.class, name, receiver)
                }
            }
            Some(obj) if obj.kind() == ObjKind::Array => {
                if name.to_string() == "length" {
                    let len = obj.as_array().unwrap().values.borrow().len();
                    self.push(Value::Number(len as f64));
                    Ok(())
                } else {
                    Err(self.undefined_property(&name.to_string()))
                }
            }
            _ => Err(self.no_properties(receiver.type_name())),
        }
    }

    fn set_property(&mut self) -> Result<(), RuntimeError> {
        let name = self.read_constant().as_obj().unwrap();
        let value = self.pop();
        let receiver = self.pop();
        match receiver.as_obj().filter(|o| o.kind() == ObjKind::Instance) {
            Some(obj) => {
                obj.as_instance().unwrap().fields.borrow_mut().set(name, value);
                self.push(value);
                Ok(())
            }
            None => Err(self.no_properties(receiver.type_name())),
        }
    }

    fn get_super(&mut self) -> Result<(), RuntimeError> {
        let name = self.read_constant().as_obj().unwrap();
        let superclass = self.pop().as_obj().unwrap();
        let receiver = self.pop();
        self.bind_method(superclass, name, receiver)
    }

    fn array_index(&self, index: Value, array: ObjRef) -> Result<usize, RuntimeError> {
        let Some(n) = index.as_number() else {
            return Err(self.type_error(format!("array index must be a number, got {}", index.type_name())));
        };
        let len = array.as_array().unwrap().values.borrow().len();
        if n < 0.0 || n.fract() != 0.0 || n as usize >= len {
            return Err(self.index_out_of_bounds(n, len));
        }
        Ok(n as usize)
    }

    fn get_index(&mut self) -> Result<(), RuntimeError> {
        let index = self.pop();
        let receiver = self.pop();
        match receiver.as_obj().filter(|o| o.kind() == ObjKind::Array) {
            Some(array) => {
                let idx = self.array_index(index, array)?;
                let value = array.as_array().unwrap().values.borrow()[idx];
                self.push(value);
                Ok(())
            }
            None => Err(self.no_properties(receiver.type_name())),
        }
    }

    fn set_index(&mut self) -> Result<(), RuntimeError> {
        let value = self.pop();
        let index = self.pop();
        let receiver = self.pop();
        match receiver.as_obj().filter(|o| o.kind() == ObjKind::Array) {
            Some(array) => {
                let idx = self.array_index(index, array)?;
                array.as_array().unwrap().values.borrow_mut()[idx] = value;
                self.push(value);
                Ok(())
            }
            None => Err(self.no_properties(receiver.type_name())),
        }
    }

    fn inherit(&mut self) -> Result<(), RuntimeError> {
        let superclass_val = self.peek(1);
        let Some(superclass) = superclass_val.as_obj().filter(|o| o.kind() == ObjKind::Class) else {
            return Err(self.type_error(format!("superclass must be a class, got {}", superclass_val.type_name())));
        };
        let subclass = self.peek(0).as_obj().unwrap();
        {
            let superclass_methods = superclass.as_class().unwrap().methods.borrow();
            superclass_methods.copy_all_into(&mut subclass.as_class().unwrap().methods.borrow_mut());
        }
        self.pop();
        Ok(())
    }

    // --- closures & upvalues ---------------------------------------------

    fn closure(&mut self) -> Result<(), RuntimeError> {
        let function = self.read_constant().as_obj().unwrap();
        let count = function.as_function().unwrap().upvalue_count.get();
        let mut upvalues = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let is_local = self.read_byte() != 0;
            let index = self.read_byte() as usize;
            let upvalue = if is_local {
                let slot_base = self.frames.last().unwrap().slot_base;
                self.capture_upvalue(slot_base + index)
            } else {
                self.frames.last().unwrap().closure.as_closure().unwrap().upvalues[index]
            };
            upvalues.push(upvalue);
        }
        let roots = roots!(self);
        let closure = self.heap.alloc_closure(&roots, function, upvalues);
        self.push(Value::Obj(closure));
        Ok(())
    }

    fn capture_upvalue(&mut self, stack_index: usize) -> ObjRef {
        if let Some(existing) = self.open_upvalues.iter().find(|uv| {
            matches!(uv.as_upvalue().unwrap().state.get(), UpvalueState::Open(idx) if idx == stack_index)
        }) {
            return *existing;
        }
        let roots = roots!(self);
        let upvalue = self.heap.alloc_upvalue(&roots, stack_index);
        let pos = self
            .open_upvalues
            .iter()
            .position(|o| matches!(o.as_upvalue().unwrap().state.get(), UpvalueState::Open(idx) if idx < stack_index))
            .unwrap_or(self.open_upvalues.len());
        self.open_upvalues.insert(pos, upvalue);
        upvalue
    }

    fn close_upvalues(&mut self, from: usize) {
        let mut i = 0;
        while i < self.open_upvalues.len() {
            let upvalue = self.open_upvalues[i];
            let state = upvalue.as_upvalue().unwrap().state.get();
            match state {
                UpvalueState::Open(idx) if idx >= from => {
                    let value = self.stack[idx];
                    upvalue.as_upvalue().unwrap().state.set(UpvalueState::Closed(value));
                    self.open_upvalues.remove(i);
                }
                _ => i += 1,
            }
        }
    }

    // --- error construction ------------------------------------------------

    fn current_line(&self) -> u32 {
        let frame = self.frames.last().unwrap();
        self.chunk().line_at(frame.ip.saturating_sub(1))
    }

    fn backtrace(&self) -> Backtrace {
        let mut bt = Backtrace::default();
        for frame in self.frames.iter().rev() {
            let function = frame.closure.as_closure().unwrap().function.as_function().unwrap();
            let name = function.name.map(|n| n.to_string());
            let line = function.chunk.line_at(frame.ip.saturating_sub(1));
            bt.push(name, line);
        }
        bt
    }

    fn type_error(&self, message: String) -> RuntimeError {
        RuntimeError::Type(message, self.current_line(), self.backtrace())
    }

    fn undefined_variable(&self, name: &str) -> RuntimeError {
        RuntimeError::UndefinedVariable(name.to_string(), self.current_line(), self.backtrace())
    }

    fn undefined_property(&self, name: &str) -> RuntimeError {
        RuntimeError::UndefinedProperty(name.to_string(), self.current_line(), self.backtrace())
    }

    fn wrong_arity(&self, expected: u8, got: usize) -> RuntimeError {
        RuntimeError::WrongArity(expected, got, self.current_line(), self.backtrace())
    }

    fn index_out_of_bounds(&self, index: f64, len: usize) -> RuntimeError {
        RuntimeError::IndexOutOfBounds(index, len, self.current_line(), self.backtrace())
    }

    fn not_callable(&self, kind: &'static str) -> RuntimeError {
        RuntimeError::NotCallable(kind, self.current_line(), self.backtrace())
    }

    fn no_properties(&self, kind: &'static str) -> RuntimeError {
        RuntimeError::NoProperties(kind, self.current_line(), self.backtrace())
    }

    fn stack_overflow(&self) -> RuntimeError {
        RuntimeError::StackOverflow(self.current_line(), self.backtrace())
    }

    fn fatal(&self, message: String) -> RuntimeError {
        RuntimeError::Fatal(message, self.current_line(), self.backtrace())
    }

    #[cfg(feature = "debug-execution")]
    fn trace(&self) {
        print!("          ");
        for value in &self.stack {
            print!("[ {value} ]");
        }
        println!();
        let frame = self.frames.last().unwrap();
        let mut buffer = String::new();
        compiler::debug::disassemble_instruction(&mut buffer, self.chunk(), frame.ip);
        print!("{buffer}");
    }
}
