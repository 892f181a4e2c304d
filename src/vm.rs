//! The tree-walking... no — the tree-LESS bytecode interpreter. `Vm` owns
//! every piece of mutable interpreter state: the call-frame stack, the value
//! stack, globals, the string intern table, the GC's object list, and the
//! allocation accounting that drives it.

use crate::call_frame::{CallFrame, FRAMES_MAX};
use crate::chunk::OpCode;
use crate::compiler::Compiler;
use crate::debug;
use crate::gc::{GarbageCollector, GC_GROWTH_FACTOR, INITIAL_GC_THRESHOLD};
use crate::natives;
use crate::object::{
    self, NativeFn, ObjBoundMethod, ObjClass, ObjClosure, ObjFunction, ObjInstance, ObjNative,
    ObjString, ObjUpvalue, Object, ObjectType,
};
use crate::table::Table;
use crate::value::{self, Value};

#[derive(Debug, PartialEq, Eq)]
pub enum InterpretResult {
    Ok,
    CompileError,
    RuntimeError,
}

/// Whether a binding may be reassigned. Locals resolve their own policy at
/// compile time (the target is always statically known); globals need a
/// runtime table because a `Fix` global might be assigned from code compiled
/// long after its declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Var,
    Fix,
}

pub struct Vm {
    frames: Vec<CallFrame>,
    stack: Vec<Value>,

    /// Global name -> slot index, so `GET_GLOBAL`/`SET_GLOBAL` operands are
    /// direct indices rather than a per-access hash probe.
    global_slots: Table,
    global_values: Vec<Value>,
    global_access: Vec<AccessKind>,
    global_names: Vec<*mut ObjString>,

    pub intern_strings: Table,
    pub objects: *mut Object,
    pub open_upvalues: *mut ObjUpvalue,

    bytes_allocated: usize,
    next_gc: usize,

    pub init_string: *mut ObjString,

    /// Functions under construction by the active compiler chain, kept
    /// reachable across any GC triggered mid-compile.
    pub compiler_roots: Vec<*mut Object>,
}

impl Vm {
    pub fn new() -> Box<Vm> {
        let mut vm = Box::new(Vm {
            frames: Vec::with_capacity(FRAMES_MAX),
            stack: Vec::with_capacity(256),
            global_slots: Table::new(),
            global_values: Vec::new(),
            global_access: Vec::new(),
            global_names: Vec::new(),
            intern_strings: Table::new(),
            objects: std::ptr::null_mut(),
            open_upvalues: std::ptr::null_mut(),
            bytes_allocated: 0,
            next_gc: INITIAL_GC_THRESHOLD,
            init_string: std::ptr::null_mut(),
            compiler_roots: Vec::new(),
        });
        vm.init_string = vm.intern("init");
        natives::install(&mut vm);
        vm
    }

    // ---- allocation --------------------------------------------------

    unsafe fn register<T>(&mut self, boxed: Box<T>) -> *mut T {
        let ptr = Box::into_raw(boxed);
        let obj_ptr = ptr as *mut Object;
        (*obj_ptr).next = self.objects;
        self.objects = obj_ptr;
        self.bytes_allocated += object::deep_size(obj_ptr);
        self.maybe_collect_garbage();
        ptr
    }

    fn maybe_collect_garbage(&mut self) {
        #[cfg(feature = "gc_stress")]
        {
            self.collect_garbage();
            return;
        }
        #[cfg(not(feature = "gc_stress"))]
        if self.bytes_allocated > self.next_gc {
            self.collect_garbage();
        }
    }

    /// Interns `text`: returns the existing `ObjString` if one with equal
    /// bytes is already registered, else allocates and registers a new one.
    pub fn intern(&mut self, text: &str) -> *mut ObjString {
        let hash = object::fnv1a(text.as_bytes());
        if let Some(existing) = self.intern_strings.find_string_by_bytes(text.as_bytes(), hash) {
            return existing;
        }
        let ptr = unsafe { self.register(ObjString::new(text)) };
        self.intern_strings.set(Value::Obj(ptr as *mut Object), Value::Bool(true));
        ptr
    }

    pub fn alloc_function(&mut self, name: Option<*mut ObjString>) -> *mut ObjFunction {
        unsafe { self.register(Box::new(ObjFunction::new(name))) }
    }

    pub fn alloc_native(&mut self, name: *mut ObjString, arity: u8, function: NativeFn) -> *mut ObjNative {
        unsafe { self.register(Box::new(ObjNative::new(name, arity, function))) }
    }

    /// Registers a native function as a `Var` global, callable by name from
    /// the moment the VM starts running.
    pub fn define_native(&mut self, name: &str, arity: u8, function: NativeFn) {
        let name_ptr = self.intern(name);
        let native = self.alloc_native(name_ptr, arity, function);
        let index = self.resolve_global(name_ptr, AccessKind::Var);
        self.global_values[index] = Value::Obj(native as *mut Object);
    }

    pub fn alloc_closure(&mut self, function: *mut ObjFunction) -> *mut ObjClosure {
        unsafe { self.register(Box::new(ObjClosure::new(function))) }
    }

    pub fn alloc_upvalue(&mut self, slot: *mut Value) -> *mut ObjUpvalue {
        unsafe { self.register(Box::new(ObjUpvalue::new(slot))) }
    }

    pub fn alloc_class(&mut self, name: *mut ObjString) -> *mut ObjClass {
        unsafe { self.register(Box::new(ObjClass::new(name))) }
    }

    pub fn alloc_instance(&mut self, class: *mut ObjClass) -> *mut ObjInstance {
        unsafe { self.register(Box::new(ObjInstance::new(class))) }
    }

    pub fn alloc_bound_method(&mut self, receiver: Value, method: *mut ObjClosure) -> *mut ObjBoundMethod {
        unsafe { self.register(Box::new(ObjBoundMethod::new(receiver, method))) }
    }

    /// `ADD` on two strings: allocate the concatenation, interning away a
    /// duplicate if one already exists, matching clox's `concatenate`.
    pub fn concatenate(&mut self, a: &str, b: &str) -> *mut ObjString {
        let mut combined = String::with_capacity(a.len() + b.len());
        combined.push_str(a);
        combined.push_str(b);
        self.intern(&combined)
    }

    // ---- global table --------------------------------------------------

    /// Resolves `name` to its global slot, creating one (`Undefined`, with
    /// the given access kind) if this is the first time it's been seen.
    /// Called by the compiler at compile time, which is why `GET_GLOBAL`/
    /// `SET_GLOBAL` operands can be direct slot indices.
    pub fn resolve_global(&mut self, name: *mut ObjString, access: AccessKind) -> usize {
        let key = Value::Obj(name as *mut Object);
        if let Some(Value::Number(index)) = self.global_slots.get(&key) {
            return index as usize;
        }
        let index = self.global_values.len();
        self.global_values.push(Value::Undefined);
        self.global_access.push(access);
        self.global_names.push(name);
        self.global_slots.set(key, Value::Number(index as f64));
        index
    }

    fn global_name_str(&self, index: usize) -> &str {
        unsafe { (*self.global_names[index]).as_str() }
    }

    // ---- stack helpers --------------------------------------------------

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack underflow")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    // ---- frame / chunk access --------------------------------------------------

    fn frame(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("no active call frame")
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("no active call frame");
        let chunk = unsafe { &(*(*frame.closure).function).chunk };
        let byte = chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_short(&mut self) -> u16 {
        let hi = self.read_byte() as u16;
        let lo = self.read_byte() as u16;
        (hi << 8) | lo
    }

    fn read_u24(&mut self) -> usize {
        let a = self.read_byte() as usize;
        let b = self.read_byte() as usize;
        let c = self.read_byte() as usize;
        (a << 16) | (b << 8) | c
    }

    fn read_indexed_short(&mut self) -> usize {
        self.read_byte() as usize
    }

    fn read_indexed_long(&mut self) -> usize {
        self.read_u24()
    }

    fn constant_at(&self, index: usize) -> Value {
        let frame = self.frames.last().expect("no active call frame");
        unsafe { (*(*frame.closure).function).chunk.constants[index] }
    }

    fn constant_name_at(&self, index: usize) -> *mut ObjString {
        match self.constant_at(index) {
            Value::Obj(ptr) => unsafe { object::as_string_mut(ptr) },
            _ => unreachable!("name operand did not resolve to a string constant"),
        }
    }

    // ---- public entry point --------------------------------------------------

    pub fn interpret(&mut self, source: &str) -> InterpretResult {
        let function = match Compiler::compile(source, self) {
            Some(f) => f,
            None => return InterpretResult::CompileError,
        };

        let closure = self.alloc_closure(function);
        self.push(Value::Obj(closure as *mut Object));
        self.frames.push(CallFrame::new(closure, 0));

        self.run()
    }

    fn run(&mut self) -> InterpretResult {
        loop {
            #[cfg(feature = "debug_trace_execution")]
            self.trace_instruction();

            let byte = self.read_byte();
            match OpCode::from_byte(byte) {
                OpCode::Constant => {
                    let idx = self.read_indexed_short();
                    self.push(self.constant_at(idx));
                }
                OpCode::ConstantLong => {
                    let idx = self.read_indexed_long();
                    self.push(self.constant_at(idx));
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Zero => self.push(Value::Number(0.0)),
                OpCode::One => self.push(Value::Number(1.0)),
                OpCode::Two => self.push(Value::Number(2.0)),
                OpCode::MinusOne => self.push(Value::Number(-1.0)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::PopN => {
                    let n = self.read_byte() as usize;
                    for _ in 0..n {
                        self.pop();
                    }
                }
                OpCode::Dup => self.push(self.peek(0)),

                OpCode::GetLocal => {
                    let idx = self.read_indexed_short();
                    let slot = self.frame().slots;
                    self.push(self.stack[slot + idx]);
                }
                OpCode::GetLocalLong => {
                    let idx = self.read_indexed_long();
                    let slot = self.frame().slots;
                    self.push(self.stack[slot + idx]);
                }
                OpCode::SetLocal => {
                    let idx = self.read_indexed_short();
                    let slot = self.frame().slots;
                    self.stack[slot + idx] = self.peek(0);
                }
                OpCode::SetLocalLong => {
                    let idx = self.read_indexed_long();
                    let slot = self.frame().slots;
                    self.stack[slot + idx] = self.peek(0);
                }

                OpCode::GetGlobal => {
                    let idx = self.read_indexed_short();
                    match self.read_global(idx) {
                        Ok(v) => self.push(v),
                        Err(e) => return self.runtime_error(&e),
                    }
                }
                OpCode::GetGlobalLong => {
                    let idx = self.read_indexed_long();
                    match self.read_global(idx) {
                        Ok(v) => self.push(v),
                        Err(e) => return self.runtime_error(&e),
                    }
                }
                OpCode::SetGlobal => {
                    let idx = self.read_indexed_short();
                    if let Err(e) = self.write_global(idx) {
                        return self.runtime_error(&e);
                    }
                }
                OpCode::SetGlobalLong => {
                    let idx = self.read_indexed_long();
                    if let Err(e) = self.write_global(idx) {
                        return self.runtime_error(&e);
                    }
                }
                OpCode::DefineGlobal => {
                    let idx = self.read_indexed_short();
                    self.global_values[idx] = self.pop();
                }
                OpCode::DefineGlobalLong => {
                    let idx = self.read_indexed_long();
                    self.global_values[idx] = self.pop();
                }

                OpCode::GetUpvalue => {
                    let idx = self.read_byte() as usize;
                    let closure = self.frame().closure;
                    let upvalue = unsafe { (*closure).upvalues[idx] };
                    let value = unsafe {
                        if (*upvalue).is_open() {
                            *(*upvalue).location
                        } else {
                            (*upvalue).closed
                        }
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let idx = self.read_byte() as usize;
                    let closure = self.frame().closure;
                    let upvalue = unsafe { (*closure).upvalues[idx] };
                    let value = self.peek(0);
                    unsafe {
                        if (*upvalue).is_open() {
                            *(*upvalue).location = value;
                        } else {
                            (*upvalue).closed = value;
                        }
                    }
                }

                OpCode::GetProperty => {
                    let idx = self.read_indexed_short();
                    if let Err(e) = self.get_property(idx) {
                        return self.runtime_error(&e);
                    }
                }
                OpCode::GetPropertyLong => {
                    let idx = self.read_indexed_long();
                    if let Err(e) = self.get_property(idx) {
                        return self.runtime_error(&e);
                    }
                }
                OpCode::SetProperty => {
                    let idx = self.read_indexed_short();
                    if let Err(e) = self.set_property(idx) {
                        return self.runtime_error(&e);
                    }
                }
                OpCode::SetPropertyLong => {
                    let idx = self.read_indexed_long();
                    if let Err(e) = self.set_property(idx) {
                        return self.runtime_error(&e);
                    }
                }
                OpCode::DelProperty => {
                    let idx = self.read_indexed_short();
                    if let Err(e) = self.del_property(idx) {
                        return self.runtime_error(&e);
                    }
                }
                OpCode::DelPropertyLong => {
                    let idx = self.read_indexed_long();
                    if let Err(e) = self.del_property(idx) {
                        return self.runtime_error(&e);
                    }
                }

                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a.values_equal(&b)));
                }
                OpCode::Greater => {
                    if let Err(e) = self.binary_number_cmp(|a, b| a > b) {
                        return self.runtime_error(&e);
                    }
                }
                OpCode::Less => {
                    if let Err(e) = self.binary_number_cmp(|a, b| a < b) {
                        return self.runtime_error(&e);
                    }
                }

                OpCode::Add => {
                    if let Err(e) = self.add() {
                        return self.runtime_error(&e);
                    }
                }
                OpCode::Subtract => {
                    if let Err(e) = self.binary_number_op(|a, b| a - b) {
                        return self.runtime_error(&e);
                    }
                }
                OpCode::Multiply => {
                    if let Err(e) = self.binary_number_op(|a, b| a * b) {
                        return self.runtime_error(&e);
                    }
                }
                OpCode::Divide => {
                    if let Err(e) = self.divide() {
                        return self.runtime_error(&e);
                    }
                }
                OpCode::Negate => {
                    if !self.peek(0).is_number() {
                        return self.runtime_error("Operand must be a number.");
                    }
                    let n = self.pop().as_number();
                    self.push(Value::Number(-n));
                }
                OpCode::Increment => {
                    if !self.peek(0).is_number() {
                        return self.runtime_error("Operand must be a number.");
                    }
                    let n = self.pop().as_number();
                    self.push(Value::Number(n + 1.0));
                }
                OpCode::Decrement => {
                    if !self.peek(0).is_number() {
                        return self.runtime_error("Operand must be a number.");
                    }
                    let n = self.pop().as_number();
                    self.push(Value::Number(n - 1.0));
                }
                OpCode::Not => {
                    let v = self.pop();
                    self.push(Value::Bool(v.is_falsey()));
                }

                OpCode::Print => {
                    value::print_value(&self.pop());
                    println!();
                }

                OpCode::Jump => {
                    let offset = self.read_short();
                    self.frame().ip += offset as usize;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_short();
                    if self.peek(0).is_falsey() {
                        self.frame().ip += offset as usize;
                    }
                }
                OpCode::JumpIfTrue => {
                    let offset = self.read_short();
                    if !self.peek(0).is_falsey() {
                        self.frame().ip += offset as usize;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_short();
                    self.frame().ip -= offset as usize;
                }

                OpCode::Call => {
                    let argc = self.read_byte() as usize;
                    let callee = self.peek(argc);
                    if let Err(e) = self.call_value(callee, argc) {
                        return self.runtime_error(&e);
                    }
                }
                OpCode::Invoke => {
                    let idx = self.read_indexed_short();
                    let argc = self.read_byte() as usize;
                    if let Err(e) = self.invoke(idx, argc) {
                        return self.runtime_error(&e);
                    }
                }
                OpCode::InvokeLong => {
                    let idx = self.read_indexed_long();
                    let argc = self.read_byte() as usize;
                    if let Err(e) = self.invoke(idx, argc) {
                        return self.runtime_error(&e);
                    }
                }

                OpCode::Closure => {
                    let idx = self.read_indexed_short();
                    self.make_closure(idx);
                }

                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }

                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("return with no frame");
                    self.close_upvalues(frame.slots);
                    if self.frames.is_empty() {
                        self.pop();
                        return InterpretResult::Ok;
                    }
                    self.stack.truncate(frame.slots);
                    self.push(result);
                }

                OpCode::Class => {
                    let idx = self.read_indexed_short();
                    self.make_class(idx);
                }
                OpCode::ClassLong => {
                    let idx = self.read_indexed_long();
                    self.make_class(idx);
                }
                OpCode::Method => {
                    let idx = self.read_indexed_short();
                    self.define_method(idx);
                }
                OpCode::MethodLong => {
                    let idx = self.read_indexed_long();
                    self.define_method(idx);
                }

                OpCode::Unknown(b) => return self.runtime_error(&format!("Unknown opcode {b}.")),
            }
        }
    }

    // ---- opcode helpers --------------------------------------------------

    fn read_global(&mut self, index: usize) -> Result<Value, String> {
        match self.global_values[index] {
            Value::Undefined => Err(format!("Undefined variable '{}'.", self.global_name_str(index))),
            v => Ok(v),
        }
    }

    fn write_global(&mut self, index: usize) -> Result<(), String> {
        if matches!(self.global_values[index], Value::Undefined) {
            return Err(format!("Undefined variable '{}'.", self.global_name_str(index)));
        }
        if self.global_access[index] == AccessKind::Fix {
            return Err("Fixed variable cannot be reassigned.".to_string());
        }
        self.global_values[index] = self.peek(0);
        Ok(())
    }

    fn binary_number_op(&mut self, op: impl Fn(f64, f64) -> f64) -> Result<(), String> {
        if !self.peek(0).is_number() || !self.peek(1).is_number() {
            return Err("Operands must be numbers.".to_string());
        }
        let b = self.pop().as_number();
        let a = self.pop().as_number();
        self.push(Value::Number(op(a, b)));
        Ok(())
    }

    fn binary_number_cmp(&mut self, op: impl Fn(f64, f64) -> bool) -> Result<(), String> {
        if !self.peek(0).is_number() || !self.peek(1).is_number() {
            return Err("Operands must be numbers.".to_string());
        }
        let b = self.pop().as_number();
        let a = self.pop().as_number();
        self.push(Value::Bool(op(a, b)));
        Ok(())
    }

    fn divide(&mut self) -> Result<(), String> {
        if !self.peek(0).is_number() || !self.peek(1).is_number() {
            return Err("Operands must be numbers.".to_string());
        }
        let b = self.pop().as_number();
        let a = self.pop().as_number();
        if b == 0.0 {
            return Err("Division by zero.".to_string());
        }
        self.push(Value::Number(a / b));
        Ok(())
    }

    /// Inputs are peeked, not popped, until the result is pushed so the GC
    /// always finds them reachable from the stack.
    fn add(&mut self) -> Result<(), String> {
        let b = self.peek(0);
        let a = self.peek(1);
        if a.is_string() && b.is_string() {
            let (sa, sb) = unsafe {
                let sa = object::as_string(a.as_obj());
                let sb = object::as_string(b.as_obj());
                ((*sa).as_str().to_string(), (*sb).as_str().to_string())
            };
            let result = self.concatenate(&sa, &sb);
            self.pop();
            self.pop();
            self.push(Value::Obj(result as *mut Object));
            Ok(())
        } else if a.is_number() && b.is_number() {
            let bn = self.pop().as_number();
            let an = self.pop().as_number();
            self.push(Value::Number(an + bn));
            Ok(())
        } else {
            Err("Operands must be two numbers or two strings.".to_string())
        }
    }

    fn get_property(&mut self, name_idx: usize) -> Result<(), String> {
        let receiver = self.peek(0);
        if !receiver.is_obj_kind(ObjectType::Instance) {
            return Err("Only instances have properties.".to_string());
        }
        let instance = unsafe { object::as_instance(receiver.as_obj()) };
        let name = self.constant_name_at(name_idx);
        let key = Value::Obj(name as *mut Object);

        if let Some(value) = unsafe { (*instance).fields.get(&key) } {
            self.pop();
            self.push(value);
            return Ok(());
        }

        let class = unsafe { (*instance).class };
        if let Some(Value::Obj(method_ptr)) = unsafe { (*class).methods.get(&key) } {
            let method = method_ptr as *mut ObjClosure;
            let bound = self.alloc_bound_method(receiver, method);
            self.pop();
            self.push(Value::Obj(bound as *mut Object));
            return Ok(());
        }

        Err(format!("Undefined property '{}'.", unsafe { (*name).as_str() }))
    }

    fn set_property(&mut self, name_idx: usize) -> Result<(), String> {
        let receiver = self.peek(1);
        if !receiver.is_obj_kind(ObjectType::Instance) {
            return Err("Only instances have fields.".to_string());
        }
        let instance = unsafe { object::as_instance_mut(receiver.as_obj()) };
        let name = self.constant_name_at(name_idx);
        let value = self.peek(0);
        unsafe { (*instance).fields.set(Value::Obj(name as *mut Object), value) };
        self.pop();
        self.pop();
        self.push(value);
        Ok(())
    }

    fn del_property(&mut self, name_idx: usize) -> Result<(), String> {
        let receiver = self.peek(0);
        if !receiver.is_obj_kind(ObjectType::Instance) {
            return Err("Only instances have fields.".to_string());
        }
        let instance = unsafe { object::as_instance_mut(receiver.as_obj()) };
        let name = self.constant_name_at(name_idx);
        unsafe { (*instance).fields.delete(&Value::Obj(name as *mut Object)) };
        self.pop();
        self.push(Value::Nil);
        Ok(())
    }

    fn make_closure(&mut self, function_idx: usize) {
        let function = match self.constant_at(function_idx) {
            Value::Obj(ptr) => unsafe { object::as_function_mut(ptr) },
            _ => unreachable!("CLOSURE operand did not resolve to a function constant"),
        };
        let closure = self.alloc_closure(function);
        let upvalue_count = unsafe { (*function).upvalue_count };
        for _ in 0..upvalue_count {
            let is_local = self.read_byte() != 0;
            let index = self.read_byte() as usize;
            let upvalue = if is_local {
                let slot = self.frame().slots + index;
                self.capture_upvalue(slot)
            } else {
                let enclosing = self.frame().closure;
                unsafe { (*enclosing).upvalues[index] }
            };
            unsafe { (*closure).upvalues.push(upvalue) };
        }
        self.push(Value::Obj(closure as *mut Object));
    }

    /// Walks the open-upvalue list (sorted by strictly descending stack
    /// address) to find an existing upvalue for `slot`, or allocates and
    /// links a new one at the correct insertion point.
    fn capture_upvalue(&mut self, slot: usize) -> *mut ObjUpvalue {
        let target = &mut self.stack[slot] as *mut Value;
        let mut previous: *mut ObjUpvalue = std::ptr::null_mut();
        let mut current = self.open_upvalues;

        unsafe {
            while !current.is_null() && (*current).location > target {
                previous = current;
                current = (*current).next;
            }

            if !current.is_null() && (*current).location == target {
                return current;
            }

            let created = self.alloc_upvalue(target);
            (*created).next = current;
            if previous.is_null() {
                self.open_upvalues = created;
            } else {
                (*previous).next = created;
            }
            created
        }
    }

    /// Closes every open upvalue whose `location` is at or above `from`.
    fn close_upvalues(&mut self, from: usize) {
        let boundary = &self.stack[from] as *const Value as *mut Value;
        unsafe {
            while !self.open_upvalues.is_null() && (*self.open_upvalues).location >= boundary {
                let upvalue = self.open_upvalues;
                (*upvalue).close();
                self.open_upvalues = (*upvalue).next;
            }
        }
    }

    fn call_value(&mut self, callee: Value, argc: usize) -> Result<(), String> {
        if let Value::Obj(ptr) = callee {
            match unsafe { (*ptr).kind } {
                ObjectType::Closure => return self.call_closure(ptr as *mut ObjClosure, argc),
                ObjectType::Native => {
                    let native = ptr as *mut ObjNative;
                    return self.call_native(native, argc);
                }
                ObjectType::Class => {
                    let class = ptr as *mut ObjClass;
                    let instance = self.alloc_instance(class);
                    let base = self.stack.len() - argc - 1;
                    self.stack[base] = Value::Obj(instance as *mut Object);
                    if let Some(init) = unsafe { (*class).init } {
                        return self.call_closure(init, argc);
                    }
                    if argc != 0 {
                        return Err(format!("Expected 0 arguments but got {argc}."));
                    }
                    return Ok(());
                }
                ObjectType::BoundMethod => {
                    let bound = ptr as *mut ObjBoundMethod;
                    let base = self.stack.len() - argc - 1;
                    self.stack[base] = unsafe { (*bound).receiver };
                    let method = unsafe { (*bound).method };
                    return self.call_closure(method, argc);
                }
                _ => {}
            }
        }
        Err("Can only call functions and classes.".to_string())
    }

    fn call_closure(&mut self, closure: *mut ObjClosure, argc: usize) -> Result<(), String> {
        let arity = unsafe { (*(*closure).function).arity } as usize;
        if argc != arity {
            return Err(format!("Expected {arity} arguments but got {argc}."));
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err("Stack overflow.".to_string());
        }
        let slots = self.stack.len() - argc - 1;
        self.frames.push(CallFrame::new(closure, slots));
        Ok(())
    }

    fn call_native(&mut self, native: *mut ObjNative, argc: usize) -> Result<(), String> {
        let arity = unsafe { (*native).arity } as usize;
        if argc != arity {
            return Err(format!("Expected {arity} arguments but got {argc}."));
        }
        let base = self.stack.len() - argc;
        let args: Vec<Value> = self.stack[base..].to_vec();
        let function = unsafe { (*native).function };
        let result = function(self, &args)?;
        self.stack.truncate(base - 1);
        self.push(result);
        Ok(())
    }

    fn invoke(&mut self, name_idx: usize, argc: usize) -> Result<(), String> {
        let receiver = self.peek(argc);
        if !receiver.is_obj_kind(ObjectType::Instance) {
            return Err("Only instances have methods.".to_string());
        }
        let instance = unsafe { object::as_instance(receiver.as_obj()) };
        let name = self.constant_name_at(name_idx);
        let key = Value::Obj(name as *mut Object);

        if let Some(field) = unsafe { (*instance).fields.get(&key) } {
            let base = self.stack.len() - argc - 1;
            self.stack[base] = field;
            return self.call_value(field, argc);
        }

        let class = unsafe { (*instance).class };
        match unsafe { (*class).methods.get(&key) } {
            Some(Value::Obj(method_ptr)) => self.call_closure(method_ptr as *mut ObjClosure, argc),
            _ => Err(format!("Undefined property '{}'.", unsafe { (*name).as_str() })),
        }
    }

    fn make_class(&mut self, name_idx: usize) {
        let name = self.constant_name_at(name_idx);
        let class = self.alloc_class(name);
        self.push(Value::Obj(class as *mut Object));
    }

    fn define_method(&mut self, name_idx: usize) {
        let name = self.constant_name_at(name_idx);
        let method = match self.pop() {
            Value::Obj(ptr) => unsafe { object::as_closure_mut(ptr) },
            _ => unreachable!("METHOD operand did not resolve to a closure"),
        };
        let class = match self.peek(0) {
            Value::Obj(ptr) => unsafe { object::as_class_mut(ptr) },
            _ => unreachable!("METHOD target is not a class"),
        };
        unsafe {
            (*class).methods.set(Value::Obj(name as *mut Object), Value::Obj(method as *mut Object));
            if name == self.init_string {
                (*class).init = Some(method);
            }
        }
    }

    fn runtime_error(&mut self, message: &str) -> InterpretResult {
        eprintln!("Runtime Error: {message}");
        for frame in self.frames.iter().rev() {
            let function = unsafe { (*frame.closure).function };
            let chunk = unsafe { &(*function).chunk };
            let line = chunk.line_for(frame.ip.saturating_sub(1));
            let name = unsafe { (*function).display_name().to_string() };
            eprintln!("[line {line}] in {name}");
        }
        self.stack.clear();
        self.frames.clear();
        InterpretResult::RuntimeError
    }

    // ---- garbage collection --------------------------------------------------

    fn collect_garbage(&mut self) {
        let before = self.bytes_allocated;
        let mut gc = GarbageCollector::new();

        for value in &self.stack {
            gc.mark_value(value);
        }
        for frame in &self.frames {
            gc.mark_object(frame.closure as *mut Object);
        }
        gc.mark_table(&self.global_slots);
        for value in &self.global_values {
            gc.mark_value(value);
        }
        for &name in &self.global_names {
            gc.mark_object(name as *mut Object);
        }
        let mut upvalue = self.open_upvalues;
        unsafe {
            while !upvalue.is_null() {
                gc.mark_object(upvalue as *mut Object);
                upvalue = (*upvalue).next;
            }
        }
        for &root in &self.compiler_roots {
            gc.mark_object(root);
        }
        gc.mark_object(self.init_string as *mut Object);

        gc.trace_references();
        self.sweep_intern_table();

        let (new_head, freed) = unsafe { gc.sweep(self.objects) };
        self.objects = new_head;
        self.bytes_allocated -= freed;
        self.next_gc = (self.bytes_allocated.max(INITIAL_GC_THRESHOLD)) * GC_GROWTH_FACTOR;
        gc.record_cycle(before, freed, self.bytes_allocated, self.next_gc);
    }

    /// Removes intern-table entries whose key string didn't survive marking,
    /// before sweep frees the backing allocation. Must run after
    /// `trace_references` and before `sweep`.
    fn sweep_intern_table(&mut self) {
        let doomed: Vec<Value> = self
            .intern_strings
            .iter()
            .filter_map(|(key, _)| match *key {
                Value::Obj(ptr) if !unsafe { (*ptr).mark } => Some(*key),
                _ => None,
            })
            .collect();
        for key in doomed {
            self.intern_strings.delete(&key);
        }
    }

    #[cfg(feature = "debug_trace_execution")]
    fn trace_instruction(&mut self) {
        print!("          ");
        for slot in &self.stack {
            print!("[ ");
            value::print_value(slot);
            print!(" ]");
        }
        println!();
        let frame = self.frames.last().expect("no active call frame");
        let chunk = unsafe { &(*(*frame.closure).function).chunk };
        debug::disassemble_instruction(chunk, frame.ip);
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        let mut current = self.objects;
        unsafe {
            while !current.is_null() {
                let next = (*current).next;
                object::debug_drop_trace(current);
                drop(Box::from_raw(current));
                current = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic_and_print() {
        let mut vm = Vm::new();
        assert_eq!(vm.interpret("print 1 + 2 * 3;"), InterpretResult::Ok);
    }

    #[test]
    fn string_concatenation_interns() {
        let mut vm = Vm::new();
        assert_eq!(vm.interpret("print \"ab\" + \"cd\";"), InterpretResult::Ok);
    }

    #[test]
    fn fix_global_reassignment_is_runtime_error() {
        let mut vm = Vm::new();
        assert_eq!(vm.interpret("fix x = 10; x = 11;"), InterpretResult::RuntimeError);
    }

    #[test]
    fn undefined_global_is_runtime_error() {
        let mut vm = Vm::new();
        assert_eq!(vm.interpret("print nope;"), InterpretResult::RuntimeError);
    }

    #[test]
    fn closures_capture_upvalues() {
        let mut vm = Vm::new();
        let source = "\
            fun makeCounter() {\n\
                var i = 0;\n\
                fun count() {\n\
                    i = i + 1;\n\
                    return i;\n\
                }\n\
                return count;\n\
            }\n\
            var counter = makeCounter();\n\
            print counter();\n\
            print counter();\n\
        ";
        assert_eq!(vm.interpret(source), InterpretResult::Ok);
    }

    #[test]
    fn classes_and_fields() {
        let mut vm = Vm::new();
        let source = "\
            class Point {\n\
                init(x, y) {\n\
                    this.x = x;\n\
                    this.y = y;\n\
                }\n\
                sum() {\n\
                    return this.x + this.y;\n\
                }\n\
            }\n\
            var p = Point(1, 2);\n\
            print p.sum();\n\
        ";
        assert_eq!(vm.interpret(source), InterpretResult::Ok);
    }
}
