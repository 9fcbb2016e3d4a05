// (C) 2023 Brandon Lewis
//
// The DSB interpreter.
//
// A VM owns one module, one value pool, and the execution state of one
// applet: program counter, operand stack, call stack, TRY handler
// stack, globals, and the callback machinery. It never blocks and never
// runs more than the instruction budget it is handed: execute() is the
// scheduler's whole contract with a task, and a fresh call resumes
// exactly where the previous one stopped.
//
// *Errors*
//
// Faults raised inside an opcode first consult the handler stack. A
// live TRY handler turns the fault into a thrown value and transfers
// control to its catch target after truncating both stacks to the
// depths recorded at TRY. Stack corruption (underflow, arity
// mismatches) and exhaustion are fatal and surface as VMResult::Error
// with the source line when the module carries a line table.
//
// *Memory*
//
// Allocation never collects. The VM collects between instructions when
// the pool crosses its pressure threshold, and once more on demand when
// an allocation refuses; if the retry refuses too, the slice ends in
// VMResult::OutOfMemory. Values that live only inside a single opcode
// are parked in temp_roots so an on-demand collection cannot sweep
// them.
//
// *Callbacks*
//
// Platform events land in a FIFO owned by the VM and drain only at
// instruction boundaries: the callback's arguments are pushed, a
// synthetic frame is installed, and execution continues inside the same
// budget and the same pool. An idle (finished) VM is briefly revived to
// run a callback and reports Finished again when it returns.

use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use regex::Regex;

use crate::heap::ValuePool;
use crate::module::Module;
use crate::natives::NativeCall;
use crate::opcode::Op;
use crate::platform::{EventArg, NativeResult, Platform};
use crate::value::{expected, type_mismatch, Error, Result, TypeTag, Value};


// Host-side guard rails; scripts hit the heap budget long before these.
const STACK_LIMIT: usize = 4096;
const CALL_DEPTH_LIMIT: usize = 256;


// What one execution slice came to.
#[derive(Clone, Debug, PartialEq)]
pub enum VMResult {
    // budget exhausted, more to do
    Ok,
    // voluntary yield or platform-requested suspend
    Yield,
    Finished,
    Error(String),
    OutOfMemory,
}


// Per-invocation record. return_pc is -1 for the top-level frame and
// for frames synthesized to run callbacks on an idle VM. Callback
// frames are fire-and-forget: the interrupted code never asked for a
// value, so their return pushes nothing.
#[derive(Clone, Debug)]
pub struct CallFrame {
    pub return_pc: i32,
    pub locals: HashMap<u8, Value>,
    pub stack_base: usize,
    pub name: String,
    // receiver of a CALL_METHOD invocation, a GC root while the frame
    // is live
    pub receiver: Option<Value>,
    pub is_callback: bool,
}

#[derive(Copy, Clone, Debug)]
struct Handler {
    catch_pc: u32,
    stack_depth: usize,
    call_depth: usize,
}


pub struct VM {
    module: Rc<Module>,
    pool: ValuePool,
    pc: usize,
    // pc of the opcode currently executing, for error reports
    op_pc: usize,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    handlers: Vec<Handler>,
    globals: HashMap<String, Value>,
    callbacks: HashMap<String, Value>,
    callback_queue: VecDeque<(String, Vec<EventArg>)>,
    temp_roots: Vec<Value>,
    finished: bool,
    pending_sleep: Option<u32>,
}

impl VM {
    pub fn new(module: Rc<Module>, pool: ValuePool) -> VM {
        let mut vm = VM {
            module,
            pool,
            pc: 0,
            op_pc: 0,
            stack: Vec::new(),
            frames: Vec::new(),
            handlers: Vec::new(),
            globals: HashMap::new(),
            callbacks: HashMap::new(),
            callback_queue: VecDeque::new(),
            temp_roots: Vec::new(),
            finished: false,
            pending_sleep: None,
        };
        vm.reset();
        vm
    }

    // Rewind to the top of the program. Globals, registered callbacks,
    // queued events and the pool survive; stacks and handlers do not.
    pub fn reset(&mut self) {
        self.pc = self.module.main_entry_point as usize;
        self.op_pc = self.pc;
        self.stack.clear();
        self.frames.clear();
        self.frames.push(CallFrame {
            return_pc: -1,
            locals: HashMap::new(),
            stack_base: 0,
            name: "main".to_string(),
            receiver: None,
            is_callback: false,
        });
        self.handlers.clear();
        self.temp_roots.clear();
        self.finished = false;
        self.pending_sleep = None;
    }

    pub fn module(&self) -> &Rc<Module> {
        &self.module
    }

    pub fn pool(&self) -> &ValuePool {
        &self.pool
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    pub fn call_depth(&self) -> usize {
        self.frames.len()
    }

    // The scheduler turns this into a wake time after a Yield.
    pub fn take_sleep_request(&mut self) -> Option<u32> {
        self.pending_sleep.take()
    }

    pub fn has_callback(&self, event: &str) -> bool {
        self.callbacks.contains_key(event)
    }

    pub fn has_pending_callbacks(&self) -> bool {
        !self.callback_queue.is_empty()
    }

    pub fn enqueue_event(&mut self, event: &str, args: Vec<EventArg>) {
        self.callback_queue.push_back((event.to_string(), args));
    }

    /*** the scheduling contract ***/

    pub fn execute(
        &mut self,
        max_instructions: u32,
        platform: &mut impl Platform
    ) -> VMResult {
        for _ in 0..max_instructions {
            if !self.callback_queue.is_empty() {
                if let Err(e) = self.begin_callback() {
                    return self.fatal(e);
                }
            }
            if self.finished {
                return VMResult::Finished;
            }
            if self.pool.under_pressure() {
                self.collect_garbage();
            }
            match self.step(platform) {
                Ok(()) => (),
                Err(Error::Halt) => {
                    self.finished = true;
                    // queued callbacks drain inside this same slice
                    if self.callback_queue.is_empty() {
                        return VMResult::Finished;
                    }
                },
                Err(Error::Yield) => return VMResult::Yield,
                Err(e) => {
                    if e.catchable() {
                        match self.unwind(e) {
                            Ok(()) => (),
                            Err(fatal) => return self.fatal(fatal),
                        }
                    } else {
                        return self.fatal(e);
                    }
                }
            }
        }
        VMResult::Ok
    }

    fn fatal(&mut self, e: Error) -> VMResult {
        match e {
            Error::OutOfMemory => VMResult::OutOfMemory,
            other => VMResult::Error(self.describe(other)),
        }
    }

    fn describe(&self, e: Error) -> String {
        let base = match &e {
            Error::Thrown(v) =>
                format!("uncaught exception: {}", v.stringify(&self.pool)),
            other => other.message(),
        };
        let location = match self.frames.last() {
            Some(frame) => format!(" in {}", frame.name),
            None => String::new(),
        };
        let line = self.module.source_line(self.op_pc);
        if self.module.has_debug_info() && line > 0 {
            format!("{}{} at line {}", base, location, line)
        } else {
            format!("{}{}", base, location)
        }
    }

    /*** fetch & decode ***/

    fn fetch_u8(&mut self) -> Result<u8> {
        match self.module.code.get(self.pc) {
            Some(&b) => {
                self.pc += 1;
                Ok(b)
            },
            None => Err(Error::IllegalAddr(self.pc))
        }
    }

    fn fetch_u16(&mut self) -> Result<u16> {
        let a = self.fetch_u8()?;
        let b = self.fetch_u8()?;
        Ok(u16::from_le_bytes([a, b]))
    }

    fn fetch_u32(&mut self) -> Result<u32> {
        let a = self.fetch_u8()?;
        let b = self.fetch_u8()?;
        let c = self.fetch_u8()?;
        let d = self.fetch_u8()?;
        Ok(u32::from_le_bytes([a, b, c, d]))
    }

    fn fetch_i32(&mut self) -> Result<i32> {
        Ok(self.fetch_u32()? as i32)
    }

    fn fetch_f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.fetch_u32()?.to_le_bytes()))
    }

    fn constant(&self, index: u16) -> Result<String> {
        self.module.constants
            .get(index as usize)
            .cloned()
            .ok_or(Error::NoSuchConstant(index))
    }

    // Branch targets are relative to the pc after the operand.
    fn jump_target(&self, offset: i32) -> Result<usize> {
        let target = self.pc as i64 + offset as i64;
        if target < 0 || target >= self.module.code.len() as i64 {
            Err(Error::IllegalAddr(target.max(0) as usize))
        } else {
            Ok(target as usize)
        }
    }

    /*** stack & frames ***/

    fn push(&mut self, v: Value) -> Result<()> {
        if self.stack.len() >= STACK_LIMIT {
            return Err(Error::Overflow);
        }
        self.stack.push(v);
        Ok(())
    }

    fn pop(&mut self) -> Result<Value> {
        self.stack.pop().ok_or(Error::Underflow)
    }

    fn frame_mut(&mut self) -> Result<&mut CallFrame> {
        self.frames.last_mut().ok_or(Error::Underflow)
    }

    // Pop argc arguments into a fresh frame's low locals and transfer
    // control to entry_pc.
    fn push_frame(
        &mut self,
        name: String,
        entry_pc: u32,
        argc: u8,
        return_pc: i32,
        receiver: Option<Value>,
        is_callback: bool
    ) -> Result<()> {
        if self.frames.len() >= CALL_DEPTH_LIMIT {
            return Err(Error::Overflow);
        }
        if (entry_pc as usize) >= self.module.code.len() {
            return Err(Error::IllegalAddr(entry_pc as usize));
        }
        let mut locals = HashMap::new();
        for slot in (0..argc).rev() {
            locals.insert(slot, self.pop()?);
        }
        self.frames.push(CallFrame {
            return_pc,
            locals,
            stack_base: self.stack.len(),
            name,
            receiver,
            is_callback,
        });
        self.pc = entry_pc as usize;
        Ok(())
    }

    fn do_return(&mut self) -> Result<()> {
        let ret = self.pop()?;
        let frame = self.frames.pop().ok_or(Error::Underflow)?;
        self.stack.truncate(frame.stack_base);
        // handlers opened inside the finished frame die with it
        let depth = self.frames.len();
        self.handlers.retain(|h| h.call_depth <= depth);
        if frame.return_pc < 0 {
            Err(Error::Halt)
        } else if frame.is_callback {
            // the interrupted code was compiled with no knowledge of
            // this frame; resume it exactly as it was left
            self.pc = frame.return_pc as usize;
            Ok(())
        } else {
            self.push(ret)?;
            self.pc = frame.return_pc as usize;
            Ok(())
        }
    }

    /*** memory ***/

    fn gc_roots(&self) -> Vec<Value> {
        let mut roots: Vec<Value> = Vec::new();
        roots.extend(self.stack.iter().copied());
        for frame in &self.frames {
            roots.extend(frame.locals.values().copied());
            if let Some(receiver) = frame.receiver {
                roots.push(receiver);
            }
        }
        roots.extend(self.globals.values().copied());
        roots.extend(self.callbacks.values().copied());
        roots.extend(self.temp_roots.iter().copied());
        roots
    }

    pub fn collect_garbage(&mut self) {
        let roots = self.gc_roots();
        self.pool.collect(&roots);
    }

    fn alloc_string(&mut self, content: &str) -> Result<Value> {
        if let Some(r) = self.pool.allocate_string(content) {
            return Ok(Value::Str(r));
        }
        self.collect_garbage();
        match self.pool.allocate_string(content) {
            Some(r) => Ok(Value::Str(r)),
            None => Err(Error::OutOfMemory)
        }
    }

    fn alloc_array(&mut self, len: usize) -> Result<Value> {
        if let Some(r) = self.pool.allocate_array(len) {
            return Ok(Value::Array(r));
        }
        self.collect_garbage();
        match self.pool.allocate_array(len) {
            Some(r) => Ok(Value::Array(r)),
            None => Err(Error::OutOfMemory)
        }
    }

    fn alloc_object(&mut self, class_name: &str) -> Result<Value> {
        if let Some(r) = self.pool.allocate_object(class_name) {
            return Ok(Value::Object(r));
        }
        self.collect_garbage();
        match self.pool.allocate_object(class_name) {
            Some(r) => Ok(Value::Object(r)),
            None => Err(Error::OutOfMemory)
        }
    }

    fn alloc_function(&mut self, index: u16, param_count: u8) -> Result<Value> {
        if let Some(r) = self.pool.allocate_function(index, param_count) {
            return Ok(Value::Function(r));
        }
        self.collect_garbage();
        match self.pool.allocate_function(index, param_count) {
            Some(r) => Ok(Value::Function(r)),
            None => Err(Error::OutOfMemory)
        }
    }

    /*** error unwinding ***/

    fn unwind(&mut self, err: Error) -> Result<()> {
        let handler = match self.handlers.pop() {
            Some(h) => h,
            None => return Err(err)
        };
        self.frames.truncate(handler.call_depth);
        self.stack.truncate(handler.stack_depth);
        let value = match err {
            Error::Thrown(v) => v,
            other => self.alloc_string(&other.message())?,
        };
        self.push(value)?;
        self.pc = handler.catch_pc as usize;
        Ok(())
    }

    /*** callbacks ***/

    // Install the frontmost queued callback whose event still has a
    // registered handler; entries without one are dropped. Runs only at
    // instruction boundaries.
    fn begin_callback(&mut self) -> Result<()> {
        let (function, args) = loop {
            let (event, args) = match self.callback_queue.pop_front() {
                Some(entry) => entry,
                None => return Ok(())
            };
            match self.callbacks.get(&event) {
                Some(&Value::Function(r)) => break (r, args),
                // unregistered or re-registered to a non-function
                _ => continue
            }
        };
        let (index, param_count) = self.pool.function_of(function);
        let def = self.module.function(index)
            .ok_or(Error::NoSuchFunction(index))?;
        let name = def.name.clone();
        let entry_pc = def.entry_pc;

        let return_pc = if self.finished { -1 } else { self.pc as i32 };
        self.finished = false;

        // missing arguments observe Null, surplus ones are dropped; the
        // operand stack roots each converted value through later
        // conversions
        for slot in 0..param_count {
            let value = match args.get(slot as usize) {
                Some(arg) => self.event_value(arg)?,
                None => Value::Null
            };
            self.push(value)?;
        }
        self.push_frame(name, entry_pc, param_count, return_pc, None, true)
    }

    fn event_value(&mut self, arg: &EventArg) -> Result<Value> {
        if let Some(v) = arg.to_value(&mut self.pool) {
            return Ok(v);
        }
        self.collect_garbage();
        arg.to_value(&mut self.pool).ok_or(Error::OutOfMemory)
    }

    /*** dispatch ***/

    fn step(&mut self, platform: &mut impl Platform) -> Result<()> {
        self.op_pc = self.pc;
        let byte = self.fetch_u8()?;
        let op = Op::from_u8(byte).ok_or(Error::IllegalOpcode(byte))?;
        trace!("{:04x} {:?} {:?}", self.op_pc, op, self.stack);

        match op {
            Op::Nop => Ok(()),
            Op::Pop => self.pop().map(|_| ()),
            Op::Dup => {
                let top = *self.stack.last().ok_or(Error::Underflow)?;
                self.push(top)
            },
            Op::Swap => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(b)?;
                self.push(a)
            },

            Op::PushNull => self.push(Value::Null),
            Op::PushTrue => self.push(Value::Bool(true)),
            Op::PushFalse => self.push(Value::Bool(false)),
            Op::PushI8 => {
                let v = self.fetch_u8()? as i8;
                self.push(Value::Int32(v as i32))
            },
            Op::PushI16 => {
                let v = self.fetch_u16()? as i16;
                self.push(Value::Int32(v as i32))
            },
            Op::PushI32 => {
                let v = self.fetch_i32()?;
                self.push(Value::Int32(v))
            },
            Op::PushF32 => {
                let v = self.fetch_f32()?;
                self.push(Value::Float32(v))
            },
            Op::PushStr => {
                let index = self.fetch_u16()?;
                let content = self.constant(index)?;
                let v = self.alloc_string(&content)?;
                self.push(v)
            },

            Op::LoadLocal => {
                let slot = self.fetch_u8()?;
                let v = self.frames.last()
                    .and_then(|f| f.locals.get(&slot).copied())
                    .unwrap_or(Value::Null);
                self.push(v)
            },
            Op::StoreLocal => {
                let slot = self.fetch_u8()?;
                let v = self.pop()?;
                self.frame_mut()?.locals.insert(slot, v);
                Ok(())
            },
            Op::LoadGlobal => {
                let index = self.fetch_u16()?;
                let name = self.module.globals
                    .get(index as usize)
                    .ok_or(Error::NoSuchGlobal(index))?;
                let v = self.globals.get(name).copied().unwrap_or(Value::Null);
                self.push(v)
            },
            Op::StoreGlobal => {
                let index = self.fetch_u16()?;
                let name = self.module.globals
                    .get(index as usize)
                    .ok_or(Error::NoSuchGlobal(index))?
                    .clone();
                let v = self.pop()?;
                self.globals.insert(name, v);
                Ok(())
            },

            Op::Add => self.add(),
            Op::Sub => {
                let b = self.pop()?;
                let a = self.pop()?;
                let v = a.sub(&b)?;
                self.push(v)
            },
            Op::Mul => {
                let b = self.pop()?;
                let a = self.pop()?;
                let v = a.mul(&b)?;
                self.push(v)
            },
            Op::Div => {
                let b = self.pop()?;
                let a = self.pop()?;
                let v = a.div(&b)?;
                self.push(v)
            },
            Op::Mod => {
                let b = self.pop()?;
                let a = self.pop()?;
                let v = a.modulo(&b)?;
                self.push(v)
            },
            Op::Neg => {
                let a = self.pop()?;
                let v = a.neg()?;
                self.push(v)
            },
            Op::StrConcat => {
                let b = self.pop()?;
                let a = self.pop()?;
                let joined = format!(
                    "{}{}",
                    a.stringify(&self.pool),
                    b.stringify(&self.pool)
                );
                let v = self.alloc_string(&joined)?;
                self.push(v)
            },
            Op::TemplateFormat => {
                let argc = self.fetch_u8()?;
                self.template_format(argc)
            },

            Op::Eq => {
                let b = self.pop()?;
                let a = self.pop()?;
                let eq = a.equals(&b, &self.pool);
                self.push(Value::Bool(eq))
            },
            Op::Ne => {
                let b = self.pop()?;
                let a = self.pop()?;
                let eq = a.equals(&b, &self.pool);
                self.push(Value::Bool(!eq))
            },
            Op::Lt => self.compare(|o| o == std::cmp::Ordering::Less),
            Op::Le => self.compare(|o| o != std::cmp::Ordering::Greater),
            Op::Gt => self.compare(|o| o == std::cmp::Ordering::Greater),
            Op::Ge => self.compare(|o| o != std::cmp::Ordering::Less),
            Op::Not => {
                let a = self.pop()?;
                let v = Value::Bool(!a.truthy(&self.pool));
                self.push(v)
            },
            // AND and OR keep the operand that decided the outcome;
            // short-circuiting is the compiler's business
            Op::And => {
                let b = self.pop()?;
                let a = self.pop()?;
                let v = if a.truthy(&self.pool) { b } else { a };
                self.push(v)
            },
            Op::Or => {
                let b = self.pop()?;
                let a = self.pop()?;
                let v = if a.truthy(&self.pool) { a } else { b };
                self.push(v)
            },

            Op::Jump => {
                let offset = self.fetch_i32()?;
                self.pc = self.jump_target(offset)?;
                Ok(())
            },
            Op::JumpIf => {
                let offset = self.fetch_i32()?;
                let target = self.jump_target(offset)?;
                let cond = self.pop()?;
                if cond.truthy(&self.pool) {
                    self.pc = target;
                }
                Ok(())
            },
            Op::JumpIfNot => {
                let offset = self.fetch_i32()?;
                let target = self.jump_target(offset)?;
                let cond = self.pop()?;
                if !cond.truthy(&self.pool) {
                    self.pc = target;
                }
                Ok(())
            },

            Op::Call => {
                let index = self.fetch_u16()?;
                let argc = self.fetch_u8()?;
                let def = self.module.function(index)
                    .ok_or(Error::NoSuchFunction(index))?;
                if argc != def.param_count {
                    return Err(Error::Arity(argc, def.param_count));
                }
                let name = def.name.clone();
                let entry_pc = def.entry_pc;
                let return_pc = self.pc as i32;
                self.push_frame(name, entry_pc, argc, return_pc, None, false)
            },
            Op::CallNative => {
                let id = self.fetch_u16()?;
                let argc = self.fetch_u8()?;
                self.call_native(id, argc, platform)
            },
            Op::CallIndirect => {
                let argc = self.fetch_u8()?;
                let callee = self.pop()?;
                let r = match callee {
                    Value::Function(r) => r,
                    other => return Err(expected(TypeTag::Function.into(), &other))
                };
                let (index, param_count) = self.pool.function_of(r);
                if argc != param_count {
                    return Err(Error::Arity(argc, param_count));
                }
                let def = self.module.function(index)
                    .ok_or(Error::NoSuchFunction(index))?;
                let name = def.name.clone();
                let entry_pc = def.entry_pc;
                let return_pc = self.pc as i32;
                self.push_frame(name, entry_pc, argc, return_pc, None, false)
            },
            Op::CallMethod => {
                let argc = self.fetch_u8()?;
                let name_index = self.fetch_u16()?;
                let name = self.constant(name_index)?;
                self.call_method(argc, &name)
            },
            Op::Return => self.do_return(),
            Op::LoadFunction => {
                let index = self.fetch_u16()?;
                let def = self.module.function(index)
                    .ok_or(Error::NoSuchFunction(index))?;
                let param_count = def.param_count;
                let v = self.alloc_function(index, param_count)?;
                self.push(v)
            },

            Op::NewObject => {
                let index = self.fetch_u16()?;
                let class_name = self.constant(index)?;
                let v = self.alloc_object(&class_name)?;
                self.push(v)
            },
            Op::GetField => {
                let index = self.fetch_u16()?;
                let name = self.constant(index)?;
                self.get_field(&name)
            },
            Op::SetField => {
                let index = self.fetch_u16()?;
                let name = self.constant(index)?;
                self.set_field(&name)
            },

            Op::NewArray => {
                let size = self.pop()?;
                let len = match size {
                    Value::Int32(n) if n >= 0 => n as usize,
                    Value::Int32(n) => return Err(Error::IndexError(n)),
                    other => return Err(expected(TypeTag::Int32.into(), &other))
                };
                let v = self.alloc_array(len)?;
                self.push(v)
            },
            Op::GetIndex => self.get_index(),
            Op::SetIndex => self.set_index(),

            Op::Try => {
                let offset = self.fetch_i32()?;
                let catch_pc = self.jump_target(offset)? as u32;
                self.handlers.push(Handler {
                    catch_pc,
                    stack_depth: self.stack.len(),
                    call_depth: self.frames.len(),
                });
                Ok(())
            },
            Op::EndTry => {
                self.handlers.pop().ok_or(Error::Underflow)?;
                Ok(())
            },
            Op::Throw => {
                let v = self.pop()?;
                Err(Error::Thrown(v))
            },

            Op::Print => {
                let v = self.pop()?;
                platform.invoke(NativeCall::ConsoleLog, &[v], &mut self.pool);
                Ok(())
            },
            Op::Halt => Err(Error::Halt),
        }
    }

    /*** the longer opcode bodies ***/

    fn add(&mut self) -> Result<()> {
        use Value::*;
        let b = self.pop()?;
        let a = self.pop()?;
        let v = match (a, b) {
            (Str(_), _) | (_, Str(_)) => {
                let joined = format!(
                    "{}{}",
                    a.stringify(&self.pool),
                    b.stringify(&self.pool)
                );
                self.alloc_string(&joined)?
            },
            // Int32 overflow wraps
            (Int32(x), Int32(y)) => Int32(x.wrapping_add(y)),
            (Int32(x), Float32(y)) => Float32(x as f32 + y),
            (Float32(x), Int32(y)) => Float32(x + y as f32),
            (Float32(x), Float32(y)) => Float32(x + y),
            (a, b) => return Err(type_mismatch(&a, &b))
        };
        self.push(v)
    }

    fn compare(&mut self, take: fn(std::cmp::Ordering) -> bool) -> Result<()> {
        let b = self.pop()?;
        let a = self.pop()?;
        let ordering = a.compare(&b, &self.pool)?;
        self.push(Value::Bool(take(ordering)))
    }

    // Substitution values replace successive ${...} placeholders left
    // to right. Surplus placeholders stay verbatim, surplus values are
    // dropped.
    fn template_format(&mut self, argc: u8) -> Result<()> {
        lazy_static! {
            static ref PLACEHOLDER: Regex = Regex::new(r"\$\{[^}]*\}")
                .expect("placeholder pattern");
        }

        let mut args = Vec::with_capacity(argc as usize);
        for _ in 0..argc {
            args.push(self.pop()?);
        }
        args.reverse();
        let template = match self.pop()? {
            Value::Str(r) => self.pool.str_content(r).to_string(),
            other => return Err(expected(TypeTag::Str.into(), &other))
        };
        let substitutions: Vec<String> = args
            .iter()
            .map(|v| v.stringify(&self.pool))
            .collect();

        let mut rendered = String::new();
        let mut consumed = 0;
        for (i, hit) in PLACEHOLDER.find_iter(&template).enumerate() {
            rendered.push_str(&template[consumed..hit.start()]);
            match substitutions.get(i) {
                Some(s) => rendered.push_str(s),
                None => rendered.push_str(hit.as_str())
            }
            consumed = hit.end();
        }
        rendered.push_str(&template[consumed..]);

        let v = self.alloc_string(&rendered)?;
        self.push(v)
    }

    fn get_field(&mut self, name: &str) -> Result<()> {
        let target = self.pop()?;
        let v = match target {
            Value::Object(r) =>
                self.pool.field_get(r, name).unwrap_or(Value::Null),
            Value::Array(r) if name == "length" =>
                Value::Int32(self.pool.array_len(r) as i32),
            Value::Str(r) if name == "length" =>
                Value::Int32(self.pool.str_content(r).chars().count() as i32),
            Value::Array(_) | Value::Str(_) =>
                return Err(Error::FieldError(name.to_string())),
            other => return Err(expected(
                TypeTag::Object | TypeTag::Array | TypeTag::Str,
                &other
            ))
        };
        self.push(v)
    }

    fn set_field(&mut self, name: &str) -> Result<()> {
        let value = self.pop()?;
        let target = self.pop()?;
        let obj = match target {
            Value::Object(r) => r,
            other => return Err(expected(TypeTag::Object.into(), &other))
        };
        if self.pool.field_set(obj, name, value).is_some() {
            return Ok(());
        }
        // the new field did not fit; one collection, one retry
        self.temp_roots.push(value);
        self.temp_roots.push(target);
        self.collect_garbage();
        let outcome = self.pool.field_set(obj, name, value);
        self.temp_roots.clear();
        outcome.ok_or(Error::OutOfMemory)
    }

    fn get_index(&mut self) -> Result<()> {
        let index = self.pop()?;
        let target = self.pop()?;
        let arr = match target {
            Value::Array(r) => r,
            other => return Err(expected(TypeTag::Array.into(), &other))
        };
        let v = match index {
            // out-of-range reads, negative included, observe Null
            Value::Int32(i) if i >= 0 => self.pool.array_get(arr, i as usize),
            Value::Int32(_) => Value::Null,
            other => return Err(expected(TypeTag::Int32.into(), &other))
        };
        self.push(v)
    }

    fn set_index(&mut self) -> Result<()> {
        let value = self.pop()?;
        let index = self.pop()?;
        let target = self.pop()?;
        let arr = match target {
            Value::Array(r) => r,
            other => return Err(expected(TypeTag::Array.into(), &other))
        };
        let i = match index {
            Value::Int32(i) if i >= 0 => i as usize,
            Value::Int32(i) => return Err(Error::IndexError(i)),
            other => return Err(expected(TypeTag::Int32.into(), &other))
        };
        if self.pool.array_set(arr, i, value).is_some() {
            return Ok(());
        }
        self.temp_roots.push(value);
        self.temp_roots.push(target);
        self.collect_garbage();
        let outcome = self.pool.array_set(arr, i, value);
        self.temp_roots.clear();
        outcome.ok_or(Error::OutOfMemory)
    }

    fn call_native(
        &mut self,
        id: u16,
        argc: u8,
        platform: &mut impl Platform
    ) -> Result<()> {
        let call = NativeCall::from_u16(id).ok_or(Error::NoSuchNative(id))?;
        let mut args = Vec::with_capacity(argc as usize);
        for _ in 0..argc {
            args.push(self.pop()?);
        }
        args.reverse();

        // calls answered from inside the sandbox
        match call {
            NativeCall::EventsRegisterCallback => {
                let event = match args.get(0) {
                    Some(Value::Str(r)) => self.pool.str_content(*r).to_string(),
                    Some(other) => return Err(expected(TypeTag::Str.into(), other)),
                    None => return Err(Error::Underflow)
                };
                let function = match args.get(1) {
                    Some(v @ Value::Function(_)) => *v,
                    Some(other) => return Err(expected(TypeTag::Function.into(), other)),
                    None => return Err(Error::Underflow)
                };
                self.callbacks.insert(event, function);
                return self.push(Value::Null);
            },
            NativeCall::MemoryGetAvailable => {
                let v = Value::Int32(self.pool.available() as i32);
                return self.push(v);
            },
            NativeCall::MemoryGetUsage => {
                let v = Value::Int32(self.pool.allocated() as i32);
                return self.push(v);
            },
            _ => ()
        }

        match platform.invoke(call, &args, &mut self.pool) {
            NativeResult::Value(v) => self.push(v),
            NativeResult::Sleep(ms) => {
                self.pending_sleep = Some(ms);
                self.push(Value::Null)?;
                Err(Error::Yield)
            },
            NativeResult::Yield => {
                self.push(Value::Null)?;
                Err(Error::Yield)
            },
            NativeResult::Exit => Err(Error::Halt),
        }
    }

    fn call_method(&mut self, argc: u8, name: &str) -> Result<()> {
        let receiver = self.pop()?;
        match receiver {
            Value::Object(obj) => {
                let field = self.pool.field_get(obj, name)
                    .ok_or_else(|| Error::NoSuchMethod(name.to_string()))?;
                let r = match field {
                    Value::Function(r) => r,
                    other => return Err(expected(TypeTag::Function.into(), &other))
                };
                let (index, param_count) = self.pool.function_of(r);
                if argc != param_count {
                    return Err(Error::Arity(argc, param_count));
                }
                let def = self.module.function(index)
                    .ok_or(Error::NoSuchFunction(index))?;
                let fn_name = def.name.clone();
                let entry_pc = def.entry_pc;
                let return_pc = self.pc as i32;
                self.push_frame(
                    fn_name,
                    entry_pc,
                    argc,
                    return_pc,
                    Some(receiver),
                    false
                )
            },
            Value::Str(r) => {
                let args = self.pop_args(argc)?;
                let v = self.string_method(r, name, &args)?;
                self.push(v)
            },
            Value::Array(r) => {
                let args = self.pop_args(argc)?;
                let v = self.array_method(r, name, &args)?;
                self.push(v)
            },
            other => Err(expected(
                TypeTag::Object | TypeTag::Array | TypeTag::Str,
                &other
            ))
        }
    }

    fn pop_args(&mut self, argc: u8) -> Result<Vec<Value>> {
        let mut args = Vec::with_capacity(argc as usize);
        for _ in 0..argc {
            args.push(self.pop()?);
        }
        args.reverse();
        Ok(args)
    }

    // Built-in string methods index by character, not by byte.
    fn string_method(
        &mut self,
        r: crate::value::StrRef,
        name: &str,
        args: &[Value]
    ) -> Result<Value> {
        let content = self.pool.str_content(r).to_string();
        match name {
            "length" => Ok(Value::Int32(content.chars().count() as i32)),
            "charAt" => {
                let i = match args.get(0) {
                    Some(Value::Int32(i)) => *i,
                    _ => return Err(expected(
                        TypeTag::Int32.into(),
                        args.get(0).unwrap_or(&Value::Null)
                    ))
                };
                let picked: String = if i < 0 {
                    String::new()
                } else {
                    content.chars().nth(i as usize)
                        .map(|c| c.to_string())
                        .unwrap_or_default()
                };
                self.alloc_string(&picked)
            },
            "indexOf" => {
                let needle = match args.get(0) {
                    Some(Value::Str(n)) => self.pool.str_content(*n).to_string(),
                    _ => return Err(expected(
                        TypeTag::Str.into(),
                        args.get(0).unwrap_or(&Value::Null)
                    ))
                };
                let found = match content.find(&needle) {
                    Some(offset) => content[..offset].chars().count() as i32,
                    None => -1
                };
                Ok(Value::Int32(found))
            },
            "substring" => {
                let a = match args.get(0) {
                    Some(Value::Int32(i)) => (*i).max(0) as usize,
                    _ => return Err(expected(
                        TypeTag::Int32.into(),
                        args.get(0).unwrap_or(&Value::Null)
                    ))
                };
                let b = match args.get(1) {
                    Some(Value::Int32(i)) => (*i).max(0) as usize,
                    _ => return Err(expected(
                        TypeTag::Int32.into(),
                        args.get(1).unwrap_or(&Value::Null)
                    ))
                };
                let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
                let picked: String = content.chars()
                    .skip(lo)
                    .take(hi - lo)
                    .collect();
                self.alloc_string(&picked)
            },
            "toUpperCase" => self.alloc_string(&content.to_uppercase()),
            "toLowerCase" => self.alloc_string(&content.to_lowercase()),
            _ => Err(Error::NoSuchMethod(name.to_string()))
        }
    }

    fn array_method(
        &mut self,
        r: crate::value::ArrayRef,
        name: &str,
        args: &[Value]
    ) -> Result<Value> {
        match name {
            "length" => Ok(Value::Int32(self.pool.array_len(r) as i32)),
            "push" => {
                let value = args.get(0).copied().unwrap_or(Value::Null);
                if let Some(len) = self.pool.array_push(r, value) {
                    return Ok(Value::Int32(len as i32));
                }
                self.temp_roots.push(value);
                self.temp_roots.push(Value::Array(r));
                self.collect_garbage();
                let outcome = self.pool.array_push(r, value);
                self.temp_roots.clear();
                match outcome {
                    Some(len) => Ok(Value::Int32(len as i32)),
                    None => Err(Error::OutOfMemory)
                }
            },
            "pop" => Ok(self.pool.array_pop(r)),
            "indexOf" => {
                let needle = args.get(0).copied().unwrap_or(Value::Null);
                let found = self.pool.array_elems(r)
                    .iter()
                    .position(|v| v.equals(&needle, &self.pool))
                    .map(|i| i as i32)
                    .unwrap_or(-1);
                Ok(Value::Int32(found))
            },
            "join" => {
                let separator = match args.get(0) {
                    Some(Value::Str(s)) => self.pool.str_content(*s).to_string(),
                    Some(other) => return Err(expected(TypeTag::Str.into(), other)),
                    None => ",".to_string()
                };
                let joined = self.pool.array_elems(r)
                    .iter()
                    .map(|v| v.stringify(&self.pool))
                    .collect::<Vec<String>>()
                    .join(&separator);
                self.alloc_string(&joined)
            },
            _ => Err(Error::NoSuchMethod(name.to_string()))
        }
    }
}
