//! The stack virtual machine.
//!
//! The VM owns the operand stack, the globals map, and the live chain
//! of call frames; the current frame is the top of the chain, and each
//! frame carries a parent link fixed at creation. Symbol resolution
//! walks the parent chain innermost-outward and falls through to
//! globals; a parked coroutine frame keeps its original chain even
//! when resumed from a different call site.
//!
//! Nested activations (the `if`/`when`/`call` natives reentering the
//! interpreter) run in stop-on-return mode, expressed as a depth bound:
//! [`Vm::run`] executes while the frame chain is at least `stop_depth`
//! deep, so one `Return` - or a `yield` detaching the current frame -
//! unwinds exactly one activation.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{self, Write};
use std::rc::{Rc, Weak};

use crate::builtins;
use crate::compiler::{FunctionDef, Opcode, Script};
use crate::value::{NativeDef, Value};
use crate::{Error, MAX_CALL_DEPTH, RuntimeErrorKind, STACK_CAPACITY, VAR_SLOTS};

/// Which bytecode buffer a frame executes.
#[derive(Debug)]
enum FrameCode {
    TopLevel,
    Func(Rc<FunctionDef>),
}

/// An activation record: one variable slot per possible string-pool
/// index, a code pointer, a parent link fixed at creation, and (for
/// coroutine bodies) a backref to the owning coroutine. The backref is
/// weak so a suspended coroutine holding its own frame does not form a
/// strong cycle.
#[derive(Debug)]
pub(crate) struct Frame {
    vars: Vec<Value>,
    code: FrameCode,
    ip: usize,
    /// Number of live frames beneath this one when it was created.
    /// Symbol resolution continues the walk at this depth, so a parked
    /// coroutine frame resumed from a deeper call site keeps its
    /// original parent chain instead of the resumer's.
    parent_depth: usize,
    coroutine: Option<Weak<RefCell<Coroutine>>>,
}

impl Frame {
    fn new(
        code: FrameCode,
        coroutine: Option<Weak<RefCell<Coroutine>>>,
        parent_depth: usize,
    ) -> Frame {
        Frame {
            vars: vec![Value::Nil; VAR_SLOTS],
            code,
            ip: 0,
            parent_depth,
            coroutine,
        }
    }

    fn bytecode<'a>(&'a self, script: &'a Script) -> &'a [u8] {
        match &self.code {
            FrameCode::TopLevel => &script.code,
            FrameCode::Func(func) => &func.code,
        }
    }
}

/// A suspendable activation of a script function.
///
/// The coroutine and the VM alternate exclusive ownership of one frame:
/// it lives on the VM's chain while running and parks here between a
/// `yield` and the next `call`. Once the body returns, the frame is
/// dropped and the coroutine is done for good.
#[derive(Debug)]
pub struct Coroutine {
    pub(crate) func: Rc<FunctionDef>,
    pub(crate) frame: Option<Frame>,
    pub(crate) done: bool,
}

impl Coroutine {
    pub fn new(func: Rc<FunctionDef>) -> Self {
        Coroutine {
            func,
            frame: None,
            done: false,
        }
    }

    /// Has the body run to its `Return`?
    pub fn is_done(&self) -> bool {
        self.done
    }
}

/// The virtual machine: operand stack, frame chain, globals, and the
/// output sink `println` writes to.
pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<Frame>,
    globals: HashMap<String, Value>,
    pub(crate) out: Box<dyn Write>,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    /// A VM printing to stdout, with the builtin natives registered.
    pub fn new() -> Self {
        Self::with_output(Box::new(io::stdout()))
    }

    /// A VM printing to the given sink; used by embedders and tests.
    pub fn with_output(out: Box<dyn Write>) -> Self {
        let mut vm = Vm {
            stack: Vec::new(),
            frames: Vec::new(),
            globals: HashMap::new(),
            out,
        };
        for def in builtins::BUILTINS {
            vm.register_native(*def);
        }
        vm
    }

    /// Register a native function under its name in globals.
    pub fn register_native(&mut self, def: NativeDef) {
        self.globals
            .insert(def.name.to_owned(), Value::Native(Rc::new(def)));
    }

    /// Bind a global directly, bypassing script execution.
    pub fn set_global(&mut self, name: impl Into<String>, value: Value) {
        self.globals.insert(name.into(), value);
    }

    /// Look up a global binding.
    pub fn global(&self, name: &str) -> Option<&Value> {
        self.globals.get(name)
    }

    /// Run a script's top-level code to `Halt`. Globals persist across
    /// calls; the operand stack and frame chain are reset afterwards,
    /// so a failed run leaves the VM reusable.
    pub fn execute(&mut self, script: &Script) -> Result<(), Error> {
        self.frames.push(Frame::new(FrameCode::TopLevel, None, 0));
        let result = self.run(script, 1);
        // Suspended coroutines can leave residue on the shared stack
        self.stack.clear();
        self.frames.clear();
        result
    }

    /// The interpreter loop. Executes while the frame chain is at least
    /// `stop_depth` deep; `Halt` exits unconditionally.
    fn run(&mut self, script: &Script, stop_depth: usize) -> Result<(), Error> {
        while self.frames.len() >= stop_depth {
            let (op_byte, arg) = {
                let Some(frame) = self.frames.last_mut() else {
                    break;
                };
                let bytes = frame.bytecode(script);
                if frame.ip + 2 > bytes.len() {
                    return Err(Error::runtime(
                        RuntimeErrorKind::CodeOutOfRange,
                        "code pointer ran off the end of its buffer",
                    ));
                }
                let pair = (bytes[frame.ip], bytes[frame.ip + 1]);
                frame.ip += 2;
                pair
            };
            let op = Opcode::try_from(op_byte).map_err(|_| {
                Error::runtime(
                    RuntimeErrorKind::CodeOutOfRange,
                    format!("invalid opcode byte {op_byte}"),
                )
            })?;

            match op {
                Opcode::LoadBool => self.push(Value::Bool(arg == 1))?,
                Opcode::LoadNumber => {
                    let n = *script.numbers.get(arg as usize).ok_or_else(|| {
                        Error::runtime(RuntimeErrorKind::CodeOutOfRange, "number slot out of range")
                    })?;
                    self.push(Value::Number(n))?;
                }
                Opcode::LoadString => {
                    let s = script.strings.get(arg as usize).cloned().ok_or_else(|| {
                        Error::runtime(RuntimeErrorKind::CodeOutOfRange, "string slot out of range")
                    })?;
                    self.push(Value::String(s))?;
                }
                Opcode::LoadFunc => {
                    let func = script.funcs.get(arg as usize).cloned().ok_or_else(|| {
                        Error::runtime(RuntimeErrorKind::CodeOutOfRange, "function slot out of range")
                    })?;
                    self.push(Value::Func(func))?;
                }
                Opcode::LoadSymbol => {
                    let value = self.resolve_symbol(script, arg)?;
                    self.push(value)?;
                }
                Opcode::Def => {
                    let value = self.pop()?;
                    self.current_frame_mut()?.vars[arg as usize] = value;
                }
                Opcode::Defonce => {
                    let value = self.pop()?;
                    let slot = &mut self.current_frame_mut()?.vars[arg as usize];
                    if matches!(slot, Value::Nil) {
                        *slot = value;
                    }
                }
                Opcode::Set => {
                    let value = self.pop()?;
                    self.assign_symbol(script, arg, value)?;
                }
                Opcode::Defun => {
                    let func = script.funcs.get(arg as usize).cloned().ok_or_else(|| {
                        Error::runtime(RuntimeErrorKind::CodeOutOfRange, "function slot out of range")
                    })?;
                    let slot = func.name_slot as usize;
                    self.current_frame_mut()?.vars[slot] = Value::Func(func);
                }
                Opcode::FuncCall => self.func_call(script, arg as usize)?,
                Opcode::Return => {
                    let frame = self.frames.pop().ok_or_else(|| {
                        Error::runtime(RuntimeErrorKind::StackUnderflow, "return: no active frame")
                    })?;
                    if let Some(coro) = frame.coroutine.as_ref().and_then(Weak::upgrade) {
                        let mut coro = coro.borrow_mut();
                        coro.done = true;
                        coro.frame = None;
                    }
                }
                Opcode::Pop => {
                    // Elide the pop that would discard a function's
                    // natural result
                    let next_is_return = {
                        let frame = self.current_frame()?;
                        let bytes = frame.bytecode(script);
                        bytes.get(frame.ip).copied() == Some(u8::from(Opcode::Return))
                    };
                    if !next_is_return {
                        self.pop()?;
                    }
                }
                Opcode::Halt => {
                    let _ = self.frames.pop();
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// `FuncCall`: pop the arguments and the callee beneath them, then
    /// dispatch. Script functions push a fresh frame and continue in
    /// this loop; natives are invoked directly and their result pushed.
    fn func_call(&mut self, script: &Script, argc: usize) -> Result<(), Error> {
        let args = self.pop_args(argc)?;
        let callee = self.pop()?;
        match callee {
            Value::Native(native) => {
                let result = (native.func)(self, script, &args)?;
                self.push(result)
            }
            Value::Func(func) => self.push_call_frame(func, &args, None),
            other => Err(Error::TypeError(format!(
                "cannot call a {} value",
                other.type_name()
            ))),
        }
    }

    /// Invoke a callable and run it to completion, returning its
    /// result. This is the reentry point for natives implementing
    /// control flow.
    pub(crate) fn call_value(
        &mut self,
        script: &Script,
        callee: &Value,
        args: &[Value],
    ) -> Result<Value, Error> {
        match callee {
            Value::Native(native) => (native.func)(self, script, args),
            Value::Func(func) => {
                self.push_call_frame(func.clone(), args, None)?;
                let depth = self.frames.len();
                self.run(script, depth)?;
                self.pop()
            }
            other => Err(Error::TypeError(format!(
                "cannot call a {} value",
                other.type_name()
            ))),
        }
    }

    /// Start or resume a coroutine and run it until it yields or
    /// returns. On a first call the arguments bind to the body's
    /// parameters like a normal call; on a resume the first argument
    /// (or nil) becomes the suspended `yield` expression's value. A
    /// done coroutine resumes to nil without reentering.
    ///
    /// A parked frame keeps the parent link recorded at the first
    /// call, so resuming from inside some other function does not
    /// re-home the body under the resumer's frame.
    pub(crate) fn resume_coroutine(
        &mut self,
        script: &Script,
        coro: &Rc<RefCell<Coroutine>>,
        args: &[Value],
    ) -> Result<Value, Error> {
        if coro.borrow().done {
            return Ok(Value::Nil);
        }
        let parked = coro.borrow_mut().frame.take();
        match parked {
            Some(frame) => {
                if self.frames.len() >= MAX_CALL_DEPTH {
                    return Err(Error::runtime(
                        RuntimeErrorKind::CallDepthExceeded,
                        format!("call depth exceeded {MAX_CALL_DEPTH}"),
                    ));
                }
                self.frames.push(frame);
                self.push(args.first().cloned().unwrap_or(Value::Nil))?;
            }
            None => {
                let func = coro.borrow().func.clone();
                self.push_call_frame(func, args, Some(Rc::downgrade(coro)))?;
            }
        }
        let depth = self.frames.len();
        self.run(script, depth)?;
        self.pop()
    }

    /// Detach the current frame into its owning coroutine. The yielded
    /// value becomes the enclosing `call`'s result; the nested
    /// activation unwinds at the next loop check.
    pub(crate) fn yield_current(&mut self, value: Value) -> Result<Value, Error> {
        let owner = self
            .frames
            .last()
            .and_then(|frame| frame.coroutine.as_ref())
            .and_then(Weak::upgrade);
        let Some(coro) = owner else {
            return Err(Error::runtime(
                RuntimeErrorKind::YieldOutsideCoroutine,
                "yield: no enclosing coroutine",
            ));
        };
        let frame = self.frames.pop().ok_or_else(|| {
            Error::runtime(RuntimeErrorKind::StackUnderflow, "yield: no active frame")
        })?;
        coro.borrow_mut().frame = Some(frame);
        Ok(value)
    }

    /// Find the innermost frame on the current parent chain whose slot
    /// `i` is bound, following each frame's fixed `parent_depth` link.
    /// A resumed coroutine frame therefore skips whatever the resumer
    /// has on the stack beneath it. Each step is clamped below the
    /// current index, so the walk always terminates even if a parked
    /// chain outlived its ancestors.
    fn find_binding(&self, i: usize) -> Option<usize> {
        let mut next = self.frames.len();
        while next > 0 {
            let at = next - 1;
            let frame = &self.frames[at];
            if !matches!(frame.vars[i], Value::Nil) {
                return Some(at);
            }
            next = frame.parent_depth.min(at);
        }
        None
    }

    /// Walk the parent chain innermost-outward; the first non-nil slot
    /// wins. Unbound symbols fall through to globals and finally to nil.
    fn resolve_symbol(&self, script: &Script, slot: u8) -> Result<Value, Error> {
        let i = slot as usize;
        if let Some(at) = self.find_binding(i) {
            return Ok(self.frames[at].vars[i].clone());
        }
        let name = script.strings.get(i).ok_or_else(|| {
            Error::runtime(RuntimeErrorKind::CodeOutOfRange, "symbol slot out of range")
        })?;
        Ok(self.globals.get(name.as_ref()).cloned().unwrap_or(Value::Nil))
    }

    /// `Set`: write through the nearest enclosing binding, else global.
    fn assign_symbol(&mut self, script: &Script, slot: u8, value: Value) -> Result<(), Error> {
        let i = slot as usize;
        match self.find_binding(i) {
            Some(at) => self.frames[at].vars[i] = value,
            None => {
                let name = script.strings.get(i).ok_or_else(|| {
                    Error::runtime(RuntimeErrorKind::CodeOutOfRange, "symbol slot out of range")
                })?;
                self.globals.insert(name.to_string(), value);
            }
        }
        Ok(())
    }

    /// Push the arguments (padding missing ones with nil, dropping
    /// extras) and a fresh frame for `func`.
    fn push_call_frame(
        &mut self,
        func: Rc<FunctionDef>,
        args: &[Value],
        coroutine: Option<Weak<RefCell<Coroutine>>>,
    ) -> Result<(), Error> {
        if self.frames.len() >= MAX_CALL_DEPTH {
            return Err(Error::runtime(
                RuntimeErrorKind::CallDepthExceeded,
                format!("call depth exceeded {MAX_CALL_DEPTH}"),
            ));
        }
        for i in 0..func.params.len() {
            self.push(args.get(i).cloned().unwrap_or(Value::Nil))?;
        }
        let parent_depth = self.frames.len();
        self.frames
            .push(Frame::new(FrameCode::Func(func), coroutine, parent_depth));
        Ok(())
    }

    fn current_frame(&self) -> Result<&Frame, Error> {
        self.frames.last().ok_or_else(|| {
            Error::runtime(RuntimeErrorKind::StackUnderflow, "no active frame")
        })
    }

    fn current_frame_mut(&mut self) -> Result<&mut Frame, Error> {
        self.frames.last_mut().ok_or_else(|| {
            Error::runtime(RuntimeErrorKind::StackUnderflow, "no active frame")
        })
    }

    fn push(&mut self, value: Value) -> Result<(), Error> {
        if self.stack.len() >= STACK_CAPACITY {
            return Err(Error::runtime(
                RuntimeErrorKind::StackOverflow,
                format!("operand stack exceeded {STACK_CAPACITY} values"),
            ));
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, Error> {
        self.stack.pop().ok_or_else(|| {
            Error::runtime(RuntimeErrorKind::StackUnderflow, "operand stack underflow")
        })
    }

    /// Pop `count` values, preserving their push order.
    fn pop_args(&mut self, count: usize) -> Result<Vec<Value>, Error> {
        if self.stack.len() < count {
            return Err(Error::runtime(
                RuntimeErrorKind::StackUnderflow,
                "operand stack underflow",
            ));
        }
        Ok(self.stack.split_off(self.stack.len() - count))
    }
}
