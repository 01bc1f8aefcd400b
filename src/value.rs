//! Runtime values.
//!
//! [`Value`] is the tagged union every expression produces exactly one
//! of. `Nil` doubles as the unit value and as the "unbound" sentinel in
//! frame variable slots. Strings share their backing storage through
//! `Rc<str>`, so loading a string constant clones a pointer, never the
//! bytes.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::Error;
use crate::compiler::{FunctionDef, Script};
use crate::vm::{Coroutine, Vm};

/// Signature of a native function. Natives receive the running VM (so
/// control-flow helpers like `if` and `call` can reenter the
/// interpreter), the executing script, and the already-popped argument
/// values. The returned value is pushed by the VM, so every native
/// produces exactly one result.
pub type NativeFn = fn(&mut Vm, &Script, &[Value]) -> Result<Value, Error>;

/// A native function binding, registered under its name in the VM's
/// global environment.
#[derive(Clone, Copy)]
pub struct NativeDef {
    pub name: &'static str,
    pub func: NativeFn,
}

/// Core runtime value
#[derive(Clone, Default)]
pub enum Value {
    /// The unit value; also marks an unbound variable slot
    #[default]
    Nil,
    Bool(bool),
    /// Numbers are single-precision floats
    Number(f32),
    /// Shared, immutable string storage
    String(Rc<str>),
    /// A compiled script function
    Func(Rc<FunctionDef>),
    /// A registered native function
    Native(Rc<NativeDef>),
    /// A suspendable activation of a script function
    Coroutine(Rc<RefCell<Coroutine>>),
    /// An opaque host-supplied payload, carried but never interpreted
    Custom(Rc<dyn Any>),
}

impl Value {
    /// A value is false iff it is nil, `false`, or the number zero.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Nil | Value::Bool(false) => false,
            Value::Number(n) => *n != 0.0,
            _ => true,
        }
    }

    /// Short type tag used in error messages
    pub(crate) fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Func(_) => "function",
            Value::Native(_) => "native",
            Value::Coroutine(_) => "coroutine",
            Value::Custom(_) => "custom",
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "Nil"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Number(n) => write!(f, "Number({n})"),
            Value::String(s) => write!(f, "String({s:?})"),
            Value::Func(func) => write!(f, "Func({})", func.name),
            Value::Native(native) => write!(f, "Native({})", native.name),
            Value::Coroutine(coro) => write!(f, "Coroutine({})", coro.borrow().func.name),
            Value::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// The `println` format: `nil`, bare booleans, numbers with four
/// decimal places, string content verbatim, and callables tagged with
/// their name.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n:.4}"),
            Value::String(s) => write!(f, "{s}"),
            Value::Func(func) => write!(f, "function ({})", func.name),
            Value::Native(native) => write!(f, "native ({})", native.name),
            Value::Coroutine(coro) => write!(f, "coroutine ({})", coro.borrow().func.name),
            Value::Custom(_) => write!(f, "custom"),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            // Functions and coroutines compare by identity
            (Value::Func(a), Value::Func(b)) => Rc::ptr_eq(a, b),
            (Value::Native(a), Value::Native(b)) => a.name == b.name,
            (Value::Coroutine(a), Value::Coroutine(b)) => Rc::ptr_eq(a, b),
            (Value::Custom(a), Value::Custom(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for NativeDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeDef({})", self.name)
    }
}
