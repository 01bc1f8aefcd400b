//! Built-in native functions.
//!
//! Natives receive the running VM, the executing script, and their
//! already-popped arguments, and return exactly one value for the VM to
//! push. Control flow lives here too: `if`, `when`, and `call` are
//! ordinary natives that reenter the interpreter on function values,
//! which is why conditional branches are written as anonymous
//! functions.
//!
//! Arity and operand-type misuse surface as [`Error::TypeError`] with
//! the builtin's name as the message tag.

use std::cell::RefCell;
use std::fs;
use std::io::Write as _;
use std::rc::Rc;

use crate::compiler::Script;
use crate::value::{NativeDef, Value};
use crate::vm::{Coroutine, Vm};
use crate::{Error, RuntimeErrorKind};

/// Every native the runtime registers at startup.
pub const BUILTINS: &[NativeDef] = &[
    NativeDef { name: "+", func: builtin_add },
    NativeDef { name: "-", func: builtin_sub },
    NativeDef { name: "*", func: builtin_mul },
    NativeDef { name: "/", func: builtin_div },
    NativeDef { name: "println", func: builtin_println },
    NativeDef { name: "read", func: builtin_read },
    NativeDef { name: "if", func: builtin_if },
    NativeDef { name: "when", func: builtin_when },
    NativeDef { name: "coroutine", func: builtin_coroutine },
    NativeDef { name: "call", func: builtin_call },
    NativeDef { name: "yield", func: builtin_yield },
    NativeDef { name: "done?", func: builtin_done },
];

// Binary arithmetic over numbers; any other operand types are rejected
macro_rules! arithmetic {
    ($name:ident, $op:tt, $tag:expr) => {
        fn $name(_vm: &mut Vm, _script: &Script, args: &[Value]) -> Result<Value, Error> {
            match args {
                [Value::Number(a), Value::Number(b)] => Ok(Value::Number(a $op b)),
                [a, b] => Err(Error::type_error(
                    $tag,
                    format!("cannot apply to {} and {}", a.type_name(), b.type_name()),
                )),
                _ => Err(Error::type_error(
                    $tag,
                    format!("expected 2 arguments, got {}", args.len()),
                )),
            }
        }
    };
}

arithmetic!(builtin_add, +, "+");
arithmetic!(builtin_sub, -, "-");
arithmetic!(builtin_mul, *, "*");
arithmetic!(builtin_div, /, "/");

/// Print every argument in its display form, space-separated and
/// newline-terminated.
fn builtin_println(vm: &mut Vm, _script: &Script, args: &[Value]) -> Result<Value, Error> {
    let io_error = |e: std::io::Error| {
        Error::runtime(RuntimeErrorKind::Io, format!("println: {e}"))
    };
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            write!(vm.out, " ").map_err(io_error)?;
        }
        write!(vm.out, "{arg}").map_err(io_error)?;
    }
    writeln!(vm.out).map_err(io_error)?;
    Ok(Value::Nil)
}

/// Read the named file into a fresh string value.
fn builtin_read(_vm: &mut Vm, _script: &Script, args: &[Value]) -> Result<Value, Error> {
    let [Value::String(path)] = args else {
        return Err(Error::type_error("read", "expected a filename string"));
    };
    let contents = fs::read_to_string(path.as_ref())
        .map_err(|e| Error::runtime(RuntimeErrorKind::Io, format!("read: {path}: {e}")))?;
    Ok(Value::String(Rc::from(contents)))
}

/// Eagerly evaluated condition and branches; the chosen branch is
/// invoked as a zero-argument callable.
fn builtin_if(vm: &mut Vm, script: &Script, args: &[Value]) -> Result<Value, Error> {
    let [cond, then_branch, else_branch] = args else {
        return Err(Error::type_error(
            "if",
            format!("expected 3 arguments, got {}", args.len()),
        ));
    };
    let branch = if cond.is_truthy() { then_branch } else { else_branch };
    vm.call_value(script, branch, &[])
}

fn builtin_when(vm: &mut Vm, script: &Script, args: &[Value]) -> Result<Value, Error> {
    let [cond, branch] = args else {
        return Err(Error::type_error(
            "when",
            format!("expected 2 arguments, got {}", args.len()),
        ));
    };
    if cond.is_truthy() {
        vm.call_value(script, branch, &[])
    } else {
        Ok(Value::Nil)
    }
}

/// Wrap a function value into a fresh, not-yet-started coroutine.
fn builtin_coroutine(_vm: &mut Vm, _script: &Script, args: &[Value]) -> Result<Value, Error> {
    let [Value::Func(func)] = args else {
        return Err(Error::type_error("coroutine", "expected a function"));
    };
    Ok(Value::Coroutine(Rc::new(RefCell::new(Coroutine::new(
        func.clone(),
    )))))
}

/// Start or resume a coroutine; the second argument (if any) becomes
/// the value of the suspended `yield`.
fn builtin_call(vm: &mut Vm, script: &Script, args: &[Value]) -> Result<Value, Error> {
    let Some((target, rest)) = args.split_first() else {
        return Err(Error::type_error("call", "expected a coroutine"));
    };
    let Value::Coroutine(coro) = target else {
        return Err(Error::type_error(
            "call",
            format!("cannot resume a {} value", target.type_name()),
        ));
    };
    vm.resume_coroutine(script, coro, rest)
}

/// Suspend the enclosing coroutine; the argument (or nil) becomes the
/// value of the corresponding `call`.
fn builtin_yield(vm: &mut Vm, _script: &Script, args: &[Value]) -> Result<Value, Error> {
    if args.len() > 1 {
        return Err(Error::type_error(
            "yield",
            format!("expected at most 1 argument, got {}", args.len()),
        ));
    }
    vm.yield_current(args.first().cloned().unwrap_or(Value::Nil))
}

/// Has the coroutine's body run to its return?
fn builtin_done(_vm: &mut Vm, _script: &Script, args: &[Value]) -> Result<Value, Error> {
    let [Value::Coroutine(coro)] = args else {
        return Err(Error::type_error("done?", "expected a coroutine"));
    };
    Ok(Value::Bool(coro.borrow().is_done()))
}
