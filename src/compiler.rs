//! Single-pass compilation of token streams into bytecode.
//!
//! There is no AST: the compiler walks the lexer's one-token lookahead
//! by recursive descent and emits instructions directly into a growing
//! byte buffer, interning literals into per-script constant pools as it
//! goes. Every instruction is a fixed two-byte pair (opcode, argument),
//! so pool and function-table indices must fit in a single byte.

use std::fmt::Write as _;
use std::rc::Rc;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use smallvec::SmallVec;

use crate::lexer::{Lexer, Token};
use crate::{CompileErrorKind, Error, MAX_PARAMS, MAX_POOL_ENTRIES};

/// Bytecode operations. The argument byte's meaning is per-opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    /// Push `Bool(arg == 1)`
    LoadBool,
    /// Push the number-pool entry at `arg`
    LoadNumber,
    /// Push the string-pool entry at `arg`
    LoadString,
    /// Resolve the symbol whose name sits at string slot `arg` and push it
    LoadSymbol,
    /// Push the function-table entry at `arg`
    LoadFunc,
    /// Pop one value into the current frame's slot `arg`
    Def,
    /// Pop one value into slot `arg` only if the slot is still nil
    Defonce,
    /// Pop one value into the nearest enclosing binding of slot `arg`,
    /// falling through to the globals map
    Set,
    /// Bind the function-table entry at `arg` under its own name in the
    /// current frame; pops nothing
    Defun,
    /// Call with `arg` arguments; the callee sits beneath them
    FuncCall,
    /// Pop the current frame
    Return,
    /// Discard the top of stack (elided immediately before `Return`)
    Pop,
    /// End of top-level code
    Halt,
}

/// A compiled function, owned by its enclosing [`Script`].
#[derive(Debug)]
pub struct FunctionDef {
    /// The function's name; `#` for anonymous functions
    pub name: Rc<str>,
    /// String-pool slot of the name; `Defun` binds the function there
    pub name_slot: u8,
    /// Parameter name slots in declaration order
    pub params: SmallVec<[u8; MAX_PARAMS]>,
    /// The body bytecode, always terminated by `Return`
    pub code: Vec<u8>,
}

/// The compilation unit: constant pools, the function table, and the
/// top-level bytecode.
#[derive(Debug, Default)]
pub struct Script {
    /// Source filename, used only for diagnostics
    pub filename: String,
    /// Interned strings; equal byte content shares an index
    pub strings: Vec<Rc<str>>,
    /// Interned numbers; equal float bits share an index
    pub numbers: Vec<f32>,
    /// Every function compiled from this script, named and anonymous
    pub funcs: Vec<Rc<FunctionDef>>,
    /// Top-level bytecode, always terminated by `Halt`
    pub code: Vec<u8>,
}

impl Script {
    /// Render a deterministic, human-readable dump of the pools and of
    /// every bytecode buffer in this script.
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "== script: {} ==", self.filename);

        let _ = writeln!(out, "-- strings ({}) --", self.strings.len());
        for (i, s) in self.strings.iter().enumerate() {
            let _ = writeln!(out, "  {i:3}: {s}");
        }
        let _ = writeln!(out, "-- numbers ({}) --", self.numbers.len());
        for (i, n) in self.numbers.iter().enumerate() {
            let _ = writeln!(out, "  {i:3}: {n:.4}");
        }

        for (i, func) in self.funcs.iter().enumerate() {
            let _ = writeln!(
                out,
                "-- func {i}: {} ({} params) --",
                func.name,
                func.params.len()
            );
            self.disassemble_code(&mut out, &func.code);
        }

        let _ = writeln!(out, "-- top-level --");
        self.disassemble_code(&mut out, &self.code);
        out
    }

    fn disassemble_code(&self, out: &mut String, code: &[u8]) {
        let mut ip = 0;
        while ip + 2 <= code.len() {
            let arg = code[ip + 1];
            match Opcode::try_from(code[ip]) {
                Ok(op) => {
                    let note = self.annotate(op, arg);
                    let mnemonic = format!("{op:?}");
                    if note.is_empty() {
                        let _ = writeln!(out, "  {ip:04} {mnemonic:<10} {arg:3}");
                    } else {
                        let _ = writeln!(out, "  {ip:04} {mnemonic:<10} {arg:3}  ; {note}");
                    }
                }
                Err(_) => {
                    let _ = writeln!(out, "  {ip:04} ??         {arg:3}");
                }
            }
            ip += 2;
        }
    }

    /// Resolve an instruction argument against the pools for display.
    fn annotate(&self, op: Opcode, arg: u8) -> String {
        let i = arg as usize;
        match op {
            Opcode::LoadBool => if arg == 1 { "true" } else { "false" }.to_owned(),
            Opcode::LoadNumber => self
                .numbers
                .get(i)
                .map(|n| format!("{n:.4}"))
                .unwrap_or_default(),
            Opcode::LoadString | Opcode::LoadSymbol | Opcode::Def | Opcode::Defonce
            | Opcode::Set => self.strings.get(i).map(|s| s.to_string()).unwrap_or_default(),
            Opcode::LoadFunc | Opcode::Defun => self
                .funcs
                .get(i)
                .map(|f| f.name.to_string())
                .unwrap_or_default(),
            Opcode::FuncCall => format!("{arg} args"),
            Opcode::Return | Opcode::Pop | Opcode::Halt => String::new(),
        }
    }
}

/// Append one two-byte instruction.
fn emit(code: &mut Vec<u8>, op: Opcode, arg: u8) {
    code.push(op.into());
    code.push(arg);
}

/// Compile `source` into a [`Script`]. Aborts with the first lex or
/// compile error encountered.
pub fn compile(source: &str, filename: impl Into<String>) -> Result<Script, Error> {
    let mut compiler = Compiler {
        lexer: Lexer::new(source)?,
        script: Script {
            filename: filename.into(),
            ..Script::default()
        },
    };

    let mut code = Vec::new();
    while *compiler.lexer.current() != Token::Eof {
        compiler.expression(&mut code, true)?;
    }
    emit(&mut code, Opcode::Halt, 0);

    compiler.script.code = code;
    Ok(compiler.script)
}

struct Compiler<'a> {
    lexer: Lexer<'a>,
    script: Script,
}

impl Compiler<'_> {
    /// Intern `text` into the string pool and return its slot.
    fn intern_string(&mut self, text: &str) -> Result<u8, Error> {
        if let Some(i) = self.script.strings.iter().position(|s| s.as_ref() == text) {
            return Ok(i as u8);
        }
        if self.script.strings.len() >= MAX_POOL_ENTRIES {
            return Err(Error::compile(
                CompileErrorKind::PoolOverflow,
                format!("string pool exceeds {MAX_POOL_ENTRIES} entries"),
            ));
        }
        self.script.strings.push(Rc::from(text));
        Ok((self.script.strings.len() - 1) as u8)
    }

    /// Intern `n` into the number pool; equality is exact bitwise.
    fn intern_number(&mut self, n: f32) -> Result<u8, Error> {
        if let Some(i) = self
            .script
            .numbers
            .iter()
            .position(|m| m.to_bits() == n.to_bits())
        {
            return Ok(i as u8);
        }
        if self.script.numbers.len() >= MAX_POOL_ENTRIES {
            return Err(Error::compile(
                CompileErrorKind::PoolOverflow,
                format!("number pool exceeds {MAX_POOL_ENTRIES} entries"),
            ));
        }
        self.script.numbers.push(n);
        Ok((self.script.numbers.len() - 1) as u8)
    }

    /// Register a finished function and return its table index.
    fn add_func(&mut self, func: FunctionDef) -> Result<u8, Error> {
        if self.script.funcs.len() >= MAX_POOL_ENTRIES {
            return Err(Error::compile(
                CompileErrorKind::PoolOverflow,
                format!("function table exceeds {MAX_POOL_ENTRIES} entries"),
            ));
        }
        self.script.funcs.push(Rc::new(func));
        Ok((self.script.funcs.len() - 1) as u8)
    }

    /// Compile one expression into `code`. In statement position
    /// (`pop_unused`) a `Pop` is appended after value-producing
    /// expressions; reserved forms leave nothing on the stack and get
    /// none.
    fn expression(&mut self, code: &mut Vec<u8>, pop_unused: bool) -> Result<(), Error> {
        let token = self.lexer.current().clone();
        let produced = match token {
            Token::LeftParen => {
                self.lexer.advance()?;
                self.form(code)?
            }
            Token::Hash => {
                self.lexer.advance()?;
                self.anonymous(code)?;
                true
            }
            Token::String(text) => {
                let slot = self.intern_string(&text)?;
                emit(code, Opcode::LoadString, slot);
                self.lexer.advance()?;
                true
            }
            Token::Number(n) => {
                let slot = self.intern_number(n)?;
                emit(code, Opcode::LoadNumber, slot);
                self.lexer.advance()?;
                true
            }
            Token::Symbol(name) => {
                match name.as_str() {
                    "true" => emit(code, Opcode::LoadBool, 1),
                    "false" => emit(code, Opcode::LoadBool, 0),
                    _ => {
                        let slot = self.intern_string(&name)?;
                        emit(code, Opcode::LoadSymbol, slot);
                    }
                }
                self.lexer.advance()?;
                true
            }
            Token::Eof => {
                return Err(Error::compile(
                    CompileErrorKind::UnexpectedEof,
                    "unexpected end of input",
                ));
            }
            Token::LeftBracket | Token::RightParen | Token::RightBracket => {
                return Err(Error::compile(
                    CompileErrorKind::UnexpectedToken,
                    format!("{token:?} cannot start an expression"),
                ));
            }
        };

        if pop_unused && produced {
            emit(code, Opcode::Pop, 0);
        }
        Ok(())
    }

    /// Compile a parenthesized form after its `(` has been consumed.
    /// Returns whether the form leaves a value on the stack.
    fn form(&mut self, code: &mut Vec<u8>) -> Result<bool, Error> {
        let head = match self.lexer.current() {
            Token::Symbol(name) => Some(name.clone()),
            _ => None,
        };
        if let Some(name) = head.as_deref() {
            match name {
                "def" => {
                    self.binding(code, Opcode::Def, "def")?;
                    return Ok(false);
                }
                "defonce" => {
                    self.binding(code, Opcode::Defonce, "defonce")?;
                    return Ok(false);
                }
                "set" => {
                    self.binding(code, Opcode::Set, "set")?;
                    return Ok(false);
                }
                "defun" => {
                    self.defun(code)?;
                    return Ok(false);
                }
                _ => {}
            }
        }

        // Function call: callee expression, then the arguments
        let mut count: usize = 0;
        while *self.lexer.current() != Token::RightParen {
            if *self.lexer.current() == Token::Eof {
                return Err(Error::compile(
                    CompileErrorKind::UnexpectedEof,
                    "call: missing )",
                ));
            }
            self.expression(code, false)?;
            count += 1;
        }
        self.lexer.advance()?;

        let Some(args) = count.checked_sub(1) else {
            return Err(Error::compile(
                CompileErrorKind::EmptyCall,
                "call: expected a callee expression",
            ));
        };
        if args > u8::MAX as usize {
            return Err(Error::compile(
                CompileErrorKind::TooManyParams,
                "call: more than 255 arguments",
            ));
        }
        emit(code, Opcode::FuncCall, args as u8);
        Ok(true)
    }

    /// Compile `(def NAME EXPR)` and its `defonce`/`set` siblings.
    fn binding(&mut self, code: &mut Vec<u8>, op: Opcode, keyword: &str) -> Result<(), Error> {
        self.lexer.advance()?;
        let slot = self.name_slot(keyword)?;
        self.expression(code, false)?;
        self.expect_right_paren(keyword)?;
        emit(code, op, slot);
        Ok(())
    }

    /// Compile `(defun NAME [PARAMS...] BODY...)`.
    fn defun(&mut self, code: &mut Vec<u8>) -> Result<(), Error> {
        self.lexer.advance()?;
        let name_slot = self.name_slot("defun")?;

        if *self.lexer.current() != Token::LeftBracket {
            return Err(Error::compile(
                CompileErrorKind::ExpectedParamList,
                "defun: expected [ parameter list",
            ));
        }
        self.lexer.advance()?;

        let mut params: SmallVec<[u8; MAX_PARAMS]> = SmallVec::new();
        while let Token::Symbol(param) = self.lexer.current() {
            if params.len() >= MAX_PARAMS {
                return Err(Error::compile(
                    CompileErrorKind::TooManyParams,
                    format!("defun: more than {MAX_PARAMS} parameters"),
                ));
            }
            let param = param.clone();
            params.push(self.intern_string(&param)?);
            self.lexer.advance()?;
        }
        if *self.lexer.current() != Token::RightBracket {
            return Err(Error::compile(
                CompileErrorKind::ExpectedParamList,
                "defun: missing ] after parameters",
            ));
        }
        self.lexer.advance()?;

        // The caller pushes arguments left to right; the prologue pops
        // them in reverse into the parameter slots.
        let mut body = Vec::new();
        for &slot in params.iter().rev() {
            emit(&mut body, Opcode::Def, slot);
        }

        while *self.lexer.current() != Token::RightParen {
            if *self.lexer.current() == Token::Eof {
                return Err(Error::compile(
                    CompileErrorKind::UnexpectedEof,
                    "defun: missing )",
                ));
            }
            self.expression(&mut body, true)?;
        }
        self.lexer.advance()?;
        emit(&mut body, Opcode::Return, 0);

        let func = FunctionDef {
            name: self.script.strings[name_slot as usize].clone(),
            name_slot,
            params,
            code: body,
        };
        let index = self.add_func(func)?;
        emit(code, Opcode::Defun, index);
        Ok(())
    }

    /// Compile `#EXPR` into a fresh anonymous function and load it.
    fn anonymous(&mut self, code: &mut Vec<u8>) -> Result<(), Error> {
        let mut body = Vec::new();
        self.expression(&mut body, false)?;
        emit(&mut body, Opcode::Return, 0);

        let name_slot = self.intern_string("#")?;
        let func = FunctionDef {
            name: self.script.strings[name_slot as usize].clone(),
            name_slot,
            params: SmallVec::new(),
            code: body,
        };
        let index = self.add_func(func)?;
        emit(code, Opcode::LoadFunc, index);
        Ok(())
    }

    /// Consume the name symbol of a reserved form and intern it.
    fn name_slot(&mut self, keyword: &str) -> Result<u8, Error> {
        let Token::Symbol(name) = self.lexer.current() else {
            return Err(Error::compile(
                CompileErrorKind::ExpectedSymbol,
                format!("{keyword}: expected a name symbol"),
            ));
        };
        let name = name.clone();
        let slot = self.intern_string(&name)?;
        self.lexer.advance()?;
        Ok(slot)
    }

    fn expect_right_paren(&mut self, keyword: &str) -> Result<(), Error> {
        match self.lexer.current() {
            Token::RightParen => self.lexer.advance(),
            Token::Eof => Err(Error::compile(
                CompileErrorKind::UnexpectedEof,
                format!("{keyword}: missing )"),
            )),
            _ => Err(Error::compile(
                CompileErrorKind::UnexpectedToken,
                format!("{keyword}: expected )"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Decode a bytecode buffer back into (opcode, argument) pairs.
    fn decode(code: &[u8]) -> Vec<(Opcode, u8)> {
        code.chunks_exact(2)
            .map(|pair| (Opcode::try_from(pair[0]).unwrap(), pair[1]))
            .collect()
    }

    /// Expected outcome of compiling one input
    enum CompileTestResult {
        /// Top-level code decodes to exactly these pairs
        TopLevel(Vec<(Opcode, u8)>),
        Fail(CompileErrorKind),
    }
    use CompileTestResult::*;
    use Opcode::*;

    fn run_compile_tests(cases: Vec<(&str, CompileTestResult)>) {
        for (i, (source, expected)) in cases.iter().enumerate() {
            let test_id = format!("Compile test #{}", i + 1);
            match (compile(source, "<test>"), expected) {
                (Ok(script), TopLevel(pairs)) => {
                    assert_eq!(
                        decode(&script.code),
                        *pairs,
                        "{test_id}: bytecode mismatch for {source:?}"
                    );
                }
                (Err(Error::CompileError(e)), Fail(kind)) => {
                    assert_eq!(e.kind, *kind, "{test_id}: error kind mismatch for {source:?}");
                }
                (Ok(script), Fail(kind)) => {
                    panic!(
                        "{test_id}: expected {kind:?}, got script:\n{}",
                        script.disassemble()
                    );
                }
                (Err(err), TopLevel(_)) => {
                    panic!("{test_id}: expected success, got {err:?}");
                }
                (Err(err), Fail(_)) => {
                    panic!("{test_id}: unexpected error variant {err:?}");
                }
            }
        }
    }

    #[test]
    fn test_compile_comprehensive() {
        let cases = vec![
            // Literals in statement position are loaded then discarded
            ("1", TopLevel(vec![(LoadNumber, 0), (Pop, 0), (Halt, 0)])),
            ("\"hi\"", TopLevel(vec![(LoadString, 0), (Pop, 0), (Halt, 0)])),
            ("'hi", TopLevel(vec![(LoadString, 0), (Pop, 0), (Halt, 0)])),
            (
                "true false",
                TopLevel(vec![
                    (LoadBool, 1),
                    (Pop, 0),
                    (LoadBool, 0),
                    (Pop, 0),
                    (Halt, 0),
                ]),
            ),
            ("x", TopLevel(vec![(LoadSymbol, 0), (Pop, 0), (Halt, 0)])),
            // Reserved forms consume their value and need no Pop
            (
                "(def x 1)",
                TopLevel(vec![(LoadNumber, 0), (Def, 0), (Halt, 0)]),
            ),
            (
                "(defonce x 1)",
                TopLevel(vec![(LoadNumber, 0), (Defonce, 0), (Halt, 0)]),
            ),
            (
                "(set x 1)",
                TopLevel(vec![(LoadNumber, 0), (Set, 0), (Halt, 0)]),
            ),
            // Calls: callee first, arguments left to right
            (
                "(f 1 2)",
                TopLevel(vec![
                    (LoadSymbol, 0),
                    (LoadNumber, 0),
                    (LoadNumber, 1),
                    (FuncCall, 2),
                    (Pop, 0),
                    (Halt, 0),
                ]),
            ),
            (
                "(f)",
                TopLevel(vec![(LoadSymbol, 0), (FuncCall, 0), (Pop, 0), (Halt, 0)]),
            ),
            // The callee may be a nested expression
            (
                "((f) 1)",
                TopLevel(vec![
                    (LoadSymbol, 0),
                    (FuncCall, 0),
                    (LoadNumber, 0),
                    (FuncCall, 1),
                    (Pop, 0),
                    (Halt, 0),
                ]),
            ),
            // Anonymous functions load from the function table
            ("#1", TopLevel(vec![(LoadFunc, 0), (Pop, 0), (Halt, 0)])),
            // defun emits only the binding instruction at the call site
            ("(defun f [] 1)", TopLevel(vec![(Defun, 0), (Halt, 0)])),
            // Interning dedupes: the second 1 and the second x reuse slots
            (
                "(def x 1) (set x 1)",
                TopLevel(vec![
                    (LoadNumber, 0),
                    (Def, 0),
                    (LoadNumber, 0),
                    (Set, 0),
                    (Halt, 0),
                ]),
            ),
            // Failures
            ("(def 1 2)", Fail(CompileErrorKind::ExpectedSymbol)),
            ("(set \"x\" 2)", Fail(CompileErrorKind::ExpectedSymbol)),
            ("(defun 1 [] 1)", Fail(CompileErrorKind::ExpectedSymbol)),
            ("(defun f x)", Fail(CompileErrorKind::ExpectedParamList)),
            ("(defun f [a b 1)", Fail(CompileErrorKind::ExpectedParamList)),
            (
                "(defun f [a b c d e f g h i] 1)",
                Fail(CompileErrorKind::TooManyParams),
            ),
            ("()", Fail(CompileErrorKind::EmptyCall)),
            (")", Fail(CompileErrorKind::UnexpectedToken)),
            ("]", Fail(CompileErrorKind::UnexpectedToken)),
            ("(f", Fail(CompileErrorKind::UnexpectedEof)),
            ("(def x 1", Fail(CompileErrorKind::UnexpectedEof)),
            ("(def x 1 2)", Fail(CompileErrorKind::UnexpectedToken)),
            ("(defun f [] 1", Fail(CompileErrorKind::UnexpectedEof)),
        ];

        run_compile_tests(cases);
    }

    #[test]
    fn test_function_bodies() {
        // Parameters pop in reverse declaration order, the last body
        // form's Pop precedes Return (and is elided at run time).
        let script = compile("(defun f [a b] (+ a b))", "<test>").unwrap();
        assert_eq!(script.funcs.len(), 1);
        let func = &script.funcs[0];
        assert_eq!(func.name.as_ref(), "f");
        assert_eq!(func.params.len(), 2);

        let slot = |name: &str| {
            script
                .strings
                .iter()
                .position(|s| s.as_ref() == name)
                .unwrap() as u8
        };
        assert_eq!(
            decode(&func.code),
            vec![
                (Def, slot("b")),
                (Def, slot("a")),
                (LoadSymbol, slot("+")),
                (LoadSymbol, slot("a")),
                (LoadSymbol, slot("b")),
                (FuncCall, 2),
                (Pop, 0),
                (Return, 0),
            ]
        );
    }

    #[test]
    fn test_anonymous_function_body() {
        let script = compile("#(+ 1 2)", "<test>").unwrap();
        assert_eq!(script.funcs.len(), 1);
        let func = &script.funcs[0];
        assert_eq!(func.name.as_ref(), "#");
        assert!(func.params.is_empty());
        // A single expression and Return, no Pop
        assert_eq!(
            decode(&func.code),
            vec![
                (LoadSymbol, 0),
                (LoadNumber, 0),
                (LoadNumber, 1),
                (FuncCall, 2),
                (Return, 0),
            ]
        );
    }

    #[test]
    fn test_interning() {
        let script = compile("(def x 1) (def y 1) (def x 2) \"a\" \"a\"", "<test>").unwrap();
        assert_eq!(
            script.strings.iter().map(|s| s.as_ref()).collect::<Vec<_>>(),
            vec!["x", "y", "a"]
        );
        assert_eq!(script.numbers, vec![1.0, 2.0]);
    }

    #[test]
    fn test_number_pool_overflow() {
        // 257 distinct literals cannot fit one-byte indices
        let source: String = (0..257).map(|n| format!("{n} ")).collect();
        let err = compile(&source, "<test>").unwrap_err();
        let Error::CompileError(e) = err else {
            panic!("expected a compile error, got {err:?}");
        };
        assert_eq!(e.kind, CompileErrorKind::PoolOverflow);
    }

    #[test]
    fn test_disassemble() {
        let script = compile("(defun f [n] (+ n 1)) (println (f 2))", "demo.wisp").unwrap();
        let dump = script.disassemble();
        assert!(dump.contains("== script: demo.wisp =="));
        assert!(dump.contains("-- func 0: f (1 params) --"));
        assert!(dump.contains("-- top-level --"));
        assert!(dump.contains("FuncCall"));
        assert!(dump.contains("; println"));
        assert!(dump.contains("; 2.0000"));
        // Deterministic given the script
        assert_eq!(dump, script.disassemble());
    }
}
