use std::env;
use std::fs;
use std::process::ExitCode;

use wisp::vm::Vm;
use wisp::{Error, compile};

fn main() -> ExitCode {
    let Some(filename) = env::args().nth(1) else {
        eprintln!("error: usage: wisp <script>");
        return ExitCode::FAILURE;
    };

    let source = match fs::read_to_string(&filename) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("error: {filename}: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run(&source, &filename) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(source: &str, filename: &str) -> Result<(), Error> {
    let script = compile(source, filename)?;
    print!("{}", script.disassemble());

    let mut vm = Vm::new();
    vm.execute(&script)
}
