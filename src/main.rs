//! CLI driver: `dynalox` with no arguments starts a REPL, `dynalox <path>`
//! runs a script file once. Exit codes follow clox's convention: 0 ok, 64
//! usage, 65 compile error, 70 runtime error, 74 file I/O error.

mod call_frame;
mod chunk;
mod compiler;
mod debug;
mod gc;
mod memory;
mod natives;
mod object;
mod scanner;
mod table;
mod value;
mod vm;

use std::io::{self, Write};
use std::process::ExitCode;

use vm::{InterpretResult, Vm};

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    match args.len() {
        1 => run_repl(),
        2 => run_file(&args[1]),
        _ => {
            eprintln!("Usage: dynalox [path]");
            ExitCode::from(64)
        }
    }
}

fn run_repl() -> ExitCode {
    let mut vm = Vm::new();
    let stdin = io::stdin();
    let mut line = String::new();

    loop {
        print!("> ");
        if io::stdout().flush().is_err() {
            return ExitCode::from(74);
        }

        line.clear();
        if read_line_with_continuations(&stdin, &mut line) == 0 {
            return ExitCode::SUCCESS;
        }
        if line.trim().is_empty() {
            return ExitCode::SUCCESS;
        }

        vm.interpret(&line);
    }
}

/// Reads one logical REPL line, joining physical lines ending in `\` before
/// the newline. Returns the number of physical lines consumed (0 at EOF).
fn read_line_with_continuations(stdin: &io::Stdin, buf: &mut String) -> usize {
    let mut physical_lines = 0;
    loop {
        let mut chunk = String::new();
        let bytes_read = match stdin.read_line(&mut chunk) {
            Ok(n) => n,
            Err(_) => return physical_lines,
        };
        if bytes_read == 0 {
            return physical_lines;
        }
        physical_lines += 1;

        let trimmed = chunk.trim_end_matches(['\n', '\r']);
        if let Some(continued) = trimmed.strip_suffix('\\') {
            buf.push_str(continued);
            buf.push('\n');
            continue;
        }
        buf.push_str(trimmed);
        return physical_lines;
    }
}

fn run_file(path: &str) -> ExitCode {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Can't open file \"{path}\": {err}");
            return ExitCode::from(74);
        }
    };

    let mut vm = Vm::new();
    match vm.interpret(&source) {
        InterpretResult::Ok => ExitCode::SUCCESS,
        InterpretResult::CompileError => ExitCode::from(65),
        InterpretResult::RuntimeError => ExitCode::from(70),
    }
}
