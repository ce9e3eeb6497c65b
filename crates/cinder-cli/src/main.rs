//! Cinder command-line interface
//!
//! A thin shell around the runtime: with a path argument it runs the file,
//! without one it starts a REPL. Exit codes follow the BSD sysexits
//! convention (64 usage, 65 compile error, 70 runtime error, 74 I/O error);
//! a top-level `return` in a script supplies its own code.

use anyhow::Context;
use clap::Parser;
use cinder_runtime::{InterpretError, VM};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

const EX_USAGE: u8 = 64;
const EX_DATAERR: u8 = 65;
const EX_SOFTWARE: u8 = 70;
const EX_IOERR: u8 = 74;

/// The Cinder programming language
#[derive(Parser)]
#[command(name = "cinder", version, about)]
struct Cli {
    /// Script to run; omit to start a REPL
    script: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => {
            // --help and --version print to stdout and succeed; everything
            // else is a usage error
            let _ = error.print();
            if error.use_stderr() {
                return ExitCode::from(EX_USAGE);
            }
            return ExitCode::SUCCESS;
        }
    };

    match cli.script {
        Some(path) => run_file(&path),
        None => repl(),
    }
}

fn run_file(path: &Path) -> ExitCode {
    let source = match read_source(path) {
        Ok(source) => source,
        Err(error) => {
            report_error(&format!("{:#}", error));
            return ExitCode::from(EX_IOERR);
        }
    };

    let mut vm = VM::new();
    match vm.interpret(&source) {
        Ok(code) => ExitCode::from(code as u8),
        Err(InterpretError::Compile(errors)) => {
            for error in errors {
                report_error(&error.to_string());
            }
            ExitCode::from(EX_DATAERR)
        }
        Err(InterpretError::Runtime(error)) => {
            report_error(&error.to_string());
            ExitCode::from(EX_SOFTWARE)
        }
    }
}

fn read_source(path: &Path) -> anyhow::Result<String> {
    fs::read_to_string(path).with_context(|| format!("Could not read file <{}>", path.display()))
}

/// Line-at-a-time REPL on one persistent VM, so globals and interned
/// strings carry across inputs. Errors are reported and the loop continues.
fn repl() -> ExitCode {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(error) => {
            report_error(&format!("Could not start line editor: {}", error));
            return ExitCode::from(EX_IOERR);
        }
    };

    let mut vm = VM::new();
    loop {
        match editor.readline("> ") {
            Ok(line) => {
                let _ = editor.add_history_entry(line.as_str());
                match vm.interpret(&line) {
                    Ok(_) => {}
                    Err(InterpretError::Compile(errors)) => {
                        for error in errors {
                            report_error(&error.to_string());
                        }
                    }
                    Err(InterpretError::Runtime(error)) => report_error(&error.to_string()),
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => {
                println!();
                break;
            }
            Err(error) => {
                report_error(&format!("Could not read line: {}", error));
                return ExitCode::from(EX_IOERR);
            }
        }
    }

    ExitCode::SUCCESS
}

/// Print an error block to stderr, colored when attached to a terminal
fn report_error(message: &str) {
    let mut stderr = StandardStream::stderr(ColorChoice::Auto);
    let _ = stderr.set_color(ColorSpec::new().set_fg(Some(Color::Red)));
    let _ = writeln!(stderr, "{}", message);
    let _ = stderr.reset();
}
