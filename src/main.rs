use std::path::{Path, PathBuf};
use std::process::ExitCode;

use bytevm::code::decode::{Decoder, StandardDecoder};
use bytevm::code::{Code, Constant};
use bytevm::loader::{read_code, run_file, FsLoader};
use bytevm::vm::{ExecutionError, Vm};
use bytevm::Error;
use clap::Parser;
use tracing::Level;

/// Runs a program stored as a serialized code object.
#[derive(Parser, Debug)]
#[command(name = "bytevm", version, about, long_about = None)]
struct Options {
    /// Log every executed instruction.
    #[arg(long, conflicts_with = "debug")]
    trace: bool,

    /// Log frame entry and exit, imports and raised exceptions.
    #[arg(long)]
    debug: bool,

    /// Print the program's disassembly instead of running it.
    #[arg(long)]
    dis: bool,

    /// Stop with an error after executing this many instructions.
    #[arg(long, value_name = "N")]
    budget: Option<usize>,

    /// The program to run, an `.rsn` code object.
    program: PathBuf,
}

impl Options {
    fn level(&self) -> Option<Level> {
        if self.trace {
            Some(Level::TRACE)
        } else if self.debug {
            Some(Level::DEBUG)
        } else {
            None
        }
    }
}

fn main() -> ExitCode {
    // Usage errors exit with status 2.
    let options = Options::parse();
    if let Some(level) = options.level() {
        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(std::io::stderr)
            .init();
    }

    let program = options.program.as_path();
    if options.dis {
        return match read_code(program) {
            Ok(code) => {
                disassemble(&code, 0);
                ExitCode::SUCCESS
            }
            Err(err) => {
                eprintln!("error reading {}: {err}", program.display());
                ExitCode::from(2)
            }
        };
    }

    let mut vm = Vm::new().with_loader(FsLoader::new(module_root(program)));
    if let Some(budget) = options.budget {
        vm.increase_budget(budget);
    }
    match run_file(&mut vm, program) {
        Ok(result) => {
            if !result.is_none() {
                println!("{}", result.repr());
            }
            ExitCode::SUCCESS
        }
        Err(Error::Execution(ExecutionError::Exception(exception))) => {
            eprint!("{}", exception.format());
            ExitCode::FAILURE
        }
        Err(err) => {
            eprintln!("{err}");
            ExitCode::from(2)
        }
    }
}

fn module_root(program: &Path) -> PathBuf {
    program
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

fn disassemble(code: &Code, depth: usize) {
    let indent = "    ".repeat(depth);
    println!("{indent}Disassembly of {} ({}):", code.name, code.filename);
    let mut offset = 0;
    while offset < code.len() {
        match StandardDecoder.decode(code, offset) {
            Ok(instruction) => {
                let line = code
                    .line_for(instruction.offset)
                    .map(|line| line.to_string())
                    .unwrap_or_default();
                println!(
                    "{indent}{line:>4} {:>6} {:<24} {}",
                    instruction.offset,
                    instruction.opcode.name(),
                    instruction.operand
                );
                offset = instruction.next;
            }
            Err(err) => {
                println!("{indent}     {offset:>6} <{err}>");
                break;
            }
        }
    }
    for constant in &code.constants {
        if let Constant::Code(nested) = constant {
            println!();
            disassemble(nested, depth + 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::{CommandFactory, Parser};

    use super::Options;

    #[test]
    fn command_is_well_formed() {
        Options::command().debug_assert();
    }

    #[test]
    fn parses_flags() {
        let options =
            Options::try_parse_from(["bytevm", "--debug", "--budget", "50", "main.rsn"]).unwrap();
        assert_eq!(options.level(), Some(tracing::Level::DEBUG));
        assert_eq!(options.budget, Some(50));
        assert!(!options.dis);
        assert_eq!(options.program.to_str(), Some("main.rsn"));
    }

    #[test]
    fn usage_errors_exit_with_status_2() {
        for args in [
            &["bytevm"][..],
            &["bytevm", "--trace", "--debug", "main.rsn"],
            &["bytevm", "--budget", "lots", "main.rsn"],
            &["bytevm", "--verbose", "main.rsn"],
        ] {
            let err = Options::try_parse_from(args).unwrap_err();
            assert_eq!(err.exit_code(), 2, "{args:?}");
        }
    }
}
