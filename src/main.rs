use std::io::{self, Write};
use std::process::ExitCode;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mipsvm::loader;
use mipsvm::registers::RegisterFile;
use mipsvm::vm::{Stop, Vm};

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let base_name = match std::env::args().nth(1) {
        Some(arg) => arg,
        None => {
            print!("Enter program name: ");
            let _ = io::stdout().flush();
            let mut line = String::new();
            if io::stdin().read_line(&mut line).is_err() {
                return ExitCode::FAILURE;
            }
            line.trim().to_string()
        }
    };

    match run(&base_name) {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(%err, "initialization failed");
            ExitCode::FAILURE
        }
    }
}

fn run(base_name: &str) -> anyhow::Result<ExitCode> {
    let segments = loader::load(base_name)?;

    let mut regs = RegisterFile::new();
    regs.pc = segments.text.base;
    regs.gpr[mipsvm::instruction::reg::SP] = mipsvm::segment::STACK_TOP - 3;

    let mut vm = Vm::new(segments, regs);
    match vm.run() {
        Stop::Exit { status } => Ok(exit_code(status)),
        Stop::RanOffEnd => Ok(ExitCode::SUCCESS),
        Stop::Fatal(err) => {
            tracing::error!(%err, "interpreter aborted");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn exit_code(status: i32) -> ExitCode {
    ExitCode::from((status & 0xFF) as u8)
}
