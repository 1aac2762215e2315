//! The bundled command-line host: assemble a file for the selected
//! architecture, load it, and run it to completion.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use menagerie::arch;
use menagerie::err::Error;
use menagerie::sim;

#[derive(Parser)]
#[command(
    name = "menagerie",
    version,
    about = "A multi-architecture assembler and emulator for teaching small CPU designs"
)]
struct Args {
    /// Architecture to emulate.
    #[arg(short, long, default_value = "riscv")]
    arch: String,

    /// List the supported architectures and exit.
    #[arg(short, long)]
    list_archs: bool,

    /// The assembly file to run.
    file: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    if args.list_archs {
        println!("Currently supported architectures:");
        for (name, description) in arch::listing() {
            println!("  {name:<8} - {description}");
        }
        return ExitCode::SUCCESS;
    }

    let Some(mut machine) = arch::select(&args.arch) else {
        eprintln!("unknown architecture: {}", args.arch);
        eprintln!("use --list-archs to see the supported ones");
        return ExitCode::FAILURE;
    };

    let Some(file) = args.file else {
        eprintln!("no assembly file supplied");
        return ExitCode::FAILURE;
    };

    let (image, _symbols) = match machine.assemble(&file) {
        Ok(assembled) => assembled,
        Err(e) => return report(&e),
    };

    if let Err(e) = machine.load_program(&image) {
        eprintln!("error loading assembled program: {e}");
        return ExitCode::FAILURE;
    }

    match sim::run(machine.as_mut()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => report(&e),
    }
}

fn report(err: &dyn Error) -> ExitCode {
    eprintln!("{err}");
    if let Some(help) = err.help() {
        eprintln!("help: {help}");
    }
    ExitCode::FAILURE
}
