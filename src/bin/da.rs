//! The `da` command: compile and run da-lang source files.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser as ClapParser;

use da_compiler::Compiler;
use da_frontend::{Lexer, Parser};
use da_vm::Vm;

/// Compile and run da-lang code.
#[derive(ClapParser)]
#[command(name = "da", version, about)]
struct Args {
    /// Print verbose output: tokens, AST and bytecode.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Don't print any compile output (opposite of -v).
    #[arg(short = 's', long = "silent")]
    silent: bool,

    /// Print the tokens output.
    #[arg(short = 'l', long = "lex")]
    lex: bool,

    /// Print the AST output.
    #[arg(short = 'p', long = "parse")]
    parse: bool,

    /// Print the bytecode output.
    #[arg(short = 'c', long = "compile")]
    compile: bool,

    /// Interpret the code unless ENABLED is "0" or "disable".
    #[arg(short = 'r', long = "run", value_name = "ENABLED", default_value = "enable")]
    run: String,

    /// Output the bytecode as FILE for later execution [to-be-supported].
    #[arg(short = 'o', long = "output", value_name = "FILE")]
    output: Option<PathBuf>,

    /// The source file (*.da).
    file: PathBuf,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let file = args.file.display().to_string();
    let source = std::fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read {file}"))?;

    let show_tokens = !args.silent && (args.lex || args.verbose);
    let show_ast = !args.silent && (args.parse || args.verbose);
    let show_bytecode = !args.silent && (args.compile || args.verbose);

    if show_tokens {
        println!("--------------------");
        println!("------ tokens ------");
        for token in Lexer::new(&file, &source).lex_all()? {
            println!("{token}");
        }
    }

    let module = Parser::new(&file, &source)?.parse_module()?;
    if show_ast {
        println!("--------------------");
        println!("------- AST --------");
        print!("{}", module.dump());
    }

    let program = Compiler::new(&module, &file).compile()?;
    if show_bytecode {
        print!("{}", da_compiler::dump(&program));
    }

    if let Some(output) = &args.output {
        log::warn!("-o {} is reserved and not supported yet", output.display());
    }

    let run = !matches!(args.run.as_str(), "0" | "disable");
    if run {
        let mut vm = Vm::new(program)?;
        vm.run()?;
    }
    Ok(())
}
