//! Opal command-line driver
//!
//! Compiles and runs an Opal program (the default), or dumps pipeline
//! intermediates: the AST at various stages, the symbol table, the
//! control-flow graph in DOT, or the entry point's machine code.
//!
//! Exit code 0 on success, 1 on any analysis or load error.

use clap::{Parser, ValueEnum};
use opal_engine::{CompilerOptions, EngineError, RuntimeAction, RuntimeImage};
use std::path::PathBuf;
use std::process::ExitCode;
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PrintStage {
    /// AST right after parsing
    Parse,
    /// AST after name analysis but before type analysis
    Named,
    /// AST after type analysis
    Typed,
    /// AST after all semantic analyses
    Semantic,
    /// Symbol table with user-defined symbols
    Symtab,
    /// Full symbol table, including built-in symbols
    SymtabAll,
    /// Control-flow graph in DOT format
    Cfg,
    /// Machine code for the main entry point
    Asm,
}

impl PrintStage {
    fn action(self) -> RuntimeAction {
        match self {
            PrintStage::Parse => RuntimeAction::Parse,
            PrintStage::Named => RuntimeAction::NameAnalysis,
            PrintStage::Typed => RuntimeAction::TypeAnalysis,
            PrintStage::Semantic | PrintStage::Symtab | PrintStage::SymtabAll | PrintStage::Cfg => {
                RuntimeAction::SemanticAnalysis
            }
            PrintStage::Asm => RuntimeAction::Compile,
        }
    }
}

#[derive(Parser)]
#[command(name = "opal")]
#[command(about = "Opal language driver: whole-program baseline JIT")]
#[command(version)]
struct Cli {
    /// Source file to compile
    file: PathBuf,

    /// Execute the program (the default action)
    #[arg(short = 'x', long)]
    execute: bool,

    /// Dump a pipeline intermediate instead of executing
    #[arg(short, long, value_enum, value_name = "STAGE")]
    print: Option<PrintStage>,

    /// Do not generate bounds-checking code for array accesses
    #[arg(long)]
    no_bounds_checks: bool,

    /// Change the type of array elements to `int`
    #[arg(long)]
    int_arrays: bool,

    /// Print informative messages during runtime compilation
    #[arg(long)]
    debug_dyncomp: bool,

    /// Heap size in bytes
    #[arg(long, value_name = "BYTES")]
    heap_size: Option<usize>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let source = match std::fs::read_to_string(&cli.file) {
        Ok(source) => source,
        Err(e) => {
            report_error(&format!("cannot read {}: {}", cli.file.display(), e));
            return ExitCode::from(1);
        }
    };

    let mut options = CompilerOptions {
        no_bounds_checks: cli.no_bounds_checks,
        debug_dynamic_compilation: cli.debug_dyncomp,
        ..CompilerOptions::default()
    };
    if cli.int_arrays {
        options = options.with_int_arrays();
    }
    if let Some(heap_size) = cli.heap_size {
        options.heap_size = heap_size;
    }

    let action = cli
        .print
        .map(PrintStage::action)
        .unwrap_or(RuntimeAction::Compile);

    let mut image = match RuntimeImage::prepare_with_action(&source, options, action) {
        Ok(image) => image,
        Err(EngineError::Parse { line, message }) => {
            report_error(&format!("[line {}] parse error: {}", line, message));
            return ExitCode::from(1);
        }
        Err(e) => {
            report_error(&e.to_string());
            return ExitCode::from(1);
        }
    };

    match cli.print {
        Some(PrintStage::Parse) | Some(PrintStage::Named) | Some(PrintStage::Typed)
        | Some(PrintStage::Semantic) => print!("{}", image.dump_ast()),
        Some(PrintStage::Symtab) => print!("{}", image.dump_symtab(false)),
        Some(PrintStage::SymtabAll) => print!("{}", image.dump_symtab(true)),
        Some(PrintStage::Cfg) => print!("{}", image.dump_cfg()),
        Some(PrintStage::Asm) => print!("{}", image.dump_code()),
        None => image.execute(),
    }

    ExitCode::SUCCESS
}

fn report_error(message: &str) {
    use std::io::Write;
    let mut stderr = StandardStream::stderr(ColorChoice::Auto);
    let _ = stderr.set_color(ColorSpec::new().set_fg(Some(Color::Red)).set_bold(true));
    let _ = write!(stderr, "error");
    let _ = stderr.reset();
    let _ = writeln!(stderr, ": {}", message);
}
