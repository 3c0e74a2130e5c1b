//! Command-line front end: parse, load, compile and print one SQL
//! statement, matching `ParseCompileTest`'s `main()`
//! (`examples/original_source/parser-and-compiler/ParseCompileTest.cpp`) —
//! no record execution, just a pipeline smoke test with a human-readable
//! disassembly on success.

use aggql::{report, InterningCatalog, Prepare};
use clap::Parser;

#[derive(Debug, Parser)]
#[command(version, about = "Compile a restricted-SQL GROUP BY query to bytecode")]
struct Cli {
    /// The SQL query to parse, load and compile, e.g.
    /// "select count(a), sum(b) from t group by a"
    query: String,
}

fn main() {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let mut prepare = Prepare::new(cli.query.clone(), InterningCatalog::new());

    if let Err(e) = prepare.parse() {
        eprintln!("Failed to parse.");
        print_diagnostic(&cli.query, &prepare, &e);
        std::process::exit(1);
    }
    if let Err(e) = prepare.load() {
        eprintln!("Failed to load.");
        print_diagnostic(&cli.query, &prepare, &e);
        std::process::exit(1);
    }
    if let Err(e) = prepare.compile() {
        eprintln!("Failed to compile.");
        print_diagnostic(&cli.query, &prepare, &e);
        std::process::exit(1);
    }
    match prepare.print() {
        Ok(rendered) => print!("{rendered}"),
        Err(e) => {
            eprintln!("Failed to print.");
            print_diagnostic(&cli.query, &prepare, &e);
            std::process::exit(1);
        }
    }
}

/// Stage failures are diagnosed to stderr (spec §6.4); only the successful
/// disassembly goes to stdout.
fn print_diagnostic(query: &str, prepare: &Prepare<InterningCatalog>, err: &aggql::PrepareError) {
    let restored = prepare.restored_source();
    let source = match restored {
        Some(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        None => query.to_string(),
    };
    eprint!("{}", report(&source, err));
}
