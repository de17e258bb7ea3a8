//! Dataflow graph tools CLI.
//!
//! Provides the `dflow` binary. Programs are JSON files holding a list of
//! graphs, each a list of editor blocks (`{"op": ..., "args": [...],
//! "inputs": [...]}`); graph 0 is the entry graph. Subcommands:
//! `check` assembles and scope-resolves without evaluating, `run` evaluates
//! the program, `emit` prints the linearized block program.
//!
//! `run` goes through the same `preview` pipeline an editor embeds, so both
//! entry points report identical diagnostics.

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use dflow_core::assemble::{assemble_circuit, BlockDesc};
use dflow_compile::{linearize, resolve};
use dflow_eval::{preview, Value};

/// Dataflow graph compiler and evaluator.
#[derive(Parser)]
#[command(name = "dflow", about = "Dataflow graph tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Assemble and scope-resolve a program without running it.
    Check {
        /// Path to the program JSON file.
        program: PathBuf,
    },
    /// Evaluate a program and print its result as JSON.
    Run {
        /// Path to the program JSON file.
        program: PathBuf,

        /// External input values, as JSON literals.
        #[arg(short, long)]
        input: Vec<String>,
    },
    /// Print the linearized block program for the entry graph.
    Emit {
        /// Path to the program JSON file.
        program: PathBuf,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Check { program } => run_check(&program),
        Commands::Run { program, input } => run_eval(&program, &input),
        Commands::Emit { program } => run_emit(&program),
    };
    process::exit(code);
}

/// Loads a program file: a JSON array of graphs, each an array of blocks.
fn load_program(path: &PathBuf) -> Result<Vec<Vec<BlockDesc>>, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read '{}': {e}", path.display()))?;
    serde_json::from_str(&text).map_err(|e| format!("bad program file: {e}"))
}

/// Exit codes: 0 = ok, 1 = diagnostics reported, 3 = I/O or format error.
fn run_check(path: &PathBuf) -> i32 {
    let graphs = match load_program(path) {
        Ok(g) => g,
        Err(msg) => {
            eprintln!("Error: {msg}");
            return 3;
        }
    };
    let circuit = match assemble_circuit(&graphs) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            return 1;
        }
    };
    let mut failed = false;
    for idx in 0..circuit.graph_count() {
        let graph = match circuit.graph(dflow_core::id::GraphId(idx as u32)) {
            Ok(g) => g,
            Err(e) => {
                eprintln!("{e}");
                failed = true;
                continue;
            }
        };
        if let Err(e) = resolve(graph) {
            eprintln!("graph {idx}: {e}");
            failed = true;
        }
    }
    if failed {
        1
    } else {
        println!("ok: {} graph(s)", circuit.graph_count());
        0
    }
}

fn parse_inputs(raw: &[String]) -> Result<Vec<Value>, String> {
    raw.iter()
        .map(|s| serde_json::from_str::<Value>(s).map_err(|e| format!("bad input '{s}': {e}")))
        .collect()
}

fn run_eval(path: &PathBuf, raw_inputs: &[String]) -> i32 {
    let graphs = match load_program(path) {
        Ok(g) => g,
        Err(msg) => {
            eprintln!("Error: {msg}");
            return 3;
        }
    };
    let inputs = match parse_inputs(raw_inputs) {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("Error: {msg}");
            return 3;
        }
    };

    let outcome = preview(&graphs, &inputs);
    for d in &outcome.diagnostics {
        eprintln!("{:?}: {} ({})", d.kind, d.message, d.at);
    }
    match outcome.result {
        Some(v) => {
            let json = serde_json::to_string_pretty(&v)
                .unwrap_or_else(|e| format!("{{\"error\": \"failed to serialize result: {e}\"}}"));
            println!("{json}");
            if outcome.diagnostics.is_empty() {
                0
            } else {
                1
            }
        }
        None => 1,
    }
}

fn run_emit(path: &PathBuf) -> i32 {
    let graphs = match load_program(path) {
        Ok(g) => g,
        Err(msg) => {
            eprintln!("Error: {msg}");
            return 3;
        }
    };
    let circuit = match assemble_circuit(&graphs) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            return 1;
        }
    };
    let res = match resolve(circuit.root()) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("{e}");
            return 1;
        }
    };
    let program = match linearize(circuit.root(), &res) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("{e}");
            return 1;
        }
    };
    match serde_json::to_string_pretty(&program) {
        Ok(json) => {
            println!("{json}");
            0
        }
        Err(e) => {
            eprintln!("Error: failed to serialize program: {e}");
            3
        }
    }
}
