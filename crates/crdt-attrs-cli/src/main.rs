use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use crdt_attrs::{Layout, ParseLayoutError};
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod workload;

use config::{BenchConfig, Overrides};

/// crdt-attrs: benchmark and inspect replicated attribute lists.
///
/// Compares attribute layouts by encoded size and timing, measures what
/// compaction saves, and dumps exported updates.
#[derive(Parser)]
#[command(name = "crdt-attrs", version, about, long_about = None)]
struct Cli {
    /// Log debug output from the library.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// TOML file with defaults for elements, updates, layouts and seed.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Hydrate and update a document once per layout, reporting sizes and timings.
    Schema {
        /// Number of elements to create.
        #[arg(long)]
        elements: Option<usize>,

        /// Rounds of width/height updates applied to every element.
        #[arg(long)]
        updates: Option<usize>,

        /// Layout to benchmark. Repeat for several; defaults to all.
        #[arg(long = "layout", value_parser = parse_layout)]
        layouts: Vec<Layout>,

        /// Seed for ids and values.
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Measure how much replacing every attribute list shrinks the document.
    Replace {
        /// Number of elements to create.
        #[arg(long)]
        elements: Option<usize>,

        /// Rounds of width/height updates applied before compaction.
        #[arg(long)]
        updates: Option<usize>,

        /// Seed for ids and values.
        #[arg(long)]
        seed: Option<u64>,

        /// Write the final update to this file.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Decode an exported update and print its contents.
    Inspect {
        /// Path to an update written by `replace --output`.
        file: PathBuf,

        /// Print the resolved document as JSON.
        #[arg(long)]
        json: bool,
    },
}

fn parse_layout(s: &str) -> Result<Layout, ParseLayoutError> {
    s.parse()
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = run(cli);
    if let Err(e) = result {
        eprintln!("error: {e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Schema {
            elements,
            updates,
            layouts,
            seed,
        } => {
            let config = BenchConfig::load(cli.config.as_deref())?.with_overrides(Overrides {
                elements,
                updates,
                layouts,
                seed,
            });
            commands::schema(&config)
        }
        Commands::Replace {
            elements,
            updates,
            seed,
            output,
        } => {
            let config = BenchConfig::load(cli.config.as_deref())?.with_overrides(Overrides {
                elements,
                updates,
                layouts: Vec::new(),
                seed,
            });
            commands::replace(&config, output.as_deref())
        }
        Commands::Inspect { file, json } => commands::inspect(&file, json),
    }
}
