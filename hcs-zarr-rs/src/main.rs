use clap::{Parser, Subcommand};
use std::io::{self, Write};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hcs_zarr::{commands, convert};

#[derive(Parser)]
#[command(
    name = "hcs-zarr",
    about = "hcs-zarr CLI: convert, labels, import-table, resolve, replicate, register"
)]
struct Cli {
    /// Enable verbose logging (debug level)
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Convert(convert::ConvertArgs),
    Labels(commands::LabelsArgs),
    ImportTable(commands::ImportTableArgs),
    Resolve(commands::ResolveArgs),
    Replicate(commands::ReplicateArgs),
    Register(commands::RegisterArgs),
}

fn progress(prog: f64, msg: &str) {
    let _ = writeln!(
        io::stderr(),
        "{}",
        serde_json::json!({"progress": prog, "message": msg})
    );
    let _ = io::stderr().flush();
}

fn init_logging(verbose: bool) {
    let env_filter = if verbose { "hcs_zarr=debug" } else { "hcs_zarr=info" };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| env_filter.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match cli.command {
        Commands::Convert(args) => {
            convert::run(args, progress)?;
        }
        Commands::Labels(args) => commands::run_labels(args, progress)?,
        Commands::ImportTable(args) => commands::run_import_table(args, progress)?,
        Commands::Resolve(args) => commands::run_resolve(args)?,
        Commands::Replicate(args) => commands::run_replicate(args, progress)?,
        Commands::Register(args) => commands::run_register(args, progress)?,
    }
    Ok(())
}
