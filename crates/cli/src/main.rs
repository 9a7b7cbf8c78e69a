mod cmd;
mod output;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cmd::{PatchArgs, cmd_patch};
use output::print_error;

/// imgpatch - patch vulnerable packages in container images
#[derive(Parser)]
#[command(name = "imgpatch")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Debug logging, plain progress output, and a retained working folder
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Patch an image from an update report, or upgrade every OS package
  Patch(PatchArgs),
}

fn main() {
  let cli = Cli::parse();

  let default_level = if cli.verbose { "debug" } else { "info" };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  let result = match cli.command {
    Commands::Patch(args) => cmd_patch(args, cli.verbose),
  };

  if let Err(err) = result {
    print_error(&format!("{:#}", err));
    std::process::exit(1);
  }
}
