mod cmd;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cmd::{BuildArgs, cmd_build, cmd_export, cmd_gc, cmd_info, cmd_inspect, cmd_tags};
use output::OutputFormat;

/// stratum - layered filesystem image builder
#[derive(Parser)]
#[command(name = "stratum")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Layer store directory (default: $STRATUM_STORE or the user cache dir)
  #[arg(long, global = true, value_name = "DIR")]
  store: Option<PathBuf>,

  /// Increase log verbosity (-v info, -vv debug)
  #[arg(short, long, global = true, action = clap::ArgAction::Count)]
  verbose: u8,

  /// Output format
  #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Text)]
  output: OutputFormat,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Build an image from a recipe file
  Build {
    /// Path to the recipe file
    #[arg(default_value = "Stratumfile")]
    file: PathBuf,

    /// Build argument override, may be repeated
    #[arg(long = "build-arg", value_name = "NAME=VALUE")]
    build_args: Vec<String>,

    /// Directory COPY sources are read from (default: the recipe's directory)
    #[arg(long, value_name = "DIR")]
    context: Option<PathBuf>,

    /// Tag the resulting image
    #[arg(short, long)]
    tag: Option<String>,

    /// Fail on references to undefined variables (default)
    #[arg(long, conflicts_with = "lenient_refs")]
    strict_refs: bool,

    /// Expand references to undefined variables to the empty string
    #[arg(long)]
    lenient_refs: bool,

    /// Warn about build arguments no ARG declares instead of failing
    #[arg(long)]
    ignore_unused_args: bool,

    /// Kill RUN commands that take longer than this (e.g. "90s", "10m")
    #[arg(long, value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,

    /// Run commands on the host with only the working directory mapped
    /// into the image, instead of chrooted into the image filesystem
    #[arg(long)]
    host: bool,

    /// Shell used for RUN commands (default: /bin/sh)
    #[arg(long)]
    shell: Option<String>,

    /// Trust cached layers without re-hashing their content
    #[arg(long)]
    no_verify: bool,
  },

  /// Show an image's manifest
  Inspect {
    /// Tag, manifest id, or unique id prefix
    image: String,

    /// Print only the image environment as KEY=value lines
    #[arg(long)]
    env: bool,
  },

  /// Write an image's filesystem to a .tar.gz archive
  Export {
    /// Tag, manifest id, or unique id prefix
    image: String,

    /// Destination archive path
    output_file: PathBuf,
  },

  /// List tagged images
  Tags,

  /// Remove layers and manifests no tag refers to
  Gc {
    /// Show what would be removed without deleting anything
    #[arg(long)]
    dry_run: bool,
  },

  /// Show store locations and contents
  Info,
}

fn init_tracing(verbose: u8) {
  let default = match verbose {
    0 => "warn",
    1 => "info",
    _ => "debug",
  };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();
}

fn main() -> ExitCode {
  let cli = Cli::parse();
  init_tracing(cli.verbose);

  let store = cli.store.unwrap_or_else(stratum_lib::platform::paths::store_dir);
  let format = cli.output;

  let result = match cli.command {
    Commands::Build {
      file,
      build_args,
      context,
      tag,
      strict_refs: _,
      lenient_refs,
      ignore_unused_args,
      timeout,
      host,
      shell,
      no_verify,
    } => cmd_build(
      BuildArgs {
        file,
        build_args,
        context,
        tag,
        lenient_refs,
        ignore_unused_args,
        timeout,
        host,
        shell,
        no_verify,
      },
      &store,
      format,
    ),
    Commands::Inspect { image, env } => cmd_inspect(&image, env, &store, format).map(|_| ExitCode::SUCCESS),
    Commands::Export { image, output_file } => {
      cmd_export(&image, &output_file, &store, format).map(|_| ExitCode::SUCCESS)
    }
    Commands::Tags => cmd_tags(&store, format).map(|_| ExitCode::SUCCESS),
    Commands::Gc { dry_run } => cmd_gc(dry_run, &store, format).map(|_| ExitCode::SUCCESS),
    Commands::Info => cmd_info(&store, format).map(|_| ExitCode::SUCCESS),
  };

  match result {
    Ok(code) => code,
    Err(err) => {
      output::failed(&format!("{:#}", err));
      ExitCode::FAILURE
    }
  }
}
